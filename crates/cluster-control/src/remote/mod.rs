//! Remote command execution on cluster instances.
//!
//! Operations that touch instances depend only on [`RemoteExecutable`]; the
//! [`Connector`] hands out one per instance record. [`ssh`] provides the
//! production transport.

pub mod ssh;

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::state::InstanceRecord;

pub use ssh::{SshConnector, SshTransport};

/// Errors from running a command on an instance.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The instance has no public address yet.
    #[error("instance {0} has no public address")]
    NoAddress(String),

    /// The transport could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command did not finish in time.
    #[error("command timed out after {0} seconds")]
    Timeout(u64),

    /// The command ran and exited non-zero.
    #[error("command exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
}

/// A shell script to run on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Script passed to the remote shell.
    pub script: String,
    /// Directory to run in.
    pub cwd: Option<String>,
    /// Bytes fed to the command's stdin.
    pub stdin: Option<Vec<u8>>,
    /// Upper bound on the run time.
    pub timeout: Option<Duration>,
}

impl RemoteCommand {
    /// Command running `script`.
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            cwd: None,
            stdin: None,
            timeout: None,
        }
    }

    /// Run in `dir`.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Feed `input` on stdin.
    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Fail after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Script as sent to the remote shell, including the directory change.
    #[must_use]
    pub fn render(&self) -> String {
        match &self.cwd {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), self.script),
            None => self.script.clone(),
        }
    }
}

/// Output of a command that exited zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Runs commands on one instance.
#[async_trait]
pub trait RemoteExecutable: Send + Sync {
    /// Run `command`; a non-zero exit is [`RemoteError::Failed`].
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, RemoteError>;
}

/// Builds a [`RemoteExecutable`] for an instance.
pub trait Connector: Send + Sync {
    /// Transport to `instance`.
    ///
    /// # Errors
    /// Returns [`RemoteError::NoAddress`] when the instance cannot be reached.
    fn connect(&self, instance: &InstanceRecord) -> Result<Box<dyn RemoteExecutable>, RemoteError>;
}

/// Quote `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// `export K=V; ...` prefix for an environment map.
#[must_use]
pub fn export_env<'a>(vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> String {
    let mut out = String::new();
    for (key, value) in vars {
        let _ = write!(out, "export {key}={}; ", shell_quote(value));
    }
    out
}
