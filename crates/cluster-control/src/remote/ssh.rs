//! SSH transport built on the system `ssh`, `scp` and `ssh-keygen` binaries.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandOutput, Connector, RemoteCommand, RemoteError, RemoteExecutable};
use crate::state::InstanceRecord;

/// Default SSH connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// SSH access to one host.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    user: String,
    identity: PathBuf,
    connect_timeout: u64,
}

impl SshTransport {
    /// Transport to `user@host` authenticating with `identity`.
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>, identity: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            identity: identity.into(),
            connect_timeout: CONNECT_TIMEOUT_SECS,
        }
    }

    /// `user@host`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` and `scp`. Instances are recreated on every
    /// `up`, so host keys are not pinned.
    fn options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.identity.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
        ]
    }

    /// Open an interactive session, optionally running `script` in it.
    /// Stdio is inherited from this process.
    ///
    /// # Errors
    /// Returns an error if `ssh` cannot be started.
    pub async fn interactive(&self, script: Option<&str>) -> Result<ExitStatus, RemoteError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options()).arg("-t").arg(self.destination());
        if let Some(script) = script {
            cmd.arg(script);
        }
        cmd.status().await.map_err(|source| RemoteError::Spawn {
            program: "ssh".to_string(),
            source,
        })
    }

    /// Copy a local file to the instance.
    ///
    /// # Errors
    /// Returns an error if `scp` fails.
    pub async fn copy_to(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let target = format!("{}:{remote}", self.destination());
        self.scp(local.display().to_string(), target).await
    }

    /// Copy a file from the instance.
    ///
    /// # Errors
    /// Returns an error if `scp` fails.
    pub async fn copy_from(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let source = format!("{}:{remote}", self.destination());
        self.scp(source, local.display().to_string()).await
    }

    async fn scp(&self, from: String, to: String) -> Result<(), RemoteError> {
        debug!(%from, %to, "scp");
        let output = Command::new("scp")
            .args(self.options())
            .arg("-q")
            .arg(from)
            .arg(to)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                program: "scp".to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl RemoteExecutable for SshTransport {
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        let script = command.render();
        debug!(host = %self.host, %script, "ssh");

        let mut cmd = Command::new("ssh");
        cmd.args(self.options())
            .args(["-o", "BatchMode=yes", "-T"])
            .arg(self.destination())
            .arg(&script)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RemoteError::Spawn {
            program: "ssh".to_string(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (command.stdin.clone(), child.stdin.take()) {
            let host = self.host.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    warn!(%host, error = %e, "Failed to write command input");
                }
            });
        }

        let output = match command.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RemoteError::Timeout(limit.as_secs()))?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| RemoteError::Spawn {
            program: "ssh".to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(RemoteError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

/// Connects to instances over SSH with the cluster key pair.
#[derive(Debug, Clone)]
pub struct SshConnector {
    user: String,
    identity: PathBuf,
}

impl SshConnector {
    /// Connector logging in as `user` with the private key at `identity`.
    #[must_use]
    pub fn new(user: impl Into<String>, identity: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            identity: identity.into(),
        }
    }

    /// Concrete transport, for the interactive helpers.
    ///
    /// # Errors
    /// Returns [`RemoteError::NoAddress`] if the instance has no public address.
    pub fn transport(&self, instance: &InstanceRecord) -> Result<SshTransport, RemoteError> {
        let host = instance
            .public_ip
            .as_ref()
            .ok_or_else(|| RemoteError::NoAddress(instance.name.clone()))?;
        Ok(SshTransport::new(host, &self.user, self.identity.clone()))
    }
}

impl Connector for SshConnector {
    fn connect(&self, instance: &InstanceRecord) -> Result<Box<dyn RemoteExecutable>, RemoteError> {
        Ok(Box::new(self.transport(instance)?))
    }
}

/// Generate an ed25519 key pair at `path` (`path.pub` for the public half)
/// and return the public key line.
///
/// # Errors
/// Returns an error if `ssh-keygen` fails or the public key cannot be read.
pub async fn generate_key(path: &Path, comment: &str) -> Result<String, RemoteError> {
    let public = path.with_extension("pub");
    for existing in [path, public.as_path()] {
        match tokio::fs::remove_file(existing).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(RemoteError::Spawn {
                    program: "ssh-keygen".to_string(),
                    source,
                })
            }
        }
    }

    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg(path)
        .output()
        .await
        .map_err(|source| RemoteError::Spawn {
            program: "ssh-keygen".to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(RemoteError::Failed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let key = tokio::fs::read_to_string(&public)
        .await
        .map_err(|source| RemoteError::Spawn {
            program: "ssh-keygen".to_string(),
            source,
        })?;
    Ok(key.trim().to_string())
}
