//! Error types shared by the cluster operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::state::Phase;
use crate::template::TemplateError;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to the operator by a cluster operation.
#[derive(Error, Debug)]
pub enum Error {
    /// Template missing, unparseable, or invalid. Nothing was written.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// An allocation call failed. Everything created so far is recorded in
    /// the persisted state and must be released with `down`.
    #[error("failed to provision {resource}: {message} (partial state saved, run `down` to release it)")]
    Provisioning { resource: String, message: String },

    /// Resources that still exist after their delete call failed.
    #[error("teardown incomplete, {} resource(s) could not be released: {}", .0.len(), FailureList(.0))]
    Teardown(Vec<TeardownFailure>),

    /// A per-instance operation failed on at least one instance.
    #[error("{operation} failed on {failed} of {total} instance(s)")]
    RemoteCommand {
        operation: String,
        failed: usize,
        total: usize,
    },

    /// No state file: the cluster has not been brought up.
    #[error("cluster is not provisioned (no state in {}), run `up` first", .0.display())]
    NotProvisioned(PathBuf),

    /// The operation is not allowed in the current lifecycle phase.
    #[error("cannot {operation} while the cluster is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },

    /// `create` was asked to replace the template of a live cluster.
    #[error("a cluster is already provisioned in {}, run `down` before replacing its template", .0.display())]
    ClusterExists(PathBuf),

    /// The template has no value needed for this operation.
    #[error("{0}")]
    Unsupported(String),

    /// Reading or writing a file in the cluster directory failed.
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but cannot be parsed.
    #[error("corrupt state file {}: {source}", path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Build an [`Error::Io`] for a path.
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Build an [`Error::Provisioning`] from any displayable cause.
    pub fn provisioning(resource: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::Provisioning {
            resource: resource.into(),
            message: cause.to_string(),
        }
    }
}

/// A resource that could not be confirmed deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// Resource category (e.g. "instance", "security group").
    pub resource: &'static str,
    /// Provider-assigned identifier.
    pub id: String,
    /// Why the delete call failed.
    pub message: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.resource, self.id, self.message)
    }
}

struct FailureList<'a>(&'a [TeardownFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
