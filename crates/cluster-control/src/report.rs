//! Per-instance results of a batch operation.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::remote::{Connector, RemoteCommand, RemoteError};
use crate::state::InstanceRecord;

/// Result of an operation on one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceOutcome {
    /// Position in the cluster.
    pub index: usize,
    /// Instance name.
    pub name: String,
    /// Provider instance id.
    pub instance_id: String,
    /// `Err` carries the failure message.
    pub result: std::result::Result<(), String>,
}

impl InstanceOutcome {
    /// Whether the operation succeeded on this instance.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of one operation across every instance, in instance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Operation name (`start`, `pull`, ...).
    pub operation: String,
    /// One entry per attempted instance.
    pub outcomes: Vec<InstanceOutcome>,
}

impl BatchReport {
    /// Empty report.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            outcomes: Vec::new(),
        }
    }

    /// Record the outcome for `instance`.
    pub fn record(
        &mut self,
        instance: &InstanceRecord,
        result: std::result::Result<(), RemoteError>,
    ) {
        match &result {
            Ok(()) => info!(
                operation = %self.operation,
                instance = %instance.name,
                "✅ Succeeded"
            ),
            Err(e) => warn!(
                operation = %self.operation,
                instance = %instance.name,
                error = %e,
                "❌ Failed"
            ),
        }
        self.outcomes.push(InstanceOutcome {
            index: instance.index,
            name: instance.name.clone(),
            instance_id: instance.instance_id.clone(),
            result: result.map_err(|e| e.to_string()),
        });
    }

    /// Whether every instance succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(InstanceOutcome::is_success)
    }

    /// Failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// `Ok` when every instance succeeded, otherwise
    /// [`Error::RemoteCommand`] with the failure count.
    ///
    /// # Errors
    /// Returns an error if any instance failed.
    pub fn ensure_success(&self) -> Result<()> {
        let failed = self.failures().count();
        if failed == 0 {
            return Ok(());
        }
        Err(Error::RemoteCommand {
            operation: self.operation.clone(),
            failed,
            total: self.outcomes.len(),
        })
    }
}

/// Run one command per instance, sequentially. A failure on one instance is
/// recorded and the next instance is still attempted.
pub async fn run_on_each(
    operation: &str,
    instances: &[InstanceRecord],
    connector: &dyn Connector,
    command: impl Fn(&InstanceRecord) -> RemoteCommand,
) -> BatchReport {
    let mut report = BatchReport::new(operation);
    for instance in instances {
        let result = match connector.connect(instance) {
            Ok(transport) => transport.run(&command(instance)).await.map(|_| ()),
            Err(e) => Err(e),
        };
        report.record(instance, result);
    }
    report
}
