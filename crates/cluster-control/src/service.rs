//! Starting and stopping the service on every instance.

use tracing::info;

use crate::error::Result;
use crate::remote::{Connector, RemoteCommand};
use crate::report::{run_on_each, BatchReport};
use crate::state::{ClusterDir, ClusterState, ServiceStatus};
use crate::template::ClusterTemplate;

/// Controls the systemd unit installed at bootstrap.
pub struct ServiceController<'a> {
    dir: &'a ClusterDir,
    template: &'a ClusterTemplate,
    connector: &'a dyn Connector,
}

impl<'a> ServiceController<'a> {
    #[must_use]
    pub fn new(
        dir: &'a ClusterDir,
        template: &'a ClusterTemplate,
        connector: &'a dyn Connector,
    ) -> Self {
        Self {
            dir,
            template,
            connector,
        }
    }

    /// Start the service on every instance.
    ///
    /// # Errors
    /// Fails before touching any instance if the cluster is not active.
    pub async fn start(&self) -> Result<BatchReport> {
        self.transition("start", ServiceStatus::Running).await
    }

    /// Stop the service on every instance.
    ///
    /// # Errors
    /// Fails before touching any instance if the cluster is not active.
    pub async fn stop(&self) -> Result<BatchReport> {
        self.transition("stop", ServiceStatus::Stopped).await
    }

    async fn transition(
        &self,
        operation: &'static str,
        target: ServiceStatus,
    ) -> Result<BatchReport> {
        let mut state = ClusterState::load_active(self.dir, operation)?;
        let unit = self.template.service.unit_name();
        info!(%unit, instances = state.instances.len(), "Service {operation}");

        let command = RemoteCommand::new(format!("sudo systemctl {operation} {unit}"))
            .with_timeout(self.template.timeouts.command());
        let report = run_on_each(operation, &state.instances, self.connector, |_| command.clone()).await;

        for outcome in &report.outcomes {
            if let Some(instance) = state.instances.iter_mut().find(|i| i.index == outcome.index) {
                instance.service = if outcome.is_success() {
                    target
                } else {
                    ServiceStatus::Unknown
                };
            }
        }
        state.save(self.dir)?;
        Ok(report)
    }
}

/// Script following the service journal.
#[must_use]
pub fn follow_logs_script(template: &ClusterTemplate) -> String {
    format!("sudo journalctl -f -u {}", template.service.unit_name())
}
