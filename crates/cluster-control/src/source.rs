//! Updating and building the service source on every instance.

use tracing::info;

use crate::error::{Error, Result};
use crate::remote::{export_env, shell_quote, Connector, RemoteCommand};
use crate::report::{run_on_each, BatchReport};
use crate::state::{ClusterDir, ClusterState};
use crate::template::ClusterTemplate;

/// Runs `pull` and `build` in the checkout on each instance.
pub struct SourceUpdater<'a> {
    dir: &'a ClusterDir,
    template: &'a ClusterTemplate,
    connector: &'a dyn Connector,
}

impl<'a> SourceUpdater<'a> {
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

    /// Fast-forward the checkout to the tracked branch.
    ///
    /// # Errors
    /// Fails before touching any instance if the cluster is not active.
    pub async fn pull(&self) -> Result<BatchReport> {
        let state = ClusterState::load_active(self.dir, "pull")?;
        let command = self.pull_command();
        info!(branch = %self.template.service.repository.branch, "Pulling source");
        Ok(run_on_each("pull", &state.instances, self.connector, |_| command.clone()).await)
    }

    /// Run the build command. A failed build is not rolled back.
    ///
    /// # Errors
    /// Fails before touching any instance if the cluster is not active or the
    /// template has no build command.
    pub async fn build(&self) -> Result<BatchReport> {
        let state = ClusterState::load_active(self.dir, "build")?;
        let command = self.build_command()?;
        info!(command = %command.script, "Building");
        Ok(run_on_each("build", &state.instances, self.connector, |_| command.clone()).await)
    }

    fn pull_command(&self) -> RemoteCommand {
        let repository = &self.template.service.repository;
        let branch = shell_quote(&repository.branch);
        RemoteCommand::new(format!(
            "git fetch origin {branch} && git checkout {branch} && git merge --ff-only origin/{branch}"
        ))
        .in_dir(repository.checkout_dir())
        .with_timeout(self.template.timeouts.command())
    }

    fn build_command(&self) -> Result<RemoteCommand> {
        let service = &self.template.service;
        let build = service
            .build
            .as_deref()
            .ok_or_else(|| Error::Unsupported("the template has no service.build command".to_string()))?;
        Ok(
            RemoteCommand::new(format!("{}{build}", export_env(&service.environment)))
                .in_dir(service.run_dir())
                .with_timeout(self.template.timeouts.command()),
        )
    }
}
