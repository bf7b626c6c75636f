//! Resource release for `down`.
//!
//! Resources are released in reverse allocation order. Every delete is
//! attempted even if an earlier one failed; a resource that is already gone
//! counts as released. Each released identifier is cleared from the state
//! file immediately, so a failed `down` can simply be run again.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, TeardownFailure};
use crate::github::{DeployKeyRegistry, GithubError};
use crate::provider::{Ec2, InstanceState, ProviderError};
use crate::state::{ClusterDir, ClusterState, NetworkState, Phase};
use crate::template::Timeouts;

/// Drives a cluster from any phase to `absent`.
pub struct Deprovisioner<'a> {
    ec2: &'a dyn Ec2,
    dir: &'a ClusterDir,
    deploy_keys: Option<&'a dyn DeployKeyRegistry>,
    timeouts: Timeouts,
}

/// Map a delete result: gone counts as released.
fn released<E: std::fmt::Display>(
    result: std::result::Result<(), E>,
    not_found: impl Fn(&E) -> bool,
    resource: &'static str,
    id: &str,
    failures: &mut Vec<TeardownFailure>,
) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if not_found(&e) => {
            debug!(resource, id, "Already deleted");
            true
        }
        Err(e) => {
            warn!(resource, id, error = %e, "Delete failed");
            failures.push(TeardownFailure {
                resource,
                id: id.to_string(),
                message: e.to_string(),
            });
            false
        }
    }
}

fn provider_released(
    result: std::result::Result<(), ProviderError>,
    resource: &'static str,
    id: &str,
    failures: &mut Vec<TeardownFailure>,
) -> bool {
    released(result, ProviderError::is_not_found, resource, id, failures)
}

impl<'a> Deprovisioner<'a> {
    /// Deprovisioner using the state in `dir`.
    #[must_use]
    pub fn new(ec2: &'a dyn Ec2, dir: &'a ClusterDir) -> Self {
        Self {
            ec2,
            dir,
            deploy_keys: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Registry used to revoke the deploy key.
    #[must_use]
    pub fn with_deploy_keys(mut self, registry: &'a dyn DeployKeyRegistry) -> Self {
        self.deploy_keys = Some(registry);
        self
    }

    /// Poll interval and termination timeout.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Release every recorded resource and remove the state file.
    ///
    /// Succeeds without any provider call when there is no state.
    ///
    /// # Errors
    /// Returns [`Error::Teardown`] listing every resource that could not be
    /// confirmed deleted; the remaining state is kept for a retry.
    pub async fn down(&self) -> Result<()> {
        let Some(mut state) = ClusterState::load(self.dir)? else {
            info!(dir = %self.dir.root().display(), "No cluster state, nothing to release");
            return Ok(());
        };

        state.set_phase(self.dir, Phase::Deprovisioning)?;
        info!(cluster = %state.name, "Releasing cluster resources");

        let mut failures = Vec::new();
        self.delete_deploy_key(&mut state, &mut failures).await?;
        self.terminate_instances(&mut state, &mut failures).await?;
        self.release_address(&mut state, &mut failures).await?;
        self.delete_key_pair(&mut state, &mut failures).await?;
        self.delete_security_group(&mut state, &mut failures).await?;
        self.delete_network(&mut state, &mut failures).await?;

        if !failures.is_empty() {
            return Err(Error::Teardown(failures));
        }

        ClusterState::remove(self.dir)?;
        info!(cluster = %state.name, "✅ All resources released");
        Ok(())
    }

    async fn delete_deploy_key(
        &self,
        state: &mut ClusterState,
        failures: &mut Vec<TeardownFailure>,
    ) -> Result<()> {
        let Some(key) = state.deploy_key.clone() else {
            return Ok(());
        };
        let id = key.key_id.to_string();

        let result = match self.deploy_keys {
            Some(registry) => registry.delete_key(&key.owner, &key.repo, key.key_id).await,
            None => Err(GithubError::MissingToken),
        };
        let not_found = |e: &GithubError| matches!(e, GithubError::NotFound(_));
        if released(result, not_found, "deploy key", &id, failures) {
            state.deploy_key = None;
            state.save(self.dir)?;
            let private = self.dir.deploy_key_file();
            ClusterDir::remove_file(&private.with_extension("pub"))?;
            ClusterDir::remove_file(&private)?;
        }
        Ok(())
    }

    async fn terminate_instances(
        &self,
        state: &mut ClusterState,
        failures: &mut Vec<TeardownFailure>,
    ) -> Result<()> {
        let mut terminating = Vec::new();
        for instance in state.instances.clone() {
            let result = self.ec2.terminate_instance(&instance.instance_id).await;
            match result {
                Ok(()) => {
                    info!(instance = %instance.name, instance_id = %instance.instance_id, "Terminating instance");
                    terminating.push(instance.instance_id);
                }
                other => {
                    if provider_released(other, "instance", &instance.instance_id, failures) {
                        state.instances.retain(|i| i.instance_id != instance.instance_id);
                        state.save(self.dir)?;
                    }
                }
            }
        }

        for instance_id in terminating {
            let result = self.wait_terminated(&instance_id).await;
            if provider_released(result, "instance", &instance_id, failures) {
                state.instances.retain(|i| i.instance_id != instance_id);
                state.save(self.dir)?;
            }
        }
        Ok(())
    }

    async fn wait_terminated(&self, instance_id: &str) -> std::result::Result<(), ProviderError> {
        let start = Instant::now();
        loop {
            let description = self.ec2.describe_instance(instance_id).await?;
            debug!(
                %instance_id,
                state = %description.state,
                elapsed_secs = start.elapsed().as_secs(),
                "Polling instance state"
            );
            if description.state == InstanceState::Terminated {
                info!(%instance_id, "Instance terminated");
                return Ok(());
            }
            if start.elapsed() >= self.timeouts.teardown() {
                return Err(ProviderError::Timeout {
                    what: format!("{instance_id} to terminate"),
                    secs: self.timeouts.teardown_secs,
                });
            }
            tokio::time::sleep(self.timeouts.poll_interval()).await;
        }
    }

    async fn release_address(
        &self,
        state: &mut ClusterState,
        failures: &mut Vec<TeardownFailure>,
    ) -> Result<()> {
        let Some(eip) = state.elastic_ip.clone() else {
            return Ok(());
        };

        if let Some(association_id) = &eip.association_id {
            let result = self.ec2.disassociate_address(association_id).await;
            if provider_released(result, "elastic ip association", association_id, failures) {
                if let Some(recorded) = state.elastic_ip.as_mut() {
                    recorded.association_id = None;
                }
                state.save(self.dir)?;
            }
        }

        let result = self.ec2.release_address(&eip.allocation_id).await;
        if provider_released(result, "elastic ip", &eip.allocation_id, failures) {
            info!(ip = %eip.public_ip, "Elastic IP released");
            state.elastic_ip = None;
            state.save(self.dir)?;
        }
        Ok(())
    }

    async fn delete_key_pair(
        &self,
        state: &mut ClusterState,
        failures: &mut Vec<TeardownFailure>,
    ) -> Result<()> {
        let Some(key_pair) = state.key_pair.clone() else {
            return Ok(());
        };
        let result = self.ec2.delete_key_pair(&key_pair.name).await;
        if provider_released(result, "key pair", &key_pair.name, failures) {
            state.key_pair = None;
            state.save(self.dir)?;
            ClusterDir::remove_file(&key_pair.private_key)?;
        }
        Ok(())
    }

    async fn delete_security_group(
        &self,
        state: &mut ClusterState,
        failures: &mut Vec<TeardownFailure>,
    ) -> Result<()> {
        let Some(group_id) = state.security_group_id.clone() else {
            return Ok(());
        };
        let result = self.ec2.delete_security_group(&group_id).await;
        if provider_released(result, "security group", &group_id, failures) {
            state.security_group_id = None;
            state.ingress_authorized = false;
            state.save(self.dir)?;
        }
        Ok(())
    }

    async fn delete_network(
        &self,
        state: &mut ClusterState,
        failures: &mut Vec<TeardownFailure>,
    ) -> Result<()> {
        let network = state.network.clone();

        if let Some(gateway_id) = &network.internet_gateway_id {
            if network.gateway_attached {
                let result = match &network.vpc_id {
                    Some(vpc_id) => self.ec2.detach_internet_gateway(gateway_id, vpc_id).await,
                    None => Ok(()),
                };
                if provider_released(result, "internet gateway attachment", gateway_id, failures) {
                    state.network.gateway_attached = false;
                    state.network.default_route = false;
                    state.save(self.dir)?;
                }
            }

            let result = self.ec2.delete_internet_gateway(gateway_id).await;
            if provider_released(result, "internet gateway", gateway_id, failures) {
                state.network.internet_gateway_id = None;
                state.network.gateway_attached = false;
                state.network.default_route = false;
                state.save(self.dir)?;
            }
        }

        if let Some(subnet_id) = &network.subnet_id {
            let result = self.ec2.delete_subnet(subnet_id).await;
            if provider_released(result, "subnet", subnet_id, failures) {
                state.network.subnet_id = None;
                state.save(self.dir)?;
            }
        }

        if let Some(vpc_id) = &network.vpc_id {
            let result = self.ec2.delete_vpc(vpc_id).await;
            if provider_released(result, "vpc", vpc_id, failures) {
                // The main route table and its routes go with the VPC.
                state.network = NetworkState {
                    internet_gateway_id: state.network.internet_gateway_id.take(),
                    ..NetworkState::default()
                };
                state.save(self.dir)?;
            }
        }
        Ok(())
    }
}
