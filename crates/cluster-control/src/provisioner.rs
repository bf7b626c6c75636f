//! Resource allocation for `up`.
//!
//! Resources are created one at a time in dependency order. Each identifier
//! is written to the state file as soon as the create call returns, before
//! the next call is made. A failure stops `up` and leaves the partial state
//! in place for `down`; nothing is rolled back automatically.

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::github::DeployKeyRegistry;
use crate::provider::{cluster_tags, Ec2, InstanceState, LaunchRequest, ProviderError};
use crate::remote::ssh;
use crate::state::{
    ClusterDir, ClusterState, DeployKeyState, ElasticIpState, InstanceRecord, KeyPairState, Phase,
};
use crate::template::ClusterTemplate;

/// Drives a cluster from `absent` (or an interrupted `provisioning`) to `active`.
pub struct Provisioner<'a> {
    ec2: &'a dyn Ec2,
    dir: &'a ClusterDir,
    template: &'a ClusterTemplate,
    deploy_keys: Option<&'a dyn DeployKeyRegistry>,
}

impl<'a> Provisioner<'a> {
    /// Provisioner for `template`, keeping state in `dir`.
    #[must_use]
    pub fn new(ec2: &'a dyn Ec2, dir: &'a ClusterDir, template: &'a ClusterTemplate) -> Self {
        Self {
            ec2,
            dir,
            template,
            deploy_keys: None,
        }
    }

    /// Registry used when the template asks for a deploy key.
    #[must_use]
    pub fn with_deploy_keys(mut self, registry: &'a dyn DeployKeyRegistry) -> Self {
        self.deploy_keys = Some(registry);
        self
    }

    /// Allocate every resource the template describes.
    ///
    /// Resumes from a `provisioning` state, skipping recorded resources.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPhase`] while the cluster is being torn down and
    /// [`Error::Provisioning`] when an allocation fails.
    pub async fn up(&self) -> Result<ClusterState> {
        let mut state = match ClusterState::load(self.dir)? {
            None => {
                let mut state = ClusterState::new(self.template);
                state.save(self.dir)?;
                info!(cluster = %state.name, region = %state.region, "Provisioning new cluster");
                state
            }
            Some(state) if state.phase == Phase::Deprovisioning => {
                return Err(Error::InvalidPhase {
                    operation: "up",
                    phase: state.phase,
                });
            }
            Some(state) => {
                if state.name != self.template.name {
                    return Err(Error::Unsupported(format!(
                        "state in {} belongs to cluster '{}', not '{}'",
                        self.dir.root().display(),
                        state.name,
                        self.template.name
                    )));
                }
                info!(cluster = %state.name, phase = %state.phase, "Resuming provisioning");
                state
            }
        };

        self.create_deploy_key(&mut state).await?;
        self.create_network(&mut state).await?;
        self.create_security_group(&mut state).await?;
        self.create_key_pair(&mut state).await?;
        self.allocate_address(&mut state).await?;
        self.launch_instances(&mut state).await?;
        self.wait_for_instances(&mut state).await?;
        self.associate_address(&mut state).await?;

        state.set_phase(self.dir, Phase::Active)?;
        info!(
            cluster = %state.name,
            instances = state.instances.len(),
            "✅ Cluster resources ready"
        );
        Ok(state)
    }

    /// A change already made by an interrupted run counts as done.
    fn applied(
        result: std::result::Result<(), ProviderError>,
    ) -> std::result::Result<(), ProviderError> {
        match result {
            Err(e) if e.is_already_applied() => {
                debug!(error = %e, "Already applied");
                Ok(())
            }
            other => other,
        }
    }

    fn tags(&self, suffix: &str) -> Vec<crate::provider::Tag> {
        cluster_tags(&self.template.name, &self.template.resource_name(suffix))
    }

    async fn create_deploy_key(&self, state: &mut ClusterState) -> Result<()> {
        let Some(spec) = &self.template.service.repository.deploy_key else {
            return Ok(());
        };
        if state.deploy_key.is_some() {
            return Ok(());
        }
        let registry = self
            .deploy_keys
            .ok_or_else(|| Error::provisioning("deploy key", crate::github::GithubError::MissingToken))?;

        let title = format!("cluster-control {}", self.template.name);
        let public_key = ssh::generate_key(&self.dir.deploy_key_file(), &title)
            .await
            .map_err(|e| Error::provisioning("deploy key", e))?;
        let key_id = registry
            .add_key(&spec.owner, &spec.repo, &title, &public_key)
            .await
            .map_err(|e| Error::provisioning("deploy key", e))?;

        state.deploy_key = Some(DeployKeyState {
            owner: spec.owner.clone(),
            repo: spec.repo.clone(),
            key_id,
        });
        state.save(self.dir)
    }

    async fn create_network(&self, state: &mut ClusterState) -> Result<()> {
        let network = &self.template.network;

        let vpc_id = match &state.network.vpc_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .ec2
                    .create_vpc(&network.vpc_cidr, &self.tags("vpc"))
                    .await
                    .map_err(|e| Error::provisioning("vpc", e))?;
                state.network.vpc_id = Some(id.clone());
                state.save(self.dir)?;
                id
            }
        };

        if state.network.subnet_id.is_none() {
            let id = self
                .ec2
                .create_subnet(
                    &vpc_id,
                    &network.subnet_cidr,
                    network.availability_zone.as_deref(),
                    &self.tags("subnet"),
                )
                .await
                .map_err(|e| Error::provisioning("subnet", e))?;
            state.network.subnet_id = Some(id);
            state.save(self.dir)?;
        }
        if state.instances.len() < self.instance_count() {
            if let Some(subnet_id) = &state.network.subnet_id {
                self.ec2
                    .enable_public_ip_on_launch(subnet_id)
                    .await
                    .map_err(|e| Error::provisioning("subnet", e))?;
            }
        }

        let gateway_id = match &state.network.internet_gateway_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .ec2
                    .create_internet_gateway(&self.tags("igw"))
                    .await
                    .map_err(|e| Error::provisioning("internet gateway", e))?;
                state.network.internet_gateway_id = Some(id.clone());
                state.save(self.dir)?;
                id
            }
        };

        if !state.network.gateway_attached {
            Self::applied(self.ec2.attach_internet_gateway(&gateway_id, &vpc_id).await)
                .map_err(|e| Error::provisioning("internet gateway", e))?;
            state.network.gateway_attached = true;
            state.save(self.dir)?;
        }

        if !state.network.default_route {
            Self::applied(self.ec2.create_default_route(&vpc_id, &gateway_id).await)
                .map_err(|e| Error::provisioning("route", e))?;
            state.network.default_route = true;
            state.save(self.dir)?;
        }
        Ok(())
    }

    async fn create_security_group(&self, state: &mut ClusterState) -> Result<()> {
        let vpc_id = state.network.vpc_id.clone().unwrap_or_default();

        let group_id = match &state.security_group_id {
            Some(id) => id.clone(),
            None => {
                let name = self.template.resource_name("sg");
                let description = format!("cluster-control {}", self.template.name);
                let id = self
                    .ec2
                    .create_security_group(&vpc_id, &name, &description, &self.tags("sg"))
                    .await
                    .map_err(|e| Error::provisioning("security group", e))?;
                state.security_group_id = Some(id.clone());
                state.save(self.dir)?;
                id
            }
        };

        if !state.ingress_authorized {
            let rules = self.template.ingress_rules();
            Self::applied(self.ec2.authorize_ingress(&group_id, &rules).await)
                .map_err(|e| Error::provisioning("security group", e))?;
            state.ingress_authorized = true;
            state.save(self.dir)?;
            debug!(group_id = %group_id, rules = rules.len(), "Ingress authorized");
        }
        Ok(())
    }

    async fn create_key_pair(&self, state: &mut ClusterState) -> Result<()> {
        if state.key_pair.is_some() {
            return Ok(());
        }
        let name = self.template.key_pair_name();
        let created = self
            .ec2
            .create_key_pair(&name, &self.tags("key"))
            .await
            .map_err(|e| Error::provisioning("key pair", e))?;

        let private_key = self.dir.key_file(&name);
        state.key_pair = Some(KeyPairState {
            name,
            key_pair_id: created.id,
            private_key: private_key.clone(),
        });
        state.save(self.dir)?;

        self.dir.write_secret(&private_key, created.material.as_bytes())?;
        info!(path = %private_key.display(), "Private key saved");
        Ok(())
    }

    async fn allocate_address(&self, state: &mut ClusterState) -> Result<()> {
        if !self.template.instances.elastic_ip || state.elastic_ip.is_some() {
            return Ok(());
        }
        let address = self
            .ec2
            .allocate_address(&self.tags("eip"))
            .await
            .map_err(|e| Error::provisioning("elastic ip", e))?;
        state.elastic_ip = Some(ElasticIpState {
            allocation_id: address.allocation_id,
            public_ip: address.public_ip,
            association_id: None,
        });
        state.save(self.dir)
    }

    fn instance_count(&self) -> usize {
        self.template.instances.count as usize
    }

    async fn launch_instances(&self, state: &mut ClusterState) -> Result<()> {
        let spec = &self.template.instances;
        let subnet_id = state.network.subnet_id.clone().unwrap_or_default();
        let security_group_id = state.security_group_id.clone().unwrap_or_default();
        let key_name = state
            .key_pair
            .as_ref()
            .map(|k| k.name.clone())
            .unwrap_or_default();

        for index in state.instances.len()..self.instance_count() {
            let name = self.template.instance_name(index);
            let request = LaunchRequest {
                name: name.clone(),
                image: spec.image.clone(),
                instance_type: spec.instance_type.clone(),
                subnet_id: subnet_id.clone(),
                security_group_id: security_group_id.clone(),
                key_name: key_name.clone(),
                tags: cluster_tags(&self.template.name, &name),
            };

            let instance_id = self
                .ec2
                .run_instance(&request)
                .await
                .map_err(|e| Error::provisioning(format!("instance {name}"), e))?;

            state
                .instances
                .push(InstanceRecord::new(index, name, instance_id));
            state.save(self.dir)?;
        }
        Ok(())
    }

    async fn wait_for_instances(&self, state: &mut ClusterState) -> Result<()> {
        let timeouts = self.template.timeouts;

        for i in 0..state.instances.len() {
            if state.instances[i].ready {
                continue;
            }
            let instance_id = state.instances[i].instance_id.clone();
            let name = state.instances[i].name.clone();
            info!(instance = %name, %instance_id, "Waiting for instance to run");

            let start = Instant::now();
            let running = loop {
                match self.ec2.describe_instance(&instance_id).await {
                    Ok(description) => {
                        debug!(
                            %instance_id,
                            state = %description.state,
                            elapsed_secs = start.elapsed().as_secs(),
                            "Polling instance state"
                        );
                        match description.state {
                            InstanceState::Running => break description,
                            InstanceState::ShuttingDown | InstanceState::Terminated => {
                                return Err(Error::provisioning(
                                    format!("instance {name}"),
                                    format!("instance entered state {}", description.state),
                                ));
                            }
                            _ => {}
                        }
                    }
                    // DescribeInstances lags behind RunInstances.
                    Err(e) if e.is_not_found() => {
                        debug!(%instance_id, error = %e, "Instance not visible yet");
                    }
                    Err(e) => return Err(Error::provisioning(format!("instance {name}"), e)),
                }

                if start.elapsed() >= timeouts.instance_ready() {
                    return Err(Error::provisioning(
                        format!("instance {name}"),
                        ProviderError::Timeout {
                            what: format!("{instance_id} to run"),
                            secs: timeouts.instance_ready_secs,
                        },
                    ));
                }
                tokio::time::sleep(timeouts.poll_interval()).await;
            };

            let record = &mut state.instances[i];
            record.public_ip = running.public_ip;
            record.private_ip = running.private_ip;
            record.ready = true;
            info!(
                instance = %name,
                public_ip = record.public_ip.as_deref().unwrap_or("-"),
                "✅ Instance running"
            );
            state.save(self.dir)?;
        }
        Ok(())
    }

    async fn associate_address(&self, state: &mut ClusterState) -> Result<()> {
        let Some(first) = state.instances.first() else {
            return Ok(());
        };
        let instance_id = first.instance_id.clone();
        let Some(eip) = state.elastic_ip.as_mut() else {
            return Ok(());
        };
        if eip.association_id.is_some() {
            return Ok(());
        }

        let association_id = self
            .ec2
            .associate_address(&eip.allocation_id, &instance_id)
            .await
            .map_err(|e| Error::provisioning("elastic ip", e))?;
        eip.association_id = Some(association_id);
        info!(ip = %eip.public_ip, %instance_id, "Elastic IP associated");
        state.save(self.dir)
    }
}
