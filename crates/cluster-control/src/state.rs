//! Cluster state persistence.
//!
//! The state file records every identifier the provisioner allocated, so an
//! interrupted `up` or `down` can always be finished by running `down`
//! again. It is rewritten atomically after each mutation.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::template::{ClusterTemplate, TemplateError};

/// Files belonging to one cluster.
#[derive(Debug, Clone)]
pub struct ClusterDir {
    root: PathBuf,
}

impl ClusterDir {
    /// Cluster directory rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Materialized template written by `create`.
    #[must_use]
    pub fn template_file(&self) -> PathBuf {
        self.root.join("template.yaml")
    }

    /// Persisted [`ClusterState`].
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Private key of the EC2 key pair.
    #[must_use]
    pub fn key_file(&self, key_pair_name: &str) -> PathBuf {
        self.root.join(format!("{key_pair_name}.pem"))
    }

    /// Private half of the GitHub deploy key (`.pub` holds the public half).
    #[must_use]
    pub fn deploy_key_file(&self) -> PathBuf {
        self.root.join("deploy-key")
    }

    /// Load the template written by `create`.
    ///
    /// # Errors
    /// Returns a template error if `create` has not been run or the file is invalid.
    pub fn load_template(&self) -> Result<ClusterTemplate> {
        ClusterTemplate::load(&self.template_file()).map_err(Error::from)
    }

    /// Validate the template at `source` and store its materialized form.
    ///
    /// Nothing is written when the template is invalid.
    ///
    /// # Errors
    /// Returns [`Error::Template`] for a bad template and
    /// [`Error::ClusterExists`] while a state file exists.
    pub fn create(&self, source: &Path) -> Result<ClusterTemplate> {
        let template = ClusterTemplate::load(source)?;
        if self.state_file().exists() {
            return Err(Error::ClusterExists(self.root.clone()));
        }
        let materialized = template.materialize();
        self.write_template(&materialized)?;
        info!(cluster = %materialized.name, dir = %self.root.display(), "Cluster defined");
        Ok(materialized)
    }

    /// Write the materialized template.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_template(&self, template: &ClusterTemplate) -> Result<()> {
        let path = self.template_file();
        let yaml = template.to_yaml().map_err(|source| {
            Error::Template(TemplateError::Invalid(format!(
                "cannot serialize template: {source}"
            )))
        })?;
        self.write_atomic(&path, yaml.as_bytes(), None)
    }

    /// Write a file only the owner can read.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_secret(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.write_atomic(path, contents, Some(0o600))
    }

    /// Remove a file, treating a missing file as removed.
    ///
    /// # Errors
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove_file(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("remove", path, e)),
        }
    }

    /// Write through a temp file in the same directory, then rename over the
    /// target so readers never see a partial file.
    fn write_atomic(&self, path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| Error::io("create", &self.root, e))?;

        let mut tmp =
            NamedTempFile::new_in(&self.root).map_err(|e| Error::io("create temp file in", &self.root, e))?;
        tmp.write_all(contents)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::io("write", tmp.path().to_path_buf(), e))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
                .map_err(|e| Error::io("set permissions on", tmp.path().to_path_buf(), e))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        tmp.persist(path)
            .map_err(|e| Error::io("replace", path, e.error))?;
        Ok(())
    }
}

/// Lifecycle phase of a cluster with a state file. A missing file is the
/// `absent` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// `up` is allocating resources.
    Provisioning,
    /// All resources allocated and running.
    Active,
    /// `down` is releasing resources.
    Deprovisioning,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::Deprovisioning => write!(f, "deprovisioning"),
        }
    }
}

/// Last known status of the application process on an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Service not installed yet, or the last start/stop failed.
    #[default]
    Unknown,
    /// Service installed and stopped.
    Stopped,
    /// Service running.
    Running,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Network resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// VPC id.
    pub vpc_id: Option<String>,
    /// Subnet id.
    pub subnet_id: Option<String>,
    /// Internet gateway id.
    pub internet_gateway_id: Option<String>,
    /// Whether the gateway is attached to the VPC.
    #[serde(default)]
    pub gateway_attached: bool,
    /// Whether the default route through the gateway exists.
    #[serde(default)]
    pub default_route: bool,
}

/// EC2 key pair used to log into the instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairState {
    /// Key pair name.
    pub name: String,
    /// Provider id of the key pair.
    pub key_pair_id: Option<String>,
    /// Local file holding the private key.
    pub private_key: PathBuf,
}

/// Elastic IP attached to the first instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticIpState {
    /// Allocation id.
    pub allocation_id: String,
    /// The public address.
    pub public_ip: String,
    /// Association with the first instance, once made.
    pub association_id: Option<String>,
}

/// GitHub deploy key registered for the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployKeyState {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// GitHub key id.
    pub key_id: u64,
}

/// Bootstrap steps completed on an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapProgress {
    /// Package repositories and packages installed.
    pub packages: bool,
    /// Repository cloned.
    pub repository: bool,
    /// TLS certificate and key uploaded, or none configured.
    #[serde(default)]
    pub tls: bool,
    /// systemd unit installed.
    pub service: bool,
}

impl BootstrapProgress {
    /// Whether every step has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.packages && self.repository && self.tls && self.service
    }
}

/// One compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Position in the cluster (0-based).
    pub index: usize,
    /// Name tag.
    pub name: String,
    /// Provider instance id.
    pub instance_id: String,
    /// Public IPv4 address, once running.
    pub public_ip: Option<String>,
    /// Private IPv4 address, once running.
    pub private_ip: Option<String>,
    /// Whether the instance reached `running`.
    #[serde(default)]
    pub ready: bool,
    /// Bootstrap progress.
    #[serde(default)]
    pub bootstrap: BootstrapProgress,
    /// Application process status.
    #[serde(default)]
    pub service: ServiceStatus,
}

impl InstanceRecord {
    /// Record for a freshly created instance.
    #[must_use]
    pub fn new(index: usize, name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            instance_id: instance_id.into(),
            public_ip: None,
            private_ip: None,
            ready: false,
            bootstrap: BootstrapProgress::default(),
            service: ServiceStatus::Unknown,
        }
    }
}

/// Resources allocated for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Cluster name.
    pub name: String,
    /// Region the resources live in.
    pub region: String,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Network resources.
    #[serde(default)]
    pub network: NetworkState,
    /// Security group id.
    pub security_group_id: Option<String>,
    /// Whether the ingress rules were added to the security group.
    #[serde(default)]
    pub ingress_authorized: bool,
    /// EC2 key pair.
    pub key_pair: Option<KeyPairState>,
    /// Elastic IP.
    pub elastic_ip: Option<ElasticIpState>,
    /// GitHub deploy key.
    pub deploy_key: Option<DeployKeyState>,
    /// Instances, in creation order.
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    /// When `up` first ran.
    pub created_at: String,
    /// Timestamp of last update.
    pub updated_at: String,
}

impl ClusterState {
    /// Empty state for a cluster about to be provisioned.
    #[must_use]
    pub fn new(template: &ClusterTemplate) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            name: template.name.clone(),
            region: template.region.clone(),
            phase: Phase::Provisioning,
            network: NetworkState::default(),
            security_group_id: None,
            ingress_authorized: false,
            key_pair: None,
            elastic_ip: None,
            deploy_key: None,
            instances: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Load state from the cluster directory. `None` means absent.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(dir: &ClusterDir) -> Result<Option<Self>> {
        let path = dir.state_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("read", path, e)),
        };

        let state: Self = serde_json::from_str(&content)
            .map_err(|source| Error::CorruptState { path, source })?;

        debug!(
            cluster = %state.name,
            phase = %state.phase,
            instances = state.instances.len(),
            "Loaded cluster state"
        );
        Ok(Some(state))
    }

    /// Load state and require the cluster to be `active`.
    ///
    /// # Errors
    /// Returns [`Error::NotProvisioned`] when there is no state and
    /// [`Error::InvalidPhase`] when the cluster is not active.
    pub fn load_active(dir: &ClusterDir, operation: &'static str) -> Result<Self> {
        let state =
            Self::load(dir)?.ok_or_else(|| Error::NotProvisioned(dir.root().to_path_buf()))?;
        if state.phase != Phase::Active {
            return Err(Error::InvalidPhase {
                operation,
                phase: state.phase,
            });
        }
        Ok(state)
    }

    /// Persist state atomically.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self, dir: &ClusterDir) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::io("serialize", dir.state_file(), std::io::Error::other(e)))?;
        dir.write_atomic(&dir.state_file(), content.as_bytes(), None)
    }

    /// Update the phase and save.
    ///
    /// # Errors
    /// Returns an error if saving fails.
    pub fn set_phase(&mut self, dir: &ClusterDir, phase: Phase) -> Result<()> {
        if self.phase != phase {
            info!(cluster = %self.name, "Phase: {} -> {}", self.phase, phase);
        }
        self.phase = phase;
        self.save(dir)
    }

    /// Delete the state file; the cluster becomes absent.
    ///
    /// # Errors
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove(dir: &ClusterDir) -> Result<()> {
        ClusterDir::remove_file(&dir.state_file())
    }

    /// Whether no provider resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.network == NetworkState::default()
            && self.security_group_id.is_none()
            && self.key_pair.is_none()
            && self.elastic_ip.is_none()
            && self.deploy_key.is_none()
            && self.instances.is_empty()
    }

    /// Address clients use to reach the service: the elastic IP when one is
    /// attached, otherwise the first instance's public address.
    #[must_use]
    pub fn service_address(&self) -> Option<&str> {
        if let Some(eip) = self.elastic_ip.as_ref().filter(|e| e.association_id.is_some()) {
            return Some(&eip.public_ip);
        }
        self.instances.first().and_then(|i| i.public_ip.as_deref())
    }

    /// Instance at `index`.
    ///
    /// # Errors
    /// Returns an error if the cluster has no such instance.
    pub fn instance(&self, index: usize) -> Result<&InstanceRecord> {
        self.instances.get(index).ok_or_else(|| {
            Error::Unsupported(format!(
                "instance {index} does not exist (cluster has {} instance(s))",
                self.instances.len()
            ))
        })
    }
}
