//! Cluster template loading and validation.
//!
//! A template is the human-authored description of the cluster shape. It is
//! read once by `create`, validated, materialized with every default filled
//! in, and written to the cluster directory where later commands pick it up.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading a template.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// The template file does not exist.
    #[error("template file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The template file exists but could not be read.
    #[error("failed to read template {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML or misses a required field.
    #[error("malformed template {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The template parsed but describes an impossible cluster.
    #[error("invalid template: {0}")]
    Invalid(String),
}

/// Desired shape of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterTemplate {
    /// Cluster name, used as a prefix for every provider resource.
    pub name: String,
    /// AWS region (e.g. "us-east-1").
    pub region: String,
    /// Network layout.
    #[serde(default)]
    pub network: NetworkSpec,
    /// Compute instances.
    pub instances: InstanceSpec,
    /// Inbound firewall rules.
    #[serde(default)]
    pub security: SecuritySpec,
    /// The application service deployed on every instance.
    pub service: ServiceSpec,
    /// Wait and command timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// VPC and subnet layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSpec {
    /// CIDR block of the VPC.
    #[serde(default = "default_vpc_cidr")]
    pub vpc_cidr: String,
    /// CIDR block of the single public subnet.
    #[serde(default = "default_subnet_cidr")]
    pub subnet_cidr: String,
    /// Availability zone for the subnet; provider's choice when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            vpc_cidr: default_vpc_cidr(),
            subnet_cidr: default_subnet_cidr(),
            availability_zone: None,
        }
    }
}

/// Compute instance shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    /// Number of instances.
    pub count: u32,
    /// EC2 instance type (e.g. "t3.micro").
    pub instance_type: String,
    /// AMI id.
    pub image: String,
    /// Login user of the image.
    #[serde(default = "default_user")]
    pub user: String,
    /// Allocate an elastic IP and attach it to the first instance.
    #[serde(default)]
    pub elastic_ip: bool,
}

/// Security group configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecuritySpec {
    /// Inbound rules. SSH and the service port are opened when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<IngressRule>>,
}

/// A single inbound rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngressRule {
    /// IP protocol: tcp, udp, icmp, or -1 for all.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Port opened (from and to).
    pub port: u16,
    /// Source CIDR.
    #[serde(default = "default_source_cidr")]
    pub cidr: String,
}

/// The Node.js service running on each instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// systemd unit name (without `.service`).
    pub name: String,
    /// Unit description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Port the service listens on.
    #[serde(default = "default_service_port")]
    pub port: u16,
    /// Command that runs the service in the foreground.
    pub start: String,
    /// Build command run by `build`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    /// Directory, relative to the checkout, where build and start run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// yum packages installed during bootstrap.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    /// yum repository setup scripts, by name, piped to `bash` before install.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub package_repos: BTreeMap<String, String>,
    /// Environment variables for the service unit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Source repository checked out on every instance.
    pub repository: RepositorySpec,
    /// Server certificate and key uploaded next to the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
}

/// Local certificate files copied to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSpec {
    /// PEM certificate, relative to the template file.
    pub cert: PathBuf,
    /// PEM private key, relative to the template file.
    pub key: PathBuf,
    /// Destination directory relative to the home directory; the run directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<String>,
}

/// Remote file name of the uploaded certificate.
pub const TLS_CERT_FILE: &str = "server.cert";
/// Remote file name of the uploaded private key.
pub const TLS_KEY_FILE: &str = "server.key";

/// Source repository of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositorySpec {
    /// Clone URL.
    pub url: String,
    /// Tracked branch.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Checkout directory in the user's home; derived from the URL when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Register a read-only GitHub deploy key for the clone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_key: Option<DeployKeySpec>,
}

/// GitHub repository that receives the deploy key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployKeySpec {
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub repo: String,
}

/// Timeouts, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
    /// Instance reaching `running`.
    #[serde(default = "default_instance_ready_secs")]
    pub instance_ready_secs: u64,
    /// Instance accepting SSH commands.
    #[serde(default = "default_ssh_ready_secs")]
    pub ssh_ready_secs: u64,
    /// Instance reaching `terminated` during teardown.
    #[serde(default = "default_teardown_secs")]
    pub teardown_secs: u64,
    /// A single remote command (build, clone, package install).
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
    /// Delay between status polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            instance_ready_secs: default_instance_ready_secs(),
            ssh_ready_secs: default_ssh_ready_secs(),
            teardown_secs: default_teardown_secs(),
            command_secs: default_command_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Timeouts {
    /// Delay between status polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Timeout of a single remote command.
    #[must_use]
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub fn instance_ready(&self) -> Duration {
        Duration::from_secs(self.instance_ready_secs)
    }

    #[must_use]
    pub fn ssh_ready(&self) -> Duration {
        Duration::from_secs(self.ssh_ready_secs)
    }

    #[must_use]
    pub fn teardown(&self) -> Duration {
        Duration::from_secs(self.teardown_secs)
    }
}

fn default_vpc_cidr() -> String {
    "10.20.0.0/16".to_string()
}

fn default_subnet_cidr() -> String {
    "10.20.1.0/24".to_string()
}

fn default_user() -> String {
    "ec2-user".to_string()
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_source_cidr() -> String {
    "0.0.0.0/0".to_string()
}

fn default_service_port() -> u16 {
    3001
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_instance_ready_secs() -> u64 {
    300
}

fn default_ssh_ready_secs() -> u64 {
    300
}

fn default_teardown_secs() -> u64 {
    600
}

fn default_command_secs() -> u64 {
    900
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl ClusterTemplate {
    /// Read, parse, and validate a template file.
    ///
    /// # Errors
    /// Returns a [`TemplateError`] if the file is missing, malformed, or invalid.
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound(path.to_path_buf()));
            }
            Err(source) => {
                return Err(TemplateError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut template = Self::parse(&content, path)?;
        if let (Some(tls), Some(base)) = (template.service.tls.as_mut(), path.parent()) {
            tls.cert = base.join(&tls.cert);
            tls.key = base.join(&tls.key);
        }
        Ok(template)
    }

    /// Parse and validate template text. `origin` is only used in errors.
    ///
    /// # Errors
    /// Returns a [`TemplateError`] if the text is malformed or invalid.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, TemplateError> {
        let template: Self =
            serde_yaml::from_str(content).map_err(|source| TemplateError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        template.validate()?;

        debug!(
            cluster = %template.name,
            region = %template.region,
            count = template.instances.count,
            "Template parsed"
        );
        Ok(template)
    }

    /// Check the semantic constraints serde cannot express.
    ///
    /// # Errors
    /// Returns [`TemplateError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid(format!(
                "name '{}' must be non-empty and contain only letters, digits and '-'",
                self.name
            )));
        }
        if self.region.trim().is_empty() {
            return Err(invalid("region must not be empty"));
        }
        if self.instances.count == 0 {
            return Err(invalid("instances.count must be at least 1"));
        }
        if self.instances.instance_type.trim().is_empty() {
            return Err(invalid("instances.instance_type must not be empty"));
        }
        if self.instances.image.trim().is_empty() {
            return Err(invalid("instances.image must not be empty"));
        }

        let vpc = parse_cidr(&self.network.vpc_cidr, "network.vpc_cidr")?;
        let subnet = parse_cidr(&self.network.subnet_cidr, "network.subnet_cidr")?;
        for (cidr, field) in [(vpc, "network.vpc_cidr"), (subnet, "network.subnet_cidr")] {
            if !(16..=28).contains(&cidr.1) {
                return Err(invalid(format!(
                    "{field} prefix /{} must be between /16 and /28",
                    cidr.1
                )));
            }
        }
        if !cidr_contains(vpc, subnet) {
            return Err(invalid(format!(
                "network.subnet_cidr {} is not inside network.vpc_cidr {}",
                self.network.subnet_cidr, self.network.vpc_cidr
            )));
        }

        for rule in self.ingress_rules() {
            if !matches!(rule.protocol.as_str(), "tcp" | "udp" | "icmp" | "-1") {
                return Err(invalid(format!(
                    "ingress protocol '{}' must be tcp, udp, icmp or -1",
                    rule.protocol
                )));
            }
            if rule.port == 0 && rule.protocol != "-1" {
                return Err(invalid("ingress port must not be 0"));
            }
            parse_cidr(&rule.cidr, "security.ingress.cidr")?;
        }

        if self.service.name.is_empty()
            || self.service.name.starts_with('.')
            || !self
                .service
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(format!(
                "service.name '{}' must be non-empty and contain only letters, digits, '-', '_' and '.'",
                self.service.name
            )));
        }
        if self.service.start.trim().is_empty() {
            return Err(invalid("service.start must not be empty"));
        }
        if self.service.repository.url.trim().is_empty() {
            return Err(invalid("service.repository.url must not be empty"));
        }
        if let Some(tls) = &self.service.tls {
            if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
                return Err(invalid("service.tls.cert and service.tls.key must not be empty"));
            }
        }
        if self.service.repository.checkout_dir().is_empty() {
            return Err(invalid(
                "service.repository.directory cannot be derived from the url, set it explicitly",
            ));
        }

        Ok(())
    }

    /// Template with every defaulted value written out.
    #[must_use]
    pub fn materialize(&self) -> Self {
        let mut out = self.clone();
        out.security.ingress = Some(self.ingress_rules());
        out.service.repository.directory = Some(self.service.repository.checkout_dir());
        out
    }

    /// Effective inbound rules: explicit ones, or SSH plus the service port.
    #[must_use]
    pub fn ingress_rules(&self) -> Vec<IngressRule> {
        self.security.ingress.clone().unwrap_or_else(|| {
            [22, self.service.port]
                .into_iter()
                .map(|port| IngressRule {
                    protocol: default_protocol(),
                    port,
                    cidr: default_source_cidr(),
                })
                .collect()
        })
    }

    /// Serialize to YAML.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Name of a provider resource belonging to this cluster.
    #[must_use]
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.name)
    }

    /// Name tag of the instance at `index`.
    #[must_use]
    pub fn instance_name(&self, index: usize) -> String {
        format!("{}-{index}", self.name)
    }

    /// Name of the EC2 key pair.
    #[must_use]
    pub fn key_pair_name(&self) -> String {
        self.resource_name("key")
    }
}

impl RepositorySpec {
    /// Checkout directory, relative to the login user's home.
    #[must_use]
    pub fn checkout_dir(&self) -> String {
        if let Some(dir) = &self.directory {
            return dir.clone();
        }
        self.url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default()
            .trim_end_matches(".git")
            .to_string()
    }
}

impl ServiceSpec {
    /// Directory where build and start run, relative to the home directory.
    #[must_use]
    pub fn run_dir(&self) -> String {
        let checkout = self.repository.checkout_dir();
        match &self.working_dir {
            Some(sub) if !sub.is_empty() => format!("{checkout}/{sub}"),
            _ => checkout,
        }
    }

    /// Remote directory receiving the TLS files.
    #[must_use]
    pub fn tls_dir(&self) -> Option<String> {
        let tls = self.tls.as_ref()?;
        Some(match &tls.remote_dir {
            Some(dir) if !dir.is_empty() => dir.clone(),
            _ => self.run_dir(),
        })
    }

    /// Full systemd unit name.
    #[must_use]
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }
}

fn invalid(message: impl Into<String>) -> TemplateError {
    TemplateError::Invalid(message.into())
}

fn parse_cidr(value: &str, field: &str) -> Result<(Ipv4Addr, u8), TemplateError> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| invalid(format!("{field} '{value}' is not in a.b.c.d/n form")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| invalid(format!("{field} '{value}' has an invalid address")))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| invalid(format!("{field} '{value}' has an invalid prefix")))?;
    Ok((addr, prefix))
}

fn cidr_contains(outer: (Ipv4Addr, u8), inner: (Ipv4Addr, u8)) -> bool {
    if inner.1 < outer.1 {
        return false;
    }
    let mask = if outer.1 == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(outer.1))
    };
    (u32::from(outer.0) & mask) == (u32::from(inner.0) & mask)
}
