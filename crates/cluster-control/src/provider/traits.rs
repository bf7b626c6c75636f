//! EC2 provider trait and common types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::IngressRule;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Resource does not exist (already deleted, or never created).
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The change was already made by an earlier, interrupted call.
    #[error("Already applied: {0}")]
    AlreadyApplied(String),

    /// The API rejected the request.
    #[error("API error: {code} - {message}")]
    Api { code: String, message: String },

    /// The provider could not be reached or returned something unexpected.
    #[error("Provider command failed: {0}")]
    Command(String),

    /// Response body could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A resource did not reach the expected state in time.
    #[error("Timed out after {secs} seconds waiting for {what}")]
    Timeout { what: String, secs: u64 },
}

impl ProviderError {
    /// Whether the error means the resource is already gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the error means the requested change is already in place.
    #[must_use]
    pub fn is_already_applied(&self) -> bool {
        matches!(self, Self::AlreadyApplied(_))
    }
}

/// Key/value tag attached to every created resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Tag key carrying the owning cluster name.
pub const CLUSTER_TAG: &str = "cluster-control:cluster";

/// `Name` and cluster tags for a resource.
#[must_use]
pub fn cluster_tags(cluster: &str, name: &str) -> Vec<Tag> {
    vec![
        Tag {
            key: "Name".to_string(),
            value: name.to_string(),
        },
        Tag {
            key: CLUSTER_TAG.to_string(),
            value: cluster.to_string(),
        },
    ]
}

/// Instance lifecycle state as reported by EC2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Instance is being launched.
    Pending,
    /// Instance is running.
    Running,
    /// Instance is stopping.
    Stopping,
    /// Instance is stopped.
    Stopped,
    /// Instance is terminating.
    ShuttingDown,
    /// Instance is gone.
    Terminated,
    /// Unknown state.
    Unknown,
}

impl InstanceState {
    /// Map an EC2 state name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Terminated => write!(f, "terminated"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Current view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Instance id.
    pub id: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Public IPv4 address.
    pub public_ip: Option<String>,
    /// Private IPv4 address.
    pub private_ip: Option<String>,
}

/// Request to launch one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Name tag.
    pub name: String,
    /// Image (AMI) id.
    pub image: String,
    /// Instance type.
    pub instance_type: String,
    /// Subnet to launch into.
    pub subnet_id: String,
    /// Security group.
    pub security_group_id: String,
    /// Key pair name.
    pub key_name: String,
    /// Tags.
    pub tags: Vec<Tag>,
}

/// A freshly created key pair.
#[derive(Debug, Clone)]
pub struct CreatedKeyPair {
    /// Provider id.
    pub id: Option<String>,
    /// Private key, PEM encoded. Only returned at creation.
    pub material: String,
}

/// A freshly allocated elastic IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedAddress {
    /// Allocation id.
    pub allocation_id: String,
    /// The address.
    pub public_ip: String,
}

/// EC2 operations used to build and release a cluster.
///
/// Every create call returns the identifier the caller must record before
/// doing anything else; every delete call returns [`ProviderError::NotFound`]
/// when the resource is already gone.
#[async_trait]
pub trait Ec2: Send + Sync {
    // ========================================================================
    // Allocation
    // ========================================================================

    /// Create a VPC, returning its id.
    async fn create_vpc(&self, cidr: &str, tags: &[Tag]) -> Result<String, ProviderError>;

    /// Create a subnet, returning its id.
    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: Option<&str>,
        tags: &[Tag],
    ) -> Result<String, ProviderError>;

    /// Assign public addresses to instances launched in the subnet.
    async fn enable_public_ip_on_launch(&self, subnet_id: &str) -> Result<(), ProviderError>;

    /// Create an internet gateway, returning its id.
    async fn create_internet_gateway(&self, tags: &[Tag]) -> Result<String, ProviderError>;

    /// Attach a gateway to a VPC.
    async fn attach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), ProviderError>;

    /// Route 0.0.0.0/0 through the gateway in the VPC's main route table.
    async fn create_default_route(
        &self,
        vpc_id: &str,
        gateway_id: &str,
    ) -> Result<(), ProviderError>;

    /// Create a security group, returning its id.
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<String, ProviderError>;

    /// Open inbound rules on a security group.
    async fn authorize_ingress(
        &self,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ProviderError>;

    /// Create a key pair.
    async fn create_key_pair(
        &self,
        name: &str,
        tags: &[Tag],
    ) -> Result<CreatedKeyPair, ProviderError>;

    /// Allocate an elastic IP.
    async fn allocate_address(&self, tags: &[Tag]) -> Result<AllocatedAddress, ProviderError>;

    /// Launch one instance, returning its id.
    async fn run_instance(&self, request: &LaunchRequest) -> Result<String, ProviderError>;

    /// Describe one instance.
    async fn describe_instance(&self, id: &str) -> Result<InstanceDescription, ProviderError>;

    /// Associate an elastic IP with an instance, returning the association id.
    async fn associate_address(
        &self,
        allocation_id: &str,
        instance_id: &str,
    ) -> Result<String, ProviderError>;

    // ========================================================================
    // Release
    // ========================================================================

    /// Remove an elastic IP association.
    async fn disassociate_address(&self, association_id: &str) -> Result<(), ProviderError>;

    /// Release an elastic IP.
    async fn release_address(&self, allocation_id: &str) -> Result<(), ProviderError>;

    /// Terminate an instance.
    async fn terminate_instance(&self, id: &str) -> Result<(), ProviderError>;

    /// Delete a key pair.
    async fn delete_key_pair(&self, name: &str) -> Result<(), ProviderError>;

    /// Delete a security group.
    async fn delete_security_group(&self, id: &str) -> Result<(), ProviderError>;

    /// Detach a gateway from a VPC.
    async fn detach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), ProviderError>;

    /// Delete an internet gateway.
    async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<(), ProviderError>;

    /// Delete a subnet.
    async fn delete_subnet(&self, id: &str) -> Result<(), ProviderError>;

    /// Delete a VPC.
    async fn delete_vpc(&self, id: &str) -> Result<(), ProviderError>;
}
