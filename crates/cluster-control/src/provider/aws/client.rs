//! `aws` CLI backed EC2 client.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, info};

use super::models::{
    AllocateAddressResponse, AssociateAddressResponse, CreateInternetGatewayResponse,
    CreateKeyPairResponse, CreateSecurityGroupResponse, CreateSubnetResponse, CreateVpcResponse,
    DescribeInstancesResponse, DescribeRouteTablesResponse, Ec2Instance, RunInstancesResponse,
};
use crate::provider::traits::{
    AllocatedAddress, CreatedKeyPair, Ec2, InstanceDescription, InstanceState, LaunchRequest,
    ProviderError, Tag,
};
use crate::template::IngressRule;

/// EC2 provider that shells out to the `aws` CLI.
#[derive(Debug, Clone)]
pub struct AwsCli {
    /// CLI executable.
    binary: PathBuf,
    /// AWS region.
    region: String,
    /// Named profile, when not using the default credentials chain.
    profile: Option<String>,
}

impl AwsCli {
    /// Create a client for a region.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("aws"),
            region: region.into(),
            profile: None,
        }
    }

    /// Use a named profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Use a different executable.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Run `aws ec2 <args>` and return stdout.
    async fn ec2(&self, args: &[&str]) -> Result<String, ProviderError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("ec2")
            .args(args)
            .args(["--region", &self.region, "--output", "json"])
            .env("AWS_PAGER", "")
            .kill_on_drop(true);
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile]);
        }

        debug!(operation = args.first().copied().unwrap_or_default(), region = %self.region, "aws ec2");

        let output = cmd.output().await.map_err(|e| {
            ProviderError::Command(format!("failed to run {}: {e}", self.binary.display()))
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    /// Run `aws ec2 <args>` and decode the JSON response.
    async fn ec2_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, ProviderError> {
        let stdout = self.ec2(args).await?;
        serde_json::from_str(&stdout).map_err(ProviderError::Serialization)
    }

    fn to_description(instance: &Ec2Instance) -> InstanceDescription {
        InstanceDescription {
            id: instance.instance_id.clone(),
            state: InstanceState::from_name(&instance.state.name),
            public_ip: instance.public_ip_address.clone(),
            private_ip: instance.private_ip_address.clone(),
        }
    }
}

/// Turn CLI stderr into a [`ProviderError`].
///
/// The CLI reports service errors as
/// `An error occurred (Code) when calling the Op operation: message`.
fn classify_error(stderr: &str) -> ProviderError {
    const MARKER: &str = "An error occurred (";

    let Some(start) = stderr.find(MARKER) else {
        return ProviderError::Command(stderr.trim().to_string());
    };
    let rest = &stderr[start + MARKER.len()..];
    let Some(end) = rest.find(')') else {
        return ProviderError::Command(stderr.trim().to_string());
    };

    let code = &rest[..end];
    let tail = &rest[end + 1..];
    let message = tail
        .split_once(": ")
        .map_or(tail, |(_, message)| message)
        .trim()
        .to_string();

    if code.ends_with(".NotFound") || code == "Gateway.NotAttached" {
        ProviderError::NotFound(format!("{code}: {message}"))
    } else if matches!(
        code,
        "Resource.AlreadyAssociated" | "RouteAlreadyExists" | "InvalidPermission.Duplicate"
    ) {
        ProviderError::AlreadyApplied(format!("{code}: {message}"))
    } else {
        ProviderError::Api {
            code: code.to_string(),
            message,
        }
    }
}

/// `--tag-specifications` shorthand for one resource type.
fn tag_specification(resource_type: &str, tags: &[Tag]) -> String {
    let tags = tags
        .iter()
        .map(|t| format!("{{Key={},Value={}}}", t.key, t.value))
        .collect::<Vec<_>>()
        .join(",");
    format!("ResourceType={resource_type},Tags=[{tags}]")
}

/// `--ip-permissions` JSON for a set of ingress rules.
fn ip_permissions(rules: &[IngressRule]) -> String {
    let permissions: Vec<serde_json::Value> = rules
        .iter()
        .map(|rule| {
            serde_json::json!({
                "IpProtocol": rule.protocol,
                "FromPort": rule.port,
                "ToPort": rule.port,
                "IpRanges": [{ "CidrIp": rule.cidr }],
            })
        })
        .collect();
    serde_json::Value::Array(permissions).to_string()
}

#[async_trait]
impl Ec2 for AwsCli {
    async fn create_vpc(&self, cidr: &str, tags: &[Tag]) -> Result<String, ProviderError> {
        let spec = tag_specification("vpc", tags);
        let response: CreateVpcResponse = self
            .ec2_json(&["create-vpc", "--cidr-block", cidr, "--tag-specifications", &spec])
            .await?;
        info!(vpc_id = %response.vpc.vpc_id, cidr, "VPC created");
        Ok(response.vpc.vpc_id)
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: Option<&str>,
        tags: &[Tag],
    ) -> Result<String, ProviderError> {
        let spec = tag_specification("subnet", tags);
        let mut args = vec![
            "create-subnet",
            "--vpc-id",
            vpc_id,
            "--cidr-block",
            cidr,
            "--tag-specifications",
            &spec,
        ];
        if let Some(zone) = availability_zone {
            args.extend(["--availability-zone", zone]);
        }
        let response: CreateSubnetResponse = self.ec2_json(&args).await?;
        info!(subnet_id = %response.subnet.subnet_id, cidr, "Subnet created");
        Ok(response.subnet.subnet_id)
    }

    async fn enable_public_ip_on_launch(&self, subnet_id: &str) -> Result<(), ProviderError> {
        self.ec2(&[
            "modify-subnet-attribute",
            "--subnet-id",
            subnet_id,
            "--map-public-ip-on-launch",
        ])
        .await?;
        Ok(())
    }

    async fn create_internet_gateway(&self, tags: &[Tag]) -> Result<String, ProviderError> {
        let spec = tag_specification("internet-gateway", tags);
        let response: CreateInternetGatewayResponse = self
            .ec2_json(&["create-internet-gateway", "--tag-specifications", &spec])
            .await?;
        let id = response.internet_gateway.internet_gateway_id;
        info!(gateway_id = %id, "Internet gateway created");
        Ok(id)
    }

    async fn attach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), ProviderError> {
        self.ec2(&[
            "attach-internet-gateway",
            "--internet-gateway-id",
            gateway_id,
            "--vpc-id",
            vpc_id,
        ])
        .await?;
        Ok(())
    }

    async fn create_default_route(
        &self,
        vpc_id: &str,
        gateway_id: &str,
    ) -> Result<(), ProviderError> {
        let vpc_filter = format!("Name=vpc-id,Values={vpc_id}");
        let tables: DescribeRouteTablesResponse = self
            .ec2_json(&[
                "describe-route-tables",
                "--filters",
                &vpc_filter,
                "Name=association.main,Values=true",
            ])
            .await?;
        let table = tables.route_tables.first().ok_or_else(|| {
            ProviderError::NotFound(format!("main route table of {vpc_id}"))
        })?;

        self.ec2(&[
            "create-route",
            "--route-table-id",
            &table.route_table_id,
            "--destination-cidr-block",
            "0.0.0.0/0",
            "--gateway-id",
            gateway_id,
        ])
        .await?;
        debug!(route_table = %table.route_table_id, gateway_id, "Default route created");
        Ok(())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<String, ProviderError> {
        let spec = tag_specification("security-group", tags);
        let response: CreateSecurityGroupResponse = self
            .ec2_json(&[
                "create-security-group",
                "--group-name",
                name,
                "--description",
                description,
                "--vpc-id",
                vpc_id,
                "--tag-specifications",
                &spec,
            ])
            .await?;
        info!(group_id = %response.group_id, name, "Security group created");
        Ok(response.group_id)
    }

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ProviderError> {
        let permissions = ip_permissions(rules);
        self.ec2(&[
            "authorize-security-group-ingress",
            "--group-id",
            group_id,
            "--ip-permissions",
            &permissions,
        ])
        .await?;
        Ok(())
    }

    async fn create_key_pair(
        &self,
        name: &str,
        tags: &[Tag],
    ) -> Result<CreatedKeyPair, ProviderError> {
        let spec = tag_specification("key-pair", tags);
        let response: CreateKeyPairResponse = self
            .ec2_json(&["create-key-pair", "--key-name", name, "--tag-specifications", &spec])
            .await?;
        info!(name, "Key pair created");
        Ok(CreatedKeyPair {
            id: response.key_pair_id,
            material: response.key_material,
        })
    }

    async fn allocate_address(&self, tags: &[Tag]) -> Result<AllocatedAddress, ProviderError> {
        let spec = tag_specification("elastic-ip", tags);
        let response: AllocateAddressResponse = self
            .ec2_json(&["allocate-address", "--domain", "vpc", "--tag-specifications", &spec])
            .await?;
        info!(allocation_id = %response.allocation_id, ip = %response.public_ip, "Elastic IP allocated");
        Ok(AllocatedAddress {
            allocation_id: response.allocation_id,
            public_ip: response.public_ip,
        })
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<String, ProviderError> {
        let spec = tag_specification("instance", &request.tags);
        let response: RunInstancesResponse = self
            .ec2_json(&[
                "run-instances",
                "--image-id",
                &request.image,
                "--instance-type",
                &request.instance_type,
                "--count",
                "1",
                "--subnet-id",
                &request.subnet_id,
                "--security-group-ids",
                &request.security_group_id,
                "--key-name",
                &request.key_name,
                "--tag-specifications",
                &spec,
            ])
            .await?;

        let instance = response.instances.first().ok_or_else(|| {
            ProviderError::Command("run-instances returned no instance".to_string())
        })?;
        info!(instance_id = %instance.instance_id, name = %request.name, "Instance launched");
        Ok(instance.instance_id.clone())
    }

    async fn describe_instance(&self, id: &str) -> Result<InstanceDescription, ProviderError> {
        let response: DescribeInstancesResponse = self
            .ec2_json(&["describe-instances", "--instance-ids", id])
            .await?;
        response
            .reservations
            .iter()
            .flat_map(|r| r.instances.iter())
            .find(|i| i.instance_id == id)
            .map(Self::to_description)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {id}")))
    }

    async fn associate_address(
        &self,
        allocation_id: &str,
        instance_id: &str,
    ) -> Result<String, ProviderError> {
        let response: AssociateAddressResponse = self
            .ec2_json(&[
                "associate-address",
                "--allocation-id",
                allocation_id,
                "--instance-id",
                instance_id,
            ])
            .await?;
        Ok(response.association_id)
    }

    async fn disassociate_address(&self, association_id: &str) -> Result<(), ProviderError> {
        self.ec2(&["disassociate-address", "--association-id", association_id])
            .await?;
        Ok(())
    }

    async fn release_address(&self, allocation_id: &str) -> Result<(), ProviderError> {
        self.ec2(&["release-address", "--allocation-id", allocation_id])
            .await?;
        Ok(())
    }

    async fn terminate_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2(&["terminate-instances", "--instance-ids", id])
            .await?;
        Ok(())
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), ProviderError> {
        self.ec2(&["delete-key-pair", "--key-name", name]).await?;
        Ok(())
    }

    async fn delete_security_group(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2(&["delete-security-group", "--group-id", id])
            .await?;
        Ok(())
    }

    async fn detach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), ProviderError> {
        self.ec2(&[
            "detach-internet-gateway",
            "--internet-gateway-id",
            gateway_id,
            "--vpc-id",
            vpc_id,
        ])
        .await?;
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<(), ProviderError> {
        self.ec2(&["delete-internet-gateway", "--internet-gateway-id", gateway_id])
            .await?;
        Ok(())
    }

    async fn delete_subnet(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2(&["delete-subnet", "--subnet-id", id]).await?;
        Ok(())
    }

    async fn delete_vpc(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2(&["delete-vpc", "--vpc-id", id]).await?;
        Ok(())
    }
}
