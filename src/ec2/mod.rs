//! Cloud provisioning API for network interfaces.
//!
//! [`AwsCli`] drives the `aws ec2` command line with JSON output, the same way
//! the namespace installer drives `ip`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Command;
use tracing::debug;

use crate::error::ApiError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Parameters for creating an interface
#[derive(Debug, Clone)]
pub struct CreateRequest<'a> {
    pub region: &'a str,
    pub subnet_id: &'a str,
    pub security_groups: &'a [String],
    pub tags: &'a BTreeMap<String, String>,
    pub description: &'a str,
}

/// A freshly created interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInterface {
    pub interface_id: String,
    pub mac_address: String,
    pub private_ip: Option<String>,
    /// Provider response as returned
    pub raw: String,
}

/// A successful attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub attachment_id: String,
    pub raw: String,
}

/// Interface lifecycle state as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceStatus {
    Available,
    Attaching,
    InUse,
    Detaching,
    Other(String),
}

impl InterfaceStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "available" => InterfaceStatus::Available,
            "attaching" => InterfaceStatus::Attaching,
            "in-use" => InterfaceStatus::InUse,
            "detaching" => InterfaceStatus::Detaching,
            other => InterfaceStatus::Other(other.to_string()),
        }
    }
}

/// The provisioning operations the plugin needs
pub trait Ec2Api {
    fn create_interface(&self, request: &CreateRequest<'_>) -> ApiResult<CreatedInterface>;

    fn attach_interface(
        &self,
        region: &str,
        interface_id: &str,
        instance_id: &str,
        device_index: u32,
    ) -> ApiResult<Attachment>;

    /// Have the provider delete the interface when the instance terminates
    fn set_delete_on_termination(&self, region: &str, interface_id: &str, attachment_id: &str) -> ApiResult<()>;

    /// Returns the raw provider response
    fn detach_interface(&self, region: &str, attachment_id: &str) -> ApiResult<String>;

    /// Returns the raw provider response
    fn delete_interface(&self, region: &str, interface_id: &str) -> ApiResult<String>;

    fn interface_status(&self, region: &str, interface_id: &str) -> ApiResult<InterfaceStatus>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInterface {
    network_interface_id: String,
    #[serde(default)]
    mac_address: String,
    private_ip_address: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    network_interface: NetworkInterface,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachResponse {
    attachment_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeResponse {
    network_interfaces: Vec<NetworkInterface>,
}

/// `aws ec2` command line client
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: String,
}

impl AwsCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn run(&self, operation: &str, region: &str, args: &[String]) -> ApiResult<String> {
        debug!(operation, region, ?args, "Calling EC2");
        let output = Command::new(&self.binary)
            .arg("ec2")
            .arg(operation)
            .args(args)
            .args(["--region", region, "--output", "json"])
            .output()
            .map_err(|e| ApiError::new(operation, None, format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(ApiError::from_stderr(operation, &String::from_utf8_lossy(&output.stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn decode<'a, T: Deserialize<'a>>(operation: &str, raw: &'a str) -> ApiResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| ApiError::new(operation, None, format!("unexpected response: {}", e)))
}

/// `--tag-specifications` argument in JSON form
pub fn tag_specifications(tags: &BTreeMap<String, String>) -> String {
    let tags: Vec<_> = tags
        .iter()
        .map(|(k, v)| serde_json::json!({"Key": k, "Value": v}))
        .collect();
    serde_json::json!([{"ResourceType": "network-interface", "Tags": tags}]).to_string()
}

impl Ec2Api for AwsCli {
    fn create_interface(&self, request: &CreateRequest<'_>) -> ApiResult<CreatedInterface> {
        const OP: &str = "create-network-interface";
        let mut args = vec![
            "--subnet-id".to_string(),
            request.subnet_id.to_string(),
            "--description".to_string(),
            request.description.to_string(),
        ];
        if !request.security_groups.is_empty() {
            args.push("--groups".to_string());
            args.extend(request.security_groups.iter().cloned());
        }
        if !request.tags.is_empty() {
            args.push("--tag-specifications".to_string());
            args.push(tag_specifications(request.tags));
        }

        let raw = self.run(OP, request.region, &args)?;
        let response: CreateResponse = decode(OP, &raw)?;
        Ok(CreatedInterface {
            interface_id: response.network_interface.network_interface_id,
            mac_address: response.network_interface.mac_address,
            private_ip: response.network_interface.private_ip_address,
            raw,
        })
    }

    fn attach_interface(
        &self,
        region: &str,
        interface_id: &str,
        instance_id: &str,
        device_index: u32,
    ) -> ApiResult<Attachment> {
        const OP: &str = "attach-network-interface";
        let args = [
            "--network-interface-id".to_string(),
            interface_id.to_string(),
            "--instance-id".to_string(),
            instance_id.to_string(),
            "--device-index".to_string(),
            device_index.to_string(),
        ];
        let raw = self.run(OP, region, &args)?;
        let response: AttachResponse = decode(OP, &raw)?;
        Ok(Attachment {
            attachment_id: response.attachment_id,
            raw,
        })
    }

    fn set_delete_on_termination(&self, region: &str, interface_id: &str, attachment_id: &str) -> ApiResult<()> {
        let args = [
            "--network-interface-id".to_string(),
            interface_id.to_string(),
            "--attachment".to_string(),
            format!("AttachmentId={},DeleteOnTermination=true", attachment_id),
        ];
        self.run("modify-network-interface-attribute", region, &args)?;
        Ok(())
    }

    fn detach_interface(&self, region: &str, attachment_id: &str) -> ApiResult<String> {
        let args = ["--attachment-id".to_string(), attachment_id.to_string()];
        self.run("detach-network-interface", region, &args)
    }

    fn delete_interface(&self, region: &str, interface_id: &str) -> ApiResult<String> {
        let args = ["--network-interface-id".to_string(), interface_id.to_string()];
        self.run("delete-network-interface", region, &args)
    }

    fn interface_status(&self, region: &str, interface_id: &str) -> ApiResult<InterfaceStatus> {
        const OP: &str = "describe-network-interfaces";
        let args = ["--network-interface-ids".to_string(), interface_id.to_string()];
        let raw = self.run(OP, region, &args)?;
        let response: DescribeResponse = decode(OP, &raw)?;

        let interface = response
            .network_interfaces
            .into_iter()
            .find(|i| i.network_interface_id == interface_id)
            .ok_or_else(|| {
                ApiError::new(
                    OP,
                    Some("InvalidNetworkInterfaceID.NotFound"),
                    format!("{} not in response", interface_id),
                )
            })?;

        Ok(InterfaceStatus::parse(interface.status.as_deref().unwrap_or("unknown")))
    }
}
