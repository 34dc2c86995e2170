//! Instance metadata lookup and invocation context.

use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{EniError, Result};
use crate::state::WorkDir;
use crate::types::CmdArgs;
use crate::wait::{self, Backoff};

const TOKEN_TTL_SECONDS: &str = "21600";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 3;

/// Read access to instance metadata, keyed by path below `latest/meta-data/`
pub trait MetadataSource {
    fn get(&self, path: &str) -> Result<String>;
}

/// Client for the EC2 instance metadata service.
///
/// Uses an IMDSv2 session token when the token endpoint answers and plain
/// IMDSv1 requests otherwise.
pub struct ImdsClient {
    endpoint: String,
    client: reqwest::blocking::Client,
    token: Option<String>,
}

impl ImdsClient {
    pub fn connect(endpoint: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EniError::Metadata {
                path: endpoint.to_string(),
                reason: format!("cannot build HTTP client: {}", e),
            })?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        let token = client
            .put(format!("{}/latest/api/token", endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text());

        let token = match token {
            Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "IMDSv2 token unavailable, falling back to IMDSv1");
                None
            }
        };

        Ok(Self {
            endpoint,
            client,
            token,
        })
    }

    fn fetch(&self, path: &str) -> Result<String> {
        let url = format!("{}/latest/meta-data/{}", self.endpoint, path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header("X-aws-ec2-metadata-token", token);
        }

        let body = request
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| EniError::Metadata {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(body)
    }
}

impl MetadataSource for ImdsClient {
    fn get(&self, path: &str) -> Result<String> {
        let backoff = Backoff {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        };
        wait::retry(path, MAX_ATTEMPTS, backoff, EniError::is_retryable, |_| self.fetch(path))
    }
}

/// Everything one invocation knows about its container and instance.
/// Built once, then only borrowed.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: HashMap<String, String>,
    pub work_dir: WorkDir,
    pub instance_id: String,
    pub region: String,
    pub availability_zone: String,
    pub subnet_id: String,
    /// CIDR of `subnet_id`, when the service reports it
    pub subnet_cidr: Option<Ipv4Network>,
    pub primary_mac: String,
    pub security_groups: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

/// Region for an availability zone: the zone with its trailing letter removed
pub fn region_from_az(az: &str) -> Result<String> {
    let az = az.trim();
    let region = match az.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => &az[..az.len() - 1],
        _ => az,
    };

    if region.is_empty() || !region.ends_with(|c: char| c.is_ascii_digit()) {
        return Err(EniError::Metadata {
            path: "placement/availability-zone".to_string(),
            reason: format!("cannot derive region from {:?}", az),
        });
    }
    Ok(region.to_string())
}

/// Query a metadata value that must be non-empty
fn required(source: &impl MetadataSource, path: &str) -> Result<String> {
    let value = source.get(path)?.trim().to_string();
    if value.is_empty() {
        return Err(EniError::Metadata {
            path: path.to_string(),
            reason: "empty response".to_string(),
        });
    }
    Ok(value)
}

fn lines(value: &str) -> Vec<String> {
    value
        .lines()
        .map(|l| l.trim().trim_end_matches('/'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Number of interfaces currently attached to the instance
pub fn device_count(source: &impl MetadataSource) -> Result<u32> {
    let macs = lines(&source.get("network/interfaces/macs/")?);
    if macs.is_empty() {
        return Err(EniError::Metadata {
            path: "network/interfaces/macs/".to_string(),
            reason: "instance reports no interfaces".to_string(),
        });
    }
    Ok(macs.len() as u32)
}

/// Build the invocation context for a setup
pub fn resolve(args: &CmdArgs, settings: &Settings, source: &impl MetadataSource) -> Result<InvocationContext> {
    let work_dir = WorkDir::for_container(&settings.state_dir, &args.container_id)?;

    if args.netns.is_empty() {
        return Err(EniError::InvalidConfig("CNI_NETNS is required for ADD".to_string()));
    }
    if args.ifname.is_empty() {
        return Err(EniError::InvalidConfig("CNI_IFNAME is required for ADD".to_string()));
    }

    let instance_id = required(source, "instance-id")?;
    let availability_zone = required(source, "placement/availability-zone")?;
    let region = region_from_az(&availability_zone)?;
    let primary_mac = required(source, "mac")?;
    let subnet_id = required(source, &format!("network/interfaces/macs/{}/subnet-id", primary_mac))?;

    let cidr_path = format!("network/interfaces/macs/{}/subnet-ipv4-cidr-block", primary_mac);
    let subnet_cidr = match source.get(&cidr_path).map(|v| v.trim().parse::<Ipv4Network>()) {
        Ok(Ok(cidr)) => Some(cidr),
        Ok(Err(e)) => {
            warn!(error = %e, "Ignoring unparseable subnet CIDR");
            None
        }
        Err(e) => {
            debug!(error = %e, "Subnet CIDR unavailable");
            None
        }
    };

    let security_groups = if settings.security_groups.is_empty() {
        let path = format!("network/interfaces/macs/{}/security-group-ids", primary_mac);
        let groups = lines(&required(source, &path)?);
        debug!(?groups, "Using security groups of the primary interface");
        groups
    } else {
        settings.security_groups.clone()
    };

    info!(
        container_id = %args.container_id,
        instance_id = %instance_id,
        region = %region,
        subnet_id = %subnet_id,
        "Resolved instance metadata"
    );

    Ok(InvocationContext {
        container_id: args.container_id.clone(),
        netns: args.netns.clone(),
        ifname: args.ifname.clone(),
        args: args.args.clone(),
        work_dir,
        instance_id,
        region,
        availability_zone,
        subnet_id,
        subnet_cidr,
        primary_mac,
        security_groups,
        tags: settings.tags.clone(),
    })
}
