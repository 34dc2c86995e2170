use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EniError, Result};

/// Plugin type name used in network configuration lists
pub const PLUGIN_TYPE: &str = "eni-cni";

/// Version assumed when a configuration does not name one
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// Effective settings for one invocation, after applying network
/// configuration overrides to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the per-container working directories
    pub state_dir: PathBuf,
    /// Directory holding the named namespace handles
    pub netns_dir: PathBuf,
    /// Instance metadata service base URL
    pub metadata_endpoint: String,
    /// AWS command line binary
    pub aws_cli: String,
    /// iproute2 binary
    pub ip_command: String,
    /// Security groups for new interfaces; empty means "same as the primary interface"
    pub security_groups: Vec<String>,
    /// Extra tags for new interfaces
    pub tags: BTreeMap<String, String>,
    /// How long to wait for the attached device to appear on the host
    pub attach_timeout: Duration,
    /// How long to wait for a detached interface to become deletable
    pub detach_timeout: Duration,
    /// Diagnostic log file; stderr when unset
    pub log_file: Option<PathBuf>,
    /// Log filter directive used when RUST_LOG is unset
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/cni/eni"),
            netns_dir: PathBuf::from("/var/run/netns"),
            metadata_endpoint: "http://169.254.169.254".to_string(),
            aws_cli: "aws".to_string(),
            ip_command: "ip".to_string(),
            security_groups: Vec::new(),
            tags: BTreeMap::new(),
            attach_timeout: Duration::from_secs(60),
            detach_timeout: Duration::from_secs(60),
            log_file: None,
            log_level: None,
        }
    }
}

/// Network configuration passed on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Result computed by earlier plugins in the chain, echoed unchanged
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<serde_json::Value>,
    /// Security groups for the new interface
    #[serde(rename = "securityGroups", default, skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Vec<String>>,
    /// Tags for the new interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(rename = "stateDir", default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(rename = "netnsDir", default, skip_serializing_if = "Option::is_none")]
    pub netns_dir: Option<PathBuf>,
    #[serde(rename = "metadataEndpoint", default, skip_serializing_if = "Option::is_none")]
    pub metadata_endpoint: Option<String>,
    #[serde(rename = "awsCli", default, skip_serializing_if = "Option::is_none")]
    pub aws_cli: Option<String>,
    #[serde(rename = "ipCommand", default, skip_serializing_if = "Option::is_none")]
    pub ip_command: Option<String>,
    #[serde(rename = "attachTimeoutSecs", default, skip_serializing_if = "Option::is_none")]
    pub attach_timeout_secs: Option<u64>,
    #[serde(rename = "detachTimeoutSecs", default, skip_serializing_if = "Option::is_none")]
    pub detach_timeout_secs: Option<u64>,
    #[serde(rename = "logFile", default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(rename = "logLevel", default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes).map_err(|e| {
            EniError::InvalidConfig(format!("failed to parse network configuration: {}", e))
        })?;

        if conf.cni_version.trim().is_empty() {
            return Err(EniError::InvalidConfig("cniVersion is required".to_string()));
        }

        if let Some(groups) = &conf.security_groups {
            if let Some(bad) = groups.iter().find(|g| !g.starts_with("sg-")) {
                return Err(EniError::InvalidConfig(format!(
                    "invalid security group id {:?}",
                    bad
                )));
            }
        }

        if conf.attach_timeout_secs == Some(0) || conf.detach_timeout_secs == Some(0) {
            return Err(EniError::InvalidConfig("timeouts must be positive".to_string()));
        }

        Ok(conf)
    }

    /// Configuration for a best-effort teardown. Validation is skipped, and
    /// anything that does not decode falls back to the defaults.
    pub fn parse_lenient(bytes: &[u8]) -> Self {
        let mut conf = serde_json::from_slice::<serde_json::Value>(bytes)
            .ok()
            .filter(|v| v.is_object())
            .map(|mut value| {
                if value.get("cniVersion").and_then(|v| v.as_str()).map_or(true, |v| v.trim().is_empty()) {
                    value["cniVersion"] = serde_json::Value::from(DEFAULT_CNI_VERSION);
                }
                value
            })
            .and_then(|value| serde_json::from_value::<NetConf>(value).ok())
            .unwrap_or_else(|| NetConf::new_default("", DEFAULT_CNI_VERSION));

        // A zero timeout would skip the waits teardown relies on
        if conf.attach_timeout_secs == Some(0) {
            conf.attach_timeout_secs = None;
        }
        if conf.detach_timeout_secs == Some(0) {
            conf.detach_timeout_secs = None;
        }
        conf
    }

    /// Create a minimal configuration for the given version
    pub fn new_default(name: &str, cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            name: name.to_string(),
            plugin_type: PLUGIN_TYPE.to_string(),
            prev_result: None,
            security_groups: None,
            tags: None,
            state_dir: None,
            netns_dir: None,
            metadata_endpoint: None,
            aws_cli: None,
            ip_command: None,
            attach_timeout_secs: None,
            detach_timeout_secs: None,
            log_file: None,
            log_level: None,
        }
    }

    /// Apply this configuration's overrides to the defaults
    pub fn settings(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            state_dir: self.state_dir.clone().unwrap_or(defaults.state_dir),
            netns_dir: self.netns_dir.clone().unwrap_or(defaults.netns_dir),
            metadata_endpoint: self
                .metadata_endpoint
                .clone()
                .unwrap_or(defaults.metadata_endpoint),
            aws_cli: self.aws_cli.clone().unwrap_or(defaults.aws_cli),
            ip_command: self.ip_command.clone().unwrap_or(defaults.ip_command),
            security_groups: self.security_groups.clone().unwrap_or_default(),
            tags: self.tags.clone().unwrap_or_default(),
            attach_timeout: self
                .attach_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.attach_timeout),
            detach_timeout: self
                .detach_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.detach_timeout),
            log_file: self.log_file.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

/// A network configuration list as installed under the CNI config directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<serde_json::Value>,
}

impl NetConfList {
    /// Chain this plugin after an existing primary plugin configuration
    pub fn chained(name: &str, primary: serde_json::Value, eni: &NetConf) -> Result<Self> {
        let eni = serde_json::to_value(eni)
            .map_err(|e| EniError::InvalidConfig(format!("failed to encode configuration: {}", e)))?;
        Ok(Self {
            cni_version: eni_version(&eni),
            name: name.to_string(),
            plugins: vec![primary, eni],
        })
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| EniError::State {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn eni_version(conf: &serde_json::Value) -> String {
    conf.get("cniVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("1.0.0")
        .to_string()
}
