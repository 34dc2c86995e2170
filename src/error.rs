//! Error types for ENI provisioning and namespace installation

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error reported by the cloud provisioning API.
///
/// The AWS command line reports failures as
/// `An error occurred (<Code>) when calling the <Op> operation: <message>`;
/// `code` holds the parsed `<Code>` when present.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation}: {message}")]
pub struct ApiError {
    /// Provider operation that failed
    pub operation: String,
    /// Provider error code, e.g. `InvalidNetworkInterface.InUse`
    pub code: Option<String>,
    /// Human readable message
    pub message: String,
}

impl ApiError {
    pub fn new(operation: &str, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// Parse the provider's stderr text.
    pub fn from_stderr(operation: &str, stderr: &str) -> Self {
        let text = stderr.trim();
        let code = text
            .find("An error occurred (")
            .map(|start| &text[start + "An error occurred (".len()..])
            .and_then(|rest| rest.find(')').map(|end| rest[..end].to_string()));

        let message = match text.rsplit_once("operation: ") {
            Some((_, msg)) => msg.trim().to_string(),
            None if text.is_empty() => "no error output".to_string(),
            None => text.to_string(),
        };

        Self {
            operation: operation.to_string(),
            code,
            message,
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }

    /// The referenced interface or attachment no longer exists.
    pub fn is_not_found(&self) -> bool {
        self.code
            .as_deref()
            .map(|c| c.ends_with(".NotFound"))
            .unwrap_or(false)
    }

    pub fn is_attachment_limit(&self) -> bool {
        self.has_code("AttachmentLimitExceeded")
            || self.message.contains("maximum number of network interfaces")
    }

    /// Another interface already occupies the requested device index.
    pub fn is_device_index_in_use(&self) -> bool {
        self.has_code("InvalidParameterValue") && self.message.contains("device index")
    }

    pub fn is_in_use(&self) -> bool {
        self.has_code("InvalidNetworkInterface.InUse")
    }

    pub fn is_throttled(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("RequestLimitExceeded") | Some("Throttling")
        )
    }
}

/// Error type for plugin operations
#[derive(Debug, Error)]
pub enum EniError {
    /// Instance metadata could not be resolved
    #[error("metadata query {path} failed: {reason}")]
    Metadata { path: String, reason: String },

    /// Network configuration or invocation arguments are unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Creating the network interface failed
    #[error("failed to create network interface: {0}")]
    Provision(ApiError),

    /// Attaching the network interface failed
    #[error("failed to attach network interface {interface_id}: {source}")]
    Attach {
        interface_id: String,
        #[source]
        source: ApiError,
    },

    /// The instance has no free attachment slot
    #[error("instance {instance_id} cannot take another network interface: {message}")]
    AttachLimitExceeded { instance_id: String, message: String },

    /// Detaching the network interface failed
    #[error("failed to detach attachment {attachment_id}: {source}")]
    Detach {
        attachment_id: String,
        #[source]
        source: ApiError,
    },

    /// Deleting the network interface failed
    #[error("failed to delete network interface {interface_id}: {source}")]
    Delete {
        interface_id: String,
        #[source]
        source: ApiError,
    },

    /// Waiting for kernel or provider state did not converge
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    /// The attached interface never showed up as a host link
    #[error("device with MAC {mac} did not appear on the host within {waited:?}")]
    DeviceTimeout { mac: String, waited: Duration },

    /// A namespace or link operation failed
    #[error("namespace operation {op} failed: {reason}")]
    Namespace { op: &'static str, reason: String },

    /// Persisted state could not be read or written
    #[error("state file {}: {reason}", path.display())]
    State { path: PathBuf, reason: String },

    /// An external command could not be run
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EniError {
    /// Whether repeating the same operation can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            EniError::Metadata { .. } | EniError::Timeout { .. } | EniError::DeviceTimeout { .. } => true,
            EniError::Attach { source, .. } => {
                source.is_device_index_in_use() || source.is_throttled()
            }
            EniError::Provision(source) => source.is_throttled(),
            EniError::Detach { source, .. } => source.is_throttled(),
            EniError::Delete { source, .. } => source.is_in_use() || source.is_throttled(),
            EniError::InvalidConfig(_)
            | EniError::AttachLimitExceeded { .. }
            | EniError::Namespace { .. }
            | EniError::State { .. }
            | EniError::Spawn { .. }
            | EniError::Io(_) => false,
        }
    }

    /// Whether this error aborts setup. Detach and delete failures only leak
    /// a cloud resource and never block teardown.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EniError::Detach { .. } | EniError::Delete { .. })
    }
}

/// Result type for plugin operations
pub type Result<T> = std::result::Result<T, EniError>;
