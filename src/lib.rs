//! ENI CNI plugin
//!
//! Gives a container an additional routable interface backed by an AWS
//! elastic network interface:
//! - Creates an ENI in the instance's subnet and attaches it to the instance
//! - Moves the new device into the container network namespace
//! - Configures its address and default route
//! - Detaches and deletes the ENI on container deletion, using only state
//!   persisted by the setup invocation

pub mod commands;
pub mod config;
pub mod ec2;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod netns;
pub mod plugin;
pub mod provisioner;
pub mod state;
pub mod types;
pub mod wait;

// Re-export commonly used items
pub use commands::{dispatch, run_cni, Backends, Output, SystemBackends};
pub use config::{NetConf, Settings};
pub use error::{ApiError, EniError};
pub use plugin::{EniPlugin, TeardownReport};
