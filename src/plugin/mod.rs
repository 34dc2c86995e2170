use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{NetConf, Settings};
use crate::ec2::Ec2Api;
use crate::error::{EniError, Result};
use crate::metadata::{self, InvocationContext, MetadataSource};
use crate::netns::{LinkFacts, NetworkStack};
use crate::provisioner::EniProvisioner;
use crate::state::{EniRecord, WorkDir};
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult, Route as CniRoute};
use crate::wait::{self, Backoff};

/// How long to wait for the host to address the new device when the
/// address can also be derived from the provider's response
const ADDRESS_WAIT: Duration = Duration::from_secs(10);

/// Teardown steps, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    RemoveHandle,
    LoadRecord,
    Detach,
    Delete,
    RemoveState,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::RemoveHandle => "remove namespace handle",
            TeardownStep::LoadRecord => "load record",
            TeardownStep::Detach => "detach interface",
            TeardownStep::Delete => "delete interface",
            TeardownStep::RemoveState => "remove working directory",
        };
        f.write_str(name)
    }
}

/// A teardown step that failed
#[derive(Debug)]
pub struct StepFailure {
    pub step: TeardownStep,
    pub error: EniError,
}

/// Outcome of a best-effort teardown
#[derive(Debug)]
pub struct TeardownReport {
    pub container_id: String,
    pub failures: Vec<StepFailure>,
    /// Interface left behind, if delete did not succeed
    pub leaked_interface: Option<String>,
}

impl TeardownReport {
    fn new(container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            failures: Vec::new(),
            leaked_interface: None,
        }
    }

    fn record(&mut self, step: TeardownStep, result: Result<()>) {
        if let Err(error) = result {
            warn!(step = %step, error = %error, retryable = error.is_retryable(), "Teardown step failed");
            self.failures.push(StepFailure { step, error });
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, step: TeardownStep) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }

    /// One-line summary of every failure
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            return format!("teardown of {} complete", self.container_id);
        }
        let details: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.step, f.error))
            .collect();
        format!(
            "teardown of {} finished with {} failed step(s): {}",
            self.container_id,
            self.failures.len(),
            details.join("; ")
        )
    }
}

/// ENI plugin implementation
pub struct EniPlugin<'a, A: Ec2Api, N: NetworkStack> {
    /// Network configuration
    config: NetConf,
    settings: Settings,
    /// Command arguments
    args: CmdArgs,
    api: &'a A,
    stack: &'a N,
    retry_delay: Option<Duration>,
}

impl<'a, A: Ec2Api, N: NetworkStack> EniPlugin<'a, A, N> {
    /// Create a new ENI plugin
    pub fn new(config: NetConf, args: CmdArgs, api: &'a A, stack: &'a N) -> Self {
        let settings = config.settings();
        Self {
            config,
            settings,
            args,
            api,
            stack,
            retry_delay: None,
        }
    }

    /// Replace the settings derived from the network configuration
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Initial delay between retries of provider calls
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn provisioner(&self) -> EniProvisioner<'_, A> {
        let provisioner = EniProvisioner::new(self.api, &self.settings);
        match self.retry_delay {
            Some(delay) => provisioner.with_retry_delay(delay),
            None => provisioner,
        }
    }

    /// Provision an interface and install it in the container namespace.
    ///
    /// Returns the result to print: the caller's `prevResult` unchanged, or a
    /// result describing the new interface when there was none.
    pub fn add_network(&self, metadata: &impl MetadataSource) -> Result<serde_json::Value> {
        let ctx = metadata::resolve(&self.args, &self.settings, metadata)?;
        let provisioner = self.provisioner();

        let record = provisioner.create_and_attach(&ctx, metadata, self.stack)?;

        let facts = match self.install(&ctx, &record) {
            Ok(facts) => facts,
            Err(e) => {
                error!(error = %e, container_id = %ctx.container_id, "Namespace installation failed, rolling back");
                if let Err(err) = self.stack.remove_handle(&ctx.container_id) {
                    warn!(error = %err, "Could not remove namespace handle during rollback");
                }
                provisioner.rollback(&ctx.work_dir, &record);
                return Err(e);
            }
        };

        info!(
            container_id = %ctx.container_id,
            interface_id = %record.interface_id,
            address = %facts.address,
            "Network interface ready"
        );
        Ok(self.setup_result(&ctx, &record, &facts))
    }

    /// Capture host-side addressing, then move, address and route in that order
    fn install(&self, ctx: &InvocationContext, record: &EniRecord) -> Result<LinkFacts> {
        let link = record.link_name.as_deref().ok_or_else(|| EniError::State {
            path: ctx.work_dir.path().to_path_buf(),
            reason: "record has no link name".to_string(),
        })?;

        // Must be read before the move: the address is not visible across the namespace boundary
        let facts = self.capture_facts(ctx, record, link)?;

        self.stack.create_handle(&ctx.container_id, &ctx.netns)?;
        self.stack.move_interface(link, &ctx.container_id, &ctx.ifname)?;
        self.stack
            .configure_address(&ctx.container_id, &ctx.ifname, facts.address, facts.broadcast)?;
        self.stack
            .install_default_route(&ctx.container_id, &ctx.ifname, facts.gateway)?;
        Ok(facts)
    }

    fn capture_facts(&self, ctx: &InvocationContext, record: &EniRecord, link: &str) -> Result<LinkFacts> {
        let derived = match (&record.private_ip, ctx.subnet_cidr) {
            (Some(ip), Some(cidr)) => ip
                .parse::<Ipv4Addr>()
                .ok()
                .and_then(|ip| ipnetwork::Ipv4Network::new(ip, cidr.prefix()).ok())
                .map(LinkFacts::from_network),
            _ => None,
        };

        let budget = if derived.is_some() {
            ADDRESS_WAIT.min(self.settings.attach_timeout)
        } else {
            self.settings.attach_timeout
        };

        let polled = wait::poll_until(&format!("address on {}", link), Backoff::new(budget), || {
            self.stack.link_facts(link)
        });
        match (polled, derived) {
            (Ok(facts), _) => Ok(facts),
            (Err(EniError::Timeout { .. }), Some(derived)) => {
                warn!(link, address = %derived.address, "Host did not address the device, using the provider-assigned address");
                Ok(derived)
            }
            (Err(e), _) => Err(e),
        }
    }

    fn setup_result(&self, ctx: &InvocationContext, record: &EniRecord, facts: &LinkFacts) -> serde_json::Value {
        if let Some(prev) = &self.config.prev_result {
            return prev.clone();
        }

        let mut result = CniResult::new(&self.config.cni_version);
        result.add_interface(Interface {
            name: ctx.ifname.clone(),
            mac: Some(record.mac_address.clone()),
            sandbox: Some(ctx.netns.clone()),
        });
        result.add_ip(IPConfig {
            interface: Some(0),
            address: facts.address.to_string(),
            gateway: Some(facts.gateway.to_string()),
        });
        result.add_route(CniRoute {
            dst: "0.0.0.0/0".to_string(),
            gw: Some(facts.gateway.to_string()),
        });
        serde_json::to_value(result).unwrap_or_else(|_| self.pass_through())
    }

    /// Release everything setup created. Never fails; problems are
    /// collected in the report.
    pub fn del_network(&self) -> TeardownReport {
        let container_id = self.args.container_id.as_str();
        let mut report = TeardownReport::new(container_id);

        let work_dir = match WorkDir::for_container(&self.settings.state_dir, container_id) {
            Ok(dir) => dir,
            Err(e) => {
                report.record(TeardownStep::LoadRecord, Err(e));
                return report;
            }
        };

        // Handle first, so the namespace reference goes away even if cloud teardown fails
        report.record(TeardownStep::RemoveHandle, self.stack.remove_handle(container_id));

        let record = match work_dir.load_record() {
            Ok(record) => record,
            Err(e) => {
                report.record(TeardownStep::LoadRecord, Err(e));
                None
            }
        };
        if record.is_none() && !report.failed(TeardownStep::LoadRecord) {
            info!(container_id, "No interface recorded for container, nothing to release");
        }

        let provisioner = self.provisioner();
        report.record(TeardownStep::Detach, provisioner.detach(&work_dir, record.as_ref()));
        report.record(TeardownStep::Delete, provisioner.delete(&work_dir, record.as_ref()));

        if report.failed(TeardownStep::Delete) {
            if let Some(record) = &record {
                error!(
                    container_id,
                    interface_id = %record.interface_id,
                    path = %work_dir.path().display(),
                    "Leaked network interface; record kept for later release"
                );
                report.leaked_interface = Some(record.interface_id.clone());
            }
        } else if !report.failed(TeardownStep::LoadRecord) {
            report.record(TeardownStep::RemoveState, work_dir.remove());
        }

        if report.is_clean() {
            info!(container_id, "{}", report.summary());
        } else {
            warn!(container_id, "{}", report.summary());
        }
        report
    }

    /// The caller's `prevResult`, or an empty result in the configured version
    pub fn pass_through(&self) -> serde_json::Value {
        pass_through(&self.config)
    }
}

/// The payload echoed for commands that do not change anything
pub fn pass_through(config: &NetConf) -> serde_json::Value {
    match &config.prev_result {
        Some(prev) => prev.clone(),
        None => serde_json::json!({ "cniVersion": config.cni_version }),
    }
}
