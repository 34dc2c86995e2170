use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use std::io::{self, Read};
use tracing::{error, info, warn};

use crate::config::{NetConf, Settings, DEFAULT_CNI_VERSION};
use crate::ec2::{AwsCli, Ec2Api};
use crate::metadata::{ImdsClient, MetadataSource};
use crate::netns::{IpRoute2, NetworkStack};
use crate::plugin::{pass_through, EniPlugin};
use crate::types::{parse_cni_args, CmdArgs, Command, ErrorResult, VersionResult, ERROR_CODE_SETUP};

/// What the process prints on stdout and how it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub exit_code: i32,
}

impl Output {
    fn success(value: &impl Serialize) -> Self {
        Self {
            stdout: encode(value),
            exit_code: 0,
        }
    }

    fn empty() -> Self {
        Self {
            stdout: String::new(),
            exit_code: 0,
        }
    }

    /// Error envelope for a failed setup
    pub fn error(cni_version: &str, msg: impl Into<String>) -> Self {
        Self {
            stdout: encode(&ErrorResult::new(cni_version, ERROR_CODE_SETUP, msg)),
            exit_code: 1,
        }
    }
}

fn encode(value: &impl Serialize) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!(r#"{{"code":{},"msg":"failed to encode result: {}"}}"#, ERROR_CODE_SETUP, e))
}

/// Creates the external collaborators for one invocation
pub trait Backends {
    type Metadata: MetadataSource;
    type Api: Ec2Api;
    type Stack: NetworkStack;

    fn metadata(&self, settings: &Settings) -> crate::error::Result<Self::Metadata>;
    fn api(&self, settings: &Settings) -> Self::Api;
    fn stack(&self, settings: &Settings) -> Self::Stack;
}

/// IMDS, the AWS command line and iproute2
pub struct SystemBackends;

impl Backends for SystemBackends {
    type Metadata = ImdsClient;
    type Api = AwsCli;
    type Stack = IpRoute2;

    fn metadata(&self, settings: &Settings) -> crate::error::Result<ImdsClient> {
        ImdsClient::connect(&settings.metadata_endpoint)
    }

    fn api(&self, settings: &Settings) -> AwsCli {
        AwsCli::new(&settings.aws_cli)
    }

    fn stack(&self, settings: &Settings) -> IpRoute2 {
        IpRoute2::new(&settings.ip_command, &settings.netns_dir)
    }
}

/// Parse the command and its arguments from a variable lookup and stdin bytes
pub fn parse_args_from<F>(var: F, stdin_data: Vec<u8>) -> Result<(Command, CmdArgs)>
where
    F: Fn(&str) -> Option<String>,
{
    let command = var("CNI_COMMAND").context("CNI_COMMAND not found in environment")?;
    let command = Command::parse(command.trim());

    let args = CmdArgs {
        container_id: var("CNI_CONTAINERID").unwrap_or_default(),
        netns: var("CNI_NETNS").unwrap_or_default(),
        ifname: var("CNI_IFNAME").unwrap_or_default(),
        args: parse_cni_args(&var("CNI_ARGS").unwrap_or_default()),
        path: var("CNI_PATH").unwrap_or_default(),
        stdin_data,
    };

    // Only setup needs a container id. Teardown without one has nothing to release.
    if command == Command::Add && args.container_id.is_empty() {
        anyhow::bail!("CNI_CONTAINERID not found in environment");
    }

    Ok((command, args))
}

/// Read the network configuration from stdin
pub fn read_stdin() -> Result<Vec<u8>> {
    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;
    Ok(stdin_data)
}

/// Parse and dispatch one invocation. Unusable arguments produce the error
/// envelope in the caller's version.
pub fn handle<F>(var: F, stdin_data: Vec<u8>, backends: &impl Backends) -> Output
where
    F: Fn(&str) -> Option<String>,
{
    let version = version_hint(&stdin_data);
    match parse_args_from(var, stdin_data) {
        Ok((command, args)) => dispatch(&command, args, backends),
        Err(e) => {
            error!(error = %e, "Unusable invocation");
            Output::error(&version, format!("{:#}", e))
        }
    }
}

/// Best guess at the caller's CNI version, even from a configuration that does not parse
pub fn version_hint(stdin_data: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(stdin_data)
        .ok()
        .and_then(|v| v.get("cniVersion").and_then(|v| v.as_str()).map(str::to_string))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

/// Execute the add command
pub fn cmd_add(conf: NetConf, args: CmdArgs, backends: &impl Backends) -> Output {
    let settings = conf.settings();
    let version = conf.cni_version.clone();

    let result = backends.metadata(&settings).and_then(|metadata| {
        let api = backends.api(&settings);
        let stack = backends.stack(&settings);
        EniPlugin::new(conf, args, &api, &stack).add_network(&metadata)
    });

    match result {
        Ok(value) => Output::success(&value),
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), fatal = e.is_fatal(), "Setup failed");
            Output::error(&version, e.to_string())
        }
    }
}

/// Execute the delete command. Always succeeds.
pub fn cmd_del(conf: NetConf, args: CmdArgs, backends: &impl Backends) -> Output {
    if args.container_id.is_empty() {
        info!("No container id given, nothing to release");
        return Output::success(&pass_through(&conf));
    }

    let settings = conf.settings();
    let api = backends.api(&settings);
    let stack = backends.stack(&settings);

    let plugin = EniPlugin::new(conf, args, &api, &stack);
    let report = plugin.del_network();
    if !report.is_clean() {
        warn!(failures = report.failures.len(), "Teardown incomplete");
    }

    Output::success(&plugin.pass_through())
}

/// Dispatch a parsed invocation
pub fn dispatch(command: &Command, args: CmdArgs, backends: &impl Backends) -> Output {
    if *command == Command::Version {
        return Output::success(&VersionResult::new(&version_hint(&args.stdin_data)));
    }

    let conf = match NetConf::parse(&args.stdin_data) {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = %e, command = %command, "Unusable network configuration");
            return match command {
                Command::Add => Output::error(&version_hint(&args.stdin_data), e.to_string()),
                Command::Del => {
                    warn!(container_id = %args.container_id, "Releasing with whatever configuration could be read");
                    let conf = NetConf::parse_lenient(&args.stdin_data);
                    cmd_del(conf, args, backends)
                }
                _ => Output::empty(),
            };
        }
    };

    info!(command = %command, container_id = %args.container_id, "Handling CNI command");
    match command {
        Command::Add => cmd_add(conf, args, backends),
        Command::Del => cmd_del(conf, args, backends),
        _ => Output::success(&pass_through(&conf)),
    }
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<Output> {
    let stdin_data = read_stdin()?;

    let settings = NetConf::parse(&stdin_data).ok().map(|c| c.settings());
    crate::logging::init(settings.as_ref())?;

    Ok(handle(|name| env::var(name).ok(), stdin_data, &SystemBackends))
}
