use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use eni_cni::commands::{Backends, SystemBackends};
use eni_cni::config::{NetConf, NetConfList, Settings};
use eni_cni::plugin::EniPlugin;
use eni_cni::state::{self, Response, WorkDir};
use eni_cni::types::CmdArgs;

/// A command line tool to inspect and clean up ENI CNI state
#[derive(Parser)]
#[command(name = "eni-cni-ctl", author, version, about)]
struct Cli {
    /// Root of the per-container working directories
    #[arg(long, default_value = "/var/lib/cni/eni")]
    state_dir: PathBuf,

    /// Directory holding named namespace handles
    #[arg(long, default_value = "/var/run/netns")]
    netns_dir: PathBuf,

    /// AWS command line binary
    #[arg(long, default_value = "aws")]
    aws_cli: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every container with a recorded interface
    Status,

    /// Print the record of one container
    Show {
        /// Container ID
        #[arg(long)]
        container_id: String,

        /// Also print the stored provider responses
        #[arg(long)]
        raw: bool,
    },

    /// Detach and delete a container's interface and remove its handle
    Release {
        /// Container ID
        #[arg(long)]
        container_id: String,
    },

    /// Generate a network configuration list chaining this plugin
    Generate {
        /// Network name
        #[arg(long, default_value = "eni-network")]
        name: String,

        /// CNI version
        #[arg(long, default_value = "1.0.0")]
        cni_version: String,

        /// JSON file with the primary plugin's configuration
        #[arg(long)]
        primary: Option<PathBuf>,

        /// Security group for new interfaces (repeatable)
        #[arg(long = "security-group")]
        security_groups: Vec<String>,

        /// Tag for new interfaces (key=value, repeatable)
        #[arg(long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Invalid key=value format: {}", s),
    }
}

fn settings(cli: &Cli) -> Settings {
    Settings {
        state_dir: cli.state_dir.clone(),
        netns_dir: cli.netns_dir.clone(),
        aws_cli: cli.aws_cli.clone(),
        ..Settings::default()
    }
}

fn release(cli: &Cli, container_id: &str) -> Result<()> {
    let settings = settings(cli);
    let api = SystemBackends.api(&settings);
    let stack = SystemBackends.stack(&settings);

    let args = CmdArgs {
        container_id: container_id.to_string(),
        ..Default::default()
    };
    let plugin = EniPlugin::new(NetConf::new_default("eni-cni-ctl", "1.0.0"), args, &api, &stack)
        .with_settings(settings);

    let report = plugin.del_network();
    println!("{}", report.summary());
    if let Some(interface_id) = &report.leaked_interface {
        anyhow::bail!("Interface {} is still allocated", interface_id);
    }
    if !report.is_clean() {
        anyhow::bail!("Release incomplete");
    }
    Ok(())
}

fn generate(
    name: &str,
    cni_version: &str,
    primary: Option<&PathBuf>,
    security_groups: &[String],
    tags: &[(String, String)],
) -> Result<NetConfList> {
    let primary = match primary {
        Some(path) => {
            let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => serde_json::json!({
            "type": "bridge",
            "bridge": "cni0",
            "isGateway": true,
            "ipMasq": true,
            "ipam": {"type": "host-local", "subnet": "10.22.0.0/16"}
        }),
    };

    let mut eni = NetConf::new_default(name, cni_version);
    if !security_groups.is_empty() {
        eni.security_groups = Some(security_groups.to_vec());
    }
    if !tags.is_empty() {
        eni.tags = Some(tags.iter().cloned().collect::<BTreeMap<_, _>>());
    }

    Ok(NetConfList::chained(name, primary, &eni)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "warn" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set default subscriber")?;

    match &cli.command {
        Commands::Status => {
            let records = state::list_records(&cli.state_dir)?;
            if records.is_empty() {
                println!("No recorded interfaces under {}", cli.state_dir.display());
            }
            for (path, record) in records {
                println!("  {} ({}):", record.container_id, path.display());
                println!("    Interface: {} ({})", record.interface_id, record.mac_address);
                println!("    Region: {}", record.region);
                match (&record.attachment_id, record.device_index) {
                    (Some(attachment), Some(index)) => println!("    Attachment: {} at device index {}", attachment, index),
                    (Some(attachment), None) => println!("    Attachment: {}", attachment),
                    _ => println!("    Attachment: none"),
                }
                if let Some(link) = &record.link_name {
                    println!("    Host link: {}", link);
                }
            }
        }

        Commands::Show { container_id, raw } => {
            let work_dir = WorkDir::for_container(&cli.state_dir, container_id)?;
            match work_dir.load_record()? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("No record for container {}", container_id),
            }
            if *raw {
                for kind in Response::ALL {
                    if let Some(body) = work_dir.read_response(kind) {
                        println!("--- {}", kind.file_name());
                        println!("{}", body.trim_end());
                    }
                }
            }
        }

        Commands::Release { container_id } => release(&cli, container_id)?,

        Commands::Generate {
            name,
            cni_version,
            primary,
            security_groups,
            tags,
            output,
        } => {
            let config = generate(name, cni_version, primary.as_ref(), security_groups, tags)?;
            let config_json = serde_json::to_string_pretty(&config)?;

            if let Some(path) = output {
                config.save(path)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", config_json);
            }
        }
    }

    Ok(())
}
