//! Cluster control CLI
//!
//! Submits VMs, follows submission tasks and drives migrations and
//! lifecycle commands against a group manager.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cluster, vms};
use std::path::PathBuf;
use std::time::Duration;

/// Cluster control CLI
#[derive(Parser)]
#[command(name = "clusterctl")]
#[command(author, version, about = "CLI for the VM cluster group manager", long_about = None)]
pub struct Cli {
    /// Group manager URL (can also be set via CLUSTERCTL_API_URL env var)
    #[arg(long, env = "CLUSTERCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show group manager state and host counts
    Status,

    /// List registered local controllers
    Hosts {
        /// Also list the VMs on each host
        #[arg(long)]
        vms: bool,
    },

    /// Trigger a consolidation pass
    Reconfigure,

    /// VM submission and lifecycle commands
    #[command(subcommand)]
    Vms(VmCommands),

    /// Save default settings to the config file
    Configure {
        /// Default group manager URL
        #[arg(long)]
        api_url: Option<String>,

        /// Default output format
        #[arg(long)]
        default_format: Option<output::OutputFormat>,
    },
}

#[derive(Subcommand)]
pub enum VmCommands {
    /// Submit VMs for placement
    Submit {
        /// JSON file with the VM templates
        #[arg(long, conflicts_with = "vm")]
        file: Option<PathBuf>,

        /// VM id when submitting a single VM
        #[arg(long, required_unless_present = "file")]
        vm: Option<String>,

        #[arg(long, default_value_t = 1.0)]
        cpu: f64,

        #[arg(long, default_value_t = 1.0)]
        memory: f64,

        #[arg(long, default_value_t = 0.0)]
        net_rx: f64,

        #[arg(long, default_value_t = 0.0)]
        net_tx: f64,

        /// Bind the VM to a local controller
        #[arg(long)]
        host: Option<String>,

        /// Wait for the placement task to finish
        #[arg(long)]
        wait: bool,

        /// Seconds to wait with --wait
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Show a submission task
    Task {
        /// Task ID
        id: String,

        /// Remove the task once it has finished
        #[arg(long)]
        take: bool,
    },

    /// Migrate a VM between local controllers
    Migrate {
        /// VM ID
        vm: String,

        /// Source local controller
        #[arg(long)]
        from: String,

        /// Destination local controller
        #[arg(long)]
        to: String,

        /// URL of the destination group manager when it is not this one
        #[arg(long)]
        to_group_manager: Option<String>,
    },

    /// Send a lifecycle command to a VM
    Control {
        /// Hosting local controller
        local_controller: String,

        /// VM ID
        vm: String,

        #[arg(value_enum)]
        command: vms::VmCommand,
    },

    /// Change a VM's requested capacity
    Resize {
        /// Hosting local controller
        local_controller: String,

        /// VM ID
        vm: String,

        #[arg(long)]
        cpu: f64,

        #[arg(long)]
        memory: f64,

        #[arg(long, default_value_t = 0.0)]
        net_rx: f64,

        #[arg(long, default_value_t = 0.0)]
        net_tx: f64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = config::Config::load()?;

    let command = match cli.command {
        Commands::Configure {
            api_url,
            default_format,
        } => {
            if let Some(url) = api_url {
                url::Url::parse(&url)?;
                config.api_url = Some(url);
            }
            if let Some(format) = default_format {
                config.default_format = Some(format!("{:?}", format).to_lowercase());
            }
            config.save()?;
            output::print_success("Configuration saved");
            return Ok(());
        }
        command => command,
    };

    let format = config.format(cli.format);
    let client = client::ApiClient::new(&config.api_url(cli.api_url))?;

    match command {
        Commands::Status => cluster::show_status(&client, format).await?,
        Commands::Hosts { vms } => cluster::list_hosts(&client, vms, format).await?,
        Commands::Reconfigure => cluster::reconfigure(&client, format).await?,
        Commands::Configure { .. } => {}
        Commands::Vms(vm_cmd) => match vm_cmd {
            VmCommands::Submit {
                file,
                vm,
                cpu,
                memory,
                net_rx,
                net_tx,
                host,
                wait,
                timeout,
            } => {
                let request = match (file, vm) {
                    (Some(path), _) => vms::load_submission(&path)?,
                    (None, Some(id)) => vms::VmSpec {
                        id,
                        cpu,
                        memory,
                        net_rx,
                        net_tx,
                        host,
                    }
                    .into(),
                    (None, None) => anyhow::bail!("Either --file or --vm is required"),
                };
                vms::submit(&client, request, wait, Duration::from_secs(timeout), format).await?;
            }
            VmCommands::Task { id, take } => vms::show_task(&client, &id, take, format).await?,
            VmCommands::Migrate {
                vm,
                from,
                to,
                to_group_manager,
            } => {
                let destination = to_group_manager
                    .as_deref()
                    .map(client::ApiClient::new)
                    .transpose()?;
                vms::migrate(&client, &vm, &from, &to, destination.as_ref(), format).await?;
            }
            VmCommands::Control {
                local_controller,
                vm,
                command,
            } => vms::control(&client, &local_controller, &vm, command, format).await?,
            VmCommands::Resize {
                local_controller,
                vm,
                cpu,
                memory,
                net_rx,
                net_tx,
            } => {
                let capacity = client::ResourceVector {
                    cpu,
                    memory,
                    net_rx,
                    net_tx,
                };
                vms::resize(&client, &local_controller, &vm, capacity, format).await?;
            }
        },
    }

    Ok(())
}
