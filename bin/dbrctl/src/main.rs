//! ---
//! dbr_section: "05-networking-external-interfaces"
//! dbr_subsection: "binary"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Control CLI driving Data Broker backend clusters through their lifecycle."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dbr_common::{init_tracing, DbrConfig};

mod cluster;
mod node;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Data Broker cluster control utility",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        default_value_t = ChannelKind::Reentrant,
        global = true,
        help = "How node processes are controlled"
    )]
    channel: ChannelKind,

    #[command(flatten)]
    hosts: HostArgs,

    #[arg(long, global = true, help = "Print Prometheus metrics after the command")]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the host allocation comes from.
#[derive(Debug, Clone, Args)]
pub struct HostArgs {
    /// Host file to read instead of the scheduler-provided one.
    #[arg(long, value_name = "FILE", global = true, conflicts_with = "hosts")]
    pub hostfile: Option<PathBuf>,

    /// Explicit host list (repeatable) instead of a host file.
    #[arg(long = "hosts", value_name = "HOST", global = true, value_delimiter = ',')]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelKind {
    /// Re-enter this binary on each host through the configured remote-exec prefix.
    Reentrant,
    /// Run node processes on this machine.
    Local,
    /// In-process simulation; no processes are started.
    Simulated,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Launch every node, wait for convergence, and form the cluster")]
    Start,
    #[command(about = "Shut every node down")]
    Stop,
    #[command(about = "Snapshot every node and wait for completion")]
    Save,
    #[command(about = "Reload every node from its dump file")]
    Restore,
    #[command(about = "Probe every allocated node and report readiness")]
    Status,
    #[command(about = "Print the effective configuration as JSON")]
    Config,
    #[command(hide = true)]
    LaunchAllNodes,
    #[command(hide = true)]
    LaunchOneNode(node::NodeArgs),
    #[command(hide = true)]
    SaveOneNode(node::NodeArgs),
    #[command(hide = true)]
    RestoreOneNode(node::NodeArgs),
    #[command(hide = true)]
    ShutdownOneNode(node::NodeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("dbr.toml"));
    candidates.push(PathBuf::from("/etc/dbr/dbr.toml"));
    let loaded = DbrConfig::load_or_default(&candidates)?;
    init_tracing("dbrctl", &loaded.config.logging).context("failed to initialise logging")?;
    if let Some(source) = &loaded.source {
        tracing::info!(config_path = %source.display(), "configuration loaded");
    }
    let config = loaded.config;

    let context = cluster::CommandContext::new(config, cli.channel, cli.hosts.clone());
    match cli.command {
        Commands::Start => cluster::start(&context).await?,
        Commands::Stop => cluster::stop(&context).await?,
        Commands::Save => cluster::save(&context).await?,
        Commands::Restore => cluster::restore(&context).await?,
        Commands::Status => cluster::status(&context).await?,
        Commands::Config => cluster::print_config(&context)?,
        Commands::LaunchAllNodes => cluster::launch_all(&context).await?,
        Commands::LaunchOneNode(args) => {
            node::run(&context, &args, dbr_orchestrator::SingleNodeAction::Launch).await?
        }
        Commands::SaveOneNode(args) => {
            node::run(&context, &args, dbr_orchestrator::SingleNodeAction::Save).await?
        }
        Commands::RestoreOneNode(args) => {
            node::run(&context, &args, dbr_orchestrator::SingleNodeAction::Restore).await?
        }
        Commands::ShutdownOneNode(args) => {
            node::run(&context, &args, dbr_orchestrator::SingleNodeAction::Shutdown).await?
        }
    }

    if cli.print_metrics {
        println!("{}", dbr_metrics::render(&context.registry)?);
    }
    Ok(())
}
