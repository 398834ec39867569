use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use warden::config::CoordinatorConfig;
use warden::coordinator::Coordinator;
use warden::runner::CommandRunner;
use warden::runset::{FileRunSet, RunSet};
use warden::shutdown::install_shutdown_handler;
use warden::store::lease::LeaseStore;
use warden::store::liveness::LivenessRegistry;

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Lease-based failover coordinator for singleton background automations")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the coordinator daemon on this instance
    Run(RunArgs),

    /// Mark a resource as running; whichever instance wins the lease executes it
    Start {
        #[command(flatten)]
        store: StoreArgs,

        /// Resource identifier
        resource: String,

        /// Shell command the resource's job executes
        #[arg(long)]
        target: String,
    },

    /// Clear a resource's running flag; its current holder stops within a poll
    Stop {
        #[command(flatten)]
        store: StoreArgs,

        /// Resource identifier
        resource: String,
    },

    /// Show leases, instance liveness, and the running set
    Status {
        #[command(flatten)]
        store: StoreArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Print the trailing log lines of a resource
    Logs {
        #[command(flatten)]
        store: StoreArgs,

        /// Resource identifier
        resource: String,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Directory holding the shared coordination tables
    #[arg(long, default_value = "./warden-data")]
    data_dir: PathBuf,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Directory for this instance's identity and origin ledger
    /// (defaults to the data directory; give each instance its own
    /// when several share a host)
    #[arg(long)]
    instance_dir: Option<PathBuf>,

    /// Lease time-to-live in seconds
    #[arg(long, default_value = "20")]
    lease_ttl: u64,

    /// Seconds between poll ticks
    #[arg(long, default_value = "3")]
    poll_interval: u64,

    /// Seconds between liveness heartbeats
    #[arg(long, default_value = "5")]
    liveness_interval: u64,

    /// Liveness record time-to-live in seconds
    #[arg(long, default_value = "20")]
    liveness_ttl: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Daemon
// =============================================================================

async fn run_daemon(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = CoordinatorConfig::new(&args.store.data_dir)
        .with_lease_ttl(Duration::from_secs(args.lease_ttl))
        .with_poll_interval(Duration::from_secs(args.poll_interval))
        .with_liveness(
            Duration::from_secs(args.liveness_interval),
            Duration::from_secs(args.liveness_ttl),
        );
    if let Some(dir) = args.instance_dir {
        config = config.with_instance_dir(dir);
    }

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.instance_dir)?;

    let runset: Arc<dyn RunSet> = Arc::new(FileRunSet::open(&config.data_dir)?);
    let runner = Arc::new(CommandRunner::new(runset.clone()));
    let coordinator = Coordinator::new(config, runset, runner)?;

    let shutdown = install_shutdown_handler();
    coordinator.run(shutdown).await;
    Ok(())
}

// =============================================================================
// Status Output
// =============================================================================

#[derive(Serialize)]
struct StatusReport {
    leases: Vec<warden::store::lease::Lease>,
    instances: Vec<warden::store::liveness::LivenessRecord>,
    resources: Vec<warden::runset::ResourceSpec>,
}

fn show_status(store: &StoreArgs, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let leases = LeaseStore::open(&store.data_dir)?;
    let liveness = LivenessRegistry::open(&store.data_dir)?;
    let runset = FileRunSet::open(&store.data_dir)?;

    let report = StatusReport {
        leases: leases.snapshot()?,
        instances: liveness.snapshot()?,
        resources: runset.resources()?,
    };

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            println!("RESOURCES");
            println!("{:<24} {:<8} TARGET", "RESOURCE", "RUNNING");
            for spec in &report.resources {
                println!(
                    "{:<24} {:<8} {}",
                    spec.resource_id, spec.running, spec.target
                );
            }

            println!();
            println!("LEASES");
            println!("{:<24} {:<38} {:<8} EXPIRES", "RESOURCE", "HOLDER", "STATE");
            for lease in &report.leases {
                let state = if lease.is_expired() { "expired" } else { "held" };
                println!(
                    "{:<24} {:<38} {:<8} {}",
                    lease.resource_id,
                    lease.holder_id,
                    state,
                    lease.expires_at.format("%Y-%m-%d %H:%M:%S")
                );
            }

            println!();
            println!("INSTANCES");
            println!("{:<38} {:<10} {:<8} HEARTBEAT", "INSTANCE", "ROLE", "ALIVE");
            for record in &report.instances {
                println!(
                    "{:<38} {:<10} {:<8} {}",
                    record.instance_id,
                    record.role,
                    record.is_alive(),
                    record.heartbeat_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_daemon(run_args).await?;
        }
        Commands::Start {
            store,
            resource,
            target,
        } => {
            let runset = FileRunSet::open(&store.data_dir)?;
            runset.upsert(warden::runset::ResourceSpec {
                resource_id: resource.clone(),
                running: true,
                target,
            })?;
            println!("resource {resource} marked running");
        }
        Commands::Stop { store, resource } => {
            let runset = FileRunSet::open(&store.data_dir)?;
            runset.set_running(&resource, false)?;
            println!("resource {resource} marked stopped");
        }
        Commands::Status { store, output } => {
            show_status(&store, output)?;
        }
        Commands::Logs { store, resource } => {
            let runset = FileRunSet::open(&store.data_dir)?;
            for line in runset.read_log(&resource)? {
                println!("{line}");
            }
        }
    }

    Ok(())
}
