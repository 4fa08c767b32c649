/// Kubelift - single-node Kubernetes in a local VM
///
/// Provisions a VM through an external machine lifecycle command, installs a
/// containerized kubelet over ssh, and polls the cluster API until ready.
mod config;
mod driver;
mod health;
mod orchestrator;
mod provision;
mod remote;
#[cfg(test)]
mod testutil;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ClusterConfig;
use crate::driver::MachineDriver;
use crate::orchestrator::ClusterOrchestrator;
use crate::remote::SshTransport;
use crate::utils::cancel::{cancel_pair, CancelSignal};
use crate::utils::command::check_tool_installed;

#[derive(Parser)]
#[command(name = "kubelift")]
#[command(about = "Run a single-node Kubernetes cluster in a local VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "cluster.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the local Kubernetes cluster, creating the VM if needed
    Start,

    /// Stop the cluster VM
    Stop,

    /// Show cluster status
    Status,

    /// Stop and remove the cluster VM
    Delete,

    /// Generate example configuration file
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kubelift={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Execute command
    let result = match cli.command {
        Commands::Start => start_cluster(&cli).await,
        Commands::Stop => stop_cluster(&cli).await,
        Commands::Status => show_status(&cli).await,
        Commands::Delete => delete_cluster(&cli).await,
        Commands::Init => init_config(&cli).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn build_orchestrator(config: ClusterConfig) -> Result<ClusterOrchestrator> {
    let driver = Arc::new(MachineDriver::new(config.machine.clone()));
    let transport = Arc::new(SshTransport::new());
    ClusterOrchestrator::new(config, driver, transport)
}

/// Wire ctrl-c to a cancellation signal so an interrupted bring-up aborts
/// its current wait instead of hanging
fn ctrl_c_cancel() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, aborting...");
            handle.cancel();
        }
    });
    signal
}

/// Start the local Kubernetes cluster
async fn start_cluster(cli: &Cli) -> Result<()> {
    info!("Starting local Kubernetes cluster...");

    let config = ClusterConfig::from_file(&cli.config).context("Failed to load configuration")?;

    // Check prerequisites
    check_tool_installed(
        &config.machine.command,
        &["--version"],
        "A docker-machine compatible lifecycle tool is required.",
    )
    .await?;
    check_tool_installed("ssh", &["-V"], "An OpenSSH client is required for provisioning.")
        .await?;

    let cluster_name = config.cluster_name.clone();
    let orchestrator = build_orchestrator(config)?;

    let endpoint = orchestrator.start(&ctrl_c_cancel()).await?;

    info!("✓ Cluster is ready");
    info!("");
    info!("Kubernetes is available at {}", endpoint);
    info!("Run this command to use the cluster:");
    info!(
        "  kubectl config set-cluster {} --insecure-skip-tls-verify=true --server={}",
        cluster_name, endpoint
    );

    Ok(())
}

/// Stop the cluster VM
async fn stop_cluster(cli: &Cli) -> Result<()> {
    let config = ClusterConfig::from_file(&cli.config).context("Failed to load configuration")?;

    info!("Stopping cluster: {}", config.cluster_name);

    let orchestrator = build_orchestrator(config)?;
    orchestrator.stop().await?;

    info!("✓ Cluster stopped");

    Ok(())
}

/// Show cluster status
async fn show_status(cli: &Cli) -> Result<()> {
    let config = ClusterConfig::from_file(&cli.config).context("Failed to load configuration")?;

    let cluster_name = config.cluster_name.clone();
    let orchestrator = build_orchestrator(config)?;
    let status = orchestrator.status().await?;

    info!("Cluster: {}", cluster_name);
    info!("  Phase: {}", status.phase);
    match status.vm_state {
        Some(state) => info!("  VM: {}", state),
        None => info!("  VM: not created"),
    }
    if let Some(endpoint) = &status.endpoint {
        info!("  Endpoint: {}", endpoint);
    }
    if let Some(err) = &status.last_error {
        info!("  Last error: {}", err);
    }
    info!("  Since: {}", status.last_transition.to_rfc3339());

    Ok(())
}

/// Stop and remove the cluster VM
async fn delete_cluster(cli: &Cli) -> Result<()> {
    let config = ClusterConfig::from_file(&cli.config).context("Failed to load configuration")?;

    info!("Deleting cluster: {}", config.cluster_name);

    let orchestrator = build_orchestrator(config)?;
    orchestrator.delete().await?;

    info!("✓ Cluster deleted");

    Ok(())
}

/// Initialize example configuration file
async fn init_config(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!(
            "Configuration file already exists: {}",
            cli.config.display()
        );
    }

    let example_config = ClusterConfig::example();
    let yaml = serde_yaml::to_string(&example_config)?;

    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the configuration file to match your requirements");
    info!("  2. Start the cluster:");
    info!("     kubelift start");

    Ok(())
}
