//! Command-line entry point for the fabric.
//!
//! - `fabric supervisor` runs the supervisor container
//! - `fabric worker` runs a worker container
//! - `fabric containers` lists what a running supervisor has registered

pub mod containers;
pub mod provider;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use fabric_common::FabricContainer;
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fabric")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the supervisor container.
    Supervisor {
        /// Settings file; falls back to FABRIC_SUPERVISOR_CONFIG.
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Run a worker container.
    Worker {
        /// Settings file; falls back to FABRIC_WORKER_CONFIG.
        #[arg(short, long)]
        config: Option<String>,
    },
    /// List the containers registered with a supervisor.
    Containers {
        #[arg(long, env = "FABRIC_SUPERVISOR_ADDRESS", default_value = "http://127.0.0.1:50051")]
        supervisor: String,
    },
}

/// Boots `container`, then shuts it down on ctrl-c.
pub async fn run_container(mut container: Box<dyn FabricContainer>) -> Result<()> {
    container.boot().await.map_err(|e| anyhow!(e))?;
    info!(role = %container.role(), container_id = container.id(), "container running");
    signal::ctrl_c().await?;
    info!("received ctrl-c");
    container.shutdown().await.map_err(|e| anyhow!(e))
}
