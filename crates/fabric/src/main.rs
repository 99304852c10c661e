use anyhow::Result;
use clap::Parser;
use fabric::provider::ProviderTable;
use fabric::{containers, run_container, Cli, Commands};
use fabric_common::observability::{container_span, init_tracing};
use fabric_common::ContainerRole;
use tracing::Instrument;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let cli = Cli::parse();

    let (role, config) = match cli.command {
        Commands::Containers { supervisor } => return containers::execute(&supervisor).await,
        Commands::Supervisor { config } => (ContainerRole::Supervisor, config),
        Commands::Worker { config } => (ContainerRole::Worker, config),
    };

    let container = ProviderTable::builtin().construct(role, config.as_deref())?;
    let span = container_span(role.as_label(), container.id());
    run_container(container).instrument(span).await
}
