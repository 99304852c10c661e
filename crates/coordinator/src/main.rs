use fabric_common::observability::{container_span, init_tracing};
use fabric_common::FabricContainer;
use fabric_coordinator::config::Settings;
use fabric_coordinator::SupervisorContainer;
use tokio::signal;
use tracing::{info, Instrument};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing("info");

    let settings = Settings::new()?;
    let mut supervisor = SupervisorContainer::new(settings);
    let span = container_span("supervisor", supervisor.id());

    async move {
        supervisor.boot().await?;
        signal::ctrl_c().await?;
        info!("received ctrl-c");
        supervisor.shutdown().await
    }
    .instrument(span)
    .await
}
