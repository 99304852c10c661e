use fabric_common::observability::{container_span, init_tracing};
use fabric_common::FabricContainer;
use fabric_worker::config::Settings;
use fabric_worker::WorkerContainer;
use tokio::signal;
use tracing::{info, Instrument};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing("info");

    let settings = Settings::new()?;
    let mut worker = WorkerContainer::new(settings);
    let span = container_span("worker", worker.id());

    async move {
        worker.boot().await?;
        let exited = tokio::select! {
            result = worker.wait() => Some(result),
            _ = signal::ctrl_c() => None,
        };
        match exited {
            Some(result) => result,
            None => {
                info!("received ctrl-c");
                worker.shutdown().await
            }
        }
    }
    .instrument(span)
    .await
}
