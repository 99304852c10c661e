//! The worker as a fabric container: serves particles and keeps itself
//! registered with the supervisor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use fabric_api::fabric as pb;
use fabric_api::fabric::supervisor_service_client::SupervisorServiceClient;
use fabric_api::fabric::worker_service_server::WorkerServiceServer;
use fabric_common::{BoxError, ContainerDescriptor, ContainerRole, FabricContainer};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tonic::transport::{Channel, Server};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Result, WorkerError};
use crate::executor::{DatasetExecutor, ParticleExecutor};
use crate::service::{LoadGauge, WorkerServiceImpl};

type SupervisorClient = SupervisorServiceClient<Channel>;

pub async fn run_worker_server(
    service: WorkerServiceImpl,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    info!(%addr, "worker gRPC server starting");
    Server::builder()
        .add_service(WorkerServiceServer::new(service))
        .serve_with_shutdown(addr, async {
            shutdown.await.ok();
            info!(%addr, "worker received shutdown signal");
        })
        .await
        .map_err(|e| WorkerError::Internal(format!("Worker gRPC server failed: {e}")))
}

fn registration_backoff(max_elapsed: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(max_elapsed),
        ..ExponentialBackoff::default()
    }
}

async fn connect_with_backoff(address: &str, max_elapsed: Duration) -> Result<SupervisorClient> {
    retry(registration_backoff(max_elapsed), || async {
        debug!(%address, "connecting to supervisor");
        SupervisorServiceClient::connect(address.to_string())
            .await
            .map_err(|e| {
                warn!(%address, error = %e, "failed to connect to supervisor, retrying");
                backoff::Error::transient(WorkerError::ClientConnection(e))
            })
    })
    .await
    .map_err(|e| {
        error!(%address, error = %e, "giving up connecting to supervisor");
        WorkerError::ConnectionFailed
    })
}

async fn register_with_backoff(
    client: &SupervisorClient,
    descriptor: &pb::ContainerDescriptor,
    max_elapsed: Duration,
) -> Result<()> {
    retry(registration_backoff(max_elapsed), || {
        let mut client = client.clone();
        let descriptor = descriptor.clone();
        async move {
            match client.register_container(descriptor).await {
                Ok(ack) if ack.get_ref().accepted => Ok(()),
                Ok(ack) => Err(backoff::Error::permanent(WorkerError::RegistrationRejected(
                    ack.into_inner().message,
                ))),
                Err(e) => {
                    warn!(error = %e, "registration attempt failed, retrying");
                    Err(backoff::Error::transient(WorkerError::RpcError(e)))
                }
            }
        }
    })
    .await
    .map_err(|e| match e {
        WorkerError::RegistrationRejected(_) => e,
        _ => WorkerError::RegistrationFailed,
    })
}

/// Heartbeats every `period`. A heartbeat answered with `ok = false` means
/// the supervisor evicted or forgot this worker, so it registers again.
async fn heartbeat_loop(
    mut client: SupervisorClient,
    supervisor_address: String,
    descriptor: pb::ContainerDescriptor,
    load: LoadGauge,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let heartbeat = pb::HeartbeatInfo {
            container_id: descriptor.id.clone(),
            load: load.current(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        match client.send_heartbeat(heartbeat).await {
            Ok(response) if response.get_ref().ok => {
                debug!(container_id = %descriptor.id, load = load.current(), "heartbeat sent");
            }
            Ok(_) => {
                warn!(container_id = %descriptor.id, "supervisor no longer knows this worker, re-registering");
                match client.register_container(descriptor.clone()).await {
                    Ok(ack) if ack.get_ref().accepted => {
                        info!(container_id = %descriptor.id, "re-registered with supervisor");
                    }
                    Ok(ack) => {
                        warn!(container_id = %descriptor.id, message = %ack.get_ref().message, "re-registration rejected");
                    }
                    Err(e) => warn!(container_id = %descriptor.id, error = %e, "re-registration failed"),
                }
            }
            Err(e) => {
                warn!(container_id = %descriptor.id, error = %e, "heartbeat failed, reconnecting");
                match SupervisorServiceClient::connect(supervisor_address.clone()).await {
                    Ok(new_client) => client = new_client,
                    Err(e) => {
                        warn!(container_id = %descriptor.id, error = %e, "failed to reconnect heartbeat client");
                    }
                }
            }
        }
    }
}

pub struct WorkerContainer {
    id: String,
    settings: Settings,
    executor: Arc<dyn ParticleExecutor>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<()>>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl WorkerContainer {
    /// A worker serving the dataset declared in `settings`.
    pub fn new(settings: Settings) -> Self {
        let executor = Arc::new(DatasetExecutor::from_dataset(&settings.dataset));
        let id = settings
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        Self {
            id,
            settings,
            executor,
            shutdown_tx: None,
            server: None,
            heartbeat: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ParticleExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn descriptor(&self) -> ContainerDescriptor {
        ContainerDescriptor::worker(
            self.id.clone(),
            self.settings.advertised_address(),
            self.settings.capacity,
        )
    }

    /// Waits for the server task to exit on its own.
    pub async fn wait(&mut self) -> std::result::Result<(), BoxError> {
        match self.server.take() {
            Some(server) => Ok(server.await??),
            None => Ok(()),
        }
    }

    async fn stop_server(&mut self) -> std::result::Result<(), BoxError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.server.take() {
            Some(server) => Ok(server.await??),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FabricContainer for WorkerContainer {
    fn role(&self) -> ContainerRole {
        ContainerRole::Worker
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn boot(&mut self) -> std::result::Result<(), BoxError> {
        if self.server.is_some() {
            return Ok(());
        }
        let addr = self.settings.worker_server_address()?;
        let service = WorkerServiceImpl::new(self.id.clone(), Arc::clone(&self.executor));
        let load = service.load_gauge();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.server = Some(tokio::spawn(run_worker_server(service, addr, shutdown_rx)));

        let timeout = self.settings.registration_timeout();
        let descriptor = pb::ContainerDescriptor::from(&self.descriptor());
        let registered = async {
            let client = connect_with_backoff(&self.settings.supervisor_address, timeout).await?;
            register_with_backoff(&client, &descriptor, timeout).await?;
            Ok::<_, WorkerError>(client)
        }
        .await;
        let client = match registered {
            Ok(client) => client,
            Err(e) => {
                error!(container_id = %self.id, error = %e, "worker failed to join the fabric");
                self.stop_server().await?;
                return Err(e.into());
            }
        };
        info!(
            container_id = %self.id,
            supervisor = %self.settings.supervisor_address,
            capacity = self.settings.capacity,
            "worker registered with supervisor"
        );

        self.heartbeat = Some(tokio::spawn(heartbeat_loop(
            client,
            self.settings.supervisor_address.clone(),
            descriptor,
            load,
            self.settings.heartbeat_interval(),
        )));
        Ok(())
    }

    async fn shutdown(&mut self) -> std::result::Result<(), BoxError> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.stop_server().await?;
        info!(container_id = %self.id, "worker container stopped");
        Ok(())
    }
}
