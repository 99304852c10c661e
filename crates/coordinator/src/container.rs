//! The supervisor as a fabric container: gRPC server plus the background
//! heartbeat sweep and result pruning loops.

use std::sync::Arc;

use async_trait::async_trait;
use fabric_api::fabric::supervisor_service_server::SupervisorServiceServer;
use fabric_common::{BoxError, CatalogLookup, ContainerRole, FabricContainer, MemoryCatalog};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tonic::transport::Server;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{CoordinatorError, Result};
use crate::service::SupervisorServiceImpl;
use crate::supervisor::Coordinator;
use crate::transport::GrpcWorkerTransport;

/// Serves the supervisor API until `shutdown` fires, then cancels running
/// queries and drains the registry.
pub async fn run_server(
    settings: Settings,
    coordinator: Arc<Coordinator>,
    shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let addr = settings.server_address()?;
    let sweeper = spawn_sweep_loop(Arc::clone(&coordinator), &settings);
    let pruner = spawn_prune_loop(Arc::clone(&coordinator), &settings);

    info!(%addr, "supervisor listening");
    let served = Server::builder()
        .add_service(SupervisorServiceServer::new(SupervisorServiceImpl::new(
            Arc::clone(&coordinator),
        )))
        .serve_with_shutdown(addr, async {
            let _ = shutdown.await;
            info!("shutting down supervisor gracefully");
        })
        .await;

    sweeper.abort();
    pruner.abort();
    coordinator.shutdown().await;
    served.map_err(CoordinatorError::from)
}

fn spawn_sweep_loop(coordinator: Arc<Coordinator>, settings: &Settings) -> JoinHandle<()> {
    let period = settings.heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = coordinator.sweep_containers().await;
            if !evicted.is_empty() {
                warn!(?evicted, "heartbeat sweep evicted containers");
            }
        }
    })
}

fn spawn_prune_loop(coordinator: Arc<Coordinator>, settings: &Settings) -> JoinHandle<()> {
    let period = settings.prune_interval();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            coordinator.prune_expired();
        }
    })
}

pub struct SupervisorContainer {
    id: String,
    settings: Settings,
    catalog: Arc<dyn CatalogLookup>,
    coordinator: Option<Arc<Coordinator>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<()>>>,
}

impl SupervisorContainer {
    pub fn new(settings: Settings) -> Self {
        Self {
            id: format!("supervisor-{}", Uuid::new_v4()),
            settings,
            catalog: Arc::new(MemoryCatalog::new()),
            coordinator: None,
            shutdown_tx: None,
            server: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogLookup>) -> Self {
        self.catalog = catalog;
        self
    }

    /// The running coordinator; `None` before boot.
    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    /// Waits for the server task to exit on its own.
    pub async fn wait(&mut self) -> std::result::Result<(), BoxError> {
        match self.server.take() {
            Some(server) => Ok(server.await??),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FabricContainer for SupervisorContainer {
    fn role(&self) -> ContainerRole {
        ContainerRole::Supervisor
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn boot(&mut self) -> std::result::Result<(), BoxError> {
        if self.server.is_some() {
            return Ok(());
        }
        // Fail fast on a bad address instead of inside the server task.
        self.settings.server_address()?;

        let coordinator = Arc::new(Coordinator::new(
            &self.settings,
            Arc::clone(&self.catalog),
            Arc::new(GrpcWorkerTransport::new()),
        ));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = tokio::spawn(run_server(
            self.settings.clone(),
            Arc::clone(&coordinator),
            shutdown_rx,
        ));
        info!(container_id = %self.id, "supervisor container booted");

        self.coordinator = Some(coordinator);
        self.shutdown_tx = Some(shutdown_tx);
        self.server = Some(server);
        Ok(())
    }

    async fn shutdown(&mut self) -> std::result::Result<(), BoxError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await? {
                error!(error = %e, "supervisor server exited with error");
                return Err(e.into());
            }
        }
        info!(container_id = %self.id, "supervisor container stopped");
        Ok(())
    }
}
