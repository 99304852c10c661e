use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fabric_api::fabric::worker_service_server::WorkerService;
use fabric_api::fabric::{
    CancelParticleRequest, CancelParticleResponse, ParticleRequest, ParticleResponse,
};
use fabric_common::{CompiledPlan, PartitionKey};
use tokio::task::AbortHandle;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::executor::ParticleExecutor;

/// Number of particles currently executing, reported as heartbeat load.
#[derive(Debug, Clone, Default)]
pub struct LoadGauge(Arc<AtomicU32>);

impl LoadGauge {
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RunningKey {
    query_id: String,
    partition_key: String,
}

type RunningParticles = Arc<DashMap<RunningKey, (u32, AbortHandle)>>;

/// Tracks one executing particle. Dropping it aborts the execution if still
/// running, which also covers the supervisor hanging up mid-request.
struct RunningParticle {
    key: RunningKey,
    attempt: u32,
    handle: AbortHandle,
    running: RunningParticles,
    load: LoadGauge,
}

impl RunningParticle {
    fn start(
        key: RunningKey,
        attempt: u32,
        handle: AbortHandle,
        running: RunningParticles,
        load: LoadGauge,
    ) -> Self {
        load.0.fetch_add(1, Ordering::SeqCst);
        running.insert(key.clone(), (attempt, handle.clone()));
        Self {
            key,
            attempt,
            handle,
            running,
            load,
        }
    }
}

impl Drop for RunningParticle {
    fn drop(&mut self) {
        self.handle.abort();
        let attempt = self.attempt;
        self.running
            .remove_if(&self.key, |_, (running, _)| *running == attempt);
        self.load.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerServiceImpl {
    worker_id: String,
    executor: Arc<dyn ParticleExecutor>,
    running: RunningParticles,
    load: LoadGauge,
}

impl WorkerServiceImpl {
    pub fn new(worker_id: impl Into<String>, executor: Arc<dyn ParticleExecutor>) -> Self {
        Self {
            worker_id: worker_id.into(),
            executor,
            running: Arc::new(DashMap::new()),
            load: LoadGauge::default(),
        }
    }

    pub fn load_gauge(&self) -> LoadGauge {
        self.load.clone()
    }

    fn failure(&self, request: &ParticleRequest, error: String) -> ParticleResponse {
        warn!(
            worker_id = %self.worker_id,
            query_id = %request.query_id,
            partition = %request.partition_key,
            attempt = request.attempt,
            %error,
            "particle failed"
        );
        ParticleResponse {
            query_id: request.query_id.clone(),
            partition_key: request.partition_key.clone(),
            attempt: request.attempt,
            success: false,
            partial: Vec::new(),
            error,
        }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    async fn execute_particle(
        &self,
        request: Request<ParticleRequest>,
    ) -> Result<Response<ParticleResponse>, Status> {
        let req = request.into_inner();
        let plan = match CompiledPlan::decode(&req.plan) {
            Ok(plan) => plan,
            Err(e) => return Ok(Response::new(self.failure(&req, format!("invalid plan: {e}")))),
        };
        debug!(
            worker_id = %self.worker_id,
            query_id = %req.query_id,
            partition = %req.partition_key,
            attempt = req.attempt,
            "executing particle"
        );

        let executor = Arc::clone(&self.executor);
        let partition = PartitionKey::new(req.partition_key.clone());
        let task = tokio::spawn(async move { executor.execute(&plan, &partition).await });
        let _running = RunningParticle::start(
            RunningKey {
                query_id: req.query_id.clone(),
                partition_key: req.partition_key.clone(),
            },
            req.attempt,
            task.abort_handle(),
            Arc::clone(&self.running),
            self.load.clone(),
        );

        let response = match task.await {
            Ok(Ok(partial)) => {
                let encoded = partial
                    .encode()
                    .map_err(|e| Status::internal(format!("encode partial: {e}")))?;
                ParticleResponse {
                    query_id: req.query_id.clone(),
                    partition_key: req.partition_key.clone(),
                    attempt: req.attempt,
                    success: true,
                    partial: encoded,
                    error: String::new(),
                }
            }
            Ok(Err(e)) => self.failure(&req, e.to_string()),
            Err(e) if e.is_cancelled() => {
                info!(
                    worker_id = %self.worker_id,
                    query_id = %req.query_id,
                    partition = %req.partition_key,
                    "particle cancelled"
                );
                return Err(Status::cancelled("particle cancelled"));
            }
            Err(e) => return Err(Status::internal(format!("particle panicked: {e}"))),
        };
        Ok(Response::new(response))
    }

    async fn cancel_particle(
        &self,
        request: Request<CancelParticleRequest>,
    ) -> Result<Response<CancelParticleResponse>, Status> {
        let req = request.into_inner();
        let key = RunningKey {
            query_id: req.query_id,
            partition_key: req.partition_key,
        };
        // A late cancel for an older attempt must not touch a newer one.
        let attempt = req.attempt;
        let cancelled = match self
            .running
            .remove_if(&key, |_, (running, _)| *running == attempt)
        {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        };
        debug!(
            worker_id = %self.worker_id,
            query_id = %key.query_id,
            partition = %key.partition_key,
            attempt,
            cancelled,
            "cancel requested"
        );
        Ok(Response::new(CancelParticleResponse { cancelled }))
    }
}
