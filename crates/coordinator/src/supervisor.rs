//! Supervisor Coordinator: accepts compiled plans and drives each query from
//! partitioning to its final result or structured failure.
//!
//! Every query runs on its own driver task. The driver owns the query's
//! [`ExecutionTracker`], so particle state is never shared between tasks;
//! queries only contend on the registry and on dispatch slots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fabric_common::{CatalogLookup, CompiledPlan, PartitionKey, QueryResult};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator;
use crate::config::Settings;
use crate::dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig, ParticleResponse};
use crate::error::{CoordinatorError, Result};
use crate::events::{EventBus, FabricEvent};
use crate::partitioner;
use crate::query::{QueryStatus, StructuredFailure};
use crate::registry::{Container, ContainerRegistry, HeartbeatPolicy};
use crate::tracker::{ExecutionTracker, InFlight, ResponseOutcome};
use crate::transport::WorkerTransport;

/// Latest status of a query plus the moment it reached a terminal state.
#[derive(Debug, Clone)]
struct StatusSnapshot {
    status: QueryStatus,
    finished_at: Option<Instant>,
}

struct QueryHandle {
    status: watch::Receiver<StatusSnapshot>,
    cancel: watch::Sender<bool>,
}

pub struct Coordinator {
    registry: Arc<ContainerRegistry>,
    dispatcher: Arc<Dispatcher>,
    queries: DashMap<String, QueryHandle>,
    retry_limit: u32,
    default_deadline: Duration,
    result_retention: Duration,
}

impl Coordinator {
    /// Creates the process-wide registry and dispatcher from `settings`.
    pub fn new(
        settings: &Settings,
        catalog: Arc<dyn CatalogLookup>,
        transport: Arc<dyn WorkerTransport>,
    ) -> Self {
        let registry = Arc::new(ContainerRegistry::new(
            HeartbeatPolicy {
                suspect_after: settings.suspect_after_missed,
                dead_after: settings.dead_after_missed,
            },
            EventBus::new(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            catalog,
            transport,
            DispatcherConfig {
                global_inflight_limit: settings.global_inflight_limit,
                min_worker_capacity: settings.min_worker_capacity,
                particle_timeout: settings.particle_timeout(),
            },
        ));
        Self {
            registry,
            dispatcher,
            queries: DashMap::new(),
            retry_limit: settings.retry_limit,
            default_deadline: settings.default_deadline(),
            result_retention: settings.result_retention(),
        }
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Decodes a bincode plan and submits it. See [`Coordinator::submit_plan`].
    pub async fn submit(&self, plan_bytes: &[u8], deadline: Option<Duration>) -> Result<String> {
        let plan = CompiledPlan::decode(plan_bytes)?;
        self.submit_plan(plan, deadline).await
    }

    /// Starts a query and returns its id without waiting for it. A plan with
    /// no partitions is rejected outright and never becomes a query.
    pub async fn submit_plan(
        &self,
        plan: CompiledPlan,
        deadline: Option<Duration>,
    ) -> Result<String> {
        let plan = Arc::new(plan);
        let particles = partitioner::partition(&plan)?;
        let plan_bytes = Arc::new(plan.encode()?);
        let query_id = Uuid::new_v4().to_string();
        let budget = deadline
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_deadline);

        let tracker = ExecutionTracker::new(
            query_id.clone(),
            Arc::clone(&plan),
            particles,
            self.retry_limit,
            Instant::now() + budget,
        );
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            status: QueryStatus::Running(tracker.progress()),
            finished_at: None,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        let driver = QueryDriver {
            events: self.dispatcher.subscribe(),
            tracker,
            dispatcher: Arc::clone(&self.dispatcher),
            plan_bytes,
            handles: HashMap::new(),
            responses_tx,
            responses_rx,
            cancel: cancel_rx,
            status: status_tx,
        };
        self.queries.insert(
            query_id.clone(),
            QueryHandle {
                status: status_rx,
                cancel: cancel_tx,
            },
        );
        info!(
            %query_id,
            signature = %plan.signature,
            partitions = plan.partition_count(),
            combine = %plan.combine,
            deadline_ms = budget.as_millis() as u64,
            "query accepted"
        );
        let span = info_span!("query", %query_id);
        tokio::spawn(driver.run().instrument(span));
        Ok(query_id)
    }

    /// Runs a plan to completion: the merged result, or a failure naming the
    /// partitions that never completed.
    pub async fn execute(
        &self,
        plan: CompiledPlan,
        deadline: Option<Duration>,
    ) -> Result<std::result::Result<QueryResult, StructuredFailure>> {
        let query_id = self.submit_plan(plan, deadline).await?;
        match self.wait(&query_id).await? {
            QueryStatus::Succeeded(result) => Ok(Ok(result.as_ref().clone())),
            QueryStatus::Failed(failure) => Ok(Err(failure)),
            QueryStatus::Running(_) => Err(CoordinatorError::Internal(format!(
                "query {query_id} stopped without a terminal status"
            ))),
        }
    }

    /// Current status; never waits.
    pub fn get_result(&self, query_id: &str) -> Result<QueryStatus> {
        self.queries
            .get(query_id)
            .map(|handle| handle.status.borrow().status.clone())
            .ok_or_else(|| CoordinatorError::QueryNotFound(query_id.to_string()))
    }

    /// Waits until the query reaches a terminal status.
    pub async fn wait(&self, query_id: &str) -> Result<QueryStatus> {
        let mut status = self
            .queries
            .get(query_id)
            .map(|handle| handle.status.clone())
            .ok_or_else(|| CoordinatorError::QueryNotFound(query_id.to_string()))?;
        loop {
            {
                let snapshot = status.borrow_and_update();
                if snapshot.status.is_terminal() {
                    return Ok(snapshot.status.clone());
                }
            }
            if status.changed().await.is_err() {
                return Ok(status.borrow().status.clone());
            }
        }
    }

    /// Requests cancellation. Returns false if the query had already
    /// finished.
    pub fn cancel(&self, query_id: &str) -> Result<bool> {
        let handle = self
            .queries
            .get(query_id)
            .ok_or_else(|| CoordinatorError::QueryNotFound(query_id.to_string()))?;
        if handle.status.borrow().status.is_terminal() {
            return Ok(false);
        }
        let _ = handle.cancel.send(true);
        info!(%query_id, "query cancellation requested");
        Ok(true)
    }

    pub async fn list_containers(&self) -> Vec<Container> {
        self.registry.snapshot().await
    }

    /// One heartbeat sweep over the registry. Evicted workers are dropped
    /// from dispatch accounting; their queries reassign on the eviction
    /// event, or on the registry check that follows a lagged event stream.
    pub async fn sweep_containers(&self) -> Vec<String> {
        let evicted = self.registry.sweep().await;
        for id in &evicted {
            self.dispatcher.forget_worker(id);
        }
        evicted
    }

    /// Forgets finished queries older than the retention window.
    pub fn prune_expired(&self) -> usize {
        let retention = self.result_retention;
        let before = self.queries.len();
        self.queries.retain(|_, handle| match handle.status.borrow().finished_at {
            Some(finished_at) => finished_at.elapsed() < retention,
            None => true,
        });
        let pruned = before.saturating_sub(self.queries.len());
        if pruned > 0 {
            debug!(pruned, "pruned finished queries");
        }
        pruned
    }

    /// Cancels every running query and drains the registry.
    pub async fn shutdown(&self) {
        let mut cancelled = 0usize;
        for handle in self.queries.iter() {
            if !handle.status.borrow().status.is_terminal() {
                let _ = handle.cancel.send(true);
                cancelled += 1;
            }
        }
        let drained = self.registry.drain().await;
        info!(cancelled, drained, "coordinator shut down");
    }
}

/// Drives one query until it reaches a terminal state.
struct QueryDriver {
    tracker: ExecutionTracker,
    dispatcher: Arc<Dispatcher>,
    plan_bytes: Arc<Vec<u8>>,
    handles: HashMap<PartitionKey, AbortHandle>,
    responses_tx: mpsc::UnboundedSender<ParticleResponse>,
    responses_rx: mpsc::UnboundedReceiver<ParticleResponse>,
    events: broadcast::Receiver<FabricEvent>,
    cancel: watch::Receiver<bool>,
    status: watch::Sender<StatusSnapshot>,
}

impl QueryDriver {
    async fn run(mut self) {
        self.dispatch_pending().await;
        self.publish();

        let expiry = tokio::time::sleep_until(self.tracker.deadline());
        tokio::pin!(expiry);
        let mut events_open = true;

        while !self.tracker.state().is_terminal() {
            tokio::select! {
                () = &mut expiry => {
                    warn!("query deadline passed");
                    let in_flight = self.tracker.expire();
                    self.release(in_flight);
                }
                Some(response) = self.responses_rx.recv() => {
                    self.on_response(response);
                    self.dispatch_pending().await;
                }
                event = self.events.recv(), if events_open => {
                    match event {
                        Ok(FabricEvent::ContainerEvicted { container_id, generation }) => {
                            self.on_container_lost(&container_id, generation);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "fabric events dropped, checking workers against the registry");
                            self.resync_lost_workers().await;
                        }
                        Err(RecvError::Closed) => events_open = false,
                    }
                    self.dispatch_pending().await;
                }
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        let in_flight = self.tracker.cancel("query cancelled");
                        self.release(in_flight);
                    }
                }
            }
            self.publish();
        }

        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
        self.finish();
    }

    fn on_response(&mut self, response: ParticleResponse) {
        let key = response.partition_key.clone();
        match self.tracker.on_response(response) {
            Ok((ResponseOutcome::Stale, _)) => {}
            Ok((_, in_flight)) => {
                self.handles.remove(&key);
                self.release(in_flight);
            }
            Err(e) => error!(partition = %key, error = %e, "rejected particle response"),
        }
    }

    /// Evictions may have been among the dropped events. Any worker holding
    /// a particle whose registration is gone is treated as evicted.
    async fn resync_lost_workers(&mut self) {
        let registry = Arc::clone(self.dispatcher.registry());
        for (container_id, generation) in self.tracker.dispatched_workers() {
            let current = registry.get(&container_id).await.map(|c| c.generation);
            if current != Some(generation) {
                self.on_container_lost(&container_id, generation);
            }
        }
    }

    fn on_container_lost(&mut self, container_id: &str, generation: u64) {
        match self.tracker.on_container_lost(container_id, generation) {
            Ok((lost, in_flight)) => {
                for key in &lost {
                    if let Some(handle) = self.handles.remove(key) {
                        handle.abort();
                    }
                }
                if !lost.is_empty() {
                    info!(%container_id, particles = lost.len(), "reassigning particles of evicted container");
                }
                self.release(in_flight);
            }
            Err(e) => error!(%container_id, error = %e, "failed to reassign particles"),
        }
    }

    /// Offers every pending particle to the dispatcher. Particles that
    /// cannot be placed stay pending until the next fabric event.
    async fn dispatch_pending(&mut self) {
        for key in self.tracker.pending_keys() {
            let request = match self.tracker.dispatch_request(&key, &self.plan_bytes) {
                Ok(request) => request,
                Err(e) => {
                    error!(partition = %key, error = %e, "cannot build dispatch request");
                    continue;
                }
            };
            let attempt = request.attempt;
            match self
                .dispatcher
                .dispatch(request, self.responses_tx.clone())
                .await
            {
                DispatchOutcome::Accepted(assignment) => {
                    if let Err(e) =
                        self.tracker
                            .mark_dispatched(
                                &key,
                                attempt,
                                &assignment.worker_id,
                                assignment.generation,
                            )
                    {
                        error!(partition = %key, error = %e, "dispatch not recorded");
                        assignment.handle.abort();
                        continue;
                    }
                    self.handles.insert(key, assignment.handle);
                }
                DispatchOutcome::Deferred => {
                    debug!(partition = %key, "particle deferred");
                }
                DispatchOutcome::NoCapacity => {
                    debug!("no healthy worker available, waiting for registry change");
                    break;
                }
            }
        }
    }

    /// Aborts local sends and asks workers to drop particles that were in
    /// flight when the query stopped.
    fn release(&mut self, in_flight: Vec<InFlight>) {
        for particle in in_flight {
            if let Some(handle) = self.handles.remove(&particle.partition_key) {
                handle.abort();
            }
            self.dispatcher.cancel_remote(
                &particle.worker_id,
                self.tracker.query_id(),
                &particle.partition_key,
                particle.attempt,
            );
        }
    }

    fn publish(&self) {
        if self.tracker.state().is_terminal() {
            return;
        }
        let progress = self.tracker.progress();
        self.status.send_modify(|snapshot| {
            snapshot.status = QueryStatus::Running(progress);
        });
    }

    fn finish(&mut self) {
        let status = match self.tracker.failure() {
            Some(failure) => QueryStatus::Failed(failure.clone()),
            None => match aggregator::aggregate(self.tracker.execution()) {
                Ok(result) => {
                    info!(
                        particles = result.metrics.particle_count,
                        attempts = result.metrics.attempts,
                        wall_time_ms = result.metrics.wall_time_ms,
                        "query succeeded"
                    );
                    QueryStatus::Succeeded(Arc::new(result))
                }
                Err(e) => {
                    error!(error = %e, "aggregation failed");
                    self.tracker.fail_internal(e.to_string());
                    match self.tracker.failure() {
                        Some(failure) => QueryStatus::Failed(failure.clone()),
                        None => return,
                    }
                }
            },
        };
        self.status.send_replace(StatusSnapshot {
            status,
            finished_at: Some(Instant::now()),
        });
    }
}
