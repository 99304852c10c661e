//! Dispatcher: places particles on workers and sends them without waiting
//! for the remote response.
//!
//! Two bounds apply to every send: a fabric-wide in-flight cap and a
//! per-worker cap equal to the worker's declared capacity. Both are held as
//! semaphore permits for the life of the send, so a slot is released however
//! the send ends, including abort.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fabric_common::{CatalogLookup, ParticleError, PartialResult, PartitionKey};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, FabricEvent};
use crate::registry::{Container, ContainerRegistry};
use crate::transport::{ParticleAssignment, WorkerEndpoint, WorkerTransport};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub global_inflight_limit: usize,
    pub min_worker_capacity: u32,
    pub particle_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            global_inflight_limit: 256,
            min_worker_capacity: 1,
            particle_timeout: Duration::from_secs(30),
        }
    }
}

/// A request to place one particle attempt.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub query_id: String,
    pub partition_key: PartitionKey,
    pub attempt: u32,
    pub plan: Arc<Vec<u8>>,
    /// Worker to avoid, normally the one that failed the previous attempt.
    pub exclude: Option<String>,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Sent; the response arrives later on the response channel.
    Accepted(Assignment),
    /// Healthy workers exist but every eligible slot is taken.
    Deferred,
    /// No healthy worker meets the minimum capacity.
    NoCapacity,
}

#[derive(Debug)]
pub struct Assignment {
    pub worker_id: String,
    /// Registry generation of the worker the particle was sent to.
    pub generation: u64,
    /// Aborts the in-flight send, releasing its slots.
    pub handle: AbortHandle,
}

/// A worker's answer to one particle attempt, tagged with that attempt.
#[derive(Debug)]
pub struct ParticleResponse {
    pub partition_key: PartitionKey,
    pub attempt: u32,
    pub worker_id: String,
    pub outcome: Result<PartialResult, ParticleError>,
}

struct WorkerSlots {
    capacity: u32,
    semaphore: Arc<Semaphore>,
}

impl WorkerSlots {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
        }
    }

    fn in_flight(&self) -> u32 {
        let available = u32::try_from(self.semaphore.available_permits()).unwrap_or(u32::MAX);
        self.capacity.saturating_sub(available)
    }
}

/// Dispatch slots held by one send. Dropping it frees the slots and tells
/// waiting queries that capacity is available.
struct SlotGuard {
    permits: Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)>,
    events: EventBus,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        drop(self.permits.take());
        self.events.publish(FabricEvent::CapacityAvailable);
    }
}

pub struct Dispatcher {
    registry: Arc<ContainerRegistry>,
    catalog: Arc<dyn CatalogLookup>,
    transport: Arc<dyn WorkerTransport>,
    events: EventBus,
    global_slots: Arc<Semaphore>,
    worker_slots: DashMap<String, WorkerSlots>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        catalog: Arc<dyn CatalogLookup>,
        transport: Arc<dyn WorkerTransport>,
        config: DispatcherConfig,
    ) -> Self {
        let events = registry.events().clone();
        Self {
            registry,
            catalog,
            transport,
            events,
            global_slots: Arc::new(Semaphore::new(config.global_inflight_limit)),
            worker_slots: DashMap::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.events.subscribe()
    }

    /// Number of sends currently holding a global slot.
    pub fn in_flight(&self) -> usize {
        self.config
            .global_inflight_limit
            .saturating_sub(self.global_slots.available_permits())
    }

    /// Picks a worker for the particle and sends it. The response is
    /// delivered on `responses`; this call never waits for it.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        responses: mpsc::UnboundedSender<ParticleResponse>,
    ) -> DispatchOutcome {
        let candidates = self
            .registry
            .list_healthy(self.config.min_worker_capacity)
            .await;
        if candidates.is_empty() {
            debug!(partition = %request.partition_key, "no healthy worker with capacity");
            return DispatchOutcome::NoCapacity;
        }

        let Ok(global) = Arc::clone(&self.global_slots).try_acquire_owned() else {
            debug!(partition = %request.partition_key, "global in-flight cap reached");
            return DispatchOutcome::Deferred;
        };

        let pool = self.rank(&request, candidates);
        let Some((target, worker_permit)) = self.reserve(&pool) else {
            debug!(partition = %request.partition_key, "every eligible worker is saturated");
            return DispatchOutcome::Deferred;
        };

        let worker_id = target.id().to_string();
        let generation = target.generation;
        let endpoint = WorkerEndpoint {
            id: worker_id.clone(),
            address: target.address().to_string(),
        };
        let guard = SlotGuard {
            permits: Some((global, worker_permit)),
            events: self.events.clone(),
        };
        info!(
            query_id = %request.query_id,
            partition = %request.partition_key,
            attempt = request.attempt,
            worker_id = %worker_id,
            "dispatching particle"
        );

        let transport = Arc::clone(&self.transport);
        let timeout = self.config.particle_timeout;
        let handle = tokio::spawn(async move {
            let assignment = ParticleAssignment {
                query_id: request.query_id.clone(),
                partition_key: request.partition_key.clone(),
                attempt: request.attempt,
                plan: request.plan,
            };
            let outcome =
                match tokio::time::timeout(timeout, transport.execute_particle(&endpoint, assignment))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let message =
                            format!("no response from {} within {:?}", endpoint.id, timeout);
                        let cancel_transport = Arc::clone(&transport);
                        let cancel_endpoint = endpoint.clone();
                        let query_id = request.query_id.clone();
                        let key = request.partition_key.clone();
                        let attempt = request.attempt;
                        tokio::spawn(async move {
                            let _ = cancel_transport
                                .cancel_particle(&cancel_endpoint, &query_id, &key, attempt)
                                .await;
                        });
                        Err(ParticleError::timed_out(message))
                    }
                };
            // Free the slots before reporting so the reassignment can use them.
            drop(guard);
            let _ = responses.send(ParticleResponse {
                partition_key: request.partition_key,
                attempt: request.attempt,
                worker_id: endpoint.id,
                outcome,
            });
        });

        DispatchOutcome::Accepted(Assignment {
            worker_id,
            generation,
            handle: handle.abort_handle(),
        })
    }

    /// Sends a best-effort cancellation of one particle attempt to the worker
    /// running it. Returns immediately.
    pub fn cancel_remote(
        &self,
        worker_id: &str,
        query_id: &str,
        partition_key: &PartitionKey,
        attempt: u32,
    ) {
        let registry = Arc::clone(&self.registry);
        let transport = Arc::clone(&self.transport);
        let worker_id = worker_id.to_string();
        let query_id = query_id.to_string();
        let key = partition_key.clone();
        tokio::spawn(async move {
            let Some(container) = registry.get(&worker_id).await else {
                return;
            };
            let endpoint = WorkerEndpoint {
                id: worker_id,
                address: container.address().to_string(),
            };
            if let Err(e) = transport
                .cancel_particle(&endpoint, &query_id, &key, attempt)
                .await
            {
                debug!(worker_id = %endpoint.id, partition = %key, attempt, error = %e, "cancel not delivered");
            }
        });
    }

    /// Drops the slot accounting of an evicted worker.
    pub fn forget_worker(&self, worker_id: &str) {
        if self.worker_slots.remove(worker_id).is_some() {
            debug!(%worker_id, "released slot accounting for worker");
        }
    }

    /// Orders the candidate workers for this request: the excluded worker is
    /// dropped unless it is the only one left, catalog-hinted workers come
    /// first, then the least loaded.
    fn rank(&self, request: &DispatchRequest, candidates: Vec<Container>) -> Vec<Container> {
        let mut pool: Vec<Container> = match &request.exclude {
            Some(excluded) => {
                let others: Vec<Container> = candidates
                    .iter()
                    .filter(|c| c.id() != excluded)
                    .cloned()
                    .collect();
                if others.is_empty() {
                    warn!(
                        partition = %request.partition_key,
                        worker_id = %excluded,
                        "only the excluded worker is available, reusing it"
                    );
                    candidates
                } else {
                    others
                }
            }
            None => candidates,
        };

        let hinted: HashSet<String> = self
            .catalog
            .locate(&request.partition_key)
            .into_iter()
            .map(|hint| hint.container_id)
            .collect();
        pool.sort_by_key(|c| {
            let in_flight = self
                .worker_slots
                .get(c.id())
                .map(|slots| slots.in_flight())
                .unwrap_or(0);
            (
                !hinted.contains(c.id()),
                c.load.saturating_add(in_flight),
                c.id().to_string(),
            )
        });
        pool
    }

    fn reserve(&self, pool: &[Container]) -> Option<(Container, OwnedSemaphorePermit)> {
        for container in pool {
            let semaphore = {
                let mut slots = self
                    .worker_slots
                    .entry(container.id().to_string())
                    .or_insert_with(|| WorkerSlots::new(container.capacity()));
                if slots.capacity != container.capacity() {
                    // Re-registered with a different capacity.
                    *slots = WorkerSlots::new(container.capacity());
                }
                Arc::clone(&slots.semaphore)
            };
            if let Ok(permit) = semaphore.try_acquire_owned() {
                return Some((container.clone(), permit));
            }
        }
        None
    }
}
