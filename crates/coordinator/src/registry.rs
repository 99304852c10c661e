//! Container Registry: the live membership of the fabric.
//!
//! All reads and writes go through one lock so that dispatch decisions see a
//! consistent snapshot of health and load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use fabric_common::{ContainerDescriptor, ContainerHealth, ContainerRole};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, Result};
use crate::events::{EventBus, FabricEvent};

/// Registry view of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub descriptor: ContainerDescriptor,
    /// Particles currently running on the container, as last reported.
    pub load: u32,
    pub health: ContainerHealth,
    pub missed_heartbeats: u32,
    /// Distinguishes successive registrations under the same id.
    pub generation: u64,
    heartbeat_since_sweep: bool,
}

impl Container {
    fn new(descriptor: ContainerDescriptor, generation: u64) -> Self {
        Self {
            descriptor,
            generation,
            load: 0,
            health: ContainerHealth::Healthy,
            missed_heartbeats: 0,
            heartbeat_since_sweep: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn address(&self) -> &str {
        &self.descriptor.address
    }

    pub fn capacity(&self) -> u32 {
        self.descriptor.capacity
    }
}

/// How many consecutive missed heartbeats move a container along
/// `healthy -> suspect -> dead`.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPolicy {
    pub suspect_after: u32,
    pub dead_after: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            suspect_after: 1,
            dead_after: 3,
        }
    }
}

pub struct ContainerRegistry {
    containers: Mutex<HashMap<String, Container>>,
    next_generation: AtomicU64,
    policy: HeartbeatPolicy,
    events: EventBus,
}

impl ContainerRegistry {
    pub fn new(policy: HeartbeatPolicy, events: EventBus) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            policy,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn register(&self, descriptor: ContainerDescriptor) -> Result<()> {
        let mut containers = self.containers.lock().await;
        if containers.contains_key(&descriptor.id) {
            warn!(container_id = %descriptor.id, "rejecting duplicate registration");
            return Err(CoordinatorError::DuplicateId(descriptor.id));
        }
        let id = descriptor.id.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        info!(
            container_id = %id,
            role = %descriptor.role,
            address = %descriptor.address,
            capacity = descriptor.capacity,
            generation,
            "registered container"
        );
        containers.insert(id.clone(), Container::new(descriptor, generation));
        drop(containers);
        self.events
            .publish(FabricEvent::ContainerRegistered { container_id: id });
        Ok(())
    }

    pub async fn heartbeat(&self, id: &str, load: u32) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::UnknownContainer(id.to_string()))?;
        container.load = load;
        container.missed_heartbeats = 0;
        container.heartbeat_since_sweep = true;
        let recovered = container.health == ContainerHealth::Suspect;
        if recovered {
            container.health = ContainerHealth::Healthy;
        }
        drop(containers);
        debug!(container_id = %id, load, "heartbeat");
        if recovered {
            info!(container_id = %id, "container recovered");
            self.events.publish(FabricEvent::ContainerRecovered {
                container_id: id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn mark_suspect(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::UnknownContainer(id.to_string()))?;
        if container.health == ContainerHealth::Healthy {
            container.health = ContainerHealth::Suspect;
            drop(containers);
            warn!(container_id = %id, "container suspect");
            self.events.publish(FabricEvent::ContainerSuspect {
                container_id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Declares the container dead and evicts it.
    pub async fn mark_dead(&self, id: &str) -> Result<()> {
        let removed = self.containers.lock().await.remove(id);
        match removed {
            Some(container) => {
                self.announce_eviction(id, container.generation);
                Ok(())
            }
            None => Err(CoordinatorError::UnknownContainer(id.to_string())),
        }
    }

    /// Healthy workers with at least `min_capacity` declared capacity,
    /// ordered by ascending load and then id.
    pub async fn list_healthy(&self, min_capacity: u32) -> Vec<Container> {
        let containers = self.containers.lock().await;
        let mut healthy: Vec<Container> = containers
            .values()
            .filter(|c| c.descriptor.role == ContainerRole::Worker)
            .filter(|c| c.health == ContainerHealth::Healthy)
            .filter(|c| c.capacity() >= min_capacity)
            .cloned()
            .collect();
        drop(containers);
        healthy.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id().cmp(b.id())));
        healthy
    }

    pub async fn get(&self, id: &str) -> Option<Container> {
        self.containers.lock().await.get(id).cloned()
    }

    /// Every registered container, ordered by id.
    pub async fn snapshot(&self) -> Vec<Container> {
        let mut all: Vec<Container> = self.containers.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub async fn len(&self) -> usize {
        self.containers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Runs once per heartbeat interval. Every container that did not
    /// heartbeat since the previous sweep accrues a miss; the returned ids are
    /// the containers evicted by this sweep.
    pub async fn sweep(&self) -> Vec<String> {
        let mut suspects = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut containers = self.containers.lock().await;
            for container in containers.values_mut() {
                if container.heartbeat_since_sweep {
                    container.heartbeat_since_sweep = false;
                    continue;
                }
                container.missed_heartbeats += 1;
                if container.missed_heartbeats >= self.policy.dead_after {
                    container.health = ContainerHealth::Dead;
                    evicted.push((container.id().to_string(), container.generation));
                } else if container.missed_heartbeats >= self.policy.suspect_after
                    && container.health == ContainerHealth::Healthy
                {
                    container.health = ContainerHealth::Suspect;
                    suspects.push(container.id().to_string());
                }
            }
            for (id, _) in &evicted {
                containers.remove(id);
            }
        }
        for id in suspects {
            warn!(container_id = %id, "container suspect after missed heartbeats");
            self.events
                .publish(FabricEvent::ContainerSuspect { container_id: id });
        }
        evicted.sort();
        for (id, generation) in &evicted {
            self.announce_eviction(id, *generation);
        }
        evicted.into_iter().map(|(id, _)| id).collect()
    }

    /// Removes every container. Used when the supervisor shuts down.
    pub async fn drain(&self) -> usize {
        let mut containers = self.containers.lock().await;
        let drained = containers.len();
        containers.clear();
        drained
    }

    fn announce_eviction(&self, id: &str, generation: u64) {
        warn!(container_id = %id, generation, "evicted dead container");
        self.events.publish(FabricEvent::ContainerEvicted {
            container_id: id.to_string(),
            generation,
        });
    }
}
