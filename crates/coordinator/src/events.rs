//! Fabric-wide change notifications.
//!
//! Query drivers subscribe to these to learn when it is worth retrying
//! deferred particles and when a worker holding particles has been evicted.

use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    ContainerRegistered { container_id: String },
    /// A suspect container heartbeated again and is eligible for work.
    ContainerRecovered { container_id: String },
    ContainerSuspect { container_id: String },
    /// A container was declared dead and removed. Particles assigned to
    /// that registration of it must be reassigned.
    ContainerEvicted { container_id: String, generation: u64 },
    /// A dispatch slot was released somewhere in the fabric.
    CapacityAvailable,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FabricEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn publish(&self, event: FabricEvent) {
        // No subscribers simply means no query is waiting.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
