//! Containers are the processes that make up the fabric.
//!
//! There is a single descriptor type carrying a role tag. Role specific
//! behaviour lives behind the [`FabricContainer`] trait, implemented by the
//! supervisor and worker crates and chosen from the role at startup.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerRole {
    Supervisor,
    Worker,
}

impl ContainerRole {
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for ContainerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Liveness as judged from heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerHealth {
    Healthy,
    /// Missed at least one heartbeat; not eligible for new work.
    Suspect,
    /// Missed enough heartbeats to be evicted.
    Dead,
}

impl fmt::Display for ContainerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Suspect => write!(f, "suspect"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// What a container announces about itself in the registration handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub id: String,
    pub role: ContainerRole,
    pub address: String,
    /// Maximum number of particles the container runs concurrently.
    pub capacity: u32,
}

impl ContainerDescriptor {
    pub fn worker(id: impl Into<String>, address: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            role: ContainerRole::Worker,
            address: address.into(),
            capacity,
        }
    }
}

/// Lifecycle shared by every container process.
#[async_trait]
pub trait FabricContainer: Send {
    fn role(&self) -> ContainerRole;

    fn id(&self) -> &str;

    /// Starts serving. Returns once the container is up; background work keeps
    /// running until [`FabricContainer::shutdown`].
    async fn boot(&mut self) -> Result<(), BoxError>;

    /// Drains and stops the container.
    async fn shutdown(&mut self) -> Result<(), BoxError>;
}
