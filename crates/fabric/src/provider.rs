//! Role to container constructor table consulted at startup.

use anyhow::{anyhow, Result};
use fabric_common::{ContainerRole, FabricContainer};
use fabric_coordinator::config::Settings as SupervisorSettings;
use fabric_coordinator::SupervisorContainer;
use fabric_worker::config::Settings as WorkerSettings;
use fabric_worker::WorkerContainer;

/// Builds a container from an optional settings file path.
pub type ContainerConstructor = fn(Option<&str>) -> Result<Box<dyn FabricContainer>>;

pub struct ProviderTable {
    providers: Vec<(ContainerRole, ContainerConstructor)>,
}

impl ProviderTable {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// The supervisor and worker containers shipped with the fabric.
    pub fn builtin() -> Self {
        Self::empty()
            .with(ContainerRole::Supervisor, supervisor)
            .with(ContainerRole::Worker, worker)
    }

    /// Registers `constructor` for `role`, replacing any earlier entry.
    pub fn with(mut self, role: ContainerRole, constructor: ContainerConstructor) -> Self {
        self.providers.retain(|(r, _)| *r != role);
        self.providers.push((role, constructor));
        self
    }

    pub fn resolve(&self, role: ContainerRole) -> Option<ContainerConstructor> {
        self.providers
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, constructor)| *constructor)
    }

    pub fn construct(
        &self,
        role: ContainerRole,
        config: Option<&str>,
    ) -> Result<Box<dyn FabricContainer>> {
        let constructor = self
            .resolve(role)
            .ok_or_else(|| anyhow!("no container provider for role {role}"))?;
        constructor(config)
    }
}

fn supervisor(config: Option<&str>) -> Result<Box<dyn FabricContainer>> {
    let settings = match config {
        Some(path) => SupervisorSettings::from_file(path)?,
        None => SupervisorSettings::new()?,
    };
    Ok(Box::new(SupervisorContainer::new(settings)))
}

fn worker(config: Option<&str>) -> Result<Box<dyn FabricContainer>> {
    let settings = match config {
        Some(path) => WorkerSettings::from_file(path)?,
        None => WorkerSettings::new()?,
    };
    Ok(Box::new(WorkerContainer::new(settings)))
}
