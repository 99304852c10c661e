//! Conversions between the protobuf messages and the shared domain types.

use fabric_api::fabric as pb;

use crate::container::{ContainerDescriptor, ContainerHealth, ContainerRole};
use crate::error::CommonError;

impl From<ContainerRole> for pb::ContainerRole {
    fn from(role: ContainerRole) -> Self {
        match role {
            ContainerRole::Supervisor => pb::ContainerRole::Supervisor,
            ContainerRole::Worker => pb::ContainerRole::Worker,
        }
    }
}

impl TryFrom<pb::ContainerRole> for ContainerRole {
    type Error = CommonError;

    fn try_from(role: pb::ContainerRole) -> Result<Self, Self::Error> {
        match role {
            pb::ContainerRole::Supervisor => Ok(ContainerRole::Supervisor),
            pb::ContainerRole::Worker => Ok(ContainerRole::Worker),
            pb::ContainerRole::Unspecified => Err(CommonError::UnknownRole(role as i32)),
        }
    }
}

impl From<ContainerHealth> for pb::ContainerHealth {
    fn from(health: ContainerHealth) -> Self {
        match health {
            ContainerHealth::Healthy => pb::ContainerHealth::Healthy,
            ContainerHealth::Suspect => pb::ContainerHealth::Suspect,
            ContainerHealth::Dead => pb::ContainerHealth::Dead,
        }
    }
}

impl From<&ContainerDescriptor> for pb::ContainerDescriptor {
    fn from(descriptor: &ContainerDescriptor) -> Self {
        pb::ContainerDescriptor {
            id: descriptor.id.clone(),
            role: pb::ContainerRole::from(descriptor.role) as i32,
            address: descriptor.address.clone(),
            capacity: descriptor.capacity,
        }
    }
}

impl TryFrom<pb::ContainerDescriptor> for ContainerDescriptor {
    type Error = CommonError;

    fn try_from(msg: pb::ContainerDescriptor) -> Result<Self, Self::Error> {
        let role = pb::ContainerRole::try_from(msg.role)
            .map_err(|_| CommonError::UnknownRole(msg.role))?;
        if msg.id.is_empty() {
            return Err(CommonError::MissingField("id"));
        }
        Ok(ContainerDescriptor {
            id: msg.id,
            role: ContainerRole::try_from(role)?,
            address: msg.address,
            capacity: msg.capacity,
        })
    }
}
