//! Splits a compiled plan into particles, one per declared partition.

use std::sync::Arc;

use fabric_common::CompiledPlan;

use crate::error::{CoordinatorError, Result};
use crate::query::Particle;

/// Returns one pending particle per partition key, ordered by key so that
/// retries of the same plan replay in the same order.
pub fn partition(plan: &Arc<CompiledPlan>) -> Result<Vec<Particle>> {
    if plan.partitions.is_empty() {
        return Err(CoordinatorError::EmptyPlan);
    }
    Ok(plan
        .partitions
        .iter()
        .map(|key| Particle::new(Arc::clone(plan), key.clone()))
        .collect())
}
