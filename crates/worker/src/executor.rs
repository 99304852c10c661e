//! Particle execution on the worker.
//!
//! A [`ParticleExecutor`] scans one partition for a plan and returns the
//! partial result in the shape the plan's combine strategy expects.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use fabric_common::{CombineStrategy, CompiledPlan, PartialResult, PartitionKey, ResultValue, Row};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("partition {0} is not served by this worker")]
    UnknownPartition(PartitionKey),

    #[error("{strategy} over partition {partition} overflowed")]
    Overflow {
        partition: PartitionKey,
        strategy: CombineStrategy,
    },
}

#[async_trait]
pub trait ParticleExecutor: Send + Sync {
    async fn execute(
        &self,
        plan: &CompiledPlan,
        partition: &PartitionKey,
    ) -> Result<PartialResult, ExecutionError>;
}

/// Executes particles against rows held in memory, one row set per partition.
#[derive(Debug, Default, Clone)]
pub struct DatasetExecutor {
    partitions: HashMap<PartitionKey, Vec<Row>>,
}

impl DatasetExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dataset(dataset: &HashMap<String, Vec<Row>>) -> Self {
        let partitions = dataset
            .iter()
            .map(|(key, rows)| (PartitionKey::new(key.clone()), rows.clone()))
            .collect();
        Self { partitions }
    }

    pub fn with_partition(mut self, key: impl Into<PartitionKey>, rows: Vec<Row>) -> Self {
        self.partitions.insert(key.into(), rows);
        self
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.partitions.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ParticleExecutor for DatasetExecutor {
    async fn execute(
        &self,
        plan: &CompiledPlan,
        partition: &PartitionKey,
    ) -> Result<PartialResult, ExecutionError> {
        let started = Instant::now();
        let rows = self
            .partitions
            .get(partition)
            .ok_or_else(|| ExecutionError::UnknownPartition(partition.clone()))?;

        let value = match plan.combine {
            CombineStrategy::Sum => {
                let sum = rows
                    .iter()
                    .try_fold(0i64, |acc, row| acc.checked_add(row.value))
                    .ok_or_else(|| ExecutionError::Overflow {
                        partition: partition.clone(),
                        strategy: plan.combine,
                    })?;
                ResultValue::Scalar(Some(sum))
            }
            CombineStrategy::Count => {
                ResultValue::Scalar(Some(i64::try_from(rows.len()).unwrap_or(i64::MAX)))
            }
            CombineStrategy::Min => ResultValue::Scalar(rows.iter().map(|r| r.value).min()),
            CombineStrategy::Max => ResultValue::Scalar(rows.iter().map(|r| r.value).max()),
            CombineStrategy::Concat => ResultValue::Rows(rows.clone()),
            CombineStrategy::TopK { k } => {
                let mut top = rows.clone();
                top.sort_by(|a, b| {
                    Reverse(a.value)
                        .cmp(&Reverse(b.value))
                        .then_with(|| a.label.cmp(&b.label))
                });
                top.truncate(k);
                ResultValue::Rows(top)
            }
        };
        Ok(PartialResult::new(value).with_scan(rows.len() as u64, started.elapsed()))
    }
}
