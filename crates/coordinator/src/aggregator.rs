//! Aggregator: merges the partial results of a finished query.
//!
//! Every strategy is commutative and associative, so the merged value does
//! not depend on the order in which particles completed. Ordered
//! concatenation gets there by sorting on partition key before it joins.

use std::cmp::Reverse;

use fabric_common::{
    CombineStrategy, ExecutionMetrics, PartialResult, PartitionKey, QueryResult, ResultValue, Row,
};
use thiserror::Error;

use crate::query::{ParticleState, QueryExecution};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    /// Aggregation was requested before every particle succeeded.
    #[error("aggregation requested with {} partitions incomplete", .pending.len())]
    IncompleteResult { pending: Vec<PartitionKey> },

    #[error("partial result for partition {partition} does not fit strategy {strategy}")]
    StrategyMismatch {
        partition: PartitionKey,
        strategy: CombineStrategy,
    },

    #[error("{strategy} overflowed 64-bit range")]
    Overflow { strategy: CombineStrategy },
}

pub type Result<T> = std::result::Result<T, AggregateError>;

/// Merges partial results with `strategy`.
pub fn combine(
    strategy: CombineStrategy,
    partials: Vec<(PartitionKey, PartialResult)>,
) -> Result<ResultValue> {
    if let Some((partition, _)) = partials.iter().find(|(_, p)| !p.value.fits(strategy)) {
        return Err(AggregateError::StrategyMismatch {
            partition: partition.clone(),
            strategy,
        });
    }

    match strategy {
        CombineStrategy::Sum | CombineStrategy::Count => {
            let total: i128 = scalars(&partials).map(i128::from).sum();
            i64::try_from(total)
                .map(|v| ResultValue::Scalar(Some(v)))
                .map_err(|_| AggregateError::Overflow { strategy })
        }
        CombineStrategy::Min => Ok(ResultValue::Scalar(scalars(&partials).min())),
        CombineStrategy::Max => Ok(ResultValue::Scalar(scalars(&partials).max())),
        CombineStrategy::Concat => {
            let mut partials = partials;
            partials.sort_by(|(a, _), (b, _)| a.cmp(b));
            Ok(ResultValue::Rows(
                partials.into_iter().flat_map(|(_, p)| rows(p)).collect(),
            ))
        }
        CombineStrategy::TopK { k } => {
            let mut merged: Vec<Row> = partials.into_iter().flat_map(|(_, p)| rows(p)).collect();
            merged.sort_by(|a, b| {
                Reverse(a.value)
                    .cmp(&Reverse(b.value))
                    .then_with(|| a.label.cmp(&b.label))
            });
            merged.truncate(k);
            Ok(ResultValue::Rows(merged))
        }
    }
}

/// Builds the final result of a query whose particles have all succeeded.
pub fn aggregate(execution: &QueryExecution) -> Result<QueryResult> {
    let pending: Vec<PartitionKey> = execution
        .particles
        .values()
        .filter(|p| p.state != ParticleState::Succeeded || p.partial.is_none())
        .map(|p| p.partition_key.clone())
        .collect();
    if !pending.is_empty() {
        return Err(AggregateError::IncompleteResult { pending });
    }

    let mut metrics = ExecutionMetrics {
        particle_count: execution.particles.len() as u32,
        ..ExecutionMetrics::default()
    };
    let mut partials = Vec::with_capacity(execution.particles.len());
    for particle in execution.particles.values() {
        let Some(partial) = particle.partial.clone() else {
            continue;
        };
        metrics.attempts += particle.attempt;
        metrics.rows_scanned += partial.rows_scanned;
        metrics.scan_time_us += partial.scan_time_us;
        partials.push((particle.partition_key.clone(), partial));
    }
    metrics.wall_time_ms =
        u64::try_from(execution.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

    let value = combine(execution.plan.combine, partials)?;
    Ok(QueryResult { value, metrics })
}

fn scalars(partials: &[(PartitionKey, PartialResult)]) -> impl Iterator<Item = i64> + '_ {
    partials.iter().filter_map(|(_, p)| match p.value {
        ResultValue::Scalar(v) => v,
        ResultValue::Rows(_) => None,
    })
}

fn rows(partial: PartialResult) -> Vec<Row> {
    match partial.value {
        ResultValue::Rows(rows) => rows,
        ResultValue::Scalar(_) => Vec::new(),
    }
}
