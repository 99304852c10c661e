//! Partial and final query results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::plan::CombineStrategy;

/// A labelled measurement produced by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Row {
    pub label: String,
    pub value: i64,
}

impl Row {
    pub fn new(label: impl Into<String>, value: i64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// Payload of a partial or final result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultValue {
    /// Numeric reduction. `None` is the identity for min/max over no rows.
    Scalar(Option<i64>),
    Rows(Vec<Row>),
}

impl ResultValue {
    /// Returns true if a partial of this shape can feed `strategy`.
    pub fn fits(&self, strategy: CombineStrategy) -> bool {
        match (self, strategy) {
            (
                Self::Scalar(_),
                CombineStrategy::Sum
                | CombineStrategy::Count
                | CombineStrategy::Min
                | CombineStrategy::Max,
            ) => true,
            (Self::Rows(_), CombineStrategy::Concat | CombineStrategy::TopK { .. }) => true,
            _ => false,
        }
    }
}

/// Result of one particle, as returned by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResult {
    pub value: ResultValue,
    #[serde(default)]
    pub rows_scanned: u64,
    #[serde(default)]
    pub scan_time_us: u64,
}

impl PartialResult {
    pub fn scalar(value: i64) -> Self {
        Self::new(ResultValue::Scalar(Some(value)))
    }

    pub fn rows(rows: Vec<Row>) -> Self {
        Self::new(ResultValue::Rows(rows))
    }

    pub fn new(value: ResultValue) -> Self {
        Self {
            value,
            rows_scanned: 0,
            scan_time_us: 0,
        }
    }

    pub fn with_scan(mut self, rows_scanned: u64, scan_time: Duration) -> Self {
        self.rows_scanned = rows_scanned;
        self.scan_time_us = u64::try_from(scan_time.as_micros()).unwrap_or(u64::MAX);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Counters describing how a query executed across the fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub particle_count: u32,
    /// Dispatch attempts summed over all particles.
    pub attempts: u32,
    pub rows_scanned: u64,
    pub scan_time_us: u64,
    pub wall_time_ms: u64,
}

/// The merged result of a successful query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub value: ResultValue,
    pub metrics: ExecutionMetrics,
}

impl QueryResult {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_matches_strategy() {
        assert!(ResultValue::Scalar(Some(1)).fits(CombineStrategy::Sum));
        assert!(ResultValue::Scalar(None).fits(CombineStrategy::Min));
        assert!(!ResultValue::Scalar(Some(1)).fits(CombineStrategy::Concat));
        assert!(ResultValue::Rows(vec![]).fits(CombineStrategy::TopK { k: 2 }));
        assert!(!ResultValue::Rows(vec![]).fits(CombineStrategy::Max));
    }

    #[test]
    fn scan_time_is_recorded_in_micros() {
        let partial = PartialResult::scalar(4).with_scan(10, Duration::from_millis(3));
        assert_eq!(partial.rows_scanned, 10);
        assert_eq!(partial.scan_time_us, 3_000);
    }
}
