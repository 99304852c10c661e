//! Compiled plans as the fabric sees them.
//!
//! The language front-end is outside the fabric: a plan reaches the supervisor
//! as bincode bytes carrying the partitions it must scan, the combine strategy
//! for its partial results and an opaque body that only workers interpret.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of one logical slice of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How partial results are merged into the final result.
///
/// Every strategy must be commutative and associative: particles complete
/// out of order and the merged result may not depend on arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombineStrategy {
    Sum,
    Count,
    Min,
    Max,
    /// Row concatenation in partition-key order.
    Concat,
    /// Bounded merge keeping the `k` highest-valued rows.
    TopK { k: usize },
}

impl fmt::Display for CombineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Count => write!(f, "count"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Concat => write!(f, "concat"),
            Self::TopK { k } => write!(f, "top_{k}"),
        }
    }
}

/// Immutable artifact produced by the language front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPlan {
    /// Human readable identity of the plan, used in logs.
    pub signature: String,
    pub partitions: BTreeSet<PartitionKey>,
    pub combine: CombineStrategy,
    /// Front-end specific payload, opaque to the supervisor.
    #[serde(default)]
    pub body: Vec<u8>,
}

impl CompiledPlan {
    pub fn new<I, K>(signature: impl Into<String>, partitions: I, combine: CombineStrategy) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<PartitionKey>,
    {
        Self {
            signature: signature.into(),
            partitions: partitions.into_iter().map(Into::into).collect(),
            combine,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
