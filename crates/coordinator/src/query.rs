//! Data model for one query's execution: particles, query state and the
//! status reported back to callers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use fabric_common::{CompiledPlan, ParticleError, PartialResult, PartitionKey, QueryResult};
use tokio::time::Instant;

/// Lifecycle of a particle.
///
/// ```text
/// PENDING --dispatch--> DISPATCHED --response--> SUCCEEDED
///    ^                      |
///    |                      +--error-----> FAILED ----+
///    |                      +--timeout---> TIMED_OUT -+
///    +------------- attempts remain ------------------+
/// ```
///
/// `Failed` is terminal once the retry budget is spent. `Cancelled` is
/// terminal and excluded from aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticleState {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ParticleState {
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Dispatched | Self::Cancelled),
            Self::Dispatched => matches!(
                target,
                Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
            ),
            Self::Failed | Self::TimedOut => matches!(target, Self::Pending),
            Self::Succeeded | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for ParticleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One recorded state change of a particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ParticleState,
    pub to: ParticleState,
    pub attempt: u32,
}

/// One partition-scoped unit of query work.
#[derive(Debug, Clone)]
pub struct Particle {
    pub plan: Arc<CompiledPlan>,
    pub partition_key: PartitionKey,
    pub state: ParticleState,
    /// Number of dispatches so far; the first dispatch is attempt 1.
    pub attempt: u32,
    pub worker_id: Option<String>,
    /// Registry generation of `worker_id` when the attempt was sent.
    pub worker_generation: Option<u64>,
    /// Worker of the last failed attempt, avoided on the next dispatch.
    pub excluded_worker: Option<String>,
    pub partial: Option<PartialResult>,
    pub last_error: Option<ParticleError>,
    pub transitions: Vec<Transition>,
}

impl Particle {
    pub fn new(plan: Arc<CompiledPlan>, partition_key: PartitionKey) -> Self {
        Self {
            plan,
            partition_key,
            state: ParticleState::Pending,
            attempt: 0,
            worker_id: None,
            worker_generation: None,
            excluded_worker: None,
            partial: None,
            last_error: None,
            transitions: Vec::new(),
        }
    }

    /// Whether the particle can no longer change state.
    pub fn is_terminal(&self, retry_limit: u32) -> bool {
        match self.state {
            ParticleState::Succeeded | ParticleState::Cancelled => true,
            ParticleState::Failed | ParticleState::TimedOut => !self.has_retries_left(retry_limit),
            ParticleState::Pending | ParticleState::Dispatched => false,
        }
    }

    /// Attempts beyond the first are retries; at most `retry_limit` of them.
    pub fn has_retries_left(&self, retry_limit: u32) -> bool {
        self.attempt <= retry_limit
    }

    /// How many times the particle went `from -> to`.
    pub fn count_transitions(&self, from: ParticleState, to: ParticleState) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.from == from && t.to == to)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The aggregate root for one query.
#[derive(Debug, Clone)]
pub struct QueryExecution {
    pub query_id: String,
    pub plan: Arc<CompiledPlan>,
    pub particles: BTreeMap<PartitionKey, Particle>,
    pub state: QueryState,
    pub started_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// At least one partition exhausted its retry budget.
    RetryLimitExceeded,
    /// The query ran out of wall-clock budget.
    DeadlineExceeded,
    /// The caller cancelled the query or the supervisor shut down.
    Cancelled,
    /// Aggregation broke a contract; not caused by the caller.
    Internal,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryLimitExceeded => write!(f, "retry limit exceeded"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFailure {
    pub partition_key: PartitionKey,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Why a query did not produce a result, naming the partitions involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredFailure {
    pub query_id: String,
    pub reason: FailureReason,
    pub partitions: Vec<PartitionFailure>,
    pub message: String,
}

impl StructuredFailure {
    pub fn failed_partitions(&self) -> Vec<&PartitionKey> {
        self.partitions.iter().map(|p| &p.partition_key).collect()
    }
}

impl fmt::Display for StructuredFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query {} failed: {}", self.query_id, self.reason)?;
        if !self.partitions.is_empty() {
            let keys: Vec<&str> = self.partitions.iter().map(|p| p.partition_key.as_str()).collect();
            write!(f, " [{}]", keys.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryProgress {
    pub total: u32,
    pub succeeded: u32,
    pub in_flight: u32,
    pub pending: u32,
}

/// What `get_result` reports for a query.
#[derive(Debug, Clone)]
pub enum QueryStatus {
    Running(QueryProgress),
    Succeeded(Arc<QueryResult>),
    Failed(StructuredFailure),
}

impl QueryStatus {
    pub fn state(&self) -> QueryState {
        match self {
            Self::Running(_) => QueryState::Running,
            Self::Succeeded(_) => QueryState::Succeeded,
            Self::Failed(failure) if failure.reason == FailureReason::Cancelled => {
                QueryState::Cancelled
            }
            Self::Failed(_) => QueryState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}
