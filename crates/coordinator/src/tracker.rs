//! Execution Tracker: the only writer of particle state for one query.
//!
//! The query driver feeds it dispatch acknowledgements, worker responses,
//! container evictions, cancellation and deadline expiry. Each input yields
//! the particles the driver has to act on next.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fabric_common::{CompiledPlan, ParticleError, ParticleErrorKind, PartitionKey};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchRequest, ParticleResponse};
use crate::query::{
    FailureReason, Particle, ParticleState, PartitionFailure, QueryExecution, QueryProgress,
    QueryState, StructuredFailure, Transition,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrackerError {
    #[error("partition {0} is not part of this query")]
    UnknownPartition(PartitionKey),

    #[error("partition {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: PartitionKey,
        from: ParticleState,
        to: ParticleState,
    },

    #[error("partition {key} acknowledged attempt {got}, expected {expected}")]
    AttemptMismatch {
        key: PartitionKey,
        expected: u32,
        got: u32,
    },
}

/// What became of a worker response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The response was for an attempt that is no longer current.
    Stale,
    Succeeded,
    /// The attempt failed and the particle is pending again.
    Retrying,
    /// The attempt failed with no retries left; the query has failed.
    Exhausted,
}

/// A particle that was in flight when the query stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub partition_key: PartitionKey,
    pub worker_id: String,
    pub attempt: u32,
}

pub struct ExecutionTracker {
    execution: QueryExecution,
    retry_limit: u32,
    failure: Option<StructuredFailure>,
}

impl ExecutionTracker {
    pub fn new(
        query_id: impl Into<String>,
        plan: Arc<CompiledPlan>,
        particles: Vec<Particle>,
        retry_limit: u32,
        deadline: Instant,
    ) -> Self {
        let particles: BTreeMap<PartitionKey, Particle> = particles
            .into_iter()
            .map(|p| (p.partition_key.clone(), p))
            .collect();
        Self {
            execution: QueryExecution {
                query_id: query_id.into(),
                plan,
                particles,
                state: QueryState::Running,
                started_at: Instant::now(),
                deadline,
            },
            retry_limit,
            failure: None,
        }
    }

    pub fn execution(&self) -> &QueryExecution {
        &self.execution
    }

    pub fn query_id(&self) -> &str {
        &self.execution.query_id
    }

    pub fn state(&self) -> QueryState {
        self.execution.state
    }

    pub fn deadline(&self) -> Instant {
        self.execution.deadline
    }

    pub fn particle(&self, key: &PartitionKey) -> Option<&Particle> {
        self.execution.particles.get(key)
    }

    /// Set once the query has failed or been cancelled.
    pub fn failure(&self) -> Option<&StructuredFailure> {
        self.failure.as_ref()
    }

    /// Pending particles in partition-key order.
    pub fn pending_keys(&self) -> Vec<PartitionKey> {
        if self.execution.state.is_terminal() {
            return Vec::new();
        }
        self.execution
            .particles
            .values()
            .filter(|p| p.state == ParticleState::Pending)
            .map(|p| p.partition_key.clone())
            .collect()
    }

    /// Builds the dispatch request for the next attempt of a pending particle.
    pub fn dispatch_request(
        &self,
        key: &PartitionKey,
        plan_bytes: &Arc<Vec<u8>>,
    ) -> Result<DispatchRequest, TrackerError> {
        let particle = self.get(key)?;
        if particle.state != ParticleState::Pending {
            return Err(TrackerError::InvalidTransition {
                key: key.clone(),
                from: particle.state,
                to: ParticleState::Dispatched,
            });
        }
        Ok(DispatchRequest {
            query_id: self.execution.query_id.clone(),
            partition_key: key.clone(),
            attempt: particle.attempt + 1,
            plan: Arc::clone(plan_bytes),
            exclude: particle.excluded_worker.clone(),
        })
    }

    /// Records that `attempt` of the particle was sent to the `generation`
    /// registration of `worker_id`.
    pub fn mark_dispatched(
        &mut self,
        key: &PartitionKey,
        attempt: u32,
        worker_id: &str,
        generation: u64,
    ) -> Result<(), TrackerError> {
        let particle = self.get_mut(key)?;
        if attempt != particle.attempt + 1 {
            return Err(TrackerError::AttemptMismatch {
                key: key.clone(),
                expected: particle.attempt + 1,
                got: attempt,
            });
        }
        particle.attempt = attempt;
        transition(particle, ParticleState::Dispatched)?;
        particle.worker_id = Some(worker_id.to_string());
        particle.worker_generation = Some(generation);
        Ok(())
    }

    /// Worker registrations holding an in-flight attempt of this query.
    pub fn dispatched_workers(&self) -> BTreeSet<(String, u64)> {
        self.execution
            .particles
            .values()
            .filter(|p| p.state == ParticleState::Dispatched)
            .filter_map(|p| Some((p.worker_id.clone()?, p.worker_generation?)))
            .collect()
    }

    /// Applies a worker response. Responses for any attempt other than the
    /// particle's current dispatched attempt are discarded.
    pub fn on_response(
        &mut self,
        response: ParticleResponse,
    ) -> Result<(ResponseOutcome, Vec<InFlight>), TrackerError> {
        if self.execution.state.is_terminal() {
            return Ok((ResponseOutcome::Stale, Vec::new()));
        }
        let particle = self.get_mut(&response.partition_key)?;
        if particle.state != ParticleState::Dispatched || particle.attempt != response.attempt {
            debug!(
                partition = %response.partition_key,
                attempt = response.attempt,
                current_attempt = particle.attempt,
                state = %particle.state,
                "discarding stale response"
            );
            return Ok((ResponseOutcome::Stale, Vec::new()));
        }

        match response.outcome {
            Ok(partial) => {
                transition(particle, ParticleState::Succeeded)?;
                particle.partial = Some(partial);
                particle.last_error = None;
                debug!(
                    query_id = %self.execution.query_id,
                    partition = %response.partition_key,
                    attempt = response.attempt,
                    "particle succeeded"
                );
                if self
                    .execution
                    .particles
                    .values()
                    .all(|p| p.state == ParticleState::Succeeded)
                {
                    self.execution.state = QueryState::Succeeded;
                    info!(query_id = %self.execution.query_id, "all particles succeeded");
                }
                Ok((ResponseOutcome::Succeeded, Vec::new()))
            }
            Err(error) => self.fail_attempt(&response.partition_key, &response.worker_id, error),
        }
    }

    /// Fails every particle currently dispatched to the evicted
    /// `generation` registration of a worker. Attempts placed on a later
    /// registration under the same id are left alone. Returns the keys that
    /// were affected.
    pub fn on_container_lost(
        &mut self,
        worker_id: &str,
        generation: u64,
    ) -> Result<(Vec<PartitionKey>, Vec<InFlight>), TrackerError> {
        if self.execution.state.is_terminal() {
            return Ok((Vec::new(), Vec::new()));
        }
        let lost: Vec<PartitionKey> = self
            .execution
            .particles
            .values()
            .filter(|p| {
                p.state == ParticleState::Dispatched
                    && p.worker_id.as_deref() == Some(worker_id)
                    && p.worker_generation == Some(generation)
            })
            .map(|p| p.partition_key.clone())
            .collect();

        let mut to_cancel = Vec::new();
        for key in &lost {
            if self.execution.state.is_terminal() {
                break;
            }
            let (_, cancelled) = self.fail_attempt(
                key,
                worker_id,
                ParticleError::container_lost(format!("container {worker_id} was evicted")),
            )?;
            to_cancel.extend(cancelled);
        }
        Ok((lost, to_cancel))
    }

    /// Cancels the query on request of the caller.
    pub fn cancel(&mut self, message: impl Into<String>) -> Vec<InFlight> {
        if self.execution.state.is_terminal() {
            return Vec::new();
        }
        let message = message.into();
        let partitions = self.unfinished_partitions(&message);
        self.finish(FailureReason::Cancelled, partitions, message)
    }

    /// Fails the query because its deadline passed. The failure names every
    /// partition that never completed.
    pub fn expire(&mut self) -> Vec<InFlight> {
        if self.execution.state.is_terminal() {
            return Vec::new();
        }
        let partitions = self.unfinished_partitions("deadline exceeded before the partition completed");
        let message = format!(
            "deadline passed with {} of {} partitions incomplete",
            partitions.len(),
            self.execution.particles.len()
        );
        self.finish(FailureReason::DeadlineExceeded, partitions, message)
    }

    pub fn progress(&self) -> QueryProgress {
        let mut progress = QueryProgress {
            total: self.execution.particles.len() as u32,
            ..QueryProgress::default()
        };
        for particle in self.execution.particles.values() {
            match particle.state {
                ParticleState::Succeeded => progress.succeeded += 1,
                ParticleState::Dispatched => progress.in_flight += 1,
                ParticleState::Pending => progress.pending += 1,
                _ => {}
            }
        }
        progress
    }

    /// Marks the query failed for a reason found outside the tracker, such
    /// as an aggregation error.
    pub fn fail_internal(&mut self, message: impl Into<String>) {
        self.finish(FailureReason::Internal, Vec::new(), message.into());
    }

    fn fail_attempt(
        &mut self,
        key: &PartitionKey,
        worker_id: &str,
        error: ParticleError,
    ) -> Result<(ResponseOutcome, Vec<InFlight>), TrackerError> {
        let retry_limit = self.retry_limit;
        let query_id = self.execution.query_id.clone();
        let particle = self.get_mut(key)?;
        let failed_state = match error.kind {
            ParticleErrorKind::TimedOut => ParticleState::TimedOut,
            _ => ParticleState::Failed,
        };
        transition(particle, failed_state)?;
        particle.last_error = Some(error.clone());

        if particle.has_retries_left(retry_limit) {
            transition(particle, ParticleState::Pending)?;
            particle.excluded_worker = Some(worker_id.to_string());
            particle.worker_id = None;
            particle.worker_generation = None;
            warn!(
                %query_id,
                partition = %key,
                attempt = particle.attempt,
                worker_id,
                error = %error,
                "particle attempt failed, reassigning"
            );
            return Ok((ResponseOutcome::Retrying, Vec::new()));
        }

        // Timed-out particles settle as failed once the budget is spent.
        if particle.state == ParticleState::TimedOut {
            particle.state = ParticleState::Failed;
        }
        let attempts = particle.attempt;
        warn!(
            %query_id,
            partition = %key,
            attempts,
            error = %error,
            "particle exhausted its retries"
        );
        let failures = vec![PartitionFailure {
            partition_key: key.clone(),
            attempts,
            last_error: Some(error.to_string()),
        }];
        let message = format!("partition {key} failed after {attempts} attempts: {error}");
        let cancelled = self.finish(FailureReason::RetryLimitExceeded, failures, message);
        Ok((ResponseOutcome::Exhausted, cancelled))
    }

    /// Terminates the query: records the failure and cancels every particle
    /// still pending or in flight. Returns the ones that were in flight.
    fn finish(
        &mut self,
        reason: FailureReason,
        partitions: Vec<PartitionFailure>,
        message: String,
    ) -> Vec<InFlight> {
        let mut in_flight = Vec::new();
        for particle in self.execution.particles.values_mut() {
            match particle.state {
                ParticleState::Dispatched => {
                    if let Some(worker_id) = particle.worker_id.clone() {
                        in_flight.push(InFlight {
                            partition_key: particle.partition_key.clone(),
                            worker_id,
                            attempt: particle.attempt,
                        });
                    }
                    record(particle, ParticleState::Cancelled);
                }
                ParticleState::Pending => record(particle, ParticleState::Cancelled),
                _ => {}
            }
        }
        self.execution.state = match reason {
            FailureReason::Cancelled => QueryState::Cancelled,
            _ => QueryState::Failed,
        };
        info!(
            query_id = %self.execution.query_id,
            reason = %reason,
            partitions = partitions.len(),
            "query stopped"
        );
        self.failure = Some(StructuredFailure {
            query_id: self.execution.query_id.clone(),
            reason,
            partitions,
            message,
        });
        in_flight
    }

    /// Partitions without a recorded error are reported with `reason`.
    fn unfinished_partitions(&self, reason: &str) -> Vec<PartitionFailure> {
        self.execution
            .particles
            .values()
            .filter(|p| !p.is_terminal(self.retry_limit))
            .map(|p| PartitionFailure {
                partition_key: p.partition_key.clone(),
                attempts: p.attempt,
                last_error: Some(
                    p.last_error
                        .as_ref()
                        .map_or_else(|| reason.to_string(), ToString::to_string),
                ),
            })
            .collect()
    }

    fn get(&self, key: &PartitionKey) -> Result<&Particle, TrackerError> {
        self.execution
            .particles
            .get(key)
            .ok_or_else(|| TrackerError::UnknownPartition(key.clone()))
    }

    fn get_mut(&mut self, key: &PartitionKey) -> Result<&mut Particle, TrackerError> {
        self.execution
            .particles
            .get_mut(key)
            .ok_or_else(|| TrackerError::UnknownPartition(key.clone()))
    }
}

fn transition(particle: &mut Particle, to: ParticleState) -> Result<(), TrackerError> {
    if !particle.state.can_transition_to(to) {
        return Err(TrackerError::InvalidTransition {
            key: particle.partition_key.clone(),
            from: particle.state,
            to,
        });
    }
    record(particle, to);
    Ok(())
}

fn record(particle: &mut Particle, to: ParticleState) {
    particle.transitions.push(Transition {
        from: particle.state,
        to,
        attempt: particle.attempt,
    });
    particle.state = to;
}
