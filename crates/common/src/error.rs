use std::fmt;

use thiserror::Error;

/// Errors raised by the shared codec and conversion helpers.
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unknown container role: {0}")]
    UnknownRole(i32),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, CommonError>;

/// Classification of a failed particle attempt.
///
/// Every kind is recoverable by reassignment until the retry budget of the
/// particle runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticleErrorKind {
    /// The RPC to the worker could not be sent or its response not received.
    Transport,
    /// The worker accepted the request and reported an application failure.
    WorkerExecution,
    /// No response arrived within the per-particle timeout.
    TimedOut,
    /// The worker holding the particle was evicted from the registry.
    ContainerLost,
}

impl ParticleErrorKind {
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::WorkerExecution => "worker_execution",
            Self::TimedOut => "timed_out",
            Self::ContainerLost => "container_lost",
        }
    }
}

impl fmt::Display for ParticleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A single failed particle attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ParticleError {
    pub kind: ParticleErrorKind,
    pub message: String,
}

impl ParticleError {
    pub fn new(kind: ParticleErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ParticleErrorKind::Transport, message)
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::new(ParticleErrorKind::WorkerExecution, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ParticleErrorKind::TimedOut, message)
    }

    pub fn container_lost(message: impl Into<String>) -> Self {
        Self::new(ParticleErrorKind::ContainerLost, message)
    }
}
