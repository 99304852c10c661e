//! Worker side of the fabric.
//!
//! A worker registers with the supervisor, heartbeats its current load and
//! executes the particles dispatched to it with a [`ParticleExecutor`].

pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod service;

pub use container::{run_worker_server, WorkerContainer};
pub use error::{Result, WorkerError};
pub use executor::{DatasetExecutor, ExecutionError, ParticleExecutor};
pub use service::{LoadGauge, WorkerServiceImpl};
