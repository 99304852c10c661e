pub mod aggregator;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod partitioner;
pub mod query;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod tracker;
pub mod transport;

pub use container::{run_server, SupervisorContainer};
pub use dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, DispatcherConfig};
pub use error::{CoordinatorError, Result};
pub use query::{FailureReason, QueryState, QueryStatus, StructuredFailure};
pub use registry::{ContainerRegistry, HeartbeatPolicy};
pub use supervisor::Coordinator;
pub use transport::{GrpcWorkerTransport, ParticleAssignment, WorkerEndpoint, WorkerTransport};
