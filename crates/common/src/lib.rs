//! Common crate
//!
//! Shared plan, result, container and catalog types for the fabric, plus the
//! particle error taxonomy used by both the supervisor and the workers.
//!
//! # Example
//! ```rust
//! use fabric_common::{CombineStrategy, CompiledPlan};
//! let plan = CompiledPlan::new("count-events", ["a", "b"], CombineStrategy::Count);
//! assert_eq!(plan.partition_count(), 2);
//! ```

pub mod catalog;
pub mod container;
pub mod convert;
pub mod error;
pub mod observability;
pub mod plan;
pub mod result;

pub use catalog::{CatalogLookup, LocationHint, MemoryCatalog};
pub use container::{
    BoxError, ContainerDescriptor, ContainerHealth, ContainerRole, FabricContainer,
};
pub use error::{CommonError, ParticleError, ParticleErrorKind, Result};
pub use plan::{CombineStrategy, CompiledPlan, PartitionKey};
pub use result::{ExecutionMetrics, PartialResult, QueryResult, ResultValue, Row};
