//! Embedded object store with a Core Data style unit of work.
//!
//! Records are created, fetched and mutated through an [`ObjectContext`];
//! changes stay staged until `save_context` commits them to the engine.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod facade;
pub mod logging;
pub mod model;
pub mod store;

pub use config::{ConfigError, StoreConfig, StoreLocation};
pub use engine::{
    ChangeSet, CommitSummary, Engine, EngineError, EngineOperation, EngineResult, ManagedContext,
    MemoryEngine, PersistentContainer, SqliteEngine, StoreBackend,
};
pub use error::{FailurePolicy, StoreError, StoreResult, FATAL_EXIT_CODE};
pub use facade::{ObjectContext, SharedContext};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{
    AttributeDescriptor, AttributeType, Entity, EntityDescriptor, EntityError, EntityKind,
    EntityRegistry,
};
pub use model::predicate::{ComparisonOp, Predicate, SortDescriptor};
pub use model::record::{
    AttributeValue, Attributes, Record, RecordData, RecordError, RecordId, RecordStatus,
};
pub use store::Store;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
