//! Record model shared by the façade, the store and the engines.
//!
//! # Responsibility
//! - Describe entity kinds and their attribute schema.
//! - Provide live record handles bound to one unit of work.
//! - Express filter and sort criteria independent of any engine.
//!
//! # Invariants
//! - Every record is identified by a stable `RecordId`.
//! - Kinds are resolved through `EntityRegistry`, never by casting.

pub mod entity;
pub mod predicate;
pub mod record;
