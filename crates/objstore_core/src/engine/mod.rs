//! Persistence engine boundary.
//!
//! # Responsibility
//! - Define the contract a durable engine implements (`Engine`,
//!   `StoreBackend`).
//! - Provide the unit of work (`ManagedContext`) that stages changes on top
//!   of one container.
//!
//! # Invariants
//! - Backends never see uncommitted state; they receive whole `ChangeSet`s.
//! - `StoreBackend::commit` is atomic: all of a change set applies or none.

use crate::db::DbError;
use crate::model::entity::EntityKind;
use crate::model::predicate::{Predicate, SortDescriptor};
use crate::model::record::{RecordData, RecordId};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

pub mod context;
pub mod memory;
pub mod sqlite;

pub use context::{CommitSummary, ManagedContext};
pub use memory::{EngineOperation, MemoryEngine};
pub use sqlite::SqliteEngine;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by an engine implementation.
#[derive(Debug)]
pub enum EngineError {
    Db(DbError),
    Serialization(serde_json::Error),
    InvalidStoreName(String),
    InvalidData(String),
    /// An update targeted a record that is no longer durable.
    Conflict(RecordId),
    Unavailable(String),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "attribute encoding failed: {err}"),
            Self::InvalidStoreName(name) => write!(f, "store name is invalid: `{name}`"),
            Self::InvalidData(message) => write!(f, "invalid persisted record data: {message}"),
            Self::Conflict(id) => write!(f, "record {id} was removed from the store"),
            Self::Unavailable(message) => write!(f, "engine unavailable: {message}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::InvalidStoreName(_)
            | Self::InvalidData(_)
            | Self::Conflict(_)
            | Self::Unavailable(_) => None,
        }
    }
}

impl From<DbError> for EngineError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Staged mutations handed to a backend in one commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserts: Vec<RecordData>,
    pub updates: Vec<RecordData>,
    pub deletes: Vec<RecordId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Durable side of one opened store.
pub trait StoreBackend: Send + Sync {
    /// Returns durable records of `kind` matching `filter`, ordered by `sort`
    /// or by insertion order when no sort is given.
    fn query(
        &self,
        kind: &EntityKind,
        filter: Option<&Predicate>,
        sort: Option<&SortDescriptor>,
    ) -> EngineResult<Vec<RecordData>>;

    /// Removes every durable record of `kind` and returns their ids.
    fn delete_bulk(&self, kind: &EntityKind) -> EngineResult<Vec<RecordId>>;

    /// Applies a change set atomically.
    fn commit(&self, changes: &ChangeSet) -> EngineResult<()>;
}

/// Factory for named stores.
pub trait Engine: Send + Sync {
    fn open_or_create_store(&self, name: &str) -> EngineResult<PersistentContainer>;
}

/// Handle to one opened durable store.
#[derive(Clone)]
pub struct PersistentContainer {
    name: String,
    backend: Arc<dyn StoreBackend>,
}

impl PersistentContainer {
    pub fn new(name: impl Into<String>, backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &dyn StoreBackend {
        self.backend.as_ref()
    }
}

impl Debug for PersistentContainer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentContainer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
