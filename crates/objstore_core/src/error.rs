//! Store-level errors and the failure policy that decides their fate.
//!
//! # Invariants
//! - Under `FailurePolicy::Fatal` an escalated error never returns to the
//!   caller; the process exits with `FATAL_EXIT_CODE`.
//! - Query failures on the fetch paths are not escalated.

use crate::engine::EngineError;
use crate::model::entity::EntityError;
use crate::model::record::RecordError;
use log::error;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Exit status used when a fatal store failure terminates the process.
pub const FATAL_EXIT_CODE: i32 = 70;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure of a façade or store operation.
#[derive(Debug)]
pub enum StoreError {
    /// Container creation failed. Cached; never retried.
    Bootstrap {
        store: String,
        reason: String,
    },
    Entity(EntityError),
    Record(RecordError),
    Query {
        kind: String,
        source: EngineError,
    },
    BulkDelete {
        kind: String,
        source: EngineError,
    },
    Commit(EngineError),
}

impl StoreError {
    /// Stable code used in `error_code=` log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Bootstrap { .. } => "bootstrap_failed",
            Self::Entity(EntityError::UnknownEntity(_)) => "unknown_entity",
            Self::Entity(_) => "invalid_entity",
            Self::Record(RecordError::MissingRequired { .. }) => "validation_failed",
            Self::Record(_) => "invalid_record",
            Self::Query { .. } => "query_failed",
            Self::BulkDelete { .. } => "bulk_delete_failed",
            Self::Commit(_) => "commit_failed",
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrap { store, reason } => {
                write!(f, "failed to load persistent store `{store}`: {reason}")
            }
            Self::Entity(err) => write!(f, "{err}"),
            Self::Record(err) => write!(f, "{err}"),
            Self::Query { kind, source } => write!(f, "fetch of `{kind}` failed: {source}"),
            Self::BulkDelete { kind, source } => {
                write!(f, "bulk delete of `{kind}` failed: {source}")
            }
            Self::Commit(err) => write!(f, "failure to save context: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Bootstrap { .. } => None,
            Self::Entity(err) => Some(err),
            Self::Record(err) => Some(err),
            Self::Query { source, .. } | Self::BulkDelete { source, .. } => Some(source),
            Self::Commit(err) => Some(err),
        }
    }
}

impl From<EntityError> for StoreError {
    fn from(value: EntityError) -> Self {
        Self::Entity(value)
    }
}

impl From<RecordError> for StoreError {
    fn from(value: RecordError) -> Self {
        Self::Record(value)
    }
}

/// What happens to an error once it reaches the façade boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and terminate the process.
    #[default]
    Fatal,
    /// Log and hand the error back to the caller.
    Propagate,
}

impl FailurePolicy {
    /// Applies the policy to an error raised by `operation`.
    ///
    /// Returns the error unchanged under `Propagate`; does not return under
    /// `Fatal`.
    pub fn escalate(self, operation: &str, err: StoreError) -> StoreError {
        match self {
            Self::Propagate => {
                error!(
                    "event={operation} module=store status=error error_code={} error={}",
                    err.error_code(),
                    err
                );
                err
            }
            Self::Fatal => {
                error!(
                    "event=fatal_error module=store status=error operation={operation} error_code={} error={}",
                    err.error_code(),
                    err
                );
                log::logger().flush();
                std::process::exit(FATAL_EXIT_CODE)
            }
        }
    }
}
