//! Generic CRUD and query primitives over one unit of work.
//!
//! # Responsibility
//! - Provide kind-parameterized create/fetch/delete/save entry points.
//! - Route every failure through the implementor's `FailurePolicy`.
//!
//! # Invariants
//! - Query failures on `fetch` are logged and surface as an empty result.
//! - `save_context` never reaches the engine when nothing is pending.
//! - All context access is serialized through `with_context`.

use crate::engine::ManagedContext;
use crate::error::{FailurePolicy, StoreError, StoreResult};
use crate::model::predicate::{Predicate, SortDescriptor};
use crate::model::record::Record;
use log::{debug, info, warn};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Context façade.
///
/// Implementors supply exclusive access to a `ManagedContext` and a failure
/// policy; every operation is provided on top of those two.
pub trait ObjectContext {
    fn failure_policy(&self) -> FailurePolicy;

    /// Runs `operation` with exclusive access to the context.
    fn with_context<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce(&mut ManagedContext) -> StoreResult<T>;

    /// Allocates a new uncommitted record of `kind`.
    fn create_object(&self, kind: &str) -> StoreResult<Record> {
        self.with_context(|context| context.insert_new(kind))
            .map_err(|err| self.failure_policy().escalate("create_object", err))
    }

    /// Fetches records of `kind`, optionally filtered and sorted.
    ///
    /// Returns an empty vector when the engine query fails.
    fn fetch(
        &self,
        kind: &str,
        filter: Option<&Predicate>,
        sort: Option<&SortDescriptor>,
    ) -> StoreResult<Vec<Record>> {
        self.with_context(|context| match context.query(kind, filter, sort) {
            Err(StoreError::Query { kind, source }) => {
                warn!(
                    "event=fetch module=facade status=error kind={kind} error_code=query_failed error={source}"
                );
                Ok(Vec::new())
            }
            other => other,
        })
        .map_err(|err| self.failure_policy().escalate("fetch", err))
    }

    /// First record of an unsorted `fetch`, if any.
    fn single_entity(&self, kind: &str, filter: &Predicate) -> StoreResult<Option<Record>> {
        Ok(self.fetch(kind, Some(filter), None)?.into_iter().next())
    }

    /// Deletes every durable record of `kind` in one engine operation.
    ///
    /// Takes effect without a save. Returns the number of records removed.
    fn batch_delete(&self, kind: &str) -> StoreResult<usize> {
        self.with_context(|context| context.delete_bulk(kind))
            .map(|ids| ids.len())
            .map_err(|err| self.failure_policy().escalate("batch_delete", err))
    }

    /// Same as `batch_delete`.
    fn remove_entity(&self, kind: &str) -> StoreResult<usize> {
        self.batch_delete(kind)
    }

    /// Commits pending changes; returns `false` when there was nothing to do.
    fn save_context(&self) -> StoreResult<bool> {
        self.with_context(|context| {
            if !context.has_pending_changes() {
                debug!("event=context_save module=facade status=skipped reason=no_changes");
                return Ok(false);
            }

            let started_at = Instant::now();
            let summary = context.commit()?;
            info!(
                "event=context_save module=facade status=ok inserted={} updated={} deleted={} duration_ms={}",
                summary.inserted,
                summary.updated,
                summary.deleted,
                started_at.elapsed().as_millis()
            );
            Ok(true)
        })
        .map_err(|err| self.failure_policy().escalate("save_context", err))
    }

    /// Stages one record for deletion on the next save.
    fn delete_object(&self, record: &Record) -> StoreResult<()> {
        self.with_context(|context| context.delete_one(record))
            .map_err(|err| self.failure_policy().escalate("delete_object", err))
    }

    /// True when the context holds uncommitted changes.
    fn has_changes(&self) -> StoreResult<bool> {
        self.with_context(|context| Ok(context.has_pending_changes()))
            .map_err(|err| self.failure_policy().escalate("has_changes", err))
    }
}

/// Mutex-guarded context that is already bootstrapped.
pub struct SharedContext {
    context: Mutex<ManagedContext>,
    failure_policy: FailurePolicy,
}

impl SharedContext {
    pub fn new(context: ManagedContext, failure_policy: FailurePolicy) -> Self {
        Self {
            context: Mutex::new(context),
            failure_policy,
        }
    }
}

impl ObjectContext for SharedContext {
    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn with_context<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce(&mut ManagedContext) -> StoreResult<T>,
    {
        let mut context = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        operation(&mut context)
    }
}
