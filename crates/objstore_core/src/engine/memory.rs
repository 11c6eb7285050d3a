//! In-process engine for tests and ephemeral stores.
//!
//! Durable state lives in the engine value, so dropping a `Store` and
//! building a new one over the same `MemoryEngine` behaves like reopening a
//! store file. Every operation is counted and can be made to fail.

use crate::engine::{
    ChangeSet, Engine, EngineError, EngineResult, PersistentContainer, StoreBackend,
};
use crate::model::entity::{is_valid_identifier, EntityKind};
use crate::model::predicate::{Predicate, SortDescriptor};
use crate::model::record::{RecordData, RecordId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Engine operation tracked by `MemoryEngine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOperation {
    OpenStore,
    Query,
    DeleteBulk,
    Commit,
}

#[derive(Default)]
struct EngineProbe {
    calls: Mutex<HashMap<EngineOperation, usize>>,
    faults: Mutex<HashSet<EngineOperation>>,
}

impl EngineProbe {
    fn enter(&self, operation: EngineOperation) -> EngineResult<()> {
        *lock(&self.calls).entry(operation).or_insert(0) += 1;
        if lock(&self.faults).contains(&operation) {
            return Err(EngineError::Unavailable(format!(
                "injected {operation:?} failure"
            )));
        }
        Ok(())
    }
}

/// Shared-state in-memory engine.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    stores: Arc<Mutex<HashMap<String, Arc<MemoryBackend>>>>,
    probe: Arc<EngineProbe>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `operation` was attempted, failed attempts included.
    pub fn call_count(&self, operation: EngineOperation) -> usize {
        lock(&self.probe.calls)
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Makes every following `operation` fail until `recover` is called.
    pub fn fail(&self, operation: EngineOperation) {
        lock(&self.probe.faults).insert(operation);
    }

    pub fn recover(&self, operation: EngineOperation) {
        lock(&self.probe.faults).remove(&operation);
    }

    /// Durable records of `kind` in store `name`, in insertion order.
    pub fn durable_records(&self, name: &str, kind: &str) -> Vec<RecordData> {
        lock(&self.stores)
            .get(name)
            .map(|backend| {
                lock(&backend.rows)
                    .iter()
                    .filter(|row| row.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Engine for MemoryEngine {
    fn open_or_create_store(&self, name: &str) -> EngineResult<PersistentContainer> {
        self.probe.enter(EngineOperation::OpenStore)?;
        if !is_valid_identifier(name) {
            return Err(EngineError::InvalidStoreName(name.to_string()));
        }

        let backend = lock(&self.stores)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryBackend {
                    rows: Mutex::new(Vec::new()),
                    probe: Arc::clone(&self.probe),
                })
            })
            .clone();
        Ok(PersistentContainer::new(name, backend))
    }
}

struct MemoryBackend {
    rows: Mutex<Vec<RecordData>>,
    probe: Arc<EngineProbe>,
}

impl StoreBackend for MemoryBackend {
    fn query(
        &self,
        kind: &EntityKind,
        filter: Option<&Predicate>,
        sort: Option<&SortDescriptor>,
    ) -> EngineResult<Vec<RecordData>> {
        self.probe.enter(EngineOperation::Query)?;
        let mut rows: Vec<RecordData> = lock(&self.rows)
            .iter()
            .filter(|row| row.kind == kind.as_str())
            .filter(|row| filter.map_or(true, |predicate| predicate.evaluate(&row.attributes)))
            .cloned()
            .collect();
        if let Some(sort) = sort {
            rows.sort_by(|left, right| sort.compare(&left.attributes, &right.attributes));
        }
        Ok(rows)
    }

    fn delete_bulk(&self, kind: &EntityKind) -> EngineResult<Vec<RecordId>> {
        self.probe.enter(EngineOperation::DeleteBulk)?;
        let mut rows = lock(&self.rows);
        let (removed, kept): (Vec<RecordData>, Vec<RecordData>) = rows
            .drain(..)
            .partition(|row| row.kind == kind.as_str());
        *rows = kept;
        Ok(removed.into_iter().map(|row| row.id).collect())
    }

    fn commit(&self, changes: &ChangeSet) -> EngineResult<()> {
        self.probe.enter(EngineOperation::Commit)?;
        let mut rows = lock(&self.rows);
        let mut staged = rows.clone();

        for insert in &changes.inserts {
            if staged.iter().any(|row| row.id == insert.id) {
                return Err(EngineError::InvalidData(format!(
                    "duplicate record id {}",
                    insert.id
                )));
            }
            staged.push(insert.clone());
        }
        for update in &changes.updates {
            let row = staged
                .iter_mut()
                .find(|row| row.id == update.id && row.kind == update.kind)
                .ok_or(EngineError::Conflict(update.id))?;
            row.attributes = update.attributes.clone();
        }
        staged.retain(|row| !changes.deletes.contains(&row.id));

        *rows = staged;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
