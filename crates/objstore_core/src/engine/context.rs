//! Unit of work over one persistent container.
//!
//! # Responsibility
//! - Keep an identity map so one durable record maps to one live handle.
//! - Stage inserts, edits and deletes until `commit`.
//! - Merge pending state into query results.
//!
//! # Invariants
//! - A record id appears at most once in `registered` and `inserted`
//!   combined.
//! - Clean persisted records are held weakly; pending inserts, staged
//!   deletes and edited records are held strongly until committed.
//! - Context state changes only after the backend call succeeded.
//! - A commit never clears an edit it did not write.

use crate::engine::{ChangeSet, PersistentContainer};
use crate::error::{StoreError, StoreResult};
use crate::model::entity::{EntityDescriptor, EntityRegistry};
use crate::model::predicate::{Predicate, SortDescriptor};
use crate::model::record::{
    DirtyRecords, Record, RecordData, RecordError, RecordId, RecordStatus, WeakRecord,
};
use log::{debug, info};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Counts of one successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Mutable staging area bound to one container.
pub struct ManagedContext {
    container: PersistentContainer,
    registry: Arc<EntityRegistry>,
    /// Durable records seen by this context.
    registered: BTreeMap<RecordId, WeakRecord>,
    /// Persisted records edited since their last commit.
    dirty: Arc<DirtyRecords>,
    /// Pending inserts in creation order.
    inserted: Vec<Record>,
    /// Pending deletes of durable records.
    deleted: Vec<Record>,
}

struct PendingCommit {
    changes: ChangeSet,
    written: Vec<(Record, u64)>,
}

impl ManagedContext {
    pub fn new(container: PersistentContainer, registry: Arc<EntityRegistry>) -> Self {
        Self {
            container,
            registry,
            registered: BTreeMap::new(),
            dirty: Arc::new(DirtyRecords::default()),
            inserted: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn container(&self) -> &PersistentContainer {
        &self.container
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Number of durable records with a live handle in this context.
    pub fn registered_count(&self) -> usize {
        self.registered
            .values()
            .filter(|handle| handle.is_alive())
            .count()
    }

    /// Allocates an uncommitted record of `kind`.
    pub fn insert_new(&mut self, kind: &str) -> StoreResult<Record> {
        let descriptor = self.registry.resolve(kind)?;
        let record = Record::new_inserted(descriptor, &self.dirty);
        debug!(
            "event=record_insert module=context status=ok kind={} id={}",
            kind,
            record.id()
        );
        self.inserted.push(record.clone());
        Ok(record)
    }

    /// Runs a query and merges the context's pending state into the result.
    ///
    /// Pending inserts that match are appended, staged deletes are dropped and
    /// edited records are re-evaluated against `filter`. With `sort`, the
    /// merged result is re-ordered; without it durable rows keep engine order.
    pub fn query(
        &mut self,
        kind: &str,
        filter: Option<&Predicate>,
        sort: Option<&SortDescriptor>,
    ) -> StoreResult<Vec<Record>> {
        let descriptor = self.registry.resolve(kind)?;
        let rows = self
            .container
            .backend()
            .query(descriptor.kind(), filter, sort)
            .map_err(|source| StoreError::Query {
                kind: kind.to_string(),
                source,
            })?;

        self.prune_registered();
        let matches = |record: &Record| filter.map_or(true, |predicate| record.matches(predicate));
        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(rows.len());

        for row in rows {
            let record = self.register(&descriptor, row);
            if record.status() != RecordStatus::Persisted {
                continue;
            }
            if record.is_dirty() && !matches(&record) {
                continue;
            }
            seen.insert(record.id());
            results.push(record);
        }

        let edited: Vec<Record> = self.dirty.lock().values().cloned().collect();
        for record in edited {
            if record.kind() == descriptor.kind()
                && record.status() == RecordStatus::Persisted
                && !seen.contains(&record.id())
                && matches(&record)
            {
                results.push(record);
            }
        }

        for record in &self.inserted {
            if record.kind() == descriptor.kind() && matches(record) {
                results.push(record.clone());
            }
        }

        if let Some(sort) = sort {
            results.sort_by(|left, right| sort.compare(&left.attributes(), &right.attributes()));
        }

        debug!(
            "event=context_query module=context status=ok kind={} count={}",
            kind,
            results.len()
        );
        Ok(results)
    }

    /// Bulk-deletes every durable record of `kind` and merges the removed ids.
    ///
    /// Live handles for removed records become `Invalidated`. Pending inserts
    /// of the kind are kept.
    pub fn delete_bulk(&mut self, kind: &str) -> StoreResult<Vec<RecordId>> {
        let descriptor = self.registry.resolve(kind)?;
        let ids = self
            .container
            .backend()
            .delete_bulk(descriptor.kind())
            .map_err(|source| StoreError::BulkDelete {
                kind: kind.to_string(),
                source,
            })?;

        self.merge_deleted(&ids);
        info!(
            "event=batch_delete module=context status=ok kind={} deleted={}",
            kind,
            ids.len()
        );
        Ok(ids)
    }

    /// Stages one record for deletion on the next commit.
    ///
    /// A pending insert is simply discarded. Deleting an already deleted or
    /// invalidated record is a no-op.
    pub fn delete_one(&mut self, record: &Record) -> StoreResult<()> {
        match record.status() {
            RecordStatus::Inserted => {
                let position = self
                    .inserted
                    .iter()
                    .position(|pending| pending.same_handle(record))
                    .ok_or(RecordError::Foreign { id: record.id() })?;
                self.inserted.remove(position);
                record.set_status(RecordStatus::Invalidated);
                record.mark_clean();
            }
            RecordStatus::Persisted => {
                let owned = self
                    .registered
                    .get(&record.id())
                    .and_then(WeakRecord::upgrade)
                    .is_some_and(|local| local.same_handle(record));
                if !owned {
                    return Err(RecordError::Foreign { id: record.id() }.into());
                }
                record.set_status(RecordStatus::Deleted);
                self.dirty.lock().remove(&record.id());
                self.deleted.push(record.clone());
            }
            RecordStatus::Deleted | RecordStatus::Invalidated => {}
        }
        Ok(())
    }

    /// True when a commit would change durable state.
    pub fn has_pending_changes(&self) -> bool {
        !self.inserted.is_empty()
            || !self.deleted.is_empty()
            || self
                .dirty
                .lock()
                .values()
                .any(|record| record.status() == RecordStatus::Persisted && record.is_dirty())
    }

    /// Validates and commits every pending change.
    ///
    /// On failure nothing is cleared, so the same changes can be inspected or
    /// committed again. Records edited while the engine call runs stay dirty.
    pub fn commit(&mut self) -> StoreResult<CommitSummary> {
        let PendingCommit { changes, written } = self.prepare_commit()?;
        self.container
            .backend()
            .commit(&changes)
            .map_err(StoreError::Commit)?;

        self.inserted.clear();
        {
            let mut dirty = self.dirty.lock();
            for (record, generation) in &written {
                self.registered.insert(record.id(), record.downgrade());
                if record.settle(*generation) {
                    dirty.insert(record.id(), record.clone());
                } else {
                    dirty.remove(&record.id());
                }
            }
            for record in self.deleted.drain(..) {
                self.registered.remove(&record.id());
                dirty.remove(&record.id());
                record.set_status(RecordStatus::Invalidated);
                record.mark_clean();
            }
        }
        drop(written);
        self.prune_registered();

        Ok(CommitSummary {
            inserted: changes.inserts.len(),
            updated: changes.updates.len(),
            deleted: changes.deletes.len(),
        })
    }

    fn prepare_commit(&self) -> StoreResult<PendingCommit> {
        let mut changes = ChangeSet::default();
        let mut written = Vec::new();
        for record in &self.inserted {
            let snapshot = record.commit_snapshot()?;
            changes.inserts.push(snapshot.data);
            written.push((record.clone(), snapshot.generation));
        }

        let edited: Vec<Record> = self.dirty.lock().values().cloned().collect();
        for record in edited {
            if record.status() == RecordStatus::Persisted && record.is_dirty() {
                let snapshot = record.commit_snapshot()?;
                changes.updates.push(snapshot.data);
                written.push((record, snapshot.generation));
            }
        }
        changes.deletes = self.deleted.iter().map(Record::id).collect();
        Ok(PendingCommit { changes, written })
    }

    fn register(&mut self, descriptor: &Arc<EntityDescriptor>, row: RecordData) -> Record {
        if let Some(record) = self.registered.get(&row.id).and_then(WeakRecord::upgrade) {
            return record;
        }
        let record = Record::from_data(Arc::clone(descriptor), &self.dirty, row);
        self.registered.insert(record.id(), record.downgrade());
        record
    }

    fn prune_registered(&mut self) {
        self.registered.retain(|_, handle| handle.is_alive());
        self.dirty
            .lock()
            .retain(|_, record| record.status() == RecordStatus::Persisted);
    }

    fn merge_deleted(&mut self, ids: &[RecordId]) {
        let removed: HashSet<RecordId> = ids.iter().copied().collect();
        let mut dirty = self.dirty.lock();
        for id in ids {
            let handle = self.registered.remove(id);
            if let Some(record) = handle.as_ref().and_then(WeakRecord::upgrade) {
                record.set_status(RecordStatus::Invalidated);
                record.mark_clean();
            }
            dirty.remove(id);
        }
        drop(dirty);
        self.deleted.retain(|record| !removed.contains(&record.id()));
    }
}
