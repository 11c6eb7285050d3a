//! Record handles and attribute values.
//!
//! # Responsibility
//! - Hold the in-memory state of one record bound to a unit of work.
//! - Enforce the attribute schema on every write.
//!
//! # Invariants
//! - `RecordId` is generated once and never reused for another record.
//! - `Null` attributes are not stored; a missing key reads as `Null`.
//! - Deleted and invalidated records reject writes.
//! - Every accepted write bumps the record's edit generation; a commit only
//!   clears the dirty flag for the generation it wrote.
//! - An edited persisted record is held strongly by its context's
//!   `DirtyRecords` until a commit writes it.

use crate::model::entity::{AttributeType, EntityDescriptor, EntityKind};
use crate::model::predicate::Predicate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use uuid::Uuid;

/// Stable identifier of a stored record.
pub type RecordId = Uuid;

/// Attribute map as persisted by engines.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Scalar attribute value.
///
/// Serialized untagged so the persisted form is plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => AttributeType::Bool.as_str(),
            Self::Integer(_) => AttributeType::Integer.as_str(),
            Self::Real(_) => AttributeType::Real.as_str(),
            Self::Text(_) => AttributeType::Text.as_str(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Compares two values of the same family (bool, number, text).
    ///
    /// Returns `None` across families and whenever either side is `Null`.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Integer(_) | Self::Real(_), Self::Integer(_) | Self::Real(_)) => {
                self.as_real()?.partial_cmp(&other.as_real()?)
            }
            _ => None,
        }
    }

    /// Total order used by sort descriptors.
    ///
    /// `Null` < numbers (bools as 0/1) < text, matching SQLite's ordering of
    /// `json_extract` results.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        fn rank(value: &AttributeValue) -> u8 {
            match value {
                AttributeValue::Null => 0,
                AttributeValue::Bool(_)
                | AttributeValue::Integer(_)
                | AttributeValue::Real(_) => 1,
                AttributeValue::Text(_) => 2,
            }
        }
        fn numeric(value: &AttributeValue) -> f64 {
            match value {
                AttributeValue::Bool(flag) => f64::from(u8::from(*flag)),
                AttributeValue::Integer(number) => *number as f64,
                AttributeValue::Real(number) => *number,
                _ => 0.0,
            }
        }

        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            _ if rank(self) == 1 && rank(other) == 1 => numeric(self).total_cmp(&numeric(other)),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Persisted shape of one record, exchanged with engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    pub id: RecordId,
    pub kind: String,
    pub attributes: Attributes,
}

/// Lifecycle of a record inside its unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Created in the context, not yet committed.
    Inserted,
    /// Known to durable storage.
    Persisted,
    /// Staged for deletion on the next commit.
    Deleted,
    /// Removed from durable storage or the context; the handle is stale.
    Invalidated,
}

/// Record mutation and commit validation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    UnknownAttribute {
        kind: String,
        attribute: String,
    },
    TypeMismatch {
        kind: String,
        attribute: String,
        expected: AttributeType,
        found: &'static str,
    },
    NonFiniteReal {
        kind: String,
        attribute: String,
    },
    NotLive {
        id: RecordId,
        status: RecordStatus,
    },
    /// The record belongs to a different unit of work.
    Foreign {
        id: RecordId,
    },
    MissingRequired {
        kind: String,
        id: RecordId,
        attribute: String,
    },
}

impl Display for RecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownAttribute { kind, attribute } => {
                write!(f, "`{kind}` has no attribute `{attribute}`")
            }
            Self::TypeMismatch {
                kind,
                attribute,
                expected,
                found,
            } => write!(
                f,
                "`{kind}.{attribute}` expects {}, got {found}",
                expected.as_str()
            ),
            Self::NonFiniteReal { kind, attribute } => {
                write!(f, "`{kind}.{attribute}` cannot store a non-finite real")
            }
            Self::NotLive { id, status } => {
                write!(f, "record {id} is not writable in status {status:?}")
            }
            Self::Foreign { id } => write!(f, "record {id} is not managed by this context"),
            Self::MissingRequired {
                kind,
                id,
                attribute,
            } => write!(f, "record {id} of `{kind}` is missing required `{attribute}`"),
        }
    }
}

impl Error for RecordError {}

/// Live handle to one record in a unit of work.
///
/// Clones share state: a write through any clone is visible to all of them and
/// to the owning context.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

struct RecordInner {
    id: RecordId,
    descriptor: Arc<EntityDescriptor>,
    dirty_records: Weak<DirtyRecords>,
    state: Mutex<RecordState>,
}

struct RecordState {
    attributes: Attributes,
    status: RecordStatus,
    dirty: bool,
    generation: u64,
}

/// Persisted records with uncommitted edits, keyed by id.
///
/// Lock order: a record's state lock is never held while this lock is taken.
#[derive(Default)]
pub(crate) struct DirtyRecords {
    records: Mutex<BTreeMap<RecordId, Record>>,
}

impl DirtyRecords {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Non-owning identity-map entry.
#[derive(Clone)]
pub(crate) struct WeakRecord {
    inner: Weak<RecordInner>,
}

impl WeakRecord {
    pub(crate) fn upgrade(&self) -> Option<Record> {
        self.inner.upgrade().map(|inner| Record { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

/// Validated copy of a record taken for one commit.
pub(crate) struct CommitSnapshot {
    pub(crate) data: RecordData,
    pub(crate) generation: u64,
}

impl Record {
    pub(crate) fn new_inserted(
        descriptor: Arc<EntityDescriptor>,
        dirty_records: &Arc<DirtyRecords>,
    ) -> Self {
        Self::build(
            Uuid::new_v4(),
            descriptor,
            dirty_records,
            Attributes::new(),
            RecordStatus::Inserted,
        )
    }

    pub(crate) fn from_data(
        descriptor: Arc<EntityDescriptor>,
        dirty_records: &Arc<DirtyRecords>,
        data: RecordData,
    ) -> Self {
        let attributes = data
            .attributes
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();
        Self::build(
            data.id,
            descriptor,
            dirty_records,
            attributes,
            RecordStatus::Persisted,
        )
    }

    fn build(
        id: RecordId,
        descriptor: Arc<EntityDescriptor>,
        dirty_records: &Arc<DirtyRecords>,
        attributes: Attributes,
        status: RecordStatus,
    ) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                id,
                descriptor,
                dirty_records: Arc::downgrade(dirty_records),
                state: Mutex::new(RecordState {
                    attributes,
                    status,
                    dirty: false,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> RecordId {
        self.inner.id
    }

    pub fn kind(&self) -> &EntityKind {
        self.inner.descriptor.kind()
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.inner.descriptor
    }

    /// Returns the attribute value, `Null` when unset.
    pub fn get(&self, attribute: &str) -> AttributeValue {
        self.state()
            .attributes
            .get(attribute)
            .cloned()
            .unwrap_or(AttributeValue::Null)
    }

    /// Writes one attribute and marks the record dirty.
    ///
    /// Integers are widened when the attribute is declared `real`. Safe to
    /// call while another thread saves the owning context: an edit the
    /// commit did not write stays pending.
    pub fn set(
        &self,
        attribute: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<(), RecordError> {
        let value = self.coerce(attribute, value.into())?;
        let persisted = {
            let mut state = self.state();
            match state.status {
                RecordStatus::Inserted | RecordStatus::Persisted => {}
                status => {
                    return Err(RecordError::NotLive {
                        id: self.inner.id,
                        status,
                    })
                }
            }

            if value.is_null() {
                state.attributes.remove(attribute);
            } else {
                state.attributes.insert(attribute.to_string(), value);
            }
            state.dirty = true;
            state.generation += 1;
            state.status == RecordStatus::Persisted
        };

        if persisted {
            if let Some(dirty_records) = self.inner.dirty_records.upgrade() {
                dirty_records.lock().insert(self.inner.id, self.clone());
            }
        }
        Ok(())
    }

    /// Returns a copy of the stored (non-null) attributes.
    pub fn attributes(&self) -> Attributes {
        self.state().attributes.clone()
    }

    pub fn status(&self) -> RecordStatus {
        self.state().status
    }

    /// True when the record is staged for deletion.
    pub fn is_deleted(&self) -> bool {
        self.status() == RecordStatus::Deleted
    }

    /// True when the handle no longer refers to a live record.
    pub fn is_invalidated(&self) -> bool {
        self.status() == RecordStatus::Invalidated
    }

    /// True when the record has edits not yet committed.
    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn matches(&self, predicate: &Predicate) -> bool {
        predicate.evaluate(&self.state().attributes)
    }

    /// Checks required attributes and copies the record in one step.
    pub(crate) fn commit_snapshot(&self) -> Result<CommitSnapshot, RecordError> {
        let state = self.state();
        let missing = self
            .inner
            .descriptor
            .attributes()
            .iter()
            .find(|attribute| !attribute.optional && !state.attributes.contains_key(&attribute.name));
        if let Some(attribute) = missing {
            return Err(RecordError::MissingRequired {
                kind: self.kind().to_string(),
                id: self.inner.id,
                attribute: attribute.name.clone(),
            });
        }

        Ok(CommitSnapshot {
            data: RecordData {
                id: self.inner.id,
                kind: self.kind().as_str().to_string(),
                attributes: state.attributes.clone(),
            },
            generation: state.generation,
        })
    }

    /// Marks the record durable after a commit wrote `generation`.
    ///
    /// Returns `true` when it was edited again meanwhile and is still dirty.
    pub(crate) fn settle(&self, generation: u64) -> bool {
        let mut state = self.state();
        state.status = RecordStatus::Persisted;
        if state.generation == generation {
            state.dirty = false;
        }
        state.dirty
    }

    pub(crate) fn downgrade(&self) -> WeakRecord {
        WeakRecord {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// True when both values are clones of the same handle.
    pub(crate) fn same_handle(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_status(&self, status: RecordStatus) {
        self.state().status = status;
    }

    pub(crate) fn mark_clean(&self) {
        self.state().dirty = false;
    }

    fn coerce(&self, attribute: &str, value: AttributeValue) -> Result<AttributeValue, RecordError> {
        let kind = self.kind().to_string();
        let declared = self
            .inner
            .descriptor
            .attribute(attribute)
            .ok_or_else(|| RecordError::UnknownAttribute {
                kind: kind.clone(),
                attribute: attribute.to_string(),
            })?;

        match (declared.value_type, value) {
            (_, AttributeValue::Null) => Ok(AttributeValue::Null),
            (AttributeType::Bool, value @ AttributeValue::Bool(_))
            | (AttributeType::Integer, value @ AttributeValue::Integer(_))
            | (AttributeType::Text, value @ AttributeValue::Text(_)) => Ok(value),
            (AttributeType::Real, AttributeValue::Integer(number)) => {
                Ok(AttributeValue::Real(number as f64))
            }
            (AttributeType::Real, AttributeValue::Real(number)) if number.is_finite() => {
                Ok(AttributeValue::Real(number))
            }
            (AttributeType::Real, AttributeValue::Real(_)) => Err(RecordError::NonFiniteReal {
                kind,
                attribute: attribute.to_string(),
            }),
            (expected, other) => Err(RecordError::TypeMismatch {
                kind,
                attribute: attribute.to_string(),
                expected,
                found: other.type_name(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecordState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Record {}

impl Debug for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Record")
            .field("id", &self.inner.id)
            .field("kind", &self.kind().as_str())
            .field("status", &state.status)
            .field("dirty", &state.dirty)
            .field("attributes", &state.attributes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeValue, DirtyRecords, Record, RecordData, RecordError, RecordStatus};
    use crate::model::entity::{AttributeDescriptor, AttributeType, EntityDescriptor};
    use std::cmp::Ordering;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn item_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::new(
                "Item",
                vec![
                    AttributeDescriptor::required("title", AttributeType::Text),
                    AttributeDescriptor::optional("price", AttributeType::Real),
                    AttributeDescriptor::optional("done", AttributeType::Bool),
                ],
            )
            .expect("valid descriptor"),
        )
    }

    fn inserted(dirty_records: &Arc<DirtyRecords>) -> Record {
        Record::new_inserted(item_descriptor(), dirty_records)
    }

    fn persisted(dirty_records: &Arc<DirtyRecords>, title: &str) -> Record {
        let mut attributes = BTreeMap::new();
        attributes.insert("title".to_string(), AttributeValue::from(title));
        Record::from_data(
            item_descriptor(),
            dirty_records,
            RecordData {
                id: uuid::Uuid::new_v4(),
                kind: "Item".to_string(),
                attributes,
            },
        )
    }

    #[test]
    fn set_marks_dirty_and_clones_share_state() {
        let dirty_records = Arc::new(DirtyRecords::default());
        let record = inserted(&dirty_records);
        let alias = record.clone();
        assert!(!record.is_dirty());

        alias.set("title", "milk").expect("set title");
        assert!(record.is_dirty());
        assert_eq!(record.get("title"), AttributeValue::Text("milk".to_string()));
        assert_eq!(record, alias);
    }

    #[test]
    fn set_enforces_schema() {
        let dirty_records = Arc::new(DirtyRecords::default());
        let record = inserted(&dirty_records);

        let unknown = record.set("colour", "red").expect_err("unknown attribute");
        assert!(matches!(unknown, RecordError::UnknownAttribute { .. }));

        let mismatch = record.set("title", 3).expect_err("integer into text");
        assert!(matches!(
            mismatch,
            RecordError::TypeMismatch {
                expected: AttributeType::Text,
                found: "integer",
                ..
            }
        ));

        let non_finite = record.set("price", f64::NAN).expect_err("nan real");
        assert!(matches!(non_finite, RecordError::NonFiniteReal { .. }));

        record.set("price", 4).expect("integer widens to real");
        assert_eq!(record.get("price"), AttributeValue::Real(4.0));
    }

    #[test]
    fn setting_null_removes_the_key() {
        let dirty_records = Arc::new(DirtyRecords::default());
        let record = inserted(&dirty_records);
        record.set("done", true).expect("set done");
        record.set("done", AttributeValue::Null).expect("clear done");
        assert!(!record.attributes().contains_key("done"));
        assert!(record.get("done").is_null());
    }

    #[test]
    fn deleted_and_invalidated_records_reject_writes() {
        let dirty_records = Arc::new(DirtyRecords::default());
        let record = inserted(&dirty_records);
        for status in [RecordStatus::Deleted, RecordStatus::Invalidated] {
            record.set_status(status);
            let err = record.set("title", "late").expect_err("write must fail");
            assert!(matches!(err, RecordError::NotLive { status: s, .. } if s == status));
        }
    }

    #[test]
    fn commit_snapshot_reports_first_missing_attribute() {
        let dirty_records = Arc::new(DirtyRecords::default());
        let record = inserted(&dirty_records);
        let err = record.commit_snapshot().err().expect("title missing");
        assert!(matches!(err, RecordError::MissingRequired { attribute, .. } if attribute == "title"));

        record.set("title", "bread").expect("set title");
        let snapshot = record.commit_snapshot().expect("now valid");
        assert_eq!(snapshot.data.id, record.id());
        assert_eq!(snapshot.generation, 1);
    }

    #[test]
    fn settle_keeps_edits_made_after_the_snapshot() {
        let dirty_records = Arc::new(DirtyRecords::default());
        let record = inserted(&dirty_records);
        record.set("title", "tea").expect("set title");
        let written = record.commit_snapshot().expect("snapshot");

        record.set("title", "coffee").expect("edit after snapshot");
        assert!(record.settle(written.generation));
        assert_eq!(record.status(), RecordStatus::Persisted);
        assert!(record.is_dirty());

        let rewritten = record.commit_snapshot().expect("snapshot");
        assert!(!record.settle(rewritten.generation));
        assert!(!record.is_dirty());
    }

    #[test]
    fn edits_to_persisted_records_are_tracked_until_released() {
        let dirty_records = Arc::new(DirtyRecords::default());
        let pending = inserted(&dirty_records);
        pending.set("title", "tea").expect("set title");
        assert!(dirty_records.lock().is_empty());

        let stored = persisted(&dirty_records, "milk");
        let id = stored.id();
        let handle = stored.downgrade();
        assert!(dirty_records.lock().is_empty());
        stored.set("title", "oat milk").expect("edit");
        drop(stored);

        assert!(handle.is_alive());
        let tracked = dirty_records.lock().remove(&id).expect("tracked");
        assert_eq!(tracked.get("title"), AttributeValue::from("oat milk"));
        drop(tracked);
        assert!(!handle.is_alive());
    }

    #[test]
    fn from_data_drops_null_values() {
        let mut attributes = BTreeMap::new();
        attributes.insert("title".to_string(), AttributeValue::from("tea"));
        attributes.insert("price".to_string(), AttributeValue::Null);
        let dirty_records = Arc::new(DirtyRecords::default());
        let record = Record::from_data(
            item_descriptor(),
            &dirty_records,
            RecordData {
                id: uuid::Uuid::new_v4(),
                kind: "Item".to_string(),
                attributes,
            },
        );

        assert_eq!(record.status(), RecordStatus::Persisted);
        assert_eq!(record.attributes().len(), 1);
        assert!(!record.is_dirty());
    }

    #[test]
    fn compare_is_family_scoped_and_sort_order_is_total() {
        let two = AttributeValue::Integer(2);
        let two_and_half = AttributeValue::Real(2.5);
        let text = AttributeValue::from("2");

        assert_eq!(two.compare(&two_and_half), Some(Ordering::Less));
        assert_eq!(two.compare(&text), None);
        assert_eq!(AttributeValue::Null.compare(&AttributeValue::Null), None);

        assert_eq!(AttributeValue::Null.sort_cmp(&two), Ordering::Less);
        assert_eq!(two_and_half.sort_cmp(&text), Ordering::Less);
        assert_eq!(
            AttributeValue::Bool(true).sort_cmp(&AttributeValue::Integer(0)),
            Ordering::Greater
        );
    }

    #[test]
    fn attribute_values_serialize_as_plain_json() {
        let mut attributes = BTreeMap::new();
        attributes.insert("a".to_string(), AttributeValue::Integer(3));
        attributes.insert("b".to_string(), AttributeValue::Real(1.5));
        attributes.insert("c".to_string(), AttributeValue::Bool(false));
        attributes.insert("d".to_string(), AttributeValue::from("x"));

        let json = serde_json::to_string(&attributes).expect("serialize");
        assert_eq!(json, r#"{"a":3,"b":1.5,"c":false,"d":"x"}"#);

        let parsed: BTreeMap<String, AttributeValue> =
            serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, attributes);
    }
}
