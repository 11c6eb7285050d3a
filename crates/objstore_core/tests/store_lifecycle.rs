use objstore_core::{
    AttributeDescriptor, AttributeType, AttributeValue, ChangeSet, Engine, EngineOperation,
    EngineResult, Entity, EntityError, EntityKind, EntityRegistry, FailurePolicy, MemoryEngine,
    ObjectContext, PersistentContainer, Predicate, Record, RecordData, RecordError, RecordId,
    SortDescriptor, Store, StoreBackend, StoreConfig, StoreError, FATAL_EXIT_CODE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

struct Item;

impl Entity for Item {
    const ENTITY_NAME: &'static str = "Item";

    fn attributes() -> Vec<AttributeDescriptor> {
        vec![
            AttributeDescriptor::required("title", AttributeType::Text),
            AttributeDescriptor::optional("qty", AttributeType::Integer),
        ]
    }
}

struct Tag;

impl Entity for Tag {
    const ENTITY_NAME: &'static str = "Tag";

    fn attributes() -> Vec<AttributeDescriptor> {
        vec![AttributeDescriptor::required("label", AttributeType::Text)]
    }
}

fn registry() -> EntityRegistry {
    EntityRegistry::new()
        .with_entity::<Item>()
        .and_then(EntityRegistry::with_entity::<Tag>)
        .expect("registry")
}

fn store_over(engine: &MemoryEngine) -> Store {
    Store::new(
        StoreConfig::in_memory("shopping").with_failure_policy(FailurePolicy::Propagate),
        Arc::new(engine.clone()),
        registry(),
    )
}

fn insert_item(store: &Store, title: &str, qty: i64) -> Record {
    let record = store.insert::<Item>().expect("insert");
    record.set("title", title).expect("title");
    record.set("qty", qty).expect("qty");
    record
}

fn titles(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| record.get("title").as_text().map(str::to_string))
        .collect()
}

#[test]
fn store_bootstraps_lazily_on_first_use() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);

    assert!(!store.is_bootstrapped());
    assert_eq!(engine.call_count(EngineOperation::OpenStore), 0);

    store.all_records::<Item>().expect("all records");
    store.all_records::<Item>().expect("all records again");
    assert!(store.is_bootstrapped());
    assert_eq!(engine.call_count(EngineOperation::OpenStore), 1);
}

#[test]
fn failed_bootstrap_is_cached_and_never_retried() {
    let engine = MemoryEngine::new();
    engine.fail(EngineOperation::OpenStore);
    let store = store_over(&engine);

    let first = store.insert::<Item>().expect_err("bootstrap fails");
    assert!(matches!(first, StoreError::Bootstrap { ref store, .. } if store == "shopping"));

    engine.recover(EngineOperation::OpenStore);
    let second = store.all_records::<Item>().expect_err("still failing");
    assert_eq!(second.error_code(), "bootstrap_failed");
    assert!(!store.is_bootstrapped());
    assert_eq!(engine.call_count(EngineOperation::OpenStore), 1);
}

#[test]
fn saved_records_survive_reopen() {
    let engine = MemoryEngine::new();
    {
        let store = store_over(&engine);
        insert_item(&store, "milk", 2);
        insert_item(&store, "bread", 1);
        assert!(store.save_context().expect("save"));
    }

    let reopened = store_over(&engine);
    let records = reopened
        .all_records::<Item>()
        .expect("all records")
        .expect("query succeeded");
    assert_eq!(titles(&records), vec!["milk", "bread"]);
}

#[test]
fn unsaved_records_are_visible_but_not_durable() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "eggs", 12);

    let pending = store
        .all_records::<Item>()
        .expect("all records")
        .expect("query succeeded");
    assert_eq!(titles(&pending), vec!["eggs"]);
    assert!(store.has_changes().expect("has changes"));
    assert!(engine.durable_records("shopping", "Item").is_empty());
}

#[test]
fn clear_all_of_saved_records_is_staged_until_save() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    for (title, qty) in [("a", 1), ("b", 2), ("c", 3)] {
        insert_item(&store, title, qty);
    }
    store.save_context().expect("save");

    assert_eq!(store.clear_all::<Item>().expect("clear"), 3);
    let visible = store
        .all_records::<Item>()
        .expect("all records")
        .expect("query succeeded");
    assert!(visible.is_empty());

    let reopened = store_over(&engine);
    let durable = reopened
        .all_records::<Item>()
        .expect("all records")
        .expect("query succeeded");
    assert_eq!(durable.len(), 3);
}

#[test]
fn clear_all_of_unsaved_records_discards_them() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    let records: Vec<Record> = [("a", 1), ("b", 2), ("c", 3)]
        .into_iter()
        .map(|(title, qty)| insert_item(&store, title, qty))
        .collect();

    assert_eq!(store.clear_all::<Item>().expect("clear"), 3);
    assert!(records.iter().all(Record::is_invalidated));
    assert!(store
        .all_records::<Item>()
        .expect("all records")
        .expect("query succeeded")
        .is_empty());
    assert!(!store.save_context().expect("nothing to save"));

    let reopened = store_over(&engine);
    assert!(reopened
        .all_records::<Item>()
        .expect("all records")
        .expect("query succeeded")
        .is_empty());
}

#[test]
fn clear_all_then_save_removes_durable_records() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "a", 1);
    store.save_context().expect("save");

    store.clear_all::<Item>().expect("clear");
    assert!(store.save_context().expect("save deletes"));
    assert!(engine.durable_records("shopping", "Item").is_empty());
}

#[test]
fn fetch_matching_reports_query_failure_as_none() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "a", 1);
    store.save_context().expect("save");

    engine.fail(EngineOperation::Query);
    assert!(store
        .fetch_matching::<Item>(&Predicate::eq("title", "a"))
        .expect("query failure is not an error")
        .is_none());
    assert!(store
        .fetch("Item", None, None)
        .expect("fetch swallows failure")
        .is_empty());

    engine.recover(EngineOperation::Query);
    let found = store
        .fetch_matching::<Item>(&Predicate::eq("title", "a"))
        .expect("fetch")
        .expect("query succeeded");
    assert_eq!(found.len(), 1);
}

#[test]
fn fetch_matching_filters_by_predicate() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "apple", 3);
    insert_item(&store, "banana", 7);
    insert_item(&store, "apricot", 9);
    store.save_context().expect("save");

    let found = store
        .fetch_matching::<Item>(&Predicate::begins_with("title", "ap").and(Predicate::gt("qty", 5)))
        .expect("fetch")
        .expect("query succeeded");
    assert_eq!(titles(&found), vec!["apricot"]);
}

#[test]
fn repeated_save_without_changes_commits_once() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "a", 1);

    assert!(store.save_context().expect("first save"));
    assert!(!store.save_context().expect("second save"));
    assert_eq!(engine.call_count(EngineOperation::Commit), 1);
}

#[test]
fn batch_delete_is_durable_without_save() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    let record = insert_item(&store, "a", 1);
    let tag = store.insert::<Tag>().expect("tag");
    tag.set("label", "groceries").expect("label");
    store.save_context().expect("save");

    assert_eq!(store.batch_delete("Item").expect("batch delete"), 1);
    assert!(record.is_invalidated());
    assert!(store.fetch("Item", None, None).expect("fetch").is_empty());
    assert!(engine.durable_records("shopping", "Item").is_empty());
    assert_eq!(engine.durable_records("shopping", "Tag").len(), 1);
}

#[test]
fn update_returns_live_record_that_saves_edits() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "milk", 1);
    insert_item(&store, "bread", 1);
    store.save_context().expect("save");

    let record = store
        .update::<Item>(&Predicate::eq("title", "milk"))
        .expect("update")
        .expect("match");
    assert!(!store.has_changes().expect("has changes"));

    record.set("qty", 4).expect("qty");
    assert!(store.has_changes().expect("has changes"));
    assert!(store.save_context().expect("save edit"));

    let reopened = store_over(&engine);
    let milk = reopened
        .update::<Item>(&Predicate::eq("title", "milk"))
        .expect("update")
        .expect("match");
    assert_eq!(milk.get("qty").as_integer(), Some(4));
    assert!(store
        .update::<Item>(&Predicate::eq("title", "butter"))
        .expect("update")
        .is_none());
}

#[test]
fn fetch_returns_the_same_handle_for_one_record() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "a", 1);
    store.save_context().expect("save");

    let first = store
        .single_entity("Item", &Predicate::True)
        .expect("single")
        .expect("record");
    first.set("qty", 5).expect("qty");
    let second = store
        .single_entity("Item", &Predicate::True)
        .expect("single")
        .expect("record");
    assert_eq!(second.get("qty").as_integer(), Some(5));
}

#[test]
fn missing_required_attribute_fails_save_and_keeps_changes() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    let record = store.insert::<Item>().expect("insert");

    let err = store.save_context().expect_err("title is required");
    assert!(matches!(
        err,
        StoreError::Record(RecordError::MissingRequired { ref attribute, .. }) if attribute == "title"
    ));
    assert_eq!(engine.call_count(EngineOperation::Commit), 0);

    record.set("title", "fixed").expect("title");
    assert!(store.save_context().expect("save"));
}

#[test]
fn commit_failure_propagates_and_keeps_pending_changes() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);
    insert_item(&store, "a", 1);

    engine.fail(EngineOperation::Commit);
    let err = store.save_context().expect_err("commit fails");
    assert_eq!(err.error_code(), "commit_failed");
    assert!(store.has_changes().expect("has changes"));

    engine.recover(EngineOperation::Commit);
    assert!(store.save_context().expect("retry save"));
    assert_eq!(engine.durable_records("shopping", "Item").len(), 1);
}

#[test]
fn unknown_entity_is_an_error() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);

    let err = store.create_object("Ghost").expect_err("unknown entity");
    assert!(matches!(
        err,
        StoreError::Entity(EntityError::UnknownEntity(ref name)) if name == "Ghost"
    ));
}

#[test]
fn concurrent_inserts_share_one_context() {
    let engine = MemoryEngine::new();
    let store = store_over(&engine);

    std::thread::scope(|scope| {
        for worker in 0..4_i64 {
            let store = &store;
            scope.spawn(move || {
                for index in 0..5_i64 {
                    insert_item(store, &format!("item-{worker}-{index}"), index);
                }
            });
        }
    });

    assert!(store.save_context().expect("save"));
    assert_eq!(engine.durable_records("shopping", "Item").len(), 20);
    assert_eq!(engine.call_count(EngineOperation::OpenStore), 1);
}

/// Pauses the next armed commit until the test releases it.
struct CommitGate {
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl CommitGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        })
    }
}

struct GatedEngine {
    inner: MemoryEngine,
    gate: Arc<CommitGate>,
}

impl Engine for GatedEngine {
    fn open_or_create_store(&self, name: &str) -> EngineResult<PersistentContainer> {
        let inner = self.inner.open_or_create_store(name)?;
        Ok(PersistentContainer::new(
            name,
            Arc::new(GatedBackend {
                inner,
                gate: Arc::clone(&self.gate),
            }),
        ))
    }
}

struct GatedBackend {
    inner: PersistentContainer,
    gate: Arc<CommitGate>,
}

impl StoreBackend for GatedBackend {
    fn query(
        &self,
        kind: &EntityKind,
        filter: Option<&Predicate>,
        sort: Option<&SortDescriptor>,
    ) -> EngineResult<Vec<RecordData>> {
        self.inner.backend().query(kind, filter, sort)
    }

    fn delete_bulk(&self, kind: &EntityKind) -> EngineResult<Vec<RecordId>> {
        self.inner.backend().delete_bulk(kind)
    }

    fn commit(&self, changes: &ChangeSet) -> EngineResult<()> {
        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.entered.wait();
            self.gate.release.wait();
        }
        self.inner.backend().commit(changes)
    }
}

fn gated_store(engine: &MemoryEngine, gate: &Arc<CommitGate>) -> Store {
    Store::new(
        StoreConfig::in_memory("shopping").with_failure_policy(FailurePolicy::Propagate),
        Arc::new(GatedEngine {
            inner: engine.clone(),
            gate: Arc::clone(gate),
        }),
        registry(),
    )
}

/// Runs `save_context` on another thread and calls `edit` while the engine
/// commit is in flight.
fn save_while_editing(store: &Store, gate: &CommitGate, edit: impl FnOnce()) {
    gate.armed.store(true, Ordering::SeqCst);
    std::thread::scope(|scope| {
        let saver = scope.spawn(|| store.save_context().map_err(|err| err.to_string()));
        gate.entered.wait();
        edit();
        gate.release.wait();
        let saved = saver.join().expect("saver thread");
        assert_eq!(saved, Ok(true));
    });
}

fn durable_qty(engine: &MemoryEngine) -> Option<AttributeValue> {
    engine
        .durable_records("shopping", "Item")
        .first()
        .and_then(|row| row.attributes.get("qty").cloned())
}

#[test]
fn edit_during_save_of_an_update_stays_pending() {
    let engine = MemoryEngine::new();
    let gate = CommitGate::new();
    let store = gated_store(&engine, &gate);
    let record = insert_item(&store, "milk", 1);
    store.save_context().expect("initial save");

    record.set("qty", 5).expect("first edit");
    save_while_editing(&store, &gate, || record.set("qty", 2).expect("edit during save"));

    assert_eq!(durable_qty(&engine), Some(AttributeValue::Integer(5)));
    assert!(record.is_dirty());
    assert!(store.has_changes().expect("has changes"));

    assert!(store.save_context().expect("second save"));
    assert_eq!(durable_qty(&engine), Some(AttributeValue::Integer(2)));
    assert!(!store.has_changes().expect("has changes"));
}

#[test]
fn edit_during_save_of_an_insert_becomes_an_update() {
    let engine = MemoryEngine::new();
    let gate = CommitGate::new();
    let store = gated_store(&engine, &gate);
    let record = insert_item(&store, "milk", 1);

    save_while_editing(&store, &gate, || record.set("qty", 3).expect("edit during save"));

    assert_eq!(durable_qty(&engine), Some(AttributeValue::Integer(1)));
    assert!(store.has_changes().expect("has changes"));
    assert!(store.save_context().expect("second save"));
    assert_eq!(durable_qty(&engine), Some(AttributeValue::Integer(3)));
    assert_eq!(engine.durable_records("shopping", "Item").len(), 1);
}

#[test]
fn invalid_config_fails_bootstrap_without_opening_the_engine() {
    let engine = MemoryEngine::new();
    let config = StoreConfig {
        busy_timeout_ms: 0,
        ..StoreConfig::in_memory("shopping").with_failure_policy(FailurePolicy::Propagate)
    };
    let store = Store::new(config, Arc::new(engine.clone()), registry());

    let err = store.insert::<Item>().expect_err("invalid config");
    assert_eq!(err.error_code(), "bootstrap_failed");
    assert!(err.to_string().contains("busy_timeout_ms"));
    assert_eq!(engine.call_count(EngineOperation::OpenStore), 0);
}

#[test]
fn fatal_policy_exits_the_process() {
    const CHILD_FLAG: &str = "OBJSTORE_FATAL_CHILD";

    if std::env::var_os(CHILD_FLAG).is_some() {
        let engine = MemoryEngine::new();
        engine.fail(EngineOperation::OpenStore);
        let store = Store::new(
            StoreConfig::in_memory("shopping"),
            Arc::new(engine),
            registry(),
        );
        let _ = store.insert::<Item>();
        unreachable!("fatal policy returned control to the caller");
    }

    let status = std::process::Command::new(std::env::current_exe().expect("test binary"))
        .args(["fatal_policy_exits_the_process", "--exact", "--test-threads=1"])
        .env(CHILD_FLAG, "1")
        .status()
        .expect("spawn child");
    assert_eq!(status.code(), Some(FATAL_EXIT_CODE));
}
