//! Process-level store: one container, one context, typed convenience APIs.
//!
//! # Responsibility
//! - Own the container/context lifecycle and bootstrap it lazily.
//! - Offer entity-typed insert/update/fetch/clear on top of `ObjectContext`.
//!
//! # Invariants
//! - The container is opened at most once per `Store`; a failed bootstrap is
//!   remembered and never retried.
//! - The config is validated at bootstrap; an invalid config fails it without
//!   reaching the engine.
//! - Construct one `Store` per process and pass it by reference; it is
//!   `Send + Sync`.

use crate::config::StoreConfig;
use crate::engine::{Engine, ManagedContext, SqliteEngine};
use crate::error::{FailurePolicy, StoreError, StoreResult};
use crate::facade::{ObjectContext, SharedContext};
use crate::model::entity::{Entity, EntityRegistry};
use crate::model::predicate::Predicate;
use crate::model::record::Record;
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Instant;

/// Lazily bootstrapped object store.
pub struct Store {
    config: StoreConfig,
    engine: Arc<dyn Engine>,
    registry: Arc<EntityRegistry>,
    context: OnceCell<Result<SharedContext, String>>,
}

impl Store {
    /// Builds a store without touching the engine.
    ///
    /// `config` is validated on first use, not here.
    pub fn new(config: StoreConfig, engine: Arc<dyn Engine>, registry: EntityRegistry) -> Self {
        Self {
            config,
            engine,
            registry: Arc::new(registry),
            context: OnceCell::new(),
        }
    }

    /// Builds a store over the SQLite engine described by `config`.
    pub fn open(config: StoreConfig, registry: EntityRegistry) -> Self {
        let engine = Arc::new(SqliteEngine::from_config(&config));
        Self::new(config, engine, registry)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// True once the container was opened successfully.
    pub fn is_bootstrapped(&self) -> bool {
        matches!(self.context.get(), Some(Ok(_)))
    }

    /// Alias for `create_object` routed by entity type.
    pub fn insert<E: Entity>(&self) -> StoreResult<Record> {
        self.create_object(E::ENTITY_NAME)
    }

    /// Returns the first record matching `filter`.
    ///
    /// Performs no mutation: edit the returned record, then `save_context`.
    pub fn update<E: Entity>(&self, filter: &Predicate) -> StoreResult<Option<Record>> {
        self.single_entity(E::ENTITY_NAME, filter)
    }

    /// Fetches matching records; `None` means the query itself failed.
    pub fn fetch_matching<E: Entity>(&self, filter: &Predicate) -> StoreResult<Option<Vec<Record>>> {
        self.with_context(|context| {
            match context.query(E::ENTITY_NAME, Some(filter), None) {
                Ok(records) => Ok(Some(records)),
                Err(StoreError::Query { kind, source }) => {
                    warn!(
                        "event=fetch_matching module=store status=error kind={kind} error_code=query_failed error={source}"
                    );
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })
        .map_err(|err| self.failure_policy().escalate("fetch_matching", err))
    }

    /// Every record of the entity, or `None` when the query failed.
    pub fn all_records<E: Entity>(&self) -> StoreResult<Option<Vec<Record>>> {
        self.fetch_matching::<E>(&Predicate::True)
    }

    /// Stages a delete for every record of the entity.
    ///
    /// Nothing becomes durable until `save_context`. Returns the number of
    /// records staged.
    pub fn clear_all<E: Entity>(&self) -> StoreResult<usize> {
        self.with_context(|context| {
            let records = context.query(E::ENTITY_NAME, None, None)?;
            for record in &records {
                context.delete_one(record)?;
            }
            info!(
                "event=clear_all module=store status=ok kind={} staged={}",
                E::ENTITY_NAME,
                records.len()
            );
            Ok(records.len())
        })
        .map_err(|err| self.failure_policy().escalate("clear_all", err))
    }

    fn shared_context(&self) -> StoreResult<&SharedContext> {
        self.context
            .get_or_init(|| self.bootstrap())
            .as_ref()
            .map_err(|reason| StoreError::Bootstrap {
                store: self.config.name.clone(),
                reason: reason.clone(),
            })
    }

    fn bootstrap(&self) -> Result<SharedContext, String> {
        let started_at = Instant::now();
        info!(
            "event=store_bootstrap module=store status=start store={}",
            self.config.name
        );

        if let Err(err) = self.config.validate() {
            error!(
                "event=store_bootstrap module=store status=error store={} error_code=invalid_config error={}",
                self.config.name, err
            );
            return Err(err.to_string());
        }

        match self.engine.open_or_create_store(&self.config.name) {
            Ok(container) => {
                info!(
                    "event=store_bootstrap module=store status=ok store={} kinds={} duration_ms={}",
                    self.config.name,
                    self.registry.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(SharedContext::new(
                    ManagedContext::new(container, Arc::clone(&self.registry)),
                    self.config.failure_policy,
                ))
            }
            Err(err) => {
                error!(
                    "event=store_bootstrap module=store status=error store={} duration_ms={} error_code=bootstrap_failed error={}",
                    self.config.name,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err.to_string())
            }
        }
    }
}

impl ObjectContext for Store {
    fn failure_policy(&self) -> FailurePolicy {
        self.config.failure_policy
    }

    fn with_context<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce(&mut ManagedContext) -> StoreResult<T>,
    {
        self.shared_context()?.with_context(operation)
    }
}
