//! The data store facade: local reads and writes, observation, and control
//! of the remote sync engine.
//!
//! Every local write validates the record, takes the record lock, and
//! commits the record change together with its outbox entry in one batch.
//! If that commit fails the in-memory outbox is rolled back as well, so
//! the queue never holds a mutation the store does not.

use crate::api::{AnonymousAuth, AuthProvider, GraphQlApi};
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::engine::RemoteSyncEngine;
use crate::error::{DataStoreError, Result};
use crate::locks::{RecordGuard, RecordLocks};
use crate::now_millis;
use crate::outbox::OutboxQueue;
use crate::publisher::{DataStoreEvent, EventFilter, EventPublisher, Subscription};
use crate::state::EngineState;
use crate::storage::{LocalStore, MemoryStore};
use std::sync::Arc;
use tether_engine::{
    CascadeWalk, ChangeSet, ConflictHandler, ConflictResolver, EnqueueOutcome, Error,
    ModelRegistry, MutationEvent, Origin, Outbox, OutboxEntry, Predicate, Query, Record,
    RecordRef, WriteBatch,
};
use tokio::sync::watch;

/// Builder for [`DataStore`].
pub struct DataStoreBuilder {
    registry: Arc<ModelRegistry>,
    store: Option<Arc<dyn LocalStore>>,
    api: Option<Arc<dyn GraphQlApi>>,
    auth: Arc<dyn AuthProvider>,
    config: SyncConfig,
    handler: Option<Arc<dyn ConflictHandler>>,
}

impl DataStoreBuilder {
    pub fn new(registry: impl Into<Arc<ModelRegistry>>) -> Self {
        Self {
            registry: registry.into(),
            store: None,
            api: None,
            auth: Arc::new(AnonymousAuth),
            config: SyncConfig::default(),
            handler: None,
        }
    }

    /// Persist into the given store instead of a fresh in-memory one.
    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sync with a remote. Without one the data store is local only.
    pub fn with_api(mut self, api: Arc<dyn GraphQlApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Decide rejected mutations with custom logic instead of the merge
    /// strategy.
    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Open the data store, restoring the outbox the store persisted.
    pub async fn build(self) -> Result<DataStore> {
        self.config.validate()?;
        let registry = self.registry;
        let store: Arc<dyn LocalStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new(registry.clone())),
        };

        let persisted = store.outbox_entries().await?;
        let (outbox, repairs) = Outbox::restore(persisted, self.config.mutation_retry.max_attempts);
        if !repairs.is_empty() {
            store.commit(WriteBatch::new().outbox(&repairs)).await?;
        }

        let mut resolver = ConflictResolver::new(self.config.merge_strategy);
        if let Some(handler) = self.handler {
            resolver = resolver.with_handler(handler);
        }

        tracing::info!(
            models = registry.models().count(),
            schema_version = registry.version(),
            pending = outbox.len(),
            remote = self.api.is_some(),
            "Data store opened"
        );

        let ctx = Arc::new(SyncContext {
            publisher: EventPublisher::new(self.config.event_buffer),
            outbox: OutboxQueue::new(outbox),
            locks: RecordLocks::new(),
            resolver,
            config: self.config,
            registry,
            store,
        });
        let engine = self
            .api
            .map(|api| RemoteSyncEngine::new(ctx.clone(), api, self.auth));

        Ok(DataStore { ctx, engine })
    }
}

/// An offline-first data store.
pub struct DataStore {
    ctx: Arc<SyncContext>,
    engine: Option<RemoteSyncEngine>,
}

impl DataStore {
    pub fn builder(registry: impl Into<Arc<ModelRegistry>>) -> DataStoreBuilder {
        DataStoreBuilder::new(registry)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.ctx.registry
    }

    /// Start syncing with the remote.
    pub async fn start(&self) {
        match &self.engine {
            Some(engine) => engine.start().await,
            None => tracing::info!("No remote configured, running local only"),
        }
    }

    /// Stop syncing. Local reads and writes keep working.
    pub async fn stop(&self) {
        if let Some(engine) = &self.engine {
            engine.stop().await;
        }
    }

    pub fn state(&self) -> EngineState {
        self.engine
            .as_ref()
            .map(RemoteSyncEngine::state)
            .unwrap_or_default()
    }

    /// Watch the sync engine's state. `None` without a remote.
    pub fn state_changes(&self) -> Option<watch::Receiver<EngineState>> {
        self.engine.as_ref().map(RemoteSyncEngine::watch)
    }

    /// Create or update a record.
    ///
    /// With a condition the save only happens if the current local record
    /// matches it; the condition is also sent to the remote.
    ///
    /// The records it references are locked too, so a cascade delete of a
    /// parent cannot miss a child saved concurrently.
    pub async fn save(&self, record: Record, condition: Option<Predicate>) -> Result<Record> {
        let ctx = &self.ctx;
        ctx.registry.validate(&record)?;

        let target = record.record_ref();
        let parents = ctx.registry.parents_of(&record);
        let _guards = ctx
            .locks
            .lock_many(parents.into_iter().chain([target.clone()]))
            .await;
        let now = now_millis();

        let existing = ctx
            .store
            .get(&target.model, &target.key)
            .await?
            .filter(Record::is_active);
        if let Some(condition) = &condition {
            if !existing.as_ref().is_some_and(|current| condition.matches(current)) {
                return Err(DataStoreError::ConditionFailed(target.to_string()));
            }
        }

        let mut saved = record;
        saved.sync.version = existing.as_ref().and_then(|current| current.sync.version);
        saved.sync.last_changed_at = now;
        saved.sync.deleted = false;
        saved.sync.pending = true;

        let mut event = match &existing {
            None => MutationEvent::create(new_mutation_id(), &saved, now),
            Some(current) => {
                MutationEvent::update(new_mutation_id(), &saved, current.sync.version, now)
            }
        };
        if let Some(condition) = condition {
            event = event.with_condition(condition);
        }

        let (outcome, changes) = ctx.outbox.enqueue(event.clone(), now)?;
        let batch = WriteBatch::new().save(saved.clone()).outbox(&changes);
        ctx.commit(batch, changes).await?;
        ctx.outbox.wake();

        tracing::debug!(record = %target, kind = %event.kind, "Saved locally");
        ctx.publish(DataStoreEvent::Mutation {
            event,
            origin: Origin::Local,
        });
        publish_enqueued(ctx, outcome);
        ctx.publish_outbox_status();
        Ok(saved)
    }

    /// Delete a record and, first, every record that depends on it.
    ///
    /// Returns the deleted records, dependents before the root. The
    /// condition applies to the root only.
    pub async fn delete(
        &self,
        model: &str,
        key: &str,
        condition: Option<Predicate>,
    ) -> Result<Vec<RecordRef>> {
        let ctx = &self.ctx;
        ctx.registry.require(model)?;

        let root = RecordRef::new(model, key);
        let (targets, _guards) = self.lock_cascade(&root).await?;
        let now = now_millis();

        let Some(parent) = ctx.store.get(model, key).await?.filter(Record::is_active) else {
            return Err(Error::RecordNotFound {
                model: model.to_string(),
                key: key.to_string(),
            }
            .into());
        };
        if let Some(condition) = &condition {
            if !condition.matches(&parent) {
                return Err(DataStoreError::ConditionFailed(root.to_string()));
            }
        }

        let mut batch = WriteBatch::new();
        let mut changes = ChangeSet::default();
        let mut deleted = Vec::new();
        let mut published = Vec::new();

        for target in &targets {
            let record = if target == &root {
                Some(parent.clone())
            } else {
                match ctx.store.get(&target.model, &target.key).await {
                    Ok(record) => record.filter(Record::is_active),
                    Err(e) => {
                        ctx.outbox.rollback(changes);
                        return Err(e.into());
                    }
                }
            };
            let Some(mut record) = record else {
                continue;
            };

            let mut event = MutationEvent::delete(
                new_mutation_id(),
                &target.model,
                &target.key,
                record.sync.version,
                now,
            );
            if let (true, Some(condition)) = (target == &root, condition.clone()) {
                event = event.with_condition(condition);
            }

            let outcome = match ctx.outbox.enqueue(event.clone(), now) {
                Ok((outcome, enqueued)) => {
                    changes.extend(enqueued);
                    outcome
                }
                Err(e) => {
                    ctx.outbox.rollback(changes);
                    return Err(e.into());
                }
            };

            // A record the remote never saw leaves nothing behind
            if matches!(outcome, EnqueueOutcome::Cancelled) && !record.sync.is_confirmed() {
                batch = batch.purge(target.clone());
            } else {
                record.mark_deleted(now);
                batch = batch.save(record);
            }
            deleted.push(target.clone());
            published.push((event, outcome));
        }

        batch.extend_outbox(&changes);
        ctx.commit(batch, changes).await?;
        ctx.outbox.wake();

        tracing::debug!(record = %root, cascade = deleted.len() - 1, "Deleted locally");
        for (event, outcome) in published {
            ctx.publish(DataStoreEvent::Mutation {
                event,
                origin: Origin::Local,
            });
            publish_enqueued(ctx, outcome);
        }
        ctx.publish_outbox_status();
        Ok(deleted)
    }

    /// Lock `root` and its dependents, walking again under the locks until
    /// no dependent appeared in between. Returns the targets, root last.
    async fn lock_cascade(&self, root: &RecordRef) -> Result<(Vec<RecordRef>, Vec<RecordGuard>)> {
        let mut dependents = self.dependents(root).await?;
        loop {
            let targets: Vec<RecordRef> =
                dependents.iter().cloned().chain([root.clone()]).collect();
            let guards = self.ctx.locks.lock_many(targets.iter().cloned()).await;

            let current = self.dependents(root).await?;
            if current.iter().all(|record| dependents.contains(record)) {
                return Ok((targets, guards));
            }
            tracing::debug!(record = %root, "Dependents changed while locking, walking again");
            drop(guards);
            dependents = current;
        }
    }

    /// Records that must be deleted along with `root`, children first.
    async fn dependents(&self, root: &RecordRef) -> Result<Vec<RecordRef>> {
        let ctx = &self.ctx;
        let mut walk = CascadeWalk::new(&ctx.registry, root.clone());
        while let Some(lookup) = walk.next_lookup() {
            let query = Query::filter(Predicate::eq(
                lookup.foreign_key.clone(),
                lookup.parent.clone(),
            ));
            let children = ctx.store.query(&lookup.model, &query).await?;
            walk.supply(&lookup, children.into_iter().map(|record| record.key));
        }
        Ok(walk.finish())
    }

    /// An active record by key.
    pub async fn get(&self, model: &str, key: &str) -> Result<Option<Record>> {
        self.ctx.registry.require(model)?;
        Ok(self
            .ctx
            .store
            .get(model, key)
            .await?
            .filter(Record::is_active))
    }

    pub async fn query(&self, model: &str, query: impl Into<Query>) -> Result<Vec<Record>> {
        self.ctx.registry.require(model)?;
        Ok(self.ctx.store.query(model, &query.into()).await?)
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.ctx.publisher.subscribe(filter)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.ctx.publisher.subscribe_all()
    }

    /// Changes to records of one model, local and remote.
    pub fn observe(&self, model: &str) -> Subscription {
        let model = model.to_string();
        self.ctx.publisher.subscribe(Arc::new(move |event| {
            matches!(event, DataStoreEvent::Mutation { event, .. } if event.model == model)
        }))
    }

    /// Mutations not yet acknowledged by the remote, in send order.
    pub fn pending_mutations(&self) -> Vec<OutboxEntry> {
        self.ctx.outbox.snapshot()
    }

    /// Stop syncing and remove every record, outbox entry and cursor.
    pub async fn clear(&self) -> Result<()> {
        self.stop().await;
        self.ctx.store.clear().await?;
        self.ctx
            .outbox
            .reset(Outbox::new(self.ctx.config.mutation_retry.max_attempts));
        tracing::info!("Data store cleared");
        self.ctx.publish_outbox_status();
        Ok(())
    }
}

fn publish_enqueued(ctx: &SyncContext, outcome: EnqueueOutcome) {
    if let EnqueueOutcome::Appended(entry) | EnqueueOutcome::Coalesced(entry) = outcome {
        ctx.publish(DataStoreEvent::OutboxMutationEnqueued { event: entry.event });
    }
}

fn new_mutation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
