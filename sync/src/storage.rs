//! Local persistence engine interface and the in-memory implementation.

use crate::error::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use tether_engine::{
    LocalState, ModelRegistry, OutboxEntry, Query, Record, RecordRef, StoreSnapshot, SyncCursor,
    WriteBatch,
};
use tokio::sync::RwLock;

/// Durable storage for records, outbox entries and sync cursors.
///
/// A batch passed to [`LocalStore::commit`] is one transaction: either every
/// write lands or none does.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// A record by key, tombstones included.
    async fn get(&self, model: &str, key: &str) -> Result<Option<Record>, StorageError>;

    /// Active records of a model matching the query.
    async fn query(&self, model: &str, query: &Query) -> Result<Vec<Record>, StorageError>;

    /// Persisted outbox entries in queue order.
    async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>, StorageError>;

    async fn cursor(&self, model: &str) -> Result<Option<SyncCursor>, StorageError>;

    /// Remove all records, outbox entries and cursors.
    async fn clear(&self) -> Result<(), StorageError>;

    async fn save(&self, record: Record) -> Result<(), StorageError> {
        self.commit(WriteBatch::new().save(record)).await
    }

    /// Remove a record outright, without leaving a tombstone.
    async fn delete(&self, target: RecordRef) -> Result<(), StorageError> {
        self.commit(WriteBatch::new().purge(target)).await
    }
}

/// In-memory store over [`LocalState`].
///
/// Snapshots stand in for the on-disk file, so a store can be "reopened"
/// from a snapshot of another.
#[derive(Debug)]
pub struct MemoryStore {
    registry: Arc<ModelRegistry>,
    state: RwLock<LocalState>,
}

impl MemoryStore {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            state: RwLock::new(LocalState::new()),
        }
    }

    /// Open a store holding the state of a snapshot.
    pub fn from_snapshot(
        registry: Arc<ModelRegistry>,
        snapshot: StoreSnapshot,
    ) -> Result<Self, StorageError> {
        let mut state = LocalState::new();
        state.import_state(&registry, snapshot)?;
        Ok(Self {
            registry,
            state: RwLock::new(state),
        })
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.export_state(self.registry.version())
    }

    /// Count active records across all models.
    pub async fn record_count(&self) -> usize {
        self.state.read().await.record_count()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let writes = batch.len();
        self.state.write().await.apply(&self.registry, batch)?;
        tracing::trace!(writes, "Committed batch");
        Ok(())
    }

    async fn get(&self, model: &str, key: &str) -> Result<Option<Record>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .get_including_deleted(model, key)
            .cloned())
    }

    async fn query(&self, model: &str, query: &Query) -> Result<Vec<Record>, StorageError> {
        self.registry.require(model)?;
        Ok(self.state.read().await.query(model, query))
    }

    async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        Ok(self.state.read().await.outbox_entries().cloned().collect())
    }

    async fn cursor(&self, model: &str) -> Result<Option<SyncCursor>, StorageError> {
        Ok(self.state.read().await.cursor(model).cloned())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.state.write().await.clear();
        Ok(())
    }
}
