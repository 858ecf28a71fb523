//! State shared by the data store facade and the sync engine's tasks.

use crate::config::SyncConfig;
use crate::error::Result;
use crate::locks::RecordLocks;
use crate::outbox::OutboxQueue;
use crate::publisher::{DataStoreEvent, EventPublisher};
use crate::storage::LocalStore;
use std::sync::Arc;
use tether_engine::{ChangeSet, ConflictResolver, ModelRegistry, WriteBatch};

/// Handles to everything a local or remote writer touches.
pub(crate) struct SyncContext {
    pub registry: Arc<ModelRegistry>,
    pub store: Arc<dyn LocalStore>,
    pub outbox: OutboxQueue,
    pub locks: RecordLocks,
    pub publisher: EventPublisher,
    pub resolver: ConflictResolver,
    pub config: SyncConfig,
}

impl SyncContext {
    /// Commit a batch that carries the given outbox changes, undoing them in
    /// memory if the store rejects the batch.
    pub async fn commit(&self, batch: WriteBatch, changes: ChangeSet) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.store.commit(batch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.outbox.rollback(changes);
                Err(e.into())
            }
        }
    }

    pub fn publish(&self, event: DataStoreEvent) {
        self.publisher.publish(event);
    }

    pub fn publish_outbox_status(&self) {
        self.publish(DataStoreEvent::OutboxStatus {
            is_empty: self.outbox.is_empty(),
        });
    }
}
