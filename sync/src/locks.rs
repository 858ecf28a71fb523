//! Per-record serialization.
//!
//! Writers of one record (local saves, the mutation processor, remote
//! changes) take the record's lock around the single operation they perform.
//! Different records never contend.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tether_engine::RecordRef;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<RecordRef, Arc<Mutex<()>>>;

/// Table of per-record async locks. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct RecordLocks {
    table: Arc<LockTable>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one record.
    pub async fn lock(&self, record: &RecordRef) -> RecordGuard {
        let mutex = self.table.entry(record.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        RecordGuard {
            record: record.clone(),
            guard: Some(guard),
            table: self.table.clone(),
        }
    }

    /// Lock several records at once. Locks are taken in sorted order so two
    /// callers locking overlapping sets cannot deadlock.
    pub async fn lock_many(
        &self,
        records: impl IntoIterator<Item = RecordRef>,
    ) -> Vec<RecordGuard> {
        let sorted: BTreeSet<RecordRef> = records.into_iter().collect();
        let mut guards = Vec::with_capacity(sorted.len());
        for record in &sorted {
            guards.push(self.lock(record).await);
        }
        guards
    }

    /// Number of records with a live lock.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Exclusive access to one record; released on drop.
#[derive(Debug)]
pub struct RecordGuard {
    record: RecordRef,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl RecordGuard {
    pub fn record(&self) -> &RecordRef {
        &self.record
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Nobody else holds or waits on the mutex while the shard is locked
        // and only the table's reference remains
        self.table
            .remove_if(&self.record, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
