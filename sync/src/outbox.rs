//! Shared outbox used by local writers and the mutation processor.

use crate::locks::{RecordGuard, RecordLocks};
use parking_lot::Mutex;
use std::time::Duration;
use tether_engine::{
    error::Result, ChangeSet, EnqueueOutcome, MutationEvent, Outbox, OutboxEntry, RecordRef,
    Timestamp,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::now_millis;

/// The in-memory outbox behind a short synchronous lock, with a wake-up
/// signal for the drain loop.
///
/// Callers persist the [`ChangeSet`] of every mutating call in the same
/// store transaction as the record change, and [`OutboxQueue::rollback`] if
/// that commit fails.
/// An entry handed out by [`OutboxQueue::next_ready`].
///
/// The record lock is still held: `changes` marks the entry dispatched and
/// must be committed before the guard is dropped and the entry sent.
pub struct Checkout {
    pub entry: OutboxEntry,
    pub changes: ChangeSet,
    pub guard: RecordGuard,
}

#[derive(Debug)]
pub struct OutboxQueue {
    outbox: Mutex<Outbox>,
    notify: Notify,
}

impl OutboxQueue {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox: Mutex::new(outbox),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(
        &self,
        event: MutationEvent,
        now: Timestamp,
    ) -> Result<(EnqueueOutcome, ChangeSet)> {
        self.outbox.lock().enqueue(event, now)
    }

    pub fn rollback(&self, changes: ChangeSet) {
        self.outbox.lock().rollback(changes);
    }

    /// Run a closure against the outbox under its lock.
    pub fn with<T>(&self, f: impl FnOnce(&mut Outbox) -> T) -> T {
        f(&mut self.outbox.lock())
    }

    /// Wake the drain loop after new entries became ready.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Replace the whole queue, e.g. after the store was cleared.
    pub fn reset(&self, outbox: Outbox) {
        *self.outbox.lock() = outbox;
        self.wake();
    }

    /// Return every in-flight entry to the queue. Used when a sync cycle
    /// ends before their responses were handled.
    pub fn release_all(&self) -> ChangeSet {
        let mut outbox = self.outbox.lock();
        let in_flight: Vec<_> = outbox
            .entries()
            .filter(|entry| entry.is_in_flight())
            .map(|entry| entry.id)
            .collect();

        let mut changes = ChangeSet::default();
        for id in in_flight {
            if let Ok(released) = outbox.release(id) {
                changes.extend(released);
            }
        }
        changes
    }

    pub fn snapshot(&self) -> Vec<OutboxEntry> {
        self.outbox.lock().entries().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.lock().is_empty()
    }

    pub fn has_pending(&self, record: &RecordRef) -> bool {
        self.outbox.lock().has_pending(record)
    }

    /// Wait for the next ready entry and check it out.
    ///
    /// The record lock is taken before the checkout so an entry whose record
    /// is mid-commit is never handed out. Returns `None` when cancelled.
    pub async fn next_ready(
        &self,
        locks: &RecordLocks,
        cancel: &CancellationToken,
    ) -> Option<Checkout> {
        loop {
            // Register interest before looking so a wake-up in between is kept
            let notified = self.notify.notified();

            let (candidate, next_at) = {
                let outbox = self.outbox.lock();
                let now = now_millis();
                let candidate = outbox
                    .peek_ready(now)
                    .map(|entry| (entry.id, entry.record_ref()));
                (candidate, outbox.next_ready_at())
            };

            if let Some((id, record)) = candidate {
                let guard: RecordGuard = tokio::select! {
                    guard = locks.lock(&record) => guard,
                    _ = cancel.cancelled() => return None,
                };
                let checked_out = self.outbox.lock().checkout(id, now_millis());

                match checked_out {
                    Ok((entry, changes)) => {
                        return Some(Checkout {
                            entry,
                            changes,
                            guard,
                        })
                    }
                    Err(error) => {
                        // Coalesced, cancelled or rescheduled meanwhile
                        tracing::trace!(entry = id, %error, "Outbox entry changed before checkout");
                        continue;
                    }
                }
            }

            let wait = next_at
                .map(|at| Duration::from_millis(at.saturating_sub(now_millis()).max(1)))
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}
