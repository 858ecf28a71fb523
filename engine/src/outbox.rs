//! Mutation outbox.
//!
//! The outbox is the ordered queue of local mutations the remote has not yet
//! acknowledged. Each record has at most one queued entry: a new mutation for
//! a record that already has one is coalesced into it. A record may in
//! addition have one entry in flight, which is never handed out again until
//! it is acknowledged, requeued, retried or released.
//!
//! Every mutating call returns a [`ChangeSet`] describing the entry writes to
//! persist, so the caller can store them in the same transaction as the
//! record change and [`Outbox::rollback`] if that transaction fails.

use crate::{
    error::Result, EntryId, Error, MutationEvent, MutationKind, RecordRef, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryState {
    Queued,
    InFlight,
}

/// A pending mutation and its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Position in the queue; later entries have larger ids
    pub id: EntryId,
    pub event: MutationEvent,
    /// Failed send attempts so far
    pub attempts: u32,
    /// Earliest time the entry may be sent (milliseconds since epoch)
    pub next_attempt_at: Timestamp,
    pub state: EntryState,
    /// Set at the first checkout and never cleared
    #[serde(default)]
    pub dispatched: bool,
}

impl OutboxEntry {
    pub fn record_ref(&self) -> RecordRef {
        self.event.record_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.state == EntryState::InFlight
    }

    /// Whether a send of this entry may have reached the remote.
    pub fn may_have_reached_remote(&self) -> bool {
        self.dispatched || self.attempts > 0
    }
}

/// A single entry write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboxChange {
    Put { entry: OutboxEntry },
    Remove { id: EntryId },
}

/// Entry writes produced by one outbox call, with their undo log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<OutboxChange>,
    undo: Vec<OutboxChange>,
}

impl ChangeSet {
    pub fn changes(&self) -> &[OutboxChange] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<OutboxChange> {
        self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Append another change set; rolling back the result undoes both.
    pub fn extend(&mut self, other: ChangeSet) {
        self.changes.extend(other.changes);
        self.undo.extend(other.undo);
    }
}

/// Effect of an enqueue on the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// A new entry was added at the back
    Appended(OutboxEntry),
    /// The queued entry for the record now carries the new mutation
    Coalesced(OutboxEntry),
    /// The queued create and the incoming delete cancelled each other
    Cancelled,
    /// The mutation was already covered by the queued entry
    Unchanged,
}

/// Effect of returning a failed entry to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// The entry will be sent again; it may have absorbed a queued follow-up
    Scheduled(OutboxEntry),
    /// The entry and its queued follow-up cancelled each other
    Cancelled,
    /// The entry reached the attempt limit and was removed
    Exhausted(OutboxEntry),
}

enum Coalesced {
    Replace(MutationEvent),
    Cancel,
    Keep,
}

/// Combine a queued mutation with a newer one for the same record.
///
/// `sent` marks an older mutation that may already have reached the remote.
fn coalesce(older: &MutationEvent, newer: MutationEvent, sent: bool) -> Result<Coalesced> {
    use MutationKind::*;

    let record = || (older.model.clone(), older.key.clone());
    let rebased = |mut event: MutationEvent, kind: MutationKind| {
        event.kind = kind;
        event.version = older.version;
        event
    };

    match (older.kind, newer.kind) {
        (Create, Create) | (Create, Update) => Ok(Coalesced::Replace(rebased(newer, Create))),
        (Create, Delete) if sent => Ok(Coalesced::Replace(rebased(newer, Delete))),
        (Create, Delete) => Ok(Coalesced::Cancel),
        (Update, Update) => Ok(Coalesced::Replace(rebased(newer, Update))),
        (Update, Delete) => Ok(Coalesced::Replace(rebased(newer, Delete))),
        (Delete, Delete) => Ok(Coalesced::Keep),
        (Delete, _) => {
            let (model, key) = record();
            Err(Error::MutationAfterDelete { model, key })
        }
        (Update, Create) => {
            let (model, key) = record();
            Err(Error::RecordAlreadyExists { model, key })
        }
    }
}

/// Ordered queue of pending local mutations.
#[derive(Debug, Clone)]
pub struct Outbox {
    entries: BTreeMap<EntryId, OutboxEntry>,
    by_record: HashMap<RecordRef, BTreeSet<EntryId>>,
    next_id: EntryId,
    max_attempts: u32,
}

impl Outbox {
    /// Create an empty outbox. Entries are dropped after `max_attempts`
    /// failed sends.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_record: HashMap::new(),
            next_id: 1,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Rebuild the queue from persisted entries.
    ///
    /// In-flight entries return to the queue and entries of the same record
    /// are coalesced in id order. The returned change set holds the writes
    /// needed to bring the persisted table in line.
    pub fn restore(
        entries: impl IntoIterator<Item = OutboxEntry>,
        max_attempts: u32,
    ) -> (Self, ChangeSet) {
        let mut outbox = Self::new(max_attempts);
        let mut changes = ChangeSet::default();

        let mut sorted: Vec<OutboxEntry> = entries.into_iter().collect();
        sorted.sort_by_key(|e| e.id);

        for mut entry in sorted {
            outbox.next_id = outbox.next_id.max(entry.id + 1);
            let was_in_flight = entry.is_in_flight();
            entry.state = EntryState::Queued;
            entry.dispatched |= was_in_flight;

            match outbox.queued_id(&entry.record_ref()) {
                Some(queued) => {
                    // The newer sibling folds into the older queued entry
                    changes.changes.push(OutboxChange::Remove { id: entry.id });
                    let Some(older) = outbox.remove_raw(queued) else {
                        continue;
                    };
                    let sent = older.may_have_reached_remote();
                    let merged = match coalesce(&older.event, entry.event, sent) {
                        Ok(Coalesced::Replace(event)) => Some(OutboxEntry { event, ..older }),
                        Ok(Coalesced::Keep) | Err(_) => Some(older),
                        Ok(Coalesced::Cancel) => None,
                    };
                    match merged {
                        Some(merged) => {
                            changes.changes.push(OutboxChange::Put {
                                entry: merged.clone(),
                            });
                            outbox.insert_raw(merged);
                        }
                        None => changes.changes.push(OutboxChange::Remove { id: queued }),
                    }
                }
                None => {
                    if was_in_flight {
                        changes.changes.push(OutboxChange::Put {
                            entry: entry.clone(),
                        });
                    }
                    outbox.insert_raw(entry);
                }
            }
        }

        (outbox, changes)
    }

    /// Add a local mutation, coalescing it with the queued entry for the
    /// same record if there is one.
    pub fn enqueue(
        &mut self,
        event: MutationEvent,
        now: Timestamp,
    ) -> Result<(EnqueueOutcome, ChangeSet)> {
        let record = event.record_ref();
        let mut changes = ChangeSet::default();

        if let Some(queued_id) = self.queued_id(&record) {
            let Some(queued) = self.entries.get(&queued_id).cloned() else {
                return Err(Error::EntryNotFound(queued_id));
            };
            let outcome = match coalesce(&queued.event, event, queued.may_have_reached_remote())? {
                Coalesced::Replace(event) => {
                    let entry = OutboxEntry { event, ..queued };
                    self.put(entry.clone(), &mut changes);
                    EnqueueOutcome::Coalesced(entry)
                }
                Coalesced::Cancel => {
                    self.take(queued_id, &mut changes);
                    EnqueueOutcome::Cancelled
                }
                Coalesced::Keep => EnqueueOutcome::Unchanged,
            };
            return Ok((outcome, changes));
        }

        // Only an in-flight entry: check the sequence is legal, then append
        if let Some(in_flight) = self.in_flight_for(&record) {
            coalesce(&in_flight.event, event.clone(), true)?;
        }

        let entry = OutboxEntry {
            id: self.allocate_id(),
            event,
            attempts: 0,
            next_attempt_at: now,
            state: EntryState::Queued,
            dispatched: false,
        };
        self.put(entry.clone(), &mut changes);
        Ok((EnqueueOutcome::Appended(entry), changes))
    }

    /// Check out ready entries in queue order.
    ///
    /// The iterator is lazy: entries it has not yielded stay queued, and a
    /// later call resumes with them.
    pub fn drain(&mut self, now: Timestamp) -> Drain<'_> {
        Drain { outbox: self, now }
    }

    /// First entry that may be sent at `now`.
    pub fn peek_ready(&self, now: Timestamp) -> Option<&OutboxEntry> {
        self.entries
            .values()
            .find(|entry| self.is_ready(entry, now))
    }

    /// Earliest time a currently blocked entry becomes ready.
    pub fn next_ready_at(&self) -> Option<Timestamp> {
        self.entries
            .values()
            .filter(|entry| {
                entry.state == EntryState::Queued && self.in_flight_for(&entry.record_ref()).is_none()
            })
            .map(|entry| entry.next_attempt_at)
            .min()
    }

    /// Mark an entry as in flight and return a copy of it.
    ///
    /// The change set records the entry as dispatched; persist it before the
    /// entry is sent so a restart knows the mutation may have reached the
    /// remote.
    pub fn checkout(&mut self, id: EntryId, now: Timestamp) -> Result<(OutboxEntry, ChangeSet)> {
        let entry = self.entries.get(&id).ok_or(Error::EntryNotFound(id))?;
        if !self.is_ready(entry, now) {
            return Err(Error::EntryNotReady(id));
        }
        let mut entry = entry.clone();
        entry.state = EntryState::InFlight;
        entry.dispatched = true;

        let mut changes = ChangeSet::default();
        self.put(entry.clone(), &mut changes);
        Ok((entry, changes))
    }

    /// Remove an in-flight entry the remote accepted.
    ///
    /// A queued follow-up for the same record is rebased on the confirmed
    /// version.
    pub fn acknowledge(&mut self, id: EntryId, confirmed: Option<Version>) -> Result<ChangeSet> {
        let entry = self.in_flight(id)?;
        let record = entry.record_ref();
        let mut changes = ChangeSet::default();
        self.take(id, &mut changes);

        if let (Some(version), Some(next_id)) = (confirmed, self.queued_id(&record)) {
            if let Some(next) = self.entries.get(&next_id) {
                if next.event.version.map_or(true, |base| base < version) {
                    let mut next = next.clone();
                    next.event.version = Some(version);
                    self.put(next, &mut changes);
                }
            }
        }

        Ok(changes)
    }

    /// Return a failed in-flight entry to the back of the queue, due at
    /// `now + delay`, or drop it once it has used all its attempts.
    pub fn requeue(
        &mut self,
        id: EntryId,
        delay: u64,
        now: Timestamp,
    ) -> Result<(RequeueOutcome, ChangeSet)> {
        let entry = self.in_flight(id)?;
        let mut changes = ChangeSet::default();
        let Some(mut entry) = self.take(entry.id, &mut changes) else {
            return Err(Error::EntryNotFound(id));
        };
        entry.attempts += 1;

        if entry.attempts >= self.max_attempts {
            return Ok((RequeueOutcome::Exhausted(entry), changes));
        }

        entry.id = self.allocate_id();
        entry.next_attempt_at = now.saturating_add(delay);
        entry.state = EntryState::Queued;

        let outcome = match self.return_to_queue(entry, &mut changes) {
            Some(entry) => RequeueOutcome::Scheduled(entry),
            None => RequeueOutcome::Cancelled,
        };
        Ok((outcome, changes))
    }

    /// Replace an in-flight entry's mutation after a conflict and queue it
    /// for immediate resend in its original position.
    pub fn retry_with(
        &mut self,
        id: EntryId,
        event: MutationEvent,
        now: Timestamp,
    ) -> Result<(Option<OutboxEntry>, ChangeSet)> {
        let mut entry = self.in_flight(id)?;
        let mut changes = ChangeSet::default();
        self.take(id, &mut changes);

        entry.event = event;
        entry.state = EntryState::Queued;
        entry.next_attempt_at = now;

        let entry = self.return_to_queue(entry, &mut changes);
        Ok((entry, changes))
    }

    /// Put an in-flight entry back without counting an attempt.
    pub fn release(&mut self, id: EntryId) -> Result<ChangeSet> {
        let mut entry = self.in_flight(id)?;
        let mut changes = ChangeSet::default();
        self.take(id, &mut changes);

        entry.state = EntryState::Queued;
        self.return_to_queue(entry, &mut changes);
        Ok(changes)
    }

    /// Drop every queued entry for a record. In-flight entries are kept.
    pub fn cancel(&mut self, record: &RecordRef) -> ChangeSet {
        let mut changes = ChangeSet::default();
        if let Some(id) = self.queued_id(record) {
            self.take(id, &mut changes);
        }
        changes
    }

    /// Drop an entry regardless of its state.
    pub fn remove(&mut self, id: EntryId) -> Result<(OutboxEntry, ChangeSet)> {
        let mut changes = ChangeSet::default();
        let entry = self
            .take(id, &mut changes)
            .ok_or(Error::EntryNotFound(id))?;
        Ok((entry, changes))
    }

    /// Undo the in-memory effect of a change set.
    pub fn rollback(&mut self, changes: ChangeSet) {
        for undo in changes.undo.into_iter().rev() {
            match undo {
                OutboxChange::Put { entry } => {
                    self.insert_raw(entry);
                }
                OutboxChange::Remove { id } => {
                    self.remove_raw(id);
                }
            }
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&OutboxEntry> {
        self.entries.get(&id)
    }

    /// Entries for a record, oldest first.
    pub fn pending_for(&self, record: &RecordRef) -> impl Iterator<Item = &OutboxEntry> {
        self.by_record
            .get(record)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    pub fn queued_for(&self, record: &RecordRef) -> Option<&OutboxEntry> {
        self.pending_for(record)
            .find(|entry| entry.state == EntryState::Queued)
    }

    pub fn in_flight_for(&self, record: &RecordRef) -> Option<&OutboxEntry> {
        self.pending_for(record).find(|entry| entry.is_in_flight())
    }

    pub fn has_pending(&self, record: &RecordRef) -> bool {
        self.by_record.contains_key(record)
    }

    /// All entries in queue order.
    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn is_ready(&self, entry: &OutboxEntry, now: Timestamp) -> bool {
        entry.state == EntryState::Queued
            && entry.next_attempt_at <= now
            && self.in_flight_for(&entry.record_ref()).is_none()
    }

    fn in_flight(&self, id: EntryId) -> Result<OutboxEntry> {
        match self.entries.get(&id) {
            Some(entry) if entry.is_in_flight() => Ok(entry.clone()),
            Some(_) => Err(Error::EntryNotInFlight(id)),
            None => Err(Error::EntryNotFound(id)),
        }
    }

    fn queued_id(&self, record: &RecordRef) -> Option<EntryId> {
        self.queued_for(record).map(|entry| entry.id)
    }

    /// Queue `entry`, merging it with a queued follow-up of the same record.
    /// The merged entry keeps `entry`'s position and retry state.
    fn return_to_queue(
        &mut self,
        entry: OutboxEntry,
        changes: &mut ChangeSet,
    ) -> Option<OutboxEntry> {
        let Some(follow_up_id) = self.queued_id(&entry.record_ref()) else {
            self.put(entry.clone(), changes);
            return Some(entry);
        };
        let Some(follow_up) = self.take(follow_up_id, changes) else {
            self.put(entry.clone(), changes);
            return Some(entry);
        };

        let merged = match coalesce(&entry.event, follow_up.event.clone(), true) {
            Ok(Coalesced::Replace(event)) => Some(OutboxEntry { event, ..entry }),
            Ok(Coalesced::Keep) => Some(entry),
            Ok(Coalesced::Cancel) => None,
            // Not reachable through enqueue; the newer mutation wins
            Err(_) => Some(OutboxEntry {
                event: follow_up.event,
                ..entry
            }),
        };

        if let Some(merged) = &merged {
            self.put(merged.clone(), changes);
        }
        merged
    }

    fn allocate_id(&mut self) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn put(&mut self, entry: OutboxEntry, changes: &mut ChangeSet) {
        let id = entry.id;
        changes.changes.push(OutboxChange::Put {
            entry: entry.clone(),
        });
        let undo = match self.insert_raw(entry) {
            Some(prior) => OutboxChange::Put { entry: prior },
            None => OutboxChange::Remove { id },
        };
        changes.undo.push(undo);
    }

    fn take(&mut self, id: EntryId, changes: &mut ChangeSet) -> Option<OutboxEntry> {
        let entry = self.remove_raw(id)?;
        changes.changes.push(OutboxChange::Remove { id });
        changes.undo.push(OutboxChange::Put {
            entry: entry.clone(),
        });
        Some(entry)
    }

    fn insert_raw(&mut self, entry: OutboxEntry) -> Option<OutboxEntry> {
        let id = entry.id;
        let record = entry.record_ref();
        let prior = self.entries.insert(id, entry);
        if let Some(prior) = &prior {
            self.unindex(&prior.record_ref(), id);
        }
        self.by_record.entry(record).or_default().insert(id);
        prior
    }

    fn remove_raw(&mut self, id: EntryId) -> Option<OutboxEntry> {
        let entry = self.entries.remove(&id)?;
        self.unindex(&entry.record_ref(), id);
        Some(entry)
    }

    fn unindex(&mut self, record: &RecordRef, id: EntryId) {
        if let Some(ids) = self.by_record.get_mut(record) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_record.remove(record);
            }
        }
    }
}

/// Lazy iterator returned by [`Outbox::drain`]. Checkout writes are not
/// reported; use [`Outbox::checkout`] when they must be persisted.
pub struct Drain<'a> {
    outbox: &'a mut Outbox,
    now: Timestamp,
}

impl Iterator for Drain<'_> {
    type Item = OutboxEntry;

    fn next(&mut self) -> Option<OutboxEntry> {
        let id = self.outbox.peek_ready(self.now)?.id;
        self.outbox.checkout(id, self.now).ok().map(|(entry, _)| entry)
    }
}
