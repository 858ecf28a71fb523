//! Local state - the in-memory container behind the persistence engine.
//!
//! `LocalState` holds records per model (tombstones included), the persisted
//! outbox table and the sync cursor table. All writes go through
//! [`LocalState::apply`], which validates a whole [`WriteBatch`] before
//! touching anything so a batch lands completely or not at all.

use crate::{
    cascade::{DependentLookup, Lookup},
    error::Result,
    outbox::{ChangeSet, OutboxChange},
    EntryId, Error, ModelName, ModelRegistry, OutboxEntry, Predicate, Record, RecordKey,
    RecordRef, SchemaVersion, StoreSnapshot, SyncCursor,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Records of one model.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: BTreeMap<RecordKey, Record>,
}

impl Collection {
    /// Get a record by key, including tombstones.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn insert(&mut self, record: Record) {
        self.records.insert(record.key.clone(), record);
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }

    /// Get all active (non-deleted) records.
    pub fn active_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.is_active())
    }

    /// Get all records including deleted.
    pub fn all_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Count of active records.
    pub fn len(&self) -> usize {
        self.active_records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single write against local state.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Insert or replace a record (tombstones included)
    Save(Record),
    /// Forget a record entirely
    Purge(RecordRef),
    PutOutbox(OutboxEntry),
    RemoveOutbox(EntryId),
    PutCursor(SyncCursor),
}

/// Writes applied together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: Write) {
        self.writes.push(write);
    }

    pub fn save(mut self, record: Record) -> Self {
        self.writes.push(Write::Save(record));
        self
    }

    pub fn purge(mut self, record: RecordRef) -> Self {
        self.writes.push(Write::Purge(record));
        self
    }

    pub fn cursor(mut self, cursor: SyncCursor) -> Self {
        self.writes.push(Write::PutCursor(cursor));
        self
    }

    /// Add the entry writes of an outbox change set.
    pub fn outbox(mut self, changes: &ChangeSet) -> Self {
        self.extend_outbox(changes);
        self
    }

    pub fn extend_outbox(&mut self, changes: &ChangeSet) {
        for change in changes.changes() {
            self.writes.push(match change {
                OutboxChange::Put { entry } => Write::PutOutbox(entry.clone()),
                OutboxChange::Remove { id } => Write::RemoveOutbox(*id),
            });
        }
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = Write;
    type IntoIter = std::vec::IntoIter<Write>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

/// Sort direction for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sort key for queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub order: SortOrder,
}

/// A query over one model: filter, sort and page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub predicate: Predicate,
    pub sort: Vec<SortBy>,
    /// (page index, page size)
    pub page: Option<(usize, usize)>,
}

impl Query {
    pub fn filter(predicate: Predicate) -> Self {
        Self {
            predicate,
            ..Self::default()
        }
    }

    pub fn ascending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortBy {
            field: field.into(),
            order: SortOrder::Ascending,
        });
        self
    }

    pub fn descending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortBy {
            field: field.into(),
            order: SortOrder::Descending,
        });
        self
    }

    pub fn paginate(mut self, page: usize, limit: usize) -> Self {
        self.page = Some((page, limit));
        self
    }

    /// Run the query against a collection. Results are ordered by key unless
    /// sort keys are given; records missing a sort field sort first.
    pub fn run(&self, collection: &Collection) -> Vec<Record> {
        let mut matched: Vec<&Record> = collection
            .active_records()
            .filter(|r| self.predicate.matches(r))
            .collect();

        if !self.sort.is_empty() {
            matched.sort_by(|a, b| {
                for sort in &self.sort {
                    let ordering = match (a.lookup(&sort.field), b.lookup(&sort.field)) {
                        (Some(x), Some(y)) => x.compare(&y).unwrap_or(Ordering::Equal),
                        (None, Some(_)) => Ordering::Less,
                        (Some(_), None) => Ordering::Greater,
                        (None, None) => Ordering::Equal,
                    };
                    let ordering = match sort.order {
                        SortOrder::Ascending => ordering,
                        SortOrder::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.key.cmp(&b.key)
            });
        }

        let iter = matched.into_iter().cloned();
        match self.page {
            Some((page, limit)) => iter.skip(page.saturating_mul(limit)).take(limit).collect(),
            None => iter.collect(),
        }
    }
}

impl From<Predicate> for Query {
    fn from(predicate: Predicate) -> Self {
        Query::filter(predicate)
    }
}

/// All local state.
#[derive(Debug, Clone, Default)]
pub struct LocalState {
    collections: HashMap<ModelName, Collection>,
    outbox: BTreeMap<EntryId, OutboxEntry>,
    cursors: BTreeMap<ModelName, SyncCursor>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and apply a batch. Nothing is written if any write is
    /// invalid.
    pub fn apply(&mut self, registry: &ModelRegistry, batch: WriteBatch) -> Result<()> {
        for write in batch.writes() {
            match write {
                Write::Save(record) if record.is_active() => registry.validate(record)?,
                Write::Save(record) => {
                    registry.require(&record.model)?;
                }
                Write::Purge(target) => {
                    registry.require(&target.model)?;
                }
                Write::PutOutbox(entry) => {
                    registry.require(&entry.event.model)?;
                }
                Write::PutCursor(cursor) => {
                    registry.require(&cursor.model)?;
                }
                Write::RemoveOutbox(_) => {}
            }
        }

        for write in batch {
            match write {
                Write::Save(record) => self
                    .collections
                    .entry(record.model.clone())
                    .or_default()
                    .insert(record),
                Write::Purge(target) => {
                    if let Some(collection) = self.collections.get_mut(&target.model) {
                        collection.remove(&target.key);
                    }
                }
                Write::PutOutbox(entry) => {
                    self.outbox.insert(entry.id, entry);
                }
                Write::RemoveOutbox(id) => {
                    self.outbox.remove(&id);
                }
                Write::PutCursor(cursor) => {
                    self.cursors.insert(cursor.model.clone(), cursor);
                }
            }
        }

        Ok(())
    }

    /// Get an active record.
    pub fn get(&self, model: &str, key: &str) -> Option<&Record> {
        self.get_including_deleted(model, key)
            .filter(|r| r.is_active())
    }

    /// Get a record including tombstones.
    pub fn get_including_deleted(&self, model: &str, key: &str) -> Option<&Record> {
        self.collections.get(model).and_then(|c| c.get(key))
    }

    pub fn collection(&self, model: &str) -> Option<&Collection> {
        self.collections.get(model)
    }

    /// Active records of `model` matching the query.
    pub fn query(&self, model: &str, query: &Query) -> Vec<Record> {
        self.collections
            .get(model)
            .map(|c| query.run(c))
            .unwrap_or_default()
    }

    /// Persisted outbox entries in queue order.
    pub fn outbox_entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.outbox.values()
    }

    pub fn cursor(&self, model: &str) -> Option<&SyncCursor> {
        self.cursors.get(model)
    }

    pub fn cursors(&self) -> impl Iterator<Item = &SyncCursor> {
        self.cursors.values()
    }

    /// Count active records across all models.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Collection::len).sum()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.collections.clear();
        self.outbox.clear();
        self.cursors.clear();
    }

    /// Export the current state as a snapshot.
    pub fn export_state(&self, schema_version: SchemaVersion) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(schema_version);
        for collection in self.collections.values() {
            for record in collection.all_records() {
                snapshot.add_record(record.clone());
            }
        }
        for entry in self.outbox.values() {
            snapshot.outbox.push(entry.clone());
        }
        for cursor in self.cursors.values() {
            snapshot
                .cursors
                .insert(cursor.model.clone(), cursor.clone());
        }
        snapshot
    }

    /// Replace the current state with a snapshot's.
    pub fn import_state(&mut self, registry: &ModelRegistry, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate(registry)?;

        let mut state = LocalState::new();
        for (model, records) in snapshot.records {
            let collection = state.collections.entry(model).or_default();
            for (_, record) in records {
                collection.insert(record);
            }
        }
        for entry in snapshot.outbox {
            if state.outbox.insert(entry.id, entry).is_some() {
                return Err(Error::InvalidSnapshot("duplicate outbox entry".into()));
            }
        }
        state.cursors = snapshot.cursors;

        *self = state;
        Ok(())
    }
}

impl DependentLookup for LocalState {
    fn dependents(&self, lookup: &Lookup) -> Vec<RecordKey> {
        self.collections
            .get(&lookup.model)
            .map(|c| {
                c.active_records()
                    .filter(|r| r.reference(&lookup.foreign_key) == Some(lookup.parent.as_str()))
                    .map(|r| r.key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
