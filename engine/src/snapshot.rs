//! Snapshot format for persisting and restoring local state.
//!
//! Snapshots use `BTreeMap`s so the same state always serializes to the same
//! JSON.

use crate::{
    error::Result, Error, ModelName, ModelRegistry, OutboxEntry, Record, RecordKey,
    SchemaVersion, SyncCursor,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Records by model, then by key (tombstones included)
    pub records: BTreeMap<ModelName, BTreeMap<RecordKey, Record>>,
    /// Outbox entries in queue order
    pub outbox: Vec<OutboxEntry>,
    /// Sync cursors by model
    pub cursors: BTreeMap<ModelName, SyncCursor>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            records: BTreeMap::new(),
            outbox: Vec::new(),
            cursors: BTreeMap::new(),
        }
    }

    pub fn add_record(&mut self, record: Record) {
        self.records
            .entry(record.model.clone())
            .or_default()
            .insert(record.key.clone(), record);
    }

    pub fn get_record(&self, model: &str, key: &str) -> Option<&Record> {
        self.records.get(model)?.get(key)
    }

    /// Count total records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.records
            .values()
            .flat_map(BTreeMap::values)
            .filter(|r| r.is_active())
            .count()
    }

    /// Validate the snapshot against a registry.
    pub fn validate(&self, registry: &ModelRegistry) -> Result<()> {
        if self.schema_version != registry.version() {
            return Err(Error::SchemaVersionMismatch {
                expected: registry.version(),
                actual: self.schema_version,
            });
        }

        for (model, records) in &self.records {
            registry.require(model)?;
            for (key, record) in records {
                if &record.key != key || &record.model != model {
                    return Err(Error::InvalidSnapshot(format!(
                        "record {} filed under {model}:{key}",
                        record.record_ref()
                    )));
                }
                if record.is_active() {
                    registry.validate(record)?;
                }
            }
        }

        let mut ids = BTreeSet::new();
        for entry in &self.outbox {
            registry.require(&entry.event.model)?;
            if !ids.insert(entry.id) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate outbox entry {}",
                    entry.id
                )));
            }
        }

        for model in self.cursors.keys() {
            registry.require(model)?;
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON, rejecting newer formats.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
