//! Record types for storing model instances.

use crate::{schema::ID_FIELD, FieldValue, ModelName, RecordKey, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Origin of a record change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Committed by a local API call
    Local,
    /// Received from the remote
    Remote,
}

/// Identity of a record across models.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub model: ModelName,
    pub key: RecordKey,
}

impl RecordRef {
    pub fn new(model: impl Into<ModelName>, key: impl Into<RecordKey>) -> Self {
        Self {
            model: model.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.key)
    }
}

/// Sync bookkeeping kept next to every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Remote version; `None` until the remote has confirmed the record
    pub version: Option<Version>,
    /// Last change time (milliseconds since epoch)
    pub last_changed_at: Timestamp,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// The record carries local changes the remote has not confirmed
    pub pending: bool,
}

impl SyncMetadata {
    /// Metadata for a record changed locally and not yet confirmed.
    pub fn local(timestamp: Timestamp) -> Self {
        Self {
            version: None,
            last_changed_at: timestamp,
            deleted: false,
            pending: true,
        }
    }

    /// Metadata for a record as the remote reports it.
    pub fn confirmed(version: Version, timestamp: Timestamp, deleted: bool) -> Self {
        Self {
            version: Some(version),
            last_changed_at: timestamp,
            deleted,
            pending: false,
        }
    }

    /// Record a remote confirmation. The version never decreases.
    pub fn confirm(&mut self, version: Version, timestamp: Timestamp) {
        if self.version.map_or(true, |current| version > current) {
            self.version = Some(version);
        }
        self.last_changed_at = self.last_changed_at.max(timestamp);
        self.pending = false;
    }

    pub fn is_confirmed(&self) -> bool {
        self.version.is_some()
    }
}

/// An instance of a registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub model: ModelName,
    /// Primary key, client generated and stable for the record's lifetime
    pub key: RecordKey,
    pub fields: BTreeMap<String, FieldValue>,
    pub sync: SyncMetadata,
}

impl Record {
    /// Create a new, locally pending record.
    pub fn new(
        model: impl Into<ModelName>,
        key: impl Into<RecordKey>,
        fields: BTreeMap<String, FieldValue>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            model: model.into(),
            key: key.into(),
            fields,
            sync: SyncMetadata::local(timestamp),
        }
    }

    /// Set a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.model.clone(), self.key.clone())
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.sync.deleted
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Resolve a field for predicate evaluation; `id` addresses the key.
    pub fn lookup(&self, field: &str) -> Option<FieldValue> {
        match self.fields.get(field) {
            Some(value) => Some(value.clone()),
            None if field == ID_FIELD => Some(FieldValue::String(self.key.clone())),
            None => None,
        }
    }

    /// Key stored in a reference or string field.
    pub fn reference(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(FieldValue::as_str)
    }

    /// Turn the record into a pending local tombstone.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.sync.deleted = true;
        self.sync.pending = true;
        self.sync.last_changed_at = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> Record {
        Record::new("Post", "p-1", BTreeMap::new(), 1000)
            .with_field("title", "Hello")
            .with_field("blogId", FieldValue::Reference("b-1".into()))
    }

    #[test]
    fn new_record_is_pending() {
        let record = post();

        assert_eq!(record.record_ref().to_string(), "Post:p-1");
        assert_eq!(record.sync.version, None);
        assert!(record.sync.pending);
        assert!(record.is_active());
        assert!(!record.sync.is_confirmed());
    }

    #[test]
    fn confirm_never_lowers_version() {
        let mut meta = SyncMetadata::local(1000);

        meta.confirm(3, 2000);
        assert_eq!(meta.version, Some(3));
        assert!(!meta.pending);

        meta.confirm(2, 1500);
        assert_eq!(meta.version, Some(3));
        assert_eq!(meta.last_changed_at, 2000);

        meta.confirm(4, 3000);
        assert_eq!(meta.version, Some(4));
    }

    #[test]
    fn lookup_resolves_key() {
        let record = post();

        assert_eq!(record.lookup("id"), Some(FieldValue::String("p-1".into())));
        assert_eq!(record.lookup("title"), Some(FieldValue::String("Hello".into())));
        assert_eq!(record.lookup("missing"), None);
        assert_eq!(record.reference("blogId"), Some("b-1"));
    }

    #[test]
    fn mark_deleted_keeps_version() {
        let mut record = post();
        record.sync = SyncMetadata::confirmed(2, 1000, false);

        record.mark_deleted(5000);
        assert!(!record.is_active());
        assert!(record.sync.pending);
        assert_eq!(record.sync.version, Some(2));
        assert_eq!(record.sync.last_changed_at, 5000);
    }
}
