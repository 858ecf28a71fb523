//! Records as the remote reports them, and how they apply locally.

use crate::{
    error::Result, ModelName, ModelRegistry, Record, RecordKey, RecordRef, SyncMetadata,
    Timestamp, Version,
};
use serde::{Deserialize, Serialize};

/// A record in the remote's wire form with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub model: ModelName,
    pub key: RecordKey,
    /// Wire fields, keyed by field name
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "_version")]
    pub version: Version,
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
    #[serde(rename = "_lastChangedAt")]
    pub last_changed_at: Timestamp,
}

impl RemoteRecord {
    /// Encode a local record as the remote would store it.
    pub fn from_record(
        registry: &ModelRegistry,
        record: &Record,
        version: Version,
        timestamp: Timestamp,
    ) -> Result<Self> {
        Ok(Self {
            model: record.model.clone(),
            key: record.key.clone(),
            fields: registry.encode_fields(&record.model, &record.key, &record.fields)?,
            version,
            deleted: record.sync.deleted,
            last_changed_at: timestamp,
        })
    }

    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.model.clone(), self.key.clone())
    }

    /// Decode into a confirmed local record.
    ///
    /// Errors other than an unknown model mean the remote sent data the
    /// local schema cannot represent.
    pub fn decode(&self, registry: &ModelRegistry) -> Result<Record> {
        let fields = registry.decode_fields(&self.model, &self.fields, !self.deleted)?;
        Ok(Record {
            model: self.model.clone(),
            key: self.key.clone(),
            fields,
            sync: SyncMetadata::confirmed(self.version, self.last_changed_at, self.deleted),
        })
    }

    /// How this remote record applies to the local copy described by
    /// `local`.
    pub fn disposition(&self, local: Option<&SyncMetadata>) -> Disposition {
        let Some(local) = local else {
            return if self.deleted {
                Disposition::Drop
            } else {
                Disposition::Create
            };
        };

        if local.version.is_some_and(|known| self.version <= known) {
            return Disposition::Drop;
        }

        if self.deleted {
            Disposition::Delete
        } else {
            Disposition::Update
        }
    }
}

/// Effect of a remote record on local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
    Create,
    Update,
    Delete,
    /// Already known, out of date, or deleted before we ever saw it
    Drop,
}
