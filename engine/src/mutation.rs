//! Mutation events.
//!
//! Every committed change to a record is described by one immutable
//! [`MutationEvent`]. Local commits produce events that travel through the
//! outbox; remote changes produce events for observers.

use crate::{
    FieldValue, ModelName, MutationId, Predicate, Record, RecordKey, RecordRef, Timestamp,
    Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of change a mutation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// One committed change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub id: MutationId,
    pub model: ModelName,
    pub key: RecordKey,
    pub kind: MutationKind,
    /// Base version while pending in the outbox; the confirmed version once
    /// the change has been applied remotely
    pub version: Option<Version>,
    /// Field snapshot for creates and updates; `None` for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, FieldValue>>,
    /// Condition the remote must check before applying the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Predicate>,
    pub created_at: Timestamp,
}

impl MutationEvent {
    /// Describe the creation of `record`.
    pub fn create(id: impl Into<MutationId>, record: &Record, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            model: record.model.clone(),
            key: record.key.clone(),
            kind: MutationKind::Create,
            version: None,
            fields: Some(record.fields.clone()),
            condition: None,
            created_at: timestamp,
        }
    }

    /// Describe an update of `record` based on `base_version`.
    pub fn update(
        id: impl Into<MutationId>,
        record: &Record,
        base_version: Option<Version>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            model: record.model.clone(),
            key: record.key.clone(),
            kind: MutationKind::Update,
            version: base_version,
            fields: Some(record.fields.clone()),
            condition: None,
            created_at: timestamp,
        }
    }

    /// Describe the deletion of a record, by key only.
    pub fn delete(
        id: impl Into<MutationId>,
        model: impl Into<ModelName>,
        key: impl Into<RecordKey>,
        base_version: Option<Version>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            key: key.into(),
            kind: MutationKind::Delete,
            version: base_version,
            fields: None,
            condition: None,
            created_at: timestamp,
        }
    }

    pub fn with_condition(mut self, condition: Predicate) -> Self {
        self.condition = match condition {
            Predicate::All => None,
            other => Some(other),
        };
        self
    }

    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.model.clone(), self.key.clone())
    }

    pub fn is_delete(&self) -> bool {
        self.kind == MutationKind::Delete
    }
}
