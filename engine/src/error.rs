//! Error types for the Tether engine.

use crate::{EntryId, ModelName, RecordKey, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Registry errors
    #[error("model not found: {0}")]
    ModelNotFound(ModelName),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Validation errors
    #[error("record not found: {model}:{key}")]
    RecordNotFound { model: ModelName, key: RecordKey },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("unknown field '{field}' on model {model}")]
    UnknownField { model: ModelName, field: String },

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    /// The value is not a case of the locally compiled enum. Raised for
    /// remote data this is schema drift.
    #[error("unknown case '{value}' for enum {enum_name}")]
    UnknownEnumCase { enum_name: String, value: String },

    // Outbox errors
    #[error("record already exists: {model}:{key}")]
    RecordAlreadyExists { model: ModelName, key: RecordKey },

    #[error("mutation on deleted record: {model}:{key}")]
    MutationAfterDelete { model: ModelName, key: RecordKey },

    #[error("outbox entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("outbox entry {0} is not in flight")]
    EntryNotInFlight(EntryId),

    #[error("outbox entry {0} is not ready to send")]
    EntryNotReady(EntryId),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

impl Error {
    /// Whether this error means remote data cannot be represented by the
    /// local schema.
    pub fn is_schema_drift(&self) -> bool {
        matches!(
            self,
            Error::UnknownEnumCase { .. }
                | Error::TypeMismatch { .. }
                | Error::MissingRequiredField(_)
                | Error::InvalidPayload(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
