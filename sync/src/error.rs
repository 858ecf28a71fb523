//! Error taxonomy for the sync runtime.
//!
//! Every error classifies into an [`ErrorClass`], which decides whether the
//! failure is retried, handed to the conflict resolver, reported to the
//! caller, or stops the sync engine.

use crate::config::ConfigError;
use tether_engine::RemoteRecord;

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff
    Transient,
    /// Version mismatch, routed to the conflict resolver
    Conflict,
    /// Not retried; reported to the caller or as an event
    Permanent,
    /// Stops the sync engine until the application restarts it
    Fatal,
}

/// Failures reported by the remote API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request throttled")]
    Throttled,

    #[error("Unauthorized: {0}")]
    Authorization(String),

    /// The response could not be mapped onto the local schema
    #[error("Transformation error: {0}")]
    Transformation(String),

    #[error("Server error: {message}")]
    Server { message: String, retryable: bool },

    /// The remote holds a different version than the mutation was based on
    #[error("Version conflict on {}:{}", .0.model, .0.key)]
    Conflict(Box<RemoteRecord>),

    #[error("Conditional check failed: {0}")]
    ConditionalCheck(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Network(_)
            | ApiError::Timeout
            | ApiError::Throttled
            | ApiError::Authorization(_) => ErrorClass::Transient,
            ApiError::Server { retryable: true, .. } => ErrorClass::Transient,
            ApiError::Conflict(_) => ErrorClass::Conflict,
            ApiError::Transformation(_)
            | ApiError::Server { .. }
            | ApiError::ConditionalCheck(_)
            | ApiError::InvalidRequest(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Failures obtaining an auth token.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Session expired and could not be refreshed")]
    SessionExpired,

    #[error("Auth service error: {0}")]
    Service(String),
}

impl AuthError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AuthError::NotSignedIn | AuthError::SessionExpired => ErrorClass::Fatal,
            AuthError::Service(_) => ErrorClass::Transient,
        }
    }
}

/// Failures of the local persistence engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("Rejected write: {0}")]
    Rejected(#[from] tether_engine::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Data store error type.
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("Engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A save or delete condition did not match the local record
    #[error("Condition failed for {0}")]
    ConditionFailed(String),

    #[error("Subscription to {model} lost after {attempts} reconnect attempts")]
    SubscriptionLost { model: String, attempts: u32 },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl DataStoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DataStoreError::Engine(e) if e.is_schema_drift() => ErrorClass::Fatal,
            DataStoreError::Engine(_) => ErrorClass::Permanent,
            DataStoreError::Api(e) => e.class(),
            DataStoreError::Auth(e) => e.class(),
            DataStoreError::Storage(StorageError::Rejected(_)) => ErrorClass::Permanent,
            DataStoreError::Storage(StorageError::Unavailable(_)) => ErrorClass::Transient,
            DataStoreError::Config(_) => ErrorClass::Fatal,
            DataStoreError::ConditionFailed(_) => ErrorClass::Permanent,
            DataStoreError::SubscriptionLost { .. } => ErrorClass::Transient,
            DataStoreError::Task(_) => ErrorClass::Fatal,
            DataStoreError::Cancelled => ErrorClass::Transient,
        }
    }

    /// Whether the remote sent data the local schema cannot represent.
    pub fn is_schema_drift(&self) -> bool {
        match self {
            DataStoreError::Engine(e) => e.is_schema_drift(),
            DataStoreError::Storage(StorageError::Rejected(e)) => e.is_schema_drift(),
            DataStoreError::Api(ApiError::Transformation(_)) => true,
            _ => false,
        }
    }
}

/// Result type alias for data store operations.
pub type Result<T> = std::result::Result<T, DataStoreError>;
