//! Interfaces of the remote collaborators: the auth provider and the GraphQL
//! API. Both are traits so applications plug in their own transport.

use crate::error::{ApiError, AuthError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use tether_engine::{
    ModelName, ModelRegistry, MutationEvent, MutationKind, Predicate, RecordKey, RemoteRecord,
    Version,
};

/// Bearer token attached to remote requests.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

/// Source of valid auth tokens.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// A token valid for at least one request. Refreshes as needed.
    async fn valid_token(&self) -> Result<AuthToken, AuthError>;
}

/// Provider for APIs that need no user session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuth;

#[async_trait]
impl AuthProvider for AnonymousAuth {
    async fn valid_token(&self) -> Result<AuthToken, AuthError> {
        Ok(AuthToken::new("anonymous"))
    }
}

/// A mutation as sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub model: ModelName,
    pub key: RecordKey,
    pub kind: MutationKind,
    /// Wire fields, primary key included
    pub input: serde_json::Map<String, serde_json::Value>,
    /// Version the mutation is based on; `None` for creates
    #[serde(rename = "_version")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Predicate>,
}

impl MutationRequest {
    /// Encode an outbox mutation for the wire.
    pub fn from_event(
        registry: &ModelRegistry,
        event: &MutationEvent,
    ) -> tether_engine::error::Result<Self> {
        let empty = Default::default();
        let fields = event.fields.as_ref().unwrap_or(&empty);
        Ok(Self {
            model: event.model.clone(),
            key: event.key.clone(),
            kind: event.kind,
            input: registry.encode_fields(&event.model, &event.key, fields)?,
            version: event.version,
            condition: event.condition.clone(),
        })
    }
}

/// One page request of a base sync query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub model: ModelName,
    /// Change token of the last applied sync; `None` requests everything
    pub last_sync: Option<String>,
    /// Continuation token of the previous page
    pub next_token: Option<String>,
    pub limit: u32,
}

/// One page of a base sync query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    pub items: Vec<RemoteRecord>,
    pub next_token: Option<String>,
    /// Change token to resume from once all pages are applied
    pub sync_token: String,
}

/// Live change notifications for one model.
pub type ChangeStream = BoxStream<'static, Result<RemoteRecord, ApiError>>;

/// The remote GraphQL service.
#[async_trait]
pub trait GraphQlApi: Send + Sync {
    /// Apply a mutation and return the record as the remote now holds it.
    ///
    /// A version mismatch fails with [`ApiError::Conflict`] carrying the
    /// remote's current record.
    async fn mutate(
        &self,
        token: &AuthToken,
        request: MutationRequest,
    ) -> Result<RemoteRecord, ApiError>;

    /// Fetch one page of changes for a model.
    async fn sync(&self, token: &AuthToken, request: SyncRequest) -> Result<SyncPage, ApiError>;

    /// Open a change subscription for a model. The stream ends or yields an
    /// error when the connection drops.
    async fn subscribe(&self, token: &AuthToken, model: &str) -> Result<ChangeStream, ApiError>;
}
