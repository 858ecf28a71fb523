//! # Tether Sync
//!
//! Runtime of the Tether offline-first data store.
//!
//! [`DataStore`] is the entry point. Local reads and writes go straight to
//! the [`LocalStore`]; every local write also lands in the mutation outbox
//! in the same transaction. Once started, the [`RemoteSyncEngine`] drains
//! that outbox to a [`GraphQlApi`], pulls remote changes through base sync
//! and live subscriptions, and reconciles them with pending local work.
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use tether_engine::{FieldDef, FieldType, ModelRegistry, ModelSchema, Record};
//! use tether_sync::DataStore;
//!
//! # async fn run() -> tether_sync::Result<()> {
//! let registry = ModelRegistry::builder(1)
//!     .with_model(ModelSchema::new(
//!         "Post",
//!         vec![FieldDef::required("title", FieldType::String)],
//!     ))
//!     .build()?;
//!
//! let store = DataStore::builder(registry).build().await?;
//! let post = Record::new("Post", "p-1", BTreeMap::new(), 0).with_field("title", "Hello");
//! store.save(post, None).await?;
//!
//! assert_eq!(store.pending_mutations().len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod api;
mod base_sync;
pub mod config;
mod context;
pub mod datastore;
pub mod engine;
pub mod error;
pub mod locks;
mod mutation;
pub mod outbox;
pub mod publisher;
mod reconcile;
pub mod state;
pub mod storage;
mod subscription;

pub use api::{
    AnonymousAuth, AuthProvider, AuthToken, ChangeStream, GraphQlApi, MutationRequest, SyncPage,
    SyncRequest,
};
pub use config::{ConfigError, RetryPolicy, SyncConfig};
pub use datastore::{DataStore, DataStoreBuilder};
pub use engine::RemoteSyncEngine;
pub use error::{ApiError, AuthError, DataStoreError, ErrorClass, Result, StorageError};
pub use publisher::{
    DataStoreEvent, Delivery, EventFilter, EventPublisher, ModelSyncStats, Subscription,
};
pub use reconcile::Applied;
pub use state::{EngineState, StopReason};
pub use storage::{LocalStore, MemoryStore};

use tether_engine::Timestamp;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
