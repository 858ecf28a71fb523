//! # Tether Engine
//!
//! The deterministic core of an offline-first data store.
//!
//! This crate holds every decision the sync runtime makes about local data:
//! what a record looks like, which mutations are still owed to the remote,
//! how a stale mutation is reconciled with the remote's copy, and which
//! records go away when a parent is deleted.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches the network, disk or clock; every
//!   operation that needs "now" takes a timestamp
//! - **Deterministic**: same inputs always produce same outputs
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Model Registry
//!
//! [`ModelRegistry`] maps model names to their [`ModelSchema`] and derives the
//! relationship [`Edge`] table used for cascade deletes and sync ordering.
//! Field values are a closed set of [`FieldValue`] variants.
//!
//! ### Mutation Outbox
//!
//! [`Outbox`] is the ordered queue of local mutations the remote has not yet
//! acknowledged, at most one queued entry per record. New mutations coalesce
//! with the queued one (an update after a create stays a create, a delete
//! after an unsent create cancels both).
//!
//! ### Conflicts
//!
//! [`ConflictResolver`] decides between a pending local mutation and the
//! remote's current record: retry with merged data, discard the local change,
//! or apply the remote.
//!
//! ### Cascade Deletes
//!
//! [`CascadeWalk`] walks the edge table from a deleted record to every
//! dependent record, children first, terminating on cycles.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use tether_engine::{
//!     EnqueueOutcome, FieldDef, FieldType, ModelRegistry, ModelSchema, MutationEvent, Outbox,
//!     Record, Relationship,
//! };
//!
//! // 1. Declare the models
//! let registry = ModelRegistry::builder(1)
//!     .with_model(
//!         ModelSchema::new("Post", vec![FieldDef::required("title", FieldType::String)])
//!             .with_relationship(Relationship::has_many("comments", "Comment")),
//!     )
//!     .with_model(ModelSchema::new(
//!         "Comment",
//!         vec![FieldDef::required("postId", FieldType::Reference("Post".into()))],
//!     ))
//!     .build()
//!     .unwrap();
//!
//! // 2. Validate a local record
//! let post = Record::new("Post", "p-1", BTreeMap::new(), 1_000).with_field("title", "Hello");
//! registry.validate(&post).unwrap();
//!
//! // 3. Queue its creation, then delete it before it was ever sent
//! let mut outbox = Outbox::new(5);
//! outbox
//!     .enqueue(MutationEvent::create("m-1", &post, 1_000), 1_000)
//!     .unwrap();
//! let (outcome, _) = outbox
//!     .enqueue(MutationEvent::delete("m-2", "Post", "p-1", None, 2_000), 2_000)
//!     .unwrap();
//!
//! assert_eq!(outcome, EnqueueOutcome::Cancelled);
//! assert!(outbox.is_empty());
//! ```
//!
//! ## Persistence
//!
//! [`LocalState`] is the in-memory container behind the persistence engine.
//! Use [`LocalState::export_state`] and [`LocalState::import_state`] with
//! [`StoreSnapshot`]; snapshots serialize to JSON with deterministic ordering.

pub mod cascade;
pub mod conflict;
pub mod cursor;
pub mod error;
pub mod mutation;
pub mod outbox;
pub mod predicate;
pub mod record;
pub mod remote;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod value;

// Re-export main types at crate root
pub use cascade::{compute_dependents, CascadeWalk, DependentLookup, Lookup};
pub use conflict::{
    ConflictHandler, ConflictResolver, Decision, MergeStrategy, Resolution, Trigger,
};
pub use cursor::SyncCursor;
pub use error::Error;
pub use mutation::{MutationEvent, MutationKind};
pub use outbox::{
    ChangeSet, Drain, EnqueueOutcome, EntryState, Outbox, OutboxChange, OutboxEntry,
    RequeueOutcome,
};
pub use predicate::Predicate;
pub use record::{Origin, Record, RecordRef, SyncMetadata};
pub use remote::{Disposition, RemoteRecord};
pub use schema::{
    Edge, EnumDef, FieldDef, FieldType, IndexDef, ModelRegistry, ModelSchema, RegistryBuilder,
    RelationKind, Relationship, ID_FIELD,
};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Collection, LocalState, Query, SortBy, SortOrder, Write, WriteBatch};
pub use value::FieldValue;

/// Type aliases for clarity
pub type ModelName = String;
pub type RecordKey = String;
pub type MutationId = String;
pub type EntryId = u64;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
pub type SchemaVersion = u32;
