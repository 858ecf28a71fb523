//! Shared fixtures for the sync integration tests: the model registry, an
//! in-memory GraphQL cloud with failure injection, and a store wrapper that
//! can refuse commits.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tether_engine::{
    EnumDef, FieldDef, FieldType, FieldValue, ModelRegistry, ModelSchema, MutationKind, OutboxEntry, Query,
    Record, RecordRef, Relationship, RemoteRecord, StoreSnapshot, SyncCursor, WriteBatch,
};
use tether_sync::{
    ApiError, AuthToken, ChangeStream, DataStoreEvent, Delivery, GraphQlApi, LocalStore,
    MemoryStore, MutationRequest, RetryPolicy, StorageError, Subscription, SyncConfig, SyncPage,
    SyncRequest,
};
use tokio::sync::{broadcast, Notify};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tether_sync=debug".into());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Post has many Comments; posts carry an optional status enum.
pub fn registry() -> Arc<ModelRegistry> {
    let registry = ModelRegistry::builder(1)
        .with_enum(EnumDef::new("PostStatus", ["DRAFT", "PUBLISHED"]))
        .with_model(
            ModelSchema::new(
                "Post",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("rating", FieldType::Int),
                    FieldDef::optional("status", FieldType::Enum("PostStatus".into())),
                ],
            )
            .with_relationship(Relationship::has_many("comments", "Comment")),
        )
        .with_model(ModelSchema::new(
            "Comment",
            vec![
                FieldDef::required("content", FieldType::String),
                FieldDef::required("postId", FieldType::Reference("Post".into())),
            ],
        ))
        .build()
        .expect("valid registry");
    Arc::new(registry)
}

/// Short delays so retries and restarts finish within a test.
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_mutation_retry(
            RetryPolicy::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(40))
                .without_jitter(),
        )
        .with_reconnect(
            RetryPolicy::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(40))
                .without_jitter(),
        )
        .with_request_timeout(Duration::from_secs(2))
}

pub fn post(key: &str, title: &str) -> Record {
    Record::new("Post", key, BTreeMap::new(), 0).with_field("title", title)
}

pub fn comment(key: &str, post: &str, content: &str) -> Record {
    Record::new("Comment", key, BTreeMap::new(), 0)
        .with_field("content", content)
        .with_field("postId", FieldValue::Reference(post.to_string()))
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Wait for the first event matching `matches`, skipping everything else.
pub async fn wait_for(
    subscription: &mut Subscription,
    matches: impl Fn(&DataStoreEvent) -> bool,
) -> DataStoreEvent {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match subscription.recv().await {
                Some(Delivery::Event(event)) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("publisher closed while waiting for an event"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `condition` until it holds.
pub async fn eventually<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Everything delivered so far, without waiting.
pub fn drain(subscription: &mut Subscription) -> Vec<DataStoreEvent> {
    let mut events = Vec::new();
    while let Some(delivery) = subscription.try_recv() {
        if let Delivery::Event(event) = delivery {
            events.push(event);
        }
    }
    events
}

#[derive(Default)]
struct CloudState {
    /// Current record and the change sequence that last touched it
    records: BTreeMap<(String, String), (u64, RemoteRecord)>,
    sequence: u64,
}

/// In-memory stand-in for the remote GraphQL service.
///
/// Versions start at 1 and grow by one per accepted write. Change tokens
/// are the highest change sequence of a model, so an unchanged model keeps
/// its token.
pub struct MockCloud {
    registry: Arc<ModelRegistry>,
    state: Mutex<CloudState>,
    changes: Mutex<broadcast::Sender<RemoteRecord>>,
    mutation_failures: Mutex<VecDeque<ApiError>>,
    failing_mutations: Mutex<Option<ApiError>>,
    subscribe_failures: Mutex<HashMap<String, u32>>,
    subscribe_calls: AtomicU32,
    hold_mutations: AtomicBool,
    tampered_response: Mutex<Option<(String, Value)>>,
    sync_log: Mutex<Vec<SyncRequest>>,
    mutation_log: Mutex<Vec<MutationRequest>>,
}

impl MockCloud {
    pub fn new(registry: Arc<ModelRegistry>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        Arc::new(Self {
            registry,
            state: Mutex::new(CloudState::default()),
            changes: Mutex::new(changes),
            mutation_failures: Mutex::new(VecDeque::new()),
            failing_mutations: Mutex::new(None),
            subscribe_failures: Mutex::new(HashMap::new()),
            subscribe_calls: AtomicU32::new(0),
            hold_mutations: AtomicBool::new(false),
            tampered_response: Mutex::new(None),
            sync_log: Mutex::new(Vec::new()),
            mutation_log: Mutex::new(Vec::new()),
        })
    }

    /// A write by another client.
    pub fn put(&self, model: &str, key: &str, fields: Value) -> RemoteRecord {
        let record = self.next_version(model, key, fields);
        self.store(record)
    }

    /// A write by another client that open subscriptions never see, so the
    /// client only learns of it when its own mutation is rejected.
    pub fn put_unannounced(&self, model: &str, key: &str, fields: Value) -> RemoteRecord {
        let record = self.next_version(model, key, fields);
        self.record(record)
    }

    fn next_version(&self, model: &str, key: &str, fields: Value) -> RemoteRecord {
        let mut fields = match fields {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        fields.insert("id".into(), json!(key));
        let version = self.version_of(model, key).map_or(1, |v| v + 1);
        RemoteRecord {
            model: model.to_string(),
            key: key.to_string(),
            fields,
            version,
            deleted: false,
            last_changed_at: now_ms(),
        }
    }

    /// A delete by another client.
    pub fn remove(&self, model: &str, key: &str) -> RemoteRecord {
        let current = self.get(model, key).expect("record exists remotely");
        self.store(RemoteRecord {
            version: current.version + 1,
            deleted: true,
            last_changed_at: now_ms(),
            ..current
        })
    }

    /// Store a record exactly as given, e.g. one the client cannot decode.
    pub fn put_raw(&self, record: RemoteRecord) -> RemoteRecord {
        self.store(record)
    }

    pub fn get(&self, model: &str, key: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .records
            .get(&(model.to_string(), key.to_string()))
            .map(|(_, record)| record.clone())
    }

    pub fn version_of(&self, model: &str, key: &str) -> Option<u64> {
        self.get(model, key).map(|record| record.version)
    }

    /// Fail the next mutations with these errors, in order.
    pub fn fail_next_mutations(&self, errors: impl IntoIterator<Item = ApiError>) {
        self.mutation_failures.lock().extend(errors);
    }

    /// Fail every mutation until cleared with `None`.
    pub fn fail_all_mutations(&self, error: Option<ApiError>) {
        *self.failing_mutations.lock() = error;
    }

    /// Refuse the next `attempts` subscription connects for a model.
    pub fn fail_subscriptions(&self, model: &str, attempts: u32) {
        self.subscribe_failures
            .lock()
            .insert(model.to_string(), attempts);
    }

    /// Leave mutations unanswered until the client gives up on them.
    pub fn hold_mutations(&self, hold: bool) {
        self.hold_mutations.store(hold, Ordering::SeqCst);
    }

    /// Overwrite one field of the next accepted mutation's stored record.
    /// The result is not announced to subscriptions.
    pub fn tamper_next_response(&self, field: &str, value: Value) {
        *self.tampered_response.lock() = Some((field.to_string(), value));
    }

    /// Drop every open subscription.
    pub fn disconnect_all(&self) {
        let (changes, _) = broadcast::channel(256);
        *self.changes.lock() = changes;
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn sync_requests(&self) -> Vec<SyncRequest> {
        self.sync_log.lock().clone()
    }

    pub fn mutation_requests(&self) -> Vec<MutationRequest> {
        self.mutation_log.lock().clone()
    }

    fn store(&self, record: RemoteRecord) -> RemoteRecord {
        let record = self.record(record);
        let _ = self.changes.lock().send(record.clone());
        record
    }

    fn record(&self, record: RemoteRecord) -> RemoteRecord {
        let mut state = self.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;
        state.records.insert(
            (record.model.clone(), record.key.clone()),
            (sequence, record.clone()),
        );
        record
    }

    fn injected_failure(&self) -> Option<ApiError> {
        if let Some(error) = self.mutation_failures.lock().pop_front() {
            return Some(error);
        }
        self.failing_mutations.lock().clone()
    }
}

#[async_trait]
impl GraphQlApi for MockCloud {
    async fn mutate(
        &self,
        _token: &AuthToken,
        request: MutationRequest,
    ) -> Result<RemoteRecord, ApiError> {
        self.mutation_log.lock().push(request.clone());
        if self.hold_mutations.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if let Some(error) = self.injected_failure() {
            return Err(error);
        }

        let existing = self.get(&request.model, &request.key);
        let version = match (&existing, request.kind) {
            (Some(current), MutationKind::Create) if !current.deleted => {
                return Err(ApiError::Conflict(Box::new(current.clone())));
            }
            (Some(current), MutationKind::Create) => current.version + 1,
            (None, MutationKind::Create) => 1,
            (None, _) => {
                return Err(ApiError::InvalidRequest(format!(
                    "{}:{} does not exist",
                    request.model, request.key
                )));
            }
            (Some(current), _) if current.deleted || request.version != Some(current.version) => {
                return Err(ApiError::Conflict(Box::new(current.clone())));
            }
            (Some(current), _) => current.version + 1,
        };

        if let (Some(condition), Some(current)) = (&request.condition, &existing) {
            let decoded = current
                .decode(&self.registry)
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
            if !condition.matches(&decoded) {
                return Err(ApiError::ConditionalCheck(format!(
                    "{}:{}",
                    request.model, request.key
                )));
            }
        }

        let deleted = request.kind == MutationKind::Delete;
        let mut fields = match (&existing, deleted) {
            (Some(current), true) => current.fields.clone(),
            _ => request.input,
        };
        let tampered = self.tampered_response.lock().take();
        let announce = tampered.is_none();
        if let Some((field, value)) = tampered {
            fields.insert(field, value);
        }
        let record = RemoteRecord {
            model: request.model,
            key: request.key,
            fields,
            version,
            deleted,
            last_changed_at: now_ms(),
        };
        Ok(if announce {
            self.store(record)
        } else {
            self.record(record)
        })
    }

    async fn sync(&self, _token: &AuthToken, request: SyncRequest) -> Result<SyncPage, ApiError> {
        self.sync_log.lock().push(request.clone());

        let since: u64 = match &request.last_sync {
            Some(token) => token
                .parse()
                .map_err(|_| ApiError::InvalidRequest(format!("bad token {token}")))?,
            None => 0,
        };
        let offset: usize = request
            .next_token
            .as_deref()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);

        let state = self.state.lock();
        let mut changed: Vec<(u64, RemoteRecord)> = state
            .records
            .values()
            .filter(|(sequence, record)| record.model == request.model && *sequence > since)
            .cloned()
            .collect();
        changed.sort_by_key(|(sequence, _)| *sequence);

        let latest = state
            .records
            .values()
            .filter(|(_, record)| record.model == request.model)
            .map(|(sequence, _)| *sequence)
            .max()
            .unwrap_or(since);

        let limit = request.limit as usize;
        let items: Vec<RemoteRecord> = changed
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect();
        let next_token = (offset + limit < changed.len()).then(|| (offset + limit).to_string());

        Ok(SyncPage {
            items,
            next_token,
            sync_token: latest.to_string(),
        })
    }

    async fn subscribe(&self, _token: &AuthToken, model: &str) -> Result<ChangeStream, ApiError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.subscribe_failures.lock();
            if let Some(remaining) = failures.get_mut(model).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(ApiError::Network("connection refused".into()));
            }
        }

        let receiver = self.changes.lock().subscribe();
        let model = model.to_string();
        let stream = stream::unfold((receiver, model), |(mut receiver, model)| async move {
            loop {
                match receiver.recv().await {
                    Ok(record) if record.model == model => {
                        return Some((Ok(record), (receiver, model)));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// A [`MemoryStore`] that can be told to refuse commits.
pub struct FlakyStore {
    inner: MemoryStore,
    refuse: AtomicBool,
}

impl FlakyStore {
    pub fn new(registry: Arc<ModelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(registry),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn refuse_commits(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.inner.snapshot().await
    }
}

#[async_trait]
impl LocalStore for FlakyStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk full".into()));
        }
        self.inner.commit(batch).await
    }

    async fn get(&self, model: &str, key: &str) -> Result<Option<Record>, StorageError> {
        self.inner.get(model, key).await
    }

    async fn query(&self, model: &str, query: &Query) -> Result<Vec<Record>, StorageError> {
        self.inner.query(model, query).await
    }

    async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        self.inner.outbox_entries().await
    }

    async fn cursor(&self, model: &str) -> Result<Option<SyncCursor>, StorageError> {
        self.inner.cursor(model).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }
}

/// A [`MemoryStore`] that can pause one query after reading its result,
/// until the test lets it return.
pub struct GatedStore {
    inner: MemoryStore,
    held_model: Mutex<Option<String>>,
    held: Notify,
    released: Notify,
}

impl GatedStore {
    pub fn new(registry: Arc<ModelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(registry),
            held_model: Mutex::new(None),
            held: Notify::new(),
            released: Notify::new(),
        })
    }

    /// Pause the next query of `model`.
    pub fn hold_next_query(&self, model: &str) {
        *self.held_model.lock() = Some(model.to_string());
    }

    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl LocalStore for GatedStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.inner.commit(batch).await
    }

    async fn get(&self, model: &str, key: &str) -> Result<Option<Record>, StorageError> {
        self.inner.get(model, key).await
    }

    async fn query(&self, model: &str, query: &Query) -> Result<Vec<Record>, StorageError> {
        let records = self.inner.query(model, query).await?;
        let hold = {
            let mut held_model = self.held_model.lock();
            match held_model.as_deref() {
                Some(held) if held == model => held_model.take().is_some(),
                _ => false,
            }
        };
        if hold {
            self.held.notify_one();
            self.released.notified().await;
        }
        Ok(records)
    }

    async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        self.inner.outbox_entries().await
    }

    async fn cursor(&self, model: &str) -> Result<Option<SyncCursor>, StorageError> {
        self.inner.cursor(model).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }
}

pub fn record_ref(model: &str, key: &str) -> RecordRef {
    RecordRef::new(model, key)
}
