//! Integration tests for the remote sync engine against an in-memory cloud.

mod common;

use async_trait::async_trait;
use common::{drain, eventually, post, registry, test_config, wait_for, MockCloud};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{
    FieldValue, ModelRegistry, MutationEvent, MutationKind, Origin, Record, RemoteRecord,
    Resolution,
};
use tether_sync::{
    ApiError, AuthError, AuthProvider, AuthToken, DataStore, DataStoreEvent, EngineState,
    LocalStore, MemoryStore, StopReason, SyncConfig,
};

struct Harness {
    store: DataStore,
    cloud: Arc<MockCloud>,
    disk: Arc<MemoryStore>,
}

async fn harness_with(config: SyncConfig) -> Harness {
    common::init_tracing();
    let registry = registry();
    let cloud = MockCloud::new(registry.clone());
    let disk = Arc::new(MemoryStore::new(registry.clone()));
    let store = DataStore::builder(registry)
        .with_store(disk.clone())
        .with_api(cloud.clone())
        .with_config(config)
        .build()
        .await
        .unwrap();
    Harness { store, cloud, disk }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

fn is_ready(event: &DataStoreEvent) -> bool {
    matches!(event, DataStoreEvent::Ready)
}

fn state_changes(events: &[DataStoreEvent]) -> Vec<EngineState> {
    events
        .iter()
        .filter_map(|event| match event {
            DataStoreEvent::StateChanged(state) => Some(state.clone()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod outbox_tests {
    use super::*;

    #[tokio::test]
    async fn test_local_save_is_sent_and_confirmed() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        h.store.save(post("p-1", "Hello"), None).await.unwrap();

        let processed = wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::OutboxMutationProcessed { .. })
        })
        .await;
        assert!(matches!(
            processed,
            DataStoreEvent::OutboxMutationProcessed { version: 1, .. }
        ));

        let local = h.store.get("Post", "p-1").await.unwrap().unwrap();
        assert_eq!(local.sync.version, Some(1));
        assert!(!local.sync.pending);
        assert!(h.store.pending_mutations().is_empty());
        assert_eq!(h.cloud.version_of("Post", "p-1"), Some(1));

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_mutations_saved_offline_are_sent_on_start() {
        let h = harness().await;
        h.store.save(post("p-1", "One"), None).await.unwrap();
        h.store.save(post("p-1", "Two"), None).await.unwrap();
        h.store.save(post("p-2", "Other"), None).await.unwrap();
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::OutboxStatus { is_empty: true })
        })
        .await;

        let sent = h.cloud.mutation_requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].key, "p-1");
        assert_eq!(sent[0].input.get("title"), Some(&json!("Two")));
        assert_eq!(sent[1].key, "p-2");

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_transient_failures_end_in_one_failure_event() {
        let h = harness().await;
        h.cloud
            .fail_all_mutations(Some(ApiError::Network("offline".into())));
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        h.store.save(post("p-1", "Hello"), None).await.unwrap();
        let failed = wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::MutationFailed { .. })
        })
        .await;
        assert!(matches!(
            failed,
            DataStoreEvent::MutationFailed { retryable: true, .. }
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let later = drain(&mut events);
        assert!(!later
            .iter()
            .any(|event| matches!(event, DataStoreEvent::MutationFailed { .. })));

        // Configured for three attempts
        assert_eq!(h.cloud.mutation_requests().len(), 3);
        assert!(h.store.pending_mutations().is_empty());

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let h = harness().await;
        h.cloud.fail_next_mutations([ApiError::Throttled]);
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        h.store.save(post("p-1", "Hello"), None).await.unwrap();
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::OutboxMutationProcessed { .. })
        })
        .await;

        assert_eq!(h.cloud.mutation_requests().len(), 2);
        assert_eq!(h.cloud.version_of("Post", "p-1"), Some(1));

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_acknowledgement_keeps_local_fields() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        h.cloud.tamper_next_response("status", json!("ARCHIVED"));
        h.store.save(post("p-1", "Hello"), None).await.unwrap();
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::OutboxMutationProcessed { .. })
        })
        .await;

        let local = h.store.get("Post", "p-1").await.unwrap().unwrap();
        assert_eq!(local.sync.version, Some(1));
        assert!(!local.sync.pending);
        assert_eq!(local.get("title"), Some(&"Hello".into()));
        assert_eq!(local.get("status"), None);
        assert!(h.store.pending_mutations().is_empty());
        assert!(!h.store.state().is_fatal());

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_remote_condition_failure_drops_mutation() {
        let h = harness().await;
        h.cloud
            .fail_next_mutations([ApiError::ConditionalCheck("rating".into())]);
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        h.store.save(post("p-1", "Hello"), None).await.unwrap();
        let rejected = wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::ConditionalSaveFailed { .. })
        })
        .await;

        assert!(matches!(
            rejected,
            DataStoreEvent::ConditionalSaveFailed { event } if event.key == "p-1"
        ));
        assert!(h.store.pending_mutations().is_empty());

        h.store.stop().await;
    }
}

#[cfg(test)]
mod rejected_mutation_tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn is_processed(event: &DataStoreEvent) -> bool {
        matches!(event, DataStoreEvent::OutboxMutationProcessed { .. })
    }

    #[tokio::test]
    async fn test_rejection_by_remote_delete_discards_local() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        let mut fields = serde_json::Map::new();
        fields.insert("id".into(), json!("p-1"));
        fields.insert("title".into(), json!("Gone"));
        h.cloud
            .fail_next_mutations([ApiError::Conflict(Box::new(RemoteRecord {
                model: "Post".into(),
                key: "p-1".into(),
                fields,
                version: 2,
                deleted: true,
                last_changed_at: 1,
            }))]);

        h.store.save(post("p-1", "Hello"), None).await.unwrap();
        wait_for(&mut events, |event| {
            matches!(
                event,
                DataStoreEvent::Mutation { event, origin: Origin::Remote }
                    if event.key == "p-1" && event.kind == MutationKind::Delete
            )
        })
        .await;

        assert!(h.store.get("Post", "p-1").await.unwrap().is_none());
        assert!(h.store.pending_mutations().is_empty());
        assert_eq!(h.cloud.mutation_requests().len(), 1);

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_newer_create_is_merged_and_resent() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        // Another client created p-1 first; this client has not heard of it
        h.cloud
            .put_unannounced("Post", "p-1", json!({"title": "Remote", "rating": 5}));
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.store.save(post("p-1", "Local"), None).await.unwrap();

        wait_for(&mut events, is_processed).await;

        let sent = h.cloud.mutation_requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MutationKind::Create);
        assert_eq!(sent[1].kind, MutationKind::Update);
        assert_eq!(sent[1].version, Some(1));

        let remote = h.cloud.get("Post", "p-1").unwrap();
        assert_eq!(remote.version, 2);
        assert_eq!(remote.fields.get("title"), Some(&json!("Local")));
        assert_eq!(remote.fields.get("rating"), Some(&json!(5)));

        let local = h.store.get("Post", "p-1").await.unwrap().unwrap();
        assert_eq!(local.sync.version, Some(2));
        assert_eq!(local.get("rating"), Some(&5i64.into()));

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_conflict_handler_decides_rejected_mutation() {
        common::init_tracing();
        let registry = registry();
        let cloud = MockCloud::new(registry.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = calls.clone();
            move |local: &MutationEvent, remote: &Record| {
                calls.fetch_add(1, Ordering::SeqCst);
                let local_title = local
                    .fields
                    .as_ref()
                    .and_then(|fields| fields.get("title"))
                    .and_then(FieldValue::as_str)
                    .unwrap_or_default();
                let remote_title = remote
                    .get("title")
                    .and_then(FieldValue::as_str)
                    .unwrap_or_default();
                let mut fields = std::collections::BTreeMap::new();
                fields.insert(
                    "title".to_string(),
                    format!("{local_title} + {remote_title}").into(),
                );
                Resolution::Retry(fields)
            }
        };
        let store = DataStore::builder(registry)
            .with_api(cloud.clone())
            .with_config(test_config())
            .with_conflict_handler(Arc::new(handler))
            .build()
            .await
            .unwrap();
        let mut events = store.subscribe_all();
        store.start().await;
        wait_for(&mut events, is_ready).await;

        cloud.put_unannounced("Post", "p-1", json!({"title": "Remote"}));
        store.save(post("p-1", "Local"), None).await.unwrap();
        wait_for(&mut events, is_processed).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let remote = cloud.get("Post", "p-1").unwrap();
        assert_eq!(remote.version, 2);
        assert_eq!(remote.fields.get("title"), Some(&json!("Local + Remote")));

        let local = store.get("Post", "p-1").await.unwrap().unwrap();
        assert_eq!(local.get("title"), Some(&"Local + Remote".into()));

        store.stop().await;
    }
}

#[cfg(test)]
mod base_sync_tests {
    use super::*;

    #[tokio::test]
    async fn test_base_sync_pulls_remote_records() {
        let h = harness().await;
        h.cloud.put("Post", "p-1", json!({"title": "Remote one"}));
        h.cloud.put("Post", "p-2", json!({"title": "Remote two", "rating": 4}));
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        let synced = wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::ModelSynced { stats } if stats.model == "Post")
        })
        .await;

        let DataStoreEvent::ModelSynced { stats } = synced else {
            unreachable!()
        };
        assert!(stats.full_sync);
        assert_eq!(stats.created, 2);

        let local = h.store.get("Post", "p-2").await.unwrap().unwrap();
        assert_eq!(local.get("rating"), Some(&4i64.into()));
        assert_eq!(local.sync.version, Some(1));
        assert!(!local.sync.pending);

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_base_sync_rerun_is_idempotent() {
        let h = harness().await;
        h.cloud.put("Post", "p-1", json!({"title": "Remote"}));
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        wait_for(&mut events, is_ready).await;
        h.store.stop().await;
        let cursor = h.disk.cursor("Post").await.unwrap().unwrap();

        h.store.start().await;
        let synced = wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::ModelSynced { stats } if stats.model == "Post")
        })
        .await;
        wait_for(&mut events, is_ready).await;

        let DataStoreEvent::ModelSynced { stats } = synced else {
            unreachable!()
        };
        assert!(!stats.full_sync);
        assert_eq!(stats.created + stats.updated + stats.deleted, 0);
        assert_eq!(h.disk.cursor("Post").await.unwrap(), Some(cursor.clone()));

        let requests = h.cloud.sync_requests();
        let last = requests.iter().rev().find(|r| r.model == "Post").unwrap();
        assert_eq!(last.last_sync, Some(cursor.token));

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_base_sync_pages_through_results() {
        let h = harness_with(test_config().with_sync_page_size(2)).await;
        for i in 0..5 {
            h.cloud
                .put("Post", &format!("p-{i}"), json!({"title": format!("Post {i}")}));
        }
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        let pages = h
            .cloud
            .sync_requests()
            .into_iter()
            .filter(|r| r.model == "Post")
            .count();
        assert_eq!(pages, 3);
        assert_eq!(h.disk.record_count().await, 5);

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_base_sync_stops_at_record_limit() {
        let config = test_config()
            .with_sync_page_size(2)
            .with_sync_max_records(3);
        let h = harness_with(config).await;
        for i in 0..6 {
            h.cloud
                .put("Post", &format!("p-{i}"), json!({"title": format!("Post {i}")}));
        }
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        assert_eq!(h.disk.record_count().await, 3);
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_parents_sync_before_children() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        let order: Vec<String> = h
            .cloud
            .sync_requests()
            .into_iter()
            .map(|r| r.model)
            .collect();
        assert_eq!(order, vec!["Post".to_string(), "Comment".to_string()]);

        h.store.stop().await;
    }
}

#[cfg(test)]
mod reconcile_tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_applies_remote_change() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        h.cloud.put("Post", "p-9", json!({"title": "From elsewhere"}));
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::Mutation { origin: Origin::Remote, event } if event.key == "p-9")
        })
        .await;

        let local = h.store.get("Post", "p-9").await.unwrap().unwrap();
        assert_eq!(local.get("title"), Some(&"From elsewhere".into()));

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_stale_remote_version_is_ignored() {
        let h = harness().await;
        h.cloud.put("Post", "p-1", json!({"title": "v1"}));
        h.cloud.put("Post", "p-1", json!({"title": "v2"}));
        let current = h.cloud.put("Post", "p-1", json!({"title": "v3"}));
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        let mut stale = current.clone();
        stale.version = 2;
        stale.fields.insert("title".into(), json!("stale"));
        h.cloud.put_raw(stale);
        h.cloud.put("Post", "p-2", json!({"title": "marker"}));
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::Mutation { event, .. } if event.key == "p-2")
        })
        .await;

        let local = h.store.get("Post", "p-1").await.unwrap().unwrap();
        assert_eq!(local.sync.version, Some(3));
        assert_eq!(local.get("title"), Some(&"v3".into()));

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_newer_local_change_is_merged_and_resent() {
        let h = harness().await;
        h.cloud
            .put("Post", "p-1", json!({"title": "Original", "rating": 1}));
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;
        h.store.stop().await;

        // Another client edits the rating, then this one edits the title
        h.cloud
            .put("Post", "p-1", json!({"title": "Original", "rating": 5}));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut local = h.store.get("Post", "p-1").await.unwrap().unwrap();
        local.fields.insert("title".into(), "Local title".into());
        h.store.save(local, None).await.unwrap();

        h.store.start().await;
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::OutboxMutationProcessed { .. })
        })
        .await;

        let remote = h.cloud.get("Post", "p-1").unwrap();
        assert_eq!(remote.version, 3);
        assert_eq!(remote.fields.get("title"), Some(&json!("Local title")));

        let local = h.store.get("Post", "p-1").await.unwrap().unwrap();
        assert_eq!(local.sync.version, Some(3));

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_remote_delete_wins_over_pending_update() {
        let h = harness().await;
        h.cloud.put("Post", "p-1", json!({"title": "Original"}));
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;
        h.store.stop().await;

        let mut local = h.store.get("Post", "p-1").await.unwrap().unwrap();
        local.fields.insert("title".into(), "Edited offline".into());
        h.store.save(local, None).await.unwrap();
        h.cloud.remove("Post", "p-1");

        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        assert!(h.store.get("Post", "p-1").await.unwrap().is_none());
        assert!(h.store.pending_mutations().is_empty());
        assert!(h
            .cloud
            .mutation_requests()
            .iter()
            .all(|request| request.key != "p-1"));

        h.store.stop().await;
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    struct SignedOut;

    #[async_trait]
    impl AuthProvider for SignedOut {
        async fn valid_token(&self) -> Result<AuthToken, AuthError> {
            Err(AuthError::NotSignedIn)
        }
    }

    fn drifted(registry: &ModelRegistry) -> RemoteRecord {
        assert!(registry.contains("Post"));
        let mut fields = serde_json::Map::new();
        fields.insert("id".into(), json!("p-x"));
        fields.insert("title".into(), json!("From the future"));
        fields.insert("status".into(), json!("ARCHIVED"));
        RemoteRecord {
            model: "Post".into(),
            key: "p-x".into(),
            fields,
            version: 1,
            deleted: false,
            last_changed_at: 0,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        wait_for(&mut events, is_ready).await;
        assert_eq!(h.store.state(), EngineState::SyncingMutationsAndSubscribing);

        h.store.stop().await;
        assert_eq!(h.store.state(), EngineState::Stopped(StopReason::Requested));

        let states = state_changes(&drain(&mut events));
        assert_eq!(states.last(), Some(&EngineState::Stopped(StopReason::Requested)));
    }

    #[tokio::test]
    async fn test_schema_drift_stops_without_restart() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        h.cloud.put_raw(drifted(h.store.registry()));
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::SyncFailed { fatal: true, .. })
        })
        .await;

        let mut watch = h.store.state_changes().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|state| state.is_fatal()),
        )
        .await
        .unwrap()
        .unwrap();

        let rest = drain(&mut events);
        assert!(!state_changes(&rest).contains(&EngineState::SchedulingRestart));
        assert!(!rest
            .iter()
            .any(|event| matches!(event, DataStoreEvent::SyncFailed { .. })));
        assert!(h.store.get("Post", "p-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_subscription_restarts_from_cursor() {
        let h = harness().await;
        h.cloud.put("Post", "p-1", json!({"title": "Before"}));
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;
        let syncs_before = h.cloud.sync_requests().len();

        h.cloud.fail_subscriptions("Post", 3);
        h.cloud.disconnect_all();

        let failed = wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::SyncFailed { .. })
        })
        .await;
        assert!(matches!(failed, DataStoreEvent::SyncFailed { fatal: false, .. }));
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::StateChanged(EngineState::SchedulingRestart))
        })
        .await;
        wait_for(&mut events, is_ready).await;

        let resumed: Vec<_> = h.cloud.sync_requests()[syncs_before..]
            .iter()
            .filter(|r| r.model == "Post")
            .cloned()
            .collect();
        assert!(!resumed.is_empty());
        assert!(resumed.iter().all(|r| r.last_sync.is_some()));

        h.cloud.put("Post", "p-2", json!({"title": "After"}));
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::Mutation { event, .. } if event.key == "p-2")
        })
        .await;

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_restart_budget_is_bounded() {
        let h = harness_with(test_config().with_max_restarts(1)).await;
        h.cloud.fail_subscriptions("Post", 100);
        let mut events = h.store.subscribe_all();

        h.store.start().await;
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::SyncFailed { fatal: true, .. })
        })
        .await;

        let mut watch = h.store.state_changes().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|state| state.is_fatal()),
        )
        .await
        .unwrap()
        .unwrap();

        // Three attempts per cycle, two cycles
        assert_eq!(h.cloud.subscribe_calls(), 6);
    }

    #[tokio::test]
    async fn test_signed_out_user_is_fatal() {
        common::init_tracing();
        let registry = registry();
        let cloud = MockCloud::new(registry.clone());
        let store = DataStore::builder(registry)
            .with_api(cloud.clone())
            .with_auth(Arc::new(SignedOut))
            .with_config(test_config())
            .build()
            .await
            .unwrap();
        let mut events = store.subscribe_all();

        store.start().await;
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::SyncFailed { fatal: true, .. })
        })
        .await;

        let mut watch = store.state_changes().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|state| state.is_fatal()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(cloud.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_pending_work_survives_restart_of_the_process() {
        let h = harness().await;
        h.store.save(post("p-1", "Offline"), None).await.unwrap();
        let snapshot = h.disk.snapshot().await;
        drop(h);

        let registry = registry();
        let cloud = MockCloud::new(registry.clone());
        let disk = Arc::new(MemoryStore::from_snapshot(registry.clone(), snapshot).unwrap());
        let store = DataStore::builder(registry)
            .with_store(disk)
            .with_api(cloud.clone())
            .with_config(test_config())
            .build()
            .await
            .unwrap();
        let mut events = store.subscribe_all();

        store.start().await;
        wait_for(&mut events, |event| {
            matches!(event, DataStoreEvent::OutboxMutationProcessed { .. })
        })
        .await;

        assert_eq!(cloud.version_of("Post", "p-1"), Some(1));
        store.stop().await;
    }

    #[tokio::test]
    async fn test_delete_behind_unanswered_create_survives_restart() {
        let h = harness().await;
        let mut events = h.store.subscribe_all();
        h.store.start().await;
        wait_for(&mut events, is_ready).await;

        // The create reaches the remote but its answer never arrives
        h.cloud.hold_mutations(true);
        h.store.save(post("p-1", "Hello"), None).await.unwrap();
        let cloud = h.cloud.clone();
        eventually(|| {
            let cloud = cloud.clone();
            async move { cloud.mutation_requests().len() == 1 }
        })
        .await;
        h.cloud.put_unannounced("Post", "p-1", json!({"title": "Hello"}));
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.store.delete("Post", "p-1", None).await.unwrap();

        let snapshot = h.disk.snapshot().await;
        h.store.stop().await;
        h.cloud.hold_mutations(false);

        let registry = registry();
        let disk = Arc::new(MemoryStore::from_snapshot(registry.clone(), snapshot).unwrap());
        let store = DataStore::builder(registry)
            .with_store(disk)
            .with_api(h.cloud.clone())
            .with_config(test_config())
            .build()
            .await
            .unwrap();
        let pending = store.pending_mutations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.kind, MutationKind::Delete);

        let mut events = store.subscribe_all();
        store.start().await;
        wait_for(&mut events, |event| {
            matches!(
                event,
                DataStoreEvent::OutboxMutationProcessed { event, .. }
                    if event.kind == MutationKind::Delete
            )
        })
        .await;

        assert!(h.cloud.get("Post", "p-1").unwrap().deleted);
        assert!(store.get("Post", "p-1").await.unwrap().is_none());
        store.stop().await;
    }
}
