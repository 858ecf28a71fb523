//! Base sync: bring every model up to date with the remote.
//!
//! Models are synced in dependency layers, parents before children. Within a
//! layer up to `base_sync_parallelism` models run at once. Each model resumes
//! from its cursor unless the last full sync is older than
//! `full_sync_interval`, and its cursor is only written once all of its
//! pages were applied, so a failure never advances the cursor past data that
//! was not stored.

use crate::api::{AuthProvider, GraphQlApi, SyncPage, SyncRequest};
use crate::context::SyncContext;
use crate::error::{ApiError, DataStoreError, ErrorClass, Result};
use crate::now_millis;
use crate::publisher::{DataStoreEvent, ModelSyncStats};
use crate::reconcile::{Applied, RemoteApplier};
use futures::{stream, FutureExt, StreamExt};
use std::sync::Arc;
use tether_engine::{SyncCursor, WriteBatch};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub(crate) struct BaseSync {
    ctx: Arc<SyncContext>,
    api: Arc<dyn GraphQlApi>,
    auth: Arc<dyn AuthProvider>,
    applier: RemoteApplier,
}

impl BaseSync {
    pub fn new(
        ctx: Arc<SyncContext>,
        api: Arc<dyn GraphQlApi>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let applier = RemoteApplier::new(ctx.clone());
        Self {
            ctx,
            api,
            auth,
            applier,
        }
    }

    /// Sync all models. The first failing layer stops the run after its
    /// other models have finished.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Vec<ModelSyncStats>> {
        let registry = self.ctx.registry.clone();
        let models: Vec<String> = registry.sync_layers().iter().flatten().cloned().collect();
        tracing::info!(models = models.len(), "Starting base sync");
        self.ctx
            .publish(DataStoreEvent::SyncQueriesStarted { models });

        let parallelism = self.ctx.config.base_sync_parallelism.max(1);
        let mut synced = Vec::new();

        for layer in registry.sync_layers() {
            let pending: Vec<_> = layer
                .iter()
                .map(|model| self.sync_model(model, cancel).boxed())
                .collect();
            let results: Vec<Result<ModelSyncStats>> = stream::iter(pending)
                .buffer_unordered(parallelism)
                .collect()
                .await;

            let mut failure: Option<DataStoreError> = None;
            for result in results {
                match result {
                    Ok(stats) => synced.push(stats),
                    // Keep the most severe failure of the layer
                    Err(e) => match &failure {
                        Some(current) if current.class() == ErrorClass::Fatal => {}
                        _ => failure = Some(e),
                    },
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }

        tracing::info!(models = synced.len(), "Base sync complete");
        self.ctx.publish(DataStoreEvent::SyncQueriesReady);
        Ok(synced)
    }

    async fn sync_model(&self, model: &str, cancel: &CancellationToken) -> Result<ModelSyncStats> {
        let ctx = &self.ctx;
        let started = now_millis();
        let interval = u64::try_from(ctx.config.full_sync_interval.as_millis()).unwrap_or(u64::MAX);

        let cursor = ctx.store.cursor(model).await?;
        let last_sync = cursor
            .as_ref()
            .filter(|c| !c.needs_full_sync(started, interval))
            .map(|c| c.token.clone());

        let mut stats = ModelSyncStats {
            model: model.to_string(),
            full_sync: last_sync.is_none(),
            ..ModelSyncStats::default()
        };
        let max_records = ctx.config.sync_max_records.max(1);
        let mut fetched: u32 = 0;
        let mut next_token = None;

        let sync_token = loop {
            let request = SyncRequest {
                model: model.to_string(),
                last_sync: last_sync.clone(),
                next_token: next_token.take(),
                limit: ctx.config.sync_page_size.min(max_records - fetched).max(1),
            };
            let page = self.fetch(request, cancel).await?;
            fetched = fetched.saturating_add(u32::try_from(page.items.len()).unwrap_or(u32::MAX));

            for item in page.items {
                match self.applier.apply(item).await? {
                    Applied::Created => stats.created += 1,
                    Applied::Updated => stats.updated += 1,
                    Applied::Deleted => stats.deleted += 1,
                    Applied::Dropped | Applied::KeptLocal => stats.dropped += 1,
                }
            }

            match page.next_token {
                Some(token) if fetched < max_records => next_token = Some(token),
                Some(_) => {
                    tracing::warn!(model, fetched, "Base sync stopped at the record limit");
                    break page.sync_token;
                }
                None => break page.sync_token,
            }
        };

        let next_cursor = match &cursor {
            Some(current) if last_sync.is_some() => (current.token != sync_token)
                .then(|| current.advance(sync_token.clone(), now_millis())),
            _ => Some(SyncCursor::new(model, sync_token, now_millis())),
        };
        if let Some(next_cursor) = next_cursor {
            ctx.store.commit(WriteBatch::new().cursor(next_cursor)).await?;
        }

        tracing::info!(
            model,
            full = stats.full_sync,
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            dropped = stats.dropped,
            "Model synced"
        );
        ctx.publish(DataStoreEvent::ModelSynced {
            stats: stats.clone(),
        });
        Ok(stats)
    }

    async fn fetch(&self, request: SyncRequest, cancel: &CancellationToken) -> Result<SyncPage> {
        let token = tokio::select! {
            token = self.auth.valid_token() => token?,
            _ = cancel.cancelled() => return Err(DataStoreError::Cancelled),
        };

        let timeout = self.ctx.config.request_timeout;
        let page = tokio::select! {
            page = tokio::time::timeout(timeout, self.api.sync(&token, request)) => page,
            _ = cancel.cancelled() => return Err(DataStoreError::Cancelled),
        };
        Ok(page.unwrap_or(Err(ApiError::Timeout))?)
    }
}
