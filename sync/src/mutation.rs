//! Outgoing mutation processor.
//!
//! Drains the outbox one entry at a time and settles each entry according
//! to the remote's answer:
//!
//! - accepted: the entry is acknowledged and the local record confirmed
//! - version conflict: the conflict resolver decides between retrying with
//!   merged data and taking the remote's copy
//! - condition not met: the entry is dropped with `ConditionalSaveFailed`
//! - transient failure: the entry is requeued with backoff until it runs out
//!   of attempts
//! - anything else: the entry is dropped with `MutationFailed`

use crate::api::{AuthProvider, AuthToken, GraphQlApi, MutationRequest};
use crate::context::SyncContext;
use crate::error::{ApiError, ErrorClass, Result};
use crate::now_millis;
use crate::outbox::Checkout;
use crate::publisher::DataStoreEvent;
use crate::reconcile::{remote_event, remote_view};
use std::sync::Arc;
use tether_engine::{
    ChangeSet, Decision, MutationKind, Origin, OutboxEntry, RemoteRecord, RequeueOutcome, Trigger,
    WriteBatch,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub(crate) struct MutationProcessor {
    ctx: Arc<SyncContext>,
    api: Arc<dyn GraphQlApi>,
    auth: Arc<dyn AuthProvider>,
}

impl MutationProcessor {
    pub fn new(
        ctx: Arc<SyncContext>,
        api: Arc<dyn GraphQlApi>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self { ctx, api, auth }
    }

    /// Drain the outbox until cancelled.
    ///
    /// Returns an error only for failures that stop the whole engine.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::debug!(pending = self.ctx.outbox.len(), "Mutation processor started");

        while let Some(checkout) = self.ctx.outbox.next_ready(&self.ctx.locks, &cancel).await {
            let Checkout {
                entry,
                changes,
                guard,
            } = checkout;
            self.ctx
                .commit(WriteBatch::new().outbox(&changes), changes)
                .await?;
            drop(guard);

            self.process(entry, &cancel).await?;
            self.ctx.publish_outbox_status();
        }

        tracing::debug!("Mutation processor stopped");
        Ok(())
    }

    async fn process(&self, entry: OutboxEntry, cancel: &CancellationToken) -> Result<()> {
        tracing::debug!(
            entry = entry.id,
            record = %entry.record_ref(),
            kind = %entry.event.kind,
            attempt = entry.attempts + 1,
            "Sending mutation"
        );

        let token = tokio::select! {
            token = self.auth.valid_token() => token,
            _ = cancel.cancelled() => return self.release(&entry).await,
        };
        let token = match token {
            Ok(token) => token,
            Err(e) if e.class() == ErrorClass::Fatal => {
                self.release(&entry).await?;
                return Err(e.into());
            }
            Err(e) => return self.retry_later(entry, ApiError::Authorization(e.to_string())).await,
        };

        let request = match MutationRequest::from_event(&self.ctx.registry, &entry.event) {
            Ok(request) => request,
            Err(e) => return self.fail(entry, ApiError::InvalidRequest(e.to_string())).await,
        };

        let response = tokio::select! {
            response = self.send(&token, request) => response,
            _ = cancel.cancelled() => return self.release(&entry).await,
        };

        match response {
            Ok(remote) => self.acknowledge(entry, remote).await,
            Err(ApiError::Conflict(remote)) => self.resolve_conflict(entry, *remote).await,
            Err(ApiError::ConditionalCheck(reason)) => {
                tracing::info!(record = %entry.record_ref(), %reason, "Conditional mutation rejected");
                self.drop_entry(&entry).await?;
                self.ctx
                    .publish(DataStoreEvent::ConditionalSaveFailed { event: entry.event });
                Ok(())
            }
            Err(e) if e.is_retryable() => self.retry_later(entry, e).await,
            Err(e) => self.fail(entry, e).await,
        }
    }

    async fn send(
        &self,
        token: &AuthToken,
        request: MutationRequest,
    ) -> std::result::Result<RemoteRecord, ApiError> {
        let timeout = self.ctx.config.request_timeout;
        tokio::time::timeout(timeout, self.api.mutate(token, request))
            .await
            .unwrap_or(Err(ApiError::Timeout))
    }

    async fn acknowledge(&self, entry: OutboxEntry, remote: RemoteRecord) -> Result<()> {
        let ctx = &self.ctx;
        let target = entry.record_ref();
        let _guard = ctx.locks.lock(&target).await;

        let changes = ctx
            .outbox
            .with(|outbox| outbox.acknowledge(entry.id, Some(remote.version)))?;
        let follow_up = ctx.outbox.has_pending(&target);

        let mut batch = WriteBatch::new().outbox(&changes);
        if let Some(mut local) = ctx.store.get(&target.model, &target.key).await? {
            local.sync.confirm(remote.version, remote.last_changed_at);
            local.sync.pending = follow_up;
            // With nothing else pending the remote copy is authoritative
            if !follow_up && !remote.deleted {
                match ctx.registry.decode_fields(&remote.model, &remote.fields, true) {
                    Ok(fields) => local.fields = fields,
                    Err(error) => tracing::warn!(
                        record = %target,
                        version = remote.version,
                        %error,
                        "Acknowledged record does not match the local schema, keeping local fields"
                    ),
                }
            }
            batch = batch.save(local);
        }
        ctx.commit(batch, changes).await?;

        tracing::debug!(record = %target, version = remote.version, "Mutation acknowledged");

        let mut event = entry.event;
        event.version = Some(remote.version);
        ctx.publish(DataStoreEvent::OutboxMutationProcessed {
            event,
            version: remote.version,
        });
        Ok(())
    }

    async fn resolve_conflict(&self, entry: OutboxEntry, remote: RemoteRecord) -> Result<()> {
        let ctx = &self.ctx;
        let decoded = match remote.decode(&ctx.registry) {
            Ok(decoded) => decoded,
            Err(e) => return self.fail(entry, ApiError::Transformation(e.to_string())).await,
        };

        let target = entry.record_ref();
        let _guard = ctx.locks.lock(&target).await;
        let local = ctx.store.get(&target.model, &target.key).await?;

        match ctx.resolver.resolve(Trigger::Rejected, &entry.event, &decoded) {
            Decision::RetryWithMergedData(event) => {
                tracing::info!(record = %target, base = ?event.version, "Conflict resolved, retrying with merged data");

                let (_, changes) = ctx
                    .outbox
                    .with(|outbox| outbox.retry_with(entry.id, event.clone(), now_millis()))?;

                let mut batch = WriteBatch::new().outbox(&changes);
                if let Some(mut local) = local {
                    local.sync.version = local.sync.version.max(decoded.sync.version);
                    if let (false, Some(fields)) = (local.sync.deleted, &event.fields) {
                        local.fields = fields.clone();
                    }
                    batch = batch.save(local);
                }
                ctx.commit(batch, changes).await?;
                ctx.outbox.wake();
            }
            Decision::DiscardLocal | Decision::ApplyRemote => {
                tracing::info!(record = %target, version = decoded.sync.version, "Conflict resolved in favour of the remote");

                let (_, mut changes) = ctx.outbox.with(|outbox| outbox.remove(entry.id))?;
                changes.extend(ctx.outbox.with(|outbox| outbox.cancel(&target)));

                let kind = if decoded.sync.deleted {
                    MutationKind::Delete
                } else {
                    MutationKind::Update
                };
                let record = remote_view(local, decoded);
                let batch = WriteBatch::new().save(record.clone()).outbox(&changes);
                ctx.commit(batch, changes).await?;

                ctx.publish(DataStoreEvent::Mutation {
                    event: remote_event(&record, kind),
                    origin: Origin::Remote,
                });
            }
        }
        Ok(())
    }

    async fn retry_later(&self, entry: OutboxEntry, error: ApiError) -> Result<()> {
        let ctx = &self.ctx;
        let delay = ctx.config.mutation_retry.delay_for_attempt(entry.attempts + 1);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        let target = entry.record_ref();
        let _guard = ctx.locks.lock(&target).await;
        let (outcome, changes) = ctx
            .outbox
            .with(|outbox| outbox.requeue(entry.id, delay_ms, now_millis()))?;
        ctx.commit(WriteBatch::new().outbox(&changes), changes).await?;

        match outcome {
            RequeueOutcome::Scheduled(next) => {
                tracing::warn!(
                    record = %target,
                    attempts = next.attempts,
                    delay_ms,
                    %error,
                    "Mutation failed, will retry"
                );
                ctx.outbox.wake();
            }
            RequeueOutcome::Cancelled => {
                tracing::debug!(record = %target, "Failed mutation cancelled by a newer one");
            }
            RequeueOutcome::Exhausted(dropped) => {
                tracing::error!(
                    record = %target,
                    attempts = dropped.attempts,
                    %error,
                    "Mutation failed after all attempts"
                );
                ctx.publish(DataStoreEvent::MutationFailed {
                    event: dropped.event,
                    error,
                    retryable: true,
                });
            }
        }
        Ok(())
    }

    async fn fail(&self, entry: OutboxEntry, error: ApiError) -> Result<()> {
        tracing::error!(record = %entry.record_ref(), %error, "Mutation rejected");
        self.drop_entry(&entry).await?;
        self.ctx.publish(DataStoreEvent::MutationFailed {
            event: entry.event,
            error,
            retryable: false,
        });
        Ok(())
    }

    async fn drop_entry(&self, entry: &OutboxEntry) -> Result<()> {
        let ctx = &self.ctx;
        let _guard = ctx.locks.lock(&entry.record_ref()).await;
        let (_, changes) = ctx.outbox.with(|outbox| outbox.remove(entry.id))?;
        ctx.commit(WriteBatch::new().outbox(&changes), changes).await
    }

    /// Put an entry back untouched, e.g. on cancellation.
    async fn release(&self, entry: &OutboxEntry) -> Result<()> {
        let ctx = &self.ctx;
        let changes = ctx
            .outbox
            .with(|outbox| outbox.release(entry.id))
            .unwrap_or_else(|_| ChangeSet::default());
        ctx.commit(WriteBatch::new().outbox(&changes), changes).await
    }
}
