//! Applying remote changes to local storage.
//!
//! Every remote record, whether from base sync or a live subscription,
//! passes through [`RemoteApplier::apply`]. Under the record's lock it is
//! compared against the local copy and any pending local mutation before it
//! is written.

use crate::context::SyncContext;
use crate::error::Result;
use crate::publisher::DataStoreEvent;
use crate::now_millis;
use std::sync::Arc;
use tether_engine::{
    ChangeSet, Decision, Disposition, MutationEvent, MutationKind, Origin, Record, RemoteRecord,
    Trigger, WriteBatch,
};

/// Effect of one remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Deleted,
    /// Duplicate, out of date, or the record has a mutation in flight
    Dropped,
    /// A pending local mutation won and was rebased on the remote version
    KeptLocal,
}

/// Writes remote records through the conflict resolver.
#[derive(Clone)]
pub(crate) struct RemoteApplier {
    ctx: Arc<SyncContext>,
}

impl RemoteApplier {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Apply one remote record.
    ///
    /// Fails with a schema drift error if the record cannot be decoded.
    pub async fn apply(&self, remote: RemoteRecord) -> Result<Applied> {
        let ctx = &self.ctx;
        let target = remote.record_ref();
        let decoded = remote.decode(&ctx.registry)?;

        let _guard = ctx.locks.lock(&target).await;
        let local = ctx.store.get(&target.model, &target.key).await?;

        let (in_flight, queued) = ctx.outbox.with(|outbox| {
            (
                outbox.in_flight_for(&target).is_some(),
                outbox.queued_for(&target).cloned(),
            )
        });

        // The response to the in-flight mutation settles the record
        if in_flight {
            tracing::debug!(record = %target, version = remote.version, "Remote change dropped, mutation in flight");
            return Ok(Applied::Dropped);
        }

        let kind = match remote.disposition(local.as_ref().map(|r| &r.sync)) {
            Disposition::Create => MutationKind::Create,
            Disposition::Update => MutationKind::Update,
            Disposition::Delete => MutationKind::Delete,
            Disposition::Drop => {
                tracing::trace!(record = %target, version = remote.version, "Remote change already applied");
                return Ok(Applied::Dropped);
            }
        };

        let mut changes = ChangeSet::default();
        if let Some(entry) = queued {
            match ctx.resolver.resolve(Trigger::Incoming, &entry.event, &decoded) {
                Decision::RetryWithMergedData(event) => {
                    return self.keep_local(local, event, &decoded).await;
                }
                Decision::DiscardLocal | Decision::ApplyRemote => {
                    tracing::info!(record = %target, mutation = %entry.event.id, "Pending local mutation discarded for remote change");
                    changes = ctx.outbox.with(|outbox| outbox.cancel(&target));
                }
            }
        }

        let discarded = !changes.is_empty();
        let record = remote_view(local, decoded);
        let batch = WriteBatch::new().save(record.clone()).outbox(&changes);
        ctx.commit(batch, changes).await?;

        ctx.publish(DataStoreEvent::Mutation {
            event: remote_event(&record, kind),
            origin: Origin::Remote,
        });
        if discarded {
            ctx.publish_outbox_status();
        }

        Ok(match kind {
            MutationKind::Create => Applied::Created,
            MutationKind::Update => Applied::Updated,
            MutationKind::Delete => Applied::Deleted,
        })
    }

    /// Replace the queued mutation with the resolver's rebased one and show
    /// its data locally.
    async fn keep_local(
        &self,
        local: Option<Record>,
        event: MutationEvent,
        remote: &Record,
    ) -> Result<Applied> {
        let ctx = &self.ctx;
        let target = event.record_ref();

        let mut changes = ctx.outbox.with(|outbox| outbox.cancel(&target));
        match ctx.outbox.enqueue(event.clone(), now_millis()) {
            Ok((_, enqueued)) => changes.extend(enqueued),
            Err(e) => {
                ctx.outbox.rollback(changes);
                return Err(e.into());
            }
        }

        let mut record = local.unwrap_or_else(|| remote.clone());
        record.sync.version = record.sync.version.max(remote.sync.version);
        record.sync.pending = true;
        if let (false, Some(fields)) = (record.sync.deleted, &event.fields) {
            record.fields = fields.clone();
        }

        let batch = WriteBatch::new().save(record).outbox(&changes);
        ctx.commit(batch, changes).await?;
        ctx.outbox.wake();

        tracing::debug!(record = %target, base = ?event.version, "Local mutation kept over remote change");
        Ok(Applied::KeptLocal)
    }
}

/// The local record after accepting the remote's copy. Remote tombstones
/// keep the last known local fields.
pub(crate) fn remote_view(local: Option<Record>, remote: Record) -> Record {
    match local {
        Some(mut local) if remote.sync.deleted => {
            local.sync = remote.sync;
            local
        }
        _ => remote,
    }
}

/// Event describing a remote change to `record`.
pub(crate) fn remote_event(record: &Record, kind: MutationKind) -> MutationEvent {
    MutationEvent {
        id: uuid::Uuid::new_v4().to_string(),
        model: record.model.clone(),
        key: record.key.clone(),
        kind,
        version: record.sync.version,
        fields: (kind != MutationKind::Delete).then(|| record.fields.clone()),
        condition: None,
        created_at: record.sync.last_changed_at,
    }
}
