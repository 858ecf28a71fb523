//! Conflict resolution between pending local mutations and remote state.
//!
//! A conflict arises either when the remote rejects a mutation because its
//! base version is stale, or when a remote change arrives for a record that
//! still has a queued local mutation. Resolution is pure: the caller applies
//! the decision to the outbox and the local store.
//!
//! # Rules
//!
//! 1. A remote delete always wins. The local mutation is discarded.
//! 2. A local delete against a live remote record wins only when it was made
//!    strictly after the remote's last change.
//! 3. A local create or update is settled by the configured
//!    [`ConflictHandler`] (rejections only) or by the [`MergeStrategy`].

use crate::{FieldValue, MutationEvent, MutationKind, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// What brought the local mutation and the remote state together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    /// The remote refused the mutation because its base version is stale
    Rejected,
    /// A remote change arrived while the mutation was queued
    Incoming,
}

/// Outcome of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Resend this mutation, based on the remote version
    RetryWithMergedData(MutationEvent),
    /// Drop the local mutation and apply the remote state (a delete)
    DiscardLocal,
    /// Drop the local mutation and write the remote state locally
    ApplyRemote,
}

/// Default policy for create/update conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    /// The later change wins; ties go to the remote (default)
    #[default]
    LastWriterWins,
    RemoteWins,
    LocalWins,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::LastWriterWins => write!(f, "lastWriterWins"),
            MergeStrategy::RemoteWins => write!(f, "remoteWins"),
            MergeStrategy::LocalWins => write!(f, "localWins"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lastwriterwins" | "lww" => Ok(MergeStrategy::LastWriterWins),
            "remotewins" | "remote" => Ok(MergeStrategy::RemoteWins),
            "localwins" | "local" => Ok(MergeStrategy::LocalWins),
            other => Err(format!("unknown merge strategy: {other}")),
        }
    }
}

/// Answer of a user supplied conflict handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the remote state
    ApplyRemote,
    /// Resend the local fields on top of the remote version
    RetryLocal,
    /// Resend these fields on top of the remote version
    Retry(BTreeMap<String, FieldValue>),
}

/// Application hook for rejected creates and updates.
pub trait ConflictHandler: Send + Sync {
    fn resolve(&self, local: &MutationEvent, remote: &Record) -> Resolution;
}

impl<F> ConflictHandler for F
where
    F: Fn(&MutationEvent, &Record) -> Resolution + Send + Sync,
{
    fn resolve(&self, local: &MutationEvent, remote: &Record) -> Resolution {
        self(local, remote)
    }
}

/// Decides conflicts according to the rules above.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    strategy: MergeStrategy,
    handler: Option<Arc<dyn ConflictHandler>>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("strategy", &self.strategy)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Decide what happens to `local` given the remote's current `remote`
    /// record.
    pub fn resolve(&self, trigger: Trigger, local: &MutationEvent, remote: &Record) -> Decision {
        if remote.sync.deleted {
            return Decision::DiscardLocal;
        }

        if local.kind == MutationKind::Delete {
            return if local.created_at > remote.sync.last_changed_at {
                Decision::RetryWithMergedData(rebase(local.clone(), remote))
            } else {
                Decision::ApplyRemote
            };
        }

        if let (Trigger::Rejected, Some(handler)) = (trigger, &self.handler) {
            return match handler.resolve(local, remote) {
                Resolution::ApplyRemote => Decision::ApplyRemote,
                Resolution::RetryLocal => Decision::RetryWithMergedData(merge(local, remote)),
                Resolution::Retry(fields) => {
                    let mut event = rebase(local.clone(), remote);
                    event.kind = MutationKind::Update;
                    event.fields = Some(fields);
                    Decision::RetryWithMergedData(event)
                }
            };
        }

        let local_wins = match self.strategy {
            MergeStrategy::LastWriterWins => local.created_at > remote.sync.last_changed_at,
            MergeStrategy::RemoteWins => false,
            MergeStrategy::LocalWins => true,
        };

        if local_wins {
            Decision::RetryWithMergedData(merge(local, remote))
        } else {
            Decision::ApplyRemote
        }
    }
}

fn rebase(mut event: MutationEvent, remote: &Record) -> MutationEvent {
    event.version = remote.sync.version;
    event
}

/// Remote fields overlaid with the local ones, sent as an update.
fn merge(local: &MutationEvent, remote: &Record) -> MutationEvent {
    let mut fields = remote.fields.clone();
    if let Some(local_fields) = &local.fields {
        fields.extend(local_fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let mut event = rebase(local.clone(), remote);
    event.kind = MutationKind::Update;
    event.fields = Some(fields);
    event
}
