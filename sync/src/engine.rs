//! Remote sync engine.
//!
//! One background task drives the state machine in [`EngineState`]: base
//! sync, then outbox draining and live subscriptions side by side until
//! something fails or the engine is stopped. Transient failures restart the
//! cycle with backoff, from the persisted cursors, up to `max_restarts`
//! times. Schema drift and unrecoverable auth failures stop it for good.

use crate::api::{AuthProvider, GraphQlApi};
use crate::base_sync::BaseSync;
use crate::context::SyncContext;
use crate::error::{DataStoreError, ErrorClass, Result};
use crate::mutation::MutationProcessor;
use crate::publisher::DataStoreEvent;
use crate::state::{EngineState, StopReason};
use crate::subscription::Subscriptions;
use std::sync::Arc;
use tether_engine::WriteBatch;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Handle to the background sync task.
pub struct RemoteSyncEngine {
    driver: Driver,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RemoteSyncEngine {
    pub(crate) fn new(
        ctx: Arc<SyncContext>,
        api: Arc<dyn GraphQlApi>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::NotStarted);
        Self {
            driver: Driver {
                ctx,
                api,
                auth,
                state: Arc::new(state),
            },
            running: Mutex::new(None),
        }
    }

    /// Start syncing. Does nothing if the engine is already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            tracing::debug!("Sync engine already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.driver.clone().run(cancel.clone()));
        *running = Some(Running { cancel, handle });
    }

    /// Stop syncing and wait for in-progress work to settle.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(error = %e, "Sync engine task failed");
        }
    }

    pub fn state(&self) -> EngineState {
        self.driver.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn watch(&self) -> watch::Receiver<EngineState> {
        self.driver.state.subscribe()
    }
}

#[derive(Clone)]
struct Driver {
    ctx: Arc<SyncContext>,
    api: Arc<dyn GraphQlApi>,
    auth: Arc<dyn AuthProvider>,
    state: Arc<watch::Sender<EngineState>>,
}

impl Driver {
    async fn run(self, cancel: CancellationToken) {
        let max_restarts = self.ctx.config.max_restarts;
        let mut restarts = 0;

        loop {
            self.transition(EngineState::PerformingBaseSync);
            let result = self.cycle(&cancel).await;

            self.transition(EngineState::CleaningUp);
            self.settle().await;

            let error = match result {
                Ok(()) => return self.transition(EngineState::Stopped(StopReason::Requested)),
                Err(_) if cancel.is_cancelled() => {
                    return self.transition(EngineState::Stopped(StopReason::Requested))
                }
                Err(e) => e,
            };

            let fatal = error.is_schema_drift()
                || matches!(error.class(), ErrorClass::Fatal | ErrorClass::Permanent);
            if fatal || restarts >= max_restarts {
                tracing::error!(error = %error, restarts, "Sync engine stopped");
                self.ctx.publish(DataStoreEvent::SyncFailed {
                    error: error.to_string(),
                    fatal: true,
                });
                return self.transition(EngineState::Stopped(StopReason::Fatal(error.to_string())));
            }

            restarts += 1;
            let delay = self.ctx.config.reconnect.delay_for_attempt(restarts);
            tracing::warn!(
                error = %error,
                restart = restarts,
                delay_ms = delay.as_millis() as u64,
                "Sync engine restarting"
            );
            self.ctx.publish(DataStoreEvent::SyncFailed {
                error: error.to_string(),
                fatal: false,
            });
            self.transition(EngineState::SchedulingRestart);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return self.transition(EngineState::Stopped(StopReason::Requested));
                }
            }
        }
    }

    /// One pass through base sync and the steady state.
    async fn cycle(&self, cancel: &CancellationToken) -> Result<()> {
        let ctx = &self.ctx;
        let subscriptions = Subscriptions::new(ctx.clone(), self.api.clone(), self.auth.clone());

        let streams = subscriptions.connect_all(cancel).await?;
        BaseSync::new(ctx.clone(), self.api.clone(), self.auth.clone())
            .run(cancel)
            .await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.transition(EngineState::SyncingMutationsAndSubscribing);
        ctx.publish(DataStoreEvent::SubscriptionsEstablished);
        ctx.publish(DataStoreEvent::NetworkStatus { active: true });
        ctx.publish(DataStoreEvent::Ready);

        let steady = cancel.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(
            MutationProcessor::new(ctx.clone(), self.api.clone(), self.auth.clone())
                .run(steady.clone()),
        );
        tasks.spawn(subscriptions.listen(streams, steady.clone()));

        // Whichever task ends first ends the other
        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            steady.cancel();
            let result = joined.unwrap_or_else(|e| Err(DataStoreError::Task(e.to_string())));
            if let (Ok(()), Err(e)) = (&outcome, result) {
                outcome = Err(e);
            }
        }

        ctx.publish(DataStoreEvent::NetworkStatus { active: false });
        outcome
    }

    /// Return mutations left in flight to the queue.
    async fn settle(&self) {
        let changes = self.ctx.outbox.release_all();
        if changes.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.store.commit(WriteBatch::new().outbox(&changes)).await {
            tracing::warn!(error = %e, "Failed to persist released outbox entries");
        }
    }

    fn transition(&self, next: EngineState) {
        let mut changed = false;
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                tracing::warn!(from = %current, to = %next, "Ignored invalid state transition");
                return false;
            }
            tracing::info!(from = %current, to = %next, "Sync engine state changed");
            *current = next.clone();
            changed = true;
            true
        });

        if changed {
            self.ctx.publish(DataStoreEvent::StateChanged(next));
        }
    }
}
