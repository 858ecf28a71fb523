//! Live subscriptions to remote changes, one per model.
//!
//! A dropped connection is reconnected with backoff. After
//! `reconnect.max_attempts` consecutive failed connects the listener gives up
//! with [`DataStoreError::SubscriptionLost`], which makes the engine restart
//! from its cursors. A remote record the local schema cannot decode stops
//! the listeners with a schema drift error.

use crate::api::{AuthProvider, ChangeStream, GraphQlApi};
use crate::context::SyncContext;
use crate::error::{ApiError, DataStoreError, ErrorClass, Result};
use crate::reconcile::RemoteApplier;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub(crate) struct Subscriptions {
    ctx: Arc<SyncContext>,
    api: Arc<dyn GraphQlApi>,
    auth: Arc<dyn AuthProvider>,
    applier: RemoteApplier,
}

impl Subscriptions {
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

    /// Open a subscription for every registered model.
    ///
    /// Streams are not polled yet; changes arriving meanwhile wait in the
    /// transport until [`Subscriptions::listen`] runs.
    pub async fn connect_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, ChangeStream)>> {
        let mut streams = Vec::new();
        for schema in self.ctx.registry.models() {
            let stream = self.connect(&schema.name, cancel).await?;
            streams.push((schema.name.clone(), stream));
        }
        tracing::info!(models = streams.len(), "Subscriptions established");
        Ok(streams)
    }

    /// Apply changes from every stream until cancelled or a listener fails.
    pub async fn listen(
        self,
        streams: Vec<(String, ChangeStream)>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let cancel = cancel.child_token();
        let mut listeners = JoinSet::new();
        for (model, stream) in streams {
            let this = self.clone();
            let cancel = cancel.clone();
            listeners.spawn(async move { this.listen_model(model, stream, cancel).await });
        }

        let mut outcome = Ok(());
        while let Some(joined) = listeners.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(DataStoreError::Task(e.to_string())));
            if let Err(e) = result {
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    async fn listen_model(
        &self,
        model: String,
        mut stream: ChangeStream,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => return Ok(()),
            };

            match next {
                Some(Ok(remote)) => {
                    tracing::debug!(record = %remote.record_ref(), version = remote.version, "Remote change received");
                    if let Err(e) = self.applier.apply(remote).await {
                        if e.is_schema_drift() {
                            tracing::error!(model = %model, error = %e, "Remote change cannot be decoded");
                        }
                        return Err(e);
                    }
                }
                Some(Err(ApiError::Transformation(reason))) => {
                    tracing::error!(model = %model, %reason, "Remote change cannot be decoded");
                    return Err(ApiError::Transformation(reason).into());
                }
                Some(Err(e)) => {
                    tracing::warn!(model = %model, error = %e, "Subscription interrupted");
                    stream = self.connect(&model, &cancel).await?;
                }
                None => {
                    tracing::warn!(model = %model, "Subscription closed by the remote");
                    stream = self.connect(&model, &cancel).await?;
                }
            }
        }
    }

    /// Connect with backoff, giving up after the configured attempts.
    async fn connect(&self, model: &str, cancel: &CancellationToken) -> Result<ChangeStream> {
        let policy = &self.ctx.config.reconnect;
        let mut failures = 0;

        loop {
            let attempt = tokio::select! {
                attempt = self.try_connect(model) => attempt,
                _ = cancel.cancelled() => return Err(DataStoreError::Cancelled),
            };

            let error = match attempt {
                Ok(stream) => {
                    tracing::debug!(model, "Subscription connected");
                    return Ok(stream);
                }
                Err(e) if e.class() == ErrorClass::Fatal => return Err(e),
                Err(e) => e,
            };

            failures += 1;
            if failures >= policy.max_attempts {
                return Err(DataStoreError::SubscriptionLost {
                    model: model.to_string(),
                    attempts: failures,
                });
            }

            let delay = policy.delay_for_attempt(failures);
            tracing::warn!(model, attempt = failures, delay_ms = delay.as_millis() as u64, %error, "Subscription connect failed");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(DataStoreError::Cancelled),
            }
        }
    }

    async fn try_connect(&self, model: &str) -> Result<ChangeStream> {
        let token = self.auth.valid_token().await?;
        let timeout = self.ctx.config.request_timeout;
        let stream = tokio::time::timeout(timeout, self.api.subscribe(&token, model))
            .await
            .unwrap_or(Err(ApiError::Timeout))?;
        Ok(stream)
    }
}
