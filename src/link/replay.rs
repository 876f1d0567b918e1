//! Replay of instance-scoped setup after the remote restarts.
//!
//! Subscriptions registered on a remote process die with it. Callbacks kept
//! here run against the first channel of every new instance so facades can
//! put the fresh process back into the state they expect.
//!
//! A replay runs on its own task. The caller that triggered it only awaits
//! the result, so dropping that caller never leaves an instance half
//! replayed.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::descriptor::InstanceId;
use crate::error::CallFailure;

type ReplayFn<C> = Arc<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;

/// Ordered set of callbacks fired once per new [`InstanceId`].
pub struct ReplayRegistry<C> {
    callbacks: RwLock<Vec<ReplayFn<C>>>,
    /// Last instance the callbacks completed for.
    replayed: RwLock<Option<InstanceId>>,
    /// Held for a whole replay so two replays never interleave.
    gate: Mutex<()>,
}

impl<C: Clone + Send + 'static> ReplayRegistry<C> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            replayed: RwLock::new(None),
            gate: Mutex::new(()),
        }
    }

    pub fn register<F, Fut>(&self, callback: F)
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: ReplayFn<C> =
            Arc::new(move |channel: C| -> BoxFuture<'static, ()> { Box::pin(callback(channel)) });
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_replayed(&self) -> Option<InstanceId> {
        *self.replayed.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Run every callback against `channel` unless `instance` was already
    /// replayed. Returns whether this call ran the callbacks.
    ///
    /// Cancel-safe: the replay keeps going if the returned future is dropped,
    /// and the instance is recorded once it finishes. A callback that panics
    /// is logged and does not stop the ones after it.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn replay_if_new(self: &Arc<Self>, channel: C, instance: InstanceId) -> bool {
        if self.last_replayed() == Some(instance) {
            return false;
        }

        let registry = Arc::clone(self);
        match tokio::spawn(async move { registry.run(channel, instance).await }).await {
            Ok(ran) => ran,
            Err(e) => {
                warn!(%instance, error = %e, "Replay task failed");
                false
            }
        }
    }

    async fn run(&self, channel: C, instance: InstanceId) -> bool {
        let _gate = self.gate.lock().await;
        let previous = self.last_replayed();
        if previous == Some(instance) {
            return false;
        }

        let callbacks: Vec<ReplayFn<C>> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        info!(
            %instance,
            previous = ?previous,
            callbacks = callbacks.len(),
            "New remote instance, replaying subscriptions"
        );

        for (index, callback) in callbacks.into_iter().enumerate() {
            debug!(%instance, index, "Running replay callback");
            let channel = channel.clone();
            if let Err(e) = tokio::spawn(async move { callback(channel).await }).await {
                warn!(
                    %instance,
                    index,
                    error = %CallFailure::from_join(e),
                    "Replay callback failed"
                );
            }
        }

        *self.replayed.write().unwrap_or_else(|e| e.into_inner()) = Some(instance);
        true
    }
}

impl<C: Clone + Send + 'static> Default for ReplayRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
