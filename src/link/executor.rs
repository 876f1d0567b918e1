//! Call Executor
//!
//! Single responsibility: run one call against the current channel with the
//! two-trial policy.
//!
//! # Retry Policy
//!
//! 1. Get a channel (bounded by the bind timeout). No channel uses up the trial.
//! 2. Run the call away from the provider's event context.
//! 3. On failure, invalidate the channel, tell the observer, swallow the error.
//! 4. Stop at the first success, give up after the second trial.
//!
//! A single crash is invisible to the caller: trial one hits the dying
//! instance, trial two the respawned one. A remote that keeps crashing costs
//! the caller exactly one extra attempt and an empty result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, warn};

use super::state::ConnectionStateMachine;
use crate::error::{CallFailure, Result};
use crate::provider::BindProvider;

/// Number of trials per call. Not configurable.
pub const CALL_TRIALS: u32 = 2;

/// Receives the failures the executor swallows.
pub trait FailureObserver: Send + Sync {
    fn on_call_failure(&self, failure: &CallFailure);
}

impl<F> FailureObserver for F
where
    F: Fn(&CallFailure) + Send + Sync,
{
    fn on_call_failure(&self, failure: &CallFailure) {
        self(failure)
    }
}

pub struct CallExecutor<P: BindProvider> {
    machine: Arc<ConnectionStateMachine<P>>,
    bind_timeout: Duration,
    observer: Option<Arc<dyn FailureObserver>>,
}

impl<P: BindProvider> CallExecutor<P> {
    pub fn new(machine: Arc<ConnectionStateMachine<P>>, bind_timeout: Duration) -> Self {
        Self {
            machine,
            bind_timeout,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn FailureObserver>) {
        self.observer = Some(observer);
    }

    pub fn bind_timeout(&self) -> Duration {
        self.bind_timeout
    }

    /// Run a blocking call on the blocking pool.
    ///
    /// Returns `Ok(None)` when both trials failed.
    pub async fn execute<T, E, F>(&self, call: F) -> Result<Option<T>>
    where
        F: Fn(&P::Channel) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let call = Arc::new(call);
        self.run_trials(move |channel| {
            let call = Arc::clone(&call);
            tokio::task::spawn_blocking(move || call(&channel).map_err(Into::<anyhow::Error>::into))
        })
        .await
    }

    /// Run an async call on its own task.
    ///
    /// Returns `Ok(None)` when both trials failed.
    pub async fn execute_async<T, E, F, Fut>(&self, call: F) -> Result<Option<T>>
    where
        F: Fn(P::Channel) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.run_trials(|channel| {
            let pending = call(channel);
            tokio::spawn(async move { pending.await.map_err(Into::<anyhow::Error>::into) })
        })
        .await
    }

    async fn run_trials<T, F, Fut>(&self, mut attempt: F) -> Result<Option<T>>
    where
        F: FnMut(P::Channel) -> Fut,
        Fut: Future<Output = std::result::Result<anyhow::Result<T>, JoinError>>,
    {
        let descriptor = self.machine.descriptor();

        for trial in 1..=CALL_TRIALS {
            let Some(lease) = self.machine.get_channel(self.bind_timeout).await? else {
                warn!(%descriptor, trial, "Connection unavailable");
                continue;
            };

            let failure = match attempt(lease.channel().clone()).await {
                Ok(Ok(value)) => {
                    debug!(%descriptor, trial, instance = %lease.instance(), "Call succeeded");
                    return Ok(Some(value));
                }
                Ok(Err(e)) => CallFailure::Remote(e),
                Err(e) => CallFailure::from_join(e),
            };

            warn!(
                %descriptor,
                trial,
                instance = %lease.instance(),
                error = %failure,
                "Remote call failed, dropping channel"
            );
            self.machine.invalidate(&lease);
            if let Some(observer) = &self.observer {
                observer.on_call_failure(&failure);
            }
        }

        debug!(%descriptor, trials = CALL_TRIALS, "Giving up, no result");
        Ok(None)
    }
}
