//! Persistent Connection
//!
//! The facade-facing handle: `execute`, `unbind`, `on_new_instance`.
//! Everything else (binding, timeouts, retry, replay) happens behind it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::executor::{CallExecutor, FailureObserver};
use super::state::{ConnectionStateMachine, LinkPhase};
use crate::config::LinkConfig;
use crate::descriptor::{ConnectionDescriptor, InstanceId};
use crate::error::{LinkError, Result};
use crate::provider::BindProvider;

/// A connection that binds lazily and heals itself.
///
/// # Guarantees
///
/// - Nothing is bound until the first call
/// - A failed call is retried once against a fresh channel
/// - Replay callbacks run once per new remote instance, before the call that
///   discovered it
///
/// # Non-Guarantees
///
/// - A call may run twice on the remote side if the first trial failed after
///   the remote already acted on it
/// - An empty result says nothing about which trial failed or why; install a
///   [`FailureObserver`] for that
pub struct PersistentConnection<P: BindProvider> {
    machine: Arc<ConnectionStateMachine<P>>,
    executor: CallExecutor<P>,
}

impl<P: BindProvider> PersistentConnection<P> {
    pub fn new(descriptor: ConnectionDescriptor, provider: P, config: &LinkConfig) -> Self {
        info!(
            descriptor = %descriptor,
            bind_timeout_ms = config.bind_timeout_ms,
            "Creating persistent connection"
        );

        let machine = Arc::new(ConnectionStateMachine::new(descriptor, provider));
        let executor = CallExecutor::new(Arc::clone(&machine), config.bind_timeout());
        Self { machine, executor }
    }

    /// Build from a config that names its target.
    ///
    /// # Errors
    /// - Config has no descriptor
    /// - Config fails validation
    pub fn from_config(provider: P, config: &LinkConfig) -> Result<Self> {
        config.validate()?;
        let descriptor = config
            .descriptor
            .clone()
            .ok_or_else(|| LinkError::Config("no descriptor configured".into()))?;
        Ok(Self::new(descriptor, provider, config))
    }

    /// Report swallowed call failures to `observer`.
    pub fn with_failure_observer(mut self, observer: impl FailureObserver + 'static) -> Self {
        self.executor.set_observer(Arc::new(observer));
        self
    }

    /// Run a blocking call against the remote, retrying once on failure.
    ///
    /// The closure runs on the blocking pool. Errors and panics it raises are
    /// swallowed; `Ok(None)` means both trials failed.
    ///
    /// # Errors
    /// - [`LinkError::CalledFromEventContext`] on the provider's event thread
    /// - [`LinkError::Dead`] once the remote died permanently
    pub async fn execute<T, E, F>(&self, call: F) -> Result<Option<T>>
    where
        F: Fn(&P::Channel) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.executor.execute(call).await
    }

    /// Async variant of [`execute`](Self::execute); each trial runs on its
    /// own task.
    pub async fn execute_async<T, E, F, Fut>(&self, call: F) -> Result<Option<T>>
    where
        F: Fn(P::Channel) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.executor.execute_async(call).await
    }

    /// Release the bind. The next call binds again.
    pub fn unbind(&self) {
        self.machine.unbind();
    }

    /// Run `callback` against the first channel of every new remote instance.
    ///
    /// Fires on the first bind and after each crash/restart, never when
    /// rebinding to an instance that stayed up. Callbacks run in
    /// registration order, one at a time, before the triggering call
    /// proceeds. They receive the channel directly and must not call back
    /// into this connection.
    ///
    /// A replay that outlasts the bind timeout finishes in the background and
    /// the trial that triggered it gets no channel. Panics are logged.
    pub fn on_new_instance<F, Fut>(&self, callback: F)
    where
        F: Fn(P::Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.machine.replay().register(callback);
    }

    /// Get a raw channel, binding if needed.
    ///
    /// Prefer [`execute`](Self::execute): a channel kept past one call may
    /// already point at a dead instance.
    pub async fn channel(&self, timeout: Duration) -> Result<Option<P::Channel>> {
        Ok(self
            .machine
            .get_channel(timeout)
            .await?
            .map(|lease| lease.into_channel()))
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        self.machine.descriptor()
    }

    pub fn provider(&self) -> &P {
        self.machine.provider()
    }

    pub fn phase(&self) -> LinkPhase {
        self.machine.phase()
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.phase(), LinkPhase::Bound(_))
    }

    pub fn current_instance(&self) -> Option<InstanceId> {
        match self.phase() {
            LinkPhase::Bound(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn bind_timeout(&self) -> Duration {
        self.executor.bind_timeout()
    }
}
