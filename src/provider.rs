//! Bind provider boundary
//!
//! Single responsibility: describe what the connection needs from whatever
//! actually reaches the remote process. No knowledge of retries, identity
//! bookkeeping, or subscriptions.
//!
//! A provider is asked to [`start_bind`](BindProvider::start_bind) at most once
//! per attempt and reports the outcome through the [`BindEvents`] it was
//! handed. Events may be delivered from any thread, synchronously from inside
//! `start_bind` or later.

use std::sync::Weak;

use crate::descriptor::{ConnectionDescriptor, EventContext, InstanceId};
use crate::link::state::LinkCore;

/// Establishes channels to the process hosting a capability.
pub trait BindProvider: Send + Sync + 'static {
    /// Live handle used to invoke the remote capability.
    type Channel: Clone + Send + Sync + 'static;

    /// Begin binding to `descriptor`.
    ///
    /// Must eventually report exactly one of [`BindEvents::connected`] or
    /// [`BindEvents::failed`], unless [`stop_bind`](Self::stop_bind) is called
    /// first. After a connect the provider keeps the subscription alive and
    /// reports [`BindEvents::disconnected`] / [`BindEvents::connected`] as the
    /// remote process goes away and comes back.
    fn start_bind(&self, descriptor: &ConnectionDescriptor, events: BindEvents<Self::Channel>);

    /// Tear down the current bind. Idempotent.
    fn stop_bind(&self);

    /// The context lifecycle events are delivered on, if it is a fixed thread.
    fn event_context(&self) -> Option<EventContext> {
        None
    }
}

/// Event sink for one bind attempt.
///
/// Events reported through a sink whose attempt was abandoned (timed out,
/// unbound, invalidated) are ignored. Dropping the connection turns every
/// sink into a no-op.
pub struct BindEvents<C> {
    core: Weak<LinkCore<C>>,
    attempt: u64,
}

impl<C> Clone for BindEvents<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            attempt: self.attempt,
        }
    }
}

impl<C> std::fmt::Debug for BindEvents<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindEvents")
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl<C> BindEvents<C> {
    pub(crate) fn new(core: Weak<LinkCore<C>>, attempt: u64) -> Self {
        Self { core, attempt }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The remote process is reachable through `channel`.
    pub fn connected(&self, channel: C, instance: InstanceId) {
        if let Some(core) = self.core.upgrade() {
            core.on_connected(self.attempt, channel, instance);
        }
    }

    /// The bind attempt could not complete.
    pub fn failed(&self) {
        if let Some(core) = self.core.upgrade() {
            core.on_failed(self.attempt);
        }
    }

    /// The remote process went away; the provider keeps trying to reconnect.
    pub fn disconnected(&self) {
        if let Some(core) = self.core.upgrade() {
            core.on_disconnected(self.attempt);
        }
    }

    /// The endpoint will never come back.
    pub fn died(&self) {
        if let Some(core) = self.core.upgrade() {
            core.on_died(self.attempt);
        }
    }
}
