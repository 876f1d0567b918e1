//! Connection State Machine
//!
//! Single responsibility: own the bind lifecycle and hand out live channels.
//!
//! ```text
//!            get_channel()              connected()
//!  Unbound ───────────────► Binding ─────────────────► Bound
//!     ▲                      │  ▲                        │
//!     │ failed() / timeout   │  │ disconnected()         │
//!     ├──────────────────────┘  └────────────────────────┤
//!     │                 unbind() / call failure          │
//!     └──────────────────────────────────────────────────┘
//!
//!                 died() from any live state ──► Dead
//! ```
//!
//! # Locking
//!
//! The state lives in a `watch` channel. Every transition goes through the
//! sender and holds its lock only for the transition itself; waiters park on
//! a receiver and hold nothing. Provider callbacks therefore never contend
//! with a caller that is waiting for them, and the provider is always called
//! outside the lock.
//!
//! Each `start_bind` gets a fresh attempt number. Events carry the attempt
//! they belong to, so a late event from an abandoned attempt cannot revive it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::replay::ReplayRegistry;
use crate::descriptor::{ConnectionDescriptor, InstanceId};
use crate::error::{LinkError, Result};
use crate::provider::{BindEvents, BindProvider};

pub(crate) enum LinkState<C> {
    Unbound,
    Binding {
        attempt: u64,
    },
    Bound {
        attempt: u64,
        channel: C,
        instance: InstanceId,
    },
    Dead,
}

impl<C> LinkState<C> {
    fn attempt(&self) -> Option<u64> {
        match self {
            LinkState::Binding { attempt } | LinkState::Bound { attempt, .. } => Some(*attempt),
            LinkState::Unbound | LinkState::Dead => None,
        }
    }

    fn is_binding(&self, attempt: u64) -> bool {
        matches!(self, LinkState::Binding { attempt: current } if *current == attempt)
    }

    fn phase(&self) -> LinkPhase {
        match self {
            LinkState::Unbound => LinkPhase::Unbound,
            LinkState::Binding { .. } => LinkPhase::Binding,
            LinkState::Bound { instance, .. } => LinkPhase::Bound(*instance),
            LinkState::Dead => LinkPhase::Dead,
        }
    }
}

/// Observable summary of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Unbound,
    Binding,
    Bound(InstanceId),
    Dead,
}

/// A channel handed out for the duration of a single call.
#[derive(Debug, Clone)]
pub struct Lease<C> {
    channel: C,
    instance: InstanceId,
    attempt: u64,
}

impl<C> Lease<C> {
    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }
}

/// State shared with the provider's event sinks.
pub(crate) struct LinkCore<C> {
    descriptor: ConnectionDescriptor,
    state: watch::Sender<LinkState<C>>,
}

impl<C> LinkCore<C> {
    fn new(descriptor: ConnectionDescriptor) -> Self {
        let (state, _) = watch::channel(LinkState::Unbound);
        Self { descriptor, state }
    }

    pub(crate) fn on_connected(&self, attempt: u64, channel: C, instance: InstanceId) {
        let applied = self.state.send_if_modified(|state| match state {
            LinkState::Binding { attempt: current } | LinkState::Bound { attempt: current, .. }
                if *current == attempt =>
            {
                *state = LinkState::Bound {
                    attempt,
                    channel,
                    instance,
                };
                true
            }
            _ => false,
        });

        if applied {
            info!(descriptor = %self.descriptor, attempt, %instance, "Channel bound");
        } else {
            debug!(descriptor = %self.descriptor, attempt, "Ignoring connect from stale bind attempt");
        }
    }

    pub(crate) fn on_failed(&self, attempt: u64) {
        let applied = self.state.send_if_modified(|state| {
            if state.is_binding(attempt) {
                *state = LinkState::Unbound;
                true
            } else {
                false
            }
        });

        if applied {
            warn!(descriptor = %self.descriptor, attempt, "Bind attempt failed");
        }
    }

    pub(crate) fn on_disconnected(&self, attempt: u64) {
        let applied = self.state.send_if_modified(|state| match state {
            LinkState::Bound { attempt: current, .. } if *current == attempt => {
                *state = LinkState::Binding { attempt };
                true
            }
            _ => false,
        });

        if applied {
            warn!(descriptor = %self.descriptor, attempt, "Remote disconnected, waiting for it to come back");
        }
    }

    pub(crate) fn on_died(&self, attempt: u64) {
        let applied = self.state.send_if_modified(|state| {
            if state.attempt() == Some(attempt) {
                *state = LinkState::Dead;
                true
            } else {
                false
            }
        });

        if applied {
            error!(descriptor = %self.descriptor, attempt, "Remote endpoint died permanently");
        }
    }
}

enum Step<C> {
    Ready(Lease<C>),
    Start(u64),
    Wait(u64),
    Dead,
}

/// Owns the bind lifecycle of one connection.
///
/// # Guarantees
///
/// - At most one bind attempt is outstanding; concurrent requesters share it.
/// - A channel is never handed out after its disconnect has been observed.
/// - Replay callbacks have run for a channel's instance before the channel is
///   handed out.
/// - No wait outlives its timeout. A replay that is still running at the
///   deadline keeps going on its own task while the caller gets `None`.
pub struct ConnectionStateMachine<P: BindProvider> {
    core: Arc<LinkCore<P::Channel>>,
    provider: Arc<P>,
    replay: Arc<ReplayRegistry<P::Channel>>,
    next_attempt: AtomicU64,
}

impl<P: BindProvider> ConnectionStateMachine<P> {
    pub fn new(descriptor: ConnectionDescriptor, provider: P) -> Self {
        Self {
            core: Arc::new(LinkCore::new(descriptor)),
            provider: Arc::new(provider),
            replay: Arc::new(ReplayRegistry::new()),
            next_attempt: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.core.descriptor
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn replay(&self) -> &ReplayRegistry<P::Channel> {
        &self.replay
    }

    pub fn phase(&self) -> LinkPhase {
        self.core.state.borrow().phase()
    }

    /// Get a live channel, binding if needed.
    ///
    /// Returns `Ok(None)` when no channel showed up within `timeout`, when the
    /// bind attempt failed, or when the connection was unbound meanwhile.
    ///
    /// # Errors
    /// - [`LinkError::CalledFromEventContext`] when called on the thread the
    ///   provider delivers its events on
    /// - [`LinkError::Dead`] once the provider reported permanent death
    pub async fn get_channel(&self, timeout: Duration) -> Result<Option<Lease<P::Channel>>> {
        if let Some(context) = self.provider.event_context() {
            if context.is_current() {
                error!(
                    descriptor = %self.core.descriptor,
                    "Channel requested from the event-delivery context, refusing to block it"
                );
                return Err(LinkError::CalledFromEventContext);
            }
        }

        let deadline = deadline_after(timeout);
        let mut rx = self.core.state.subscribe();

        loop {
            let attempt = match self.step() {
                Step::Dead => return Err(LinkError::Dead),
                Step::Ready(lease) => {
                    let replay = self
                        .replay
                        .replay_if_new(lease.channel.clone(), lease.instance);
                    if timeout_at(deadline, replay).await.is_err() {
                        // The replay carries on without us
                        warn!(
                            descriptor = %self.core.descriptor,
                            instance = %lease.instance,
                            timeout_ms = millis(timeout),
                            "Replay still running at deadline"
                        );
                        return Ok(None);
                    }
                    if self.is_current(&lease) {
                        return Ok(Some(lease));
                    }
                    debug!(
                        descriptor = %self.core.descriptor,
                        instance = %lease.instance,
                        "Channel lost during replay"
                    );
                    continue;
                }
                Step::Wait(attempt) => attempt,
                Step::Start(attempt) => {
                    debug!(descriptor = %self.core.descriptor, attempt, "Starting bind");
                    self.provider.start_bind(
                        &self.core.descriptor,
                        BindEvents::new(Arc::downgrade(&self.core), attempt),
                    );
                    attempt
                }
            };

            let settled = timeout_at(deadline, async {
                rx.wait_for(|state| !state.is_binding(attempt))
                    .await
                    .map(|_| ())
            })
            .await;

            match settled {
                Err(_) => {
                    self.abandon(attempt, timeout);
                    return Ok(None);
                }
                // The sender lives as long as `self`
                Ok(Err(_)) => return Ok(None),
                Ok(Ok(())) => {
                    if matches!(*self.core.state.borrow(), LinkState::Unbound) {
                        debug!(
                            descriptor = %self.core.descriptor,
                            attempt,
                            "Bind attempt ended without a channel"
                        );
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Drop the channel a failed call ran against.
    ///
    /// No-op when the connection already moved past that channel.
    pub fn invalidate(&self, lease: &Lease<P::Channel>) {
        let dropped = self.core.state.send_if_modified(|state| match state {
            LinkState::Bound {
                attempt, instance, ..
            } if *attempt == lease.attempt && *instance == lease.instance => {
                *state = LinkState::Unbound;
                true
            }
            _ => false,
        });

        if dropped {
            debug!(
                descriptor = %self.core.descriptor,
                attempt = lease.attempt,
                instance = %lease.instance,
                "Channel invalidated"
            );
            self.provider.stop_bind();
        }
    }

    /// Release the current bind. The next request binds again; replay
    /// registrations are kept.
    pub fn unbind(&self) {
        let released = self.core.state.send_if_modified(|state| match state {
            LinkState::Binding { .. } | LinkState::Bound { .. } => {
                *state = LinkState::Unbound;
                true
            }
            LinkState::Unbound | LinkState::Dead => false,
        });

        if released {
            info!(descriptor = %self.core.descriptor, "Unbound");
            self.provider.stop_bind();
        }
    }

    fn step(&self) -> Step<P::Channel> {
        let mut step = Step::Dead;
        self.core.state.send_if_modified(|state| match state {
            LinkState::Dead => false,
            LinkState::Bound {
                attempt,
                channel,
                instance,
            } => {
                step = Step::Ready(Lease {
                    channel: channel.clone(),
                    instance: *instance,
                    attempt: *attempt,
                });
                false
            }
            LinkState::Binding { attempt } => {
                step = Step::Wait(*attempt);
                false
            }
            LinkState::Unbound => {
                let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
                *state = LinkState::Binding { attempt };
                step = Step::Start(attempt);
                true
            }
        });
        step
    }

    fn is_current(&self, lease: &Lease<P::Channel>) -> bool {
        matches!(
            *self.core.state.borrow(),
            LinkState::Bound { attempt, instance, .. }
                if attempt == lease.attempt && instance == lease.instance
        )
    }

    fn abandon(&self, attempt: u64, timeout: Duration) {
        let abandoned = self.core.state.send_if_modified(|state| {
            if state.is_binding(attempt) {
                *state = LinkState::Unbound;
                true
            } else {
                false
            }
        });

        if abandoned {
            warn!(
                descriptor = %self.core.descriptor,
                attempt,
                timeout_ms = millis(timeout),
                "No channel within timeout, abandoning bind attempt"
            );
            self.provider.stop_bind();
        }
    }
}

/// Saturates at roughly thirty years, like tokio's own far-future instant.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<P: BindProvider> Drop for ConnectionStateMachine<P> {
    fn drop(&mut self) {
        if self.core.state.borrow().attempt().is_some() {
            self.provider.stop_bind();
            debug!(descriptor = %self.core.descriptor, "State machine dropped, bind released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EventContext;
    use std::sync::Mutex;

    /// Provider that parks every sink so the test drives events by hand.
    #[derive(Default)]
    struct ManualProvider {
        sinks: Mutex<Vec<BindEvents<u32>>>,
        stops: AtomicU64,
        context: Option<EventContext>,
    }

    impl ManualProvider {
        fn last_sink(&self) -> BindEvents<u32> {
            self.sinks.lock().unwrap().last().cloned().unwrap()
        }

        fn starts(&self) -> usize {
            self.sinks.lock().unwrap().len()
        }
    }

    impl BindProvider for ManualProvider {
        type Channel = u32;

        fn start_bind(&self, _descriptor: &ConnectionDescriptor, events: BindEvents<u32>) {
            self.sinks.lock().unwrap().push(events);
        }

        fn stop_bind(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn event_context(&self) -> Option<EventContext> {
            self.context
        }
    }

    fn machine(provider: ManualProvider) -> Arc<ConnectionStateMachine<ManualProvider>> {
        Arc::new(ConnectionStateMachine::new(
            ConnectionDescriptor::new("test", "Manual"),
            provider,
        ))
    }

    #[tokio::test]
    async fn test_starts_unbound_and_binds_lazily() {
        let machine = machine(ManualProvider::default());
        assert_eq!(machine.phase(), LinkPhase::Unbound);
        assert_eq!(machine.provider().starts(), 0);

        let waiter = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.get_channel(Duration::from_secs(5)).await })
        };
        while machine.provider().starts() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(machine.phase(), LinkPhase::Binding);

        machine.provider().last_sink().connected(11, InstanceId::new(1));
        let lease = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(*lease.channel(), 11);
        assert_eq!(lease.instance(), InstanceId::new(1));
        assert_eq!(machine.phase(), LinkPhase::Bound(InstanceId::new(1)));
    }

    #[tokio::test]
    async fn test_synchronous_connect_inside_start_bind() {
        struct Immediate;
        impl BindProvider for Immediate {
            type Channel = &'static str;
            fn start_bind(&self, _: &ConnectionDescriptor, events: BindEvents<&'static str>) {
                events.connected("ready", InstanceId::new(3));
            }
            fn stop_bind(&self) {}
        }

        let machine = ConnectionStateMachine::new(ConnectionDescriptor::new("a", "b"), Immediate);
        let lease = machine
            .get_channel(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*lease.channel(), "ready");
    }

    #[tokio::test]
    async fn test_stale_attempt_events_are_ignored() {
        let machine = machine(ManualProvider::default());

        // First attempt times out and is abandoned
        let lease = machine.get_channel(Duration::from_millis(10)).await.unwrap();
        assert!(lease.is_none());
        assert_eq!(machine.phase(), LinkPhase::Unbound);
        assert_eq!(machine.provider().stops.load(Ordering::SeqCst), 1);
        let stale = machine.provider().last_sink();

        // A late connect from the abandoned attempt must not bind
        stale.connected(1, InstanceId::new(1));
        assert_eq!(machine.phase(), LinkPhase::Unbound);
    }

    #[tokio::test]
    async fn test_failed_bind_releases_waiters() {
        let machine = machine(ManualProvider::default());
        let waiter = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.get_channel(Duration::from_secs(30)).await })
        };
        while machine.provider().starts() == 0 {
            tokio::task::yield_now().await;
        }

        machine.provider().last_sink().failed();
        assert!(waiter.await.unwrap().unwrap().is_none());
        assert_eq!(machine.phase(), LinkPhase::Unbound);
    }

    #[tokio::test]
    async fn test_disconnect_moves_back_to_binding() {
        let machine = machine(ManualProvider::default());
        let waiter = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.get_channel(Duration::from_secs(5)).await })
        };
        while machine.provider().starts() == 0 {
            tokio::task::yield_now().await;
        }
        let sink = machine.provider().last_sink();
        sink.connected(1, InstanceId::new(1));
        waiter.await.unwrap().unwrap().unwrap();

        sink.disconnected();
        assert_eq!(machine.phase(), LinkPhase::Binding);

        // Same subscription reconnects to a respawned process
        sink.connected(2, InstanceId::new(2));
        let lease = machine
            .get_channel(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*lease.channel(), 2);
        assert_eq!(machine.provider().starts(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_outdated_lease() {
        let machine = machine(ManualProvider::default());
        let waiter = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.get_channel(Duration::from_secs(5)).await })
        };
        while machine.provider().starts() == 0 {
            tokio::task::yield_now().await;
        }
        let sink = machine.provider().last_sink();
        sink.connected(1, InstanceId::new(1));
        let old = waiter.await.unwrap().unwrap().unwrap();

        sink.disconnected();
        sink.connected(2, InstanceId::new(2));

        machine.invalidate(&old);
        assert_eq!(machine.phase(), LinkPhase::Bound(InstanceId::new(2)));
        assert_eq!(machine.provider().stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_death_is_terminal() {
        let machine = machine(ManualProvider::default());
        let waiter = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.get_channel(Duration::from_secs(30)).await })
        };
        while machine.provider().starts() == 0 {
            tokio::task::yield_now().await;
        }

        machine.provider().last_sink().died();
        assert!(matches!(waiter.await.unwrap(), Err(LinkError::Dead)));
        assert!(matches!(
            machine.get_channel(Duration::from_secs(1)).await,
            Err(LinkError::Dead)
        ));

        machine.unbind();
        assert_eq!(machine.phase(), LinkPhase::Dead);
    }

    #[tokio::test]
    async fn test_refuses_event_context() {
        let machine = machine(ManualProvider {
            context: Some(EventContext::current()),
            ..Default::default()
        });

        let result = machine.get_channel(Duration::from_secs(30)).await;
        assert!(matches!(result, Err(LinkError::CalledFromEventContext)));
        assert_eq!(machine.provider().starts(), 0);
    }
}
