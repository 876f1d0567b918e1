//! In-memory bind provider simulating a remote process that can crash,
//! respawn, refuse to come up, or die for good.

#![allow(dead_code)]

use service_link::{
    BindEvents, BindProvider, ConnectionDescriptor, EventContext, InstanceId, InstanceTracker,
    LinkConfig, PersistentConnection,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

pub const CONNECT_DELAY: Duration = Duration::from_millis(100);
pub const RESPAWN_DELAY: Duration = Duration::from_millis(500);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("dead object: {0} is gone")]
    DeadObject(InstanceId),

    #[error("remote rejected the call")]
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Connect after `CONNECT_DELAY`
    Connect,
    /// Never report anything
    Never,
    /// Report a failed bind right away
    Fail,
}

/// The simulated remote process.
pub struct FakeRemote {
    handle: Handle,
    mode: Mutex<BindMode>,
    tracker: InstanceTracker,
    alive: AtomicBool,
    events: Mutex<Option<BindEvents<FakeChannel>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    subscribe_calls: AtomicUsize,
    subscribed: Mutex<Option<InstanceId>>,
}

impl FakeRemote {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn subscribed(&self) -> Option<InstanceId> {
        *self.subscribed.lock().unwrap()
    }

    pub fn current_instance(&self) -> Option<InstanceId> {
        self.tracker.current()
    }

    pub fn set_mode(&self, mode: BindMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Kill the process. The live bind (if any) sees a disconnect and the
    /// process is respawned on it after `RESPAWN_DELAY`.
    pub fn crash(self: &Arc<Self>) {
        self.alive.store(false, Ordering::SeqCst);
        self.tracker.on_lost();
        *self.subscribed.lock().unwrap() = None;

        let Some(events) = self.events.lock().unwrap().clone() else {
            return;
        };
        events.disconnected();

        let remote = Arc::clone(self);
        self.handle.spawn(async move {
            tokio::time::sleep(RESPAWN_DELAY).await;
            let still_bound = remote
                .events
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|current| current.attempt() == events.attempt());
            if still_bound {
                remote.connect(&events);
            }
        });
    }

    /// Report permanent death on the live bind.
    pub fn die(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(events) = self.events.lock().unwrap().clone() {
            events.died();
        }
    }

    fn connect(self: &Arc<Self>, events: &BindEvents<FakeChannel>) {
        self.alive.store(true, Ordering::SeqCst);
        let instance = self.tracker.on_connect();
        events.connected(
            FakeChannel {
                remote: Arc::clone(self),
                instance,
            },
            instance,
        );
    }

    fn check(&self, instance: InstanceId) -> Result<(), RemoteError> {
        if self.alive.load(Ordering::SeqCst) && self.tracker.current() == Some(instance) {
            Ok(())
        } else {
            Err(RemoteError::DeadObject(instance))
        }
    }
}

/// Channel to one instance of the fake remote.
#[derive(Clone)]
pub struct FakeChannel {
    remote: Arc<FakeRemote>,
    instance: InstanceId,
}

impl FakeChannel {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn pid(&self) -> Result<u64, RemoteError> {
        self.remote.check(self.instance)?;
        Ok(self.instance.get())
    }

    pub fn is_enabled(&self) -> Result<bool, RemoteError> {
        self.remote.check(self.instance)?;
        Ok(false)
    }

    /// Crash the remote while serving this call.
    pub fn crash(&self) -> Result<u64, RemoteError> {
        self.remote.check(self.instance)?;
        self.remote.crash();
        Err(RemoteError::DeadObject(self.instance))
    }

    pub fn subscribe(&self) -> Result<(), RemoteError> {
        self.remote.check(self.instance)?;
        self.remote.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        *self.remote.subscribed.lock().unwrap() = Some(self.instance);
        Ok(())
    }

    pub fn unsubscribe(&self) -> Result<(), RemoteError> {
        self.remote.check(self.instance)?;
        *self.remote.subscribed.lock().unwrap() = None;
        Ok(())
    }
}

pub struct FakeProvider {
    remote: Arc<FakeRemote>,
    context: Option<EventContext>,
}

impl FakeProvider {
    /// Must be called from within a Tokio runtime.
    pub fn new(mode: BindMode) -> (Self, Arc<FakeRemote>) {
        let remote = Arc::new(FakeRemote {
            handle: Handle::current(),
            mode: Mutex::new(mode),
            tracker: InstanceTracker::new(),
            alive: AtomicBool::new(false),
            events: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            subscribed: Mutex::new(None),
        });
        let provider = Self {
            remote: Arc::clone(&remote),
            context: None,
        };
        (provider, remote)
    }

    pub fn delivering_on(mut self, context: EventContext) -> Self {
        self.context = Some(context);
        self
    }
}

impl BindProvider for FakeProvider {
    type Channel = FakeChannel;

    fn start_bind(&self, _descriptor: &ConnectionDescriptor, events: BindEvents<FakeChannel>) {
        self.remote.starts.fetch_add(1, Ordering::SeqCst);
        *self.remote.events.lock().unwrap() = Some(events.clone());

        let mode = *self.remote.mode.lock().unwrap();
        match mode {
            BindMode::Never => {}
            BindMode::Fail => events.failed(),
            BindMode::Connect => {
                let remote = Arc::clone(&self.remote);
                self.remote.handle.spawn(async move {
                    tokio::time::sleep(CONNECT_DELAY).await;
                    remote.connect(&events);
                });
            }
        }
    }

    fn stop_bind(&self) {
        self.remote.stops.fetch_add(1, Ordering::SeqCst);
        self.remote.events.lock().unwrap().take();
    }

    fn event_context(&self) -> Option<EventContext> {
        self.context
    }
}

pub fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::new("com.example.services", "TestService")
}

pub fn config(bind_timeout: Duration) -> LinkConfig {
    LinkConfig::default().with_bind_timeout(bind_timeout)
}

/// Connection over a fresh fake remote with a 5 s bind timeout.
pub fn connection(mode: BindMode) -> (Arc<PersistentConnection<FakeProvider>>, Arc<FakeRemote>) {
    init_tracing();
    let (provider, remote) = FakeProvider::new(mode);
    let connection = PersistentConnection::new(descriptor(), provider, &config(Duration::from_secs(5)));
    (Arc::new(connection), remote)
}

/// Count replay callbacks on `connection`.
pub fn count_new_instances(connection: &PersistentConnection<FakeProvider>) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    connection.on_new_instance(move |_channel| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {}
    });
    count
}

/// Wait (in virtual time when paused) until `condition` holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}
