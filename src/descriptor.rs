//! Identity types shared by the connection and its bind provider.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

/// Identifies the remote service a connection binds to.
///
/// Immutable once handed to a connection. The `address` resolves the hosting
/// process, the `capability` names the interface it is expected to expose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    address: String,
    capability: String,
}

impl ConnectionDescriptor {
    pub fn new(address: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            capability: capability.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.capability)
    }
}

/// One running incarnation of the remote endpoint.
///
/// Two channels carrying the same `InstanceId` talk to the same process; a
/// crash and respawn yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Counter policy for providers that cannot name instances themselves.
///
/// The id is bumped on the first connect and on every connect that follows
/// a reported loss (disconnect or death). A connect with no loss in between,
/// such as an unbind/rebind against a process that stayed up, keeps the id.
#[derive(Debug)]
pub struct InstanceTracker {
    current: AtomicU64,
    lost: AtomicBool,
}

impl InstanceTracker {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            lost: AtomicBool::new(true),
        }
    }

    /// Record a successful connect and return the identity it maps to.
    pub fn on_connect(&self) -> InstanceId {
        if self.lost.swap(false, Ordering::SeqCst) {
            InstanceId(self.current.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            InstanceId(self.current.load(Ordering::SeqCst))
        }
    }

    /// Record that the remote process went away.
    pub fn on_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<InstanceId> {
        match self.current.load(Ordering::SeqCst) {
            0 => None,
            n => Some(InstanceId(n)),
        }
    }
}

impl Default for InstanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The thread a provider delivers its lifecycle events on.
///
/// Waiting for a channel on this thread would block the very event that
/// ends the wait, so the connection refuses such requests up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext(ThreadId);

impl EventContext {
    /// Capture the calling thread as the event-delivery context.
    pub fn current() -> Self {
        Self(thread::current().id())
    }

    pub fn from_thread(id: ThreadId) -> Self {
        Self(id)
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.0
    }
}
