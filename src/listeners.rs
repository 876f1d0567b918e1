//! Listener list with first/last edge hooks
//!
//! Facades use it to subscribe to a remote push stream only while at least
//! one local listener cares:
//!
//! ```text
//! register(a)    0 → 1   on_first_registered()
//! register(b)    1 → 2
//! unregister(a)  2 → 1
//! died(b)        1 → 0   on_last_unregistered()
//! ```
//!
//! Listeners are compared by identity (`Arc` pointer), not by value.
//! Hooks run while the list is locked, so edges are seen in the order they
//! happened; a hook must not call back into its own list.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type Hook = Box<dyn Fn() + Send + Sync>;

pub struct ListenerList<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
    on_first: Option<Hook>,
    on_last: Option<Hook>,
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            on_first: None,
            on_last: None,
        }
    }

    /// Called when the list goes from empty to one listener.
    pub fn on_first_registered(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_first = Some(Box::new(hook));
        self
    }

    /// Called when the list becomes empty, whatever removed the last listener.
    pub fn on_last_unregistered(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_last = Some(Box::new(hook));
        self
    }

    /// Returns false if `listener` was already registered.
    pub fn register(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.lock();
        if listeners.iter().any(|l| same(l, &listener)) {
            return false;
        }

        listeners.push(listener);
        if listeners.len() == 1 {
            debug!("First listener registered");
            if let Some(hook) = &self.on_first {
                hook();
            }
        }
        true
    }

    /// Returns false if `listener` was not registered.
    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        self.remove(listener, "unregistered")
    }

    /// Death-detection path: drop a listener whose owner went away.
    ///
    /// Same edge semantics as [`unregister`](Self::unregister); whichever of
    /// the two removes the listener first fires the hook, the other is a no-op.
    pub fn listener_died(&self, listener: &Arc<L>) -> bool {
        self.remove(listener, "died")
    }

    /// Deliver to every listener. A listener whose delivery fails is treated
    /// as dead and removed. Returns how many deliveries succeeded.
    pub fn broadcast<E>(&self, mut deliver: impl FnMut(&L) -> Result<(), E>) -> usize
    where
        E: std::fmt::Display,
    {
        let snapshot: Vec<Arc<L>> = self.lock().clone();

        let mut delivered = 0;
        for listener in &snapshot {
            match deliver(&**listener) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(error = %e, "Listener delivery failed, dropping listener");
                    self.listener_died(listener);
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, listener: &Arc<L>, reason: &'static str) -> bool {
        let mut listeners = self.lock();
        let Some(index) = listeners.iter().position(|l| same(l, listener)) else {
            return false;
        };

        listeners.remove(index);
        if listeners.is_empty() {
            debug!(reason, "Last listener removed");
            if let Some(hook) = &self.on_last {
                hook();
            }
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<L>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self::new()
    }
}

fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
