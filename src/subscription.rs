//! Remote Subscription
//!
//! Single responsibility: keep exactly one remote subscription alive while
//! local listeners exist, across remote restarts.
//!
//! # Architecture
//!
//! ```text
//! local listeners ──► ListenerList ──edges──► command queue ──► worker task
//!                                                               │
//!                                         PersistentConnection::execute
//!                                                               │
//!                         on_new_instance ──► resubscribe ◄─────┘
//! ```
//!
//! Edge hooks run under the listener lock and only enqueue a command; the
//! worker applies commands one by one, so subscribe/unsubscribe reach the
//! remote in the order the edges happened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::PersistentConnection;
use crate::listeners::ListenerList;
use crate::provider::BindProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Subscribe,
    Unsubscribe,
}

/// Bridges a local listener set to a remote push stream.
pub struct RemoteSubscription<L: ?Sized> {
    listeners: Arc<ListenerList<L>>,
    worker: JoinHandle<()>,
}

impl<L: ?Sized + Send + Sync + 'static> RemoteSubscription<L> {
    /// Wire a listener set to `connection`.
    ///
    /// `subscribe` and `unsubscribe` run against the remote channel on the
    /// blocking pool. `subscribe` also runs from a replay callback whenever
    /// the remote restarts while listeners exist.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<P, S, U, E>(
        connection: Arc<PersistentConnection<P>>,
        subscribe: S,
        unsubscribe: U,
    ) -> Self
    where
        P: BindProvider,
        S: Fn(&P::Channel) -> Result<(), E> + Send + Sync + 'static,
        U: Fn(&P::Channel) -> Result<(), E> + Send + Sync + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let subscribe = Arc::new(subscribe);
        let unsubscribe = Arc::new(unsubscribe);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let listeners = {
            let first_tx = command_tx.clone();
            let last_tx = command_tx;
            Arc::new(
                ListenerList::new()
                    .on_first_registered(move || {
                        let _ = first_tx.send(Command::Subscribe);
                    })
                    .on_last_unregistered(move || {
                        let _ = last_tx.send(Command::Unsubscribe);
                    }),
            )
        };

        // Set once the worker has applied a Subscribe, cleared by Unsubscribe.
        // A Subscribe still in flight covers the instance it lands on.
        let replay_wanted = Arc::new(AtomicBool::new(false));

        {
            let listeners = Arc::clone(&listeners);
            let subscribe = Arc::clone(&subscribe);
            let replay_wanted = Arc::clone(&replay_wanted);
            let descriptor = connection.descriptor().clone();
            connection.on_new_instance(move |channel: P::Channel| {
                let active = replay_wanted.load(Ordering::SeqCst) && !listeners.is_empty();
                let subscribe = Arc::clone(&subscribe);
                let descriptor = descriptor.clone();
                async move {
                    if !active {
                        return;
                    }
                    info!(%descriptor, "Resubscribing on new remote instance");
                    let outcome = tokio::task::spawn_blocking(move || {
                        subscribe(&channel).map_err(Into::<anyhow::Error>::into)
                    })
                    .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(%descriptor, error = %e, "Resubscribe failed"),
                        Err(e) => warn!(%descriptor, error = %e, "Resubscribe task failed"),
                    }
                }
            });
        }

        let worker = tokio::spawn(command_loop::<P, S, U, E>(
            connection,
            command_rx,
            replay_wanted,
            subscribe,
            unsubscribe,
        ));

        Self { listeners, worker }
    }

    pub fn register(&self, listener: Arc<L>) -> bool {
        self.listeners.register(listener)
    }

    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        self.listeners.unregister(listener)
    }

    pub fn listener_died(&self, listener: &Arc<L>) -> bool {
        self.listeners.listener_died(listener)
    }

    /// Fan a remote notification out to local listeners.
    pub fn dispatch<E: std::fmt::Display>(
        &self,
        deliver: impl FnMut(&L) -> Result<(), E>,
    ) -> usize {
        self.listeners.broadcast(deliver)
    }

    pub fn listeners(&self) -> &ListenerList<L> {
        &self.listeners
    }
}

impl<L: ?Sized> Drop for RemoteSubscription<L> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn command_loop<P, S, U, E>(
    connection: Arc<PersistentConnection<P>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    replay_wanted: Arc<AtomicBool>,
    subscribe: Arc<S>,
    unsubscribe: Arc<U>,
) where
    P: BindProvider,
    S: Fn(&P::Channel) -> Result<(), E> + Send + Sync + 'static,
    U: Fn(&P::Channel) -> Result<(), E> + Send + Sync + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let descriptor = connection.descriptor().clone();
    debug!(%descriptor, "Subscription worker started");

    while let Some(command) = commands.recv().await {
        let outcome = match command {
            Command::Subscribe => {
                let subscribe = Arc::clone(&subscribe);
                connection.execute(move |channel| subscribe(channel)).await
            }
            Command::Unsubscribe => {
                let unsubscribe = Arc::clone(&unsubscribe);
                connection.execute(move |channel| unsubscribe(channel)).await
            }
        };
        // A failed Subscribe is retried by the next instance's replay
        replay_wanted.store(command == Command::Subscribe, Ordering::SeqCst);

        match outcome {
            Ok(Some(())) => debug!(%descriptor, ?command, "Remote subscription updated"),
            Ok(None) => warn!(%descriptor, ?command, "Remote subscription update gave no result"),
            Err(e) => warn!(%descriptor, ?command, error = %e, "Remote subscription update refused"),
        }
    }

    debug!(%descriptor, "Subscription worker stopped");
}
