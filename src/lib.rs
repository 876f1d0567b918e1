//! Service Link - self-healing connection to a long-lived remote service
//!
//! Keeps a channel to a remote process usable while that process crashes,
//! restarts, gets updated, or is slow to come up. Callers see `execute` and
//! `on_new_instance`; binding and recovery stay behind the connection.
//!
//! ## Architecture
//!
//! ```text
//! facade ──execute(fn)──► PersistentConnection
//!                            │
//!                            ├─► CallExecutor          two trials, swallow failures
//!                            │        │
//!                            │        ▼
//!                            └─► ConnectionStateMachine  lazy bind, timeouts
//!                                     │        ▲
//!                          start_bind │        │ connected / disconnected / died
//!                                     ▼        │
//!                                 BindProvider (yours)
//! ```
//!
//! ## What Callers See
//!
//! | Outcome                         | Value                                 |
//! |---------------------------------|---------------------------------------|
//! | Call succeeded                  | `Ok(Some(value))`                     |
//! | Both trials failed or timed out | `Ok(None)`                            |
//! | Called on the event thread      | `Err(LinkError::CalledFromEventContext)` |
//! | Remote died permanently         | `Err(LinkError::Dead)`                |

pub mod config;
pub mod descriptor;
pub mod error;
pub mod link;
pub mod listeners;
pub mod provider;
pub mod subscription;

// Re-exports
pub use config::LinkConfig;
pub use descriptor::{ConnectionDescriptor, EventContext, InstanceId, InstanceTracker};
pub use error::{CallFailure, LinkError, Result};
pub use link::{
    CallExecutor, ConnectionStateMachine, FailureObserver, Lease, LinkPhase, PersistentConnection,
    ReplayRegistry, CALL_TRIALS,
};
pub use listeners::ListenerList;
pub use provider::{BindEvents, BindProvider};
pub use subscription::RemoteSubscription;
