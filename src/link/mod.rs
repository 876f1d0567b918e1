//! Persistent Connection Module
//!
//! This module keeps a channel to a remote service alive across crashes,
//! restarts and slow binds.
//!
//! # Architecture
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `state`      | Bind lifecycle, one attempt at a time, bounded waits  |
//! | `replay`     | Re-run setup against each new remote instance         |
//! | `executor`   | Two-trial call policy and failure classification      |
//! | `connection` | The handle facades hold                               |
//!
//! # Key Design Principles
//!
//! ## 1. Bind Lazily, Heal on Demand
//!
//! - Constructing a connection does not bind
//! - A failed call drops its channel; the next request binds afresh
//! - No background reconnect loops
//!
//! ## 2. Never Block the Event Thread
//!
//! - Waiters park on a `watch` receiver and hold no lock
//! - Provider callbacks only flip state, they never wait
//! - Asking for a channel on the provider's event thread is refused up front
//!
//! ## 3. Absence Is a Value
//!
//! - Transient failures never escape as errors
//! - A call that failed twice yields `Ok(None)`
//! - Only misuse and permanent death are errors
//!
//! # Usage
//!
//! ```ignore
//! use service_link::{ConnectionDescriptor, LinkConfig, PersistentConnection};
//!
//! let connection = PersistentConnection::new(
//!     ConnectionDescriptor::new("com.example.services", "ProjectorService"),
//!     provider,
//!     &LinkConfig::default(),
//! );
//!
//! connection.on_new_instance(|projector| async move {
//!     projector.subscribe_to_state();
//! });
//!
//! let state = connection.execute(|projector| projector.get_state()).await?;
//! ```

mod connection;
mod executor;
mod replay;
pub(crate) mod state;

pub use connection::PersistentConnection;
pub use executor::{CallExecutor, FailureObserver, CALL_TRIALS};
pub use replay::ReplayRegistry;
pub use state::{ConnectionStateMachine, Lease, LinkPhase};
