//! Error types for service-link

use thiserror::Error;

/// Errors visible to callers of a [`PersistentConnection`](crate::PersistentConnection).
///
/// Transient failures (bind timeouts, failed remote calls) never show up
/// here; they are absorbed and surface as an empty result instead.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Channel requested from the provider's event-delivery context")]
    CalledFromEventContext,

    #[error("Remote endpoint is dead and will never reconnect")]
    Dead,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure swallowed by the call executor and handed to the
/// [`FailureObserver`](crate::FailureObserver).
#[derive(Error, Debug)]
pub enum CallFailure {
    #[error("Remote call failed: {0}")]
    Remote(anyhow::Error),

    #[error("Remote call panicked: {0}")]
    Panicked(String),

    #[error("Remote call was aborted")]
    Aborted,
}

impl CallFailure {
    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            CallFailure::Panicked(message)
        } else {
            CallFailure::Aborted
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
