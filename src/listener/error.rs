//! Listener lifecycle errors.

use std::time::Duration;
use thiserror::Error;

use crate::acl::AclError;

/// Result alias for listener operations.
pub type ListenerResult<T> = Result<T, ListenerError>;

/// Errors raised while building, starting, or stopping listeners.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listen socket could not be acquired.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a running listener.
    #[error("listener {0} is already running")]
    AlreadyRunning(String),

    /// The configured allowlist is invalid.
    #[error(transparent)]
    Acl(#[from] AclError),

    /// Graceful shutdown exceeded its budget.
    #[error("graceful shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}
