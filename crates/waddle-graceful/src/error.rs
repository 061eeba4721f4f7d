//! Error types for graceful serving.

use thiserror::Error;

/// Graceful server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding the listen address failed
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying bind error
        #[source]
        source: std::io::Error,
    },

    /// Accept failed while the listener was still open.
    ///
    /// The raw error is carried unchanged.
    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// The listener was closed for graceful shutdown and all units drained.
    #[error("Listener closed for graceful shutdown")]
    Shutdown,

    /// The drain phase hit its deadline with units still outstanding
    #[error("Drain timed out with {remaining} units outstanding")]
    DrainTimedOut {
        /// Units still active when the deadline expired
        remaining: usize,
    },

    /// Other IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is the shutdown sentinel rather than a real failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// The raw accept error, if this is one.
    pub fn as_accept_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Accept(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for graceful serving.
pub type Result<T> = std::result::Result<T, Error>;
