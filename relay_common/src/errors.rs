//! # Relay Errors
//!
//! Every per-message failure in the relay is one of these kinds. Callers match
//! on the kind to decide between retrying, surfacing to the HTTP client, or
//! aborting startup.

use thiserror::Error;

/// Convenience alias used across the library.
pub type RelayResult<T> = Result<T, RelayError>;

/// An envelope or payload could not be decoded.
///
/// The cause is deliberately not exposed: bad base64, a short buffer, a wrong
/// key, bad padding and a corrupt gzip stream all look the same to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("payload could not be decoded")]
pub struct DecodeError;

/// Errors that can occur anywhere in the relay pipeline.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Sending or receiving a frame failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A malformed envelope, heartbeat or JSON body.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The envelope could not be produced (compression or encryption).
    #[error("Encode error: {0}")]
    Encode(String),

    /// The analytics API answered with a failure or could not be reached.
    #[error("Downstream error: {0}")]
    Downstream(String),

    /// The relay queue stayed at capacity for the whole enqueue timeout.
    #[error("Queue full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity of the queue that rejected the item.
        capacity: usize,
    },

    /// Required configuration is missing or malformed.
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    /// The handle was closed by a shutdown.
    #[error("Handle closed")]
    Closed,
}

impl RelayError {
    /// Whether the failure should be handed to a retry queue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_) | RelayError::Decode(_) | RelayError::Downstream(_)
        )
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Transport(e.to_string())
    }
}
