//! Error types shared by the retry engine and the bandwidth limiters.

use thiserror::Error;

/// Returned by limiter waits when the caller's cancellation token fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transfer cancelled")]
pub struct TransferCancelled;

impl TransferCancelled {
    /// Wraps the marker in an `io::Error` so it can travel through stream adapters.
    #[must_use]
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::other(self)
    }

    /// Returns true when `error` carries a [`TransferCancelled`] marker.
    #[must_use]
    pub fn is_in_io(error: &std::io::Error) -> bool {
        error
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<Self>().is_some())
    }
}

/// Outcome of a [`Retryer`](super::Retryer) run that did not succeed.
///
/// A permanent failure hands back the operation's own error untouched, so
/// callers can match on it exactly as if no retry engine were involved.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed with an error that retrying cannot fix.
    #[error(transparent)]
    Permanent(E),

    /// Every attempt failed with a retryable error.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The cancellation token fired before or between attempts.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl<E> RetryError<E> {
    /// Returns true when the run ended because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Number of attempts made before giving up, when known.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } => Some(*attempts),
            Self::Permanent(_) | Self::Cancelled { .. } => None,
        }
    }

    /// Consumes the error and returns the last operation error, if there was one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Permanent(error) | Self::Exhausted { source: error, .. } => Some(error),
            Self::Cancelled { .. } => None,
        }
    }
}
