//! The bandwidth policy a transfer session runs under.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::adaptive::AdaptiveBandwidthLimiter;
use super::bandwidth::{BandwidthLimiter, BandwidthStats};
use super::error::TransferCancelled;

/// Shared handle every transfer waits on before moving bytes.
///
/// Cloning is cheap; clones share the same limiter state.
#[derive(Debug, Clone, Default)]
pub enum Governor {
    /// No ceiling; waits return immediately.
    #[default]
    Unlimited,
    /// Fixed ceiling.
    Fixed(Arc<BandwidthLimiter>),
    /// Ceiling tuned from transfer feedback.
    Adaptive(Arc<AdaptiveBandwidthLimiter>),
}

impl Governor {
    /// Fixed-rate governor; a zero `limit` yields [`Governor::Unlimited`].
    #[must_use]
    pub fn fixed(limit: u64, burst: Option<u64>) -> Self {
        if limit == 0 {
            Self::Unlimited
        } else {
            Self::Fixed(Arc::new(BandwidthLimiter::new(limit, burst)))
        }
    }

    #[must_use]
    pub fn adaptive(limiter: AdaptiveBandwidthLimiter) -> Self {
        Self::Adaptive(Arc::new(limiter))
    }

    /// Waits until `bytes` may be moved.
    ///
    /// # Errors
    ///
    /// Returns [`TransferCancelled`] if `cancel` fires while waiting.
    pub async fn wait(&self, cancel: &CancellationToken, bytes: u64) -> Result<(), TransferCancelled> {
        match self {
            Self::Unlimited => Ok(()),
            Self::Fixed(limiter) => limiter.wait(cancel, bytes).await,
            Self::Adaptive(adaptive) => adaptive.wait(cancel, bytes).await,
        }
    }

    /// Feeds a successful attempt to an adaptive governor.
    pub fn record_success(&self) {
        if let Self::Adaptive(adaptive) = self {
            adaptive.record_success();
        }
    }

    /// Feeds a failed attempt to an adaptive governor.
    pub fn record_error(&self) {
        if let Self::Adaptive(adaptive) = self {
            adaptive.record_error();
        }
    }

    /// Current ceiling in bytes/s (0 = unlimited).
    #[must_use]
    pub fn current_limit(&self) -> u64 {
        match self {
            Self::Unlimited => 0,
            Self::Fixed(limiter) => limiter.limit(),
            Self::Adaptive(adaptive) => adaptive.current_speed(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Option<BandwidthStats> {
        match self {
            Self::Unlimited => None,
            Self::Fixed(limiter) => Some(limiter.stats()),
            Self::Adaptive(adaptive) => Some(adaptive.stats()),
        }
    }
}
