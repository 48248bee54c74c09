//! Transfer control plane: retries, bandwidth governance and stream throttling.
//!
//! Every remote storage operation in this crate runs inside a [`Retryer`],
//! and every byte it moves passes through a [`Governor`].
//!
//! # Features
//!
//! - Exponential backoff with jitter and typed failure classification
//! - Retry-After hints honoured for throttled requests
//! - Token-bucket rate limiting shared across concurrent transfers
//! - Adaptive ceiling driven by success/error feedback
//! - Cancellation threaded through every backoff sleep and limiter wait
//!
//! # Example
//!
//! ```
//! use tokio_util::sync::CancellationToken;
//! use transfer_core::transfer::Governor;
//!
//! # async fn example() -> Result<(), transfer_core::transfer::TransferCancelled> {
//! let governor = Governor::fixed(10 * 1024 * 1024, None);
//! let cancel = CancellationToken::new();
//! governor.wait(&cancel, 64 * 1024).await?;
//! # Ok(())
//! # }
//! ```

mod adaptive;
mod bandwidth;
pub mod constants;
mod error;
mod governor;
mod progress;
mod retry;
mod throttle;

pub use adaptive::{AdaptiveBandwidthLimiter, AdaptiveSnapshot};
pub use bandwidth::{BandwidthLimiter, BandwidthStats, format_speed};
pub use error::{RetryError, TransferCancelled};
pub use governor::Governor;
pub use progress::{ProgressCallback, ProgressTracker};
pub use retry::{
    Attempt, Classify, DEFAULT_MAX_ATTEMPTS, FailureType, PROVIDER_RETRYABLE_MARKERS, RetryPolicy,
    Retryer, classify_http_status, classify_message, parse_retry_after,
};
pub use throttle::{ReadAhead, ThrottledReader, ThrottledWriter, copy_throttled};
