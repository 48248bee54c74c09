//! Token-bucket bandwidth limiter shared by concurrent transfers.
//!
//! A [`BandwidthLimiter`] enforces a byte-per-second ceiling. Callers ask for
//! permission to move `n` bytes with [`BandwidthLimiter::wait`]; the call
//! returns immediately while the bucket holds enough tokens and otherwise
//! sleeps in slices of at most one second, re-checking the bucket after each
//! slice so that many workers sharing one limiter interleave fairly.
//!
//! A ceiling of zero means unlimited: `wait` never sleeps.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::constants::{MAX_WAIT_SLICE, MIN_WAIT_SLICE};
use super::error::TransferCancelled;

/// Tolerance for float rounding when comparing tokens to a request.
const TOKEN_EPSILON: f64 = 1e-6;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug)]
struct RateState {
    limit: u64,
    burst: u64,
    /// Burst follows the rate (2x) when the caller did not pin it.
    burst_follows_limit: bool,
    tokens: f64,
    last_refill: Instant,
    bytes_transferred: u64,
}

impl RateState {
    #[allow(clippy::cast_precision_loss)]
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.limit as f64).min(self.burst as f64);
    }
}

/// Point-in-time usage snapshot of a limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthStats {
    /// Bytes granted since the limiter was created.
    pub bytes_transferred: u64,
    /// Wall time since the limiter was created.
    pub elapsed: Duration,
    /// `bytes_transferred / elapsed`, zero before any time has passed.
    pub average_bytes_per_sec: f64,
    /// Configured ceiling (0 = unlimited).
    pub limit_bytes_per_sec: u64,
}

/// Token-bucket rate governor.
#[derive(Debug)]
pub struct BandwidthLimiter {
    state: Mutex<RateState>,
    started: Instant,
}

impl BandwidthLimiter {
    /// Creates a limiter with `limit` bytes/s and an optional burst size.
    ///
    /// `burst` of `None` or zero defaults to twice the limit. The bucket
    /// starts full.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(limit: u64, burst: Option<u64>) -> Self {
        let pinned = burst.filter(|b| *b > 0);
        let burst = pinned.unwrap_or_else(|| limit.saturating_mul(2));
        let now = Instant::now();

        if limit > 0 {
            info!(
                limit_mbps = limit as f64 / BYTES_PER_MIB,
                burst_mb = burst as f64 / BYTES_PER_MIB,
                "bandwidth limiter created"
            );
        }

        Self {
            state: Mutex::new(RateState {
                limit,
                burst,
                burst_follows_limit: pinned.is_none(),
                tokens: burst as f64,
                last_refill: now,
                bytes_transferred: 0,
            }),
            started: now,
        }
    }

    /// Creates a limiter that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0, None)
    }

    fn lock(&self) -> MutexGuard<'_, RateState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current ceiling in bytes/s (0 = unlimited).
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.lock().limit
    }

    /// Current bucket capacity in bytes.
    #[must_use]
    pub fn burst(&self) -> u64 {
        self.lock().burst
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.limit() == 0
    }

    /// Changes the ceiling in place.
    ///
    /// A defaulted burst tracks the new rate; tokens above the new capacity
    /// are discarded.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_rate(&self, limit: u64) {
        let mut state = self.lock();
        state.refill(Instant::now());
        state.limit = limit;
        if state.burst_follows_limit {
            state.burst = limit.saturating_mul(2);
        }
        state.tokens = state.tokens.min(state.burst as f64);
        debug!(limit, burst = state.burst, "bandwidth limit updated");
    }

    /// Waits until `bytes` may be transferred.
    ///
    /// Requests larger than the burst are served in burst-sized slices, so
    /// they always complete.
    ///
    /// # Errors
    ///
    /// Returns [`TransferCancelled`] if `cancel` fires while waiting.
    #[allow(clippy::cast_precision_loss)]
    pub async fn wait(&self, cancel: &CancellationToken, bytes: u64) -> Result<(), TransferCancelled> {
        let mut remaining = bytes;

        while remaining > 0 {
            let pause = {
                let mut state = self.lock();
                if state.limit == 0 {
                    state.bytes_transferred = state.bytes_transferred.saturating_add(remaining);
                    return Ok(());
                }

                state.refill(Instant::now());
                let slice = remaining.min(state.burst.max(1));
                let needed = slice as f64;

                if state.tokens + TOKEN_EPSILON >= needed {
                    state.tokens = (state.tokens - needed).max(0.0);
                    state.bytes_transferred = state.bytes_transferred.saturating_add(slice);
                    remaining -= slice;
                    None
                } else {
                    let shortfall = needed - state.tokens;
                    let seconds = shortfall / state.limit as f64;
                    Some(
                        Duration::from_secs_f64(seconds.min(MAX_WAIT_SLICE.as_secs_f64()))
                            .max(MIN_WAIT_SLICE),
                    )
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(TransferCancelled),
                    () = tokio::time::sleep(pause) => {}
                }
            }
        }

        Ok(())
    }

    /// Usage snapshot.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> BandwidthStats {
        let (bytes_transferred, limit) = {
            let state = self.lock();
            (state.bytes_transferred, state.limit)
        };
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let average_bytes_per_sec = if secs > 0.0 {
            bytes_transferred as f64 / secs
        } else {
            0.0
        };

        BandwidthStats {
            bytes_transferred,
            elapsed,
            average_bytes_per_sec,
            limit_bytes_per_sec: limit,
        }
    }
}

/// Renders a byte rate as `KB/s`, `MB/s`, `GB/s` or `TB/s` (binary units).
///
/// ```
/// use transfer_core::transfer::format_speed;
///
/// assert_eq!(format_speed(512.0), "< 1 KB/s");
/// assert_eq!(format_speed(1536.0), "1.50 KB/s");
/// assert_eq!(format_speed(10.0 * 1024.0 * 1024.0), "10.00 MB/s");
/// ```
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    const UNIT: f64 = 1024.0;
    const UNITS: [&str; 4] = ["KB/s", "MB/s", "GB/s", "TB/s"];

    if bytes_per_sec.is_nan() || bytes_per_sec < UNIT {
        return "< 1 KB/s".to_string();
    }

    let mut value = bytes_per_sec / UNIT;
    let mut index = 0;
    while value >= UNIT && index < UNITS.len() - 1 {
        value /= UNIT;
        index += 1;
    }

    format!("{value:.2} {}", UNITS[index])
}
