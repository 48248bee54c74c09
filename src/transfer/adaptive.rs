//! Self-tuning bandwidth limiter driven by transfer outcomes.
//!
//! [`AdaptiveBandwidthLimiter`] wraps a [`BandwidthLimiter`] and keeps two
//! exponential moving averages (factor 0.1) of success and error incidence.
//! At most once per adjust interval it raises the ceiling by 20% while the
//! link looks healthy (success > 0.9, error < 0.05) and cuts it by 20% once
//! errors exceed 10%, always staying within `[min, max]`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::bandwidth::{BandwidthLimiter, BandwidthStats};
use super::constants::{DEFAULT_ADAPTIVE_MAX, DEFAULT_ADAPTIVE_MIN, DEFAULT_ADJUST_INTERVAL};
use super::error::TransferCancelled;

/// Weight of each new observation in the moving averages.
const EMA_FACTOR: f64 = 0.1;

const INCREASE_FACTOR: f64 = 1.2;
const DECREASE_FACTOR: f64 = 0.8;

const HEALTHY_SUCCESS_RATE: f64 = 0.9;
const HEALTHY_ERROR_RATE: f64 = 0.05;
const UNHEALTHY_ERROR_RATE: f64 = 0.1;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug)]
struct AdaptiveState {
    current: u64,
    success_rate: f64,
    error_rate: f64,
    last_adjust: Instant,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSnapshot {
    pub current_bytes_per_sec: u64,
    pub min_bytes_per_sec: u64,
    pub max_bytes_per_sec: u64,
    pub success_rate: f64,
    pub error_rate: f64,
}

/// Bandwidth limiter whose ceiling follows success/error feedback.
#[derive(Debug)]
pub struct AdaptiveBandwidthLimiter {
    limiter: Arc<BandwidthLimiter>,
    min: u64,
    max: u64,
    adjust_interval: Duration,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveBandwidthLimiter {
    /// Creates a controller bounded by `[min, max]` bytes/s, starting at the midpoint.
    ///
    /// Zero bounds fall back to 1 MiB/s and 100 MiB/s; a `max` below `min`
    /// is raised to `min`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(min: u64, max: u64) -> Self {
        let min = if min == 0 { DEFAULT_ADAPTIVE_MIN } else { min };
        let max = if max == 0 { DEFAULT_ADAPTIVE_MAX } else { max }.max(min);
        let current = min + (max - min) / 2;

        info!(
            min_mbps = min as f64 / BYTES_PER_MIB,
            max_mbps = max as f64 / BYTES_PER_MIB,
            start_mbps = current as f64 / BYTES_PER_MIB,
            "adaptive bandwidth limiter created"
        );

        Self {
            limiter: Arc::new(BandwidthLimiter::new(current, None)),
            min,
            max,
            adjust_interval: DEFAULT_ADJUST_INTERVAL,
            state: Mutex::new(AdaptiveState {
                current,
                success_rate: 0.0,
                error_rate: 0.0,
                last_adjust: Instant::now(),
            }),
        }
    }

    /// Overrides the minimum time between adjustments.
    #[must_use]
    pub fn with_adjust_interval(mut self, interval: Duration) -> Self {
        self.adjust_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, AdaptiveState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The wrapped limiter, for callers that only need to wait.
    #[must_use]
    pub fn limiter(&self) -> &Arc<BandwidthLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn current_speed(&self) -> u64 {
        self.lock().current
    }

    #[must_use]
    pub fn min_speed(&self) -> u64 {
        self.min
    }

    #[must_use]
    pub fn max_speed(&self) -> u64 {
        self.max
    }

    /// Waits on the wrapped limiter.
    ///
    /// # Errors
    ///
    /// Returns [`TransferCancelled`] if `cancel` fires while waiting.
    pub async fn wait(&self, cancel: &CancellationToken, bytes: u64) -> Result<(), TransferCancelled> {
        self.limiter.wait(cancel, bytes).await
    }

    /// Records a successful transfer attempt.
    pub fn record_success(&self) {
        self.observe(1.0);
    }

    /// Records a failed transfer attempt.
    pub fn record_error(&self) {
        self.observe(0.0);
    }

    fn observe(&self, success_signal: f64) {
        let mut state = self.lock();
        state.success_rate = state.success_rate * (1.0 - EMA_FACTOR) + EMA_FACTOR * success_signal;
        state.error_rate = state.error_rate * (1.0 - EMA_FACTOR) + EMA_FACTOR * (1.0 - success_signal);
        self.adjust_speed(&mut state);
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn adjust_speed(&self, state: &mut AdaptiveState) {
        let now = Instant::now();
        if now.saturating_duration_since(state.last_adjust) < self.adjust_interval {
            return;
        }
        state.last_adjust = now;

        let old = state.current;
        if state.success_rate > HEALTHY_SUCCESS_RATE && state.error_rate < HEALTHY_ERROR_RATE {
            // rounded up so small ceilings still grow
            state.current = ((old as f64 * INCREASE_FACTOR).ceil() as u64).min(self.max);
        } else if state.error_rate > UNHEALTHY_ERROR_RATE {
            state.current = ((old as f64 * DECREASE_FACTOR) as u64).max(self.min);
        }

        if state.current != old {
            info!(
                old_mbps = old as f64 / BYTES_PER_MIB,
                new_mbps = state.current as f64 / BYTES_PER_MIB,
                success_rate = state.success_rate,
                error_rate = state.error_rate,
                "bandwidth adjusted"
            );
            self.limiter.set_rate(state.current);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> AdaptiveSnapshot {
        let state = self.lock();
        AdaptiveSnapshot {
            current_bytes_per_sec: state.current,
            min_bytes_per_sec: self.min,
            max_bytes_per_sec: self.max,
            success_rate: state.success_rate,
            error_rate: state.error_rate,
        }
    }

    /// Usage of the wrapped limiter.
    #[must_use]
    pub fn stats(&self) -> BandwidthStats {
        self.limiter.stats()
    }
}
