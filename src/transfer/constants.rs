//! Constants for the transfer module (timeouts, buffer sizes, limiter tuning).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes between received chunks).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum Retry-After hint (1 hour) honoured as a backoff delay.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Buffer size for chunked copies between local files and remote streams.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Part size for multipart uploads; smaller files go up in a single request.
pub const MULTIPART_PART_SIZE: usize = 10 * 1024 * 1024;

/// Parts kept in flight per multipart upload.
pub const MULTIPART_CONCURRENCY: usize = 4;

/// Longest single sleep inside a limiter wait, so cancellation stays responsive.
pub const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Shortest limiter sleep, avoids spinning on sub-millisecond shortfalls.
pub const MIN_WAIT_SLICE: Duration = Duration::from_millis(1);

/// Default lower bound for the adaptive limiter (1 MiB/s).
pub const DEFAULT_ADAPTIVE_MIN: u64 = 1024 * 1024;

/// Default upper bound for the adaptive limiter (100 MiB/s).
pub const DEFAULT_ADAPTIVE_MAX: u64 = 100 * 1024 * 1024;

/// Default minimum time between adaptive rate adjustments.
pub const DEFAULT_ADJUST_INTERVAL: Duration = Duration::from_secs(10);
