//! Error types for storage backends and directory orchestration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::transfer::{
    Classify, FailureType, RetryError, TransferCancelled, classify_http_status, parse_retry_after,
};

/// Errors that can occur while talking to a storage backend.
///
/// Each variant carries enough context to report the failure without the
/// caller re-deriving which path or URL was involved.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Remote object does not exist.
    #[error("object not found: {path}")]
    NotFound { path: String },

    /// Local file system error (open, create, stat, write).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Raw Retry-After header, if the server sent one.
        retry_after: Option<String>,
    },

    /// Connection-level HTTP failure.
    #[error("network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request exceeded the client timeout.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// Error reported by an object store client.
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: object_store::Error,
    },

    /// Error while moving bytes through a stream.
    #[error("stream error during {operation}: {source}")]
    Stream {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Server answered with a body that cannot be decoded.
    #[error("invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    /// Storage URL could not be parsed.
    #[error("invalid storage URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Storage URL scheme has no backend.
    #[error("unsupported storage provider: {scheme}")]
    UnsupportedProvider { scheme: String },

    /// SFTP protocol or SSH transport failure.
    #[error("sftp {operation} {target}: {message}")]
    Sftp {
        operation: &'static str,
        target: String,
        message: String,
        failure: FailureType,
    },

    /// Server host key missing from or conflicting with `known_hosts`.
    #[error("host key for {host} rejected: {reason}")]
    HostKeyRejected { host: String, reason: String },

    /// Server refused every configured credential.
    #[error("authentication failed for {user}@{host}")]
    AuthenticationFailed { user: String, host: String },

    /// Missing or invalid credentials or settings.
    #[error("storage configuration error: {reason}")]
    Config { reason: String },

    /// Remote listing produced a path that cannot be mirrored locally.
    #[error("refusing unsafe remote path: {path}")]
    UnsafePath { path: String },

    /// Operation cancelled by the caller.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// Every attempt failed with a retryable error.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },

    /// Per-file failure inside a directory operation.
    #[error("{action} {path}: {source}")]
    PathContext {
        action: &'static str,
        path: String,
        #[source]
        source: Box<StorageError>,
    },

    /// Stream upload failed after its reader was consumed.
    #[error("upload to {remote} cannot be retried once its stream is consumed: {source}")]
    NotReplayable {
        remote: String,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Creates a local I/O error; a cancelled limiter wait becomes [`StorageError::Cancelled`].
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        if TransferCancelled::is_in_io(&source) {
            return Self::cancelled("transfer");
        }
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Creates a stream error; a cancelled limiter wait becomes [`StorageError::Cancelled`].
    #[must_use]
    pub fn stream(operation: &'static str, source: std::io::Error) -> Self {
        if TransferCancelled::is_in_io(&source) {
            return Self::cancelled(operation);
        }
        Self::Stream { operation, source }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Maps a reqwest error, separating timeouts from other transport failures.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Maps an object store error; missing objects become [`StorageError::NotFound`].
    pub fn backend(operation: &'static str, path: impl Into<String>, source: object_store::Error) -> Self {
        match source {
            object_store::Error::NotFound { .. } => Self::NotFound { path: path.into() },
            source => Self::Backend { operation, source },
        }
    }

    /// Maps a body decode failure; interrupted bodies stay network errors.
    pub fn decode(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_decode() {
            Self::InvalidResponse {
                url,
                reason: source.to_string(),
            }
        } else {
            Self::network(url, source)
        }
    }

    /// Marks a stream upload failure [`StorageError::NotReplayable`] once the
    /// reader has given up more than the `buffered` head. Cancellation is kept.
    #[must_use]
    pub fn unless_replayable(self, remote: &str, consumed: u64, buffered: u64) -> Self {
        if self.is_cancelled() || consumed <= buffered {
            return self;
        }
        Self::NotReplayable {
            remote: remote.to_string(),
            source: Box::new(self),
        }
    }

    /// A stream upload whose reader already moved past its buffered head.
    #[must_use]
    pub fn reader_consumed(remote: &str) -> Self {
        Self::NotReplayable {
            remote: remote.to_string(),
            source: Box::new(Self::stream(
                "upload_stream",
                std::io::Error::other("reader already consumed"),
            )),
        }
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Wraps a per-file failure with the action and path it happened on.
    pub fn at_path(action: &'static str, path: impl Into<String>, source: Self) -> Self {
        Self::PathContext {
            action,
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Returns true when this error (or the error it wraps) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::PathContext { source, .. } | Self::NotReplayable { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// Returns true when this error (or the error it wraps) is a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::PathContext { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl Classify for StorageError {
    #[allow(clippy::match_same_arms)]
    fn failure_type(&self) -> Option<FailureType> {
        match self {
            Self::NotFound { .. } => Some(FailureType::Permanent),
            // local file system setup never heals by retrying
            Self::Io { .. } => Some(FailureType::Permanent),
            Self::HttpStatus { status, .. } => Some(classify_http_status(*status)),
            Self::Network { source, .. } => {
                if is_tls_error(source) {
                    Some(FailureType::Permanent)
                } else {
                    Some(FailureType::Transient)
                }
            }
            Self::Timeout { .. } => Some(FailureType::Transient),
            Self::Backend { source, .. } => classify_object_store(source),
            Self::Stream { source, .. } => source.failure_type(),
            Self::Sftp { failure, .. } => Some(*failure),
            Self::AuthenticationFailed { .. } => Some(FailureType::NeedsAuth),
            Self::InvalidUrl { .. }
            | Self::InvalidResponse { .. }
            | Self::UnsupportedProvider { .. }
            | Self::HostKeyRejected { .. }
            | Self::Config { .. }
            | Self::UnsafePath { .. } => Some(FailureType::Permanent),
            Self::Cancelled { .. } => Some(FailureType::Cancelled),
            Self::RetriesExhausted { .. } | Self::NotReplayable { .. } => {
                Some(FailureType::Permanent)
            }
            Self::PathContext { source, .. } => source.failure_type(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value),
            _ => None,
        }
    }
}

impl From<RetryError<StorageError>> for StorageError {
    fn from(error: RetryError<StorageError>) -> Self {
        match error {
            RetryError::Permanent(error) => error,
            RetryError::Exhausted {
                operation,
                attempts,
                source,
            } => Self::RetriesExhausted {
                operation,
                attempts,
                source: Box::new(source),
            },
            RetryError::Cancelled { operation } => Self::Cancelled { operation },
        }
    }
}

/// Typed category for object store errors; `None` defers to the message.
#[allow(clippy::match_same_arms)]
fn classify_object_store(error: &object_store::Error) -> Option<FailureType> {
    match error {
        object_store::Error::NotFound { .. } => Some(FailureType::Permanent),
        object_store::Error::PermissionDenied { .. } | object_store::Error::Unauthenticated { .. } => {
            Some(FailureType::NeedsAuth)
        }
        object_store::Error::InvalidPath { .. }
        | object_store::Error::AlreadyExists { .. }
        | object_store::Error::Precondition { .. }
        | object_store::Error::NotModified { .. }
        | object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::UnknownConfigurationKey { .. } => Some(FailureType::Permanent),
        object_store::Error::JoinError { .. } => Some(FailureType::Transient),
        object_store::Error::Generic { source, .. } => classify_generic_source(source.as_ref()),
        _ => None,
    }
}

/// Looks through a generic object store error for a transport failure.
fn classify_generic_source(source: &(dyn std::error::Error + 'static)) -> Option<FailureType> {
    let mut current = Some(source);
    while let Some(error) = current {
        if let Some(http) = error.downcast_ref::<object_store::client::HttpError>() {
            return match http.kind() {
                object_store::client::HttpErrorKind::Connect
                | object_store::client::HttpErrorKind::Request
                | object_store::client::HttpErrorKind::Timeout
                | object_store::client::HttpErrorKind::Interrupted => Some(FailureType::Transient),
                _ => None,
            };
        }
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            if let Some(kind) = io.failure_type() {
                return Some(kind);
            }
        }
        current = error.source();
    }
    None
}

/// Phrases the TLS stacks put in handshake and certificate failures.
const TLS_FAILURE_MARKERS: &[&str] = &[
    "certificate",
    "unknownissuer",
    "handshake failure",
    "ssl routines",
    "bad record mac",
    "peer is incompatible",
];

/// Checks if a reqwest error is a TLS/certificate error.
///
/// Only the wrapped sources are inspected: the top-level message embeds the
/// request URL, and host names are free text.
fn is_tls_error(error: &reqwest::Error) -> bool {
    tls_failure_in_chain(std::error::Error::source(error))
}

fn tls_failure_in_chain(mut source: Option<&(dyn std::error::Error + 'static)>) -> bool {
    while let Some(inner) = source {
        let text = inner.to_string().to_lowercase();
        if TLS_FAILURE_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        source = inner.source();
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_permanent() {
        let error = StorageError::not_found("vm1/disk.vmdk");
        assert_eq!(error.failure_type(), Some(FailureType::Permanent));
        assert!(error.is_not_found());
        assert_eq!(error.to_string(), "object not found: vm1/disk.vmdk");
    }

    #[test]
    fn test_object_store_not_found_maps_to_not_found() {
        let source = object_store::Error::NotFound {
            path: "exports/vm1/disk.vmdk".to_string(),
            source: "missing".into(),
        };
        let error = StorageError::backend("download", "vm1/disk.vmdk", source);
        assert!(matches!(error, StorageError::NotFound { ref path } if path == "vm1/disk.vmdk"));
    }

    #[test]
    fn test_object_store_generic_defers_to_message() {
        let source = object_store::Error::Generic {
            store: "S3",
            source: "SlowDown: please reduce your request rate".into(),
        };
        let error = StorageError::backend("upload", "a", source);
        assert_eq!(error.failure_type(), None);
    }

    #[test]
    fn test_object_store_permission_denied_needs_auth() {
        let source = object_store::Error::PermissionDenied {
            path: "a".to_string(),
            source: "denied".into(),
        };
        let error = StorageError::backend("upload", "a", source);
        assert_eq!(error.failure_type(), Some(FailureType::NeedsAuth));
    }

    #[test]
    fn test_http_status_classification_and_retry_after() {
        let error = StorageError::http_status("https://swift/x", 503, Some("3".to_string()));
        assert_eq!(error.failure_type(), Some(FailureType::RateLimited));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));

        let error = StorageError::http_status("https://swift/x", 404, None);
        assert_eq!(error.failure_type(), Some(FailureType::Permanent));
        assert_eq!(error.retry_after(), None);
    }

    #[test]
    fn test_io_error_is_permanent_unless_cancelled() {
        let error = StorageError::io("/tmp/x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(error.failure_type(), Some(FailureType::Permanent));

        let error = StorageError::io("/tmp/x", TransferCancelled.into_io());
        assert!(error.is_cancelled());
        assert_eq!(error.failure_type(), Some(FailureType::Cancelled));
    }

    #[test]
    fn test_stream_error_uses_io_kind() {
        let error = StorageError::stream(
            "upload",
            std::io::Error::from(std::io::ErrorKind::ConnectionReset),
        );
        assert_eq!(error.failure_type(), Some(FailureType::Transient));
    }

    #[test]
    fn test_unless_replayable_keeps_cause_within_buffered_head() {
        let reset = || StorageError::stream("upload_stream", std::io::Error::from(std::io::ErrorKind::ConnectionReset));

        let kept = reset().unless_replayable("vm.ovf", 0, 0);
        assert!(matches!(kept, StorageError::Stream { .. }));
        let kept = reset().unless_replayable("vm.ovf", 4096, 4096);
        assert_eq!(kept.failure_type(), Some(FailureType::Transient));

        let spent = reset().unless_replayable("vm.ovf", 4097, 4096);
        assert!(matches!(spent, StorageError::NotReplayable { .. }));
        assert_eq!(spent.failure_type(), Some(FailureType::Permanent));

        let cancelled = StorageError::cancelled("upload_stream").unless_replayable("vm.ovf", 10, 0);
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_path_context_delegates_classification() {
        let error = StorageError::at_path("upload", "/data/a.vmdk", StorageError::cancelled("upload"));
        assert!(error.is_cancelled());
        assert_eq!(error.failure_type(), Some(FailureType::Cancelled));
        assert_eq!(
            error.to_string(),
            "upload /data/a.vmdk: upload cancelled"
        );
    }

    #[test]
    fn test_invalid_response_is_permanent() {
        let error = StorageError::InvalidResponse {
            url: "https://swift/v1/AUTH_x/exports".to_string(),
            reason: "expected value at line 1 column 1".to_string(),
        };
        assert_eq!(error.failure_type(), Some(FailureType::Permanent));
    }

    #[derive(Debug)]
    struct Layer {
        message: &'static str,
        source: Option<Box<Layer>>,
    }

    impl std::fmt::Display for Layer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.message)
        }
    }

    impl std::error::Error for Layer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.source.as_deref().map(|s| s as &(dyn std::error::Error + 'static))
        }
    }

    fn chain(messages: &[&'static str]) -> Layer {
        messages
            .iter()
            .copied()
            .rev()
            .fold(None, |source, message| {
                Some(Layer {
                    message,
                    source: source.map(Box::new),
                })
            })
            .unwrap()
    }

    #[test]
    fn test_tls_detection_ignores_host_names() {
        let error = chain(&[
            "client error (Connect)",
            "tcp connect error: connect to ssl-gateway.tls.example.com failed",
            "Connection refused (os error 111)",
        ]);
        assert!(!tls_failure_in_chain(Some(&error)));
    }

    #[test]
    fn test_tls_detection_finds_certificate_failure() {
        let error = chain(&[
            "client error (Connect)",
            "invalid peer certificate: UnknownIssuer",
        ]);
        assert!(tls_failure_in_chain(Some(&error)));
    }

    #[test]
    fn test_ssh_session_errors_classify() {
        let rejected = StorageError::HostKeyRejected {
            host: "nas".to_string(),
            reason: "not listed in known_hosts".to_string(),
        };
        assert_eq!(rejected.failure_type(), Some(FailureType::Permanent));

        let refused = StorageError::AuthenticationFailed {
            user: "backup".to_string(),
            host: "nas".to_string(),
        };
        assert_eq!(refused.failure_type(), Some(FailureType::NeedsAuth));
        assert_eq!(refused.to_string(), "authentication failed for backup@nas");

        let dropped = StorageError::Sftp {
            operation: "write",
            target: "exports/disk.vmdk".to_string(),
            message: "Connection lost".to_string(),
            failure: FailureType::Transient,
        };
        assert_eq!(dropped.failure_type(), Some(FailureType::Transient));
    }

    #[test]
    fn test_from_retry_error() {
        let exhausted = RetryError::Exhausted {
            operation: "upload".to_string(),
            attempts: 3,
            source: StorageError::Timeout {
                url: "https://x".to_string(),
            },
        };
        let error = StorageError::from(exhausted);
        assert!(error.to_string().contains("failed after 3 attempts"));

        let permanent = RetryError::Permanent(StorageError::not_found("a"));
        assert!(StorageError::from(permanent).is_not_found());

        let cancelled: RetryError<StorageError> = RetryError::Cancelled {
            operation: "list".to_string(),
        };
        assert!(StorageError::from(cancelled).is_cancelled());
    }
}
