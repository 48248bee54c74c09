//! Provider-agnostic storage protocol and directory orchestration.
//!
//! Every backend implements [`CloudStorage`]. Backends run each remote call
//! through a shared [`OperationRunner`] (retries plus bandwidth feedback),
//! prefix every logical path with their configured prefix, and report
//! progress per chunk through an optional callback.
//!
//! # Architecture
//!
//! - [`StorageTarget`] - Parsed storage URL (`s3://`, `azure://`, `gcs://`, `sftp://`, `swift://`, `oci://`, `file://`)
//! - [`connect`] - Builds a [`Storage`] from a URL and shared [`StorageOptions`]
//! - [`ObjectStoreStorage`] - S3, Azure Blob, GCS, OCI and local file system via `object_store`
//! - [`SwiftStorage`] - OpenStack Swift over its HTTP API
//! - [`SftpStorage`] - SFTP servers over SSH, host keys checked against `known_hosts`
//! - [`upload_directory`], [`download_directory`], [`delete_directory`] - Tree-level operations
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use transfer_core::storage::{CloudStorage, StorageOptions, connect};
//!
//! # async fn example() -> Result<(), transfer_core::storage::StorageError> {
//! let storage = connect("s3://backups/vm-exports", StorageOptions::default()).await?;
//! let cancel = CancellationToken::new();
//! for file in storage.list(&cancel, "web-01").await? {
//!     println!("{} ({} bytes)", file.path, file.size);
//! }
//! storage.close().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod directory;
mod error;
mod object;
mod path;
mod runner;
mod sftp;
mod staging;
mod swift;
mod target;

pub use backend::{Storage, StorageOptions, connect};
pub use directory::{TransferSummary, delete_directory, download_directory, upload_directory};
pub use error::StorageError;
pub use object::ObjectStoreStorage;
pub use path::{RemotePrefix, join_remote, normalize_remote_path, relative_remote_path, strip_remote_prefix};
pub use runner::OperationRunner;
pub use sftp::{SftpSettings, SftpStorage};
pub use swift::{SwiftCredentials, SwiftStorage, authenticate_v1};
pub use target::{DEFAULT_SFTP_PORT, StorageTarget};

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::transfer::ProgressCallback;

/// Boxed reader accepted by [`CloudStorage::upload_stream`].
pub type UploadReader = Box<dyn AsyncRead + Send + Unpin>;

/// A remote object as returned by [`CloudStorage::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudFile {
    /// Logical path, relative to the backend's configured prefix.
    pub path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Operations every storage backend provides.
///
/// Remote paths are logical: the backend joins them under its configured
/// prefix. Implementations are shared across concurrent transfers.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// Uploads a local file.
    async fn upload(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError>;

    /// Uploads `size` bytes read from `reader`.
    ///
    /// A reader cannot be rewound, so a failure after the first byte was
    /// consumed is returned as [`StorageError::NotReplayable`] instead of
    /// being retried.
    async fn upload_stream(
        &self,
        cancel: &CancellationToken,
        reader: UploadReader,
        remote: &str,
        size: u64,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError>;

    /// Downloads a remote object to a local file, replacing it.
    async fn download(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError>;

    /// Lists objects under a logical prefix (whole path segments).
    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<CloudFile>, StorageError>;

    /// Deletes an object; deleting a missing object succeeds.
    async fn delete(&self, cancel: &CancellationToken, remote: &str) -> Result<(), StorageError>;

    async fn exists(&self, cancel: &CancellationToken, remote: &str) -> Result<bool, StorageError>;

    /// Storage URL this backend was built from.
    fn url(&self) -> String;

    /// Releases backend resources.
    async fn close(&self) -> Result<(), StorageError>;
}
