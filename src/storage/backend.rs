//! Backend selection by storage URL.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error::StorageError;
use super::object::ObjectStoreStorage;
use super::runner::OperationRunner;
use super::sftp::{SftpSettings, SftpStorage};
use super::swift::SwiftStorage;
use super::target::StorageTarget;
use super::{CloudFile, CloudStorage, UploadReader};
use crate::transfer::{Governor, ProgressCallback, Retryer};

/// Shared session state handed to every backend built by [`connect`].
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub retryer: Arc<Retryer>,
    pub governor: Governor,
    /// Cancels credential handshakes performed while connecting.
    pub cancel: CancellationToken,
}

impl StorageOptions {
    fn runner(&self) -> OperationRunner {
        OperationRunner::new(Arc::clone(&self.retryer), self.governor.clone())
    }
}

/// A connected storage backend.
///
/// Closed set of backends; [`CloudStorage`] dispatch over it is an
/// exhaustive match.
#[derive(Debug)]
pub enum Storage {
    ObjectStore(ObjectStoreStorage),
    Swift(SwiftStorage),
    Sftp(SftpStorage),
}

/// Parses `url` and builds the matching backend.
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedProvider`] for unknown schemes,
/// configuration errors from the backend constructors, and the connection
/// error of backends that hold a session (Swift, SFTP).
pub async fn connect(url: &str, options: StorageOptions) -> Result<Storage, StorageError> {
    let target = StorageTarget::parse(url)?;
    info!(provider = target.provider(), "connecting to storage");
    let runner = options.runner();

    let storage = match target {
        StorageTarget::S3 { bucket, prefix } => {
            Storage::ObjectStore(ObjectStoreStorage::s3(&bucket, &prefix, runner)?)
        }
        StorageTarget::Azure { container, prefix } => {
            Storage::ObjectStore(ObjectStoreStorage::azure(&container, &prefix, runner)?)
        }
        StorageTarget::Gcs { bucket, prefix } => {
            Storage::ObjectStore(ObjectStoreStorage::gcs(&bucket, &prefix, runner)?)
        }
        StorageTarget::Oci {
            namespace,
            bucket,
            prefix,
        } => Storage::ObjectStore(ObjectStoreStorage::oci(&namespace, &bucket, &prefix, runner)?),
        StorageTarget::Local { root } => Storage::ObjectStore(ObjectStoreStorage::local(&root, runner)?),
        StorageTarget::Swift { container, prefix } => Storage::Swift(
            SwiftStorage::from_env(&options.cancel, &container, &prefix, runner).await?,
        ),
        StorageTarget::Sftp {
            host,
            port,
            username,
            password,
            prefix,
        } => {
            let settings = SftpSettings::resolve(&host, port, username, password)?;
            Storage::Sftp(SftpStorage::connect(&options.cancel, settings, &prefix, runner).await?)
        }
    };
    Ok(storage)
}

#[async_trait]
impl CloudStorage for Storage {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError> {
        match self {
            Self::ObjectStore(s) => s.upload(cancel, local, remote, progress).await,
            Self::Swift(s) => s.upload(cancel, local, remote, progress).await,
            Self::Sftp(s) => s.upload(cancel, local, remote, progress).await,
        }
    }

    async fn upload_stream(
        &self,
        cancel: &CancellationToken,
        reader: UploadReader,
        remote: &str,
        size: u64,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError> {
        match self {
            Self::ObjectStore(s) => s.upload_stream(cancel, reader, remote, size, progress).await,
            Self::Swift(s) => s.upload_stream(cancel, reader, remote, size, progress).await,
            Self::Sftp(s) => s.upload_stream(cancel, reader, remote, size, progress).await,
        }
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError> {
        match self {
            Self::ObjectStore(s) => s.download(cancel, remote, local, progress).await,
            Self::Swift(s) => s.download(cancel, remote, local, progress).await,
            Self::Sftp(s) => s.download(cancel, remote, local, progress).await,
        }
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<CloudFile>, StorageError> {
        match self {
            Self::ObjectStore(s) => s.list(cancel, prefix).await,
            Self::Swift(s) => s.list(cancel, prefix).await,
            Self::Sftp(s) => s.list(cancel, prefix).await,
        }
    }

    async fn delete(&self, cancel: &CancellationToken, remote: &str) -> Result<(), StorageError> {
        match self {
            Self::ObjectStore(s) => s.delete(cancel, remote).await,
            Self::Swift(s) => s.delete(cancel, remote).await,
            Self::Sftp(s) => s.delete(cancel, remote).await,
        }
    }

    async fn exists(&self, cancel: &CancellationToken, remote: &str) -> Result<bool, StorageError> {
        match self {
            Self::ObjectStore(s) => s.exists(cancel, remote).await,
            Self::Swift(s) => s.exists(cancel, remote).await,
            Self::Sftp(s) => s.exists(cancel, remote).await,
        }
    }

    fn url(&self) -> String {
        match self {
            Self::ObjectStore(s) => s.url(),
            Self::Swift(s) => s.url(),
            Self::Sftp(s) => s.url(),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        match self {
            Self::ObjectStore(s) => s.close().await,
            Self::Swift(s) => s.close().await,
            Self::Sftp(s) => s.close().await,
        }
    }
}
