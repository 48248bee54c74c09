//! Object storage backends built on the `object_store` crate.
//!
//! One adapter covers S3, Azure Blob, GCS, OCI (through its S3-compatible
//! endpoint) and the local file system. The client's own retry loop is
//! switched off so that every retry decision goes through [`OperationRunner`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, RetryConfig, WriteMultipart};
use tokio::io::{AsyncRead, BufWriter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::error::StorageError;
use super::path::RemotePrefix;
use super::runner::OperationRunner;
use super::staging;
use super::{CloudFile, CloudStorage, UploadReader};
use crate::transfer::constants::{
    CHUNK_SIZE, CONNECT_TIMEOUT_SECS, MULTIPART_CONCURRENCY, MULTIPART_PART_SIZE, READ_TIMEOUT_SECS,
};
use crate::transfer::{ProgressCallback, ProgressTracker, ReadAhead, ThrottledReader, ThrottledWriter};

/// Region used for S3 when none is configured.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Storage backend over any [`ObjectStore`].
#[derive(Debug)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    prefix: RemotePrefix,
    runner: OperationRunner,
    url: String,
    part_size: usize,
}

impl ObjectStoreStorage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        url: impl Into<String>,
        runner: OperationRunner,
    ) -> Self {
        Self {
            store,
            prefix: RemotePrefix::new(prefix),
            runner,
            url: url.into(),
            part_size: MULTIPART_PART_SIZE,
        }
    }

    /// Sets the size above which uploads switch to multipart, and the part size.
    #[must_use]
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Amazon S3 (or any S3-compatible endpoint via `AWS_ENDPOINT_URL`).
    ///
    /// Credentials come from the standard `AWS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when the client cannot be built.
    pub fn s3(bucket: &str, prefix: &str, runner: OperationRunner) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_retry(backend_retry_disabled())
            .with_client_options(client_options());
        if env_non_empty("AWS_REGION").is_none() && env_non_empty("AWS_DEFAULT_REGION").is_none() {
            builder = builder.with_region(DEFAULT_S3_REGION);
        }
        if let Some(endpoint) = env_non_empty("AWS_ENDPOINT_URL") {
            builder = builder
                .with_allow_http(endpoint.starts_with("http://"))
                .with_endpoint(endpoint);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::config(format!("S3 bucket '{bucket}': {e}")))?;
        Ok(Self::new(
            Arc::new(store),
            prefix,
            format!("s3://{bucket}/{prefix}"),
            runner,
        ))
    }

    /// Azure Blob Storage, authenticated by `AZURE_STORAGE_ACCOUNT` and `AZURE_STORAGE_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when the account is missing or the
    /// client cannot be built.
    pub fn azure(container: &str, prefix: &str, runner: OperationRunner) -> Result<Self, StorageError> {
        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_container_name(container)
            .with_retry(backend_retry_disabled())
            .with_client_options(client_options());
        if let Some(account) = env_non_empty("AZURE_STORAGE_ACCOUNT") {
            builder = builder.with_account(account);
        }
        if let Some(key) = env_non_empty("AZURE_STORAGE_KEY") {
            builder = builder.with_access_key(key);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::config(format!("Azure container '{container}': {e}")))?;
        Ok(Self::new(
            Arc::new(store),
            prefix,
            format!("azure://{container}/{prefix}"),
            runner,
        ))
    }

    /// Google Cloud Storage, authenticated by `GOOGLE_APPLICATION_CREDENTIALS`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when the client cannot be built.
    pub fn gcs(bucket: &str, prefix: &str, runner: OperationRunner) -> Result<Self, StorageError> {
        let mut builder = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .with_retry(backend_retry_disabled())
            .with_client_options(client_options());
        if let Some(path) = env_non_empty("GOOGLE_APPLICATION_CREDENTIALS") {
            builder = builder.with_service_account_path(path);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::config(format!("GCS bucket '{bucket}': {e}")))?;
        Ok(Self::new(
            Arc::new(store),
            prefix,
            format!("gcs://{bucket}/{prefix}"),
            runner,
        ))
    }

    /// Oracle Cloud Object Storage through its S3 compatibility endpoint.
    ///
    /// Needs `OCI_REGION` plus the customer secret key pair in
    /// `OCI_ACCESS_KEY_ID` and `OCI_SECRET_ACCESS_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when the region or keys are missing.
    pub fn oci(
        namespace: &str,
        bucket: &str,
        prefix: &str,
        runner: OperationRunner,
    ) -> Result<Self, StorageError> {
        let region = env_non_empty("OCI_REGION")
            .ok_or_else(|| StorageError::config("OCI_REGION must be set for oci:// targets"))?;
        let access_key = env_non_empty("OCI_ACCESS_KEY_ID")
            .ok_or_else(|| StorageError::config("OCI_ACCESS_KEY_ID must be set for oci:// targets"))?;
        let secret_key = env_non_empty("OCI_SECRET_ACCESS_KEY").ok_or_else(|| {
            StorageError::config("OCI_SECRET_ACCESS_KEY must be set for oci:// targets")
        })?;

        let store = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&region)
            .with_endpoint(oci_endpoint(namespace, &region))
            .with_virtual_hosted_style_request(false)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key)
            .with_retry(backend_retry_disabled())
            .with_client_options(client_options())
            .build()
            .map_err(|e| StorageError::config(format!("OCI bucket '{bucket}': {e}")))?;
        Ok(Self::new(
            Arc::new(store),
            prefix,
            format!("oci://{namespace}/{bucket}/{prefix}"),
            runner,
        ))
    }

    /// Local directory treated as a bucket; created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the directory cannot be created and
    /// [`StorageError::Config`] when it cannot be used as a store root.
    pub fn local(root: &Path, runner: OperationRunner) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root).map_err(|e| StorageError::io(root, e))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| StorageError::config(format!("local root {}: {e}", root.display())))?;
        Ok(Self::new(
            Arc::new(store),
            "",
            format!("file://{}", root.display()),
            runner,
        ))
    }

    /// Process-local store, mostly useful in tests.
    #[must_use]
    pub fn in_memory(prefix: &str, runner: OperationRunner) -> Self {
        Self::new(
            Arc::new(InMemory::new()),
            prefix,
            format!("memory:///{prefix}"),
            runner,
        )
    }

    fn location(&self, remote: &str) -> ObjectPath {
        ObjectPath::from(self.prefix.join(remote))
    }

    async fn put_whole(&self, location: &ObjectPath, remote: &str, body: Bytes) -> Result<(), StorageError> {
        self.store
            .put(location, PutPayload::from(body))
            .await
            .map_err(|e| StorageError::backend("upload", remote, e))?;
        Ok(())
    }

    /// Multipart upload of `head` followed by whatever `reader` still yields.
    async fn put_streaming<R>(
        &self,
        reader: &mut ThrottledReader<R>,
        location: &ObjectPath,
        remote: &str,
        head: &[u8],
        progress: &ProgressTracker,
    ) -> Result<(), StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(|e| StorageError::backend("upload", remote, e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.part_size);
        let mut buf = vec![0u8; CHUNK_SIZE];

        let streamed: Result<(), StorageError> = async {
            writer
                .wait_for_capacity(MULTIPART_CONCURRENCY)
                .await
                .map_err(|e| StorageError::backend("upload", remote, e))?;
            writer.write(head);
            loop {
                let n = reader
                    .read_chunk(&mut buf)
                    .await
                    .map_err(|e| StorageError::stream("upload", e))?;
                if n == 0 {
                    return Ok(());
                }
                writer
                    .wait_for_capacity(MULTIPART_CONCURRENCY)
                    .await
                    .map_err(|e| StorageError::backend("upload", remote, e))?;
                writer.write(&buf[..n]);
                progress.update(reader.bytes_read());
            }
        }
        .await;

        match streamed {
            Ok(()) => {
                writer
                    .finish()
                    .await
                    .map_err(|e| StorageError::backend("upload", remote, e))?;
                Ok(())
            }
            Err(error) => {
                if let Err(abort_error) = writer.abort().await {
                    debug!(remote, error = %abort_error, "multipart abort failed");
                }
                Err(error)
            }
        }
    }
}

/// Reader of a stream upload plus what was already taken from it.
struct StreamSource {
    reader: ThrottledReader<UploadReader>,
    prefetched: Option<ReadAhead>,
}

#[async_trait]
impl CloudStorage for ObjectStoreStorage {
    #[instrument(skip(self, cancel, progress), fields(local = %local.display()))]
    async fn upload(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError> {
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| StorageError::io(local, e))?
            .len();
        let location = self.location(remote);
        let tracker = ProgressTracker::new(progress, size);

        self.runner
            .run(cancel, "upload", |_| async {
                let file = tokio::fs::File::open(local)
                    .await
                    .map_err(|e| StorageError::io(local, e))?;
                let mut reader =
                    ThrottledReader::new(file, self.runner.governor().clone(), cancel.clone());
                let prefetched = reader
                    .read_ahead(self.part_size, &tracker)
                    .await
                    .map_err(|e| StorageError::stream("upload", e))?;
                if prefetched.complete {
                    self.put_whole(&location, remote, prefetched.head).await
                } else {
                    self.put_streaming(&mut reader, &location, remote, &prefetched.head, &tracker)
                        .await
                }
            })
            .await?;

        tracker.finish();
        info!(remote, bytes = size, "upload complete");
        Ok(())
    }

    #[instrument(skip(self, cancel, reader, progress))]
    async fn upload_stream(
        &self,
        cancel: &CancellationToken,
        reader: UploadReader,
        remote: &str,
        size: u64,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError> {
        let location = self.location(remote);
        let tracker = ProgressTracker::new(progress, size);
        let source = Mutex::new(StreamSource {
            reader: ThrottledReader::new(reader, self.runner.governor().clone(), cancel.clone()),
            prefetched: None,
        });

        self.runner
            .run(cancel, "upload_stream", |_| async {
                let mut guard = source.lock().await;
                let state = &mut *guard;

                // A small body stays buffered, so every attempt can resend it.
                let prefetched = if let Some(prefetched) = &state.prefetched {
                    prefetched.clone()
                } else {
                    let prefetched = state
                        .reader
                        .read_ahead(self.part_size, &tracker)
                        .await
                        .map_err(|e| StorageError::stream("upload_stream", e))
                        .map_err(|error| error.unless_replayable(remote, state.reader.bytes_read(), 0))?;
                    state.prefetched = Some(prefetched.clone());
                    prefetched
                };

                if prefetched.complete {
                    return self.put_whole(&location, remote, prefetched.head).await;
                }

                let buffered = prefetched.head.len() as u64;
                if state.reader.bytes_read() > buffered {
                    return Err(StorageError::reader_consumed(remote));
                }
                self.put_streaming(&mut state.reader, &location, remote, &prefetched.head, &tracker)
                    .await
                    .map_err(|error| error.unless_replayable(remote, state.reader.bytes_read(), buffered))
            })
            .await?;

        tracker.finish();
        info!(remote, bytes = tracker.total(), "stream upload complete");
        Ok(())
    }

    #[instrument(skip(self, cancel, progress), fields(local = %local.display()))]
    async fn download(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<(), StorageError> {
        let location = self.location(remote);
        let partial = staging::partial_path(local);
        let tracker = ProgressTracker::new(progress, 0);

        let result = self
            .runner
            .run(cancel, "download", |_| async {
                let result = self
                    .store
                    .get(&location)
                    .await
                    .map_err(|e| StorageError::backend("download", remote, e))?;
                tracker.set_total(result.meta.size);

                let file = tokio::fs::File::create(&partial)
                    .await
                    .map_err(|e| StorageError::io(&partial, e))?;
                let mut writer = ThrottledWriter::new(
                    BufWriter::new(file),
                    self.runner.governor().clone(),
                    cancel.clone(),
                );

                let mut stream = result.into_stream();
                while let Some(chunk) = stream
                    .try_next()
                    .await
                    .map_err(|e| StorageError::backend("download", remote, e))?
                {
                    writer
                        .write_chunk(&chunk)
                        .await
                        .map_err(|e| StorageError::stream("download", e))?;
                    tracker.update(writer.bytes_written());
                }
                let written = writer.bytes_written();
                writer.finish().await.map_err(|e| StorageError::io(&partial, e))?;
                staging::commit(&partial, local).await?;
                Ok(written)
            })
            .await;

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(error) => {
                staging::discard(&partial).await;
                return Err(error);
            }
        };
        tracker.finish();
        info!(remote, bytes, "download complete");
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<CloudFile>, StorageError> {
        let full = self.prefix.join(prefix);

        self.runner
            .run(cancel, "list", |_| async {
                let location = (!full.is_empty()).then(|| ObjectPath::from(full.as_str()));
                let metas: Vec<_> = self
                    .store
                    .list(location.as_ref())
                    .try_collect()
                    .await
                    .map_err(|e| StorageError::backend("list", full.as_str(), e))?;
                Ok(metas
                    .into_iter()
                    .map(|meta| CloudFile {
                        path: self.prefix.strip(meta.location.as_ref()),
                        size: meta.size,
                        last_modified: Some(meta.last_modified),
                        etag: meta.e_tag,
                    })
                    .collect())
            })
            .await
    }

    async fn delete(&self, cancel: &CancellationToken, remote: &str) -> Result<(), StorageError> {
        let location = self.location(remote);

        self.runner
            .run(cancel, "delete", |_| async {
                match self.store.delete(&location).await {
                    Ok(()) => Ok(()),
                    Err(object_store::Error::NotFound { .. }) => {
                        debug!(remote, "delete of missing object");
                        Ok(())
                    }
                    Err(e) => Err(StorageError::backend("delete", remote, e)),
                }
            })
            .await
    }

    async fn exists(&self, cancel: &CancellationToken, remote: &str) -> Result<bool, StorageError> {
        let location = self.location(remote);

        self.runner
            .run(cancel, "exists", |_| async {
                match self.store.head(&location).await {
                    Ok(_) => Ok(true),
                    Err(object_store::Error::NotFound { .. }) => Ok(false),
                    Err(e) => Err(StorageError::backend("exists", remote, e)),
                }
            })
            .await
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// The runner owns retries; the client must give up after one attempt.
fn backend_retry_disabled() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    }
}

fn client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .with_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
}

fn oci_endpoint(namespace: &str, region: &str) -> String {
    format!("https://{namespace}.compat.objectstorage.{region}.oraclecloud.com")
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
