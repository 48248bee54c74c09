//! OpenStack Swift backend over the Swift HTTP API.
//!
//! Authentication is either a pre-issued token (`OS_STORAGE_URL` +
//! `OS_AUTH_TOKEN`) or the v1 auth handshake (`ST_AUTH`, `ST_USER`,
//! `ST_KEY`). Objects live at `{storage_url}/{container}/{key}`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use reqwest::header::{CONTENT_LENGTH, RETRY_AFTER};
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use tokio::io::BufWriter;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::error::StorageError;
use super::path::RemotePrefix;
use super::runner::OperationRunner;
use super::staging;
use super::{CloudFile, CloudStorage, UploadReader};
use crate::transfer::constants::{CHUNK_SIZE, CONNECT_TIMEOUT_SECS, MULTIPART_PART_SIZE, READ_TIMEOUT_SECS};
use crate::transfer::{ProgressCallback, ProgressTracker, ReadAhead, ThrottledReader, ThrottledWriter};
use crate::user_agent::default_storage_user_agent;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const AUTH_USER_HEADER: &str = "X-Auth-User";
const AUTH_KEY_HEADER: &str = "X-Auth-Key";
const STORAGE_URL_HEADER: &str = "X-Storage-Url";

/// Objects returned per listing request.
const LIST_PAGE_SIZE: usize = 1000;

/// Stream uploads up to this size are held in memory and stay retryable.
const STREAM_BUFFER_LIMIT: usize = MULTIPART_PART_SIZE;

/// Storage endpoint and token for an authenticated Swift account.
#[derive(Clone)]
pub struct SwiftCredentials {
    pub storage_url: String,
    pub token: String,
}

impl fmt::Debug for SwiftCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwiftCredentials")
            .field("storage_url", &self.storage_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    bytes: u64,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

/// Reader handed to `upload_stream` and the head buffered from it, kept
/// across attempts.
struct StreamSource {
    reader: Arc<AsyncMutex<ThrottledReader<UploadReader>>>,
    prefetched: Option<ReadAhead>,
}

/// Swift container backend.
#[derive(Debug)]
pub struct SwiftStorage {
    client: Client,
    credentials: SwiftCredentials,
    container: String,
    prefix: RemotePrefix,
    runner: OperationRunner,
}

impl SwiftStorage {
    /// Creates a backend from existing credentials.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when the HTTP client cannot be built.
    pub fn new(
        credentials: SwiftCredentials,
        container: &str,
        prefix: &str,
        runner: OperationRunner,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            client: build_client()?,
            credentials: SwiftCredentials {
                storage_url: credentials.storage_url.trim_end_matches('/').to_string(),
                token: credentials.token,
            },
            container: container.to_string(),
            prefix: RemotePrefix::new(prefix),
            runner,
        })
    }

    /// Creates a backend from `OS_STORAGE_URL`/`OS_AUTH_TOKEN`, falling back to
    /// v1 auth with `ST_AUTH`/`ST_USER`/`ST_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when neither set of variables is
    /// present, or the auth error when the handshake fails.
    pub async fn from_env(
        cancel: &CancellationToken,
        container: &str,
        prefix: &str,
        runner: OperationRunner,
    ) -> Result<Self, StorageError> {
        if let (Some(storage_url), Some(token)) =
            (env_non_empty("OS_STORAGE_URL"), env_non_empty("OS_AUTH_TOKEN"))
        {
            return Self::new(SwiftCredentials { storage_url, token }, container, prefix, runner);
        }

        match (
            env_non_empty("ST_AUTH"),
            env_non_empty("ST_USER"),
            env_non_empty("ST_KEY"),
        ) {
            (Some(auth_url), Some(user), Some(key)) => {
                let credentials = authenticate_v1(cancel, &runner, &auth_url, &user, &key).await?;
                Self::new(credentials, container, prefix, runner)
            }
            _ => Err(StorageError::config(
                "swift:// needs OS_STORAGE_URL and OS_AUTH_TOKEN, or ST_AUTH, ST_USER and ST_KEY",
            )),
        }
    }

    fn container_url(&self) -> String {
        format!(
            "{}/{}",
            self.credentials.storage_url,
            urlencoding::encode(&self.container)
        )
    }

    fn object_url(&self, remote: &str) -> String {
        let key = self.prefix.join(remote);
        let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
        format!("{}/{}", self.container_url(), encoded.join("/"))
    }

    async fn put_buffered(&self, url: &str, remote: &str, body: Bytes) -> Result<(), StorageError> {
        let size = body.len() as u64;
        self.put_body(url, remote, Body::from(body), size).await
    }

    async fn put_body(&self, url: &str, remote: &str, body: Body, size: u64) -> Result<(), StorageError> {
        let response = self
            .client
            .put(url)
            .header(AUTH_TOKEN_HEADER, &self.credentials.token)
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::network(url, e))?;
        check_status(response, url, remote)?;
        Ok(())
    }
}

#[async_trait]
impl CloudStorage for SwiftStorage {
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
        let url = self.object_url(remote);
        let tracker = ProgressTracker::new(progress, size);

        self.runner
            .run(cancel, "upload", |_| async {
                let file = tokio::fs::File::open(local)
                    .await
                    .map_err(|e| StorageError::io(local, e))?;
                let reader = ThrottledReader::new(file, self.runner.governor().clone(), cancel.clone());
                let body = Body::wrap_stream(reader.into_stream(tracker.clone()));
                self.put_body(&url, remote, body, size).await
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
        let url = self.object_url(remote);
        let tracker = ProgressTracker::new(progress, size);
        let source = AsyncMutex::new(StreamSource {
            reader: Arc::new(AsyncMutex::new(ThrottledReader::new(
                reader,
                self.runner.governor().clone(),
                cancel.clone(),
            ))),
            prefetched: None,
        });

        self.runner
            .run(cancel, "upload_stream", |_| async {
                let mut guard = source.lock().await;
                let state = &mut *guard;

                // A body that fits the buffer can be resent on every attempt.
                let prefetched = if let Some(prefetched) = &state.prefetched {
                    prefetched.clone()
                } else {
                    let mut reader = state.reader.lock().await;
                    let prefetched = reader
                        .read_ahead(STREAM_BUFFER_LIMIT, &tracker)
                        .await
                        .map_err(|e| StorageError::stream("upload_stream", e))
                        .map_err(|error| error.unless_replayable(remote, reader.bytes_read(), 0))?;
                    state.prefetched = Some(prefetched.clone());
                    prefetched
                };

                if prefetched.complete {
                    return self.put_buffered(&url, remote, prefetched.head).await;
                }

                let buffered = prefetched.head.len() as u64;
                if state.reader.lock().await.bytes_read() > buffered {
                    return Err(StorageError::reader_consumed(remote));
                }
                let head = prefetched.head;
                let rest = shared_body(Arc::clone(&state.reader), tracker.clone());
                let body = Body::wrap_stream(stream::once(async move { Ok::<_, std::io::Error>(head) }).chain(rest));
                let result = self.put_body(&url, remote, body, size).await;
                let consumed = state.reader.lock().await.bytes_read();
                result.map_err(|error| error.unless_replayable(remote, consumed, buffered))
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
        let url = self.object_url(remote);
        let partial = staging::partial_path(local);
        let tracker = ProgressTracker::new(progress, 0);

        let result = self
            .runner
            .run(cancel, "download", |_| async {
                let response = self
                    .client
                    .get(&url)
                    .header(AUTH_TOKEN_HEADER, &self.credentials.token)
                    .send()
                    .await
                    .map_err(|e| StorageError::network(&url, e))?;
                let response = check_status(response, &url, remote)?;
                if let Some(total) = response.content_length() {
                    tracker.set_total(total);
                }

                let file = tokio::fs::File::create(&partial)
                    .await
                    .map_err(|e| StorageError::io(&partial, e))?;
                let mut writer = ThrottledWriter::new(
                    BufWriter::new(file),
                    self.runner.governor().clone(),
                    cancel.clone(),
                );

                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| StorageError::network(&url, e))?;
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
        let query_prefix = if full.is_empty() { String::new() } else { format!("{full}/") };
        let base = self.container_url();

        let mut files = Vec::new();
        let mut marker = String::new();
        loop {
            let page: Vec<ListedObject> = self
                .runner
                .run(cancel, "list", |_| async {
                    let mut url = url::Url::parse(&base)
                        .map_err(|e| StorageError::invalid_url(base.as_str(), e.to_string()))?;
                    {
                        let mut query = url.query_pairs_mut();
                        query.append_pair("format", "json");
                        query.append_pair("limit", &LIST_PAGE_SIZE.to_string());
                        if !query_prefix.is_empty() {
                            query.append_pair("prefix", &query_prefix);
                        }
                        if !marker.is_empty() {
                            query.append_pair("marker", &marker);
                        }
                    }
                    let response = self
                        .client
                        .get(url.as_str())
                        .header(AUTH_TOKEN_HEADER, &self.credentials.token)
                        .send()
                        .await
                        .map_err(|e| StorageError::network(url.as_str(), e))?;
                    let response = check_status(response, url.as_str(), &full)?;
                    if response.status() == StatusCode::NO_CONTENT {
                        return Ok(Vec::new());
                    }
                    response
                        .json::<Vec<ListedObject>>()
                        .await
                        .map_err(|e| StorageError::decode(url.as_str(), e))
                })
                .await?;

            let Some(last) = page.last() else {
                break;
            };
            marker = last.name.clone();
            let full_page = page.len() >= LIST_PAGE_SIZE;
            debug!(count = page.len(), "listed swift page");

            files.extend(page.into_iter().map(|object| CloudFile {
                path: self.prefix.strip(&object.name),
                size: object.bytes,
                last_modified: object.last_modified.as_deref().and_then(parse_last_modified),
                etag: object.hash,
            }));
            if !full_page {
                break;
            }
        }
        Ok(files)
    }

    async fn delete(&self, cancel: &CancellationToken, remote: &str) -> Result<(), StorageError> {
        let url = self.object_url(remote);

        self.runner
            .run(cancel, "delete", |_| async {
                let response = self
                    .client
                    .delete(&url)
                    .header(AUTH_TOKEN_HEADER, &self.credentials.token)
                    .send()
                    .await
                    .map_err(|e| StorageError::network(&url, e))?;
                if response.status() == StatusCode::NOT_FOUND {
                    debug!(remote, "delete of missing object");
                    return Ok(());
                }
                check_status(response, &url, remote)?;
                Ok(())
            })
            .await
    }

    async fn exists(&self, cancel: &CancellationToken, remote: &str) -> Result<bool, StorageError> {
        let url = self.object_url(remote);

        self.runner
            .run(cancel, "exists", |_| async {
                let response = self
                    .client
                    .head(&url)
                    .header(AUTH_TOKEN_HEADER, &self.credentials.token)
                    .send()
                    .await
                    .map_err(|e| StorageError::network(&url, e))?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(false);
                }
                check_status(response, &url, remote)?;
                Ok(true)
            })
            .await
    }

    fn url(&self) -> String {
        format!("swift://{}/{}", self.container, self.prefix.as_str())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Performs the Swift v1 auth handshake and returns the issued credentials.
///
/// # Errors
///
/// Returns the HTTP or network error from the auth endpoint, or
/// [`StorageError::Config`] when the response lacks the expected headers.
pub async fn authenticate_v1(
    cancel: &CancellationToken,
    runner: &OperationRunner,
    auth_url: &str,
    user: &str,
    key: &str,
) -> Result<SwiftCredentials, StorageError> {
    let client = build_client()?;

    runner
        .run(cancel, "swift auth", |_| async {
            let response = client
                .get(auth_url)
                .header(AUTH_USER_HEADER, user)
                .header(AUTH_KEY_HEADER, key)
                .send()
                .await
                .map_err(|e| StorageError::network(auth_url, e))?;
            let response = check_status(response, auth_url, auth_url)?;
            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string)
                    .ok_or_else(|| StorageError::config(format!("swift auth response is missing {name}")))
            };
            Ok(SwiftCredentials {
                storage_url: header(STORAGE_URL_HEADER)?,
                token: header(AUTH_TOKEN_HEADER)?,
            })
        })
        .await
}

fn build_client() -> Result<Client, StorageError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .user_agent(default_storage_user_agent())
        .build()
        .map_err(|e| StorageError::config(format!("failed to build HTTP client: {e}")))
}

/// Maps a non-success response to a typed error; 404 becomes [`StorageError::NotFound`].
fn check_status(response: Response, url: &str, remote: &str) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::not_found(remote));
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    Err(StorageError::http_status(url, status.as_u16(), retry_after))
}

/// Request body that reads the shared reader chunk by chunk, leaving it with
/// the caller when the request ends.
fn shared_body(
    reader: Arc<AsyncMutex<ThrottledReader<UploadReader>>>,
    progress: ProgressTracker,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    stream::try_unfold(
        (reader, vec![0u8; CHUNK_SIZE], progress),
        |(reader, mut buf, progress)| async move {
            let n = {
                let mut guard = reader.lock().await;
                let n = guard.read_chunk(&mut buf).await?;
                progress.update(guard.bytes_read());
                n
            };
            if n == 0 {
                return Ok(None);
            }
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            Ok(Some((chunk, (reader, buf, progress))))
        },
    )
}

/// Swift reports `last_modified` as a naive UTC timestamp.
fn parse_last_modified(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    fn storage(prefix: &str) -> SwiftStorage {
        SwiftStorage::new(
            SwiftCredentials {
                storage_url: "https://swift.example.com/v1/AUTH_acct/".to_string(),
                token: "tok".to_string(),
            },
            "vm exports",
            prefix,
            OperationRunner::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_object_url_encodes_segments_and_joins_prefix() {
        let swift = storage("nightly");
        assert_eq!(
            swift.object_url("web 01/disk#0.vmdk"),
            "https://swift.example.com/v1/AUTH_acct/vm%20exports/nightly/web%2001/disk%230.vmdk"
        );
    }

    #[test]
    fn test_url_reports_container_and_prefix() {
        assert_eq!(storage("a/b").url(), "swift://vm exports/a/b");
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let creds = SwiftCredentials {
            storage_url: "https://x".to_string(),
            token: "secret-token".to_string(),
        };
        assert!(!format!("{creds:?}").contains("secret-token"));
    }

    #[test]
    fn test_parse_last_modified() {
        let parsed = parse_last_modified("2024-03-05T10:20:30.123456").unwrap();
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.month(), 3);
        assert_eq!(parsed.hour(), 10);
        assert!(parse_last_modified("yesterday").is_none());
    }
}
