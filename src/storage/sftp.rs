//! SFTP backend over an SSH session.
//!
//! The server's host key must already be listed in a `known_hosts` file
//! (`SFTP_KNOWN_HOSTS`, default `~/.ssh/known_hosts`). Authentication uses
//! the URL password or `SFTP_PASSWORD`, and/or the private key named by
//! `SFTP_PRIVATE_KEY` (optionally unlocked with `SFTP_KEY_PASSPHRASE`).
//! Remote paths are relative to the login directory.
//!
//! One SSH connection is kept open and shared by every operation. A transport
//! failure drops it, and the next attempt reconnects.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use russh::client;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, check_known_hosts_path, load_secret_key};
use russh_sftp::client::{Config as SftpConfig, SftpSession};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::StorageError;
use super::path::RemotePrefix;
use super::runner::OperationRunner;
use super::staging;
use super::{CloudFile, CloudStorage, UploadReader};
use crate::transfer::constants::{CHUNK_SIZE, CONNECT_TIMEOUT_SECS, MULTIPART_PART_SIZE, READ_TIMEOUT_SECS};
use crate::transfer::{
    Classify, FailureType, ProgressCallback, ProgressTracker, ReadAhead, ThrottledReader, ThrottledWriter,
};

/// Stream uploads up to this size are held in memory and stay retryable.
const STREAM_BUFFER_LIMIT: usize = MULTIPART_PART_SIZE;

/// Connection settings for an SFTP server.
#[derive(Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub key_passphrase: Option<String>,
    pub known_hosts: PathBuf,
}

impl fmt::Debug for SftpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("known_hosts", &self.known_hosts)
            .finish_non_exhaustive()
    }
}

impl SftpSettings {
    /// Completes the URL parts with `SFTP_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when no user or credential is given,
    /// or the `known_hosts` file does not exist.
    pub fn resolve(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, StorageError> {
        Self::resolve_with(host, port, username, password, env_non_empty)
    }

    fn resolve_with(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StorageError> {
        let user = username
            .filter(|user| !user.is_empty())
            .or_else(|| env("SFTP_USER"))
            .ok_or_else(|| StorageError::config("sftp:// needs a user in the URL or SFTP_USER"))?;
        let password = password.filter(|p| !p.is_empty()).or_else(|| env("SFTP_PASSWORD"));
        let private_key = env("SFTP_PRIVATE_KEY").map(PathBuf::from);
        if password.is_none() && private_key.is_none() {
            return Err(StorageError::config(
                "no SFTP authentication method provided (password or SFTP_PRIVATE_KEY required)",
            ));
        }

        let known_hosts = env("SFTP_KNOWN_HOSTS")
            .map(PathBuf::from)
            .or_else(|| env("HOME").map(|home| Path::new(&home).join(".ssh").join("known_hosts")))
            .ok_or_else(|| StorageError::config("cannot locate known_hosts: set SFTP_KNOWN_HOSTS or HOME"))?;
        if !known_hosts.is_file() {
            return Err(StorageError::config(format!(
                "known_hosts file not found: {} (connect once with ssh or set SFTP_KNOWN_HOSTS)",
                known_hosts.display()
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            user,
            password,
            private_key,
            key_passphrase: env("SFTP_KEY_PASSPHRASE"),
            known_hosts,
        })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Accepts only host keys recorded in the `known_hosts` file.
struct HostKeyCheck {
    host: String,
    port: u16,
    known_hosts: PathBuf,
    rejection: Arc<StdMutex<Option<String>>>,
}

impl HostKeyCheck {
    fn reject(&self, reason: String) {
        warn!(host = %self.host, reason = %reason, "host key rejected");
        *self.rejection.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &ssh_key::PublicKey) -> Result<bool, Self::Error> {
        match check_known_hosts_path(&self.host, self.port, server_public_key, &self.known_hosts) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.reject(format!("not listed in {}", self.known_hosts.display()));
                Ok(false)
            }
            Err(e) => {
                self.reject(e.to_string());
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH session with its SFTP channel.
struct Connection {
    ssh: client::Handle<HostKeyCheck>,
    sftp: SftpSession,
}

impl Connection {
    async fn shut_down(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!(error = %e, "sftp channel close failed");
        }
        if let Err(e) = self
            .ssh
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "ssh disconnect failed");
        }
    }
}

/// SFTP server backend.
pub struct SftpStorage {
    settings: SftpSettings,
    prefix: RemotePrefix,
    runner: OperationRunner,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl fmt::Debug for SftpStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpStorage")
            .field("settings", &self.settings)
            .field("prefix", &self.prefix)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl SftpStorage {
    /// Creates a backend without connecting; the first operation connects.
    #[must_use]
    pub fn new(settings: SftpSettings, prefix: &str, runner: OperationRunner) -> Self {
        Self {
            settings,
            prefix: RemotePrefix::new(prefix),
            runner,
            connection: Mutex::new(None),
        }
    }

    /// Creates a backend and opens its SSH session, retrying transport failures.
    ///
    /// # Errors
    ///
    /// Returns the connection, host key or authentication error.
    pub async fn connect(
        cancel: &CancellationToken,
        settings: SftpSettings,
        prefix: &str,
        runner: OperationRunner,
    ) -> Result<Self, StorageError> {
        let storage = Self::new(settings, prefix, runner);
        storage
            .runner
            .run(cancel, "connect", |_| async { storage.connection().await.map(|_| ()) })
            .await?;
        Ok(storage)
    }

    /// Remote path of a logical path; the login directory when both are empty.
    fn remote_path(&self, logical: &str) -> String {
        let joined = self.prefix.join(logical);
        if joined.is_empty() { ".".to_string() } else { joined }
    }

    async fn connection(&self) -> Result<Arc<Connection>, StorageError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }
        let connection = Arc::new(self.open().await?);
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn open(&self) -> Result<Connection, StorageError> {
        let address = self.settings.address();
        let stream = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect((self.settings.host.as_str(), self.settings.port)),
        )
        .await
        .map_err(|_| StorageError::Timeout { url: self.url() })?
        .map_err(|e| socket_error("connect", &address, &e))?;

        let rejection = Arc::new(StdMutex::new(None));
        let check = HostKeyCheck {
            host: self.settings.host.clone(),
            port: self.settings.port,
            known_hosts: self.settings.known_hosts.clone(),
            rejection: Arc::clone(&rejection),
        };
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(READ_TIMEOUT_SECS)),
            ..client::Config::default()
        });
        let mut ssh = client::connect_stream(config, stream, check).await.map_err(|e| {
            match rejection.lock().unwrap_or_else(PoisonError::into_inner).take() {
                Some(reason) => StorageError::HostKeyRejected {
                    host: self.settings.host.clone(),
                    reason,
                },
                None => ssh_error("handshake", &address, &e),
            }
        })?;

        self.authenticate(&mut ssh).await?;

        let channel = ssh
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("open channel", &address, &e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ssh_error("start subsystem", &address, &e))?;
        let sftp = SftpSession::new_with_config(channel.into_stream(), sftp_config())
            .await
            .map_err(|e| sftp_error("start session", &address, e))?;

        info!(host = %self.settings.host, user = %self.settings.user, "sftp session established");
        Ok(Connection { ssh, sftp })
    }

    async fn authenticate(&self, ssh: &mut client::Handle<HostKeyCheck>) -> Result<(), StorageError> {
        let address = self.settings.address();
        let user = self.settings.user.as_str();

        if let Some(path) = &self.settings.private_key {
            let key = load_secret_key(path, self.settings.key_passphrase.as_deref())
                .map_err(|e| StorageError::config(format!("private key {}: {e}", path.display())))?;
            let hash = ssh
                .best_supported_rsa_hash()
                .await
                .map_err(|e| ssh_error("authenticate", &address, &e))?
                .flatten();
            let result = ssh
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await
                .map_err(|e| ssh_error("authenticate", &address, &e))?;
            if result.success() {
                return Ok(());
            }
            debug!(user, "public key rejected");
        }

        if let Some(password) = &self.settings.password {
            let result = ssh
                .authenticate_password(user, password.as_str())
                .await
                .map_err(|e| ssh_error("authenticate", &address, &e))?;
            if result.success() {
                return Ok(());
            }
        }

        Err(StorageError::AuthenticationFailed {
            user: user.to_string(),
            host: self.settings.host.clone(),
        })
    }

    /// Runs `work` on the shared session, dropping it after a transport failure.
    async fn with_session<T, F, Fut>(&self, work: F) -> Result<T, StorageError>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let connection = self.connection().await?;
        let result = work(Arc::clone(&connection)).await;
        if let Err(error) = &result {
            if error.failure_type() == Some(FailureType::Transient) {
                self.forget(&connection).await;
            }
        }
        result
    }

    async fn forget(&self, connection: &Arc<Connection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, connection)) {
            *slot = None;
            debug!(host = %self.settings.host, "dropping sftp session after transport failure");
        }
    }
}

#[async_trait]
impl CloudStorage for SftpStorage {
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
        let path = self.remote_path(remote);
        let path = path.as_str();
        let tracker = &ProgressTracker::new(progress, size);

        self.runner
            .run(cancel, "upload", |_| {
                self.with_session(|connection| async move {
                    let file = tokio::fs::File::open(local)
                        .await
                        .map_err(|e| StorageError::io(local, e))?;
                    let mut reader = ThrottledReader::new(file, self.runner.governor().clone(), cancel.clone());
                    write_remote(&connection.sftp, path, &[], Some(&mut reader), tracker).await
                })
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
        let path = self.remote_path(remote);
        let path = path.as_str();
        let tracker = &ProgressTracker::new(progress, size);
        let source = Mutex::new(StreamSource {
            reader: ThrottledReader::new(reader, self.runner.governor().clone(), cancel.clone()),
            prefetched: None,
        });

        self.runner
            .run(cancel, "upload_stream", |_| async {
                let mut guard = source.lock().await;
                let state = &mut *guard;

                // A body that fits the buffer can be rewritten on every attempt.
                let prefetched = if let Some(prefetched) = &state.prefetched {
                    prefetched.clone()
                } else {
                    let prefetched = state
                        .reader
                        .read_ahead(STREAM_BUFFER_LIMIT, tracker)
                        .await
                        .map_err(|e| StorageError::stream("upload_stream", e))
                        .map_err(|error| error.unless_replayable(remote, state.reader.bytes_read(), 0))?;
                    state.prefetched = Some(prefetched.clone());
                    prefetched
                };

                let buffered = prefetched.head.len() as u64;
                if !prefetched.complete && state.reader.bytes_read() > buffered {
                    return Err(StorageError::reader_consumed(remote));
                }

                self.with_session(|connection| async move {
                    if prefetched.complete {
                        return write_remote::<UploadReader>(&connection.sftp, path, &prefetched.head, None, tracker)
                            .await;
                    }
                    write_remote(&connection.sftp, path, &prefetched.head, Some(&mut state.reader), tracker)
                        .await
                        .map_err(|error| error.unless_replayable(remote, state.reader.bytes_read(), buffered))
                })
                .await
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
        let path = self.remote_path(remote);
        let path = path.as_str();
        let partial = staging::partial_path(local);
        let partial = partial.as_path();
        let tracker = &ProgressTracker::new(progress, 0);

        let result = self
            .runner
            .run(cancel, "download", |_| {
                self.with_session(|connection| async move {
                    let mut remote_file = connection
                        .sftp
                        .open(path)
                        .await
                        .map_err(|e| sftp_error("open", path, e))?;
                    let metadata = remote_file
                        .metadata()
                        .await
                        .map_err(|e| sftp_error("stat", path, e))?;
                    tracker.set_total(metadata.len());

                    let file = tokio::fs::File::create(partial)
                        .await
                        .map_err(|e| StorageError::io(partial, e))?;
                    let mut writer = ThrottledWriter::new(
                        BufWriter::new(file),
                        self.runner.governor().clone(),
                        cancel.clone(),
                    );

                    let mut buf = vec![0u8; CHUNK_SIZE];
                    loop {
                        let n = remote_file
                            .read(&mut buf)
                            .await
                            .map_err(|e| socket_error("read", path, &e))?;
                        if n == 0 {
                            break;
                        }
                        writer
                            .write_chunk(&buf[..n])
                            .await
                            .map_err(|e| StorageError::stream("download", e))?;
                        tracker.update(writer.bytes_written());
                    }
                    let written = writer.bytes_written();
                    writer.finish().await.map_err(|e| StorageError::io(partial, e))?;
                    staging::commit(partial, local).await?;
                    Ok(written)
                })
            })
            .await;

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(error) => {
                staging::discard(partial).await;
                return Err(error);
            }
        };
        tracker.finish();
        info!(remote, bytes, "download complete");
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<CloudFile>, StorageError> {
        let root = self.remote_path(prefix);
        let root = root.as_str();

        self.runner
            .run(cancel, "list", |_| {
                self.with_session(|connection| async move {
                    let mut files = Vec::new();
                    let mut pending = vec![root.to_string()];
                    while let Some(dir) = pending.pop() {
                        let entries = match connection.sftp.read_dir(dir.as_str()).await {
                            Ok(entries) => entries,
                            Err(SftpError::Status(status))
                                if status.status_code == StatusCode::NoSuchFile && dir == root =>
                            {
                                return Ok(Vec::new());
                            }
                            Err(e) => return Err(sftp_error("list", &dir, e)),
                        };
                        for entry in entries {
                            let path = if dir == "." {
                                entry.file_name()
                            } else {
                                format!("{dir}/{}", entry.file_name())
                            };
                            let metadata = entry.metadata();
                            let kind = metadata.file_type();
                            if kind.is_dir() {
                                pending.push(path);
                            } else if kind.is_file() {
                                files.push(CloudFile {
                                    path: self.prefix.strip(&path),
                                    size: metadata.len(),
                                    last_modified: metadata
                                        .mtime
                                        .and_then(|secs| DateTime::from_timestamp(i64::from(secs), 0)),
                                    etag: None,
                                });
                            }
                        }
                    }
                    files.sort_by(|a, b| a.path.cmp(&b.path));
                    Ok(files)
                })
            })
            .await
    }

    async fn delete(&self, cancel: &CancellationToken, remote: &str) -> Result<(), StorageError> {
        let path = self.remote_path(remote);
        let path = path.as_str();

        self.runner
            .run(cancel, "delete", |_| {
                self.with_session(|connection| async move {
                    match connection.sftp.remove_file(path).await {
                        Ok(()) => Ok(()),
                        Err(SftpError::Status(status)) if status.status_code == StatusCode::NoSuchFile => {
                            debug!(remote, "delete of missing file");
                            Ok(())
                        }
                        Err(e) => Err(sftp_error("delete", path, e)),
                    }
                })
            })
            .await
    }

    async fn exists(&self, cancel: &CancellationToken, remote: &str) -> Result<bool, StorageError> {
        let path = self.remote_path(remote);
        let path = path.as_str();

        self.runner
            .run(cancel, "exists", |_| {
                self.with_session(|connection| async move {
                    match connection.sftp.metadata(path).await {
                        Ok(_) => Ok(true),
                        Err(SftpError::Status(status)) if status.status_code == StatusCode::NoSuchFile => Ok(false),
                        Err(e) => Err(sftp_error("stat", path, e)),
                    }
                })
            })
            .await
    }

    fn url(&self) -> String {
        format!("sftp://{}/{}", self.settings.host, self.prefix.as_str())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.shut_down().await;
        }
        Ok(())
    }
}

/// Reader handed to `upload_stream` and the head buffered from it, kept
/// across attempts.
struct StreamSource {
    reader: ThrottledReader<UploadReader>,
    prefetched: Option<ReadAhead>,
}

/// Writes `head` and then the rest of `reader` to `path`, creating parent
/// directories first.
async fn write_remote<R>(
    sftp: &SftpSession,
    path: &str,
    head: &[u8],
    reader: Option<&mut ThrottledReader<R>>,
    progress: &ProgressTracker,
) -> Result<(), StorageError>
where
    R: AsyncRead + Unpin,
{
    create_parents(sftp, path).await?;
    let mut file = sftp.create(path).await.map_err(|e| sftp_error("create", path, e))?;
    file.write_all(head).await.map_err(|e| socket_error("write", path, &e))?;

    if let Some(reader) = reader {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader
                .read_chunk(&mut buf)
                .await
                .map_err(|e| StorageError::stream("upload", e))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| socket_error("write", path, &e))?;
            progress.update(reader.bytes_read());
        }
    }

    file.shutdown().await.map_err(|e| socket_error("close", path, &e))
}

/// Creates each missing directory above `path`.
async fn create_parents(sftp: &SftpSession, path: &str) -> Result<(), StorageError> {
    let Some((parent, _)) = path.rsplit_once('/') else {
        return Ok(());
    };

    let mut current = String::new();
    for segment in parent.split('/').filter(|segment| !segment.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);

        match sftp.metadata(current.as_str()).await {
            Ok(metadata) if metadata.file_type().is_dir() => {}
            Ok(_) => {
                return Err(StorageError::Sftp {
                    operation: "mkdir",
                    target: current,
                    message: "exists and is not a directory".to_string(),
                    failure: FailureType::Permanent,
                });
            }
            Err(SftpError::Status(status)) if status.status_code == StatusCode::NoSuchFile => {
                sftp.create_dir(current.as_str())
                    .await
                    .map_err(|e| sftp_error("mkdir", &current, e))?;
            }
            Err(e) => return Err(sftp_error("mkdir", &current, e)),
        }
    }
    Ok(())
}

/// Maps an SFTP protocol error; a missing file becomes [`StorageError::NotFound`].
fn sftp_error(operation: &'static str, path: &str, error: SftpError) -> StorageError {
    let failure = match &error {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => return StorageError::not_found(path),
            StatusCode::PermissionDenied => FailureType::NeedsAuth,
            StatusCode::NoConnection | StatusCode::ConnectionLost => FailureType::Transient,
            StatusCode::Ok
            | StatusCode::Eof
            | StatusCode::Failure
            | StatusCode::BadMessage
            | StatusCode::OpUnsupported => FailureType::Permanent,
        },
        SftpError::IO(_) | SftpError::Timeout | SftpError::UnexpectedBehavior(_) => FailureType::Transient,
        SftpError::Limited(_) | SftpError::UnexpectedPacket => FailureType::Permanent,
    };
    StorageError::Sftp {
        operation,
        target: path.to_string(),
        message: error.to_string(),
        failure,
    }
}

/// Maps a socket or channel I/O error, classified by its kind.
fn socket_error(operation: &'static str, target: &str, error: &std::io::Error) -> StorageError {
    StorageError::Sftp {
        operation,
        target: target.to_string(),
        message: error.to_string(),
        failure: error.failure_type().unwrap_or(FailureType::Transient),
    }
}

/// Maps an SSH transport error. Host key and credential rejections are
/// reported separately, so what is left is the session itself failing.
fn ssh_error(operation: &'static str, target: &str, error: &russh::Error) -> StorageError {
    StorageError::Sftp {
        operation,
        target: target.to_string(),
        message: error.to_string(),
        failure: FailureType::Transient,
    }
}

fn sftp_config() -> SftpConfig {
    SftpConfig {
        request_timeout_secs: READ_TIMEOUT_SECS,
        ..SftpConfig::default()
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
