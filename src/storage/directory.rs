//! Directory-level upload, download and delete on top of [`CloudStorage`].
//!
//! All three operations run file by file and stop at the first failure,
//! returning it wrapped with the offending path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use super::error::StorageError;
use super::path::{join_remote, relative_remote_path, strip_remote_prefix};
use super::{CloudFile, CloudStorage};
use crate::transfer::ProgressCallback;

/// Files and bytes moved by a directory operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Uploads every regular file under `local_dir` to `remote_prefix`,
/// keeping the relative layout with `/` separators.
///
/// Progress covers the whole tree: `(bytes so far, total bytes of all files)`.
///
/// # Errors
///
/// Returns [`StorageError::Io`] when `local_dir` is not a directory or the
/// tree cannot be walked, otherwise the
/// first per-file failure wrapped in [`StorageError::PathContext`].
#[instrument(skip(storage, cancel, progress), fields(local_dir = %local_dir.display()))]
pub async fn upload_directory<S>(
    storage: &S,
    cancel: &CancellationToken,
    local_dir: &Path,
    remote_prefix: &str,
    progress: Option<ProgressCallback>,
) -> Result<TransferSummary, StorageError>
where
    S: CloudStorage + ?Sized,
{
    let root = local_dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || collect_files(&root))
        .await
        .map_err(|e| StorageError::io(local_dir, std::io::Error::other(e)))??;

    let grand_total: u64 = files.iter().map(|(_, _, size)| size).sum();
    info!(files = files.len(), bytes = grand_total, "uploading directory");

    let mut summary = TransferSummary::default();
    for (path, relative, size) in files {
        if cancel.is_cancelled() {
            return Err(StorageError::cancelled("upload directory"));
        }
        let remote = join_remote(remote_prefix, &relative);
        debug!(remote = %remote, "uploading file");

        let per_file = aggregate(progress.as_ref(), summary.bytes, grand_total);
        storage
            .upload(cancel, &path, &remote, per_file)
            .await
            .map_err(|e| StorageError::at_path("upload", path.display().to_string(), e))?;

        summary.files += 1;
        summary.bytes += size;
    }

    info!(files = summary.files, bytes = summary.bytes, "directory upload complete");
    Ok(summary)
}

/// Downloads every object under `remote_prefix` into `local_dir`,
/// recreating the relative structure.
///
/// # Errors
///
/// Returns the listing error, [`StorageError::UnsafePath`] for a listed key
/// that would escape `local_dir`, or the first per-file failure wrapped in
/// [`StorageError::PathContext`].
#[instrument(skip(storage, cancel, progress), fields(local_dir = %local_dir.display()))]
pub async fn download_directory<S>(
    storage: &S,
    cancel: &CancellationToken,
    remote_prefix: &str,
    local_dir: &Path,
    progress: Option<ProgressCallback>,
) -> Result<TransferSummary, StorageError>
where
    S: CloudStorage + ?Sized,
{
    let listed = storage.list(cancel, remote_prefix).await?;
    let grand_total: u64 = listed.iter().map(|f| f.size).sum();
    info!(files = listed.len(), bytes = grand_total, "downloading directory");

    let mut summary = TransferSummary::default();
    for file in listed {
        if cancel.is_cancelled() {
            return Err(StorageError::cancelled("download directory"));
        }
        let local = local_target(local_dir, remote_prefix, &file)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        debug!(remote = %file.path, local = %local.display(), "downloading file");

        let per_file = aggregate(progress.as_ref(), summary.bytes, grand_total);
        storage
            .download(cancel, &file.path, &local, per_file)
            .await
            .map_err(|e| StorageError::at_path("download", file.path.clone(), e))?;

        summary.files += 1;
        summary.bytes += file.size;
    }

    info!(files = summary.files, bytes = summary.bytes, "directory download complete");
    Ok(summary)
}

/// Deletes every object under `remote_prefix`.
///
/// # Errors
///
/// Returns the listing error or the first delete failure wrapped in
/// [`StorageError::PathContext`].
#[instrument(skip(storage, cancel))]
pub async fn delete_directory<S>(
    storage: &S,
    cancel: &CancellationToken,
    remote_prefix: &str,
) -> Result<TransferSummary, StorageError>
where
    S: CloudStorage + ?Sized,
{
    let listed = storage.list(cancel, remote_prefix).await?;

    let mut summary = TransferSummary::default();
    for file in listed {
        storage
            .delete(cancel, &file.path)
            .await
            .map_err(|e| StorageError::at_path("delete", file.path.clone(), e))?;
        summary.files += 1;
        summary.bytes += file.size;
    }

    info!(files = summary.files, "directory delete complete");
    Ok(summary)
}

/// Walks `root` depth-first in name order, returning regular files with
/// their relative remote path and size. Symlinks are followed.
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String, u64)>, StorageError> {
    let metadata = std::fs::metadata(root).map_err(|e| StorageError::io(root, e))?;
    if !metadata.is_dir() {
        return Err(StorageError::io(
            root,
            std::io::Error::new(std::io::ErrorKind::NotADirectory, "upload source is not a directory"),
        ));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
            StorageError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_remote_path(root, entry.path()) else {
            continue;
        };
        let size = entry
            .metadata()
            .map_err(|e| StorageError::io(entry.path(), e.into()))?
            .len();
        files.push((entry.into_path(), relative, size));
    }
    Ok(files)
}

/// Local destination for a listed object, refusing keys with `..` segments.
fn local_target(local_dir: &Path, remote_prefix: &str, file: &CloudFile) -> Result<PathBuf, StorageError> {
    let relative = strip_remote_prefix(remote_prefix, &file.path)
        .filter(|rest| !rest.is_empty())
        .unwrap_or_else(|| file.path.clone());
    if relative.split('/').any(|segment| segment == "..") {
        return Err(StorageError::UnsafePath { path: file.path.clone() });
    }
    Ok(relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(local_dir.to_path_buf(), |path, segment| path.join(segment)))
}

/// Wraps the caller's callback so one file's progress is reported against
/// the whole operation.
fn aggregate(progress: Option<&ProgressCallback>, base: u64, grand_total: u64) -> Option<ProgressCallback> {
    let outer = Arc::clone(progress?);
    let callback: ProgressCallback = Arc::new(move |transferred: u64, _total: u64| {
        let done = base + transferred;
        outer(done, grand_total.max(done));
    });
    Some(callback)
}
