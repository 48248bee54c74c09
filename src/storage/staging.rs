//! Partial-file staging for downloads.
//!
//! A download writes to a hidden `.part` sibling of its target and renames it
//! into place only once every byte has landed, so a failed or cancelled
//! transfer never leaves a truncated file under the real name.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::StorageError;

const PARTIAL_SUFFIX: &str = ".part";

/// Sibling path a download into `local` is staged at.
pub(crate) fn partial_path(local: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(local.file_name().unwrap_or(local.as_os_str()));
    name.push(PARTIAL_SUFFIX);
    local.with_file_name(name)
}

/// Moves a completed download into place, replacing `local`.
pub(crate) async fn commit(partial: &Path, local: &Path) -> Result<(), StorageError> {
    tokio::fs::rename(partial, local)
        .await
        .map_err(|e| StorageError::io(local, e))
}

/// Removes the staging file of a failed download.
pub(crate) async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!(path = %partial.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %partial.display(), error = %e, "could not remove partial download"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_partial_path_is_hidden_sibling() {
        assert_eq!(
            partial_path(Path::new("/restore/vm1/disk-0.vmdk")),
            PathBuf::from("/restore/vm1/.disk-0.vmdk.part")
        );
    }

    #[tokio::test]
    async fn test_commit_replaces_target() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("vm1.ovf");
        std::fs::write(&local, b"old").unwrap();
        let partial = partial_path(&local);
        std::fs::write(&partial, b"new").unwrap();

        commit(&partial, &local).await.unwrap();

        assert_eq!(std::fs::read(&local).unwrap(), b"new");
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn test_discard_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let partial = partial_path(&dir.path().join("x"));
        discard(&partial).await;
        std::fs::write(&partial, b"half").unwrap();
        discard(&partial).await;
        assert!(!partial.exists());
    }
}
