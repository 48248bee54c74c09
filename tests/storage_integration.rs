//! Integration tests for storage backends and directory orchestration.
//!
//! These tests drive the `file://` backend end to end through [`connect`].

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use transfer_core::storage::{
    CloudStorage, StorageError, StorageOptions, connect, delete_directory, download_directory,
    upload_directory,
};
use transfer_core::transfer::{Governor, ProgressCallback, RetryPolicy, Retryer};

fn fast_options() -> StorageOptions {
    let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
        .with_jitter(false);
    StorageOptions {
        retryer: Arc::new(Retryer::new(policy)),
        ..StorageOptions::default()
    }
}

fn file_url(root: &Path) -> String {
    format!("file://{}", root.display())
}

/// Writes a small VM export bundle and returns its total size.
fn write_export(dir: &Path) -> u64 {
    fs::create_dir_all(dir.join("web-01/disks")).expect("create export dirs");
    fs::write(dir.join("manifest.json"), br#"{"vms":["web-01"]}"#).expect("write manifest");
    fs::write(dir.join("web-01/web-01.ovf"), b"<Envelope/>").expect("write ovf");
    fs::write(dir.join("web-01/disks/disk-0.vmdk"), vec![7u8; 4096]).expect("write disk");
    18 + 11 + 4096
}

#[tokio::test]
async fn test_directory_round_trip_through_local_backend() {
    let export = TempDir::new().expect("failed to create temp dir");
    let bucket = TempDir::new().expect("failed to create temp dir");
    let restore = TempDir::new().expect("failed to create temp dir");
    let total = write_export(export.path());

    let storage = connect(&file_url(bucket.path()), fast_options())
        .await
        .expect("file backend should connect");
    let cancel = CancellationToken::new();

    let summary = upload_directory(&storage, &cancel, export.path(), "backup-1", None)
        .await
        .expect("upload should succeed");
    assert_eq!(summary.files, 3);
    assert_eq!(summary.bytes, total);

    let mut listed: Vec<_> = storage
        .list(&cancel, "backup-1")
        .await
        .expect("list should succeed")
        .into_iter()
        .map(|f| (f.path, f.size))
        .collect();
    listed.sort();
    assert_eq!(
        listed,
        vec![
            ("backup-1/manifest.json".to_string(), 18),
            ("backup-1/web-01/disks/disk-0.vmdk".to_string(), 4096),
            ("backup-1/web-01/web-01.ovf".to_string(), 11),
        ]
    );

    let summary = download_directory(&storage, &cancel, "backup-1", restore.path(), None)
        .await
        .expect("download should succeed");
    assert_eq!(summary.files, 3);
    assert_eq!(
        fs::read(restore.path().join("web-01/disks/disk-0.vmdk")).unwrap(),
        vec![7u8; 4096]
    );
    assert_eq!(
        fs::read(restore.path().join("manifest.json")).unwrap(),
        br#"{"vms":["web-01"]}"#
    );
}

#[tokio::test]
async fn test_delete_directory_leaves_nothing_listed() {
    let export = TempDir::new().expect("failed to create temp dir");
    let bucket = TempDir::new().expect("failed to create temp dir");
    write_export(export.path());

    let storage = connect(&file_url(bucket.path()), fast_options()).await.unwrap();
    let cancel = CancellationToken::new();
    upload_directory(&storage, &cancel, export.path(), "old", None)
        .await
        .unwrap();
    upload_directory(&storage, &cancel, export.path(), "keep", None)
        .await
        .unwrap();

    let deleted = delete_directory(&storage, &cancel, "old").await.unwrap();
    assert_eq!(deleted.files, 3);
    assert!(storage.list(&cancel, "old").await.unwrap().is_empty());
    assert_eq!(storage.list(&cancel, "keep").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_download_missing_object_is_not_found() {
    let bucket = TempDir::new().expect("failed to create temp dir");
    let restore = TempDir::new().expect("failed to create temp dir");
    let storage = connect(&file_url(bucket.path()), fast_options()).await.unwrap();
    let cancel = CancellationToken::new();

    let err = storage
        .download(&cancel, "missing.vmdk", &restore.path().join("x"), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");
    assert!(!matches!(err, StorageError::RetriesExhausted { .. }));
}

#[tokio::test]
async fn test_exists_and_idempotent_delete() {
    let export = TempDir::new().expect("failed to create temp dir");
    let bucket = TempDir::new().expect("failed to create temp dir");
    let disk = export.path().join("disk.img");
    fs::write(&disk, vec![1u8; 512]).unwrap();

    let storage = connect(&file_url(bucket.path()), fast_options()).await.unwrap();
    let cancel = CancellationToken::new();

    assert!(!storage.exists(&cancel, "vm/disk.img").await.unwrap());
    storage.upload(&cancel, &disk, "vm/disk.img", None).await.unwrap();
    assert!(storage.exists(&cancel, "vm/disk.img").await.unwrap());

    storage.delete(&cancel, "vm/disk.img").await.unwrap();
    storage.delete(&cancel, "vm/disk.img").await.unwrap();
    assert!(!storage.exists(&cancel, "vm/disk.img").await.unwrap());
}

#[tokio::test]
async fn test_upload_progress_reaches_total() {
    let export = TempDir::new().expect("failed to create temp dir");
    let bucket = TempDir::new().expect("failed to create temp dir");
    let total = write_export(export.path());

    let storage = connect(&file_url(bucket.path()), fast_options()).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress: ProgressCallback = Arc::new(move |done, total| {
        sink.lock().unwrap().push((done, total));
    });

    upload_directory(
        &storage,
        &CancellationToken::new(),
        export.path(),
        "",
        Some(progress),
    )
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last().copied(), Some((total, total)));
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[tokio::test]
async fn test_upload_directory_honours_cancellation() {
    let export = TempDir::new().expect("failed to create temp dir");
    let bucket = TempDir::new().expect("failed to create temp dir");
    write_export(export.path());

    let storage = connect(&file_url(bucket.path()), fast_options()).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = upload_directory(&storage, &cancel, export.path(), "", None)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(storage.list(&CancellationToken::new(), "").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_throttled_upload_respects_ceiling() {
    let export = TempDir::new().expect("failed to create temp dir");
    let bucket = TempDir::new().expect("failed to create temp dir");
    let disk = export.path().join("disk.img");
    fs::write(&disk, vec![3u8; 96 * 1024]).unwrap();

    // 64 KiB/s with a 32 KiB burst: 96 KiB needs about one second
    let options = StorageOptions {
        governor: Governor::fixed(64 * 1024, Some(32 * 1024)),
        ..fast_options()
    };
    let storage = connect(&file_url(bucket.path()), options).await.unwrap();

    let started = std::time::Instant::now();
    storage
        .upload(&CancellationToken::new(), &disk, "disk.img", None)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(800));
}

#[tokio::test]
async fn test_connect_rejects_unknown_scheme() {
    let err = connect("ftp://host/path", StorageOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::UnsupportedProvider { ref scheme } if scheme == "ftp"));
}
