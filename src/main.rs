//! CLI entry point for the export-transfer tool.

use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transfer_core::config::{TransferSettings, load_default_file_config, load_file_config};
use transfer_core::storage::{
    CloudStorage, Storage, StorageError, StorageOptions, TransferSummary, connect, delete_directory,
    download_directory, upload_directory,
};
use transfer_core::transfer::{Governor, ProgressCallback, format_speed};

mod cli;
mod progress_ui;

use cli::{Args, Command};

/// Exit status for a run stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = match &args.config {
        Some(path) => Some(load_file_config(path)?),
        None => {
            let loaded = load_default_file_config()?;
            if loaded.loaded_from_file {
                debug!(path = ?loaded.path, "loaded config file");
            }
            loaded.config
        }
    };
    let settings = TransferSettings::resolve(file_config.as_ref(), &args.transfer.overrides());
    debug!(?settings, "transfer settings resolved");

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling transfers");
            signal.cancel();
        }
    });

    match run(&args, &settings, cancel).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(error)
            if error
                .downcast_ref::<StorageError>()
                .is_some_and(StorageError::is_cancelled) =>
        {
            warn!("transfer cancelled");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(error) => Err(error),
    }
}

async fn run(args: &Args, settings: &TransferSettings, cancel: CancellationToken) -> Result<()> {
    let governor = settings.governor();
    let options = StorageOptions {
        retryer: settings.retryer(),
        governor: governor.clone(),
        cancel: cancel.clone(),
    };

    match &args.command {
        Command::Upload { source, url, name } => {
            let storage = open(url, options).await?;
            let started = Instant::now();
            let summary = upload(&storage, &cancel, source, name.as_deref(), args.quiet).await?;
            report("uploaded", summary, started, &governor);
            storage.close().await?;
        }
        Command::Download {
            url,
            destination,
            path,
        } => {
            let storage = open(url, options).await?;
            let started = Instant::now();
            let summary = download(&storage, &cancel, path.as_deref(), destination, args.quiet).await?;
            report("downloaded", summary, started, &governor);
            storage.close().await?;
        }
        Command::Delete { url, path } => {
            let storage = open(url, options).await?;
            let summary = match path {
                Some(path) => {
                    storage.delete(&cancel, path).await?;
                    TransferSummary { files: 1, bytes: 0 }
                }
                None => delete_directory(&storage, &cancel, "").await?,
            };
            info!(files = summary.files, "delete complete");
            storage.close().await?;
        }
        Command::List { url, prefix } => {
            let storage = open(url, options).await?;
            let files = storage.list(&cancel, prefix.as_deref().unwrap_or("")).await?;
            for file in &files {
                let modified = file
                    .last_modified
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:>14}  {modified}  {}", file.size, file.path);
            }
            info!(count = files.len(), "listing complete");
            storage.close().await?;
        }
        Command::Exists { url, path } => {
            let storage = open(url, options).await?;
            let exists = storage.exists(&cancel, path).await?;
            println!("{exists}");
            storage.close().await?;
        }
    }
    Ok(())
}

async fn open(url: &str, options: StorageOptions) -> Result<Storage> {
    let storage = connect(url, options)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    info!(url = %storage.url(), "storage ready");
    Ok(storage)
}

async fn upload(
    storage: &Storage,
    cancel: &CancellationToken,
    source: &Path,
    name: Option<&str>,
    quiet: bool,
) -> Result<TransferSummary> {
    let metadata = tokio::fs::metadata(source)
        .await
        .with_context(|| format!("Cannot read {}", source.display()))?;
    let (bar, progress) = split(progress_ui::transfer_progress(quiet));

    let summary = if metadata.is_dir() {
        if name.is_some() {
            bail!("--name only applies to single-file uploads");
        }
        upload_directory(storage, cancel, source, "", progress).await?
    } else {
        let remote = match name {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("{} has no file name", source.display()))?,
        };
        storage.upload(cancel, source, &remote, progress).await?;
        TransferSummary {
            files: 1,
            bytes: metadata.len(),
        }
    };

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(summary)
}

async fn download(
    storage: &Storage,
    cancel: &CancellationToken,
    path: Option<&str>,
    destination: &Path,
    quiet: bool,
) -> Result<TransferSummary> {
    let (bar, progress) = split(progress_ui::transfer_progress(quiet));

    let summary = match path {
        Some(path) => {
            if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Cannot create {}", parent.display()))?;
            }
            storage.download(cancel, path, destination, progress).await?;
            let bytes = tokio::fs::metadata(destination).await.map_or(0, |m| m.len());
            TransferSummary { files: 1, bytes }
        }
        None => download_directory(storage, cancel, "", destination, progress).await?,
    };

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(summary)
}

fn split<B>(pair: Option<(B, ProgressCallback)>) -> (Option<B>, Option<ProgressCallback>) {
    match pair {
        Some((bar, callback)) => (Some(bar), Some(callback)),
        None => (None, None),
    }
}

#[allow(clippy::cast_precision_loss)]
fn report(verb: &str, summary: TransferSummary, started: Instant, governor: &Governor) {
    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        summary.bytes as f64 / elapsed
    } else {
        0.0
    };
    info!(
        files = summary.files,
        bytes = summary.bytes,
        elapsed_secs = %format!("{elapsed:.1}"),
        speed = %format_speed(rate),
        "{verb} {} file(s)",
        summary.files
    );
    if let Some(stats) = governor.stats() {
        debug!(
            ceiling = %format_speed(stats.limit_bytes_per_sec as f64),
            average = %format_speed(stats.average_bytes_per_sec),
            "bandwidth governor"
        );
    }
}
