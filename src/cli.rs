//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use transfer_core::config::SettingsOverrides;

/// Move VM export artifacts to and from cloud storage.
///
/// Every remote call is retried with exponential backoff and every byte
/// passes through an optional bandwidth ceiling.
#[derive(Parser, Debug)]
#[command(name = "export-transfer")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/export-transfer/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub transfer: TransferArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Retry and bandwidth flags shared by every subcommand.
#[derive(clap::Args, Debug, Default)]
pub struct TransferArgs {
    /// Maximum attempts per remote operation (1-100)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_retries: Option<u32>,

    /// First backoff delay in milliseconds
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..=3_600_000))]
    pub retry_initial_ms: Option<u64>,

    /// Longest backoff delay in milliseconds
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..=3_600_000))]
    pub retry_max_ms: Option<u64>,

    /// Disable backoff jitter
    #[arg(long, global = true)]
    pub no_jitter: bool,

    /// Bandwidth ceiling in MB/s (0 = unlimited)
    #[arg(long, global = true, value_name = "MBPS")]
    pub bandwidth_limit: Option<u64>,

    /// Burst allowance in MB (defaults to two seconds of the ceiling)
    #[arg(long, global = true, value_name = "MB")]
    pub bandwidth_burst: Option<u64>,

    /// Tune the ceiling from success/error feedback
    #[arg(long, global = true)]
    pub adaptive_bandwidth: bool,
}

impl TransferArgs {
    #[must_use]
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            max_retries: self.max_retries,
            retry_initial_delay_ms: self.retry_initial_ms,
            retry_max_delay_ms: self.retry_max_ms,
            no_jitter: self.no_jitter,
            bandwidth_limit_mbps: self.bandwidth_limit,
            bandwidth_burst_mb: self.bandwidth_burst,
            adaptive_bandwidth: self.adaptive_bandwidth,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a file, or every file under a directory
    Upload {
        /// Local file or directory
        source: PathBuf,
        /// Storage URL, e.g. s3://bucket/prefix
        url: String,
        /// Remote name for a single file (defaults to its file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Download one object, or everything under the URL's prefix
    Download {
        /// Storage URL
        url: String,
        /// Local file (with --path) or directory
        destination: PathBuf,
        /// Single remote object to fetch
        #[arg(long)]
        path: Option<String>,
    },
    /// Delete one object, or everything under the URL's prefix
    Delete {
        /// Storage URL
        url: String,
        /// Single remote object to delete
        #[arg(long)]
        path: Option<String>,
    },
    /// List objects under the URL's prefix
    List {
        /// Storage URL
        url: String,
        /// Narrow the listing to a sub-prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Check whether an object exists
    Exists {
        /// Storage URL
        url: String,
        /// Remote object path
        path: String,
    },
}
