//! Transfer Core Library
//!
//! Moves VM export artifacts (disk images, OVF/OVA bundles, manifests) to and
//! from remote storage over unreliable networks.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`transfer`] - Retry engine, bandwidth limiters and throttled streams
//! - [`storage`] - Storage protocol, concrete backends and directory orchestration
//! - [`config`] - Config file loading and session settings

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod storage;
pub mod transfer;
mod user_agent;

// Re-export commonly used types
pub use storage::{
    CloudFile, CloudStorage, Storage, StorageError, StorageOptions, TransferSummary, connect,
    delete_directory, download_directory, upload_directory,
};
pub use transfer::{
    AdaptiveBandwidthLimiter, BandwidthLimiter, FailureType, Governor, ProgressCallback,
    RetryError, RetryPolicy, Retryer,
};
