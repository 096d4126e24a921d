//! Patchfetch Core Library
//!
//! This library provides resumable, controllable fetching of hash-addressed
//! release files: single transfers that survive pauses, crashes and flaky
//! networks, and a scheduler that runs thousands of them under concurrency
//! and rate caps.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`operation`] - Controllable async operations (pause, resume, cancel, progress)
//! - [`scheduler`] - Priority scheduler with concurrency and interval caps
//! - [`download`] - Resumable HTTP transfers with retry and verification
//! - [`manifest`] - Release manifests and the hash-addressed URL layout
//! - [`batch`] - Batch updater tying manifests, transfers and the scheduler together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod download;
pub mod manifest;
pub mod operation;
pub mod scheduler;

// Re-export commonly used types
pub use batch::{BatchError, BatchStats, BatchUpdate, BatchUpdater, DEFAULT_CONCURRENCY, FileDownload};
pub use download::{
    FailureKind, HashAlgorithm, RetryPolicy, TransferClient, TransferError, TransferOperation,
    TransferOptions, TransferProgress, TransferReport, TransferRequest,
};
pub use manifest::{HashAddressing, ManifestError, PlannedFile, Release, plan_transfers};
pub use operation::{ControlError, Operation, OperationError, OperationState};
pub use scheduler::{Scheduler, SchedulerError, SchedulerOptions};
