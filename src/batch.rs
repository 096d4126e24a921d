//! Batch updater for whole releases.
//!
//! This module provides the [`BatchUpdater`], which turns planned manifest
//! entries into scheduled transfers and collects their outcome.
//!
//! # Overview
//!
//! [`BatchUpdater::prepare`] creates a paused [`Scheduler`], adds one transfer
//! per [`PlannedFile`] and hands back a [`BatchUpdate`]. Nothing touches the
//! network until [`BatchUpdate::start`]. Every file's [`TransferOperation`] is
//! exposed so callers can pause, resume or cancel individual files.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use patchfetch_core::batch::BatchUpdater;
//! use patchfetch_core::download::{TransferClient, TransferOptions};
//! use patchfetch_core::manifest::{HashAddressing, Release, plan_transfers};
//! use patchfetch_core::scheduler::SchedulerOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let release = Release::load(Path::new("release.json")).await?;
//! let addressing = HashAddressing::new("https://cdn.example/cytrus", "dofus")?;
//! let planned = plan_transfers(&release, &addressing, Path::new("./game"))?;
//!
//! let client = TransferClient::new(TransferOptions::default())?;
//! let updater = BatchUpdater::new(client, SchedulerOptions::default().with_concurrency(10))?;
//! let update = updater.prepare(planned)?;
//! update.start();
//! let stats = update.wait().await;
//! println!("Completed: {}, Failed: {}", stats.completed(), stats.failed());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, info, instrument, warn};

use crate::download::{TransferClient, TransferOperation};
use crate::manifest::PlannedFile;
use crate::operation::OperationError;
use crate::scheduler::{Scheduler, SchedulerError, SchedulerOptions};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Error type for batch setup.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Scheduler options were rejected.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Statistics from a batch run.
///
/// Counters are atomic so progress listeners can update them from any task.
#[derive(Debug, Default)]
pub struct BatchStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    canceled: AtomicUsize,
    resumed: AtomicUsize,
    retried: AtomicU64,
    bytes_received: AtomicU64,
}

impl BatchStats {
    /// Creates a new stats tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of files that completed and verified.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Returns the number of files that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the number of files canceled before completion.
    #[must_use]
    pub fn canceled(&self) -> usize {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Returns the number of completed files that continued a partial file.
    #[must_use]
    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }

    /// Returns the number of transient retries across all completed files.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::SeqCst)
    }

    /// Returns the bytes received so far, across every attempt.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Returns the number of files that reached an outcome.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed() + self.canceled()
    }

    /// Returns true when no file failed or was canceled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.canceled() == 0
    }

    fn add_bytes(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::SeqCst);
    }

    fn record_completed(&self, resumed: bool, retries: u32) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if resumed {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
        self.retried.fetch_add(u64::from(retries), Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::SeqCst);
    }
}

/// One scheduled file of a batch.
#[derive(Clone)]
pub struct FileDownload {
    /// Fragment the file belongs to.
    pub fragment: String,
    /// Path as written in the manifest.
    pub name: String,
    /// Expected size in bytes.
    pub size: u64,
    /// Expected digest.
    pub hash: String,
    /// Handle to the scheduled transfer.
    pub operation: TransferOperation,
}

/// Builds batches that share one client and one set of scheduler options.
#[derive(Debug, Clone)]
pub struct BatchUpdater {
    client: TransferClient,
    options: SchedulerOptions,
}

impl BatchUpdater {
    /// Creates an updater.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidConcurrency`] if a concurrency cap is set
    /// outside 1-100, or [`BatchError::Scheduler`] for other invalid options.
    pub fn new(client: TransferClient, options: SchedulerOptions) -> Result<Self, BatchError> {
        if let Some(value) = options.concurrency
            && !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value)
        {
            return Err(BatchError::InvalidConcurrency { value });
        }
        options.validate()?;
        Ok(Self { client, options })
    }

    /// Schedules every planned file on a fresh, paused scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Scheduler`] if the scheduler cannot be created.
    #[instrument(skip(self, planned), fields(files = planned.len()))]
    pub fn prepare(&self, planned: Vec<PlannedFile>) -> Result<BatchUpdate, BatchError> {
        let scheduler = Scheduler::new(self.options.clone().with_auto_start(false))?;
        let stats = Arc::new(BatchStats::new());

        let files = planned
            .into_iter()
            .map(|file| {
                let size = file.request.expected_size;
                let hash = file.request.expected_hash.clone();
                let operation = scheduler.add(self.client.factory(file.request), 0);
                let counter = Arc::clone(&stats);
                operation.on_progress(move |progress| counter.add_bytes(progress.chunk_size));
                FileDownload {
                    fragment: file.fragment,
                    name: file.name,
                    size,
                    hash,
                    operation,
                }
            })
            .collect::<Vec<_>>();

        debug!(queued = scheduler.size(), "batch prepared");
        Ok(BatchUpdate {
            scheduler,
            files,
            stats,
        })
    }
}

/// A prepared batch: a paused scheduler plus one handle per file.
pub struct BatchUpdate {
    scheduler: Scheduler,
    files: Vec<FileDownload>,
    stats: Arc<BatchStats>,
}

impl BatchUpdate {
    /// The scheduler driving this batch.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Every scheduled file, in manifest order.
    #[must_use]
    pub fn files(&self) -> &[FileDownload] {
        &self.files
    }

    /// Sum of the expected sizes of every file.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    /// Live counters; `bytes_received` moves while transfers stream.
    #[must_use]
    pub fn stats(&self) -> Arc<BatchStats> {
        Arc::clone(&self.stats)
    }

    /// Starts admitting transfers.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Waits for every file and returns the final counters.
    ///
    /// Failures are logged and counted; they never abort the rest of the batch.
    #[instrument(skip(self), fields(files = self.files.len()))]
    pub async fn wait(self) -> Arc<BatchStats> {
        info!(total_size = self.total_size(), "starting batch");

        for file in &self.files {
            match file.operation.wait().await {
                Ok(report) => {
                    info!(
                        path = %report.path.display(),
                        size = report.size,
                        resumed = report.resumed,
                        retries = report.retries,
                        restarts = report.restarts,
                        "download completed"
                    );
                    self.stats.record_completed(report.resumed, report.retries);
                }
                Err(OperationError::Canceled) => {
                    debug!(file = %file.name, "download canceled");
                    self.stats.increment_canceled();
                }
                Err(error) => {
                    let kind = error.failure().map(|failure| failure.kind());
                    warn!(
                        file = %file.name,
                        fragment = %file.fragment,
                        error = %error,
                        kind = ?kind,
                        "download failed"
                    );
                    self.stats.increment_failed();
                }
            }
        }

        self.scheduler.on_idle().await;
        info!(
            completed = self.stats.completed(),
            failed = self.stats.failed(),
            canceled = self.stats.canceled(),
            resumed = self.stats.resumed(),
            retried = self.stats.retried(),
            total = self.stats.total(),
            "batch complete"
        );
        self.stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::download::{TransferOptions, TransferRequest};

    fn client() -> TransferClient {
        TransferClient::new(TransferOptions::default()).unwrap()
    }

    fn planned(name: &str, url: &str, dir: &Path) -> PlannedFile {
        PlannedFile {
            fragment: "main".to_string(),
            name: name.to_string(),
            request: TransferRequest::new(url, dir.join(name), "aa", 4),
        }
    }

    // ==================== BatchStats Tests ====================

    #[test]
    fn test_batch_stats_new_all_zero() {
        let stats = BatchStats::new();
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.canceled(), 0);
        assert_eq!(stats.bytes_received(), 0);
        assert_eq!(stats.total(), 0);
        assert!(stats.is_success());
    }

    #[test]
    fn test_batch_stats_record_outcomes() {
        let stats = BatchStats::new();
        stats.record_completed(true, 2);
        stats.record_completed(false, 1);
        stats.increment_failed();
        stats.increment_canceled();
        stats.add_bytes(10);

        assert_eq!(stats.completed(), 2);
        assert_eq!(stats.resumed(), 1);
        assert_eq!(stats.retried(), 3);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.canceled(), 1);
        assert_eq!(stats.bytes_received(), 10);
        assert_eq!(stats.total(), 4);
        assert!(!stats.is_success());
    }

    // ==================== BatchUpdater Tests ====================

    #[tokio::test]
    async fn test_batch_updater_rejects_concurrency_out_of_range() {
        for value in [0, 101] {
            let result = BatchUpdater::new(
                client(),
                SchedulerOptions::default().with_concurrency(value),
            );
            assert!(matches!(
                result,
                Err(BatchError::InvalidConcurrency { value: v }) if v == value
            ));
        }
    }

    #[tokio::test]
    async fn test_batch_updater_rejects_zero_interval_cap() {
        let result = BatchUpdater::new(
            client(),
            SchedulerOptions::default().with_interval_cap(0, std::time::Duration::from_secs(1)),
        );
        assert!(matches!(result, Err(BatchError::Scheduler(_))));
    }

    #[tokio::test]
    async fn test_batch_prepare_is_paused_until_start() {
        let dir = tempfile::tempdir().unwrap();
        let updater = BatchUpdater::new(
            client(),
            SchedulerOptions::default().with_concurrency(DEFAULT_CONCURRENCY),
        )
        .unwrap();
        let update = updater
            .prepare(vec![
                planned("a.bin", "http://127.0.0.1:9/a", dir.path()),
                planned("b.bin", "http://127.0.0.1:9/b", dir.path()),
            ])
            .unwrap();

        assert!(update.scheduler().is_paused());
        assert_eq!(update.scheduler().size(), 2);
        assert_eq!(update.files().len(), 2);
        assert_eq!(update.total_size(), 8);
        assert_eq!(update.files()[0].name, "a.bin");
    }

    #[tokio::test]
    async fn test_batch_wait_counts_canceled_files() {
        let dir = tempfile::tempdir().unwrap();
        let updater = BatchUpdater::new(client(), SchedulerOptions::default()).unwrap();
        let update = updater
            .prepare(vec![planned("a.bin", "http://127.0.0.1:9/a", dir.path())])
            .unwrap();

        update.files()[0].operation.cancel().await.unwrap();
        update.start();
        let stats = update.wait().await;

        assert_eq!(stats.canceled(), 1);
        assert_eq!(stats.total(), 1);
        assert!(!stats.is_success());
    }

    #[tokio::test]
    async fn test_batch_wait_counts_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let updater = BatchUpdater::new(client(), SchedulerOptions::default()).unwrap();
        let update = updater
            .prepare(vec![
                planned("bad.bin", "not a url", dir.path()),
                planned("also-bad.bin", "still not a url", dir.path()),
            ])
            .unwrap();

        update.start();
        let stats = update.wait().await;

        assert_eq!(stats.failed(), 2);
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.total(), 2);
    }
}
