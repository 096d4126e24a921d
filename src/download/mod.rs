//! Resumable HTTP transfers streamed to disk.
//!
//! This module provides controllable single-file transfers that resume from
//! partial files with byte ranges, verify size and digest, and retry
//! transient network failures.
//!
//! # Features
//!
//! - Streaming downloads (memory-efficient for multi-gigabyte batches)
//! - `Range` resume from whatever is already on disk
//! - Pause, resume and cancel through the [`crate::operation`] protocol
//! - Per-attempt timeouts growing linearly with each retry
//! - SHA-1 / SHA-256 verification with self-healing fresh restarts
//!
//! # Example
//!
//! ```no_run
//! use patchfetch_core::download::{TransferClient, TransferOptions, TransferRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TransferClient::new(TransferOptions::default())?;
//! let op = client.transfer(TransferRequest::new(
//!     "https://cdn.example/dofus/hashes/eb/ebe61384adad5baad6271811c48323dbd4a7336e",
//!     "./game/data/SmileyCategories.d2o",
//!     "ebe61384adad5baad6271811c48323dbd4a7336e",
//!     14_268_822,
//! ));
//! op.on_progress(|stats| println!("{} bytes", stats.downloaded_size));
//! let report = op.await?;
//! println!("Downloaded: {}", report.path.display());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod hash;
mod retry;
mod transfer;

pub use client::{TransferClient, TransferOptions, default_user_agent};
pub use error::{FailureKind, TransferError};
pub use hash::{HashAlgorithm, file_digest};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
pub use transfer::{TransferOperation, TransferProgress, TransferReport, TransferRequest};

// No module-local Result aliases: signatures spell out `Result<T, TransferError>`.
