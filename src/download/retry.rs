//! Retry logic with linearly growing per-attempt timeouts.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying transfer errors and determining retry behavior.
//!
//! # Overview
//!
//! When an attempt fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - the cause is on a fixed allow-list (connection
//!   reset, broken pipe, host not found, DNS temporary failure, entry not
//!   found, connection aborted, address in use) or the attempt timed out
//! - [`FailureType::Permanent`] - anything else
//!
//! The [`RetryPolicy`] then decides whether to restart. Restarts happen
//! immediately; attempt `n` (0-indexed) gets `base_timeout * (n + 1)`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use patchfetch_core::download::{
//!     FailureType, RetryDecision, RetryPolicy, TransferError, classify_error,
//! };
//!
//! let policy = RetryPolicy::new(5, Duration::from_secs(2));
//! let error = TransferError::timeout("https://cdn.example/f", policy.timeout_for(0));
//!
//! match policy.should_retry(classify_error(&error), 0) {
//!     RetryDecision::Retry { attempt, timeout } => {
//!         assert_eq!(attempt, 1);
//!         assert_eq!(timeout, Duration::from_secs(4));
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;

use tracing::{debug, instrument};

use super::TransferError;
use super::constants::{DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT};

/// IO error kinds treated as transient network trouble.
const TRANSIENT_IO_KINDS: [ErrorKind; 5] = [
    ErrorKind::ConnectionReset,
    ErrorKind::BrokenPipe,
    ErrorKind::NotFound,
    ErrorKind::ConnectionAborted,
    ErrorKind::AddrInUse,
];

/// Resolver messages for "host not found" and "try again later".
const TRANSIENT_DNS_MARKERS: [&str; 4] = [
    "dns error",
    "failed to lookup address",
    "temporary failure in name resolution",
    "name or service not known",
];

/// Classification of transfer failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// Failure that won't succeed regardless of retries.
    Permanent,
}

/// Decision on whether to restart a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Restart right away.
    Retry {
        /// 0-indexed number of the attempt about to start.
        attempt: u32,
        /// Timeout for that attempt.
        timeout: Duration,
    },

    /// Do not retry the transfer.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Bounded retry with linearly growing timeouts.
///
/// # Default Values
///
/// - `max_retry`: 5
/// - `base_timeout`: 2 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of restarts after the initial attempt.
    max_retry: u32,

    /// Timeout of the initial attempt.
    base_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            base_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy.
    ///
    /// # Arguments
    ///
    /// * `max_retry` - Restarts allowed after the initial attempt (0 disables retry)
    /// * `base_timeout` - Timeout of the initial attempt
    #[must_use]
    pub fn new(max_retry: u32, base_timeout: Duration) -> Self {
        Self {
            max_retry,
            base_timeout,
        }
    }

    /// Returns the maximum number of restarts.
    #[must_use]
    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Timeout for the 0-indexed `attempt`: `base_timeout * (attempt + 1)`.
    #[must_use]
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.base_timeout.saturating_mul(attempt.saturating_add(1))
    }

    /// Decides whether to restart after `attempt` (0-indexed) failed.
    #[instrument(skip(self), fields(max_retry = self.max_retry))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_retry {
            debug!(attempt, max = self.max_retry, "max retries reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retry),
            };
        }

        let next = attempt + 1;
        let timeout = self.timeout_for(next);
        debug!(
            attempt,
            next_attempt = next,
            timeout_ms = timeout.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            attempt: next,
            timeout,
        }
    }
}

/// Classifies a transfer error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout | Transient |
/// | Network, cause on the allow-list | Transient |
/// | Network, any other cause | Permanent |
/// | Everything else | Permanent |
#[instrument(skip_all)]
pub fn classify_error(error: &TransferError) -> FailureType {
    match error {
        TransferError::Timeout { .. } => FailureType::Transient,
        TransferError::Network { source, .. } if source.is_timeout() => FailureType::Transient,
        TransferError::Network { source, .. } if is_transient_cause(source) => {
            FailureType::Transient
        }
        _ => FailureType::Permanent,
    }
}

/// Walks the source chain looking for an allow-listed cause.
fn is_transient_cause(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(cause) = current {
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && TRANSIENT_IO_KINDS.contains(&io.kind())
        {
            return true;
        }
        let message = cause.to_string().to_lowercase();
        if TRANSIENT_DNS_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            return true;
        }
        current = cause.source();
    }
    false
}
