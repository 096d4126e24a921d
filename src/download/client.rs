//! HTTP client wrapper shared by every transfer.
//!
//! This module provides the [`TransferClient`], which owns one pooled
//! `reqwest` client plus the [`TransferOptions`] every transfer starts from.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::constants::{CONNECT_TIMEOUT, DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT};
use super::error::TransferError;
use super::hash::HashAlgorithm;
use super::retry::RetryPolicy;

/// Default User-Agent for transfer requests (identifies the tool).
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("patchfetch/{version}")
}

/// Settings shared by every transfer a [`TransferClient`] starts.
///
/// # Default Values
///
/// - `max_retry`: 5
/// - `timeout`: 2 seconds (attempt `n` gets `n + 1` times this)
/// - `connect_timeout`: 30 seconds
/// - `verify_hash` / `verify_size`: true
/// - `hash_algorithm`: SHA-1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Restarts allowed after a transient failure, and after a hash mismatch.
    pub max_retry: u32,
    /// Base per-attempt timeout.
    pub timeout: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Compare the finished file's digest with the expected hash.
    pub verify_hash: bool,
    /// Compare the finished file's size with the expected size.
    pub verify_size: bool,
    /// Digest used for hash verification.
    pub hash_algorithm: HashAlgorithm,
    /// User-Agent header sent with every request.
    pub user_agent: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            verify_hash: true,
            verify_size: true,
            hash_algorithm: HashAlgorithm::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl TransferOptions {
    /// Retry policy derived from `max_retry` and `timeout`.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry, self.timeout)
    }
}

/// HTTP client for resumable transfers.
///
/// Create it once and reuse it for a whole batch so connections are pooled.
/// Cloning is cheap.
///
/// # Example
///
/// ```no_run
/// use patchfetch_core::download::{TransferClient, TransferOptions, TransferRequest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = TransferClient::new(TransferOptions::default())?;
/// let report = client
///     .transfer(TransferRequest::new(
///         "https://cdn.example/dofus/hashes/eb/ebe6...",
///         "./game/data/SmileyCategories.d2o",
///         "ebe6...",
///         14_268_822,
///     ))
///     .await?;
/// println!("Downloaded: {}", report.path.display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TransferClient {
    client: Client,
    options: Arc<TransferOptions>,
}

impl TransferClient {
    /// Creates a client from `options`.
    ///
    /// No overall request timeout is set on the underlying client; timeouts
    /// are applied per attempt by each transfer.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ClientBuild`] if the TLS backend or system
    /// configuration cannot be initialized.
    pub fn new(options: TransferOptions) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|source| TransferError::ClientBuild { source })?;
        debug!(
            max_retry = options.max_retry,
            timeout_ms = options.timeout.as_millis(),
            verify_hash = options.verify_hash,
            verify_size = options.verify_size,
            "transfer client ready"
        );
        Ok(Self {
            client,
            options: Arc::new(options),
        })
    }

    /// Returns the options this client was built with.
    #[must_use]
    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_options_defaults() {
        let options = TransferOptions::default();
        assert_eq!(options.max_retry, 5);
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert!(options.verify_hash);
        assert!(options.verify_size);
        assert_eq!(options.hash_algorithm, HashAlgorithm::Sha1);
    }

    #[test]
    fn test_transfer_options_retry_policy_follows_settings() {
        let options = TransferOptions {
            max_retry: 2,
            timeout: Duration::from_millis(500),
            ..TransferOptions::default()
        };
        let policy = options.retry_policy();
        assert_eq!(policy.max_retry(), 2);
        assert_eq!(policy.timeout_for(1), Duration::from_secs(1));
    }

    #[test]
    fn test_default_user_agent_contains_version() {
        let agent = default_user_agent();
        assert_eq!(
            agent.strip_prefix("patchfetch/"),
            Some(env!("CARGO_PKG_VERSION"))
        );
    }

    #[tokio::test]
    async fn test_transfer_client_builds_with_defaults() {
        let client = TransferClient::new(TransferOptions::default()).unwrap();
        assert_eq!(client.options().max_retry, 5);
    }
}
