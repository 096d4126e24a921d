//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so a failure in a batch
//! of thousands of transfers can be traced back to its file.

use std::path::PathBuf;

use thiserror::Error;

/// Broad category of a [`TransferError`], for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network trouble; retried automatically until the bound is hit.
    Transient,
    /// The server answered in a way the transfer protocol cannot use.
    Protocol,
    /// The finished file does not match its expected size or hash.
    Integrity,
    /// Local filesystem failure.
    Io,
    /// A cancel request arrived after the point of no return.
    Cancellation,
}

/// Errors that can occur during a resumable transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection reset, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// An attempt produced no response (or no body data) within its timeout.
    #[error("timeout downloading {url} after {timeout_ms}ms")]
    Timeout {
        /// The URL that timed out.
        url: String,
        /// The per-attempt timeout that elapsed.
        timeout_ms: u64,
    },

    /// HTTP status outside 200/206.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// A ranged request was answered with something other than partial content.
    #[error("partial content not supported for {url}")]
    RangeNotSupported {
        /// The URL that ignored the range.
        url: String,
    },

    /// The finished file does not have the expected size.
    #[error("size mismatch for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    SizeMismatch {
        /// Destination that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Size found on disk.
        actual_bytes: u64,
    },

    /// The finished file kept hashing to the wrong digest after every fresh restart.
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Destination that failed verification.
        path: PathBuf,
        /// Expected digest (lowercase hex).
        expected: String,
        /// Digest of the last attempt.
        actual: String,
    },

    /// The finished file could not be read back for hashing.
    #[error("cannot read {path} for hash verification")]
    UnreadableFile {
        /// Destination that could not be read.
        path: PathBuf,
    },

    /// File system error during the transfer (create, write, delete, etc.)
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Cancel was requested once verification had begun.
    #[error("{path} is no longer cancellable")]
    NoLongerCancellable {
        /// Destination that is being verified.
        path: PathBuf,
    },

    /// Transient failures persisted past the retry bound.
    #[error("giving up on {url} after {retries} retries: {source}")]
    RetriesExhausted {
        /// The URL that kept failing.
        url: String,
        /// Number of restarts performed.
        retries: u32,
        /// The last transient failure.
        #[source]
        source: Box<TransferError>,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl TransferError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a missing-range-support error.
    pub fn range_not_supported(url: impl Into<String>) -> Self {
        Self::RangeNotSupported { url: url.into() }
    }

    /// Creates a size mismatch error.
    pub fn size_mismatch(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::SizeMismatch {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a hash mismatch error.
    pub fn hash_mismatch(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::HashMismatch {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates an unreadable-file error.
    pub fn unreadable_file(path: impl Into<PathBuf>) -> Self {
        Self::UnreadableFile { path: path.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a no-longer-cancellable error.
    pub fn no_longer_cancellable(path: impl Into<PathBuf>) -> Self {
        Self::NoLongerCancellable { path: path.into() }
    }

    /// Wraps the last transient failure once retries ran out.
    pub fn retries_exhausted(url: impl Into<String>, retries: u32, last: TransferError) -> Self {
        Self::RetriesExhausted {
            url: url.into(),
            retries,
            source: Box::new(last),
        }
    }

    /// Returns the broad category of this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::RetriesExhausted { .. } => {
                FailureKind::Transient
            }
            Self::HttpStatus { .. }
            | Self::RangeNotSupported { .. }
            | Self::InvalidUrl { .. }
            | Self::ClientBuild { .. } => FailureKind::Protocol,
            Self::SizeMismatch { .. } | Self::HashMismatch { .. } => FailureKind::Integrity,
            Self::Io { .. } | Self::UnreadableFile { .. } => FailureKind::Io,
            Self::NoLongerCancellable { .. } => FailureKind::Cancellation,
        }
    }
}

// No From<reqwest::Error> or From<std::io::Error>: every variant needs the
// url or path, which the source errors don't carry. Use the constructors.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_transfer_error_timeout_display() {
        let error = TransferError::timeout("https://cdn.example/f", Duration::from_millis(4000));
        let msg = error.to_string();
        assert!(msg.contains("timeout"), "Expected 'timeout' in: {msg}");
        assert!(msg.contains("4000ms"), "Expected timeout value in: {msg}");
        assert_eq!(error.kind(), FailureKind::Transient);
    }

    #[test]
    fn test_transfer_error_http_status_display() {
        let error = TransferError::http_status("https://cdn.example/f", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("https://cdn.example/f"), "Expected URL in: {msg}");
        assert_eq!(error.kind(), FailureKind::Protocol);
    }

    #[test]
    fn test_transfer_error_range_not_supported_display() {
        let error = TransferError::range_not_supported("https://cdn.example/f");
        assert!(error.to_string().contains("partial content not supported"));
        assert_eq!(error.kind(), FailureKind::Protocol);
    }

    #[test]
    fn test_transfer_error_integrity_kinds() {
        let size = TransferError::size_mismatch("/tmp/a.bin", 700, 650);
        assert!(size.to_string().contains("expected 700 bytes, got 650"));
        assert_eq!(size.kind(), FailureKind::Integrity);

        let hash = TransferError::hash_mismatch("/tmp/a.bin", "abc", "def");
        assert!(hash.to_string().contains("expected abc, got def"));
        assert_eq!(hash.kind(), FailureKind::Integrity);
    }

    #[test]
    fn test_transfer_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = TransferError::io(PathBuf::from("/tmp/test.bin"), io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/test.bin"), "Expected path in: {msg}");
        assert_eq!(error.kind(), FailureKind::Io);
        assert_eq!(
            TransferError::unreadable_file("/tmp/test.bin").kind(),
            FailureKind::Io
        );
    }

    #[test]
    fn test_transfer_error_no_longer_cancellable_names_file() {
        let error = TransferError::no_longer_cancellable("/data/maps/0.d2p");
        assert_eq!(error.to_string(), "/data/maps/0.d2p is no longer cancellable");
        assert_eq!(error.kind(), FailureKind::Cancellation);
    }

    #[test]
    fn test_transfer_error_retries_exhausted_keeps_last_cause() {
        let last = TransferError::timeout("https://cdn.example/f", Duration::from_secs(12));
        let error = TransferError::retries_exhausted("https://cdn.example/f", 5, last);
        assert!(error.to_string().contains("after 5 retries"));
        assert_eq!(error.kind(), FailureKind::Transient);

        let source = std::error::Error::source(&error).unwrap();
        assert!(source.to_string().contains("12000ms"));
    }
}
