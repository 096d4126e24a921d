//! Constants for the download module (timeouts, retry bounds, buffer sizes).

use std::time::Duration;

/// Default number of restarts after a transient failure (and after a hash mismatch).
pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Default base per-attempt timeout (2 seconds). Attempt `n` waits `n + 1` times this.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Write buffer in front of each destination file (64 KiB).
pub const WRITE_BUFFER_CAPACITY: usize = 64 * 1024;

/// Read buffer used while hashing a finished file (64 KiB).
pub const HASH_BUFFER_CAPACITY: usize = 64 * 1024;
