//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use patchfetch_core::DEFAULT_CONCURRENCY;
use patchfetch_core::HashAlgorithm;
use patchfetch_core::download::constants::{DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT};

/// Fetch every file of a game release from a hash-addressed CDN.
///
/// Patchfetch reads a release manifest, downloads each file from
/// `{base-url}/{game}/hashes/{hash[0..2]}/{hash}`, resumes partial files and
/// verifies size and digest.
#[derive(Parser, Debug)]
#[command(name = "patchfetch")]
#[command(author, version, about)]
pub struct Args {
    /// Release manifest (JSON)
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// CDN base URL the game directories live under
    #[arg(short, long)]
    pub base_url: String,

    /// Game directory name on the CDN
    #[arg(short, long)]
    pub game: String,

    /// Directory the release is written into
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Maximum downloads started per interval window (requires --interval-ms)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub interval_cap: Option<u32>,

    /// Length of the rate-limiting window in milliseconds (0 disables)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u64).range(0..=3_600_000))]
    pub interval_ms: u64,

    /// Count downloads still running at a window boundary against the next window
    #[arg(long)]
    pub carryover: bool,

    /// Maximum retry attempts for transient failures and hash mismatches (0-20)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRY as u8, value_parser = clap::value_parser!(u8).range(0..=20))]
    pub max_retries: u8,

    /// Base per-attempt timeout in milliseconds; attempt n waits (n + 1) times this
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64, value_parser = clap::value_parser!(u64).range(1..=600_000))]
    pub timeout_ms: u64,

    /// Skip digest verification of finished files
    #[arg(long)]
    pub no_verify_hash: bool,

    /// Skip size verification of finished files
    #[arg(long)]
    pub no_verify_size: bool,

    /// Digest used for verification
    #[arg(long, value_enum, default_value_t = DigestChoice::Sha1)]
    pub hash_algorithm: DigestChoice,
}

/// Digest names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DigestChoice {
    Sha1,
    Sha256,
}

impl From<DigestChoice> for HashAlgorithm {
    fn from(choice: DigestChoice) -> Self {
        match choice {
            DigestChoice::Sha1 => Self::Sha1,
            DigestChoice::Sha256 => Self::Sha256,
        }
    }
}
