//! Release manifests and the hash-addressed download layout.
//!
//! A release manifest maps fragment names to the files they contain:
//!
//! ```json
//! {
//!   "main": {
//!     "Files": {
//!       "data/SmileyCategories.d2o": { "Hash": "ebe6...", "Size": 14268822 }
//!     }
//!   }
//! }
//! ```
//!
//! Every file is served from `{base}/{game}/hashes/{hash[0..2]}/{hash}`.
//! [`plan_transfers`] turns a manifest into one [`TransferRequest`] per file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::download::TransferRequest;

/// Errors raised while loading or planning a release manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("cannot read manifest {path}: {source}")]
    Read {
        /// Manifest location.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid JSON of the expected shape.
    #[error("invalid manifest {origin}: {source}")]
    Parse {
        /// Where the manifest came from.
        origin: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The download base URL cannot be parsed.
    #[error("invalid base URL: {url}")]
    InvalidBaseUrl {
        /// The rejected URL.
        url: String,
    },

    /// A file's hash is too short or not hex.
    #[error("invalid hash {hash:?} for {file}")]
    InvalidHash {
        /// Manifest path of the file.
        file: String,
        /// The rejected hash.
        hash: String,
    },

    /// A file path is absolute or climbs out of the output directory.
    #[error("file path {file} escapes the output directory")]
    UnsafePath {
        /// Manifest path of the file.
        file: String,
    },
}

/// One file of a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    /// Content digest, hex.
    #[serde(rename = "Hash")]
    pub hash: String,
    /// Size in bytes.
    #[serde(rename = "Size")]
    pub size: u64,
}

/// A named group of files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Fragment {
    /// Files keyed by their path relative to the game directory.
    #[serde(rename = "Files", default)]
    pub files: BTreeMap<String, FileEntry>,
}

/// A release: fragments keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Release {
    /// Fragments keyed by name.
    pub fragments: BTreeMap<String, Fragment>,
}

impl Release {
    /// Parses a manifest; `origin` names it in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Parse`] if `text` is not a valid manifest.
    pub fn from_json(text: &str, origin: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(text).map_err(|source| ManifestError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    /// Reads and parses the manifest at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Read`] if the file cannot be read and
    /// [`ManifestError::Parse`] if it is not a valid manifest.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let release = Self::from_json(&text, &path.display().to_string())?;
        debug!(
            fragments = release.fragments.len(),
            files = release.file_count(),
            bytes = release.total_size(),
            "manifest loaded"
        );
        Ok(release)
    }

    /// Iterates `(fragment, file path, entry)` in fragment then path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str, &FileEntry)> {
        self.fragments.iter().flat_map(|(fragment, content)| {
            content
                .files
                .iter()
                .map(move |(name, entry)| (fragment.as_str(), name.as_str(), entry))
        })
    }

    /// Number of file entries across all fragments.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.fragments.values().map(|fragment| fragment.files.len()).sum()
    }

    /// Sum of all file sizes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files().map(|(_, _, entry)| entry.size).sum()
    }
}

/// The `{base}/{game}/hashes/{hash[0..2]}/{hash}` URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashAddressing {
    base: String,
    game: String,
}

impl HashAddressing {
    /// Creates the scheme for `game` under `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::InvalidBaseUrl`] if `base_url` is not an
    /// absolute http(s) URL.
    pub fn new(base_url: &str, game: impl Into<String>) -> Result<Self, ManifestError> {
        let parsed = Url::parse(base_url).map_err(|_| ManifestError::InvalidBaseUrl {
            url: base_url.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ManifestError::InvalidBaseUrl {
                url: base_url.to_string(),
            });
        }
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            game: game.into(),
        })
    }

    /// URL of the content with digest `hash`, or `None` if the hash is shorter
    /// than two ASCII characters.
    #[must_use]
    pub fn url_for(&self, hash: &str) -> Option<String> {
        let prefix = hash.get(..2)?;
        Some(format!(
            "{}/{}/hashes/{prefix}/{hash}",
            self.base, self.game
        ))
    }
}

/// A manifest entry ready to be transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Fragment the file belongs to.
    pub fragment: String,
    /// Path as written in the manifest.
    pub name: String,
    /// Transfer descriptor.
    pub request: TransferRequest,
}

/// Maps every manifest entry to a transfer into `output_dir`.
///
/// Hashes are lowercased. When several fragments list the same path, the
/// first one (in fragment order) wins.
///
/// # Errors
///
/// Returns [`ManifestError::UnsafePath`] for absolute paths or paths with
/// `..`, and [`ManifestError::InvalidHash`] for hashes that are not hex or
/// shorter than two characters.
#[instrument(skip_all, fields(output_dir = %output_dir.display()))]
pub fn plan_transfers(
    release: &Release,
    addressing: &HashAddressing,
    output_dir: &Path,
) -> Result<Vec<PlannedFile>, ManifestError> {
    let mut seen = HashSet::new();
    let mut planned = Vec::with_capacity(release.file_count());

    for (fragment, name, entry) in release.files() {
        let relative = safe_relative_path(name).ok_or_else(|| ManifestError::UnsafePath {
            file: name.to_string(),
        })?;
        let hash = entry.hash.to_ascii_lowercase();
        let url = is_hex(&hash)
            .then(|| addressing.url_for(&hash))
            .flatten()
            .ok_or_else(|| ManifestError::InvalidHash {
                file: name.to_string(),
                hash: entry.hash.clone(),
            })?;

        if !seen.insert(relative.clone()) {
            warn!(fragment, file = name, "duplicate file path, keeping first entry");
            continue;
        }

        planned.push(PlannedFile {
            fragment: fragment.to_string(),
            name: name.to_string(),
            request: TransferRequest::new(url, output_dir.join(&relative), hash, entry.size),
        });
    }

    debug!(files = planned.len(), "transfers planned");
    Ok(planned)
}

fn is_hex(hash: &str) -> bool {
    !hash.is_empty() && hash.bytes().all(|byte| byte.is_ascii_hexdigit())
}

/// Normal components only; `.` is dropped, anything else rejects the path.
fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}
