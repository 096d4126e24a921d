//! Content digests of finished files.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::constants::HASH_BUFFER_CAPACITY;

/// Digest used to verify finished transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1, the digest hash-addressed release manifests use.
    #[default]
    Sha1,
    /// SHA-256.
    Sha256,
}

/// Computes the lowercase hex digest of the file at `path`.
///
/// Reading happens on the blocking pool. Returns `None` when the file cannot
/// be opened or read.
pub async fn file_digest(path: &Path, algorithm: HashAlgorithm) -> Option<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest_blocking(&path, algorithm))
        .await
        .ok()
        .flatten()
}

fn digest_blocking(path: &Path, algorithm: HashAlgorithm) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    match algorithm {
        HashAlgorithm::Sha1 => hash_reader::<Sha1>(file),
        HashAlgorithm::Sha256 => hash_reader::<Sha256>(file),
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> Option<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; HASH_BUFFER_CAPACITY];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return None,
        };
        hasher.update(&buffer[..read]);
    }

    Some(hex::encode(hasher.finalize()))
}
