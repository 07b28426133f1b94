//! Content-addressed storage of resource-file snapshots.
//!
//! Blobs are stored under `<root>/<hash[0..2]>/<hash[2..]>` where `hash` is
//! the lowercase hex SHA-256 of the exact bytes. Writes go to a temp file in
//! the destination directory and are then renamed into place, so a reader
//! never observes a partially written blob.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::StoreError;

/// Lowercase hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn digest_file(path: &Path) -> Result<String, StoreError> {
    let bytes = std::fs::read(path)?;
    Ok(digest(&bytes))
}

fn is_digest(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Append-only blob store keyed by content digest.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        if !is_digest(hash) {
            return Err(StoreError::MalformedHash(hash.to_string()));
        }
        Ok(self.root.join(&hash[..2]).join(&hash[2..]))
    }

    /// Store `bytes` and return their digest. Storing the same bytes twice is
    /// a no-op.
    pub fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let hash = digest(bytes);
        let path = self.object_path(&hash)?;
        if path.exists() {
            debug!(hash = %hash, "object already stored");
            return Ok(hash);
        }

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        // Another writer may have won the race; identical content either way.
        tmp.persist(&path).map_err(|e| StoreError::IoError(e.error))?;

        debug!(hash = %hash, bytes = bytes.len(), "stored object");
        Ok(hash)
    }

    /// Fetch the bytes stored under `hash`.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(hash)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob with this digest is stored.
    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).map(|p| p.exists()).unwrap_or(false)
    }
}
