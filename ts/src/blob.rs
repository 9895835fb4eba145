//! Content-addressed blob area
//!
//! Blobs are named by their SHA-256 digest and written exactly once: a blob
//! that already exists is never rewritten.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StoreResult;

/// Number of hex chars used for artifact content hashes
pub const ARTIFACT_HASH_LEN: usize = 16;

/// Full hex SHA-256 digest
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Short content hash used for artifacts (first 16 hex chars)
pub fn content_hash(content: &[u8]) -> String {
    let mut digest = sha256_hex(content);
    digest.truncate(ARTIFACT_HASH_LEN);
    digest
}

/// Directory of immutable blobs keyed by digest
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub const DIR: &'static str = "blobs";

    pub fn open(base: &Path) -> StoreResult<Self> {
        let root = base.join(Self::DIR);
        fs::create_dir_all(&root)?;
        debug!(?root, "BlobStore::open: called");
        Ok(Self { root })
    }

    /// Path relative to the store directory, as recorded in metadata
    pub fn relative_path(key: &str) -> String {
        format!("{}/{}", Self::DIR, key)
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    /// Write a blob under `key` unless it already exists
    ///
    /// The content lands in a temp file first and is renamed into place, so a
    /// crash never leaves a truncated blob under a valid name.
    pub fn put(&self, key: &str, content: &[u8]) -> StoreResult<bool> {
        let path = self.path_for(key);
        if path.exists() {
            debug!(%key, "BlobStore::put: already present, skipping");
            return Ok(false);
        }

        let tmp = self.root.join(format!(".{}.tmp-{}", key, uuid::Uuid::now_v7()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(%key, bytes = content.len(), "BlobStore::put: wrote blob");
        Ok(true)
    }

    pub fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        Ok(fs::read(self.path_for(key))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_content_hash_is_sixteen_hex_chars() {
        let hash = content_hash(b"hello");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(sha256_hex(b"hello").starts_with(&hash));
    }

    #[test]
    fn test_put_is_write_once() {
        let temp = tempdir().unwrap();
        let blobs = BlobStore::open(temp.path()).unwrap();

        assert!(blobs.put("k", b"first").unwrap());
        assert!(!blobs.put("k", b"second").unwrap());
        assert_eq!(blobs.get("k").unwrap(), b"first");
    }
}
