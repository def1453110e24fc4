//! Content digests and download verification
//!
//! Publisher and consumer must agree on the digest algorithm; both sides go
//! through a [`Digester`] so the choice lives in one place.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

/// Computes the content digest of a file, keyed by its catalog filename.
pub trait Digester: Send + Sync {
    fn digest(&self, filename: &str, path: &Path) -> Result<String>;
}

/// SHA-256 over the file contents, lowercase hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digester;

impl Digester for Sha256Digester {
    fn digest(&self, _filename: &str, path: &Path) -> Result<String> {
        let content = fs::read(path)?;
        Ok(compute_digest(&content))
    }
}

pub fn compute_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Check the size of a downloaded file. Returns the actual size on success.
pub fn verify_size(filename: &str, path: &Path, expected: u64) -> Result<u64> {
    let actual = fs::metadata(path)?.len();
    if actual != expected {
        return Err(SyncError::SizeMismatch {
            filename: filename.to_string(),
            expected,
            actual,
        });
    }
    Ok(actual)
}

/// Check the digest of a downloaded file. Returns the verified digest.
pub fn verify_digest(
    digester: &dyn Digester,
    filename: &str,
    path: &Path,
    expected: &str,
) -> Result<String> {
    let actual = digester.digest(filename, path)?;
    if actual != expected {
        return Err(SyncError::DigestMismatch {
            filename: filename.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}
