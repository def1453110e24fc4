use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::{Action, Status};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Cannot {action} '{filename}' while it is {status}")]
    InvalidAction {
        filename: String,
        action: Action,
        status: Status,
    },

    #[error("Could not mark {path} for removal: {source}")]
    DeferredRemoval {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Incorrect file size for {filename}: {actual} (expected {expected})")]
    SizeMismatch {
        filename: String,
        expected: u64,
        actual: u64,
    },

    #[error("Incorrect checksum for {filename}: {actual} (expected {expected})")]
    DigestMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("Could not mark {path} as executable: {source}")]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Repository is locked by another publisher: {path} ({reason})")]
    LockContention { path: PathBuf, reason: String },

    #[error("Conflict: {path} has been modified (expected {expected:?}, found {actual:?})")]
    Conflict {
        path: PathBuf,
        expected: Option<i64>,
        actual: Option<i64>,
    },

    #[error("Transfer failed: {message}")]
    Transfer { message: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Nothing to publish: the batch must start with the catalog database")]
    EmptyBatch,

    #[error("Entry not found: {filename}")]
    EntryNotFound { filename: String },

    #[error("Entry has neither a local nor a remote version: {filename}")]
    InvalidEntry { filename: String },

    #[error("Config parse error in {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Unknown config key: {key}")]
    ConfigKeyNotFound { key: String },

    #[error("Config value not set: {key} (use `plugsync config set {key} <value>`)")]
    ConfigValueMissing { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Home directory not found")]
    HomeNotFound,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidAction { .. } => 2,
            Self::EntryNotFound { .. } => 3,
            Self::SizeMismatch { .. } | Self::DigestMismatch { .. } => 4,
            Self::DeferredRemoval { .. } | Self::Permission { .. } => 5,
            Self::LockContention { .. } => 6,
            Self::Conflict { .. } => 7,
            Self::Cancelled => 130,
            _ => 1,
        }
    }

    /// Rejections that leave the session intact; everything else ends the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidAction { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_mismatch_reports_both_digests() {
        let err = SyncError::DigestMismatch {
            filename: "plugins/B.jar".to_string(),
            expected: "bbb".to_string(),
            actual: "bad".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("bbb"));
        assert!(message.contains("bad"));
        assert_eq!(err.exit_code(), 4);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_invalid_action_is_recoverable() {
        let err = SyncError::InvalidAction {
            filename: "A.jar".to_string(),
            action: Action::Remove,
            status: Status::NotInstalled,
        };
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Cannot remove 'A.jar' while it is not installed");
    }
}
