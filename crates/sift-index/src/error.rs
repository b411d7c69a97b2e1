//! Error types for sift-index.

use std::path::PathBuf;

use crate::store::StoreError;

/// Errors that can occur during scanning, indexing and watching.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files or state files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File content is not valid UTF-8 text.
    #[error("cannot decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// Storage backend error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Ignore rule or override glob could not be compiled.
    #[error("ignore rule error: {0}")]
    Ignore(#[from] ignore::Error),

    /// Settings rejected before any work starts.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session lock could not be read or written.
    #[error("session lock error: {0}")]
    Lock(String),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// True when the failure is a storage connectivity problem the owning
    /// daemon may retry with backoff.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_connectivity())
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_mentions_path() {
        let err = IndexError::Decode {
            path: PathBuf::from("src/blob.bin"),
            reason: "invalid utf-8 sequence".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("src/blob.bin"));
        assert!(msg.contains("invalid utf-8"));
    }

    #[test]
    fn connectivity_is_forwarded_from_store() {
        let err = IndexError::from(StoreError::Connection("pool closed".into()));
        assert!(err.is_connectivity());
        let err = IndexError::from(StoreError::Invalid("bad chunk".into()));
        assert!(!err.is_connectivity());
        assert!(!IndexError::Other("x".into()).is_connectivity());
    }
}
