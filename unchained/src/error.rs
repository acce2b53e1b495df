//! Error kinds for the chunk codec, walker and sync pipeline.

use crate::chunk::BlockRange;
use std::path::PathBuf;

/// Errors surfaced by the index cache.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The manifest could not be fetched or read. Aborts the whole sync.
    #[error("manifest unavailable: {0}")]
    ManifestUnavailable(String),

    /// The manifest was read but violates ordering or range invariants.
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    /// A fetched blob did not hash to the value the manifest promised.
    #[error("hash mismatch for {range}: expected {expected}, got {actual}")]
    ChunkHashMismatch {
        range: BlockRange,
        expected: String,
        actual: String,
    },

    /// Malformed or truncated chunk header/record.
    #[error("failed to decode {}: {reason}", path.display())]
    ChunkDecode { path: PathBuf, reason: String },

    /// The remote could not be reached at all (connection refused, DNS).
    /// Aborts the whole sync.
    #[error("remote unreachable at {url}: {reason}")]
    RemoteUnreachable { url: String, reason: String },

    /// Transient fetch failure for a single blob.
    #[error("download failed for {hash}: {reason}")]
    DownloadFailed { hash: String, reason: String },

    /// Cooperative stop requested by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Programmer error, e.g. an index path handed to a bloom-only context.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IndexError {
    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ChunkDecode {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors worth another attempt in a later retry pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailed { .. } | Self::ChunkHashMismatch { .. }
        )
    }
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        let mismatch = IndexError::ChunkHashMismatch {
            range: BlockRange::new(0, 9),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(mismatch.is_retryable());
        assert!(IndexError::DownloadFailed {
            hash: "aa".into(),
            reason: "timeout".into()
        }
        .is_retryable());
        assert!(!IndexError::Cancelled.is_retryable());
        assert!(!IndexError::InvariantViolation("bad path".into()).is_retryable());
        assert!(!IndexError::ManifestUnavailable("offline".into()).is_retryable());
        assert!(!IndexError::RemoteUnreachable {
            url: "http://gateway.invalid".into(),
            reason: "dns error".into()
        }
        .is_retryable());
    }
}
