//! Error surface for the FrankenFaulter prefault engine.
//!
//! One structured enum for the whole workspace. The engine's failure
//! policy is deliberately narrow: open failures propagate to the caller
//! (who logs and skips the prefault), advisory failures are swallowed at
//! the readahead seam, and descriptor-accounting violations are fatal.

use std::path::PathBuf;

use ffaulter_types::SegmentFileKey;
use thiserror::Error;

/// Primary error type for FrankenFaulter operations.
#[derive(Error, Debug)]
pub enum FfaulterError {
    /// A segment file could not be opened.
    ///
    /// The cache entry stays unopened, so a later prefault against the
    /// same key retries the open.
    #[error("unable to open segment file {key} under '{pgdata_root}'")]
    OpenFailed {
        key: SegmentFileKey,
        pgdata_root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File I/O error outside the open path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected engine configuration.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Descriptor accounting mismatch detected after a purge.
    ///
    /// Indicates a leak in the eviction path; the process must not keep
    /// running with descriptors it cannot account for.
    #[error("file handle accounting mismatch after purge: opened={opened} closed={closed}")]
    PurgeIntegrity { opened: u64, closed: u64 },
}

impl FfaulterError {
    /// Whether this error must abort the process rather than be handled.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::PurgeIntegrity { .. })
    }

    /// Create an `InvalidConfig` error.
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }
}

/// Result type alias using [`FfaulterError`].
pub type Result<T> = std::result::Result<T, FfaulterError>;

#[cfg(test)]
mod tests {
    use ffaulter_types::{
        DatabaseId, ForkKind, RelationId, SegmentFileKey, SegmentId, TablespaceId,
    };

    use super::*;

    fn sample_key() -> SegmentFileKey {
        SegmentFileKey {
            tablespace: TablespaceId::new(1663),
            database: DatabaseId::new(5),
            relation: RelationId::new(16384),
            fork: ForkKind::Main,
            segment: SegmentId::new(2),
        }
    }

    #[test]
    fn open_failed_display_names_key_and_root() {
        let err = FfaulterError::OpenFailed {
            key: sample_key(),
            pgdata_root: PathBuf::from("/var/lib/pgsql/data"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        let msg = err.to_string();
        assert!(msg.contains("rel=16384"));
        assert!(msg.contains("seg=2"));
        assert!(msg.contains("/var/lib/pgsql/data"));
    }

    #[test]
    fn open_failed_preserves_io_source() {
        let err = FfaulterError::OpenFailed {
            key: sample_key(),
            pgdata_root: PathBuf::from("/tmp/pgdata"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let source = std::error::Error::source(&err).expect("source should be preserved");
        assert!(source.to_string().contains("denied"));
    }

    #[test]
    fn purge_integrity_is_fatal() {
        let err = FfaulterError::PurgeIntegrity {
            opened: 10,
            closed: 9,
        };
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "file handle accounting mismatch after purge: opened=10 closed=9"
        );
    }

    #[test]
    fn open_failure_is_not_fatal() {
        let err = FfaulterError::OpenFailed {
            key: sample_key(),
            pgdata_root: PathBuf::from("/tmp/pgdata"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::other("boom");
        let err: FfaulterError = io_err.into();
        assert!(matches!(err, FfaulterError::Io(_)));
    }

    #[test]
    fn invalid_config_constructor() {
        let err = FfaulterError::invalid_config("capacity must be non-zero");
        assert_eq!(
            err.to_string(),
            "invalid configuration: capacity must be non-zero"
        );
    }
}
