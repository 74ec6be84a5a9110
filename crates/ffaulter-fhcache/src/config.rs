//! Engine configuration.
//!
//! Loading (files, environment, flags) belongs to the daemon shell; this
//! module only defines the validated struct the engine consumes at
//! startup.

use std::path::PathBuf;
use std::time::Duration;

use ffaulter_error::{FfaulterError, Result};
use ffaulter_types::limits::RESERVED_FDS;

/// Default resident-handle capacity when no rlimit is supplied.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default handle TTL, fixed from insert.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Configuration for a [`FileHandleCache`](crate::FileHandleCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandleCacheConfig {
    /// Maximum resident (and therefore openable) segment handles.
    pub capacity: usize,
    /// Handle lifetime, fixed at cache insert; a hit does not refresh it.
    pub ttl: Duration,
    /// Root of the cluster data directory the segment paths resolve under.
    pub pgdata_root: PathBuf,
    /// Operator-declared ceiling on descriptors this process may hold.
    pub max_open_files: u64,
    /// The process' `RLIMIT_NOFILE`, as observed by the daemon shell.
    pub rlimit_nofile: u64,
}

impl FileHandleCacheConfig {
    /// Config with defaults for everything but the data directory.
    #[must_use]
    pub fn new(pgdata_root: impl Into<PathBuf>) -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            pgdata_root: pgdata_root.into(),
            max_open_files: DEFAULT_CAPACITY as u64 + RESERVED_FDS,
            rlimit_nofile: DEFAULT_CAPACITY as u64 + RESERVED_FDS,
        }
    }

    /// Derive a capacity from the process fd rlimit: half the limit after
    /// the reserve, so WAL threads and the rest of the process keep room.
    #[must_use]
    pub fn for_rlimit(pgdata_root: impl Into<PathBuf>, rlimit_nofile: u64) -> Self {
        let budget = rlimit_nofile.saturating_sub(RESERVED_FDS) / 2;
        let capacity = usize::try_from(budget.max(1)).unwrap_or(usize::MAX);
        Self {
            capacity,
            ttl: DEFAULT_TTL,
            pgdata_root: pgdata_root.into(),
            max_open_files: rlimit_nofile,
            rlimit_nofile,
        }
    }

    /// Validate the configuration.
    ///
    /// Hard errors reject a cache that cannot uphold its contract; an
    /// oversized capacity relative to the declared fd budget is only
    /// warned about, since the kernel limit may still accommodate the
    /// read-locked overhang.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(FfaulterError::invalid_config(
                "file handle cache capacity must be non-zero",
            ));
        }
        if self.ttl.is_zero() {
            return Err(FfaulterError::invalid_config(
                "file handle TTL must be non-zero",
            ));
        }
        if self.pgdata_root.as_os_str().is_empty() {
            return Err(FfaulterError::invalid_config(
                "pgdata root must not be empty",
            ));
        }

        let wanted = self.capacity as u64 + RESERVED_FDS;
        if wanted > self.max_open_files {
            tracing::warn!(
                target: "ffaulter::fhcache",
                capacity = self.capacity,
                reserved = RESERVED_FDS,
                max_open_files = self.max_open_files,
                "cache capacity plus reserve exceeds the declared fd budget"
            );
        }
        if self.max_open_files > self.rlimit_nofile {
            tracing::warn!(
                target: "ffaulter::fhcache",
                max_open_files = self.max_open_files,
                rlimit_nofile = self.rlimit_nofile,
                "declared fd budget exceeds RLIMIT_NOFILE"
            );
        }
        Ok(())
    }
}
