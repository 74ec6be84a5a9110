//! FrankenFaulter: heap-page prefault engine for PostgreSQL streaming
//! replicas.
//!
//! WAL replay on a replica is single-threaded; every record applied
//! against a page that is not in the OS page cache stalls on a
//! synchronous disk read. FrankenFaulter parses ahead of the replayer
//! (the WAL-scan layer lives in the daemon shell) and pre-faults the
//! referenced heap pages with kernel readahead advisories, keeping a
//! bounded adaptive cache of open segment-file descriptors so hot
//! relations are not re-opened on every touch.
//!
//! This facade re-exports the public surface of the member crates:
//!
//! ```no_run
//! use ffaulter::{FileHandleCache, FileHandleCacheConfig, PrefaultRequest};
//! use ffaulter::{BlockNumber, DatabaseId, ForkKind, RelationId, TablespaceId};
//!
//! # fn main() -> ffaulter::Result<()> {
//! let cache = FileHandleCache::new(FileHandleCacheConfig::new("/var/lib/pgsql/data"))?;
//! cache.prefault_page(&PrefaultRequest {
//!     tablespace: TablespaceId::DEFAULT,
//!     database: DatabaseId::new(16384),
//!     relation: RelationId::new(16385),
//!     fork: ForkKind::Main,
//!     block: BlockNumber::new(42),
//! })?;
//! # Ok(())
//! # }
//! ```

pub use ffaulter_error::{FfaulterError, Result};
pub use ffaulter_fhcache::{
    platform_readahead, FileHandleCache, FileHandleCacheConfig, NoopReadahead, Readahead,
    DEFAULT_CAPACITY, DEFAULT_TTL,
};
pub use ffaulter_observability::{
    CacheCounters, FileHandleCacheStats, FileHandleMetrics, FileHandleMetricsSnapshot,
    StatsLoggerHandle, DEFAULT_STATS_INTERVAL,
};
pub use ffaulter_types::limits::{BLOCKS_PER_SEGMENT, HEAP_BLOCK_SIZE, SEGMENT_BYTES};
pub use ffaulter_types::{
    BlockNumber, DatabaseId, ForkKind, PrefaultRequest, RelationId, SegmentFileKey, SegmentId,
    TablespaceId,
};
