//! The prefault engine.
//!
//! `prefault_page` is the hot path: map the request to a segment-file
//! key, obtain that segment's cached handle with the read guard held and
//! the descriptor known open, and hand the kernel a readahead advisory
//! for the page's byte range. The descriptor dance in
//! [`FileHandleCache::with_open_descriptor`] is the load-bearing part;
//! everything else is bookkeeping.

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use ffaulter_error::{FfaulterError, Result};
use ffaulter_observability::{
    ConcurrentReadGuard, FileHandleCacheStats, FileHandleMetrics, StatsLoggerHandle,
};
use ffaulter_types::limits::HEAP_BLOCK_SIZE;
use ffaulter_types::{PrefaultRequest, SegmentFileKey};
use parking_lot::Mutex;

use crate::arc::ArcTtlCache;
use crate::config::FileHandleCacheConfig;
use crate::entry::{DescriptorSlot, SegmentHandle};
use crate::fadvise::{platform_readahead, Readahead};

/// Bounded cache of open segment-file descriptors plus the prefault entry
/// point that drives them.
///
/// Handles are opened lazily by the first prefault that needs them,
/// shared across concurrent readers under a per-entry reader/writer
/// guard, and closed exactly once when capacity pressure, TTL expiry, or
/// [`FileHandleCache::purge`] removes them from the cache.
pub struct FileHandleCache {
    cfg: FileHandleCacheConfig,
    metrics: Arc<FileHandleMetrics>,
    cache: ArcTtlCache<SegmentFileKey, Arc<SegmentHandle>>,
    readahead: Box<dyn Readahead>,
    /// Serializes operator-initiated purges so two cannot interleave
    /// their accounting probes.
    purge_lock: Mutex<()>,
}

impl FileHandleCache {
    /// Create an engine with the platform's readahead implementation.
    pub fn new(cfg: FileHandleCacheConfig) -> Result<Self> {
        Self::with_readahead(cfg, platform_readahead())
    }

    /// Create an engine with an explicit readahead implementation
    /// (injected by tests, or `NoopReadahead` to disable advisories).
    pub fn with_readahead(
        cfg: FileHandleCacheConfig,
        readahead: Box<dyn Readahead>,
    ) -> Result<Self> {
        cfg.validate()?;

        let metrics = Arc::new(FileHandleMetrics::new());
        let hook_metrics = Arc::clone(&metrics);
        let cache = ArcTtlCache::new(
            cfg.capacity,
            cfg.ttl,
            move |_key: &SegmentFileKey, handle: &Arc<SegmentHandle>| {
                handle.close(&hook_metrics);
            },
        );

        tracing::debug!(
            target: "ffaulter::fhcache",
            capacity = cfg.capacity,
            ttl_secs = cfg.ttl.as_secs(),
            max_open_files = cfg.max_open_files,
            rlimit_nofile = cfg.rlimit_nofile,
            pgdata_root = %cfg.pgdata_root.display(),
            "file handle cache initialized"
        );

        Ok(Self {
            cfg,
            metrics,
            cache,
            readahead,
            purge_lock: Mutex::new(()),
        })
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &FileHandleCacheConfig {
        &self.cfg
    }

    /// Descriptor accounting for this engine.
    #[must_use]
    pub fn metrics(&self) -> &FileHandleMetrics {
        &self.metrics
    }

    /// Pre-fault one heap page into the OS page cache.
    ///
    /// Opens the relation's segment if this is the first touch, then
    /// issues a best-effort readahead advisory for the page's byte range.
    /// Synchronous from the caller's view; the fault-in the kernel does
    /// is asynchronous. Fails only if the segment file cannot be opened.
    pub fn prefault_page(&self, request: &PrefaultRequest) -> Result<()> {
        let key = request.segment_key();
        let offset = request.block.byte_offset();
        self.with_open_descriptor(&key, |file| {
            self.readahead.advise(file, offset, HEAP_BLOCK_SIZE);
        })
    }

    /// Run `f` against the open descriptor for `key`, with the entry's
    /// read guard held for the duration of the call.
    ///
    /// Double-checked open protocol: take the read guard and return if
    /// the descriptor is already open; otherwise upgrade to the write
    /// guard, revalidate, open, and loop back for the read guard. A
    /// `Closed` slot means eviction won the race between our cache lookup
    /// and the guard acquisition; re-entering the cache materializes a
    /// fresh entry, so the loop always makes progress. Open errors leave
    /// the entry `Unopened` and surface to the caller.
    fn with_open_descriptor<T>(
        &self,
        key: &SegmentFileKey,
        f: impl FnOnce(&File) -> T,
    ) -> Result<T> {
        let mut f = Some(f);
        loop {
            let handle = self.cache.get_or_load(key, |k| SegmentHandle::new(*k));

            {
                let slot = handle.slot().read();
                match &*slot {
                    DescriptorSlot::Open(file) => {
                        let _reading = ConcurrentReadGuard::enter(&self.metrics);
                        let f = f.take().expect("prefault closure runs at most once");
                        return Ok(f(file));
                    }
                    DescriptorSlot::Closed => continue,
                    DescriptorSlot::Unopened => {}
                }
            }

            {
                let mut slot = handle.slot().write();
                match &*slot {
                    // A peer opened while we waited for the write guard,
                    // or eviction closed the entry under us; either way,
                    // loop back with the guard released.
                    DescriptorSlot::Open(_) | DescriptorSlot::Closed => {}
                    DescriptorSlot::Unopened => {
                        handle
                            .open_descriptor(&mut slot, &self.cfg.pgdata_root, &self.metrics)
                            .inspect_err(|err| {
                                tracing::warn!(
                                    target: "ffaulter::fhcache",
                                    key = %handle.key(),
                                    error = %err,
                                    "unable to open relation segment"
                                );
                            })?;
                    }
                }
            }
        }
    }

    /// Evict and close every cached handle, then verify descriptor
    /// accounting.
    ///
    /// Blocks on in-flight readers: each close waits out the entry's read
    /// guard. Callers must not issue new prefaults concurrently with a
    /// purge, or the accounting probe can observe a fresh open in flight.
    ///
    /// # Panics
    ///
    /// Aborts the process if `open_fd_count != close_fd_count` afterwards;
    /// that inequality means a descriptor leaked through the eviction
    /// path, and the process must not keep running with handles it cannot
    /// account for.
    pub fn purge(&self) {
        let _serialized = self.purge_lock.lock();
        self.cache.purge();

        let snap = self.metrics.snapshot();
        if snap.open_fd_count != snap.close_fd_count {
            let err = FfaulterError::PurgeIntegrity {
                opened: snap.open_fd_count,
                closed: snap.close_fd_count,
            };
            tracing::error!(
                target: "ffaulter::fhcache",
                opened = snap.open_fd_count,
                closed = snap.close_fd_count,
                "descriptor accounting violated"
            );
            panic!("{err}");
        }

        tracing::debug!(target: "ffaulter::fhcache", "file handle cache purged");
    }

    /// Combined cache and descriptor counters.
    #[must_use]
    pub fn stats(&self) -> FileHandleCacheStats {
        FileHandleCacheStats {
            cache: self.cache.counters(),
            handles: self.metrics.snapshot(),
        }
    }

    /// Spawn the periodic stats reporter for this engine.
    ///
    /// The logger holds only a weak reference: when the engine is dropped
    /// the thread stops on its next tick, and dropping the returned
    /// handle stops it immediately.
    #[must_use]
    pub fn spawn_stats_logger(self: &Arc<Self>, interval: Duration) -> StatsLoggerHandle {
        let engine = Arc::downgrade(self);
        ffaulter_observability::spawn_stats_logger(interval, move || match engine.upgrade() {
            Some(engine) => {
                let stats = engine.stats();
                tracing::info!(target: "ffaulter::stats", %stats, "filehandle stats");
                true
            }
            None => false,
        })
    }
}

impl std::fmt::Debug for FileHandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandleCache")
            .field("cfg", &self.cfg)
            .field("cache", &self.cache)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ffaulter_types::limits::BLOCKS_PER_SEGMENT;
    use ffaulter_types::{
        BlockNumber, DatabaseId, ForkKind, RelationId, TablespaceId,
    };

    use crate::fadvise::NoopReadahead;

    use super::*;

    fn request(rel: u32, block: u32) -> PrefaultRequest {
        PrefaultRequest {
            tablespace: TablespaceId::DEFAULT,
            database: DatabaseId::new(1),
            relation: RelationId::new(rel),
            fork: ForkKind::Main,
            block: BlockNumber::new(block),
        }
    }

    /// Temp pgdata with empty segment files under `base/1/`.
    fn pgdata(segments: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_dir = dir.path().join("base/1");
        std::fs::create_dir_all(&db_dir).expect("mkdir");
        for name in segments {
            std::fs::write(db_dir.join(name), []).expect("touch segment");
        }
        dir
    }

    fn engine(pgdata: &tempfile::TempDir, capacity: usize) -> FileHandleCache {
        let cfg = FileHandleCacheConfig {
            capacity,
            ..FileHandleCacheConfig::new(pgdata.path())
        };
        FileHandleCache::with_readahead(cfg, Box::new(NoopReadahead))
            .expect("engine construction should succeed")
    }

    /// Readahead double that records every advised byte range.
    struct RecordingReadahead {
        log: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl Readahead for RecordingReadahead {
        fn advise(&self, _file: &File, offset: u64, len: u64) {
            self.log.lock().push((offset, len));
        }
    }

    #[test]
    fn cold_prefault_opens_once_warm_prefault_reuses() {
        let data = pgdata(&["16384"]);
        let engine = engine(&data, 8);
        let req = request(16384, 3);

        engine.prefault_page(&req).expect("cold prefault");
        let stats = engine.stats();
        assert_eq!(stats.handles.open_fd_count, 1);
        assert_eq!(stats.handles.close_fd_count, 0);
        assert_eq!(stats.cache.size, 1);

        engine.prefault_page(&req).expect("warm prefault");
        let stats = engine.stats();
        assert_eq!(stats.handles.open_fd_count, 1, "warm path must not reopen");
        assert!(stats.cache.hits >= 1);
    }

    #[test]
    fn advisory_covers_the_requested_page() {
        let data = pgdata(&["16384", "16384.1"]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let cfg = FileHandleCacheConfig {
            capacity: 8,
            ..FileHandleCacheConfig::new(data.path())
        };
        let engine = FileHandleCache::with_readahead(
            cfg,
            Box::new(RecordingReadahead {
                log: Arc::clone(&log),
            }),
        )
        .expect("engine");

        engine.prefault_page(&request(16384, 3)).expect("prefault");
        // First block of segment 1: in-segment offset restarts at zero.
        engine
            .prefault_page(&request(16384, BLOCKS_PER_SEGMENT))
            .expect("prefault across the segment boundary");

        assert_eq!(
            log.lock().as_slice(),
            &[
                (3 * HEAP_BLOCK_SIZE, HEAP_BLOCK_SIZE),
                (0, HEAP_BLOCK_SIZE),
            ]
        );
        // Two distinct segment files were opened.
        assert_eq!(engine.stats().handles.open_fd_count, 2);
    }

    #[test]
    fn open_failure_propagates_and_later_retry_succeeds() {
        let data = pgdata(&[]);
        let engine = engine(&data, 8);
        let req = request(16385, 0);

        let err = engine
            .prefault_page(&req)
            .expect_err("missing segment must fail");
        assert!(matches!(err, FfaulterError::OpenFailed { .. }));
        assert_eq!(engine.metrics().opened(), 0);
        // The entry stays cached, unopened, ready to retry.
        assert_eq!(engine.stats().cache.size, 1);

        let err = engine
            .prefault_page(&req)
            .expect_err("still missing, still an error");
        assert!(matches!(err, FfaulterError::OpenFailed { .. }));

        std::fs::write(data.path().join("base/1/16385"), []).expect("create segment");
        engine.prefault_page(&req).expect("retry after create");
        assert_eq!(engine.metrics().opened(), 1);
    }

    #[test]
    fn gauge_counts_the_read_section_only() {
        let data = pgdata(&["16384"]);
        let engine = engine(&data, 8);
        let key = request(16384, 0).segment_key();

        let during = engine
            .with_open_descriptor(&key, |_file| engine.metrics().concurrent_reads())
            .expect("descriptor should open");
        assert_eq!(during, 1);
        assert_eq!(engine.metrics().concurrent_reads(), 0);
    }

    #[test]
    fn gauge_unwinds_with_the_read_section() {
        let data = pgdata(&["16384"]);
        let engine = engine(&data, 8);
        let key = request(16384, 0).segment_key();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = engine.with_open_descriptor(&key, |_file| {
                panic!("reader died");
            });
        }));
        assert!(result.is_err());
        assert_eq!(engine.metrics().concurrent_reads(), 0);
    }

    #[test]
    fn purge_closes_everything_and_allows_reopen() {
        let data = pgdata(&["16384", "16385"]);
        let engine = engine(&data, 8);

        engine.prefault_page(&request(16384, 0)).expect("prefault a");
        engine.prefault_page(&request(16385, 0)).expect("prefault b");
        assert_eq!(engine.metrics().opened(), 2);

        engine.purge();
        let stats = engine.stats();
        assert_eq!(stats.cache.size, 0);
        assert_eq!(stats.handles.open_fd_count, stats.handles.close_fd_count);

        engine.prefault_page(&request(16384, 0)).expect("reopen");
        assert_eq!(engine.metrics().opened(), 3);
    }

    #[test]
    fn purge_of_unopened_entries_is_clean() {
        let data = pgdata(&[]);
        let engine = engine(&data, 8);
        // A failed open leaves an unopened resident entry behind.
        let _ = engine.prefault_page(&request(404, 0));
        engine.purge();
        assert_eq!(engine.stats().cache.size, 0);
        assert_eq!(engine.metrics().opened(), 0);
        assert_eq!(engine.metrics().closed(), 0);
    }

    #[test]
    fn stats_logger_stops_after_engine_drop() {
        let data = pgdata(&["16384"]);
        let engine = Arc::new(engine(&data, 8));
        let logger = engine.spawn_stats_logger(Duration::from_millis(5));

        drop(engine);
        std::thread::sleep(Duration::from_millis(20));
        // Joining must not hang once the weak reference is dead.
        logger.stop();
    }
}
