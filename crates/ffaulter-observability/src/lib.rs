//! Descriptor accounting and stats reporting.
//!
//! Lock-free `AtomicU64`/`AtomicI64` counters verify that the file-handle
//! cache behaves as expected: every `open(2)` and `close(2)` is counted,
//! and a gauge tracks how many prefault readers are in flight at once.
//! The counters are owned per cache instance rather than process-global,
//! so tests can reset accounting by constructing a fresh engine.
//!
//! [`spawn_stats_logger`] runs a background thread that periodically emits
//! a snapshot through `tracing`; dropping the returned handle stops it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

// ---------------------------------------------------------------------------
// FileHandleMetrics
// ---------------------------------------------------------------------------

/// Atomic counters for descriptor lifecycle and reader concurrency.
///
/// `open_fd_count` and `close_fd_count` are monotonic; their difference is
/// the number of descriptors currently held. `concurrent_reads` is a gauge
/// driven by [`ConcurrentReadGuard`].
#[derive(Debug, Default)]
pub struct FileHandleMetrics {
    open_fd_count: AtomicU64,
    close_fd_count: AtomicU64,
    concurrent_reads: AtomicI64,
}

impl FileHandleMetrics {
    /// Create a zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            open_fd_count: AtomicU64::new(0),
            close_fd_count: AtomicU64::new(0),
            concurrent_reads: AtomicI64::new(0),
        }
    }

    /// Record a successful `open(2)`.
    pub fn record_open(&self) {
        self.open_fd_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a `close(2)`.
    pub fn record_close(&self) {
        self.close_fd_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total opens so far.
    #[must_use]
    pub fn opened(&self) -> u64 {
        self.open_fd_count.load(Ordering::Relaxed)
    }

    /// Total closes so far.
    #[must_use]
    pub fn closed(&self) -> u64 {
        self.close_fd_count.load(Ordering::Relaxed)
    }

    /// Current number of in-flight prefault readers.
    #[must_use]
    pub fn concurrent_reads(&self) -> i64 {
        self.concurrent_reads.load(Ordering::Relaxed)
    }

    /// Take a consistent-enough snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> FileHandleMetricsSnapshot {
        FileHandleMetricsSnapshot {
            open_fd_count: self.opened(),
            close_fd_count: self.closed(),
            concurrent_reads: self.concurrent_reads(),
        }
    }

    /// Reset all counters to zero (tests/diagnostics).
    pub fn reset(&self) {
        self.open_fd_count.store(0, Ordering::Relaxed);
        self.close_fd_count.store(0, Ordering::Relaxed);
        self.concurrent_reads.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of [`FileHandleMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileHandleMetricsSnapshot {
    pub open_fd_count: u64,
    pub close_fd_count: u64,
    pub concurrent_reads: i64,
}

impl FileHandleMetricsSnapshot {
    /// Descriptors currently held (opens minus closes).
    #[must_use]
    pub const fn held(&self) -> u64 {
        self.open_fd_count.saturating_sub(self.close_fd_count)
    }
}

impl fmt::Display for FileHandleMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fd_opened={} fd_closed={} concurrent_reads={}",
            self.open_fd_count, self.close_fd_count, self.concurrent_reads
        )
    }
}

// ---------------------------------------------------------------------------
// ConcurrentReadGuard
// ---------------------------------------------------------------------------

/// RAII guard for the concurrent-reads gauge.
///
/// Increments on construction and decrements on drop, so every exit path
/// out of a prefault (success, open failure, panic unwind) restores the
/// gauge.
#[derive(Debug)]
pub struct ConcurrentReadGuard<'a> {
    metrics: &'a FileHandleMetrics,
}

impl<'a> ConcurrentReadGuard<'a> {
    /// Enter a read section.
    #[must_use]
    pub fn enter(metrics: &'a FileHandleMetrics) -> Self {
        metrics.concurrent_reads.fetch_add(1, Ordering::Relaxed);
        Self { metrics }
    }
}

impl Drop for ConcurrentReadGuard<'_> {
    fn drop(&mut self) {
        let prev = self.metrics.concurrent_reads.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "concurrent-reads gauge underflow");
    }
}

// ---------------------------------------------------------------------------
// Cache counters
// ---------------------------------------------------------------------------

/// Lookup and eviction counters reported by the handle cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheCounters {
    /// Lookups answered by a resident entry.
    pub hits: u64,
    /// Lookups that ran the loader (includes ghost hits).
    pub misses: u64,
    /// Entries evicted by capacity pressure.
    pub evictions: u64,
    /// Entries evicted by TTL expiry.
    pub expirations: u64,
    /// Resident entries at snapshot time.
    pub size: usize,
}

impl fmt::Display for CacheCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} expirations={} size={}",
            self.hits, self.misses, self.evictions, self.expirations, self.size
        )
    }
}

/// Combined engine stats: cache counters plus descriptor accounting.
///
/// This is the payload of the periodic stats callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileHandleCacheStats {
    pub cache: CacheCounters,
    pub handles: FileHandleMetricsSnapshot,
}

impl fmt::Display for FileHandleCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cache, self.handles)
    }
}

// ---------------------------------------------------------------------------
// Stats logger task
// ---------------------------------------------------------------------------

/// Default interval between stats snapshots.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

struct StatsLoggerShared {
    stop: AtomicBool,
    wakeup: Mutex<()>,
    cv: Condvar,
}

/// Handle to a running stats-logger thread. Dropping it stops the thread.
pub struct StatsLoggerHandle {
    shared: Arc<StatsLoggerShared>,
    thread: Option<JoinHandle<()>>,
}

impl StatsLoggerHandle {
    /// Stop the logger and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(thread) = self.thread.take() {
            // A panicking logger closure already surfaced through tracing;
            // nothing useful left to do with the join error here.
            drop(thread.join());
        }
    }
}

impl Drop for StatsLoggerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for StatsLoggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsLoggerHandle")
            .field("stopped", &self.shared.stop.load(Ordering::Relaxed))
            .finish()
    }
}

/// Spawn a background thread that invokes `emit` every `interval`.
///
/// `emit` returns `false` to stop the logger from inside (used when the
/// subject of the snapshot has been dropped). The thread wakes promptly on
/// [`StatsLoggerHandle::stop`] or handle drop rather than sleeping out the
/// rest of its interval.
pub fn spawn_stats_logger<F>(interval: Duration, emit: F) -> StatsLoggerHandle
where
    F: Fn() -> bool + Send + 'static,
{
    let shared = Arc::new(StatsLoggerShared {
        stop: AtomicBool::new(false),
        wakeup: Mutex::new(()),
        cv: Condvar::new(),
    });

    let thread_shared = Arc::clone(&shared);
    let thread = std::thread::Builder::new()
        .name("ffaulter-stats".to_owned())
        .spawn(move || {
            loop {
                {
                    let mut guard = thread_shared.wakeup.lock();
                    let _ = thread_shared.cv.wait_for(&mut guard, interval);
                }
                if thread_shared.stop.load(Ordering::Acquire) {
                    break;
                }
                if !emit() {
                    break;
                }
            }
            tracing::debug!(target: "ffaulter::stats", "stats logger stopped");
        })
        .expect("spawning the stats logger thread should not fail");

    StatsLoggerHandle {
        shared,
        thread: Some(thread),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
