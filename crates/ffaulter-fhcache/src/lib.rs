//! File-handle cache and prefault engine.
//!
//! WAL replay on a streaming replica is serialized: every apply against a
//! non-resident heap page stalls on a synchronous read. This crate keeps
//! a bounded, adaptive cache of open segment-file descriptors and, for
//! each upcoming block reference, issues a kernel readahead advisory so
//! the page is faulted in before the replayer asks for it.
//!
//! Entry point: [`FileHandleCache::prefault_page`].

pub mod arc;
pub mod config;
pub mod engine;
pub mod entry;
pub mod fadvise;

pub use arc::ArcTtlCache;
pub use config::{FileHandleCacheConfig, DEFAULT_CAPACITY, DEFAULT_TTL};
pub use engine::FileHandleCache;
pub use entry::{DescriptorSlot, SegmentHandle};
pub use fadvise::{platform_readahead, NoopReadahead, Readahead};
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub use fadvise::PosixReadahead;
