//! A single file-handle cache entry.
//!
//! The descriptor is opened lazily by the first prefault that needs it,
//! never by the cache loader: a miss storm must not burn descriptors
//! inside the cache's critical section, and open errors belong on the
//! read path where the caller can see them.
//!
//! # Descriptor state machine
//!
//! ```text
//! Unopened --open_descriptor--> Open(File) --close--> Closed
//!     \------------------------close-----------------^
//! ```
//!
//! `Open` is written exactly once, under the entry's exclusive guard.
//! `Closed` is terminal: it marks an entry that eviction or purge has
//! already detached from the cache table, so a late reader re-enters the
//! cache for a fresh entry instead of re-opening into a dead one. That
//! re-entry rule is what keeps every open matched by exactly one close.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use ffaulter_error::{FfaulterError, Result};
use ffaulter_observability::FileHandleMetrics;
use ffaulter_types::SegmentFileKey;
use parking_lot::RwLock;

/// Lifecycle state of an entry's descriptor. See the module docs.
#[derive(Debug)]
pub enum DescriptorSlot {
    /// No open attempt has succeeded yet.
    Unopened,
    /// The descriptor is open and valid for as long as a reader holds the
    /// entry guard.
    Open(File),
    /// Eviction or purge has closed this entry; it will never reopen.
    Closed,
}

impl DescriptorSlot {
    /// The open file, if this slot is in the `Open` state.
    #[must_use]
    pub fn file(&self) -> Option<&File> {
        match self {
            Self::Open(file) => Some(file),
            Self::Unopened | Self::Closed => None,
        }
    }
}

/// One cached segment-file handle: immutable identity plus a guarded,
/// lazily-opened descriptor.
#[derive(Debug)]
pub struct SegmentHandle {
    key: SegmentFileKey,
    slot: RwLock<DescriptorSlot>,
}

impl SegmentHandle {
    /// Create an unopened handle for `key`.
    #[must_use]
    pub fn new(key: SegmentFileKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            slot: RwLock::new(DescriptorSlot::Unopened),
        })
    }

    /// The segment file this handle addresses.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &SegmentFileKey {
        &self.key
    }

    /// The guarded descriptor slot.
    #[inline]
    pub(crate) fn slot(&self) -> &RwLock<DescriptorSlot> {
        &self.slot
    }

    /// Open the backing segment file read-only and install the descriptor.
    ///
    /// Requires the caller to hold the exclusive guard (enforced by the
    /// `&mut DescriptorSlot` borrow) and the slot to be `Unopened`. On
    /// failure the slot is left `Unopened` so a later prefault retries.
    pub(crate) fn open_descriptor(
        &self,
        slot: &mut DescriptorSlot,
        pgdata_root: &Path,
        metrics: &FileHandleMetrics,
    ) -> Result<()> {
        debug_assert!(
            matches!(slot, DescriptorSlot::Unopened),
            "open_descriptor on a slot that is not Unopened"
        );

        let path = pgdata_root.join(self.key.relative_path());
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|source| FfaulterError::OpenFailed {
                key: self.key,
                pgdata_root: pgdata_root.to_path_buf(),
                source,
            })?;

        metrics.record_open();
        tracing::debug!(
            target: "ffaulter::fhcache",
            key = %self.key,
            path = %path.display(),
            "opened relation segment"
        );
        *slot = DescriptorSlot::Open(file);
        Ok(())
    }

    /// Close the descriptor if present and mark the entry dead.
    ///
    /// Called by the cache's eviction and purge hooks after the entry has
    /// left the table. Takes the write lock, so it waits for any reader
    /// still holding the guard; a reader therefore never observes a
    /// closed descriptor through a held read lock.
    pub(crate) fn close(&self, metrics: &FileHandleMetrics) {
        let mut slot = self.slot.write();
        if let DescriptorSlot::Open(file) = std::mem::replace(&mut *slot, DescriptorSlot::Closed) {
            drop(file);
            metrics.record_close();
            tracing::trace!(
                target: "ffaulter::fhcache",
                key = %self.key,
                "closed relation segment"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use ffaulter_types::{
        BlockNumber, DatabaseId, ForkKind, PrefaultRequest, RelationId, TablespaceId,
    };

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

    fn pgdata_with_segment(rel: u32) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_dir = dir.path().join("base/1");
        std::fs::create_dir_all(&db_dir).expect("mkdir");
        std::fs::write(db_dir.join(rel.to_string()), []).expect("touch segment");
        dir
    }

    #[test]
    fn open_counts_and_installs() {
        let pgdata = pgdata_with_segment(16384);
        let metrics = FileHandleMetrics::new();
        let handle = SegmentHandle::new(request(16384, 0).segment_key());

        {
            let mut slot = handle.slot().write();
            handle
                .open_descriptor(&mut slot, pgdata.path(), &metrics)
                .expect("open should succeed");
            assert!(slot.file().is_some());
        }
        assert_eq!(metrics.opened(), 1);
        assert_eq!(metrics.closed(), 0);
    }

    #[test]
    fn open_missing_file_leaves_slot_unopened() {
        let pgdata = tempfile::tempdir().expect("tempdir");
        let metrics = FileHandleMetrics::new();
        let handle = SegmentHandle::new(request(404, 0).segment_key());

        let mut slot = handle.slot().write();
        let err = handle
            .open_descriptor(&mut slot, pgdata.path(), &metrics)
            .expect_err("open of a missing segment must fail");
        assert!(matches!(err, FfaulterError::OpenFailed { .. }));
        assert!(matches!(*slot, DescriptorSlot::Unopened));
        assert_eq!(metrics.opened(), 0);
    }

    #[test]
    fn close_counts_once_and_is_terminal() {
        let pgdata = pgdata_with_segment(16384);
        let metrics = FileHandleMetrics::new();
        let handle = SegmentHandle::new(request(16384, 0).segment_key());

        {
            let mut slot = handle.slot().write();
            handle
                .open_descriptor(&mut slot, pgdata.path(), &metrics)
                .expect("open should succeed");
        }
        handle.close(&metrics);
        handle.close(&metrics);

        assert_eq!(metrics.opened(), 1);
        assert_eq!(metrics.closed(), 1);
        assert!(matches!(*handle.slot().read(), DescriptorSlot::Closed));
    }

    #[test]
    fn close_of_unopened_entry_counts_nothing() {
        let metrics = FileHandleMetrics::new();
        let handle = SegmentHandle::new(request(16384, 0).segment_key());
        handle.close(&metrics);

        assert_eq!(metrics.closed(), 0);
        // Still terminal: the entry must not open after close.
        assert!(matches!(*handle.slot().read(), DescriptorSlot::Closed));
    }
}
