//! Relation identity and segment addressing for FrankenFaulter.
//!
//! A PostgreSQL relation is stored as a sequence of fixed-size *segment
//! files* on disk, one per [`SegmentId`], each holding
//! [`limits::BLOCKS_PER_SEGMENT`] heap blocks of
//! [`limits::HEAP_BLOCK_SIZE`] bytes. This crate defines the identity
//! tuple that names one such file ([`SegmentFileKey`]), the request shape
//! handed over by the WAL-scan layer ([`PrefaultRequest`]), and the pure
//! block-number arithmetic that maps a relation-wide block to a
//! (segment, in-segment page, byte offset) triple.
//!
//! Everything here is `Copy`, total, and does no I/O.

pub mod limits;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::limits::{BLOCKS_PER_SEGMENT, HEAP_BLOCK_SIZE};

// ---------------------------------------------------------------------------
// Identity newtypes
// ---------------------------------------------------------------------------

macro_rules! oid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Wrap a raw identifier.
            #[inline]
            #[must_use]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Get the raw u32 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

oid_newtype! {
    /// OID of the tablespace a relation lives in.
    ///
    /// Identifiers are unsigned on the wire and in the catalog, so a
    /// negative tablespace id is unrepresentable here by construction.
    TablespaceId
}

oid_newtype! {
    /// OID of the database that owns a relation.
    DatabaseId
}

oid_newtype! {
    /// Filenode OID of the relation itself (the on-disk file name stem).
    RelationId
}

oid_newtype! {
    /// Zero-based segment number within a relation.
    ///
    /// Segment `n` covers blocks `[n * BLOCKS_PER_SEGMENT, (n + 1) *
    /// BLOCKS_PER_SEGMENT)`.
    SegmentId
}

impl TablespaceId {
    /// The cluster-wide `pg_global` tablespace.
    pub const GLOBAL: Self = Self(1664);

    /// The default `pg_default` tablespace.
    pub const DEFAULT: Self = Self(1663);
}

// ---------------------------------------------------------------------------
// BlockNumber
// ---------------------------------------------------------------------------

/// A relation-wide heap block number.
///
/// Blocks are numbered from zero across the whole relation; the segment
/// split is recovered with [`BlockNumber::segment`] and
/// [`BlockNumber::page_in_segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockNumber(u32);

impl BlockNumber {
    /// Wrap a raw block number.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The segment file this block lives in: `block / BLOCKS_PER_SEGMENT`.
    #[inline]
    #[must_use]
    pub const fn segment(self) -> SegmentId {
        SegmentId::new(self.0 / BLOCKS_PER_SEGMENT)
    }

    /// The page index within its segment: `block mod BLOCKS_PER_SEGMENT`.
    #[inline]
    #[must_use]
    pub const fn page_in_segment(self) -> u32 {
        self.0 % BLOCKS_PER_SEGMENT
    }

    /// Byte offset of this block within its segment file.
    ///
    /// Widened to `u64` before the multiply, so the computation is total
    /// for every representable block number.
    #[inline]
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.page_in_segment() as u64 * HEAP_BLOCK_SIZE
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ForkKind
// ---------------------------------------------------------------------------

/// The relation fork a block belongs to.
///
/// Each fork is a separate file stream with its own segment series,
/// distinguished on disk by a file-name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ForkKind {
    /// Main data fork (bare file name).
    Main,
    /// Free-space map (`_fsm`).
    FreeSpaceMap,
    /// Visibility map (`_vm`).
    VisibilityMap,
    /// Unlogged-relation init fork (`_init`).
    Init,
}

impl ForkKind {
    /// On-disk file-name suffix for this fork. Empty for the main fork.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Main => "",
            Self::FreeSpaceMap => "_fsm",
            Self::VisibilityMap => "_vm",
            Self::Init => "_init",
        }
    }

    /// Parse the fork name used in WAL dump output (`main`, `fsm`, `vm`,
    /// `init`). Returns `None` for anything else.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "main" => Some(Self::Main),
            "fsm" => Some(Self::FreeSpaceMap),
            "vm" => Some(Self::VisibilityMap),
            "init" => Some(Self::Init),
            _ => None,
        }
    }
}

impl fmt::Display for ForkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Main => "main",
            Self::FreeSpaceMap => "fsm",
            Self::VisibilityMap => "vm",
            Self::Init => "init",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// SegmentFileKey
// ---------------------------------------------------------------------------

/// Identity of exactly one segment file on disk.
///
/// Two keys built from the same component tuple are indistinguishable:
/// equality and hashing cover the full tuple, nothing else. This is the
/// key type of the file-handle cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentFileKey {
    pub tablespace: TablespaceId,
    pub database: DatabaseId,
    pub relation: RelationId,
    pub fork: ForkKind,
    pub segment: SegmentId,
}

impl SegmentFileKey {
    /// File name of this segment within its directory.
    ///
    /// Segment 0 is the bare relation file name; higher segments append
    /// `.<segment>`. The fork suffix sits between the relation id and the
    /// segment extension: `16384_vm.2`.
    #[must_use]
    pub fn file_name(&self) -> String {
        let mut name = format!("{}{}", self.relation, self.fork.suffix());
        if self.segment.get() > 0 {
            name.push('.');
            name.push_str(&self.segment.get().to_string());
        }
        name
    }

    /// Path of this segment file relative to the cluster data directory.
    ///
    /// Relations in the global tablespace live under `global/`; everything
    /// else resolves under `base/<database>/`. Same key and root always
    /// produce the same path bytes.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        if self.tablespace == TablespaceId::GLOBAL {
            path.push("global");
        } else {
            path.push("base");
            path.push(self.database.get().to_string());
        }
        path.push(self.file_name());
        path
    }
}

impl fmt::Display for SegmentFileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ts={} db={} rel={} fork={} seg={}",
            self.tablespace, self.database, self.relation, self.fork, self.segment
        )
    }
}

// ---------------------------------------------------------------------------
// PrefaultRequest
// ---------------------------------------------------------------------------

/// A prefault request as produced by the WAL-scan layer.
///
/// Carries a relation identity plus a relation-wide block number; the
/// segment split happens in [`PrefaultRequest::segment_key`], so the cache
/// key always addresses one file exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefaultRequest {
    pub tablespace: TablespaceId,
    pub database: DatabaseId,
    pub relation: RelationId,
    pub fork: ForkKind,
    pub block: BlockNumber,
}

impl PrefaultRequest {
    /// The key of the segment file holding this request's block.
    #[must_use]
    pub fn segment_key(&self) -> SegmentFileKey {
        SegmentFileKey {
            tablespace: self.tablespace,
            database: self.database,
            relation: self.relation,
            fork: self.fork,
            segment: self.block.segment(),
        }
    }
}

impl fmt::Display for PrefaultRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ts={} db={} rel={} fork={} block={}",
            self.tablespace, self.database, self.relation, self.fork, self.block
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
