//! Compile-time storage constants.
//!
//! These must match the target cluster's build constants exactly: a
//! prefaulter advising the wrong byte ranges is useless, not unsafe, but
//! it silently stops helping. Both values are powers of two.

/// Size of one heap block in bytes (the server's `BLCKSZ`).
pub const HEAP_BLOCK_SIZE: u64 = 8192;

/// Number of heap blocks per segment file (the server's `RELSEG_SIZE`).
///
/// Together with [`HEAP_BLOCK_SIZE`] this fixes the segment span at 1 GiB.
pub const BLOCKS_PER_SEGMENT: u32 = 131_072;

/// Byte span of one full segment file.
pub const SEGMENT_BYTES: u64 = HEAP_BLOCK_SIZE * BLOCKS_PER_SEGMENT as u64;

/// File descriptors held back from the cache for the process' own use
/// (log files, sockets, the WAL dump pipe).
pub const RESERVED_FDS: u64 = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_powers_of_two() {
        assert!(HEAP_BLOCK_SIZE.is_power_of_two());
        assert!(BLOCKS_PER_SEGMENT.is_power_of_two());
    }

    #[test]
    fn segment_spans_one_gibibyte() {
        assert_eq!(SEGMENT_BYTES, 1 << 30);
    }
}
