//! Kernel readahead advisory.
//!
//! One trait, one syscall. The prefault engine hands the kernel a byte
//! range it expects the WAL replayer to need shortly; the kernel faults
//! the pages in the background while replay continues. The call is purely
//! a hint: failures are a missed optimisation, never an error, so every
//! return value here is discarded on purpose.

use std::fs::File;

/// Advise the kernel that a byte range of an open file will be needed.
///
/// Implementations must not block on I/O completion and must swallow
/// advisory failures. On platforms without a readahead primitive the
/// no-op implementation keeps the engine functional with a reduced
/// page-cache hit rate.
pub trait Readahead: Send + Sync {
    /// Hint that `len` bytes at `offset` of `file` are about to be read,
    /// with random access order.
    fn advise(&self, file: &File, offset: u64, len: u64);
}

/// `posix_fadvise`-backed readahead: WILLNEED for the range, RANDOM for
/// the access pattern.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixReadahead;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
impl Readahead for PosixReadahead {
    fn advise(&self, file: &File, offset: u64, len: u64) {
        use std::os::unix::io::AsRawFd;

        use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};
        use nix::libc::off_t;

        // A range past off_t::MAX cannot be advised; skip rather than wrap.
        let (Ok(offset), Ok(len)) = (off_t::try_from(offset), off_t::try_from(len)) else {
            return;
        };

        let fd = file.as_raw_fd();

        // The advice kinds are distinct commands, not flags: declare the
        // access pattern first, then request the fault-in.
        let _ = posix_fadvise(fd, offset, len, PosixFadviseAdvice::POSIX_FADV_RANDOM);
        let _ = posix_fadvise(fd, offset, len, PosixFadviseAdvice::POSIX_FADV_WILLNEED);
    }
}

/// Readahead that does nothing. Used on platforms lacking `posix_fadvise`
/// and as an inert double in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReadahead;

impl Readahead for NoopReadahead {
    fn advise(&self, _file: &File, _offset: u64, _len: u64) {}
}

/// The best readahead implementation this platform offers.
#[must_use]
pub fn platform_readahead() -> Box<dyn Readahead> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        Box::new(PosixReadahead)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        Box::new(NoopReadahead)
    }
}
