//! Raw stack memory segments
//!
//! A segment is one anonymous mapping laid out as:
//!
//! ```text
//! ┌─────────────────────────────────────┐  ← end (initial stack pointer)
//! │ usable range (RW, committed lazily) │
//! │   ...                               │
//! ├─────────────────────────────────────┤  ← usable_start
//! │ guard page (PROT_NONE)              │
//! └─────────────────────────────────────┘  ← base
//! ```
//!
//! The kernel commits usable pages on first touch. `populate` commits a range
//! up front so a hot path does not take one page fault per page, and `release`
//! hands committed pages back without unmapping them.

use super::pool::Ledger;
use super::StackError;
use once_cell::sync::Lazy;
use std::ptr;
use std::sync::Arc;

/// `MADV_POPULATE_WRITE` (Linux 5.14+); older kernels answer `EINVAL`.
const MADV_POPULATE_WRITE: libc::c_int = 23;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
});

/// System page size
pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub(crate) fn page_align_down(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

pub(crate) fn page_align_up(addr: usize) -> usize {
    (addr + page_size() - 1) & !(page_size() - 1)
}

/// One mmap'd fiber stack
pub struct StackSegment {
    base: usize,
    len: usize,
    guard: usize,
    ledger: Arc<Ledger>,
}

impl StackSegment {
    /// Map a new segment of `len` bytes (rounded to pages) with a guard page.
    pub(crate) fn map(len: usize, ledger: Arc<Ledger>) -> Result<Self, StackError> {
        let page = page_size();
        let len = page_align_up(len).max(page * 2);

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::Map(last_errno()));
        }

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let errno = last_errno();
            unsafe {
                libc::munmap(base, len);
            }
            return Err(StackError::Protect(errno));
        }

        let segment = Self {
            base: base as usize,
            len,
            guard: page,
            ledger,
        };
        segment.ledger.register(segment.base, segment.len, segment.guard);
        Ok(segment)
    }

    /// Start of the mapping (guard page)
    pub fn base(&self) -> usize {
        self.base
    }

    /// Lowest usable address
    pub fn usable_start(&self) -> usize {
        self.base + self.guard
    }

    /// One past the highest usable address
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    /// Usable bytes
    pub fn usable_len(&self) -> usize {
        self.len - self.guard
    }

    /// Whether `addr` lies in the usable range
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.usable_start() && addr < self.end()
    }

    /// Commit pages in `[lo, hi)` (clamped to the usable range). Returns bytes covered.
    #[cfg(test)]
    pub(crate) fn populate(&self, lo: usize, hi: usize) -> Result<usize, StackError> {
        let (lo, hi) = self.clamp(lo, hi);
        populate_range(lo, hi)
    }

    /// Drop committed pages in `[lo, hi)` (clamped). Returns bytes covered.
    pub(crate) fn release(&self, lo: usize, hi: usize) -> Result<usize, StackError> {
        let (lo, hi) = self.clamp(lo, hi);
        release_range(lo, hi)
    }

    /// Drop every committed page of an idle segment
    pub(crate) fn release_all(&self) -> Result<usize, StackError> {
        self.release(self.usable_start(), self.end())
    }

    fn clamp(&self, lo: usize, hi: usize) -> (usize, usize) {
        let lo = page_align_down(lo.max(self.usable_start()));
        let hi = page_align_down(hi.min(self.end()));
        (lo, hi)
    }
}

impl Drop for StackSegment {
    fn drop(&mut self) {
        self.ledger.unregister(self.base);
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for StackSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackSegment")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .finish()
    }
}

/// Commit the page-aligned range `[lo, hi)`
pub(crate) fn populate_range(lo: usize, hi: usize) -> Result<usize, StackError> {
    if lo >= hi {
        return Ok(0);
    }
    let rc = unsafe { libc::madvise(lo as *mut libc::c_void, hi - lo, MADV_POPULATE_WRITE) };
    if rc != 0 {
        let errno = last_errno();
        if errno != libc::EINVAL {
            return Err(StackError::Advise(errno));
        }
        // Kernel without POPULATE_WRITE: fault the pages in by hand.
        let mut page = lo;
        while page < hi {
            unsafe { ptr::write_volatile(page as *mut u8, 0) };
            page += page_size();
        }
    }
    Ok(hi - lo)
}

/// Hand the page-aligned range `[lo, hi)` back to the kernel
pub(crate) fn release_range(lo: usize, hi: usize) -> Result<usize, StackError> {
    if lo >= hi {
        return Ok(0);
    }
    let rc = unsafe { libc::madvise(lo as *mut libc::c_void, hi - lo, libc::MADV_DONTNEED) };
    if rc != 0 {
        return Err(StackError::Advise(last_errno()));
    }
    Ok(hi - lo)
}

/// Resident-page scan of a usable range: (resident bytes, lowest page resident)
pub(crate) fn residency(usable_start: usize, end: usize) -> Result<(usize, bool), StackError> {
    let page = page_size();
    let pages = (end - usable_start) / page;
    if pages == 0 {
        return Ok((0, false));
    }
    let mut vec = vec![0u8; pages];
    let rc = unsafe {
        libc::mincore(
            usable_start as *mut libc::c_void,
            end - usable_start,
            vec.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(StackError::Advise(last_errno()));
    }
    let resident = vec.iter().filter(|b| **b & 1 == 1).count();
    Ok((resident * page, vec[0] & 1 == 1))
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Arc<Ledger> {
        Arc::new(Ledger::default())
    }

    #[test]
    fn test_map_layout() {
        let segment = StackSegment::map(64 * 1024, ledger()).unwrap();
        assert_eq!(segment.usable_start(), segment.base() + page_size());
        assert_eq!(segment.end() - segment.base(), 64 * 1024);
        assert!(segment.contains(segment.end() - 1));
        assert!(!segment.contains(segment.base()));
    }

    #[test]
    fn test_populate_then_release() {
        let segment = StackSegment::map(64 * 1024, ledger()).unwrap();
        let (before, _) = residency(segment.usable_start(), segment.end()).unwrap();
        segment
            .populate(segment.end() - 8 * page_size(), segment.end())
            .unwrap();
        let (after, _) = residency(segment.usable_start(), segment.end()).unwrap();
        assert!(after >= before + 8 * page_size());

        segment.release_all().unwrap();
        let (released, lowest) = residency(segment.usable_start(), segment.end()).unwrap();
        assert_eq!(released, 0);
        assert!(!lowest);
    }

    #[test]
    fn test_ledger_tracks_lifetime() {
        let ledger = ledger();
        let segment = StackSegment::map(64 * 1024, ledger.clone()).unwrap();
        assert_eq!(ledger.len(), 1);
        drop(segment);
        assert_eq!(ledger.len(), 0);
    }
}
