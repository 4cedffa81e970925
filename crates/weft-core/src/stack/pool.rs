//! Pool of reusable fiber stack segments.
//!
//! When a fiber finishes, its segment is returned to the pool. The next fiber
//! takes a recycled segment, reusing the mapping and whatever pages are still
//! committed instead of paying for a fresh mmap and first-touch faults.

use super::segment::{self, page_size, StackSegment};
use super::StackError;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Record of one live segment, kept for `dump`
#[derive(Debug, Clone, Copy)]
struct SegmentRecord {
    len: usize,
    guard: usize,
    in_use: bool,
}

/// Registry of every mapped segment owned by a pool
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    segments: Mutex<FxHashMap<usize, SegmentRecord>>,
}

impl Ledger {
    pub(crate) fn register(&self, base: usize, len: usize, guard: usize) {
        self.segments.lock().insert(
            base,
            SegmentRecord {
                len,
                guard,
                in_use: false,
            },
        );
    }

    pub(crate) fn unregister(&self, base: usize) {
        self.segments.lock().remove(&base);
    }

    fn mark(&self, base: usize, in_use: bool) {
        if let Some(record) = self.segments.lock().get_mut(&base) {
            record.in_use = in_use;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.segments.lock().len()
    }
}

/// One region reported by [`StackPool::dump`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRegion {
    /// Lowest usable address
    pub start: usize,
    /// One past the highest usable address
    pub end: usize,
    /// Committed (resident) bytes in the usable range
    pub bytes_used: usize,
    /// Human-readable owner description
    pub description: String,
    /// The page adjacent to the guard is committed: the fiber came within one
    /// page of overflowing
    pub fault: bool,
}

/// Pool of reusable stack segments.
///
/// Segments retain their mapping when returned to the pool, so subsequent
/// fibers reuse the memory without another mmap.
pub struct StackPool {
    free: Mutex<Vec<StackSegment>>,
    max_cached: usize,
    stack_size: usize,
    shrink_idle: bool,
    ledger: Arc<Ledger>,
    mapped: AtomicUsize,
}

impl StackPool {
    /// Create a pool handing out `stack_size`-byte segments and caching up to
    /// `max_cached` idle ones.
    pub fn new(stack_size: usize, max_cached: usize, shrink_idle: bool) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_cached)),
            max_cached,
            stack_size,
            shrink_idle,
            ledger: Arc::new(Ledger::default()),
            mapped: AtomicUsize::new(0),
        }
    }

    /// Whether fiber stacks are supported on this platform
    pub fn is_supported() -> bool {
        cfg!(target_os = "linux")
    }

    /// Segment size handed out by this pool
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Get a segment from the pool, or map a new one.
    pub fn allocate(&self) -> Result<StackSegment, StackError> {
        if !Self::is_supported() {
            return Err(StackError::Unsupported);
        }
        let recycled = self.free.lock().pop();
        let segment = match recycled {
            Some(segment) => segment,
            None => {
                let segment = StackSegment::map(self.stack_size, self.ledger.clone())?;
                self.mapped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(base = segment.base(), "mapped fiber stack");
                segment
            }
        };
        self.ledger.mark(segment.base(), true);
        Ok(segment)
    }

    /// Return a segment to the pool for reuse.
    pub fn deallocate(&self, segment: StackSegment) {
        self.ledger.mark(segment.base(), false);
        if self.shrink_idle {
            if let Err(err) = segment.release_all() {
                tracing::debug!(%err, "failed to release idle stack pages");
            }
        }
        let mut free = self.free.lock();
        if free.len() < self.max_cached {
            free.push(segment);
        } else {
            drop(free);
            self.mapped.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Commit the `bytes` below the current stack pointer of the running fiber,
    /// so a deep call chain does not fault page by page. Returns bytes covered.
    pub fn prepare(&self, bytes: usize) -> Result<usize, StackError> {
        let (start, end) = crate::fiber::current_stack().ok_or(StackError::NotOnFiber)?;
        // Skip the page holding this frame; it is already live.
        let hi = segment::page_align_down(stack_pointer()).saturating_sub(page_size());
        let lo = segment::page_align_down(hi.saturating_sub(bytes).max(start));
        segment::populate_range(lo, hi.min(end))
    }

    /// Release committed pages more than `threshold` bytes below the current
    /// stack pointer of the running fiber. Returns bytes released.
    pub fn shrink_current(&self, threshold: usize) -> Result<usize, StackError> {
        let (start, _) = crate::fiber::current_stack().ok_or(StackError::NotOnFiber)?;
        let hi = stack_pointer().saturating_sub(threshold.max(page_size()));
        if hi <= start {
            return Ok(0);
        }
        segment::release_range(segment::page_align_up(start), segment::page_align_down(hi))
    }

    /// Release the committed pages of every cached idle segment. Returns the
    /// number of segments trimmed.
    pub fn trim_idle(&self) -> usize {
        let free = self.free.lock();
        free.iter()
            .filter(|segment| segment.release_all().is_ok())
            .count()
    }

    /// Describe every live segment owned by this pool
    pub fn dump(&self) -> Vec<StackRegion> {
        let records: Vec<(usize, SegmentRecord)> = self
            .ledger
            .segments
            .lock()
            .iter()
            .map(|(base, record)| (*base, *record))
            .collect();

        let mut regions: Vec<StackRegion> = records
            .into_iter()
            .map(|(base, record)| {
                let start = base + record.guard;
                let end = base + record.len;
                let (bytes_used, fault) = segment::residency(start, end).unwrap_or((0, false));
                StackRegion {
                    start,
                    end,
                    bytes_used,
                    description: if record.in_use {
                        "fiber stack (in use)".to_string()
                    } else {
                        "fiber stack (idle)".to_string()
                    },
                    fault,
                }
            })
            .collect();
        regions.sort_by_key(|region| region.start);
        regions
    }

    /// Idle segments currently cached
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Segments currently mapped (idle and in use)
    pub fn mapped_count(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for StackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPool")
            .field("stack_size", &self.stack_size)
            .field("idle", &self.idle_count())
            .field("mapped", &self.mapped_count())
            .finish()
    }
}

/// Approximate stack pointer: the address of a local in a non-inlined frame
#[inline(never)]
fn stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}
