//! Fiber stack memory
//!
//! Each fiber runs on a [`StackSegment`]: an anonymous mapping with a
//! `PROT_NONE` guard page at its low end. Segments are handed out and recycled
//! by a [`StackPool`], which can also pre-commit pages below the running
//! fiber's stack pointer, release pages a fiber no longer uses, and report
//! every live segment for diagnostics.

mod pool;
mod segment;

pub use pool::{StackPool, StackRegion};
pub use segment::{page_size, StackSegment};
pub(crate) use segment::last_errno;

/// Stack memory errors
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// `mmap` failed
    #[error("Failed to map fiber stack (errno {0})")]
    Map(i32),

    /// `mprotect` on the guard page failed
    #[error("Failed to protect guard page (errno {0})")]
    Protect(i32),

    /// `madvise` or `mincore` failed
    #[error("Failed to advise stack pages (errno {0})")]
    Advise(i32),

    /// `getcontext` failed while preparing a fiber
    #[error("Failed to initialise fiber context (errno {0})")]
    Context(i32),

    /// A current-fiber operation was called off a fiber
    #[error("Not running on a fiber stack")]
    NotOnFiber,

    /// Fiber stacks are not available on this platform
    #[error("Fiber stacks are not supported on this platform")]
    Unsupported,
}
