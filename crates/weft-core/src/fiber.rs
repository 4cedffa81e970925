//! Stackful coroutines
//!
//! A [`Fiber`] runs a closure on its own [`StackSegment`]. The worker thread
//! calls [`Fiber::resume`]; code running on the fiber calls [`suspend`] to
//! switch back. A suspended fiber may be resumed by a different worker thread.
//!
//! Switching uses `getcontext`/`makecontext`/`swapcontext`. The caller's
//! context lives on the resuming thread's stack for the duration of one
//! `resume` call, so the fiber always returns to whoever resumed it last.
//!
//! Thread-local state must not be cached across a switch: after `suspend`
//! returns, the fiber may be running on another thread. Accessors that read
//! thread-locals are kept out of line so the compiler re-derives the address
//! on every call.

use crate::stack::{StackError, StackSegment};
use std::cell::Cell;
use std::mem::MaybeUninit;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

thread_local! {
    static CURRENT_FIBER: Cell<*mut FiberInner> = const { Cell::new(ptr::null_mut()) };
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

struct FiberInner {
    context: libc::ucontext_t,
    /// Context of the thread that resumed us last
    caller: *mut libc::ucontext_t,
    entry: Option<Entry>,
    started: bool,
    finished: bool,
    stack: Option<StackSegment>,
}

/// Outcome of one [`Fiber::resume`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberState {
    /// The fiber called [`suspend`] and can be resumed again
    Suspended,
    /// The entry closure returned
    Finished,
}

/// A stackful coroutine
pub struct Fiber {
    // Boxed: glibc's ucontext_t points into itself, so it must not move.
    inner: Box<FiberInner>,
}

// The raw pointers inside are only dereferenced by the thread currently
// resuming the fiber.
unsafe impl Send for Fiber {}

impl Fiber {
    /// Prepare a fiber that will run `entry` on `stack` when first resumed.
    pub fn new<F>(stack: StackSegment, entry: F) -> Result<Self, StackError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = Box::new(FiberInner {
            context: unsafe { MaybeUninit::zeroed().assume_init() },
            caller: ptr::null_mut(),
            entry: Some(Box::new(entry)),
            started: false,
            finished: false,
            stack: None,
        });

        unsafe {
            if libc::getcontext(&mut inner.context) != 0 {
                return Err(StackError::Context(crate::stack::last_errno()));
            }
            inner.context.uc_stack.ss_sp = stack.usable_start() as *mut libc::c_void;
            inner.context.uc_stack.ss_size = stack.usable_len();
            inner.context.uc_stack.ss_flags = 0;
            inner.context.uc_link = ptr::null_mut();
            libc::makecontext(&mut inner.context, fiber_main, 0);
        }
        inner.stack = Some(stack);

        Ok(Self { inner })
    }

    /// Run the fiber until it suspends or finishes.
    ///
    /// Resuming a finished fiber is a no-op returning `Finished`.
    pub fn resume(&mut self) -> FiberState {
        if self.inner.finished {
            return FiberState::Finished;
        }

        let mut caller: libc::ucontext_t = unsafe { MaybeUninit::zeroed().assume_init() };
        let inner: *mut FiberInner = &mut *self.inner;
        let previous = set_current(inner);
        unsafe {
            (*inner).caller = &mut caller;
            (*inner).started = true;
            libc::swapcontext(&mut caller, &(*inner).context);
            (*inner).caller = ptr::null_mut();
        }
        set_current(previous);

        if self.inner.finished {
            FiberState::Finished
        } else {
            FiberState::Suspended
        }
    }

    /// Whether the entry closure has returned
    pub fn is_finished(&self) -> bool {
        self.inner.finished
    }

    /// Usable bounds `(start, end)` of this fiber's stack
    pub fn stack_bounds(&self) -> Option<(usize, usize)> {
        self.inner
            .stack
            .as_ref()
            .map(|stack| (stack.usable_start(), stack.end()))
    }

    /// Recover the stack of a finished (or never started) fiber for reuse.
    ///
    /// Returns `None` for a fiber that is suspended mid-execution; its frames
    /// are still live.
    pub fn into_stack(mut self) -> Option<StackSegment> {
        if self.inner.started && !self.inner.finished {
            return None;
        }
        self.inner.stack.take()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.inner.started && !self.inner.finished {
            // Frames on this stack are never unwound; objects they own leak and
            // the mapping stays reserved so nothing can dangle into it.
            if let Some(stack) = self.inner.stack.take() {
                tracing::debug!(
                    base = stack.base(),
                    "dropping suspended fiber, leaking its stack"
                );
                std::mem::forget(stack);
            }
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("started", &self.inner.started)
            .field("finished", &self.inner.finished)
            .finish()
    }
}

/// Switch from the running fiber back to the thread that resumed it.
///
/// Returns `false` without switching when called off a fiber.
#[inline(never)]
pub fn suspend() -> bool {
    let inner = current_ptr();
    if inner.is_null() {
        return false;
    }
    unsafe {
        let caller = (*inner).caller;
        libc::swapcontext(&mut (*inner).context, caller);
    }
    // Possibly on another thread now; thread-locals must be re-read.
    true
}

/// Whether the calling code runs on a fiber
#[inline(never)]
pub fn on_fiber() -> bool {
    !current_ptr().is_null()
}

/// Usable stack bounds of the running fiber
#[inline(never)]
pub fn current_stack() -> Option<(usize, usize)> {
    let inner = current_ptr();
    if inner.is_null() {
        return None;
    }
    unsafe {
        (*inner)
            .stack
            .as_ref()
            .map(|stack| (stack.usable_start(), stack.end()))
    }
}

#[inline(never)]
fn current_ptr() -> *mut FiberInner {
    CURRENT_FIBER.with(|current| current.get())
}

#[inline(never)]
fn set_current(inner: *mut FiberInner) -> *mut FiberInner {
    CURRENT_FIBER.with(|current| current.replace(inner))
}

extern "C" fn fiber_main() {
    let inner = current_ptr();
    unsafe {
        if let Some(entry) = (*inner).entry.take() {
            if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                // Unwinding cannot cross the context switch.
                tracing::error!("panic escaped a fiber entry");
                std::process::abort();
            }
        }
        (*inner).finished = true;
        libc::setcontext((*inner).caller);
    }
    std::process::abort();
}
