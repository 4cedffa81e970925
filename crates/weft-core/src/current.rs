//! The running task
//!
//! Functions here are cooperative checkpoints and suspension points for code
//! running inside a task. Task-only operations called from a plain thread
//! return [`TaskError::WrongContext`]; `sleep` and `sleep_until` fall back to
//! blocking the thread.
//!
//! The context lives in a thread-local set by the worker around each resume.
//! A task may continue on a different worker after any suspension point, so
//! every accessor here is `#[inline(never)]` and re-reads the thread-local.

use crate::error::{CancelReason, RtResult, TaskError};
use crate::fiber;
use crate::runtime::Runtime;
use crate::scheduler::{ExecutorId, ParkRequest, Shared, TaskId, TaskLocal, TaskRef};
use crate::value::Value;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Context {
    task: TaskRef,
    shared: Arc<Shared>,
    executor: Option<ExecutorId>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Restores the previous context on drop
pub(crate) struct ContextGuard {
    previous: Option<Context>,
}

/// Install `task` as the running task of this thread
pub(crate) fn enter(task: TaskRef, shared: Arc<Shared>, executor: Option<ExecutorId>) -> ContextGuard {
    let previous = CONTEXT.with(|context| {
        context.borrow_mut().replace(Context {
            task,
            shared,
            executor,
        })
    });
    ContextGuard { previous }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|context| *context.borrow_mut() = previous);
    }
}

#[inline(never)]
fn context() -> Option<(TaskRef, Arc<Shared>)> {
    CONTEXT.with(|context| {
        context
            .borrow()
            .as_ref()
            .map(|ctx| (ctx.task.clone(), ctx.shared.clone()))
    })
}

// ============================================================================
// Introspection
// ============================================================================

/// Whether the caller runs inside a task
#[inline(never)]
pub fn is_task() -> bool {
    CONTEXT.with(|context| context.borrow().is_some())
}

/// The running task
#[inline(never)]
pub fn current() -> Option<TaskRef> {
    CONTEXT.with(|context| context.borrow().as_ref().map(|ctx| ctx.task.clone()))
}

/// Id of the running task
#[inline(never)]
pub fn task_id() -> Option<TaskId> {
    CONTEXT.with(|context| context.borrow().as_ref().map(|ctx| ctx.task.id()))
}

/// Bound executor the running task executes on
#[inline(never)]
pub fn executor() -> Option<ExecutorId> {
    CONTEXT.with(|context| context.borrow().as_ref().and_then(|ctx| ctx.executor))
}

/// Runtime the running task belongs to
#[inline(never)]
pub fn runtime() -> Option<Runtime> {
    CONTEXT.with(|context| {
        context
            .borrow()
            .as_ref()
            .map(|ctx| Runtime::from_shared(ctx.shared.clone()))
    })
}

/// Run `f` with the running task's task-local store
pub fn task_local<R>(f: impl FnOnce(&TaskLocal) -> R) -> RtResult<R> {
    let task = current().ok_or(TaskError::WrongContext("task_local"))?;
    let local = task.task_local().ok_or(TaskError::TaskLocalDisabled)?;
    Ok(f(local))
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Raise the cancellation signal if cancellation was requested.
///
/// Also yields to other tasks once the running task has used up its quantum.
pub fn check_cancellation() -> RtResult<()> {
    let (task, shared) = context().ok_or(TaskError::WrongContext("check_cancellation"))?;
    if let Some(reason) = task.cancel_reason() {
        return Err(TaskError::Cancelled(reason));
    }
    let quantum = task.priority().quantum(shared.config.base_quantum());
    if task.slice_elapsed() >= quantum {
        drop(shared);
        suspend_with(&task, ParkRequest::Yield)?;
    }
    Ok(())
}

/// Cancel the running task and raise the cancellation signal
pub fn self_cancel() -> RtResult<()> {
    let task = current().ok_or(TaskError::WrongContext("self_cancel"))?;
    task.request_cancel(CancelReason::SelfCancelled);
    let reason = task.cancel_reason().unwrap_or(CancelReason::SelfCancelled);
    Err(TaskError::Cancelled(reason))
}

// ============================================================================
// Suspension points
// ============================================================================

/// Let other ready tasks run
pub fn yield_now() -> RtResult<()> {
    let task = current().ok_or(TaskError::WrongContext("yield_now"))?;
    suspend_with(&task, ParkRequest::Yield)
}

/// Park until `deadline`; blocks the thread outside a task
pub fn sleep_until(deadline: Instant) -> RtResult<()> {
    match current() {
        Some(task) => suspend_with(&task, ParkRequest::Sleep(deadline)),
        None => {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            Ok(())
        }
    }
}

/// Park for `duration`; blocks the thread outside a task
pub fn sleep(duration: Duration) -> RtResult<()> {
    sleep_until(Instant::now() + duration)
}

/// Publish a result value.
///
/// A yield-mode task parks until it is started again; any other task keeps
/// running.
pub fn yield_value(value: impl Into<Value>) -> RtResult<()> {
    let (task, shared) = context().ok_or(TaskError::WrongContext("yield_value"))?;
    if task.is_yield_mode() {
        drop(shared);
        return suspend_with(&task, ParkRequest::YieldValue(value.into()));
    }
    if let Ok(waiters) = task.result().push(value.into()) {
        shared.wake_all(waiters);
    }
    match task.cancel_reason() {
        Some(reason) => Err(TaskError::Cancelled(reason)),
        None => Ok(()),
    }
}

/// Park the running task until `target` completes
pub(crate) fn await_done(task: &TaskRef, target: &TaskRef) -> RtResult<()> {
    while !target.is_finished() {
        suspend_with(
            task,
            ParkRequest::Await {
                target: target.clone(),
                seen: None,
            },
        )?;
    }
    Ok(())
}

/// Park the running task until `target` has more than `seen` values or completes
pub(crate) fn await_progress(task: &TaskRef, target: &TaskRef, seen: usize) -> RtResult<()> {
    loop {
        let (len, done) = target.result().progress();
        if done || len > seen {
            return Ok(());
        }
        suspend_with(
            task,
            ParkRequest::Await {
                target: target.clone(),
                seen: Some(len),
            },
        )?;
    }
}

/// Take an admission slot, parking while the limit is reached
pub(crate) fn acquire_in_task(task: &TaskRef, shared: &Shared) -> RtResult<()> {
    loop {
        if shared.admission.try_acquire().is_ok() {
            return Ok(());
        }
        if shared.is_shutdown() {
            return Err(TaskError::ShutDown);
        }
        if let Err(err) = suspend_with(task, ParkRequest::Capacity) {
            shared.pass_capacity();
            return Err(err);
        }
    }
}

/// Switch to the worker, which commits `request`; then observe cancellation
#[inline(never)]
fn suspend_with(task: &TaskRef, request: ParkRequest) -> RtResult<()> {
    task.set_park_request(request);
    if !fiber::suspend() {
        task.take_park_request();
        return Err(TaskError::WrongContext("suspend outside a fiber"));
    }
    match task.cancel_reason() {
        Some(reason) => Err(TaskError::Cancelled(reason)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_task() {
        assert!(!is_task());
        assert_eq!(task_id(), None);
        assert!(current().is_none());
        assert_eq!(executor(), None);
        assert!(matches!(
            check_cancellation(),
            Err(TaskError::WrongContext("check_cancellation"))
        ));
        assert!(matches!(self_cancel(), Err(TaskError::WrongContext(_))));
        assert!(matches!(yield_now(), Err(TaskError::WrongContext(_))));
        assert!(matches!(yield_value(1i64), Err(TaskError::WrongContext(_))));
        assert!(matches!(task_local(|_| ()), Err(TaskError::WrongContext(_))));
    }

    #[test]
    fn test_sleep_blocks_thread_outside_task() {
        let start = Instant::now();
        sleep(Duration::from_millis(10)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
