//! Worker threads that execute Tasks on fibers
//!
//! A worker pops a task, resumes its parked fiber (or creates one on a pooled
//! stack) and runs it until the fiber finishes or suspends. After a suspension
//! the worker commits the park the fiber requested. The fiber is stored back
//! on the task before the park becomes visible, so whoever wakes the task
//! always finds it.

use super::bound::{BoundPool, ExecutorId};
use super::result::Waiter;
use super::shared::{Shared, TimedKind};
use super::task::{ParkKind, ParkRequest, TaskRef};
use crate::current;
use crate::error::{RtResult, TaskError};
use crate::fiber::{Fiber, FiberState};
use crate::value::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Spawn one global worker thread
pub(crate) fn spawn_global(shared: Arc<Shared>) -> RtResult<JoinHandle<()>> {
    let n = shared.worker_seq.fetch_add(1, Ordering::Relaxed);
    shared.executors.fetch_add(1, Ordering::AcqRel);
    let worker_shared = shared.clone();
    thread::Builder::new()
        .name(format!("weft-worker-{}", n))
        .spawn(move || run_global(worker_shared, n))
        .map_err(|err| {
            global_exit(&shared);
            TaskError::from_io(&err)
        })
}

/// Spawn one worker for a bound pool whose `executors` already counts it
pub(crate) fn spawn_bound(
    shared: Arc<Shared>,
    pool: Arc<BoundPool>,
    n: usize,
) -> RtResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("weft-bound-{}-{}", pool.id().as_u16(), n))
        .spawn(move || run_bound(shared, pool, n))
        .map_err(|err| TaskError::from_io(&err))
}

fn run_global(shared: Arc<Shared>, n: usize) {
    tracing::debug!(worker = n, "worker started");
    loop {
        let task = shared.next_task();
        if task.is_poison() {
            break;
        }
        run_task(&shared, task, None);
    }
    global_exit(&shared);
    tracing::debug!(worker = n, "worker exited");
}

fn global_exit(shared: &Shared) {
    let _glob = shared.glob.lock();
    shared.executors.fetch_sub(1, Ordering::AcqRel);
    shared.drain_cv.notify_all();
}

fn run_bound(shared: Arc<Shared>, pool: Arc<BoundPool>, n: usize) {
    let id = pool.id();
    tracing::debug!(executor = %id, worker = n, "bound worker started");
    loop {
        let task = pool.next_task();
        if task.is_poison() {
            break;
        }
        run_task(&shared, task, Some(id));
    }
    pool.worker_exited();
    tracing::debug!(executor = %id, worker = n, "bound worker exited");
}

/// Run one slice of `task`
pub(crate) fn run_task(shared: &Arc<Shared>, task: TaskRef, executor: Option<ExecutorId>) {
    if task.is_finished() {
        return;
    }

    let mut fiber = match task.take_fiber() {
        Some(fiber) => fiber,
        None => match new_fiber(shared, &task) {
            Ok(fiber) => fiber,
            Err(err) => {
                tracing::warn!(task = %task.id(), %err, "failed to create fiber");
                shared.finalize(&task, Err(err));
                return;
            }
        },
    };

    task.set_running();
    task.mark_awaked();
    task.begin_slice();
    shared.in_exec.fetch_add(1, Ordering::AcqRel);
    let state = {
        let _context = current::enter(task.clone(), shared.clone(), executor);
        fiber.resume()
    };
    shared.in_exec.fetch_sub(1, Ordering::AcqRel);

    match state {
        FiberState::Finished => {
            let outcome = task.take_outcome().unwrap_or_else(|| {
                Err(TaskError::Panicked("fiber finished without an outcome".to_string()))
            });
            if let Some(stack) = fiber.into_stack() {
                shared.stacks.deallocate(stack);
            }
            shared.finalize(&task, outcome);
        }
        FiberState::Suspended => {
            let request = task.take_park_request().unwrap_or(ParkRequest::Yield);
            task.store_fiber(fiber);
            commit_park(shared, task, request);
        }
    }
}

fn new_fiber(shared: &Arc<Shared>, task: &TaskRef) -> RtResult<Fiber> {
    let stack = shared.stacks.allocate()?;
    let body_task = task.clone();
    Ok(Fiber::new(stack, move || {
        let outcome = run_body(&body_task);
        body_task.set_outcome(outcome);
    })?)
}

/// Invoke the callable, capturing panics; run the cancel handler on a
/// cancelled outcome
fn run_body(task: &TaskRef) -> RtResult<Vec<Value>> {
    let Some(callable) = task.callable().cloned() else {
        return Ok(Vec::new());
    };
    let args = task.take_args();

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| callable(args))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(task = %task.id(), panic = %message, "task panicked");
            Err(TaskError::Panicked(message))
        }
    };

    if let Err(TaskError::Cancelled(reason)) = &outcome {
        if let Some(handler) = task.on_cancel() {
            let args = vec![Value::from(reason.as_str())];
            if panic::catch_unwind(AssertUnwindSafe(|| handler(args))).is_err() {
                tracing::warn!(task = %task.id(), "cancellation handler panicked");
            }
        }
    }
    outcome
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Apply the park a suspended fiber asked for
fn commit_park(shared: &Arc<Shared>, task: TaskRef, request: ParkRequest) {
    let seq = match request {
        ParkRequest::Yield => {
            task.set_queued();
            shared.enqueue(task);
            return;
        }
        ParkRequest::Sleep(due) => {
            let seq = task.park(ParkKind::Sleep);
            shared.push_timed(due, TimedKind::Wake(task.clone(), seq));
            seq
        }
        ParkRequest::Await { target, seen } => {
            let seq = task.park(ParkKind::Await);
            let waiter = Waiter {
                task: task.clone(),
                seq,
            };
            if !target.result().register(waiter, seen) {
                shared.wake(&task, seq);
            }
            seq
        }
        ParkRequest::YieldValue(value) => {
            // Park before publishing: a consumer that sees the value may start
            // the task again right away.
            let seq = task.park(ParkKind::YieldMode);
            match task.result().push(value) {
                Ok(waiters) => shared.wake_all(waiters),
                Err(_) => {
                    shared.wake(&task, seq);
                }
            }
            seq
        }
        ParkRequest::Capacity => {
            let seq = task.park(ParkKind::Capacity);
            let waiter = Waiter {
                task: task.clone(),
                seq,
            };
            if !shared.admission.register(waiter) {
                shared.wake(&task, seq);
            }
            seq
        }
    };

    // Pairs with the flag-then-state order in `Shared::cancel`.
    if task.is_cancelled() {
        shared.wake(&task, seq);
    }
}
