//! Completion state shared by a Task and everyone awaiting it

use super::task::TaskRef;
use crate::error::{RtResult, TaskError};
use crate::value::Value;
use parking_lot::{Condvar, Mutex};

/// A parked fiber waiting for progress on some TaskResult
pub(crate) struct Waiter {
    pub(crate) task: TaskRef,
    /// Park sequence the waiter was parked under
    pub(crate) seq: u64,
}

#[derive(Default)]
struct ResultState {
    values: Vec<Value>,
    error: Option<TaskError>,
    end_of_life: bool,
    waiters: Vec<Waiter>,
}

/// Ordered result values, a terminal error slot and the completion flag.
///
/// Threads wait on the condition variable; fibers register as waiters and are
/// woken through the scheduler.
#[derive(Default)]
pub struct TaskResult {
    state: Mutex<ResultState>,
    cond: Condvar,
}

impl TaskResult {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A result that is already complete with `values`
    pub(crate) fn completed(values: Vec<Value>) -> Self {
        Self {
            state: Mutex::new(ResultState {
                values,
                end_of_life: true,
                ..ResultState::default()
            }),
            cond: Condvar::new(),
        }
    }

    /// Append a yielded value. Rejected once the result is complete.
    pub(crate) fn push(&self, value: Value) -> Result<Vec<Waiter>, Value> {
        let mut state = self.state.lock();
        if state.end_of_life {
            return Err(value);
        }
        state.values.push(value);
        self.cond.notify_all();
        Ok(std::mem::take(&mut state.waiters))
    }

    /// Record the terminal outcome. Returns the waiters to wake, or `None` if
    /// the result was already complete.
    pub(crate) fn finish(&self, outcome: RtResult<Vec<Value>>) -> Option<Vec<Waiter>> {
        let mut state = self.state.lock();
        if state.end_of_life {
            return None;
        }
        match outcome {
            Ok(values) => state.values.extend(values),
            Err(err) => state.error = Some(err),
        }
        state.end_of_life = true;
        self.cond.notify_all();
        Some(std::mem::take(&mut state.waiters))
    }

    /// Register a fiber waiter.
    ///
    /// With `seen == None` the waiter wants completion; with `Some(n)` it wants
    /// any change from `n` values. Returns `false` (not registered) when that
    /// has already happened.
    pub(crate) fn register(&self, waiter: Waiter, seen: Option<usize>) -> bool {
        let mut state = self.state.lock();
        let satisfied = state.end_of_life || seen.is_some_and(|n| state.values.len() != n);
        if satisfied {
            return false;
        }
        state.waiters.push(waiter);
        true
    }

    /// Block the calling thread until the result is complete
    pub(crate) fn wait_done(&self) {
        let mut state = self.state.lock();
        while !state.end_of_life {
            self.cond.wait(&mut state);
        }
    }

    /// Block the calling thread until more than `seen` values exist or the
    /// result is complete
    pub(crate) fn wait_progress(&self, seen: usize) {
        let mut state = self.state.lock();
        while !state.end_of_life && state.values.len() <= seen {
            self.cond.wait(&mut state);
        }
    }

    /// Whether `end_of_life` is set
    pub fn is_done(&self) -> bool {
        self.state.lock().end_of_life
    }

    /// Number of values produced so far
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    /// Whether no values were produced yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the value at `index`
    pub fn value_at(&self, index: usize) -> Option<Value> {
        self.state.lock().values.get(index).cloned()
    }

    /// Copy of every value produced so far
    pub fn values(&self) -> Vec<Value> {
        self.state.lock().values.clone()
    }

    /// Terminal error, if the task failed
    pub fn error(&self) -> Option<TaskError> {
        self.state.lock().error.clone()
    }

    /// Values or terminal error of a completed result
    pub fn outcome(&self) -> Option<RtResult<Vec<Value>>> {
        let state = self.state.lock();
        if !state.end_of_life {
            return None;
        }
        Some(match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(state.values.clone()),
        })
    }

    /// `(values produced, complete)` read under one lock
    pub(crate) fn progress(&self) -> (usize, bool) {
        let state = self.state.lock();
        (state.values.len(), state.end_of_life)
    }
}

impl std::fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskResult")
            .field("values", &state.values)
            .field("error", &state.error)
            .field("end_of_life", &state.end_of_life)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
