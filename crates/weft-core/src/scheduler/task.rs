//! Task structure and execution state

use super::bound::ExecutorId;
use super::result::TaskResult;
use super::shared::Shared;
use crate::error::{CancelReason, RtResult};
use crate::fiber::Fiber;
use crate::value::{Callable, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Shared handle to a Task
pub type TaskRef = Arc<Task>;

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Scheduling priority.
///
/// Priority scales the execution quantum checked at `check_cancellation`; it
/// never reorders queues.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Half the base quantum
    Low,
    /// The base quantum
    #[default]
    Normal,
    /// Twice the base quantum
    High,
    /// Four times the base quantum
    Critical,
}

impl Priority {
    /// Quantum for this priority given the base quantum
    pub fn quantum(self, base: Duration) -> Duration {
        match self {
            Priority::Low => base / 2,
            Priority::Normal => base,
            Priority::High => base * 2,
            Priority::Critical => base * 4,
        }
    }
}

/// Observable run state of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, not yet queued
    Idle,
    /// In a ready queue (or about to be)
    Queued,
    /// Executing on a worker
    Running,
    /// Suspended on a timer, waiter list or yield
    Parked,
    /// TaskResult is complete
    Done,
}

const STATE_BITS: u64 = 3;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const IDLE: u64 = 0;
const QUEUED: u64 = 1;
const RUNNING: u64 = 2;
const PARKED: u64 = 3;
const DONE: u64 = 4;

fn decode_state(word: u64) -> TaskState {
    match word & STATE_MASK {
        IDLE => TaskState::Idle,
        QUEUED => TaskState::Queued,
        RUNNING => TaskState::Running,
        PARKED => TaskState::Parked,
        _ => TaskState::Done,
    }
}

/// Why a parked Task is parked
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ParkKind {
    None = 0,
    Await = 1,
    Sleep = 2,
    YieldMode = 3,
    Capacity = 4,
}

impl ParkKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ParkKind::Await,
            2 => ParkKind::Sleep,
            3 => ParkKind::YieldMode,
            4 => ParkKind::Capacity,
            _ => ParkKind::None,
        }
    }
}

/// What a fiber asks its worker to do after it switches out
pub(crate) enum ParkRequest {
    /// Requeue immediately
    Yield,
    /// Wake at the instant
    Sleep(Instant),
    /// Wake when `target` completes, or changes from `seen` values
    Await {
        target: TaskRef,
        seen: Option<usize>,
    },
    /// Publish a value and wait for the next start (yield-mode tasks)
    YieldValue(Value),
    /// Wake when admission capacity frees
    Capacity,
}

const NO_EXECUTOR: u32 = u32::MAX;

/// Hook invoked by `notify_cancel` on native-bridge placeholder Tasks
pub(crate) type CancelHook = Box<dyn FnOnce() + Send>;

/// Task-local key/value store
#[derive(Debug, Default)]
pub struct TaskLocal {
    entries: Mutex<FxHashMap<String, Value>>,
}

impl TaskLocal {
    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    /// Store `value` under `key`, returning the previous value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.lock().insert(key.into(), value.into())
    }

    /// Remove the value under `key`
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.lock().remove(key)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Optional parameters for task construction
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Give the task a task-local store
    pub task_local: bool,
    /// Handler invoked with the cancellation reason when the task ends cancelled
    pub on_cancel: Option<Callable>,
    /// Instant after which the timer controller cancels the task
    pub timeout: Option<Instant>,
    /// Scheduling priority
    pub priority: Priority,
    /// Bound executor the task runs on
    pub executor: Option<ExecutorId>,
    /// Generator-like task: each `yield_value` parks until the next start
    pub yield_mode: bool,
}

impl TaskOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a task-local store
    pub fn with_task_local(mut self) -> Self {
        self.task_local = true;
        self
    }

    /// Set the cancellation handler
    pub fn on_cancel(mut self, handler: Callable) -> Self {
        self.on_cancel = Some(handler);
        self
    }

    /// Cancel the task `after` from now
    pub fn with_timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(Instant::now() + after);
        self
    }

    /// Cancel the task at `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.timeout = Some(deadline);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Bind the task to a bound executor pool
    pub fn bound_to(mut self, executor: ExecutorId) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Make the task a generator
    pub fn yield_mode(mut self) -> Self {
        self.yield_mode = true;
        self
    }
}

enum Body {
    Callable(Callable),
    /// Completed from outside the worker pool (native bridge)
    Placeholder,
    /// Makes the worker that pops it exit
    Poison,
}

/// A lightweight cooperatively-scheduled job
pub struct Task {
    /// Unique identifier
    id: TaskId,

    body: Body,

    /// Arguments, taken when the body starts
    args: Mutex<Option<Vec<Value>>>,

    priority: Priority,
    timeout: Option<Instant>,
    on_cancel: Option<Callable>,
    task_local: Option<TaskLocal>,
    yield_mode: bool,

    /// Flips false→true at most once
    started: AtomicBool,

    /// Set once a worker has picked the task up
    awaked: AtomicBool,

    /// Park sequence and state: `seq << 3 | state`
    run: AtomicU64,

    park_kind: AtomicU8,

    /// 0 = not requested, otherwise a `CancelReason` code
    cancel: AtomicU8,

    /// Bound executor id, or `NO_EXECUTOR`
    executor: AtomicU32,

    result: TaskResult,

    /// Parked fiber, present only while the task is suspended
    fiber: Mutex<Option<Fiber>>,

    park_request: Mutex<Option<ParkRequest>>,

    /// Outcome stored by the body before its fiber finishes
    outcome: Mutex<Option<RtResult<Vec<Value>>>>,

    cancel_hook: Mutex<Option<CancelHook>>,

    /// Start of the current execution slice
    slice_start: Mutex<Option<Instant>>,

    /// Next index handed out by `yield_iterate`
    yield_cursor: AtomicUsize,

    /// Counted in the planned-task counter
    planned: AtomicBool,

    shared: Weak<Shared>,
}

impl Task {
    pub(crate) fn new(
        shared: &Arc<Shared>,
        callable: Callable,
        args: Vec<Value>,
        options: TaskOptions,
    ) -> Self {
        let mut task = Self::blank(shared, Body::Callable(callable));
        *task.args.get_mut() = Some(args);
        task.priority = options.priority;
        task.timeout = options.timeout;
        task.on_cancel = options.on_cancel;
        task.task_local = options.task_local.then(TaskLocal::default);
        task.yield_mode = options.yield_mode;
        task.executor = AtomicU32::new(options.executor.map_or(NO_EXECUTOR, |id| id.0 as u32));
        task.planned = AtomicBool::new(true);
        task
    }

    /// A task that is already complete with `values`
    pub(crate) fn completed(shared: &Arc<Shared>, values: Vec<Value>) -> Self {
        let mut task = Self::blank(shared, Body::Placeholder);
        task.result = TaskResult::completed(values);
        task.started = AtomicBool::new(true);
        task.run = AtomicU64::new(DONE);
        task
    }

    /// A started task completed by the native bridge or a foreign thread
    pub(crate) fn placeholder(shared: &Arc<Shared>) -> Self {
        let task = Self::blank(shared, Body::Placeholder);
        task.started.store(true, Ordering::Relaxed);
        task.run.store(RUNNING, Ordering::Relaxed);
        task
    }

    pub(crate) fn poison(shared: &Arc<Shared>) -> Self {
        Self::blank(shared, Body::Poison)
    }

    fn blank(shared: &Arc<Shared>, body: Body) -> Self {
        Self {
            id: TaskId::new(),
            body,
            args: Mutex::new(None),
            priority: Priority::Normal,
            timeout: None,
            on_cancel: None,
            task_local: None,
            yield_mode: false,
            started: AtomicBool::new(false),
            awaked: AtomicBool::new(false),
            run: AtomicU64::new(IDLE),
            park_kind: AtomicU8::new(ParkKind::None as u8),
            cancel: AtomicU8::new(0),
            executor: AtomicU32::new(NO_EXECUTOR),
            result: TaskResult::new(),
            fiber: Mutex::new(None),
            park_request: Mutex::new(None),
            outcome: Mutex::new(None),
            cancel_hook: Mutex::new(None),
            slice_start: Mutex::new(None),
            yield_cursor: AtomicUsize::new(0),
            planned: AtomicBool::new(false),
            shared: Arc::downgrade(shared),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has been started (or scheduled)
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether a worker has picked the task up
    pub fn is_awaked(&self) -> bool {
        self.awaked.load(Ordering::Acquire)
    }

    /// Whether the result is complete
    pub fn is_finished(&self) -> bool {
        self.result.is_done()
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) != 0
    }

    /// Requested cancellation reason
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        CancelReason::from_code(self.cancel.load(Ordering::SeqCst))
    }

    /// Whether this is a generator task
    pub fn is_yield_mode(&self) -> bool {
        self.yield_mode
    }

    /// Scheduling priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Timeout instant
    pub fn timeout(&self) -> Option<Instant> {
        self.timeout
    }

    /// Current run state
    pub fn state(&self) -> TaskState {
        decode_state(self.run.load(Ordering::SeqCst))
    }

    /// Completion state
    pub fn result(&self) -> &TaskResult {
        &self.result
    }

    /// Task-local store, if requested at construction
    pub fn task_local(&self) -> Option<&TaskLocal> {
        self.task_local.as_ref()
    }

    /// Bound executor the task is routed to
    pub fn executor(&self) -> Option<ExecutorId> {
        match self.executor.load(Ordering::Acquire) {
            NO_EXECUTOR => None,
            raw => Some(ExecutorId(raw as u16)),
        }
    }

    /// Scheduler state of the runtime that created the task
    pub(crate) fn owner(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    pub(crate) fn unbind(&self) {
        self.executor.store(NO_EXECUTOR, Ordering::Release);
    }

    pub(crate) fn is_poison(&self) -> bool {
        matches!(self.body, Body::Poison)
    }

    pub(crate) fn callable(&self) -> Option<&Callable> {
        match &self.body {
            Body::Callable(callable) => Some(callable),
            _ => None,
        }
    }

    pub(crate) fn on_cancel(&self) -> Option<&Callable> {
        self.on_cancel.as_ref()
    }

    pub(crate) fn take_args(&self) -> Vec<Value> {
        self.args.lock().take().unwrap_or_default()
    }

    // ========================================================================
    // Lifecycle flags
    // ========================================================================

    /// Flip `started`; true only for the first caller
    pub(crate) fn mark_started(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_awaked(&self) {
        self.awaked.store(true, Ordering::Release);
    }

    /// Leave the planned-task count; true if the task was counted
    pub(crate) fn take_planned(&self) -> bool {
        self.planned.swap(false, Ordering::AcqRel)
    }

    /// Set the cancellation flag unless already set. Returns true if set now.
    pub(crate) fn request_cancel(&self, reason: CancelReason) -> bool {
        self.cancel
            .compare_exchange(0, reason.code(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // ========================================================================
    // Run state
    // ========================================================================

    /// Idle → Queued
    pub(crate) fn try_queue(&self) -> bool {
        let word = self.run.load(Ordering::SeqCst);
        if word & STATE_MASK != IDLE {
            return false;
        }
        self.run
            .compare_exchange(word, (word & !STATE_MASK) | QUEUED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn set_running(&self) {
        self.set_state(RUNNING);
    }

    pub(crate) fn set_queued(&self) {
        self.set_state(QUEUED);
    }

    pub(crate) fn set_done(&self) {
        self.set_state(DONE);
    }

    fn set_state(&self, state: u64) {
        let _ = self
            .run
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                Some((word & !STATE_MASK) | state)
            });
    }

    /// Running → Parked under a fresh sequence number, which is returned.
    pub(crate) fn park(&self, kind: ParkKind) -> u64 {
        self.park_kind.store(kind as u8, Ordering::SeqCst);
        let previous = self
            .run
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                let seq = (word >> STATE_BITS) + 1;
                Some((seq << STATE_BITS) | PARKED)
            })
            .unwrap_or_else(|word| word);
        (previous >> STATE_BITS) + 1
    }

    /// Parked under `seq` → Queued. Fails for stale or duplicate wakes.
    pub(crate) fn try_wake(&self, seq: u64) -> bool {
        let parked = (seq << STATE_BITS) | PARKED;
        let queued = (seq << STATE_BITS) | QUEUED;
        self.run
            .compare_exchange(parked, queued, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Sequence number of the current park, if parked (optionally of `kind`)
    pub(crate) fn parked_seq(&self, kind: Option<ParkKind>) -> Option<u64> {
        let word = self.run.load(Ordering::SeqCst);
        if word & STATE_MASK != PARKED {
            return None;
        }
        if let Some(kind) = kind {
            if ParkKind::from_u8(self.park_kind.load(Ordering::SeqCst)) != kind {
                return None;
            }
        }
        Some(word >> STATE_BITS)
    }

    // ========================================================================
    // Worker hand-off slots
    // ========================================================================

    pub(crate) fn take_fiber(&self) -> Option<Fiber> {
        self.fiber.lock().take()
    }

    pub(crate) fn store_fiber(&self, fiber: Fiber) {
        *self.fiber.lock() = Some(fiber);
    }

    pub(crate) fn set_park_request(&self, request: ParkRequest) {
        *self.park_request.lock() = Some(request);
    }

    pub(crate) fn take_park_request(&self) -> Option<ParkRequest> {
        self.park_request.lock().take()
    }

    pub(crate) fn set_outcome(&self, outcome: RtResult<Vec<Value>>) {
        *self.outcome.lock() = Some(outcome);
    }

    pub(crate) fn take_outcome(&self) -> Option<RtResult<Vec<Value>>> {
        self.outcome.lock().take()
    }

    pub(crate) fn set_cancel_hook(&self, hook: CancelHook) {
        *self.cancel_hook.lock() = Some(hook);
    }

    pub(crate) fn take_cancel_hook(&self) -> Option<CancelHook> {
        self.cancel_hook.lock().take()
    }

    pub(crate) fn begin_slice(&self) {
        *self.slice_start.lock() = Some(Instant::now());
    }

    /// Time spent in the current execution slice
    pub(crate) fn slice_elapsed(&self) -> Duration {
        self.slice_start
            .lock()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// Claim the next `yield_iterate` index
    pub(crate) fn yield_cursor(&self) -> &AtomicUsize {
        &self.yield_cursor
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.take_planned() {
            if let Some(shared) = self.shared.upgrade() {
                shared.release_planned();
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("started", &self.is_started())
            .field("priority", &self.priority)
            .finish()
    }
}
