//! Process-wide scheduler state
//!
//! One `Shared` value owns the ready queues, the timed structures and the
//! counters every worker, the timer controller and the public API operate on.
//!
//! # Queues
//!
//! - **hot**: `VecDeque` under the `glob` mutex, drained first
//! - **cold**: lock-free `Injector`, used once the hot backlog reaches
//!   `executors × hot_backlog_per_executor`
//! - **timed hot / timed cold**: min-heaps ordered by due instant; the cold
//!   heap takes overflow beyond `timed_hot_capacity`
//!
//! Workers sleep on `work_cv`, the timer controller on `timer_cv`; both use
//! the `glob` mutex.

use super::admission::Admission;
use super::bound::BoundRegistry;
use super::result::Waiter;
use super::task::{ParkKind, Task, TaskId, TaskRef};
use super::timer;
use crate::config::RuntimeConfig;
use crate::error::{CancelReason, RtResult, TaskError};
use crate::stack::StackPool;
use crate::value::Value;
use crossbeam_deque::{Injector, Steal};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// What happens when a timed entry comes due
pub(crate) enum TimedKind {
    /// Start a scheduled task
    Start(TaskRef),
    /// Wake a task parked under `seq`
    Wake(TaskRef, u64),
    /// Cancel the task with `Timeout` if still unfinished
    Deadline(TaskRef),
}

pub(crate) struct TimedEntry {
    pub(crate) due: Instant,
    /// Insertion order, breaks ties between equal instants
    pub(crate) order: u64,
    pub(crate) kind: TimedKind,
}

impl TimedEntry {
    pub(crate) fn task(&self) -> &TaskRef {
        match &self.kind {
            TimedKind::Start(task) | TimedKind::Wake(task, _) | TimedKind::Deadline(task) => task,
        }
    }
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl Eq for TimedEntry {}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEntry {
    // Reversed: BinaryHeap is a max-heap, the earliest entry must be on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// State guarded by the `glob` mutex
#[derive(Default)]
pub(crate) struct GlobState {
    pub(crate) hot: VecDeque<TaskRef>,
    pub(crate) timed_hot: BinaryHeap<TimedEntry>,
    pub(crate) timer_running: bool,
}

pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,

    pub(crate) glob: Mutex<GlobState>,
    /// Ready work available
    pub(crate) work_cv: Condvar,
    /// Executor count changed
    pub(crate) drain_cv: Condvar,
    /// Timed structure changed
    pub(crate) timer_cv: Condvar,

    pub(crate) cold: Injector<TaskRef>,
    pub(crate) timed_cold: Mutex<BinaryHeap<TimedEntry>>,

    pub(crate) hot_len: AtomicUsize,
    pub(crate) cold_len: AtomicUsize,
    pub(crate) timed_hot_len: AtomicUsize,
    pub(crate) timed_cold_len: AtomicUsize,

    /// Global workers sleeping on `work_cv`
    pub(crate) idle: AtomicUsize,
    /// Live global workers
    pub(crate) executors: AtomicUsize,
    /// Global worker count requested by configuration or `resize_executors`
    pub(crate) target_executors: AtomicUsize,
    /// Tasks currently executing on any worker
    pub(crate) in_exec: AtomicUsize,

    pub(crate) shutdown: AtomicBool,

    /// Started, unfinished tasks
    pub(crate) active: DashMap<TaskId, TaskRef>,

    pub(crate) admission: Admission,
    pub(crate) bound: BoundRegistry,
    pub(crate) stacks: StackPool,

    pub(crate) timer: Mutex<Option<JoinHandle<()>>>,
    pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) worker_seq: AtomicUsize,
    timed_order: AtomicU64,
}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig) -> Arc<Self> {
        let stacks = StackPool::new(
            config.effective_stack_size(),
            config.stack_cache,
            config.shrink_idle_stacks,
        );
        Arc::new(Self {
            admission: Admission::new(config.max_planned_tasks),
            bound: BoundRegistry::new(),
            stacks,
            glob: Mutex::new(GlobState::default()),
            work_cv: Condvar::new(),
            drain_cv: Condvar::new(),
            timer_cv: Condvar::new(),
            cold: Injector::new(),
            timed_cold: Mutex::new(BinaryHeap::new()),
            hot_len: AtomicUsize::new(0),
            cold_len: AtomicUsize::new(0),
            timed_hot_len: AtomicUsize::new(0),
            timed_cold_len: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            executors: AtomicUsize::new(0),
            target_executors: AtomicUsize::new(0),
            in_exec: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            active: DashMap::new(),
            timer: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            worker_seq: AtomicUsize::new(0),
            timed_order: AtomicU64::new(0),
            config,
        })
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ========================================================================
    // Task construction
    // ========================================================================

    pub(crate) fn poison(self: &Arc<Self>) -> TaskRef {
        Arc::new(Task::poison(self))
    }

    /// Slot freed: wake one parked constructor, if any. Entries whose park
    /// already ended (cancel, timeout) are skipped.
    pub(crate) fn release_planned(&self) {
        let first = self.admission.release();
        self.wake_constructor(first);
    }

    /// A woken constructor left without its slot (cancelled): pass the free
    /// slot on to the next parked one.
    pub(crate) fn pass_capacity(&self) {
        if self.admission.has_room() {
            let first = self.admission.pop_waiter();
            self.wake_constructor(first);
        }
    }

    fn wake_constructor(&self, mut next: Option<Waiter>) {
        while let Some(waiter) = next {
            if self.wake(&waiter.task, waiter.seq) {
                return;
            }
            next = self.admission.pop_waiter();
        }
    }

    // ========================================================================
    // Ready queues
    // ========================================================================

    /// Make a task ready, on its bound executor if it has one
    pub(crate) fn enqueue(&self, task: TaskRef) {
        if let Some(id) = task.executor() {
            match self.bound.get(id) {
                Some(pool) => match pool.push(task) {
                    Ok(()) => return,
                    Err(task) => return self.enqueue_global(task),
                },
                None => {
                    tracing::trace!(task = %task.id(), executor = %id, "executor gone, routing globally");
                }
            }
        }
        self.enqueue_global(task);
    }

    /// Push to the hot queue if its backlog allows, else to the cold queue
    pub(crate) fn enqueue_global(&self, task: TaskRef) {
        if self.is_shutdown() && self.executors.load(Ordering::Acquire) == 0 {
            self.finalize(&task, Err(TaskError::Cancelled(CancelReason::Shutdown)));
            return;
        }

        let backlog = self
            .executors
            .load(Ordering::Relaxed)
            .max(1)
            .saturating_mul(self.config.hot_backlog_per_executor.max(1));

        {
            let mut glob = self.glob.lock();
            if glob.hot.len() < backlog {
                glob.hot.push_back(task);
                self.hot_len.store(glob.hot.len(), Ordering::Relaxed);
                self.work_cv.notify_one();
                return;
            }
        }

        self.cold.push(task);
        self.cold_len.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if self.idle.load(Ordering::SeqCst) > 0 {
            let _glob = self.glob.lock();
            self.work_cv.notify_one();
        }
    }

    /// Front-of-queue insertion for worker-exit tasks
    pub(crate) fn push_poisons(self: &Arc<Self>, count: usize) {
        let mut glob = self.glob.lock();
        for _ in 0..count {
            glob.hot.push_front(self.poison());
        }
        self.hot_len.store(glob.hot.len(), Ordering::Relaxed);
        self.work_cv.notify_all();
    }

    /// Pop hot, else cold, else sleep until work arrives
    pub(crate) fn next_task(&self) -> TaskRef {
        loop {
            {
                let mut glob = self.glob.lock();
                if let Some(task) = self.pop_hot(&mut glob) {
                    return task;
                }
            }

            if let Some(task) = self.steal_cold() {
                return task;
            }

            let mut glob = self.glob.lock();
            if let Some(task) = self.pop_hot(&mut glob) {
                return task;
            }
            self.idle.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.cold.is_empty() {
                self.work_cv.wait(&mut glob);
            }
            self.idle.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn pop_hot(&self, glob: &mut GlobState) -> Option<TaskRef> {
        let task = glob.hot.pop_front()?;
        self.hot_len.store(glob.hot.len(), Ordering::Relaxed);
        Some(task)
    }

    pub(crate) fn steal_cold(&self) -> Option<TaskRef> {
        loop {
            match self.cold.steal() {
                Steal::Success(task) => {
                    self.cold_len.fetch_sub(1, Ordering::Relaxed);
                    return Some(task);
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    // ========================================================================
    // Timed structures
    // ========================================================================

    /// Insert a timed entry and make sure the timer controller runs
    pub(crate) fn push_timed(self: &Arc<Self>, due: Instant, kind: TimedKind) {
        if self.insert_timed(due, kind) {
            if let Err(err) = timer::ensure_started(self) {
                tracing::error!(%err, "failed to start timer controller");
            }
        }
    }

    /// Insert a timed entry. Returns true if the controller is not running.
    pub(crate) fn insert_timed(&self, due: Instant, kind: TimedKind) -> bool {
        let entry = TimedEntry {
            due,
            order: self.timed_order.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        let mut glob = self.glob.lock();
        if glob.timed_hot.len() < self.config.timed_hot_capacity.max(1) {
            glob.timed_hot.push(entry);
            self.timed_hot_len.store(glob.timed_hot.len(), Ordering::Relaxed);
        } else {
            let mut cold = self.timed_cold.lock();
            cold.push(entry);
            self.timed_cold_len.store(cold.len(), Ordering::Relaxed);
        }
        self.timer_cv.notify_one();
        !glob.timer_running
    }

    // ========================================================================
    // Wake / start / cancel / finalize
    // ========================================================================

    /// Wake a task parked under `seq`; stale wakes are ignored.
    ///
    /// The task is queued on the runtime that owns it, which may differ from
    /// `self` when a task awaits work of another runtime.
    /// Resume a task parked under `seq`. Returns false for a stale wake.
    pub(crate) fn wake(&self, task: &TaskRef, seq: u64) -> bool {
        if !task.try_wake(seq) {
            return false;
        }
        match task.owner() {
            Some(owner) if !std::ptr::eq(Arc::as_ptr(&owner), self) => owner.enqueue(task.clone()),
            _ => self.enqueue(task.clone()),
        }
        true
    }

    pub(crate) fn wake_all(&self, waiters: Vec<Waiter>) {
        for waiter in waiters {
            self.wake(&waiter.task, waiter.seq);
        }
    }

    /// First start of a task: leave the planned count, become active, arm the
    /// timeout. Returns false if the task was already started.
    pub(crate) fn activate(self: &Arc<Self>, task: &TaskRef) -> bool {
        if !task.mark_started() {
            return false;
        }
        if task.take_planned() {
            self.release_planned();
        }
        self.active.insert(task.id(), task.clone());
        if let Some(deadline) = task.timeout() {
            self.push_timed(deadline, TimedKind::Deadline(task.clone()));
        }
        true
    }

    /// Make a started (or about-to-be-started) task ready
    pub(crate) fn make_ready(&self, task: &TaskRef) {
        if task.try_queue() {
            self.enqueue(task.clone());
        }
    }

    pub(crate) fn start(self: &Arc<Self>, task: &TaskRef) -> RtResult<()> {
        if task.is_poison() {
            return Ok(());
        }
        if self.activate(task) {
            if self.is_shutdown() {
                self.finalize(task, Err(TaskError::Cancelled(CancelReason::Shutdown)));
                return Err(TaskError::ShutDown);
            }
            self.make_ready(task);
        } else if task.is_yield_mode() {
            if let Some(seq) = task.parked_seq(Some(ParkKind::YieldMode)) {
                self.wake(task, seq);
            }
        }
        Ok(())
    }

    /// Request cancellation and wake the task if it is parked
    pub(crate) fn cancel(&self, task: &TaskRef, reason: CancelReason) {
        if task.is_finished() {
            return;
        }
        if let Some(hook) = task.take_cancel_hook() {
            task.request_cancel(reason);
            hook();
            return;
        }
        task.request_cancel(reason);
        if let Some(seq) = task.parked_seq(None) {
            self.wake(task, seq);
        }
    }

    /// Complete a task's result, wake its awaiters and forget it
    pub(crate) fn finalize(&self, task: &TaskRef, outcome: RtResult<Vec<Value>>) {
        task.set_done();
        let waiters = task.result().finish(outcome);
        self.active.remove(&task.id());
        // A fiber parked here is never resumed again.
        drop(task.take_fiber());
        drop(task.take_cancel_hook());
        if let Some(waiters) = waiters {
            tracing::trace!(task = %task.id(), "task finalized");
            self.wake_all(waiters);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskOptions;
    use crate::value::callable;
    use std::time::Duration;

    fn shared(backlog: usize) -> Arc<Shared> {
        let mut config = RuntimeConfig::default().with_executors(1);
        config.hot_backlog_per_executor = backlog;
        config.timed_hot_capacity = 2;
        Shared::new(config)
    }

    fn task(shared: &Arc<Shared>) -> TaskRef {
        Arc::new(Task::new(
            shared,
            callable(|_| Ok(vec![])),
            vec![],
            TaskOptions::new(),
        ))
    }

    #[test]
    fn test_routing_overflows_to_cold() {
        let shared = shared(2);
        shared.executors.store(1, Ordering::SeqCst);
        for _ in 0..5 {
            shared.enqueue_global(task(&shared));
        }
        assert_eq!(shared.hot_len.load(Ordering::SeqCst), 2);
        assert_eq!(shared.cold_len.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fifo_hot_then_cold() {
        let shared = shared(1);
        shared.executors.store(1, Ordering::SeqCst);
        let tasks: Vec<TaskRef> = (0..3).map(|_| task(&shared)).collect();
        for t in &tasks {
            shared.enqueue_global(t.clone());
        }
        let order: Vec<TaskId> = (0..3).map(|_| shared.next_task().id()).collect();
        let expected: Vec<TaskId> = tasks.iter().map(|t| t.id()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_poison_jumps_queue() {
        let shared = shared(8);
        shared.executors.store(1, Ordering::SeqCst);
        shared.enqueue_global(task(&shared));
        shared.push_poisons(1);
        assert!(shared.next_task().is_poison());
        assert!(!shared.next_task().is_poison());
    }

    #[test]
    fn test_timed_overflow_to_cold_heap() {
        let shared = shared(8);
        let now = Instant::now();
        for i in 0..4 {
            shared.insert_timed(
                now + Duration::from_millis(i),
                TimedKind::Start(task(&shared)),
            );
        }
        assert_eq!(shared.timed_hot_len.load(Ordering::SeqCst), 2);
        assert_eq!(shared.timed_cold_len.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timed_entry_order() {
        let shared = shared(8);
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (order, offset) in [(0u64, 30u64), (1, 10), (2, 20), (3, 10)] {
            heap.push(TimedEntry {
                due: now + Duration::from_millis(offset),
                order,
                kind: TimedKind::Start(task(&shared)),
            });
        }
        let popped: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.order)).collect();
        assert_eq!(popped, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_start_is_idempotent() {
        let shared = shared(8);
        shared.executors.store(1, Ordering::SeqCst);
        let t = task(&shared);
        shared.start(&t).unwrap();
        shared.start(&t).unwrap();
        assert_eq!(shared.hot_len.load(Ordering::SeqCst), 1);
        assert_eq!(shared.active.len(), 1);
    }

    #[test]
    fn test_finalize_wakes_and_forgets() {
        let shared = shared(8);
        let t = task(&shared);
        shared.activate(&t);
        shared.finalize(&t, Ok(vec![Value::Int(1)]));
        assert!(t.is_finished());
        assert!(shared.active.is_empty());
        // Second outcome is ignored
        shared.finalize(&t, Ok(vec![Value::Int(2)]));
        assert_eq!(t.result().values(), vec![Value::Int(1)]);
    }
}
