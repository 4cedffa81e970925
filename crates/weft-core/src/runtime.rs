//! The scheduler context and its public API
//!
//! A [`Runtime`] owns the worker threads, queues and timer controller. It is a
//! cheap handle: clones share the same scheduler. A process-wide instance is
//! created on first use by [`Runtime::global`]; every runtime is torn down
//! explicitly with [`Runtime::shutdown`].
//!
//! ```no_run
//! use weft_core::{callable, Runtime, RuntimeConfig, TaskOptions, Value};
//!
//! let rt = Runtime::new(RuntimeConfig::default().with_executors(2)).unwrap();
//! let task = rt
//!     .spawn(callable(|args| Ok(args)), Value::Int(7), TaskOptions::new())
//!     .unwrap();
//! assert_eq!(rt.await_task(&task, false).unwrap(), vec![Value::Int(7)]);
//! rt.shutdown();
//! ```

use crate::config::RuntimeConfig;
use crate::current;
use crate::error::{CancelReason, RtResult, TaskError};
use crate::scheduler::shared::TimedKind;
use crate::scheduler::{timer, worker, ExecutorId, Shared, Task, TaskOptions, TaskRef};
use crate::stack::StackPool;
use crate::value::{Callable, Value};
use once_cell::sync::OnceCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

static GLOBAL: OnceCell<Runtime> = OnceCell::new();

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Constructed-but-not-started tasks
    pub planned_tasks: usize,
    /// Live global workers
    pub executors: usize,
    /// Tasks executing right now
    pub in_exec: usize,
    /// Hot ready queue length
    pub hot_len: usize,
    /// Cold ready queue length
    pub cold_len: usize,
    /// Entries in the hot timed structure
    pub timed_hot_len: usize,
    /// Entries in the cold timed structure
    pub timed_cold_len: usize,
    /// Started, unfinished tasks
    pub active_tasks: usize,
    /// Registered bound executor pools
    pub bound_executors: usize,
}

/// Handle to a task scheduler
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Start a runtime with `config`
    pub fn new(config: RuntimeConfig) -> RtResult<Self> {
        let executors = config.executor_count().max(1);
        let runtime = Self {
            shared: Shared::new(config),
        };
        runtime
            .shared
            .target_executors
            .store(executors, Ordering::Release);
        if let Err(err) = runtime.spawn_workers(executors) {
            runtime.shutdown();
            return Err(err);
        }
        tracing::debug!(executors, "runtime started");
        Ok(runtime)
    }

    /// Builder starting from the default configuration
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// The process-wide runtime, configured from `WEFT_*` variables on first use
    pub fn global() -> RtResult<&'static Runtime> {
        GLOBAL.get_or_try_init(|| {
            let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(%err, "invalid runtime environment, using defaults");
                RuntimeConfig::default()
            });
            Runtime::new(config)
        })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Fiber stack pool
    pub fn stack_pool(&self) -> &StackPool {
        &self.shared.stacks
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    fn check_running(&self) -> RtResult<()> {
        if self.shared.is_shutdown() {
            Err(TaskError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn spawn_workers(&self, count: usize) -> RtResult<()> {
        for _ in 0..count {
            let handle = worker::spawn_global(self.shared.clone())?;
            self.shared.workers.lock().push(handle);
        }
        Ok(())
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Construct a task, waiting for admission capacity if the planned-task
    /// limit is reached (a calling task parks, a calling thread blocks).
    pub fn create_task(
        &self,
        callable: Callable,
        args: impl Into<Value>,
        options: TaskOptions,
    ) -> RtResult<TaskRef> {
        self.check_running()?;
        match current::current() {
            Some(me) => current::acquire_in_task(&me, &self.shared)?,
            None => self.shared.admission.acquire_blocking(&self.shared.shutdown)?,
        }
        Ok(self.build_task(callable, args.into(), options))
    }

    /// Construct a task, failing with `CapacityExhausted` instead of waiting
    pub fn try_create_task(
        &self,
        callable: Callable,
        args: impl Into<Value>,
        options: TaskOptions,
    ) -> RtResult<TaskRef> {
        self.check_running()?;
        self.shared.admission.try_acquire()?;
        Ok(self.build_task(callable, args.into(), options))
    }

    fn build_task(&self, callable: Callable, args: Value, options: TaskOptions) -> TaskRef {
        let task = Arc::new(Task::new(&self.shared, callable, args.into_args(), options));
        tracing::trace!(task = %task.id(), "task created");
        task
    }

    /// Construct and start a task
    pub fn spawn(
        &self,
        callable: Callable,
        args: impl Into<Value>,
        options: TaskOptions,
    ) -> RtResult<TaskRef> {
        let task = self.create_task(callable, args, options)?;
        self.start(&task)?;
        Ok(task)
    }

    /// A completed task with no results
    pub fn dummy_task(&self) -> TaskRef {
        self.fulfilled_task(Vec::new())
    }

    /// A completed task whose results are `values`
    pub fn fulfilled_task(&self, values: Vec<Value>) -> TaskRef {
        Arc::new(Task::completed(&self.shared, values))
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Queue a task for execution.
    ///
    /// Idempotent, except that a yield-mode task parked after `yield_value` is
    /// resumed.
    pub fn start(&self, task: &TaskRef) -> RtResult<()> {
        self.shared.start(task)
    }

    /// Start a task after `delay`
    pub fn schedule(&self, task: &TaskRef, delay: Duration) -> RtResult<()> {
        self.schedule_until(task, Instant::now() + delay)
    }

    /// Start a task at `when`
    pub fn schedule_until(&self, task: &TaskRef, when: Instant) -> RtResult<()> {
        self.check_running()?;
        if self.shared.activate(task) {
            self.shared.push_timed(when, TimedKind::Start(task.clone()));
        }
        Ok(())
    }

    /// Start on behalf of `await_task`/`get_result`, honoring the bound
    /// executor's implicit-start policy
    fn start_implicit(&self, task: &TaskRef) -> RtResult<()> {
        if !task.is_started() {
            if let Some(id) = task.executor() {
                if let Some(pool) = self.shared.bound.get(id) {
                    if !pool.allows_implicit_start() {
                        return Err(TaskError::ImplicitStartDenied(id));
                    }
                }
            }
        }
        self.start(task)
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Wait for a task to complete and return its results or re-raise its
    /// terminal error. With `make_start` the task is started first.
    pub fn await_task(&self, task: &TaskRef, make_start: bool) -> RtResult<Vec<Value>> {
        if make_start {
            self.start_implicit(task)?;
        }
        match current::current() {
            Some(me) if Arc::ptr_eq(&me, task) => {
                return Err(TaskError::WrongContext("await_task on the running task"));
            }
            Some(me) => current::await_done(&me, task)?,
            None => task.result().wait_done(),
        }
        task.result().outcome().unwrap_or(Err(TaskError::ShutDown))
    }

    /// Wait until a task has produced `index + 1` results or completed.
    ///
    /// Returns `None` if the task completed with fewer results, and re-raises
    /// the terminal error of a failed task.
    pub fn get_result(&self, task: &TaskRef, index: usize) -> RtResult<Option<Value>> {
        let me = current::current();
        loop {
            let (len, done) = task.result().progress();
            if len > index {
                return Ok(task.result().value_at(index));
            }
            if done {
                return match task.result().error() {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
            }
            self.start_implicit(task)?;
            match &me {
                Some(me) if Arc::ptr_eq(me, task) => {
                    return Err(TaskError::WrongContext("get_result on the running task"));
                }
                Some(me) => current::await_progress(me, task, len)?,
                None => task.result().wait_progress(len),
            }
        }
    }

    /// Next value of a generator task, resuming it as needed. `None` once the
    /// task has completed and every value was handed out.
    pub fn yield_iterate(&self, task: &TaskRef) -> RtResult<Option<Value>> {
        let index = task.yield_cursor().load(Ordering::Acquire);
        let value = self.get_result(task, index)?;
        if value.is_some() {
            task.yield_cursor().fetch_add(1, Ordering::AcqRel);
        }
        Ok(value)
    }

    /// Whether `task` is a generator task
    pub fn is_yield_mode(&self, task: &TaskRef) -> bool {
        task.is_yield_mode()
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Request cancellation. A parked task is woken so it reaches its next
    /// checkpoint; a native placeholder runs its cancel callback right away.
    pub fn notify_cancel(&self, task: &TaskRef) {
        self.shared.cancel(task, CancelReason::Requested);
    }

    // ========================================================================
    // Executors
    // ========================================================================

    /// Create a bound executor pool.
    ///
    /// `fixed_count > 0` starts that many dedicated workers; `0` makes an
    /// elastic pool that grows on demand up to `max_elastic_executors`.
    pub fn create_bind_only_executor(
        &self,
        fixed_count: usize,
        allow_implicit_start: bool,
    ) -> RtResult<ExecutorId> {
        self.check_running()?;
        self.shared
            .bound
            .create(&self.shared, fixed_count, allow_implicit_start)
    }

    /// Stop a bound pool and move its queued tasks to the global pool.
    /// Returns the number of tasks moved.
    pub fn close_bind_only_executor(&self, id: ExecutorId) -> RtResult<usize> {
        self.shared.bound.close(&self.shared, id)
    }

    /// Grow or shrink the global worker pool
    pub fn resize_executors(&self, count: usize) -> RtResult<()> {
        self.check_running()?;
        let count = count.max(1);
        let current = self.shared.target_executors.swap(count, Ordering::AcqRel);
        if count > current {
            self.spawn_workers(count - current)?;
        } else if count < current {
            self.shared.push_poisons(current - count);
        }
        tracing::debug!(from = current, to = count, "resized executors");
        Ok(())
    }

    /// Scheduler counters
    pub fn stats(&self) -> RuntimeStats {
        let shared = &self.shared;
        RuntimeStats {
            planned_tasks: shared.admission.planned(),
            executors: shared.executors.load(Ordering::Acquire),
            in_exec: shared.in_exec.load(Ordering::Acquire),
            hot_len: shared.hot_len.load(Ordering::Acquire),
            cold_len: shared.cold_len.load(Ordering::Acquire),
            timed_hot_len: shared.timed_hot_len.load(Ordering::Acquire),
            timed_cold_len: shared.timed_cold_len.load(Ordering::Acquire),
            active_tasks: shared.active.len(),
            bound_executors: shared.bound.len(),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the timer controller, close bound pools, stop every worker and
    /// cancel whatever was still pending with `Cancelled(Shutdown)`.
    ///
    /// Called from inside a task, the calling worker cannot exit until the
    /// task returns; shutdown then only signals the workers and returns.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("runtime shutting down");

        timer::stop(shared);
        shared.bound.close_all(shared);

        let live = shared.executors.load(Ordering::Acquire);
        shared.push_poisons(live);
        if current::is_task() {
            tracing::warn!("shutdown called from inside a task, not waiting for workers");
            return;
        }
        {
            let mut glob = shared.glob.lock();
            while shared.executors.load(Ordering::Acquire) > 0 {
                shared.drain_cv.wait(&mut glob);
            }
        }
        let handles: Vec<_> = shared.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        let mut pending: Vec<TaskRef> = {
            let mut glob = shared.glob.lock();
            let hot: Vec<TaskRef> = glob.hot.drain(..).collect();
            shared.hot_len.store(0, Ordering::Release);
            hot
        };
        while let Some(task) = shared.steal_cold() {
            pending.push(task);
        }
        pending.extend(timer::drain(shared).iter().map(|entry| entry.task().clone()));
        pending.extend(shared.active.iter().map(|entry| entry.value().clone()));

        let cancelled = pending
            .iter()
            .filter(|task| !task.is_poison() && !task.is_finished())
            .count();
        for task in pending {
            if !task.is_poison() {
                shared.finalize(&task, Err(TaskError::Cancelled(CancelReason::Shutdown)));
            }
        }
        shared.wake_all(shared.admission.drain());
        tracing::debug!(cancelled, "runtime shut down");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("stats", &self.stats()).finish()
    }
}

/// Builder for [`Runtime`]
#[derive(Debug, Clone, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Replace the whole configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Global executor threads
    pub fn executors(mut self, count: usize) -> Self {
        self.config.executors = count;
        self
    }

    /// Planned-task admission limit (0 = unlimited)
    pub fn max_planned_tasks(mut self, max: usize) -> Self {
        self.config.max_planned_tasks = max;
        self
    }

    /// Fiber stack size in bytes
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    /// Execution quantum for normal priority
    pub fn base_quantum(mut self, quantum: Duration) -> Self {
        self.config.base_quantum_ms = quantum.as_millis() as u64;
        self
    }

    /// Start the runtime
    pub fn build(self) -> RtResult<Runtime> {
        Runtime::new(self.config)
    }
}
