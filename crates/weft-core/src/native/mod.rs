//! Native async bridge
//!
//! Turns OS asynchronous completions and foreign-thread work into task
//! completions. A process-wide [`NativeBridge`] wraps one [`AsyncReactor`]
//! (io_uring on Linux, the portable queue elsewhere or when the ring cannot be
//! created) and a pool of dispatch threads sized by hill climbing.
//!
//! The scheduler-facing entry points are [`Runtime::cxx_native_bridge`], which
//! submits an operation and returns a placeholder task completed by its
//! result, and [`Runtime::create_native_task`], which runs a closure on a
//! foreign thread and completes a placeholder task with its outcome.

mod dispatch;
mod hill_climb;
mod op;
mod portable;
mod reactor;
#[cfg(target_os = "linux")]
mod uring;

pub use hill_climb::{Decision, HillClimb};
pub use op::{Completion, NativeOp, OpKind};
pub use reactor::{AsyncReactor, NativeWorkerHandle, NativeWorkerManager, SENTINEL};

use crate::config::BridgeConfig;
use crate::current;
use crate::error::{CancelReason, RtResult, TaskError};
use crate::runtime::Runtime;
use crate::scheduler::{Shared, Task, TaskRef};
use crate::value::Value;
use dispatch::{DispatchPool, InFlight};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

static BRIDGE: OnceCell<NativeBridge> = OnceCell::new();

/// Reactor, in-flight registry and dispatch pool
pub struct NativeBridge {
    reactor: Arc<dyn AsyncReactor>,
    in_flight: Arc<InFlight>,
    pool: DispatchPool,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl NativeBridge {
    /// The process-wide bridge, configured from `WEFT_*` variables on first use
    pub fn global() -> RtResult<&'static NativeBridge> {
        BRIDGE.get_or_try_init(|| {
            let config = BridgeConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(%err, "invalid bridge environment, using defaults");
                BridgeConfig::default()
            });
            NativeBridge::new(&config)
        })
    }

    /// Build a bridge with its own reactor and dispatch threads
    pub fn new(config: &BridgeConfig) -> RtResult<Self> {
        Self::with_reactor(select_reactor(config), config)
    }

    /// Build a bridge over a caller-supplied reactor. `config` sizes the
    /// dispatch pool; its reactor selection fields are ignored.
    pub fn with_reactor(reactor: Arc<dyn AsyncReactor>, config: &BridgeConfig) -> RtResult<Self> {
        let in_flight = Arc::new(InFlight::new());
        let pool = DispatchPool::start(reactor.clone(), in_flight.clone(), config)?;
        tracing::debug!(
            reactor = reactor.name(),
            dispatch_threads = pool.threads(),
            "native bridge started"
        );
        Ok(Self {
            reactor,
            in_flight,
            pool,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Name of the reactor in use (`"io_uring"` or `"portable"`)
    pub fn reactor_name(&self) -> &'static str {
        self.reactor.name()
    }

    /// Whether `kind` can be submitted
    pub fn supports(&self, kind: OpKind) -> bool {
        self.reactor.supports(kind)
    }

    /// Dispatch threads currently serving completions
    pub fn dispatch_threads(&self) -> usize {
        self.pool.threads()
    }

    /// Completions delivered so far
    pub fn completed(&self) -> u64 {
        self.pool.completed()
    }

    /// Operations submitted and not yet delivered
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Submit `op`; `manager.handle` runs on a dispatch thread when it
    /// completes.
    ///
    /// Operations the running kernel does not implement fail here with
    /// `Unsupported`.
    pub fn submit(
        &self,
        op: NativeOp,
        manager: Arc<dyn NativeWorkerManager>,
    ) -> RtResult<NativeWorkerHandle> {
        let handle = self.reserve();
        self.submit_reserved(handle, op, manager)?;
        Ok(handle)
    }

    fn reserve(&self) -> NativeWorkerHandle {
        NativeWorkerHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn submit_reserved(
        &self,
        handle: NativeWorkerHandle,
        op: NativeOp,
        manager: Arc<dyn NativeWorkerManager>,
    ) -> RtResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskError::ShutDown);
        }
        let kind = op.kind();
        if !self.reactor.supports(kind) {
            return Err(TaskError::Unsupported(format!(
                "{} on the {} reactor",
                kind.as_str(),
                self.reactor.name()
            )));
        }
        self.in_flight.insert(handle.0, manager);
        if let Err(err) = self.reactor.submit(handle.0, op) {
            self.in_flight.remove(&handle.0);
            return Err(TaskError::from_io(&err));
        }
        tracing::trace!(op = kind.as_str(), %handle, "native op submitted");
        Ok(())
    }

    /// Ask an in-flight operation to complete early with `-ECANCELED`
    pub fn cancel(&self, handle: NativeWorkerHandle) -> RtResult<()> {
        self.reactor
            .cancel(handle.0)
            .map_err(|err| TaskError::from_io(&err))
    }

    /// Run `op` to completion and return `[Int(result), Bytes(data)]`.
    ///
    /// Inside a task the task parks; elsewhere the thread blocks.
    pub fn wait_sync(&self, op: NativeOp) -> RtResult<Vec<Value>> {
        if let Some(runtime) = current::runtime() {
            let task = runtime.bridge_task(self, op)?;
            return runtime.await_task(&task, false);
        }
        let (tx, rx) = crossbeam::channel::bounded(1);
        let manager: Arc<dyn NativeWorkerManager> =
            Arc::new(move |_: NativeWorkerHandle, completion: Completion| {
                let _ = tx.send(completion);
            });
        self.submit(op, manager)?;
        rx.recv()
            .map_err(|_| TaskError::ShutDown)?
            .into_outcome()
    }

    /// Stop the dispatch pool. Operations still in flight complete their
    /// managers with `-ECANCELED`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.in_flight.iter() {
            let _ = self.reactor.cancel(*entry.key());
        }
        self.pool.shutdown();
        let pending: Vec<u64> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        let cancelled = pending.len();
        for user_data in pending {
            if let Some((_, manager)) = self.in_flight.remove(&user_data) {
                manager.handle(
                    NativeWorkerHandle(user_data),
                    Completion::new(user_data, -libc::ECANCELED),
                );
            }
        }
        tracing::debug!(cancelled, "native bridge shut down");
    }
}

impl Drop for NativeBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn select_reactor(config: &BridgeConfig) -> Arc<dyn AsyncReactor> {
    #[cfg(target_os = "linux")]
    {
        if !config.force_portable {
            match uring::UringReactor::new(config.ring_entries) {
                Ok(reactor) => return Arc::new(reactor),
                Err(err) => {
                    tracing::warn!(%err, "io_uring unavailable, using the portable reactor");
                }
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = config;
    Arc::new(portable::PortableReactor::new())
}

// ============================================================================
// Task integration
// ============================================================================

/// Completes a placeholder task from a native completion
struct TaskCompletion {
    task: TaskRef,
    shared: Arc<Shared>,
}

impl NativeWorkerManager for TaskCompletion {
    fn handle(&self, _handle: NativeWorkerHandle, completion: Completion) {
        let outcome = match completion.into_outcome() {
            Err(TaskError::Cancelled(reason)) => Err(TaskError::Cancelled(
                self.task.cancel_reason().unwrap_or(reason),
            )),
            other => other,
        };
        self.shared.finalize(&self.task, outcome);
    }
}

static NATIVE_SEQ: AtomicUsize = AtomicUsize::new(0);

impl Runtime {
    fn placeholder(&self) -> RtResult<TaskRef> {
        if self.is_shutdown() {
            return Err(TaskError::ShutDown);
        }
        let shared = self.shared();
        let task = Arc::new(Task::placeholder(shared));
        shared.active.insert(task.id(), task.clone());
        Ok(task)
    }

    /// Cancelling the placeholder finalizes it right away and runs `extra`
    fn arm_cancel(&self, task: &TaskRef, extra: impl FnOnce() + Send + 'static) {
        let weak: Weak<Task> = Arc::downgrade(task);
        let shared = Arc::downgrade(self.shared());
        task.set_cancel_hook(Box::new(move || {
            extra();
            if let (Some(task), Some(shared)) = (weak.upgrade(), shared.upgrade()) {
                let reason = task.cancel_reason().unwrap_or(CancelReason::Requested);
                shared.finalize(&task, Err(TaskError::Cancelled(reason)));
            }
        }));
    }

    /// Run `work` on a foreign thread and return a placeholder task completed
    /// by its outcome.
    ///
    /// Cancelling the task completes it immediately with `Cancelled`; the
    /// foreign thread runs to completion and its outcome is discarded.
    pub fn create_native_task<F>(&self, work: F) -> RtResult<TaskRef>
    where
        F: FnOnce() -> RtResult<Vec<Value>> + Send + 'static,
    {
        let task = self.placeholder()?;
        self.arm_cancel(&task, || {});

        let shared = self.shared().clone();
        let thread_task = task.clone();
        let n = NATIVE_SEQ.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("weft-native-{}", n))
            .spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work))
                    .unwrap_or_else(|_| {
                        Err(TaskError::Panicked("native task panicked".to_string()))
                    });
                shared.finalize(&thread_task, outcome);
            });
        if let Err(err) = spawned {
            let err = TaskError::from_io(&err);
            self.shared().finalize(&task, Err(err.clone()));
            return Err(err);
        }
        Ok(task)
    }

    /// Submit `op` to the process-wide native bridge and return a placeholder
    /// task completed with `[Int(result), Bytes(data)]`.
    ///
    /// Cancelling the task cancels the operation and completes the task
    /// immediately with `Cancelled`.
    pub fn cxx_native_bridge(&self, op: NativeOp) -> RtResult<TaskRef> {
        self.bridge_task(NativeBridge::global()?, op)
    }

    fn bridge_task(&self, bridge: &NativeBridge, op: NativeOp) -> RtResult<TaskRef> {
        let kind = op.kind();
        if !bridge.supports(kind) {
            return Err(TaskError::Unsupported(format!(
                "{} on the {} reactor",
                kind.as_str(),
                bridge.reactor_name()
            )));
        }
        let task = self.placeholder()?;
        let handle = bridge.reserve();
        let reactor = Arc::downgrade(&bridge.reactor);
        self.arm_cancel(&task, move || {
            if let Some(reactor) = reactor.upgrade() {
                let _ = reactor.cancel(handle.0);
            }
        });

        let manager = Arc::new(TaskCompletion {
            task: task.clone(),
            shared: self.shared().clone(),
        });
        if let Err(err) = bridge.submit_reserved(handle, op, manager) {
            self.shared().finalize(&task, Err(err.clone()));
            return Err(err);
        }
        Ok(task)
    }
}
