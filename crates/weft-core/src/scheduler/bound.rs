//! Bound executor pools
//!
//! A bound pool is a dedicated group of workers with its own queue, addressed
//! by a 16-bit [`ExecutorId`]. Tasks created with `TaskOptions::bound_to` run
//! only there while the pool is registered; once it closes they migrate to the
//! global pool.

use super::shared::Shared;
use super::task::TaskRef;
use super::worker;
use crate::error::{RtResult, TaskError};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Identifier of a bound executor pool
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(pub(crate) u16);

impl ExecutorId {
    /// Numeric id
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct PoolState {
    queue: VecDeque<TaskRef>,
    idle: usize,
}

pub(crate) struct BoundPool {
    id: ExecutorId,
    /// 0 = elastic
    fixed: usize,
    elastic_cap: usize,
    allow_implicit_start: bool,
    state: Mutex<PoolState>,
    cond: Condvar,
    executors: AtomicUsize,
    spawned: AtomicUsize,
    closing: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shared: Weak<Shared>,
}

impl BoundPool {
    pub(crate) fn id(&self) -> ExecutorId {
        self.id
    }

    pub(crate) fn allows_implicit_start(&self) -> bool {
        self.allow_implicit_start
    }

    pub(crate) fn executors(&self) -> usize {
        self.executors.load(Ordering::Acquire)
    }

    /// Queue a task. Hands the task back once the pool is closing.
    pub(crate) fn push(self: &Arc<Self>, task: TaskRef) -> Result<(), TaskRef> {
        let spawn = {
            let mut state = self.state.lock();
            if self.closing.load(Ordering::Acquire) {
                return Err(task);
            }
            state.queue.push_back(task);
            self.cond.notify_one();
            let grow = self.fixed == 0 && state.idle == 0 && self.executors() < self.elastic_cap;
            if grow {
                self.executors.fetch_add(1, Ordering::AcqRel);
            }
            grow
        };
        if spawn {
            if let Err(err) = self.start_reserved_worker() {
                tracing::warn!(executor = %self.id, %err, "failed to grow elastic pool");
            }
        }
        Ok(())
    }

    /// Pop the next task, sleeping while the queue is empty
    pub(crate) fn next_task(&self) -> TaskRef {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                return task;
            }
            state.idle += 1;
            self.cond.wait(&mut state);
            state.idle -= 1;
        }
    }

    /// Worker exit accounting
    pub(crate) fn worker_exited(&self) {
        let _state = self.state.lock();
        self.executors.fetch_sub(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    /// Count a worker in `executors` before its thread exists, so a
    /// concurrent close always poisons it.
    fn reserve_worker(&self) -> bool {
        let _state = self.state.lock();
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        self.executors.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn start_reserved_worker(self: &Arc<Self>) -> RtResult<()> {
        let Some(shared) = self.shared.upgrade() else {
            self.worker_exited();
            return Err(TaskError::ShutDown);
        };
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        match worker::spawn_bound(shared, self.clone(), n) {
            Ok(handle) => {
                self.handles.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                self.worker_exited();
                Err(err)
            }
        }
    }

    /// Stop every worker and return the tasks still queued
    fn drain(self: &Arc<Self>, shared: &Arc<Shared>) -> Vec<TaskRef> {
        let mut state = self.state.lock();
        self.closing.store(true, Ordering::Release);
        let live = self.executors();
        for _ in 0..live {
            state.queue.push_front(shared.poison());
        }
        self.cond.notify_all();
        while self.executors() > 0 {
            self.cond.wait(&mut state);
        }
        state.queue.drain(..).filter(|task| !task.is_poison()).collect()
    }
}

/// Registry of bound pools keyed by id
pub(crate) struct BoundRegistry {
    pools: Mutex<FxHashMap<u16, Arc<BoundPool>>>,
    cursor: AtomicUsize,
}

impl BoundRegistry {
    pub(crate) fn new() -> Self {
        Self {
            pools: Mutex::new(FxHashMap::default()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get(&self, id: ExecutorId) -> Option<Arc<BoundPool>> {
        self.pools.lock().get(&id.0).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub(crate) fn ids(&self) -> Vec<ExecutorId> {
        let mut ids: Vec<ExecutorId> = self.pools.lock().keys().map(|id| ExecutorId(*id)).collect();
        ids.sort();
        ids
    }

    /// Register a pool under a free id and start its fixed workers
    pub(crate) fn create(
        &self,
        shared: &Arc<Shared>,
        fixed_count: usize,
        allow_implicit_start: bool,
    ) -> RtResult<ExecutorId> {
        let pool = {
            let mut pools = self.pools.lock();
            let space = u16::MAX as usize + 1;
            if pools.len() >= space {
                return Err(TaskError::CapacityExhausted(
                    "no free bound executor id".to_string(),
                ));
            }
            let start = self.cursor.load(Ordering::Relaxed);
            let raw = (0..space)
                .map(|offset| ((start + offset) % space) as u16)
                .find(|candidate| !pools.contains_key(candidate))
                .ok_or_else(|| {
                    TaskError::CapacityExhausted("no free bound executor id".to_string())
                })?;
            self.cursor.store(raw as usize + 1, Ordering::Relaxed);

            let pool = Arc::new(BoundPool {
                id: ExecutorId(raw),
                fixed: fixed_count,
                elastic_cap: shared.config.elastic_cap().max(1),
                allow_implicit_start,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    idle: 0,
                }),
                cond: Condvar::new(),
                executors: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
                shared: Arc::downgrade(shared),
            });
            pools.insert(raw, pool.clone());
            pool
        };

        for _ in 0..fixed_count {
            if !pool.reserve_worker() {
                break;
            }
            if let Err(err) = pool.start_reserved_worker() {
                self.close(shared, pool.id())?;
                return Err(err);
            }
        }

        tracing::debug!(
            executor = %pool.id(),
            fixed = fixed_count,
            allow_implicit_start,
            "bound executor created"
        );
        Ok(pool.id())
    }

    /// Stop a pool's workers, deregister it and move its queued tasks to the
    /// global pool. Returns the number of tasks transferred.
    pub(crate) fn close(&self, shared: &Arc<Shared>, id: ExecutorId) -> RtResult<usize> {
        if crate::current::executor() == Some(id) {
            return Err(TaskError::WrongContext(
                "close_bind_only_executor from its own executor",
            ));
        }
        let pool = self.get(id).ok_or(TaskError::ExecutorNotFound(id))?;

        let pending = pool.drain(shared);
        self.pools.lock().remove(&id.0);

        let handles: Vec<JoinHandle<()>> = pool.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        let transferred = pending.len();
        for task in pending {
            task.unbind();
            shared.enqueue_global(task);
        }
        tracing::debug!(executor = %id, transferred, "bound executor closed");
        Ok(transferred)
    }

    /// Close every registered pool (shutdown)
    pub(crate) fn close_all(&self, shared: &Arc<Shared>) {
        for id in self.ids() {
            if let Err(err) = self.close(shared, id) {
                tracing::warn!(executor = %id, %err, "failed to close bound executor");
            }
        }
    }
}
