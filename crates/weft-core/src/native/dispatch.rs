//! Dispatch threads and their sizing controller
//!
//! Dispatch threads block on the reactor's completion primitive and hand each
//! completion to the manager registered for it. A controller thread samples
//! the completions counted by every dispatch thread once per interval, feeds
//! the total rate to [`HillClimb`] and spawns a thread or posts a sentinel
//! completion to retire one.

use super::hill_climb::{Decision, HillClimb};
use super::op::Completion;
use super::reactor::{AsyncReactor, NativeWorkerHandle, NativeWorkerManager, SENTINEL};
use crate::config::BridgeConfig;
use crate::defaults::DISPATCH_WAIT_MS;
use crate::error::{RtResult, TaskError};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Managers of in-flight operations, keyed by user data
pub(crate) type InFlight = DashMap<u64, Arc<dyn NativeWorkerManager>>;

/// Per-thread counters
#[derive(Default)]
struct DispatchStats {
    completed: AtomicU64,
}

struct DispatchThread {
    stats: Arc<DispatchStats>,
    handle: JoinHandle<()>,
}

struct Inner {
    reactor: Arc<dyn AsyncReactor>,
    in_flight: Arc<InFlight>,
    threads: Mutex<Vec<DispatchThread>>,
    /// Completions counted by threads already joined
    retired_completed: AtomicU64,
    /// Threads not yet told to retire
    live: AtomicUsize,
    seq: AtomicUsize,
    closing: AtomicBool,
    /// Controller sleeps here between samples
    ctl_lock: Mutex<()>,
    ctl_cv: Condvar,
}

pub(crate) struct DispatchPool {
    inner: Arc<Inner>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchPool {
    /// Start `min` dispatch threads and the controller
    pub(crate) fn start(
        reactor: Arc<dyn AsyncReactor>,
        in_flight: Arc<InFlight>,
        config: &BridgeConfig,
    ) -> RtResult<Self> {
        let (min, max) = config.dispatch_bounds();
        let inner = Arc::new(Inner {
            reactor,
            in_flight,
            threads: Mutex::new(Vec::new()),
            retired_completed: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            seq: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            ctl_lock: Mutex::new(()),
            ctl_cv: Condvar::new(),
        });
        for _ in 0..min {
            inner.spawn_thread()?;
        }

        let pool = Self {
            inner: inner.clone(),
            controller: Mutex::new(None),
        };
        if max > min {
            let interval = config.sample_interval();
            let climb = HillClimb::new(min, max, min);
            let handle = thread::Builder::new()
                .name("weft-dispatch-ctl".to_string())
                .spawn(move || inner.control(climb, interval))
                .map_err(|err| TaskError::from_io(&err))?;
            *pool.controller.lock() = Some(handle);
        }
        Ok(pool)
    }

    /// Dispatch threads currently serving completions
    pub(crate) fn threads(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Total completions handed to managers
    pub(crate) fn completed(&self) -> u64 {
        self.inner.completed()
    }

    /// Stop the controller and every dispatch thread
    pub(crate) fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _ctl = self.inner.ctl_lock.lock();
            self.inner.ctl_cv.notify_all();
        }
        if let Some(handle) = self.controller.lock().take() {
            let _ = handle.join();
        }
        let threads: Vec<DispatchThread> = self.inner.threads.lock().drain(..).collect();
        for thread in threads {
            let _ = thread.handle.join();
        }
        self.inner.live.store(0, Ordering::Release);
    }
}

impl Inner {
    fn completed(&self) -> u64 {
        let threads = self.threads.lock();
        let live: u64 = threads
            .iter()
            .map(|thread| thread.stats.completed.load(Ordering::Relaxed))
            .sum();
        live + self.retired_completed.load(Ordering::Relaxed)
    }

    fn spawn_thread(self: &Arc<Self>) -> RtResult<()> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(DispatchStats::default());
        let inner = self.clone();
        let thread_stats = stats.clone();
        let handle = thread::Builder::new()
            .name(format!("weft-dispatch-{}", n))
            .spawn(move || inner.dispatch_loop(n, thread_stats))
            .map_err(|err| TaskError::from_io(&err))?;
        self.live.fetch_add(1, Ordering::AcqRel);
        self.threads.lock().push(DispatchThread { stats, handle });
        Ok(())
    }

    fn retire_thread(&self) -> bool {
        let retired = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > 1).then(|| live - 1)
            })
            .is_ok();
        if retired {
            if let Err(err) = self.reactor.post_sentinel() {
                self.live.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(%err, "failed to post dispatch sentinel");
                return false;
            }
        }
        retired
    }

    fn dispatch_loop(&self, n: usize, stats: Arc<DispatchStats>) {
        tracing::trace!(dispatch = n, reactor = self.reactor.name(), "dispatch thread started");
        let wait = Duration::from_millis(DISPATCH_WAIT_MS);
        loop {
            if self.closing.load(Ordering::Acquire) {
                break;
            }
            let completions = match self.reactor.wait(wait) {
                Ok(completions) => completions,
                Err(err) => {
                    tracing::warn!(dispatch = n, %err, "reactor wait failed");
                    thread::sleep(wait);
                    continue;
                }
            };

            let mut retire = false;
            for completion in completions {
                if completion.user_data == SENTINEL {
                    if retire {
                        // A second sentinel in one batch belongs to another thread.
                        if let Err(err) = self.reactor.post_sentinel() {
                            tracing::warn!(%err, "failed to re-post dispatch sentinel");
                        }
                    }
                    retire = true;
                    continue;
                }
                stats.completed.fetch_add(1, Ordering::Relaxed);
                self.deliver(completion);
            }
            if retire {
                break;
            }
        }
        tracing::trace!(dispatch = n, "dispatch thread exited");
    }

    fn deliver(&self, completion: Completion) {
        let user_data = completion.user_data;
        match self.in_flight.remove(&user_data) {
            Some((_, manager)) => manager.handle(NativeWorkerHandle(user_data), completion),
            None => tracing::trace!(user_data, "completion for a forgotten operation"),
        }
    }

    fn control(self: Arc<Self>, mut climb: HillClimb, interval: Duration) {
        let mut last_count = self.completed();
        let mut last_at = Instant::now();
        loop {
            {
                let mut ctl = self.ctl_lock.lock();
                if self.closing.load(Ordering::Acquire) {
                    break;
                }
                self.ctl_cv.wait_for(&mut ctl, interval);
                if self.closing.load(Ordering::Acquire) {
                    break;
                }
            }
            self.prune();

            let count = self.completed();
            let now = Instant::now();
            let elapsed = now.duration_since(last_at).as_secs_f64().max(f64::EPSILON);
            let throughput = count.saturating_sub(last_count) as f64 / elapsed;
            last_count = count;
            last_at = now;

            climb.sync(self.live.load(Ordering::Acquire));
            let decision = climb.observe(throughput);
            let applied = match decision {
                Decision::Grow => self.spawn_thread().is_ok(),
                Decision::Shrink => self.retire_thread(),
                Decision::Hold => false,
            };
            if applied {
                tracing::debug!(
                    ?decision,
                    throughput,
                    threads = self.live.load(Ordering::Acquire),
                    "dispatch pool resized"
                );
            }
        }
    }

    /// Join threads that retired, keeping their completion counts
    fn prune(&self) {
        let mut threads = self.threads.lock();
        let mut kept = Vec::with_capacity(threads.len());
        for thread in threads.drain(..) {
            if thread.handle.is_finished() {
                self.retired_completed
                    .fetch_add(thread.stats.completed.load(Ordering::Relaxed), Ordering::Relaxed);
                let _ = thread.handle.join();
            } else {
                kept.push(thread);
            }
        }
        *threads = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::op::NativeOp;
    use crate::native::portable::PortableReactor;

    fn pool(min: usize, max: usize) -> (DispatchPool, Arc<dyn AsyncReactor>, Arc<InFlight>) {
        let reactor: Arc<dyn AsyncReactor> = Arc::new(PortableReactor::new());
        let in_flight = Arc::new(InFlight::new());
        let config = BridgeConfig {
            min_dispatch_threads: min,
            max_dispatch_threads: max,
            sample_interval_ms: 10,
            ..BridgeConfig::default()
        };
        let pool = DispatchPool::start(reactor.clone(), in_flight.clone(), &config).unwrap();
        (pool, reactor, in_flight)
    }

    #[test]
    fn test_delivers_to_manager() {
        let (pool, reactor, in_flight) = pool(2, 2);
        let (tx, rx) = crossbeam::channel::unbounded();
        for id in 0..4u64 {
            let tx = tx.clone();
            let manager: Arc<dyn NativeWorkerManager> =
                Arc::new(move |handle: NativeWorkerHandle, completion: Completion| {
                    let _ = tx.send((handle.as_u64(), completion.result));
                });
            in_flight.insert(id, manager);
            reactor.submit(id, NativeOp::Nop).unwrap();
        }
        let mut got: Vec<u64> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(in_flight.is_empty());
        assert_eq!(pool.threads(), 2);
        pool.shutdown();
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn test_idle_pool_shrinks_to_min() {
        let (pool, _reactor, _in_flight) = pool(1, 4);
        pool.inner.spawn_thread().unwrap();
        pool.inner.spawn_thread().unwrap();
        assert_eq!(pool.threads(), 3);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.threads() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.threads(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_retire_keeps_one_thread() {
        let (pool, _reactor, _in_flight) = pool(1, 1);
        assert!(!pool.inner.retire_thread());
        assert_eq!(pool.threads(), 1);
        pool.shutdown();
    }
}
