//! Planned-task admission control
//!
//! Every constructed-but-not-started task counts against `max_planned_tasks`.
//! A thread that hits the limit blocks on a condition variable; a fiber parks
//! on the waiter list and is woken through the scheduler.

use super::result::Waiter;
use crate::error::{RtResult, TaskError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) struct Admission {
    planned: AtomicUsize,
    /// 0 = unlimited
    limit: usize,
    waiters: Mutex<VecDeque<Waiter>>,
    cond: Condvar,
}

impl Admission {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            planned: AtomicUsize::new(0),
            limit,
            waiters: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Constructed-but-not-started tasks
    pub(crate) fn planned(&self) -> usize {
        self.planned.load(Ordering::Acquire)
    }

    /// Take a slot without waiting
    pub(crate) fn try_acquire(&self) -> RtResult<()> {
        if self.limit == 0 {
            self.planned.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        self.planned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |planned| {
                (planned < self.limit).then_some(planned + 1)
            })
            .map(|_| ())
            .map_err(|planned| {
                TaskError::CapacityExhausted(format!(
                    "{} planned tasks (limit {})",
                    planned, self.limit
                ))
            })
    }

    /// Take a slot, blocking the calling thread until one frees
    pub(crate) fn acquire_blocking(&self, shutdown: &AtomicBool) -> RtResult<()> {
        if self.try_acquire().is_ok() {
            return Ok(());
        }
        let mut waiters = self.waiters.lock();
        loop {
            if self.try_acquire().is_ok() {
                return Ok(());
            }
            if shutdown.load(Ordering::Acquire) {
                return Err(TaskError::ShutDown);
            }
            self.cond.wait(&mut waiters);
        }
    }

    /// Register a parked fiber. Returns `false` when a slot is already free
    /// and the fiber should be woken immediately.
    pub(crate) fn register(&self, waiter: Waiter) -> bool {
        let mut waiters = self.waiters.lock();
        if self.has_room() {
            return false;
        }
        waiters.push_back(waiter);
        true
    }

    /// Give a slot back. Returns a parked fiber to wake, if any.
    pub(crate) fn release(&self) -> Option<Waiter> {
        self.planned.fetch_sub(1, Ordering::AcqRel);
        if self.limit == 0 {
            return None;
        }
        let mut waiters = self.waiters.lock();
        self.cond.notify_one();
        waiters.pop_front()
    }

    /// Whether a slot is free right now
    pub(crate) fn has_room(&self) -> bool {
        self.limit == 0 || self.planned() < self.limit
    }

    /// Next parked fiber, after the previous one turned out stale
    pub(crate) fn pop_waiter(&self) -> Option<Waiter> {
        self.waiters.lock().pop_front()
    }

    /// Release every waiter (shutdown). Blocked threads re-check and fail.
    pub(crate) fn drain(&self) -> Vec<Waiter> {
        let mut waiters = self.waiters.lock();
        self.cond.notify_all();
        waiters.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_unlimited() {
        let admission = Admission::new(0);
        for _ in 0..100 {
            admission.try_acquire().unwrap();
        }
        assert_eq!(admission.planned(), 100);
    }

    #[test]
    fn test_limit_enforced() {
        let admission = Admission::new(2);
        admission.try_acquire().unwrap();
        admission.try_acquire().unwrap();
        assert!(matches!(
            admission.try_acquire(),
            Err(TaskError::CapacityExhausted(_))
        ));
        assert!(admission.release().is_none());
        admission.try_acquire().unwrap();
        assert_eq!(admission.planned(), 2);
    }

    #[test]
    fn test_blocking_acquire_wakes_on_release() {
        let admission = Arc::new(Admission::new(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        admission.try_acquire().unwrap();

        let a = admission.clone();
        let s = shutdown.clone();
        let handle = thread::spawn(move || a.acquire_blocking(&s));
        thread::sleep(Duration::from_millis(20));
        admission.release();
        handle.join().unwrap().unwrap();
        assert_eq!(admission.planned(), 1);
    }

    #[test]
    fn test_blocking_acquire_fails_at_shutdown() {
        let admission = Arc::new(Admission::new(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        admission.try_acquire().unwrap();

        let a = admission.clone();
        let s = shutdown.clone();
        let handle = thread::spawn(move || a.acquire_blocking(&s));
        thread::sleep(Duration::from_millis(20));
        shutdown.store(true, Ordering::Release);
        admission.drain();
        assert_eq!(handle.join().unwrap(), Err(TaskError::ShutDown));
    }
}
