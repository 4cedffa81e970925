//! Portable reactor
//!
//! A completion queue emulated in user space: submissions travel over a
//! crossbeam channel and are executed by whichever dispatch thread receives
//! them, using the blocking `pread`/`pwrite`/`fsync` calls. Timeouts live in a
//! min-heap checked by every waiting thread.

use super::op::{Completion, NativeOp, OpKind};
use super::reactor::{AsyncReactor, SENTINEL};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

enum Job {
    Op(u64, NativeOp),
    Sentinel,
    /// Re-check timers and the ready list
    Wake,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OpState {
    Queued,
    Cancelled,
}

pub(crate) struct PortableReactor {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    timers: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    ops: Mutex<FxHashMap<u64, OpState>>,
    ready: Mutex<VecDeque<Completion>>,
}

impl PortableReactor {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            timers: Mutex::new(BinaryHeap::new()),
            ops: Mutex::new(FxHashMap::default()),
            ready: Mutex::new(VecDeque::new()),
        }
    }

    fn send(&self, job: Job) -> io::Result<()> {
        self.tx
            .send(job)
            .map_err(|_| io::Error::from_raw_os_error(libc::EPIPE))
    }

    /// Ready completions plus every expired timer
    fn collect_ready(&self, now: Instant) -> Vec<Completion> {
        let mut out: Vec<Completion> = self.ready.lock().drain(..).collect();
        let mut timers = self.timers.lock();
        while let Some(Reverse((due, id))) = timers.peek().copied() {
            if due > now {
                break;
            }
            timers.pop();
            out.push(Completion::new(id, 0));
        }
        out
    }

    fn next_timer(&self) -> Option<Instant> {
        self.timers.lock().peek().map(|Reverse((due, _))| *due)
    }

    fn run(&self, id: u64, op: NativeOp) -> Completion {
        if self.ops.lock().remove(&id) == Some(OpState::Cancelled) {
            return Completion::new(id, -libc::ECANCELED);
        }
        execute(id, op)
    }
}

impl AsyncReactor for PortableReactor {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn supports(&self, _kind: OpKind) -> bool {
        true
    }

    fn submit(&self, user_data: u64, op: NativeOp) -> io::Result<()> {
        if let NativeOp::Timeout(after) = op {
            self.timers
                .lock()
                .push(Reverse((Instant::now() + after, user_data)));
            return self.send(Job::Wake);
        }
        self.ops.lock().insert(user_data, OpState::Queued);
        self.send(Job::Op(user_data, op))
    }

    fn cancel(&self, user_data: u64) -> io::Result<()> {
        {
            let mut timers = self.timers.lock();
            let before = timers.len();
            timers.retain(|Reverse((_, id))| *id != user_data);
            if timers.len() != before {
                drop(timers);
                self.ready
                    .lock()
                    .push_back(Completion::new(user_data, -libc::ECANCELED));
                return self.send(Job::Wake);
            }
        }
        if let Some(state) = self.ops.lock().get_mut(&user_data) {
            *state = OpState::Cancelled;
        }
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> io::Result<Vec<Completion>> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let ready = self.collect_ready(now);
            if !ready.is_empty() || now >= deadline {
                return Ok(ready);
            }
            let until = self.next_timer().map_or(deadline, |due| due.min(deadline));
            match self.rx.recv_timeout(until.saturating_duration_since(now)) {
                Ok(Job::Op(id, op)) => return Ok(vec![self.run(id, op)]),
                Ok(Job::Sentinel) => return Ok(vec![Completion::new(SENTINEL, 0)]),
                Ok(Job::Wake) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(Vec::new()),
            }
        }
    }

    fn post_sentinel(&self) -> io::Result<()> {
        self.send(Job::Sentinel)
    }
}

fn errno_result(ret: isize) -> i32 {
    if ret < 0 {
        -crate::stack::last_errno()
    } else {
        i32::try_from(ret).unwrap_or(i32::MAX)
    }
}

/// Run one operation synchronously on the calling thread
fn execute(id: u64, op: NativeOp) -> Completion {
    match op {
        NativeOp::Nop | NativeOp::Timeout(_) => Completion::new(id, 0),
        NativeOp::Read { fd, len, offset } => {
            let mut data = vec![0u8; len];
            // SAFETY: `data` is a live buffer of `len` bytes.
            let ret = unsafe {
                libc::pread(
                    fd,
                    data.as_mut_ptr().cast::<libc::c_void>(),
                    len,
                    offset as libc::off_t,
                )
            };
            let result = errno_result(ret);
            data.truncate(usize::try_from(result).unwrap_or(0));
            Completion {
                user_data: id,
                result,
                data,
            }
        }
        NativeOp::Write { fd, data, offset } => {
            // SAFETY: `data` outlives the call.
            let ret = unsafe {
                libc::pwrite(
                    fd,
                    data.as_ptr().cast::<libc::c_void>(),
                    data.len(),
                    offset as libc::off_t,
                )
            };
            Completion::new(id, errno_result(ret))
        }
        NativeOp::Fsync { fd } => {
            // SAFETY: plain syscall on a caller-owned descriptor.
            let ret = unsafe { libc::fsync(fd) };
            Completion::new(id, errno_result(ret as isize))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nop_and_sentinel() {
        let reactor = PortableReactor::new();
        reactor.submit(1, NativeOp::Nop).unwrap();
        reactor.post_sentinel().unwrap();
        let first = reactor.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(first, vec![Completion::new(1, 0)]);
        let second = reactor.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(second[0].user_data, SENTINEL);
    }

    #[test]
    fn test_timeout_fires_in_order() {
        let reactor = PortableReactor::new();
        reactor
            .submit(2, NativeOp::Timeout(Duration::from_millis(20)))
            .unwrap();
        reactor
            .submit(1, NativeOp::Timeout(Duration::from_millis(5)))
            .unwrap();

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.len() < 2 && Instant::now() < deadline {
            seen.extend(
                reactor
                    .wait(Duration::from_millis(50))
                    .unwrap()
                    .into_iter()
                    .map(|c| c.user_data),
            );
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_cancel_timer() {
        let reactor = PortableReactor::new();
        reactor
            .submit(9, NativeOp::Timeout(Duration::from_secs(60)))
            .unwrap();
        reactor.cancel(9).unwrap();
        let completions = reactor.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(completions, vec![Completion::new(9, -libc::ECANCELED)]);
    }

    #[test]
    fn test_cancel_queued_op() {
        let reactor = PortableReactor::new();
        reactor.submit(4, NativeOp::Nop).unwrap();
        reactor.cancel(4).unwrap();
        let completions = reactor.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(completions[0].errno(), Some(libc::ECANCELED));
    }

    #[test]
    fn test_empty_wait_times_out() {
        let reactor = PortableReactor::new();
        let start = Instant::now();
        assert!(reactor.wait(Duration::from_millis(10)).unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_read_bad_fd() {
        let reactor = PortableReactor::new();
        reactor
            .submit(
                3,
                NativeOp::Read {
                    fd: -1,
                    len: 8,
                    offset: 0,
                },
            )
            .unwrap();
        let completions = reactor.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(completions[0].errno(), Some(libc::EBADF));
        assert!(completions[0].data.is_empty());
    }
}
