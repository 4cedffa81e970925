//! io_uring reactor (Linux)
//!
//! One ring shared by every dispatch thread. Submissions push under the `sq`
//! lock and are flushed right away; one dispatch thread at a time reaps the
//! completion queue under the `cq` lock. Buffers and timespecs of in-flight
//! operations are owned by the reactor until their completion is reaped.

use super::op::{Completion, NativeOp, OpKind};
use super::reactor::{AsyncReactor, SENTINEL};
use io_uring::{opcode, squeue, types, IoUring, Probe};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io;
use std::time::Duration;

/// User data of `AsyncCancel` requests; their own completions are dropped
const CANCEL_TAG: u64 = u64::MAX - 1;

/// Memory the kernel may touch until the operation completes
enum Owned {
    Nothing,
    Read(Vec<u8>),
    Write(Vec<u8>),
    Timeout(Box<types::Timespec>),
}

pub(crate) struct UringReactor {
    ring: IoUring,
    sq: Mutex<()>,
    cq: Mutex<()>,
    in_flight: Mutex<FxHashMap<u64, Owned>>,
    supported: [bool; 5],
    ext_arg: bool,
}

impl UringReactor {
    pub(crate) fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries.max(2))?;
        let supported = probe(&ring);
        let ext_arg = ring.params().is_feature_ext_arg();
        tracing::debug!(
            entries,
            ext_arg,
            read = supported[OpKind::Read.index()],
            write = supported[OpKind::Write.index()],
            "io_uring ring created"
        );
        Ok(Self {
            ring,
            sq: Mutex::new(()),
            cq: Mutex::new(()),
            in_flight: Mutex::new(FxHashMap::default()),
            supported,
            ext_arg,
        })
    }

    fn push(&self, entry: &squeue::Entry) -> io::Result<()> {
        let _sq = self.sq.lock();
        // SAFETY: the `sq` lock serialises every user of the submission queue,
        // and the memory `entry` points to is owned by `in_flight`.
        unsafe {
            let mut sq = self.ring.submission_shared();
            if sq.push(entry).is_err() {
                drop(sq);
                self.ring.submit()?;
                let mut sq = self.ring.submission_shared();
                sq.push(entry)
                    .map_err(|_| io::Error::from_raw_os_error(libc::EBUSY))?;
            }
        }
        self.ring.submit()?;
        Ok(())
    }

    /// Reap every available completion. Caller holds the `cq` lock.
    fn reap(&self) -> Vec<Completion> {
        let mut out = Vec::new();
        // SAFETY: the `cq` lock serialises every user of the completion queue.
        let cq = unsafe { self.ring.completion_shared() };
        for cqe in cq {
            let user_data = cqe.user_data();
            if user_data == CANCEL_TAG {
                continue;
            }
            if user_data == SENTINEL {
                out.push(Completion::new(SENTINEL, 0));
                continue;
            }
            let owned = self.in_flight.lock().remove(&user_data);
            let mut completion = Completion::new(user_data, cqe.result());
            match owned {
                Some(Owned::Timeout(_)) if completion.result == -libc::ETIME => {
                    completion.result = 0;
                }
                Some(Owned::Read(mut data)) if completion.result >= 0 => {
                    data.truncate(completion.result as usize);
                    completion.data = data;
                }
                _ => {}
            }
            out.push(completion);
        }
        out
    }

    fn block(&self, timeout: Duration) -> io::Result<()> {
        let result = if self.ext_arg {
            let ts = timespec(timeout);
            let args = types::SubmitArgs::new().timespec(&ts);
            self.ring.submitter().submit_with_args(1, &args)
        } else {
            self.ring.submitter().submit_and_wait(1)
        };
        match result {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl AsyncReactor for UringReactor {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn supports(&self, kind: OpKind) -> bool {
        self.supported[kind.index()]
    }

    fn submit(&self, user_data: u64, op: NativeOp) -> io::Result<()> {
        let (entry, owned) = match op {
            NativeOp::Nop => (opcode::Nop::new().build(), Owned::Nothing),
            NativeOp::Timeout(after) => {
                let ts = Box::new(timespec(after));
                let entry = opcode::Timeout::new(&*ts as *const types::Timespec).build();
                (entry, Owned::Timeout(ts))
            }
            NativeOp::Read { fd, len, offset } => {
                let len32 = u32::try_from(len)
                    .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
                let mut data = vec![0u8; len];
                let entry = opcode::Read::new(types::Fd(fd), data.as_mut_ptr(), len32)
                    .offset(offset)
                    .build();
                (entry, Owned::Read(data))
            }
            NativeOp::Write { fd, data, offset } => {
                let len32 = u32::try_from(data.len())
                    .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
                let entry = opcode::Write::new(types::Fd(fd), data.as_ptr(), len32)
                    .offset(offset)
                    .build();
                (entry, Owned::Write(data))
            }
            NativeOp::Fsync { fd } => (opcode::Fsync::new(types::Fd(fd)).build(), Owned::Nothing),
        };
        let entry = entry.user_data(user_data);

        self.in_flight.lock().insert(user_data, owned);
        if let Err(err) = self.push(&entry) {
            self.in_flight.lock().remove(&user_data);
            return Err(err);
        }
        Ok(())
    }

    fn cancel(&self, user_data: u64) -> io::Result<()> {
        if !self.in_flight.lock().contains_key(&user_data) {
            return Ok(());
        }
        let entry = opcode::AsyncCancel::new(user_data)
            .build()
            .user_data(CANCEL_TAG);
        self.push(&entry)
    }

    fn wait(&self, timeout: Duration) -> io::Result<Vec<Completion>> {
        let _cq = self.cq.lock();
        let ready = self.reap();
        if !ready.is_empty() {
            return Ok(ready);
        }
        self.block(timeout)?;
        Ok(self.reap())
    }

    fn post_sentinel(&self) -> io::Result<()> {
        self.push(&opcode::Nop::new().build().user_data(SENTINEL))
    }
}

impl Drop for UringReactor {
    fn drop(&mut self) {
        let pending = self.in_flight.get_mut().len();
        if pending > 0 {
            // The kernel may still write into these buffers.
            tracing::warn!(pending, "io_uring reactor dropped with operations in flight");
            for (_, owned) in self.in_flight.get_mut().drain() {
                std::mem::forget(owned);
            }
        }
    }
}

fn timespec(duration: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

/// Which operations the kernel implements. Kernels without `REGISTER_PROBE`
/// predate `IORING_OP_READ`/`IORING_OP_WRITE`.
fn probe(ring: &IoUring) -> [bool; 5] {
    let mut probe = Probe::new();
    if ring.submitter().register_probe(&mut probe).is_err() {
        return [true, true, false, false, true];
    }
    let mut supported = [false; 5];
    for kind in OpKind::ALL {
        supported[kind.index()] = match kind {
            OpKind::Nop => probe.is_supported(opcode::Nop::CODE),
            OpKind::Timeout => probe.is_supported(opcode::Timeout::CODE),
            OpKind::Read => probe.is_supported(opcode::Read::CODE),
            OpKind::Write => probe.is_supported(opcode::Write::CODE),
            OpKind::Fsync => probe.is_supported(opcode::Fsync::CODE),
        };
    }
    supported
}
