//! Native operations and their completions

use crate::error::{CancelReason, RtResult, TaskError};
use crate::value::Value;
use std::os::fd::RawFd;
use std::time::Duration;

/// An OS asynchronous operation.
///
/// File descriptors are borrowed: the caller keeps them open until the
/// operation completes or is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeOp {
    /// Completes immediately with 0
    Nop,
    /// Completes with 0 once the duration elapsed
    Timeout(Duration),
    /// Read up to `len` bytes at `offset`
    Read {
        /// Source descriptor
        fd: RawFd,
        /// Bytes requested
        len: usize,
        /// File offset
        offset: u64,
    },
    /// Write `data` at `offset`
    Write {
        /// Target descriptor
        fd: RawFd,
        /// Bytes to write
        data: Vec<u8>,
        /// File offset
        offset: u64,
    },
    /// Flush file data and metadata
    Fsync {
        /// Target descriptor
        fd: RawFd,
    },
}

/// Operation kind, used for support probing
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// [`NativeOp::Nop`]
    Nop,
    /// [`NativeOp::Timeout`]
    Timeout,
    /// [`NativeOp::Read`]
    Read,
    /// [`NativeOp::Write`]
    Write,
    /// [`NativeOp::Fsync`]
    Fsync,
}

impl OpKind {
    /// Every kind
    pub const ALL: [OpKind; 5] = [
        OpKind::Nop,
        OpKind::Timeout,
        OpKind::Read,
        OpKind::Write,
        OpKind::Fsync,
    ];

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Nop => "nop",
            OpKind::Timeout => "timeout",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Fsync => "fsync",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl NativeOp {
    /// Kind of this operation
    pub fn kind(&self) -> OpKind {
        match self {
            NativeOp::Nop => OpKind::Nop,
            NativeOp::Timeout(_) => OpKind::Timeout,
            NativeOp::Read { .. } => OpKind::Read,
            NativeOp::Write { .. } => OpKind::Write,
            NativeOp::Fsync { .. } => OpKind::Fsync,
        }
    }
}

/// Result of one native operation as reported by a reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Operation id the reactor was given at submission
    pub user_data: u64,
    /// Non-negative result, or a negated errno
    pub result: i32,
    /// Bytes read (empty for every other operation)
    pub data: Vec<u8>,
}

impl Completion {
    pub(crate) fn new(user_data: u64, result: i32) -> Self {
        Self {
            user_data,
            result,
            data: Vec::new(),
        }
    }

    /// Whether the operation failed
    pub fn is_error(&self) -> bool {
        self.result < 0
    }

    /// Errno of a failed operation
    pub fn errno(&self) -> Option<i32> {
        (self.result < 0).then(|| -self.result)
    }

    /// Task outcome: `[Int(result), Bytes(data)]`, `Cancelled` for an
    /// operation cancelled in flight, `Os(errno)` for any other failure
    pub fn into_outcome(self) -> RtResult<Vec<Value>> {
        match self.errno() {
            Some(libc::ECANCELED) => Err(TaskError::Cancelled(CancelReason::Requested)),
            Some(errno) => Err(TaskError::Os(errno)),
            None => Ok(vec![
                Value::Int(i64::from(self.result)),
                Value::from(self.data),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_index_matches_all() {
        for (i, kind) in OpKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(NativeOp::Fsync { fd: 0 }.kind(), OpKind::Fsync);
        assert_eq!(OpKind::Timeout.as_str(), "timeout");
    }

    #[test]
    fn test_completion_outcome() {
        let mut ok = Completion::new(1, 3);
        ok.data = b"abc".to_vec();
        assert_eq!(
            ok.into_outcome().unwrap(),
            vec![Value::Int(3), Value::from(b"abc".to_vec())]
        );

        let cancelled = Completion::new(1, -libc::ECANCELED);
        assert!(cancelled.into_outcome().unwrap_err().is_cancelled());

        let failed = Completion::new(1, -libc::EBADF);
        assert_eq!(failed.errno(), Some(libc::EBADF));
        assert_eq!(failed.into_outcome(), Err(TaskError::Os(libc::EBADF)));
    }
}
