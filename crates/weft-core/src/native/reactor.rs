//! Reactor and completion-callback contracts

use super::op::{Completion, NativeOp, OpKind};
use std::io;
use std::time::Duration;

/// User data of the completion that retires one dispatch thread
pub const SENTINEL: u64 = u64::MAX;

/// An OS asynchronous-completion facility.
///
/// Operations are identified by the `user_data` given at submission; the
/// reactor owns any buffers an operation needs until its completion is
/// returned by [`wait`](AsyncReactor::wait).
pub trait AsyncReactor: Send + Sync {
    /// Short name for logs and diagnostics
    fn name(&self) -> &'static str;

    /// Whether the running kernel supports `kind`
    fn supports(&self, kind: OpKind) -> bool;

    /// Submit `op` under `user_data`
    fn submit(&self, user_data: u64, op: NativeOp) -> io::Result<()>;

    /// Ask for an in-flight operation to complete early with `-ECANCELED`.
    /// Operations already executing complete normally.
    fn cancel(&self, user_data: u64) -> io::Result<()>;

    /// Block up to `timeout` for completions. May return an empty batch.
    fn wait(&self, timeout: Duration) -> io::Result<Vec<Completion>>;

    /// Post one completion with [`SENTINEL`] user data
    fn post_sentinel(&self) -> io::Result<()>;
}

/// Identifies one in-flight native operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeWorkerHandle(pub(crate) u64);

impl NativeWorkerHandle {
    /// Numeric id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NativeWorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Receives the completion of operations it was registered for.
///
/// `handle` runs on a dispatch thread; it should hand the result off rather
/// than block.
pub trait NativeWorkerManager: Send + Sync {
    /// The operation identified by `handle` completed
    fn handle(&self, handle: NativeWorkerHandle, completion: Completion);
}

impl<F> NativeWorkerManager for F
where
    F: Fn(NativeWorkerHandle, Completion) + Send + Sync,
{
    fn handle(&self, handle: NativeWorkerHandle, completion: Completion) {
        self(handle, completion)
    }
}
