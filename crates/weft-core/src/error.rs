//! Error types shared by the scheduler, the stack pool and the native bridge.

use crate::scheduler::ExecutorId;
use crate::value::Value;
use std::fmt;

/// Why a task was cancelled
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// `notify_cancel` was called on the task
    Requested,

    /// The task called `self_cancel`
    SelfCancelled,

    /// The task's timeout instant passed before it finished
    Timeout,

    /// The runtime was shut down while the task was pending
    Shutdown,
}

impl CancelReason {
    pub(crate) fn code(self) -> u8 {
        match self {
            CancelReason::Requested => 1,
            CancelReason::SelfCancelled => 2,
            CancelReason::Timeout => 3,
            CancelReason::Shutdown => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CancelReason::Requested),
            2 => Some(CancelReason::SelfCancelled),
            3 => Some(CancelReason::Timeout),
            4 => Some(CancelReason::Shutdown),
            _ => None,
        }
    }

    /// Short name passed to cancellation handlers
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Requested => "requested",
            CancelReason::SelfCancelled => "self",
            CancelReason::Timeout => "timeout",
            CancelReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals raised by scheduler operations and carried as a task's terminal error.
///
/// Every awaiter of a failed task receives its own clone of the error, so the
/// type is `Clone` and holds OS errors by their raw code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// Cancellation signal observed at a checkpoint
    #[error("Task cancelled ({0})")]
    Cancelled(CancelReason),

    /// A task-only operation was called from a thread that is not running a task
    #[error("`{0}` called outside of a running task")]
    WrongContext(&'static str),

    /// An admission limit or identifier space is exhausted
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// The task's callable raised an exception value
    #[error("Uncaught exception: {0:?}")]
    Exception(Value),

    /// The task's callable panicked
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The task was created without task-local storage
    #[error("Task-local storage was not requested for this task")]
    TaskLocalDisabled,

    /// The requested native operation is not available on this kernel
    #[error("Unsupported native operation: {0}")]
    Unsupported(String),

    /// No bound executor is registered under this id
    #[error("Executor {0} not found")]
    ExecutorNotFound(ExecutorId),

    /// The bound executor does not allow implicit starts
    #[error("Executor {0} does not allow implicit starts")]
    ImplicitStartDenied(ExecutorId),

    /// The runtime has been shut down
    #[error("Runtime is shut down")]
    ShutDown,

    /// An OS call failed with this errno
    #[error("OS error {0}")]
    Os(i32),

    /// Fiber stack allocation failed
    #[error("Stack error: {0}")]
    Stack(String),
}

impl TaskError {
    /// Raise an exception value from inside a callable
    pub fn raise(value: impl Into<Value>) -> Self {
        TaskError::Exception(value.into())
    }

    /// Whether this is the cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        TaskError::Os(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<crate::stack::StackError> for TaskError {
    fn from(err: crate::stack::StackError) -> Self {
        TaskError::Stack(err.to_string())
    }
}

/// Result type used throughout the runtime
pub type RtResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_reason_codes_round_trip() {
        for reason in [
            CancelReason::Requested,
            CancelReason::SelfCancelled,
            CancelReason::Timeout,
            CancelReason::Shutdown,
        ] {
            assert_eq!(CancelReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(CancelReason::from_code(0), None);
    }

    #[test]
    fn test_error_display() {
        let err = TaskError::WrongContext("check_cancellation");
        assert_eq!(
            err.to_string(),
            "`check_cancellation` called outside of a running task"
        );
        assert!(TaskError::Cancelled(CancelReason::Timeout).is_cancelled());
        assert!(!TaskError::ShutDown.is_cancelled());
    }

    #[test]
    fn test_raise_wraps_value() {
        assert_eq!(
            TaskError::raise("boom"),
            TaskError::Exception(Value::from("boom"))
        );
    }
}
