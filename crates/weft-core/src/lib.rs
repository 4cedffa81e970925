//! Weft Core Runtime
//!
//! This crate provides the concurrency core of a language runtime:
//! - Task scheduler (cooperative fibers over a small pool of OS threads)
//! - Admission control with hot/cold ready queues and a timer controller
//! - Bound executor pools addressable by id
//! - Fiber stack pool with guard pages, pre-commit and shrinking
//! - Native async bridge (io_uring or a portable completion queue) with
//!   hill-climbing dispatch-thread sizing
//!
//! Code running inside a task uses the functions in [`current`] for
//! checkpoints, suspension and introspection; everything else goes through a
//! [`Runtime`] handle.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod current;
pub mod defaults;
pub mod error;
pub mod fiber;
pub mod native;
pub mod runtime;
pub mod scheduler;
pub mod stack;
pub mod value;

pub use config::{BridgeConfig, ConfigError, ConfigFile, RuntimeConfig};
pub use error::{CancelReason, RtResult, TaskError};
pub use native::{
    AsyncReactor, Completion, NativeBridge, NativeOp, NativeWorkerHandle, NativeWorkerManager,
    OpKind,
};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStats};
pub use scheduler::{
    ExecutorId, Priority, Task, TaskId, TaskLocal, TaskOptions, TaskRef, TaskResult, TaskState,
};
pub use stack::{StackError, StackPool, StackRegion, StackSegment};
pub use value::{callable, Callable, Value};
