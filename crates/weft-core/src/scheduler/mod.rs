//! Task Scheduler - fibers over a small pool of OS threads
//!
//! This module implements the cooperative task scheduler: admission-controlled
//! construction, hot/cold ready queues, the timer controller, bound executor
//! pools and the workers that run tasks on pooled fiber stacks.

mod admission;
mod bound;
mod result;
pub(crate) mod shared;
mod task;
pub(crate) mod timer;
pub(crate) mod worker;

pub use bound::ExecutorId;
pub use result::TaskResult;
pub use task::{Priority, Task, TaskId, TaskLocal, TaskOptions, TaskRef, TaskState};

pub(crate) use shared::Shared;
pub(crate) use task::ParkRequest;
