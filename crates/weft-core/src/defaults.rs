//! Default constants for runtime configuration.
//!
//! Centralizes the numbers shared by `RuntimeConfig`, `BridgeConfig`, the
//! stack pool and the timer controller.

/// Default fiber stack reservation in bytes (1 MiB, committed lazily).
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Smallest stack reservation accepted (guard page plus 64 KiB).
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Default number of idle stack segments kept for reuse.
pub const DEFAULT_STACK_CACHE: usize = 64;

/// Default execution quantum for `Priority::Normal`, in milliseconds.
pub const DEFAULT_BASE_QUANTUM_MS: u64 = 10;

/// Hot ready-queue backlog allowed per executor before routing to the cold queue.
pub const DEFAULT_HOT_BACKLOG_PER_EXECUTOR: usize = 64;

/// Timed entries kept in the hot timed structure before routing to the cold one.
pub const DEFAULT_TIMED_HOT_CAPACITY: usize = 1024;

/// Upper bound on how long the timer controller sleeps between checks, in milliseconds.
pub const DEFAULT_TIMER_POLL_MS: u64 = 5;

/// Default minimum number of native dispatch threads.
pub const DEFAULT_MIN_DISPATCH_THREADS: usize = 1;

/// Default hill-climbing sample interval, in milliseconds.
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;

/// Default io_uring submission queue size.
pub const DEFAULT_RING_ENTRIES: u32 = 256;

/// How long a dispatch thread blocks on the completion primitive before
/// re-checking for shutdown, in milliseconds.
pub const DISPATCH_WAIT_MS: u64 = 50;
