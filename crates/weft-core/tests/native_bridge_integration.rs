//! Integration tests for the native async bridge and native tasks

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use weft_core::native::SENTINEL;
use weft_core::{
    callable, AsyncReactor, BridgeConfig, CancelReason, Completion, NativeBridge, NativeOp,
    OpKind, Runtime, RuntimeConfig, TaskError, TaskOptions, Value,
};

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Runtime::new(RuntimeConfig::default().with_executors(2)).unwrap()
}

fn portable_bridge() -> NativeBridge {
    NativeBridge::new(&BridgeConfig {
        force_portable: true,
        min_dispatch_threads: 1,
        max_dispatch_threads: 2,
        ..BridgeConfig::default()
    })
    .unwrap()
}

// ============================================================================
// Native tasks
// ============================================================================

#[test]
fn test_native_task_result() {
    let rt = runtime();
    let task = rt
        .create_native_task(|| {
            thread::sleep(Duration::from_millis(5));
            Ok(vec![Value::from("from a foreign thread")])
        })
        .unwrap();
    assert!(task.is_started());
    assert_eq!(
        rt.await_task(&task, false).unwrap(),
        vec![Value::from("from a foreign thread")]
    );
    rt.shutdown();
}

#[test]
fn test_native_task_awaited_from_task() {
    let rt = runtime();
    let native = rt
        .create_native_task(|| Ok(vec![Value::Int(21)]))
        .unwrap();
    let outer = rt
        .spawn(
            callable(move |_| {
                let rt = weft_core::current::runtime().expect("inside a task");
                let values = rt.await_task(&native, false)?;
                let n = values[0].as_int().unwrap_or(0);
                Ok(vec![Value::Int(n * 2)])
            }),
            (),
            TaskOptions::new(),
        )
        .unwrap();
    assert_eq!(rt.await_task(&outer, false).unwrap(), vec![Value::Int(42)]);
    rt.shutdown();
}

#[test]
fn test_native_task_panic_and_error() {
    let rt = runtime();
    let panicking = rt
        .create_native_task(|| -> weft_core::RtResult<Vec<Value>> { panic!("boom") })
        .unwrap();
    assert!(matches!(
        rt.await_task(&panicking, false),
        Err(TaskError::Panicked(_))
    ));

    let failing = rt
        .create_native_task(|| Err(TaskError::raise(Value::from("bad input"))))
        .unwrap();
    assert_eq!(
        rt.await_task(&failing, false),
        Err(TaskError::Exception(Value::from("bad input")))
    );
    rt.shutdown();
}

#[test]
fn test_cancel_native_task_completes_immediately() {
    let rt = runtime();
    let release = Arc::new(AtomicBool::new(false));
    let gate = release.clone();
    let task = rt
        .create_native_task(move || {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(vec![Value::Int(1)])
        })
        .unwrap();

    rt.notify_cancel(&task);
    assert_eq!(
        rt.await_task(&task, false),
        Err(TaskError::Cancelled(CancelReason::Requested))
    );
    assert!(task.is_cancelled());

    // The late outcome is discarded
    release.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(
        rt.await_task(&task, false),
        Err(TaskError::Cancelled(CancelReason::Requested))
    );
    rt.shutdown();
}

// ============================================================================
// Bridge operations
// ============================================================================

#[test]
fn test_bridge_nop_and_timeout() {
    let rt = runtime();
    let nop = rt.cxx_native_bridge(NativeOp::Nop).unwrap();
    let values = rt.await_task(&nop, false).unwrap();
    assert_eq!(values[0], Value::Int(0));
    assert_eq!(values[1].as_bytes(), Some(&[][..]));

    let started = Instant::now();
    let timeout = rt
        .cxx_native_bridge(NativeOp::Timeout(Duration::from_millis(20)))
        .unwrap();
    let values = rt.await_task(&timeout, false).unwrap();
    assert_eq!(values[0], Value::Int(0));
    assert!(started.elapsed() >= Duration::from_millis(15));
    rt.shutdown();
}

#[test]
fn test_cancel_bridge_task() {
    let rt = runtime();
    let task = rt
        .cxx_native_bridge(NativeOp::Timeout(Duration::from_secs(30)))
        .unwrap();
    let started = Instant::now();
    rt.notify_cancel(&task);
    assert_eq!(
        rt.await_task(&task, false),
        Err(TaskError::Cancelled(CancelReason::Requested))
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    rt.shutdown();
}

#[test]
fn test_file_io_round_trip() {
    let bridge = portable_bridge();
    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();

    let written = bridge
        .wait_sync(NativeOp::Write {
            fd,
            data: b"hello weft".to_vec(),
            offset: 0,
        })
        .unwrap();
    assert_eq!(written[0], Value::Int(10));

    let synced = bridge.wait_sync(NativeOp::Fsync { fd }).unwrap();
    assert_eq!(synced[0], Value::Int(0));

    let read = bridge
        .wait_sync(NativeOp::Read {
            fd,
            len: 64,
            offset: 6,
        })
        .unwrap();
    assert_eq!(read[0], Value::Int(4));
    assert_eq!(read[1].as_bytes(), Some(&b"weft"[..]));
    bridge.shutdown();
}

#[test]
fn test_file_io_through_global_bridge() {
    let bridge = NativeBridge::global().unwrap();
    if !bridge.supports(OpKind::Write) || !bridge.supports(OpKind::Read) {
        return;
    }
    let rt = runtime();
    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();

    let write = rt
        .cxx_native_bridge(NativeOp::Write {
            fd,
            data: vec![7; 128],
            offset: 0,
        })
        .unwrap();
    assert_eq!(rt.await_task(&write, false).unwrap()[0], Value::Int(128));

    let read = rt
        .cxx_native_bridge(NativeOp::Read {
            fd,
            len: 256,
            offset: 0,
        })
        .unwrap();
    let values = rt.await_task(&read, false).unwrap();
    assert_eq!(values[0], Value::Int(128));
    assert_eq!(values[1].as_bytes().map(<[u8]>::len), Some(128));
    drop(file);
    rt.shutdown();
}

#[test]
fn test_bad_descriptor_reports_errno() {
    let bridge = portable_bridge();
    assert_eq!(
        bridge.wait_sync(NativeOp::Fsync { fd: -1 }),
        Err(TaskError::Os(libc::EBADF))
    );
    bridge.shutdown();
}

#[test]
fn test_wait_sync_inside_task_parks() {
    let rt = runtime();
    let task = rt
        .spawn(
            callable(|_| {
                let bridge = NativeBridge::global()?;
                let values = bridge.wait_sync(NativeOp::Timeout(Duration::from_millis(5)))?;
                Ok(vec![values[0].clone(), Value::Bool(weft_core::current::is_task())])
            }),
            (),
            TaskOptions::new(),
        )
        .unwrap();
    assert_eq!(
        rt.await_task(&task, false).unwrap(),
        vec![Value::Int(0), Value::Bool(true)]
    );
    rt.shutdown();
}

#[test]
fn test_dispatch_threads_stay_in_bounds() {
    let bridge = NativeBridge::new(&BridgeConfig {
        force_portable: true,
        min_dispatch_threads: 1,
        max_dispatch_threads: 3,
        sample_interval_ms: 10,
        ..BridgeConfig::default()
    })
    .unwrap();

    for _ in 0..200 {
        bridge.wait_sync(NativeOp::Nop).unwrap();
    }
    thread::sleep(Duration::from_millis(50));
    let threads = bridge.dispatch_threads();
    assert!((1..=3).contains(&threads), "{} dispatch threads", threads);
    assert_eq!(bridge.completed(), 200);
    assert_eq!(bridge.in_flight(), 0);
    bridge.shutdown();
    assert_eq!(bridge.dispatch_threads(), 0);
}

// ============================================================================
// Unsupported operations
// ============================================================================

/// Reactor that only implements `Nop`, completing it immediately
struct NopReactor {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl NopReactor {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    fn post(&self, user_data: u64) -> io::Result<()> {
        self.tx
            .send(Completion {
                user_data,
                result: 0,
                data: Vec::new(),
            })
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

impl AsyncReactor for NopReactor {
    fn name(&self) -> &'static str {
        "nop-only"
    }

    fn supports(&self, kind: OpKind) -> bool {
        kind == OpKind::Nop
    }

    fn submit(&self, user_data: u64, op: NativeOp) -> io::Result<()> {
        assert_eq!(op, NativeOp::Nop);
        self.post(user_data)
    }

    fn cancel(&self, _user_data: u64) -> io::Result<()> {
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> io::Result<Vec<Completion>> {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut batch = vec![first];
                batch.extend(self.rx.try_iter());
                Ok(batch)
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    fn post_sentinel(&self) -> io::Result<()> {
        self.post(SENTINEL)
    }
}

fn nop_bridge() -> Arc<NativeBridge> {
    let config = BridgeConfig {
        min_dispatch_threads: 1,
        max_dispatch_threads: 1,
        ..BridgeConfig::default()
    };
    Arc::new(NativeBridge::with_reactor(Arc::new(NopReactor::new()), &config).unwrap())
}

#[test]
fn test_unsupported_op_rejected_at_submission() {
    let bridge = nop_bridge();
    assert_eq!(bridge.reactor_name(), "nop-only");
    assert!(!bridge.supports(OpKind::Fsync));

    assert!(matches!(
        bridge.wait_sync(NativeOp::Fsync { fd: 0 }),
        Err(TaskError::Unsupported(_))
    ));
    assert_eq!(bridge.in_flight(), 0);

    // Supported kinds still go through
    assert_eq!(bridge.wait_sync(NativeOp::Nop).unwrap()[0], Value::Int(0));
    bridge.shutdown();
}

#[test]
fn test_unsupported_op_inside_task() {
    let rt = runtime();
    let bridge = nop_bridge();
    let inner = bridge.clone();
    let task = rt
        .spawn(
            callable(move |_| {
                let unsupported = matches!(
                    inner.wait_sync(NativeOp::Timeout(Duration::from_millis(1))),
                    Err(TaskError::Unsupported(_))
                );
                let nop = inner.wait_sync(NativeOp::Nop)?;
                Ok(vec![Value::Bool(unsupported), nop[0].clone()])
            }),
            (),
            TaskOptions::new(),
        )
        .unwrap();
    assert_eq!(
        rt.await_task(&task, false).unwrap(),
        vec![Value::Bool(true), Value::Int(0)]
    );
    // No placeholder was left behind by the rejected operation
    assert_eq!(rt.stats().active_tasks, 0);
    bridge.shutdown();
    rt.shutdown();
}
