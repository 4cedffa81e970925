//! Integration tests for fiber stacks as seen from running tasks

use std::hint::black_box;
use std::time::Duration;
use weft_core::fiber;
use weft_core::stack::page_size;
use weft_core::{callable, current, Runtime, StackError, StackPool, TaskOptions, Value};

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Runtime::builder().executors(1).stack_size(256 * 1024).build().unwrap()
}

/// Burns roughly one KiB of stack per level
fn recurse(depth: usize) -> usize {
    let frame = black_box([depth as u8; 1024]);
    if depth == 0 {
        return frame[0] as usize;
    }
    recurse(depth - 1) + frame[1023] as usize
}

#[test]
fn test_deep_recursion_fits_in_stack() {
    if !StackPool::is_supported() {
        return;
    }
    let rt = runtime();
    let task = rt
        .spawn(
            callable(|_| Ok(vec![Value::from(recurse(128))])),
            (),
            TaskOptions::new(),
        )
        .unwrap();
    let expected: usize = (1..=128).sum();
    assert_eq!(rt.await_task(&task, false).unwrap(), vec![Value::from(expected)]);
    rt.shutdown();
}

#[test]
fn test_prepare_and_shrink_on_fiber() {
    if !StackPool::is_supported() {
        return;
    }
    let rt = runtime();
    let task = rt
        .spawn(
            callable(|_| {
                let rt = current::runtime().expect("inside a task");
                let pool = rt.stack_pool();
                let committed = pool.prepare(64 * 1024)?;
                black_box(recurse(32));
                let released = pool.shrink_current(16 * 1024)?;
                Ok(vec![Value::from(committed), Value::from(released)])
            }),
            (),
            TaskOptions::new(),
        )
        .unwrap();
    let values = rt.await_task(&task, false).unwrap();
    let committed = values[0].as_int().unwrap() as usize;
    assert!(committed > 0);
    assert!(committed <= 64 * 1024 + page_size());
    assert!(values[1].as_int().unwrap() >= 0);
    rt.shutdown();
}

#[test]
fn test_dump_reports_running_fiber() {
    if !StackPool::is_supported() {
        return;
    }
    let rt = runtime();
    let task = rt
        .spawn(
            callable(|_| {
                let rt = current::runtime().expect("inside a task");
                let (start, end) = fiber::current_stack().expect("on a fiber");
                let region = rt
                    .stack_pool()
                    .dump()
                    .into_iter()
                    .find(|region| region.start == start && region.end == end);
                Ok(match region {
                    Some(region) => vec![
                        Value::from(region.description),
                        Value::from(region.bytes_used > 0),
                        Value::from(region.fault),
                    ],
                    None => vec![],
                })
            }),
            (),
            TaskOptions::new(),
        )
        .unwrap();
    assert_eq!(
        rt.await_task(&task, false).unwrap(),
        vec![
            Value::from("fiber stack (in use)"),
            Value::from(true),
            Value::from(false),
        ]
    );
    rt.shutdown();
}

#[test]
fn test_segments_are_reused() {
    if !StackPool::is_supported() {
        return;
    }
    let rt = runtime();
    for i in 0..32i64 {
        let task = rt
            .spawn(
                callable(move |_| {
                    current::sleep(Duration::from_millis(1))?;
                    Ok(vec![Value::Int(i)])
                }),
                (),
                TaskOptions::new(),
            )
            .unwrap();
        assert_eq!(rt.await_task(&task, false).unwrap(), vec![Value::Int(i)]);
    }
    // One worker running tasks one after another never needs many stacks.
    assert!(rt.stack_pool().mapped_count() <= 4);
    rt.shutdown();
}

#[test]
fn test_current_fiber_operations_off_fiber() {
    let pool = StackPool::new(128 * 1024, 4, false);
    assert!(!fiber::on_fiber());
    assert!(matches!(pool.prepare(4096), Err(StackError::NotOnFiber)));
    assert!(matches!(pool.shrink_current(4096), Err(StackError::NotOnFiber)));
}
