use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft_core::{callable, current, NativeBridge, NativeOp, Runtime, TaskOptions, Value};

fn bench_spawn_await(c: &mut Criterion) {
    let rt = Runtime::builder().executors(2).build().unwrap();

    c.bench_function("spawn_await", |b| {
        b.iter(|| {
            let task = rt
                .spawn(
                    callable(|args| Ok(args)),
                    black_box(Value::Int(1)),
                    TaskOptions::new(),
                )
                .unwrap();
            rt.await_task(&task, false).unwrap()
        });
    });

    rt.shutdown();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for executors in [1usize, 2, 4] {
        let rt = Runtime::builder().executors(executors).build().unwrap();
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(
            BenchmarkId::new("executors", executors),
            &executors,
            |b, _| {
                b.iter(|| {
                    let tasks: Vec<_> = (0..256i64)
                        .map(|i| {
                            rt.spawn(
                                callable(move |_| Ok(vec![Value::Int(i * 2)])),
                                (),
                                TaskOptions::new(),
                            )
                            .unwrap()
                        })
                        .collect();
                    for task in &tasks {
                        black_box(rt.await_task(task, false).unwrap());
                    }
                });
            },
        );
        rt.shutdown();
    }

    group.finish();
}

fn bench_yield(c: &mut Criterion) {
    let rt = Runtime::builder().executors(1).build().unwrap();
    let mut group = c.benchmark_group("yield");

    for rounds in [16usize, 128] {
        group.bench_with_input(BenchmarkId::new("yield_now", rounds), &rounds, |b, &rounds| {
            b.iter(|| {
                let task = rt
                    .spawn(
                        callable(move |_| {
                            for _ in 0..rounds {
                                current::yield_now()?;
                            }
                            Ok(vec![])
                        }),
                        (),
                        TaskOptions::new(),
                    )
                    .unwrap();
                rt.await_task(&task, false).unwrap()
            });
        });
    }

    group.finish();
    rt.shutdown();
}

fn bench_native_nop(c: &mut Criterion) {
    let bridge = NativeBridge::global().unwrap();
    let name = bridge.reactor_name();

    c.bench_function(&format!("native_nop_{}", name), |b| {
        b.iter(|| bridge.wait_sync(black_box(NativeOp::Nop)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_spawn_await,
    bench_fan_out,
    bench_yield,
    bench_native_nop
);
criterion_main!(benches);
