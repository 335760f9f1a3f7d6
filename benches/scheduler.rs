use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Instant;

use ticklist::{Scheduler, backend::mock::MockBackend};

// ==================== Helpers ====================

fn bench_sched() -> (Scheduler<usize>, MockBackend) {
    let mock = MockBackend::new();
    (Scheduler::new(Box::new(mock.clone())), mock)
}

// ==================== Schedule Benchmarks ====================

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");

    group.bench_function("set_timeout_clear", |b| {
        let (mut sched, _mock) = bench_sched();

        b.iter(|| {
            let id = sched.set_timeout(|_, count| Ok(*count += 1), 100.0);
            sched.clear_timeout(id);
            black_box(())
        });
    });

    group.bench_function("shared_bucket_burst", |b| {
        b.iter_custom(|iters| {
            let (mut sched, _mock) = bench_sched();
            let start = Instant::now();

            for i in 0..iters {
                // A handful of durations, so appends hit existing buckets.
                let after = (100 + (i % 8) * 50) as f64;
                let _ = black_box(sched.set_timeout(|_, count| Ok(*count += 1), after));
            }

            start.elapsed()
        });
    });

    for durations in [1usize, 16, 256] {
        group.bench_with_input(
            BenchmarkId::new("distinct_durations", durations),
            &durations,
            |b, &durations| {
                b.iter_custom(|iters| {
                    let (mut sched, _mock) = bench_sched();
                    let start = Instant::now();

                    for i in 0..iters {
                        let after = (10 + (i as usize % durations)) as f64;
                        let _ = black_box(sched.set_timeout(|_, count| Ok(*count += 1), after));
                    }

                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

// ==================== Drain Benchmarks ====================

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");

    for timers in [100usize, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("same_bucket", timers),
            &timers,
            |b, &timers| {
                b.iter_custom(|iters| {
                    let mut total = std::time::Duration::ZERO;

                    for _ in 0..iters {
                        let (mut sched, mock) = bench_sched();
                        for _ in 0..timers {
                            sched.set_timeout(|_, count| Ok(*count += 1), 50.0);
                        }
                        let mut count = 0usize;

                        let start = Instant::now();
                        for handle in mock.advance_to(50) {
                            sched.on_fire(handle, &mut count).unwrap();
                        }
                        total += start.elapsed();

                        assert_eq!(count, timers);
                    }

                    total
                });
            },
        );
    }

    group.finish();
}

// ==================== Immediate Benchmarks ====================

fn bench_immediates(c: &mut Criterion) {
    let mut group = c.benchmark_group("immediates");

    group.bench_function("queue_drain_100", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;

            for _ in 0..iters {
                let (mut sched, _mock) = bench_sched();
                let mut count = 0usize;

                let start = Instant::now();
                for _ in 0..100 {
                    sched.set_immediate(|_, count| Ok(*count += 1));
                }
                sched.run_immediates(&mut count).unwrap();
                total += start.elapsed();

                assert_eq!(count, 100);
            }

            total
        });
    });

    group.finish();
}

criterion_group!(benches, bench_schedule, bench_drain, bench_immediates);
criterion_main!(benches);
