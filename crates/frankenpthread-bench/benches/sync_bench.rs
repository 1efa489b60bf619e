//! Condition variable, barrier and semaphore benchmarks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use frankenpthread_core::sem::SEM_VALUE_MAX;
use frankenpthread_core::{Barrier, Cond, Mutex, MutexKind, Semaphore};

fn bench_cond(c: &mut Criterion) {
    let mut group = c.benchmark_group("cond");

    let cv = Cond::init().unwrap();
    group.bench_function("signal_no_waiters", |b| {
        b.iter(|| black_box(cv.signal()).unwrap());
    });
    group.bench_function("broadcast_no_waiters", |b| {
        b.iter(|| black_box(cv.broadcast()).unwrap());
    });

    // Two threads hand a turn flag back and forth.
    group.sample_size(20);
    group.bench_function("ping_pong", |b| {
        b.iter_custom(|iters| {
            let m = Arc::new(Mutex::init(MutexKind::Normal).unwrap());
            let cv = Arc::new(Cond::init().unwrap());
            let turn = Arc::new(AtomicU64::new(0));
            let peer = {
                let (m, cv, turn) = (Arc::clone(&m), Arc::clone(&cv), Arc::clone(&turn));
                std::thread::spawn(move || {
                    for i in 0..iters {
                        m.lock().unwrap();
                        while turn.load(Ordering::Relaxed) != 2 * i + 1 {
                            cv.wait(&m).unwrap();
                        }
                        turn.store(2 * i + 2, Ordering::Relaxed);
                        cv.signal().unwrap();
                        m.unlock().unwrap();
                    }
                })
            };
            let start = Instant::now();
            for i in 0..iters {
                m.lock().unwrap();
                turn.store(2 * i + 1, Ordering::Relaxed);
                cv.signal().unwrap();
                while turn.load(Ordering::Relaxed) != 2 * i + 2 {
                    cv.wait(&m).unwrap();
                }
                m.unlock().unwrap();
            }
            let elapsed = start.elapsed();
            let _ = peer.join();
            elapsed
        });
    });
    group.finish();
}

fn bench_barrier(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier_round");
    group.sample_size(20);
    for parties in [2u32, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(parties), &parties, |b, &p| {
            b.iter_custom(|iters| barrier_rounds(p, iters));
        });
    }
    group.finish();
}

fn barrier_rounds(parties: u32, rounds: u64) -> Duration {
    let barrier = Arc::new(Barrier::init(parties).unwrap());
    let others: Vec<_> = (1..parties)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                for _ in 0..rounds {
                    barrier.wait().unwrap();
                }
            })
        })
        .collect();
    let start = Instant::now();
    for _ in 0..rounds {
        black_box(barrier.wait().unwrap());
    }
    let elapsed = start.elapsed();
    for o in others {
        let _ = o.join();
    }
    elapsed
}

fn bench_semaphore(c: &mut Criterion) {
    let mut group = c.benchmark_group("semaphore");
    let s = Semaphore::init(0, SEM_VALUE_MAX).unwrap();
    group.bench_function("post_wait", |b| {
        b.iter(|| {
            s.post().unwrap();
            s.wait().unwrap();
        });
    });
    group.bench_function("post_trywait", |b| {
        b.iter(|| {
            s.post().unwrap();
            black_box(s.trywait()).unwrap();
        });
    });

    // Producer posts, bench thread consumes; most waits block.
    group.sample_size(20);
    group.bench_function("handoff", |b| {
        b.iter_custom(|iters| {
            let s = Arc::new(Semaphore::init(0, SEM_VALUE_MAX).unwrap());
            let producer = {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for _ in 0..iters {
                        s.post().unwrap();
                    }
                })
            };
            let start = Instant::now();
            for _ in 0..iters {
                s.wait().unwrap();
            }
            let elapsed = start.elapsed();
            let _ = producer.join();
            elapsed
        });
    });
    group.finish();
}

criterion_group!(benches, bench_cond, bench_barrier, bench_semaphore);
criterion_main!(benches);
