//! Latency of one barrier round across threads sharing host events

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mpbench::prelude::*;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(30);

fn rounds(backend: &HostBackend, n_ranks: u32, iters: u64) -> Duration {
    let pool = backend
        .create_event_pool(2 * n_ranks)
        .expect("event pool");

    thread::scope(|s| {
        for rank in 0..n_ranks {
            let pool = &pool;
            s.spawn(move || {
                let events = BarrierEvents::new(backend, pool, n_ranks).expect("events");
                let mut participant = Participant::new(events, rank).expect("participant");
                for _ in 0..iters {
                    participant.arrive_and_wait(TIMEOUT).expect("round");
                }
            });
        }

        let events = BarrierEvents::new(backend, &pool, n_ranks).expect("events");
        let mut coordinator = Coordinator::new(events);
        let start = Instant::now();
        for _ in 0..iters {
            coordinator.round(TIMEOUT).expect("round");
        }
        start.elapsed()
    })
}

fn bench_barrier_round(c: &mut Criterion) {
    let backend = HostBackend::new();
    let mut group = c.benchmark_group("barrier_round");

    for n_ranks in [1u32, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(n_ranks), &n_ranks, |b, &n| {
            b.iter_custom(|iters| rounds(&backend, n, iters))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_barrier_round);
criterion_main!(benches);
