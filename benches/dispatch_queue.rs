//! Dispatch queue benchmarks: push/pop throughput under mixed
//! priorities and ready-time gating.

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use uuid::Uuid;

use conductor::domain::models::DispatchQueue;

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_queue");

    for size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("push_pop_mixed", size), &size, |b, &size| {
            b.iter(|| {
                let now = Utc::now();
                let mut queue = DispatchQueue::new();
                for i in 0..size {
                    let priority = (i % 10) as i32;
                    queue.push(Uuid::new_v4(), priority, now, now);
                }
                while let Some(entry) = queue.pop_ready(now) {
                    black_box(entry);
                }
            });
        });
    }

    group.bench_function("pop_skips_future_entries", |b| {
        b.iter(|| {
            let now = Utc::now();
            let mut queue = DispatchQueue::new();
            // Half the entries are not ready yet.
            for i in 0..1_000usize {
                let ready_at = if i % 2 == 0 {
                    now
                } else {
                    now + Duration::seconds(60)
                };
                queue.push(Uuid::new_v4(), (i % 5) as i32, ready_at, now);
            }
            let mut popped = 0;
            while let Some(entry) = queue.pop_ready(now) {
                black_box(entry);
                popped += 1;
            }
            assert_eq!(popped, 500);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
