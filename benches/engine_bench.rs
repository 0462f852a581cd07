//! Benchmarks for workcircle
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use workcircle::{Circle, CircleConfig, Handle, LocalQueue};

fn benchmark_queue_operations(c: &mut Criterion) {
    c.bench_function("queue_enqueue_dequeue", |b| {
        let mut queue = LocalQueue::new(4096);

        b.iter(|| {
            queue.enqueue(b"/test/path/to/some/file.txt").unwrap();
            let item = queue.dequeue().unwrap();
            black_box(item);
        })
    });

    c.bench_function("queue_take_from_far", |b| {
        let mut queue = LocalQueue::new(4096);

        b.iter(|| {
            for i in 0..64u32 {
                queue.enqueue(&i.to_le_bytes()).unwrap();
            }
            let stolen = queue.take_from_far(32);
            queue.merge_stolen(stolen);
            while queue.dequeue().is_some() {}
        })
    });
}

fn benchmark_small_run(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();

    c.bench_function("circle_four_ranks_1000_items", |b| {
        b.iter(|| {
            let config = CircleConfig {
                checkpoint_dir: dir.path().to_path_buf(),
                seed: Some(7),
                ..CircleConfig::with_ranks(4)
            };
            let processed = Arc::new(AtomicU64::new(0));

            let mut circle = Circle::new(config).unwrap();
            circle.on_create(|h: &mut dyn Handle| {
                for i in 0..1000 {
                    h.enqueue_str(&i.to_string());
                }
            });
            let counter = Arc::clone(&processed);
            circle.on_process(move |h: &mut dyn Handle| {
                if h.dequeue().is_some() {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            });

            let report = circle.run().unwrap();
            black_box(report);
            assert_eq!(processed.load(Ordering::Relaxed), 1000);
        })
    });
}

criterion_group!(benches, benchmark_queue_operations, benchmark_small_run);
criterion_main!(benches);
