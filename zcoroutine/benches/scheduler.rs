use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zcoroutine::{Scheduler, Task};

fn schedule_noop_tasks(c: &mut Criterion) {
    let scheduler = Scheduler::new(4, "bench", false);
    scheduler.start().unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    c.bench_function("schedule_10000_noop_tasks", |b| {
        b.iter(|| {
            completed.store(0, Ordering::SeqCst);
            for _ in 0..10_000 {
                let completed = Arc::clone(&completed);
                scheduler.schedule(Task::callable(move || {
                    completed.fetch_add(1, Ordering::SeqCst);
                }));
            }
            while completed.load(Ordering::SeqCst) < 10_000 {
                std::hint::spin_loop();
            }
        });
    });

    scheduler.stop();
}

criterion_group!(benches, schedule_noop_tasks);
criterion_main!(benches);
