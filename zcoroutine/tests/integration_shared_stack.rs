use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zcoroutine::{Fiber, FiberState, Scheduler, Task};

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

/// Exercises spec.md's shared-stack scenario: many fibers, each yielding
/// repeatedly, sharing one mapped region per worker. Each fiber carries a
/// distinctive local-variable pattern through every yield; if copy-in/out
/// ever corrupted another fiber's bytes, the checksum would drift.
#[test]
fn many_shared_stack_fibers_survive_repeated_yields() {
    let scheduler = Scheduler::new(4, "shared-stack-e2e", true);
    scheduler.start().unwrap();

    const FIBER_COUNT: usize = 200;
    const YIELDS_PER_FIBER: usize = 10;

    let completed = Arc::new(AtomicUsize::new(0));
    let corrupted = Arc::new(AtomicUsize::new(0));

    for seed in 0..FIBER_COUNT {
        let completed = Arc::clone(&completed);
        let corrupted = Arc::clone(&corrupted);
        let fiber = Fiber::new_shared(
            move || {
                // A stack-local byte pattern unique to this fiber.
                let mut locals = [0u8; 256];
                for (i, byte) in locals.iter_mut().enumerate() {
                    *byte = ((seed + i) % 256) as u8;
                }

                for _ in 0..YIELDS_PER_FIBER {
                    Fiber::yield_to_ready();
                    for (i, byte) in locals.iter().enumerate() {
                        if *byte != ((seed + i) % 256) as u8 {
                            corrupted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                completed.fetch_add(1, Ordering::SeqCst);
            },
            format!("shared-{seed}"),
        );
        scheduler.schedule(Task::fiber(fiber));
    }

    assert!(wait_until(
        || completed.load(Ordering::SeqCst) == FIBER_COUNT,
        Duration::from_secs(10)
    ));
    assert_eq!(corrupted.load(Ordering::SeqCst), 0);

    scheduler.stop();
}

#[test]
fn shared_stack_fiber_terminates_cleanly() {
    let scheduler = Scheduler::new(1, "shared-stack-terminate", true);
    scheduler.start().unwrap();

    let fiber = Fiber::new_shared(
        || {
            Fiber::yield_to_ready();
        },
        "terminator",
    );
    scheduler.schedule(Task::fiber(Arc::clone(&fiber)));

    assert!(wait_until(
        || fiber.state() == FiberState::Terminated,
        Duration::from_secs(2)
    ));

    scheduler.stop();
}
