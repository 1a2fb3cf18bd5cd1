//! Fiber-aware synchronization primitives (SPEC_FULL §10.5, grounded on the
//! original implementation's `zcoroutine_semaphore.h`).
//!
//! A `FiberSemaphore` blocks the *fiber*, not the OS thread: when a permit
//! isn't available, the calling fiber parks itself on an internal wait
//! queue and yields to `Suspended`; `release` pops a waiter and reschedules
//! it, mirroring how [`crate::channel::Channel`] wakes fibers on I/O
//! readiness.

use crate::fiber::{Fiber, FiberRef};
use crate::scheduler::Scheduler;
use crate::task::Task;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub struct FiberSemaphore {
    scheduler: Weak<Scheduler>,
    permits: AtomicIsize,
    waiters: Mutex<VecDeque<FiberRef>>,
}

impl FiberSemaphore {
    #[must_use]
    pub fn new(scheduler: &Arc<Scheduler>, initial_permits: usize) -> Self {
        Self {
            scheduler: Arc::downgrade(scheduler),
            permits: AtomicIsize::new(initial_permits as isize),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquires a permit, parking the calling fiber if none is immediately
    /// available.
    ///
    /// # Panics
    /// Panics if called outside of a running fiber.
    pub fn acquire(&self) {
        loop {
            let prev = self.permits.fetch_sub(1, Ordering::AcqRel);
            if prev > 0 {
                return;
            }
            // Oversubscribed; undo and park.
            self.permits.fetch_add(1, Ordering::AcqRel);
            let fiber = Fiber::current().expect("FiberSemaphore::acquire called outside a fiber");
            self.waiters.lock().unwrap().push_back(fiber);
            Fiber::yield_to_suspended();
        }
    }

    /// Non-blocking acquire: returns `true` if a permit was available.
    pub fn try_acquire(&self) -> bool {
        let prev = self.permits.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            true
        } else {
            self.permits.fetch_add(1, Ordering::AcqRel);
            false
        }
    }

    /// Releases one permit, waking the longest-waiting fiber if any.
    pub fn release(&self) {
        let waiter = self.waiters.lock().unwrap().pop_front();
        match waiter {
            Some(fiber) => {
                fiber.mark_ready_externally();
                if let Some(scheduler) = self.scheduler.upgrade() {
                    scheduler.schedule(Task::fiber(fiber));
                } else {
                    tracing::warn!(
                        fiber = ?fiber.id(),
                        "semaphore released a waiter with no owning scheduler; left ready but unscheduled"
                    );
                }
            }
            None => {
                self.permits.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    #[must_use]
    pub fn available_permits(&self) -> isize {
        self.permits.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn try_acquire_respects_permit_count() {
        let scheduler = Scheduler::new(1, "test", false);
        let sem = FiberSemaphore::new(&scheduler, 1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn release_without_waiters_restores_a_permit() {
        let scheduler = Scheduler::new(1, "test", false);
        let sem = FiberSemaphore::new(&scheduler, 0);
        sem.release();
        assert_eq!(sem.available_permits(), 1);
    }
}
