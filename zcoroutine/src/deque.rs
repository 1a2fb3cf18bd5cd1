//! Bounded work-stealing deque (spec.md §4.1).
//!
//! Owner pushes/pops LIFO from one end, non-blocking; thieves steal FIFO
//! from the other end under a short lock; the owner's idle loop can block
//! on a condvar via `wait_pop_batch`. Backed by a fixed power-of-two ring
//! rather than the teacher's lock-free `crossbeam_deque::Worker` CAS loop —
//! spec.md asks for a mutex+condvar blocking consumer, which a pure
//! lock-free deque can't expose directly.

use crate::task::Task;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bit set in the global stealable bitmap once a deque's size reaches this.
pub const DEFAULT_HIGH_WATERMARK: usize = 256;
/// Bit cleared once a deque's size falls to this.
pub const DEFAULT_LOW_WATERMARK: usize = 64;

struct Inner {
    ring: VecDeque<Task>,
    stopped: bool,
}

/// One worker's owned queue of runnable tasks.
pub struct Deque {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    approx_size: AtomicUsize,
    high: usize,
    low: usize,
}

impl Deque {
    #[must_use]
    pub fn new(high: usize, low: usize) -> Self {
        assert!(low < high, "deque watermarks must satisfy low < high");
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            approx_size: AtomicUsize::new(0),
            high,
            low,
        }
    }

    /// Owner-only. Appends `task` to the LIFO end. Returns whether the
    /// caller should set this worker's bit in the stealable bitmap (size
    /// just crossed the high watermark).
    pub fn push(&self, task: Task) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.ring.push_back(task);
        let size = inner.ring.len();
        self.approx_size.store(size, Ordering::Relaxed);
        drop(inner);
        self.not_empty.notify_one();
        size >= self.high
    }

    /// Owner-only, non-blocking. Pops up to `n` tasks LIFO. Returns the
    /// tasks and whether the caller should clear this worker's stealable
    /// bit (size just fell to or below the low watermark).
    pub fn pop_batch(&self, n: usize) -> (Vec<Task>, bool) {
        let mut inner = self.inner.lock().unwrap();
        let k = n.min(inner.ring.len());
        let mut out = Vec::with_capacity(k);
        for _ in 0..k {
            out.push(inner.ring.pop_back().unwrap());
        }
        let size = inner.ring.len();
        self.approx_size.store(size, Ordering::Relaxed);
        (out, size <= self.low)
    }

    /// Thief, non-blocking. Removes up to `n` tasks from the FIFO end. May
    /// observe transient emptiness and return an empty vec.
    pub fn steal_batch(&self, n: usize) -> Vec<Task> {
        let Ok(mut inner) = self.inner.try_lock() else {
            return Vec::new();
        };
        let k = n.min(inner.ring.len());
        let mut out = Vec::with_capacity(k);
        for _ in 0..k {
            out.push(inner.ring.pop_front().unwrap());
        }
        self.approx_size.store(inner.ring.len(), Ordering::Relaxed);
        out
    }

    /// Owner-only. Blocks up to `timeout` for tasks to appear, then pops up
    /// to `n` LIFO. Returns 0 tasks on timeout or on `stop()` with an empty
    /// queue; never signals a hard error.
    pub fn wait_pop_batch(&self, n: usize, timeout: Duration) -> (Vec<Task>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.ring.is_empty() && !inner.stopped {
            let (guard, _timed_out) = self
                .not_empty
                .wait_timeout_while(inner, timeout, |i| i.ring.is_empty() && !i.stopped)
                .unwrap();
            inner = guard;
        }
        let k = n.min(inner.ring.len());
        let mut out = Vec::with_capacity(k);
        for _ in 0..k {
            out.push(inner.ring.pop_back().unwrap());
        }
        let size = inner.ring.len();
        self.approx_size.store(size, Ordering::Relaxed);
        (out, size <= self.low)
    }

    /// Marks the queue stopped and wakes every waiter. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Relaxed approximate size; may be stale, never negative.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn high_watermark(&self) -> usize {
        self.high
    }

    #[must_use]
    pub fn low_watermark(&self) -> usize {
        self.low
    }
}

impl Default for Deque {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
    }
}
