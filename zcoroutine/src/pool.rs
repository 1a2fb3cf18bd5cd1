//! Bounded per-process pool of independent fiber stacks.
//!
//! A terminated fiber's stack mapping is perfectly reusable — it just needs
//! its guard page and size to match what the next fiber wants. Pooling
//! avoids an mmap/munmap pair per fiber under steady-state churn. Mirrors
//! the teacher's own preference for CPU-local/bounded object caches ahead
//! of the OS (`kernel/src/mem/frame_alloc`'s `CpuLocalFrameCache`) — here
//! simplified to one global bound since fiber creation is comparatively
//! rare next to page allocation.

use crate::stack::{MmapStack, DEFAULT_STACK_SIZE};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default cap on the number of idle stacks kept around. Chosen generously
/// relative to typical worker counts; surplus returns are simply dropped
/// (unmapped), per spec.md's "oversize pools drop the surplus".
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct FiberPool {
    stacks: Mutex<VecDeque<MmapStack>>,
    capacity: usize,
    stack_size: usize,
}

impl FiberPool {
    #[must_use]
    pub fn new(capacity: usize, stack_size: usize) -> Self {
        Self {
            stacks: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            stack_size: stack_size.max(super::stack::MIN_STACK_SIZE),
        }
    }

    /// Attempts to pull a ready-to-use stack from the pool. Returns `None`
    /// if the pool is empty; the caller should mmap a fresh one.
    pub fn try_acquire(&self) -> Option<MmapStack> {
        self.stacks.lock().unwrap().pop_front()
    }

    /// Returns a terminated fiber's stack to the pool. Drops it (unmapping
    /// the memory) instead if the pool is already at capacity.
    pub fn try_return(&self, stack: MmapStack) {
        let mut stacks = self.stacks.lock().unwrap();
        if stacks.len() < self.capacity {
            stacks.push_back(stack);
        } else {
            tracing::debug!("fiber pool at capacity ({}), dropping stack", self.capacity);
            drop(stack);
        }
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FiberPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_STACK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_return_reuses_stack() {
        let pool = FiberPool::new(2, 64 * 1024);
        assert!(pool.try_acquire().is_none());
        let stack = MmapStack::new(64 * 1024).unwrap();
        pool.try_return(stack);
        assert_eq!(pool.len(), 1);
        assert!(pool.try_acquire().is_some());
        assert!(pool.is_empty());
    }

    #[test]
    fn surplus_beyond_capacity_is_dropped() {
        let pool = FiberPool::new(1, 64 * 1024);
        pool.try_return(MmapStack::new(64 * 1024).unwrap());
        pool.try_return(MmapStack::new(64 * 1024).unwrap());
        assert_eq!(pool.len(), 1);
    }
}
