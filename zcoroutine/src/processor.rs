//! A worker's identity plus its owned deque (spec.md §3 "Processor").
//!
//! Deliberately thin: no cross-processor references live here. The
//! scheduler owns every `Processor`; a worker thread only ever touches the
//! one it was given at startup.

use crate::deque::Deque;

pub struct Processor {
    worker_id: usize,
    deque: Deque,
}

impl Processor {
    #[must_use]
    pub fn new(worker_id: usize, high: usize, low: usize) -> Self {
        Self {
            worker_id,
            deque: Deque::new(high, low),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[must_use]
    pub fn deque(&self) -> &Deque {
        &self.deque
    }
}
