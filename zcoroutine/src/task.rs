//! Scheduler work items (spec.md §3 "Task").

use crate::fiber::FiberRef;

/// A unit of schedulable work: either a fiber to resume or a bare callable
/// to invoke directly on the worker thread. Moved through deques by value,
/// never copied.
pub enum Task {
    Fiber(FiberRef),
    Callable(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    #[must_use]
    pub fn fiber(fiber: FiberRef) -> Self {
        Self::Fiber(fiber)
    }

    #[must_use]
    pub fn callable(f: impl FnOnce() + Send + 'static) -> Self {
        Self::Callable(Box::new(f))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Self::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}
