//! Per-worker thread-local context (spec.md §3 "Thread-local context").
//!
//! Populated once at the top of [`crate::scheduler::worker_main`] and
//! cleared when the worker exits. Exposes the handful of thread-local
//! accessors the public API promises: `current_scheduler`, the currently
//! running fiber, and the worker id.

use crate::context::Suspend;
use crate::fiber::FiberRef;
use crate::scheduler::Scheduler;
use crate::stack::{SharedStackRegion, StackMode};
use std::cell::RefCell;
use std::sync::Arc;

pub(crate) struct ThreadCtx {
    pub scheduler: Arc<Scheduler>,
    pub worker_id: usize,
    pub stack_mode: StackMode,
    pub shared_stack: Option<Arc<SharedStackRegion>>,
    pub current_fiber: Option<FiberRef>,
    /// Raw pointer into the currently running fiber's stack, valid only
    /// while that fiber is actually executing on this thread.
    pub current_suspend: Option<*const Suspend>,
}

thread_local! {
    static CTX: RefCell<Option<ThreadCtx>> = const { RefCell::new(None) };
}

/// Installs this worker's thread-local context. Called once at the top of
/// the worker run loop.
pub(crate) fn install(
    scheduler: Arc<Scheduler>,
    worker_id: usize,
    stack_mode: StackMode,
    shared_stack: Option<Arc<SharedStackRegion>>,
) {
    CTX.with(|c| {
        let mut c = c.borrow_mut();
        assert!(c.is_none(), "thread-local scheduler context installed twice");
        *c = Some(ThreadCtx {
            scheduler,
            worker_id,
            stack_mode,
            shared_stack,
            current_fiber: None,
            current_suspend: None,
        });
    });
}

/// Clears this worker's thread-local context. Called when the worker run
/// loop exits.
pub(crate) fn clear() {
    CTX.with(|c| *c.borrow_mut() = None);
}

/// Returns the scheduler owning the currently running worker thread, or
/// `None` if this thread isn't one of its workers.
#[must_use]
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CTX.with(|c| c.borrow().as_ref().map(|c| c.scheduler.clone()))
}

/// Returns this worker's id, or `None` off-worker.
#[must_use]
pub fn current_worker_id() -> Option<usize> {
    CTX.with(|c| c.borrow().as_ref().map(|c| c.worker_id))
}

/// Returns the fiber currently running on this thread, if any.
#[must_use]
pub fn current_fiber() -> Option<FiberRef> {
    CTX.with(|c| c.borrow().as_ref().and_then(|c| c.current_fiber.clone()))
}

pub(crate) fn stack_mode() -> Option<StackMode> {
    CTX.with(|c| c.borrow().as_ref().map(|c| c.stack_mode))
}

pub(crate) fn shared_stack() -> Option<Arc<SharedStackRegion>> {
    CTX.with(|c| c.borrow().as_ref().and_then(|c| c.shared_stack.clone()))
}

/// Runs `f` with `fiber` installed as the current fiber, restoring whatever
/// was installed before on return. Used by the scheduler loop around a
/// `resume()` call.
pub(crate) fn with_current_fiber<R>(fiber: FiberRef, f: impl FnOnce() -> R) -> R {
    let prev = CTX.with(|c| {
        let mut c = c.borrow_mut();
        let ctx = c.as_mut().expect("with_current_fiber off a worker thread");
        ctx.current_fiber.replace(fiber)
    });
    let result = f();
    CTX.with(|c| {
        let mut c = c.borrow_mut();
        let ctx = c.as_mut().expect("with_current_fiber off a worker thread");
        ctx.current_fiber = prev;
    });
    result
}

/// Installs `suspend` as the handle the running fiber body can call
/// `suspend()` on, for the duration of `f`.
pub(crate) fn with_current_suspend<R>(suspend: *const Suspend, f: impl FnOnce() -> R) -> R {
    let prev = CTX.with(|c| {
        let mut c = c.borrow_mut();
        let ctx = c.as_mut().expect("with_current_suspend off a worker thread");
        ctx.current_suspend.replace(suspend)
    });
    let result = f();
    CTX.with(|c| {
        let mut c = c.borrow_mut();
        let ctx = c.as_mut().expect("with_current_suspend off a worker thread");
        ctx.current_suspend = prev;
    });
    result
}

/// Returns the `Suspend` handle for the fiber currently executing on this
/// thread.
///
/// # Panics
/// Panics if called outside of a running fiber body — mirrors the spec's
/// "resume of a terminated fiber" logic-error class: calling `yield()`
/// outside a fiber is a programmer error, not a runtime condition to
/// recover from.
pub(crate) fn current_suspend() -> *const Suspend {
    CTX.with(|c| {
        c.borrow()
            .as_ref()
            .and_then(|c| c.current_suspend)
            .expect("yield() called outside of a running fiber")
    })
}
