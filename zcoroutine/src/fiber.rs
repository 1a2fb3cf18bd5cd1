//! Stackful fibers (spec.md §3, §4.4).

use crate::context::{self, Context, Suspend};
use crate::pool::FiberPool;
use crate::stack::{FiberStack, MmapStack, SharedStackRegion, StackMode, StackPointer};
use crate::task::Task;
use crate::tls;
use std::cell::UnsafeCell;
use std::panic::AssertUnwindSafe;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique fiber identity (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A fiber's lifecycle state (spec.md §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    Ready = 0,
    Running = 1,
    Suspended = 2,
    Terminated = 3,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Terminated,
            _ => unreachable!("invalid FiberState tag"),
        }
    }
}

/// Shared handle to a fiber. Fibers are reference-counted; the thread-local
/// "current fiber" slot (see [`crate::tls`]) counts as one reference, same
/// as an entry sitting in a deque.
pub type FiberRef = Arc<Fiber>;

/// The payload written directly onto a freshly initialized fiber stack: the
/// user's entry closure. Small enough (one fat pointer) to be moved onto the
/// stack without an extra heap indirection, the same trick the teacher's
/// `fiber` crate uses for its `InitialObject`.
struct EntryPayload {
    closure: Box<dyn FnOnce() + Send + 'static>,
}

enum Storage {
    /// The fiber owns its stack outright.
    Independent(MmapStack),
    /// The fiber runs on whichever worker's shared region is current when
    /// it is resumed. Once started, a shared-stack fiber is pinned to that
    /// worker (see `DESIGN.md`): its suspended state is only ever valid as
    /// an offset into *that* worker's mapping.
    Shared,
}

pub struct Fiber {
    id: FiberId,
    name: Box<str>,
    state: AtomicU8,
    storage: Storage,
    /// `None` until the fiber is first resumed.
    ctx: UnsafeCell<Option<Context>>,
    /// Pending entry payload, consumed the first time the fiber runs.
    pending: UnsafeCell<Option<EntryPayload>>,
    /// Shared-stack fibers: the bytes of their live stack region, saved out
    /// on every suspend and restored on every resume. Empty until the first
    /// suspend.
    spill: UnsafeCell<Vec<u8>>,
    /// Worker a shared-stack fiber became pinned to on its first resume.
    /// `usize::MAX` means unpinned.
    pinned_worker: AtomicUsize,
    /// Lets `&self` methods recover an owned [`FiberRef`] to hand to
    /// [`tls::with_current_fiber`] without requiring callers to route every
    /// call through an explicit `Arc<Fiber>` receiver.
    self_weak: Weak<Fiber>,
}

// Safety: a `Fiber` is only ever mutated (via its `UnsafeCell`s) by the one
// worker thread currently resuming it, enforced by the state machine: a
// second `resume()` on an already-`Running` fiber is a logic error we assert
// against, never a race we need the type system to prevent.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a new fiber with an independent, heap-backed stack.
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        name: impl Into<String>,
        pool: Option<&FiberPool>,
    ) -> std::io::Result<FiberRef> {
        let stack = pool
            .and_then(FiberPool::try_acquire)
            .map_or_else(|| MmapStack::new(stack_size), Ok)?;
        Ok(Arc::new_cyclic(|weak| Self {
            id: FiberId::next(),
            name: name.into().into_boxed_str(),
            state: AtomicU8::new(FiberState::Ready as u8),
            storage: Storage::Independent(stack),
            ctx: UnsafeCell::new(None),
            pending: UnsafeCell::new(Some(EntryPayload {
                closure: Box::new(entry),
            })),
            spill: UnsafeCell::new(Vec::new()),
            pinned_worker: AtomicUsize::new(usize::MAX),
            self_weak: weak.clone(),
        }))
    }

    /// Creates a new fiber that will run on its resuming worker's shared
    /// stack region (spec.md §3 "Shared stack").
    #[must_use]
    pub fn new_shared(entry: impl FnOnce() + Send + 'static, name: impl Into<String>) -> FiberRef {
        Arc::new_cyclic(|weak| Self {
            id: FiberId::next(),
            name: name.into().into_boxed_str(),
            state: AtomicU8::new(FiberState::Ready as u8),
            storage: Storage::Shared,
            ctx: UnsafeCell::new(None),
            pending: UnsafeCell::new(Some(EntryPayload {
                closure: Box::new(entry),
            })),
            spill: UnsafeCell::new(Vec::new()),
            pinned_worker: AtomicUsize::new(usize::MAX),
            self_weak: weak.clone(),
        })
    }

    #[must_use]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn uses_shared_stack(&self) -> bool {
        matches!(self.storage, Storage::Shared)
    }

    /// Resumes this fiber. Must be called from the scheduler fiber (or the
    /// main fiber at bootstrap), i.e. from the worker thread that currently
    /// owns it.
    ///
    /// # Panics
    /// Panics if the fiber has already terminated (spec.md §7: "resume of a
    /// terminated fiber" is a logic error, asserted rather than recovered
    /// from) or if called for a shared-stack fiber with no shared region
    /// installed on the current thread.
    pub fn resume(&self) {
        assert_ne!(
            self.state(),
            FiberState::Terminated,
            "attempted to resume terminated fiber {:?}",
            self.id
        );

        self.state.store(FiberState::Running as u8, Ordering::Release);

        // Safety: the caller (the scheduler loop) guarantees a fiber is
        // resumed by exactly one worker at a time; no other thread touches
        // `ctx`/`pending`/`spill` concurrently with this call.
        unsafe {
            match &self.storage {
                Storage::Independent(stack) => self.resume_independent(stack),
                Storage::Shared => self.resume_shared(),
            }
        }
    }

    unsafe fn resume_independent(&self, stack: &MmapStack) {
        unsafe {
            let ctx = &mut *self.ctx.get();
            if ctx.is_none() {
                *ctx = Some(self.init_context(stack));
            }
            let ctx = ctx.as_mut().unwrap();
            self.run_on(ctx);
        }
    }

    unsafe fn resume_shared(&self) {
        let region = tls::shared_stack().expect("shared-stack fiber resumed without a shared region installed; call Scheduler with use_shared_stack = true");
        let worker = tls::current_worker_id().expect("resume_shared off a worker thread");

        let prev_pin = self.pinned_worker.swap(worker, Ordering::AcqRel);
        assert!(
            prev_pin == usize::MAX || prev_pin == worker,
            "shared-stack fiber {:?} resumed on worker {worker} after being pinned to {prev_pin}",
            self.id
        );

        unsafe {
            let ctx = &mut *self.ctx.get();
            if ctx.is_none() {
                *ctx = Some(self.init_context(&*region));
            } else {
                // Copy this fiber's previously spilled stack contents back
                // onto the live shared region before switching in.
                let spill = &*self.spill.get();
                let top = region.top().get();
                let live_sp = top - spill.len();
                if !spill.is_empty() {
                    ptr::copy_nonoverlapping(spill.as_ptr(), live_sp as *mut u8, spill.len());
                }
                context::set_raw_sp(ctx.as_mut().unwrap(), live_sp);
            }
            let ctx = ctx.as_mut().unwrap();
            self.run_on(ctx);

            // Spill the live portion of the shared stack back out so the
            // region is free for the next fiber the worker resumes.
            if !ctx.done() {
                let sp = context::raw_sp(ctx).expect("suspended context must have a stack pointer");
                let top = region.top().get();
                let len = top - sp;
                let spill = &mut *self.spill.get();
                spill.resize(len, 0);
                ptr::copy_nonoverlapping(sp as *const u8, spill.as_mut_ptr(), len);
            }
        }
    }

    unsafe fn init_context(&self, stack: &dyn FiberStack) -> Context {
        unsafe extern "C" fn entry_trampoline(
            _arg: usize,
            parent_link: &mut StackPointer,
            obj: *mut EntryPayload,
        ) -> ! {
            unsafe {
                let suspend = Suspend::from_parent_link_ptr(ptr::from_mut(parent_link).cast());
                let payload = ptr::read(obj);

                tls::with_current_suspend(ptr::from_ref(suspend), || {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(payload.closure));
                    if let Err(panic) = result {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .copied()
                            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                            .unwrap_or("non-string panic payload");
                        tracing::error!(fiber = %msg, "fiber entry panicked; terminating fiber");
                    }
                });

                context::finish(context::encode(()), ptr::from_mut(parent_link))
            }
        }

        unsafe {
            let pending = (*self.pending.get())
                .take()
                .expect("fiber entry payload consumed twice");
            let (ctx, _obj_ptr) = Context::make(stack, entry_trampoline, pending);
            ctx
        }
    }

    unsafe fn run_on(&self, ctx: &mut Context) {
        let self_ref = self
            .self_weak
            .upgrade()
            .expect("fiber dropped while still running");
        unsafe {
            tls::with_current_fiber(self_ref, || {
                let _ = ctx.swap(context::encode(()));
            });
        }

        if ctx.done() {
            self.state.store(FiberState::Terminated as u8, Ordering::Release);
        }
        // Otherwise the fiber itself already stored Ready or Suspended
        // before switching away (see `yield_to_ready`/`yield_to_suspended`).
    }

    /// Cooperative yield for fairness: the fiber becomes `Ready` and some
    /// other scheduling decision (generally: re-enqueue) brings it back.
    ///
    /// # Panics
    /// Panics if called outside of a running fiber.
    pub fn yield_to_ready() {
        Self::do_yield(FiberState::Ready);
    }

    /// Yields while waiting on an external event (I/O, timer): the fiber
    /// becomes `Suspended` until a channel or timer wakes it.
    ///
    /// # Panics
    /// Panics if called outside of a running fiber.
    pub fn yield_to_suspended() {
        Self::do_yield(FiberState::Suspended);
    }

    fn do_yield(next: FiberState) {
        let fiber = tls::current_fiber().expect("yield called outside of a running fiber");
        fiber.state.store(next as u8, Ordering::Release);

        // A cooperative yield re-enqueues itself before handing control
        // back; the schedule loop's "Ready: already scheduled" branch
        // relies on this having happened (spec.md §4.3 step 6). A yield
        // to Suspended leaves re-scheduling to whatever external event
        // (a Channel trigger, a semaphore release) wakes it later.
        if next == FiberState::Ready {
            if let Some(scheduler) = tls::current_scheduler() {
                scheduler.schedule(Task::fiber(Arc::clone(&fiber)));
            }
        }

        let suspend = tls::current_suspend();
        // Safety: `current_suspend` is only populated while this thread is
        // actually executing the fiber body that owns it.
        unsafe {
            let _ = (*suspend).suspend(context::encode(()));
        }
    }

    /// Returns the fiber currently running on this thread, if any.
    #[must_use]
    pub fn current() -> Option<FiberRef> {
        tls::current_fiber()
    }

    /// Moves a `Suspended` fiber back to `Ready` from outside its own body —
    /// used by [`crate::channel::Channel`] when a waited-on event fires or
    /// is cancelled. The caller is responsible for then re-enqueuing the
    /// fiber onto a scheduler.
    pub(crate) fn mark_ready_externally(&self) {
        self.state.store(FiberState::Ready as u8, Ordering::Release);
    }

    /// Reclaims this fiber's stack into `pool`, if it owns an independent
    /// one. No-op for shared-stack fibers (nothing to reclaim) or fibers
    /// that have not terminated.
    ///
    /// # Panics
    /// Panics if called on a fiber that is not `Terminated`, or if more
    /// than one strong reference to the fiber remains (it must be the sole
    /// owner to reclaim the stack out of it).
    pub fn try_recycle(self: FiberRef, pool: &FiberPool) {
        assert_eq!(self.state(), FiberState::Terminated);
        match Arc::try_unwrap(self) {
            Ok(fiber) => {
                if let Storage::Independent(stack) = fiber.storage {
                    pool.try_return(stack);
                }
            }
            Err(_fiber) => {
                tracing::debug!("fiber still referenced elsewhere; stack not recycled");
            }
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field(
                "stack_mode",
                &if self.uses_shared_stack() {
                    StackMode::Shared
                } else {
                    StackMode::Independent
                },
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn independent_fiber_runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let fiber = Fiber::new(
            move || {
                ran2.store(true, Ordering::SeqCst);
            },
            64 * 1024,
            "test",
            None,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn fiber_can_yield_cooperatively_multiple_times() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let fiber = Fiber::new(
            move || {
                for _ in 0..5 {
                    count2.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_to_ready();
                }
            },
            64 * 1024,
            "yielder",
            None,
        )
        .unwrap();

        for expected in 1..=5 {
            assert_ne!(fiber.state(), FiberState::Terminated);
            fiber.resume();
            assert_eq!(count.load(Ordering::SeqCst), expected);
        }
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    #[should_panic(expected = "attempted to resume terminated fiber")]
    fn resuming_terminated_fiber_panics() {
        let fiber = Fiber::new(|| {}, 64 * 1024, "dead", None).unwrap();
        fiber.resume();
        fiber.resume();
    }

    #[test]
    fn panicking_fiber_terminates_instead_of_aborting() {
        let fiber = Fiber::new(
            || {
                panic!("boom");
            },
            64 * 1024,
            "panicker",
            None,
        )
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);
    }
}
