//! The scheduler: N worker threads, each running a schedule loop over its
//! own work-stealing deque, guided by the stealable bitmap (spec.md §4.3).

use crate::bitmap::StealableBitmap;
use crate::deque::{DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK};
use crate::error::StartError;
use crate::fiber::{Fiber, FiberRef, FiberState};
use crate::pool::FiberPool;
use crate::processor::Processor;
use crate::stack::{StackMode, DEFAULT_SHARED_STACK_SIZE};
use crate::task::Task;
use crate::tls;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Max tasks pulled per schedule-loop iteration (spec.md §4.3 step 2).
const BATCH_SIZE: usize = 8;
const BUSY_POLL_TIMEOUT: Duration = Duration::from_millis(1);
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Scheduler {
    name: String,
    thread_count: usize,
    stack_mode: StackMode,
    shared_stack_size: usize,
    processors: Vec<Processor>,
    bitmap: StealableBitmap,
    pending: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
    rr_counter: AtomicUsize,
    fiber_pool: FiberPool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(thread_count: usize, name: impl Into<String>, use_shared_stack: bool) -> Arc<Self> {
        let processors = (0..thread_count)
            .map(|id| Processor::new(id, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK))
            .collect();
        Arc::new(Self {
            name: name.into(),
            thread_count,
            stack_mode: if use_shared_stack {
                StackMode::Shared
            } else {
                StackMode::Independent
            },
            shared_stack_size: DEFAULT_SHARED_STACK_SIZE,
            processors,
            bitmap: StealableBitmap::new(thread_count),
            pending: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            rr_counter: AtomicUsize::new(0),
            fiber_pool: FiberPool::default(),
            handles: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stack_mode(&self) -> StackMode {
        self.stack_mode
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_task_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Launches `thread_count` workers. A barrier guarantees every worker
    /// has registered before this returns, so `schedule()` is immediately
    /// safe to call afterward.
    ///
    /// Zero worker threads is rejected with a warning, producing a no-op
    /// scheduler rather than a panic (spec.md §8).
    pub fn start(self: &Arc<Self>) -> Result<(), StartError> {
        if self.thread_count == 0 {
            tracing::warn!(scheduler = %self.name, "start() called with zero worker threads; no-op");
            return Err(StartError::ZeroWorkers);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StartError::AlreadyStarted);
        }

        let barrier = Arc::new(Barrier::new(self.thread_count + 1));
        let mut handles = Vec::with_capacity(self.thread_count);
        for worker_id in 0..self.thread_count {
            let scheduler = Arc::clone(self);
            let barrier = Arc::clone(&barrier);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{worker_id}", self.name))
                .spawn(move || worker_main(scheduler, worker_id, barrier))
                .map_err(StartError::Spawn)?;
            handles.push(handle);
        }
        barrier.wait();
        *self.handles.lock().unwrap() = handles;
        Ok(())
    }

    /// Schedules a fiber or callable. Thread-safe from any thread.
    ///
    /// Per the enqueue policy (spec.md §4.3): a call from one of this
    /// scheduler's own worker threads lands on that worker's local deque;
    /// any other caller is routed to a non-stealable worker (round-robin
    /// fallback if every worker is already over the high watermark).
    pub fn schedule(self: &Arc<Self>, task: Task) {
        if self.stopping.load(Ordering::Acquire) {
            tracing::warn!(scheduler = %self.name, "schedule() called after stop(); task dropped");
            return;
        }

        // pending is incremented before the push so a concurrent stop
        // observer can never see pending==0 while a task is in flight.
        self.pending.fetch_add(1, Ordering::AcqRel);

        let target = tls::current_scheduler()
            .filter(|s| Arc::ptr_eq(s, self))
            .and_then(|_| tls::current_worker_id())
            .unwrap_or_else(|| self.pick_external_target());

        let crossed_high = self.processors[target].deque().push(task);
        if crossed_high {
            self.bitmap.set(target);
        }
    }

    fn pick_external_target(&self) -> usize {
        let rr = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.thread_count;
        self.bitmap.find_non_stealable(rr).unwrap_or(rr)
    }

    /// Stops the scheduler: wakes every worker's waiting condvar, then
    /// blocks until all worker threads have joined. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for processor in &self.processors {
            processor.deque().stop();
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn processor(&self, worker_id: usize) -> &Processor {
        &self.processors[worker_id]
    }
}

fn worker_main(scheduler: Arc<Scheduler>, worker_id: usize, barrier: Arc<Barrier>) {
    let stack_mode = scheduler.stack_mode();
    let shared_stack = match stack_mode {
        StackMode::Shared => Some(Arc::new(
            crate::stack::SharedStackRegion::new(scheduler.shared_stack_size)
                .expect("failed to map per-worker shared stack"),
        )),
        StackMode::Independent => None,
    };

    tls::install(Arc::clone(&scheduler), worker_id, stack_mode, shared_stack);
    barrier.wait();

    // The scheduler fiber always uses an independent stack, even under
    // shared-stack mode: it performs fiber switches and cannot safely be
    // relocated beneath itself (spec.md §4.3 step 4).
    let sched_scheduler = Arc::clone(&scheduler);
    let scheduler_fiber = Fiber::new(
        move || schedule_loop(&sched_scheduler, worker_id),
        crate::stack::DEFAULT_STACK_SIZE,
        format!("{}-sched-{worker_id}", scheduler.name()),
        None,
    )
    .expect("failed to allocate scheduler fiber stack");

    scheduler_fiber.resume();
    debug_assert_eq!(scheduler_fiber.state(), FiberState::Terminated);

    tls::clear();
}

fn schedule_loop(scheduler: &Arc<Scheduler>, worker_id: usize) {
    let processor = scheduler.processor(worker_id);
    loop {
        if scheduler.stopping.load(Ordering::Acquire) && scheduler.pending_task_count() == 0 {
            return;
        }

        let (mut batch, should_clear) = processor.deque().pop_batch(BATCH_SIZE);
        if should_clear {
            scheduler.bitmap.clear(worker_id);
        }

        if batch.is_empty() && scheduler.thread_count > 1 {
            if let Some(victim) = scheduler.bitmap.find_victim(worker_id) {
                let victim_size = scheduler.processor(victim).deque().approx_size();
                if victim_size > 0 {
                    let want = victim_size.div_ceil(2);
                    let mut stolen = scheduler.processor(victim).deque().steal_batch(want);
                    if stolen.len() > BATCH_SIZE {
                        let overflow = stolen.split_off(BATCH_SIZE);
                        for task in overflow {
                            if processor.deque().push(task) {
                                scheduler.bitmap.set(worker_id);
                            }
                        }
                    }
                    batch = stolen;
                }
            }
        }

        if batch.is_empty() {
            let timeout = if scheduler.bitmap.any() {
                BUSY_POLL_TIMEOUT
            } else {
                IDLE_POLL_TIMEOUT
            };
            let (b, should_clear) = processor.deque().wait_pop_batch(BATCH_SIZE, timeout);
            if should_clear {
                scheduler.bitmap.clear(worker_id);
            }
            batch = b;
        }

        if batch.is_empty() {
            continue;
        }

        scheduler.pending.fetch_sub(batch.len(), Ordering::AcqRel);

        for task in batch {
            run_task(scheduler, task);
        }
    }
}

fn run_task(scheduler: &Arc<Scheduler>, task: Task) {
    match task {
        Task::Fiber(fiber) => run_fiber(scheduler, fiber),
        Task::Callable(callable) => {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(callable)) {
                log_task_panic(&panic);
            }
        }
    }
}

fn run_fiber(scheduler: &Arc<Scheduler>, fiber: FiberRef) {
    fiber.resume();
    match fiber.state() {
        FiberState::Terminated => fiber.try_recycle(&scheduler.fiber_pool),
        // Suspended: something else (a Channel trigger, a semaphore
        // release) will re-schedule it later.
        FiberState::Suspended => {}
        // Ready: the fiber already re-enqueued itself before yielding
        // (see Fiber::yield_to_ready).
        FiberState::Ready => {}
        FiberState::Running => unreachable!("fiber left Running after resume() returned"),
    }
}

fn log_task_panic(panic: &(dyn std::any::Any + Send)) {
    let msg = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    tracing::error!(task = %msg, "callable task panicked; swallowed");
}
