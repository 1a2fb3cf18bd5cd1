//! Stackful fiber runtime with a work-stealing M:N scheduler.
//!
//! Two cooperating pieces: [`Fiber`], a stackful coroutine with symmetric
//! resume/yield, and [`Scheduler`], which multiplexes fibers (and bare
//! callables) across a fixed pool of OS worker threads using per-worker
//! work-stealing deques guided by a global stealable bitmap.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use zcoroutine::Scheduler;
//!
//! let scheduler = Scheduler::new(4, "example", false);
//! scheduler.start().unwrap();
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let done2 = Arc::clone(&done);
//! scheduler.schedule(zcoroutine::Task::callable(move || {
//!     done2.store(true, Ordering::SeqCst);
//! }));
//!
//! scheduler.stop();
//! ```

mod arch;
pub mod bitmap;
pub mod channel;
pub mod context;
pub mod deque;
pub mod error;
pub mod fiber;
pub mod pool;
pub mod processor;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod task;
pub mod tls;

pub use channel::{Channel, ChannelRegistry, Interest};
pub use deque::Deque;
pub use error::{FiberError, ScheduleError, StartError};
pub use fiber::{Fiber, FiberId, FiberRef, FiberState};
pub use pool::FiberPool;
pub use scheduler::Scheduler;
pub use stack::{StackMode, DEFAULT_SHARED_STACK_SIZE, DEFAULT_STACK_SIZE};
pub use sync::FiberSemaphore;
pub use task::Task;
pub use tls::{current_fiber, current_scheduler, current_worker_id};
