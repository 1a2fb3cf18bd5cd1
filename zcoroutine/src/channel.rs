//! Channel: the scheduler-facing slice of fd-based I/O readiness (spec.md
//! §3 "Channel (I/O record)", §6).
//!
//! The hook layer that actually redirects blocking syscalls onto this is
//! out of scope (spec.md §1); `Channel` only models what it needs to wake
//! fibers back up. A per-process [`ChannelRegistry`] keyed by fd is the
//! supplemented piece (SPEC_FULL §10.5), grounded on nothing more exotic
//! than a `Mutex<HashMap<..>>`, matching how the teacher keys its I/O
//! readiness state off raw fds in its own hook layer.

use crate::fiber::FiberRef;
use crate::scheduler::Scheduler;
use crate::task::Task;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// What's attached to one direction (read or write) of a channel. The sum
/// type makes "both a callback and a fiber are registered" unrepresentable,
/// per the design note in spec.md §9.
enum EventSlot {
    None,
    Callback(Box<dyn FnOnce() + Send + 'static>),
    Fiber(FiberRef),
}

impl EventSlot {
    fn take(&mut self) -> Self {
        std::mem::replace(self, Self::None)
    }
}

struct Inner {
    interest: Interest,
    read: EventSlot,
    write: EventSlot,
}

/// Per-fd I/O readiness record.
pub struct Channel {
    scheduler: Weak<Scheduler>,
    inner: Mutex<Inner>,
}

impl Channel {
    #[must_use]
    pub fn new(scheduler: &Arc<Scheduler>) -> Self {
        Self {
            scheduler: Arc::downgrade(scheduler),
            inner: Mutex::new(Inner {
                interest: Interest::empty(),
                read: EventSlot::None,
                write: EventSlot::None,
            }),
        }
    }

    /// Registers a fiber to be woken (or a callback to be invoked) the next
    /// time `interest` fires.
    pub fn add_event_fiber(&self, interest: Interest, fiber: FiberRef) {
        let mut inner = self.inner.lock().unwrap();
        inner.interest |= interest;
        if interest.contains(Interest::READ) {
            inner.read = EventSlot::Fiber(fiber.clone());
        }
        if interest.contains(Interest::WRITE) {
            inner.write = EventSlot::Fiber(fiber);
        }
    }

    /// Registers a callback for exactly one direction. Callers wanting
    /// independent read and write callbacks make two calls.
    ///
    /// # Panics
    /// Panics if `interest` names both directions at once.
    pub fn add_event_callback(&self, interest: Interest, callback: impl FnOnce() + Send + 'static) {
        assert_ne!(interest, Interest::READ | Interest::WRITE, "add_event_callback takes one direction at a time");
        let mut inner = self.inner.lock().unwrap();
        inner.interest |= interest;
        if interest.contains(Interest::READ) {
            inner.read = EventSlot::Callback(Box::new(callback));
        } else if interest.contains(Interest::WRITE) {
            inner.write = EventSlot::Callback(Box::new(callback));
        }
    }

    /// Removes interest without waking anything.
    pub fn del_event(&self, interest: Interest) {
        let mut inner = self.inner.lock().unwrap();
        inner.interest.remove(interest);
        if interest.contains(Interest::READ) {
            inner.read = EventSlot::None;
        }
        if interest.contains(Interest::WRITE) {
            inner.write = EventSlot::None;
        }
    }

    /// Fires `interest`: atomically pops whatever was waiting on it and
    /// either reschedules the fiber (or invokes the callback) on the
    /// current scheduler, or runs the callback inline / marks the fiber
    /// Ready-but-unscheduled if the scheduler is gone.
    pub fn trigger_event(&self, interest: Interest) {
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            inner.interest.remove(interest);
            if interest.contains(Interest::READ) {
                inner.read.take()
            } else {
                inner.write.take()
            }
        };
        self.dispatch(slot);
    }

    /// Cancels one direction's waiter: moves an attached fiber back to
    /// `Ready` and reschedules it (or invokes its callback), same as a
    /// trigger — the contract is "wakeup without success."
    pub fn cancel_event(&self, interest: Interest) {
        self.trigger_event(interest);
    }

    /// Cancels both directions.
    pub fn cancel_all(&self) {
        self.cancel_event(Interest::READ);
        self.cancel_event(Interest::WRITE);
    }

    fn dispatch(&self, slot: EventSlot) {
        match slot {
            EventSlot::None => {}
            EventSlot::Callback(cb) => match self.scheduler.upgrade() {
                Some(scheduler) => scheduler.schedule(Task::callable(cb)),
                None => {
                    tracing::warn!("channel callback fired with no owning scheduler; running inline");
                    cb();
                }
            },
            EventSlot::Fiber(fiber) => {
                fiber.mark_ready_externally();
                match self.scheduler.upgrade() {
                    Some(scheduler) => scheduler.schedule(Task::fiber(fiber)),
                    None => {
                        tracing::warn!(
                            fiber = ?fiber.id(),
                            "channel event fired with no owning scheduler; fiber left ready but unscheduled"
                        );
                    }
                }
            }
        }
    }
}

/// Process-wide registry of channels keyed by raw fd (SPEC_FULL §10.5).
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<i32, Arc<Channel>>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&self, fd: i32, scheduler: &Arc<Scheduler>) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(fd)
            .or_insert_with(|| Arc::new(Channel::new(scheduler)))
            .clone()
    }

    pub fn remove(&self, fd: i32) -> Option<Arc<Channel>> {
        self.channels.lock().unwrap().remove(&fd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn trigger_with_no_waiter_is_a_no_op() {
        let scheduler = Scheduler::new(1, "test", false);
        let channel = Channel::new(&scheduler);
        channel.trigger_event(Interest::READ);
    }

    #[test]
    fn trigger_invokes_callback_inline_without_scheduler() {
        let scheduler = Scheduler::new(1, "test", false);
        let channel = Channel::new(&scheduler);
        drop(scheduler);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        channel.add_event_callback(Interest::READ, move || ran2.store(true, Ordering::SeqCst));
        channel.trigger_event(Interest::READ);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn registry_reuses_channel_for_same_fd() {
        let scheduler = Scheduler::new(1, "test", false);
        let registry = ChannelRegistry::new();
        let a = registry.get_or_insert(3, &scheduler);
        let b = registry.get_or_insert(3, &scheduler);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }
}
