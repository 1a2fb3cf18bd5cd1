//! Transfer cache: a fixed-size ring buffer per size class sitting between
//! thread caches and the central cache (spec.md §4.7). Its purpose is to
//! let thread caches batch-refill and batch-flush without touching the
//! central cache's span bookkeeping on the common path.

use crossbeam_utils::CachePadded;
use spin::Mutex as Spinlock;
use std::ptr::NonNull;

const RING_SLOTS: usize = 2048;

struct Ring {
    buffer: Box<[Option<NonNull<u8>>; RING_SLOTS]>,
    head: usize,
    len: usize,
}

// Safety: only ever touched with the owning Spinlock held.
unsafe impl Send for Ring {}

pub struct TransferCache {
    rings: Vec<CachePadded<Spinlock<Ring>>>,
}

impl TransferCache {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        let mut rings = Vec::with_capacity(num_classes);
        rings.resize_with(num_classes, || {
            CachePadded::new(Spinlock::new(Ring {
                buffer: Box::new([None; RING_SLOTS]),
                head: 0,
                len: 0,
            }))
        });
        Self { rings }
    }

    /// Attempts to insert a chain of `n` objects. Fails (returning the chain
    /// back to the caller untouched) if fewer than `n` slots are free.
    pub fn try_insert_range(
        &self,
        class: usize,
        head: NonNull<u8>,
        n: usize,
    ) -> Result<(), NonNull<u8>> {
        let mut ring = self.rings[class].lock();
        if ring.len + n > RING_SLOTS {
            return Err(head);
        }
        let mut cur = Some(head);
        let mut write_idx = (ring.head + ring.len) % RING_SLOTS;
        for _ in 0..n {
            let ptr = cur.expect("chain shorter than claimed length");
            let next = unsafe { ptr.cast::<Option<NonNull<u8>>>().read() };
            ring.buffer[write_idx] = Some(ptr);
            write_idx = (write_idx + 1) % RING_SLOTS;
            cur = next;
        }
        ring.len += n;
        Ok(())
    }

    /// Attempts to remove a chain of exactly `n` objects, linking them back
    /// into a singly linked chain in FIFO order (the objects inserted
    /// longest ago drain first).
    #[must_use]
    pub fn try_remove_range(&self, class: usize, n: usize) -> Option<(NonNull<u8>, NonNull<u8>)> {
        let mut ring = self.rings[class].lock();
        if ring.len < n {
            return None;
        }
        let mut head: Option<NonNull<u8>> = None;
        let mut tail: Option<NonNull<u8>> = None;
        for _ in 0..n {
            let ptr = ring.buffer[ring.head].take().expect("ring slot should be occupied");
            ring.head = (ring.head + 1) % RING_SLOTS;
            ring.len -= 1;
            unsafe {
                ptr.cast::<Option<NonNull<u8>>>().write(None);
            }
            match tail {
                Some(prev_tail) => unsafe {
                    prev_tail.cast::<Option<NonNull<u8>>>().write(Some(ptr));
                },
                None => head = Some(ptr),
            }
            tail = Some(ptr);
        }
        Some((head?, tail?))
    }

    #[must_use]
    pub fn len(&self, class: usize) -> usize {
        self.rings[class].lock().len
    }

    #[must_use]
    pub fn is_empty(&self, class: usize) -> bool {
        self.len(class) == 0
    }
}

unsafe impl Sync for TransferCache {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};

    fn alloc_objs(n: usize) -> Vec<NonNull<u8>> {
        (0..n)
            .map(|_| NonNull::new(unsafe { alloc(Layout::new::<usize>()) }).unwrap())
            .collect()
    }

    fn free_objs(objs: &[NonNull<u8>]) {
        for &o in objs {
            unsafe { dealloc(o.as_ptr(), Layout::new::<usize>()) };
        }
    }

    fn link(objs: &[NonNull<u8>]) -> NonNull<u8> {
        for w in objs.windows(2) {
            unsafe {
                w[0].cast::<Option<NonNull<u8>>>().write(Some(w[1]));
            }
        }
        unsafe {
            objs.last().unwrap().cast::<Option<NonNull<u8>>>().write(None);
        }
        objs[0]
    }

    #[test]
    fn insert_then_remove_roundtrips_all_objects() {
        let tc = TransferCache::new(1);
        let objs = alloc_objs(10);
        let head = link(&objs);
        tc.try_insert_range(0, head, 10).unwrap();
        assert_eq!(tc.len(0), 10);
        let (head, _tail) = tc.try_remove_range(0, 10).unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut cur = Some(head);
        while let Some(ptr) = cur {
            seen.insert(ptr.as_ptr() as usize);
            cur = unsafe { ptr.cast::<Option<NonNull<u8>>>().read() };
        }
        assert_eq!(seen.len(), 10);
        assert!(tc.is_empty(0));
        free_objs(&objs);
    }

    #[test]
    fn insert_beyond_capacity_fails_without_partial_insert() {
        let tc = TransferCache::new(1);
        let objs = alloc_objs(4);
        let head = link(&objs);
        assert!(tc.try_insert_range(0, head, RING_SLOTS + 1).is_err());
        assert_eq!(tc.len(0), 0);
        free_objs(&objs);
    }

    #[test]
    fn remove_more_than_available_returns_none() {
        let tc = TransferCache::new(1);
        assert!(tc.try_remove_range(0, 1).is_none());
    }

    #[test]
    fn remove_drains_in_fifo_order() {
        let tc = TransferCache::new(1);
        let objs = alloc_objs(4);
        for &o in &objs {
            tc.try_insert_range(0, o, 1).unwrap();
        }
        let (head, tail) = tc.try_remove_range(0, 4).unwrap();
        assert_eq!(head, objs[0]);
        assert_eq!(tail, objs[3]);
        let mut order = Vec::new();
        let mut cur = Some(head);
        while let Some(ptr) = cur {
            order.push(ptr);
            cur = unsafe { ptr.cast::<Option<NonNull<u8>>>().read() };
        }
        assert_eq!(order, objs);
        free_objs(&objs);
    }
}
