//! Thread-local front end (spec.md §4.8). Each thread owns one of these;
//! the hot allocate/deallocate path never touches a lock unless the local
//! free list runs dry or overflows.

use crate::central_cache::CentralCache;
use crate::free_list::FreeList;
use crate::size_class::SizeClasses;
use crate::transfer_cache::TransferCache;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

/// Initial per-class cap before slow start ramps it up.
const INITIAL_MAX_SIZE: usize = 32;
/// Ceiling slow start grows toward for small classes.
const MAX_MAX_SIZE: usize = 256;
const GROWTH_STEP: usize = 1;

struct ClassCache {
    list: FreeList,
}

pub struct ThreadCache {
    classes: Arc<SizeClasses>,
    central: Arc<CentralCache>,
    transfer: Arc<TransferCache>,
    caches: RefCell<Vec<ClassCache>>,
}

impl ThreadCache {
    #[must_use]
    pub fn new(classes: Arc<SizeClasses>, central: Arc<CentralCache>, transfer: Arc<TransferCache>) -> Self {
        let n = classes.num_classes();
        let mut caches = Vec::with_capacity(n);
        caches.resize_with(n, || ClassCache {
            list: FreeList::new(INITIAL_MAX_SIZE),
        });
        Self {
            classes,
            central,
            transfer,
            caches: RefCell::new(caches),
        }
    }

    /// Allocates an object for `class`, refilling from the transfer or
    /// central cache if the local list is empty.
    pub fn allocate(&self, class: usize) -> Option<NonNull<u8>> {
        let mut caches = self.caches.borrow_mut();
        let cache = &mut caches[class];
        if let Some(ptr) = cache.list.pop() {
            return Some(ptr);
        }
        drop(caches);
        self.refill(class);
        let mut caches = self.caches.borrow_mut();
        caches[class].list.pop()
    }

    /// Pulls up to `min(batch_size, max_size)` objects in from the transfer
    /// or central cache (spec.md §4.8 step 3a), growing the slow-start cap by
    /// one on a successful fetch.
    fn refill(&self, class: usize) {
        let batch = {
            let caches = self.caches.borrow();
            self.classes.class_info(class).batch_size.min(caches[class].list.max_size())
        };
        if let Some((head, tail)) = self.transfer.try_remove_range(class, batch) {
            let mut caches = self.caches.borrow_mut();
            unsafe { caches[class].list.push_chain(head, tail, batch) };
            self.grow_cap(&mut caches[class]);
            return;
        }
        if let Some((head, tail, n)) = self.central.fetch_range(class, batch) {
            let mut caches = self.caches.borrow_mut();
            unsafe { caches[class].list.push_chain(head, tail, n) };
            self.grow_cap(&mut caches[class]);
        }
    }

    fn grow_cap(&self, cache: &mut ClassCache) {
        if cache.list.max_size() < MAX_MAX_SIZE {
            let next = (cache.list.max_size() + GROWTH_STEP).min(MAX_MAX_SIZE);
            cache.list.set_max_size(next);
        }
    }

    /// Returns an object to `class`'s free list, flushing to the transfer or
    /// central cache if the local list has grown past its current cap.
    pub fn deallocate(&self, class: usize, ptr: NonNull<u8>) {
        {
            let mut caches = self.caches.borrow_mut();
            unsafe { caches[class].list.push(ptr) };
        }
        self.maybe_flush(class);
    }

    fn maybe_flush(&self, class: usize) {
        let batch = self.classes.class_info(class).batch_size;
        let mut caches = self.caches.borrow_mut();
        let cache = &mut caches[class];
        if cache.list.len() <= cache.list.max_size() {
            return;
        }
        let Some((head, tail, n)) = cache.list.pop_chain(batch.min(cache.list.len())) else {
            return;
        };
        drop(caches);
        if self.transfer.try_insert_range(class, head, n).is_err() {
            self.central.release_range(class, Some(head), n);
        }
        let _ = tail;
    }

    #[must_use]
    pub fn local_len(&self, class: usize) -> usize {
        self.caches.borrow()[class].list.len()
    }
}
