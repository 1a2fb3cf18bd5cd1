//! Thread-caching page allocator with a tcmalloc-style tiered front end:
//! per-thread free lists backed by a transfer cache, a central cache per
//! size class, and a page cache that talks to the OS directly.
//!
//! ```no_run
//! let alloc = zmalloc::Allocator::new();
//! let ptr = alloc.allocate(48).expect("allocation failed");
//! unsafe { alloc.deallocate(ptr, 48) };
//! ```

mod central_cache;
mod error;
mod free_list;
mod object_pool;
mod page_cache;
mod page_map;
mod prefetch;
mod size_class;
mod span;
mod span_list;
mod system_alloc;
mod thread_cache;
mod transfer_cache;

pub use error::ConfigError;
pub use page_cache::PageCache;
pub use size_class::{SizeClasses, MAX_SMALL_SIZE, PAGE_SIZE};

use central_cache::CentralCache;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;
use thread_cache::ThreadCache;
use transfer_cache::TransferCache;

/// The allocator's public entry point. Internally this fans out to a
/// thread-local [`ThreadCache`] per calling thread, all sharing the same
/// central cache, transfer cache, and page cache.
///
/// A process is expected to hold exactly one live `Allocator`; thread-local
/// state is keyed on the instance's address, so using more than one
/// concurrently on the same thread works but defeats the point of caching.
pub struct Allocator {
    classes: Arc<SizeClasses>,
    page_cache: Arc<PageCache>,
    central: Arc<CentralCache>,
    transfer: Arc<TransferCache>,
}

thread_local! {
    static LOCAL_CACHES: RefCell<Vec<(usize, ThreadCache)>> = const { RefCell::new(Vec::new()) };
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    #[must_use]
    pub fn new() -> Self {
        let classes = Arc::new(SizeClasses::new());
        let page_cache = Arc::new(PageCache::new());
        let central = Arc::new(CentralCache::new(page_cache.clone(), classes.clone()));
        let transfer = Arc::new(TransferCache::new(classes.num_classes()));
        Self {
            classes,
            page_cache,
            central,
            transfer,
        }
    }

    fn key(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn with_thread_cache<R>(&self, f: impl FnOnce(&ThreadCache) -> R) -> R {
        let key = self.key();
        LOCAL_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            if let Some(pos) = caches.iter().position(|(k, _)| *k == key) {
                return f(&caches[pos].1);
            }
            let tc = ThreadCache::new(self.classes.clone(), self.central.clone(), self.transfer.clone());
            caches.push((key, tc));
            f(&caches.last().unwrap().1)
        })
    }

    /// Allocates at least `size` bytes, returning `None` on OS allocation
    /// failure. Small requests (`<= MAX_SMALL_SIZE`) come from the size
    /// class machinery; larger requests map a raw span directly.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return self.allocate(1);
        }
        match self.classes.class_for(size) {
            Some(class) => self.with_thread_cache(|tc| tc.allocate(class)),
            None => {
                let pages = size.div_ceil(PAGE_SIZE).max(1);
                let idx = self.page_cache.new_span(pages)?;
                let addr = self
                    .page_cache
                    .with_span(idx, |span| span.start_page * PAGE_SIZE);
                NonNull::new(addr as *mut u8)
            }
        }
    }

    /// Allocates memory already zeroed.
    #[must_use]
    pub fn allocate_zero(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, self.allocated_size(ptr, size)) };
        Some(ptr)
    }

    /// Allocates memory whose address is a multiple of `align`. `align` must
    /// be a power of two; the largest alignment any size class guarantees
    /// is used as a fast path, with a raw span fallback for stricter asks.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<Option<NonNull<u8>>, ConfigError> {
        if !align.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(align));
        }
        if align <= PAGE_SIZE {
            if let Some(class) = self.classes.class_for(size) {
                let class_align = {
                    // size classes below 8 KiB align to at least 8 bytes and
                    // grow their alignment with size (size_class.rs); any
                    // request within the class's own alignment is already
                    // satisfied by a normal allocation.
                    self.classes.class_info(class).size.trailing_zeros()
                };
                if (1usize << class_align) >= align {
                    return Ok(self.allocate(size));
                }
            }
        }
        let pages = size.div_ceil(PAGE_SIZE).max(align.div_ceil(PAGE_SIZE)).max(1);
        let idx = self.page_cache.new_span(pages);
        Ok(idx.and_then(|idx| {
            let addr = self
                .page_cache
                .with_span(idx, |span| span.start_page * PAGE_SIZE);
            NonNull::new(addr as *mut u8)
        }))
    }

    /// Frees memory previously returned by [`Self::allocate`] (or a sibling
    /// method). `size` must be the same size originally requested.
    ///
    /// # Safety
    /// `ptr` must not be used again after this call, and must have been
    /// obtained from this same `Allocator`.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        match self.classes.class_for(size) {
            Some(class) => self.with_thread_cache(|tc| tc.deallocate(class, ptr)),
            None => {
                let page = ptr.as_ptr() as usize / PAGE_SIZE;
                if let Some(idx) = self.page_cache.span_for_page(page) {
                    self.page_cache.release_span(idx);
                }
            }
        }
    }

    /// Grows or shrinks an existing allocation, copying live data over.
    /// Returns `None` (leaving the original allocation untouched) on
    /// failure.
    ///
    /// # Safety
    /// `ptr` must have been obtained from this `Allocator` with `old_size`.
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            unsafe { self.deallocate(ptr, old_size) };
            return None;
        }
        let new_ptr = self.allocate(new_size)?;
        let copy_len = old_size.min(new_size);
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
            self.deallocate(ptr, old_size);
        }
        Some(new_ptr)
    }

    /// Returns the actual usable size of an allocation made for `requested`
    /// bytes (i.e. the backing size class's size, or the page-rounded size
    /// for a large allocation).
    #[must_use]
    pub fn allocated_size(&self, _ptr: NonNull<u8>, requested: usize) -> usize {
        match self.classes.class_for(requested) {
            Some(class) => self.classes.class_info(class).size,
            None => requested.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE,
        }
    }
}

unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_deallocate_small_object() {
        let alloc = Allocator::new();
        let ptr = alloc.allocate(32).unwrap();
        unsafe { alloc.deallocate(ptr, 32) };
    }

    #[test]
    fn allocate_large_object_bypasses_size_classes() {
        let alloc = Allocator::new();
        let ptr = alloc.allocate(MAX_SMALL_SIZE + 1).unwrap();
        unsafe { alloc.deallocate(ptr, MAX_SMALL_SIZE + 1) };
    }

    #[test]
    fn allocate_zero_returns_zeroed_memory() {
        let alloc = Allocator::new();
        let ptr = alloc.allocate_zero(64).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(slice.iter().all(|&b| b == 0));
        unsafe { alloc.deallocate(ptr, 64) };
    }

    #[test]
    fn reallocate_preserves_leading_bytes() {
        let alloc = Allocator::new();
        let ptr = alloc.allocate(16).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0xCD, 16);
            let grown = alloc.reallocate(ptr, 16, 512).unwrap();
            let slice = std::slice::from_raw_parts(grown.as_ptr(), 16);
            assert!(slice.iter().all(|&b| b == 0xCD));
            alloc.deallocate(grown, 512);
        }
    }

    #[test]
    fn zero_size_allocation_still_returns_usable_pointer() {
        let alloc = Allocator::new();
        let ptr = alloc.allocate(0).unwrap();
        unsafe { alloc.deallocate(ptr, 1) };
    }

    #[test]
    fn invalid_alignment_request_is_rejected() {
        let alloc = Allocator::new();
        assert!(alloc.allocate_aligned(64, 3).is_err());
    }

    #[test]
    fn concurrent_allocation_across_threads_stays_consistent() {
        let alloc = Arc::new(Allocator::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let alloc = alloc.clone();
                s.spawn(move || {
                    let mut ptrs = Vec::new();
                    for _ in 0..200 {
                        ptrs.push(alloc.allocate(48).unwrap());
                    }
                    for p in ptrs {
                        unsafe { alloc.deallocate(p, 48) };
                    }
                });
            }
        });
    }
}
