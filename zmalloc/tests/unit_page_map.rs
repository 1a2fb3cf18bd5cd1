//! The radix page map is crate-private; these tests exercise the span
//! bookkeeping it backs through `zmalloc`'s public large-allocation path,
//! which is the only externally observable surface that depends on it.

use zmalloc::{Allocator, MAX_SMALL_SIZE, PAGE_SIZE};

#[test]
fn large_allocations_do_not_overlap() {
    let alloc = Allocator::new();
    let size = MAX_SMALL_SIZE + PAGE_SIZE;
    let a = alloc.allocate(size).unwrap();
    let b = alloc.allocate(size).unwrap();
    let a_range = a.as_ptr() as usize..(a.as_ptr() as usize + size);
    let b_start = b.as_ptr() as usize;
    assert!(!a_range.contains(&b_start));
    unsafe {
        alloc.deallocate(a, size);
        alloc.deallocate(b, size);
    }
}

#[test]
fn freed_large_span_is_reusable_by_a_later_request_of_the_same_size() {
    let alloc = Allocator::new();
    let size = MAX_SMALL_SIZE + PAGE_SIZE;
    let a = alloc.allocate(size).unwrap();
    let addr = a.as_ptr() as usize;
    unsafe { alloc.deallocate(a, size) };
    let b = alloc.allocate(size).unwrap();
    assert_eq!(b.as_ptr() as usize, addr);
    unsafe { alloc.deallocate(b, size) };
}
