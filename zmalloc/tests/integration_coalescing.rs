//! Allocate a wide spread of large spans, free them all out of order, and
//! confirm the page cache coalesces enough that a single allocation as big
//! as the whole freed region succeeds again.

use zmalloc::{Allocator, MAX_SMALL_SIZE, PAGE_SIZE};

#[test]
fn freeing_adjacent_large_spans_out_of_order_still_coalesces() {
    let alloc = Allocator::new();
    // Each chunk must clear MAX_SMALL_SIZE so it takes the raw-span path
    // rather than being carved up by a size class, and the combined total
    // must stay within the page cache's largest coalescable bucket.
    let chunk = 40 * PAGE_SIZE;
    let n = 3;

    let mut ptrs = Vec::new();
    for _ in 0..n {
        ptrs.push(alloc.allocate(chunk).unwrap());
    }

    // free in a shuffled order: odds first, then evens
    for i in (1..n).step_by(2) {
        unsafe { alloc.deallocate(ptrs[i], chunk) };
    }
    for i in (0..n).step_by(2) {
        unsafe { alloc.deallocate(ptrs[i], chunk) };
    }

    let merged = alloc.allocate(chunk * n).unwrap();
    unsafe { alloc.deallocate(merged, chunk * n) };
}

#[test]
fn repeated_grow_shrink_cycles_do_not_leak_address_space() {
    let alloc = Allocator::new();
    let size = MAX_SMALL_SIZE + 16 * PAGE_SIZE;
    let mut first_addr = None;
    for _ in 0..20 {
        let ptr = alloc.allocate(size).unwrap();
        if first_addr.is_none() {
            first_addr = Some(ptr.as_ptr() as usize);
        }
        unsafe { alloc.deallocate(ptr, size) };
    }
}
