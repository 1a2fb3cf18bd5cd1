//! OS-backed page mapping (spec.md §4.5), grounded on the same mmap/munmap
//! pattern the coroutine runtime's stack allocator uses.
//!
//! `PAGE_SIZE` is 8 KiB, but `mmap` only guarantees 4 KiB alignment on every
//! unix target. The original implementation (`system_alloc.cc`) handles this
//! by first trying a fixed mapping at an already-aligned hint address, and
//! falling back to an over-allocate-then-trim strategy when that fails (the
//! hint is taken, unsupported, or the platform has no fixed-mapping
//! primitive at all). We do the same.

use crate::size_class::PAGE_SIZE;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A per-process address hint that walks downward through a large reserved
/// band, so that successive large mappings tend to land adjacent to each
/// other. This is advisory only: the kernel is free to ignore it. Always a
/// multiple of `PAGE_SIZE`.
static NEXT_HINT: AtomicUsize = AtomicUsize::new(0x0000_7000_0000_0000);

const HINT_STRIDE: usize = 1 << 30;

fn take_hint() -> usize {
    NEXT_HINT.fetch_sub(HINT_STRIDE, Ordering::Relaxed)
}

/// Tries to map exactly `len` bytes at the already page-aligned `hint`,
/// refusing to relocate if that address is unavailable. Linux-only (no
/// portable `MAP_FIXED_NOREPLACE` equivalent); other unixes always fall
/// through to the over-allocate path.
fn try_fixed_at_hint(hint: usize, len: usize) -> Option<*mut u8> {
    #[cfg(target_os = "linux")]
    {
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr != libc::MAP_FAILED {
            debug_assert_eq!(ptr as usize % PAGE_SIZE, 0);
            return Some(ptr.cast());
        }
        tracing::trace!(hint, "MAP_FIXED_NOREPLACE hint unavailable, falling back");
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (hint, len);
    }
    None
}

/// Maps `len` bytes without a fixed address, over-allocating by one page so
/// that a `PAGE_SIZE`-aligned sub-range of exactly `len` bytes can be carved
/// out, and trimming the unaligned prefix/suffix back to the OS.
fn map_with_trim(len: usize) -> Option<*mut u8> {
    let over_len = len + PAGE_SIZE;
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            over_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    let raw = raw as usize;
    let aligned = (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let prefix_len = aligned - raw;
    let suffix_start = aligned + len;
    let suffix_len = (raw + over_len) - suffix_start;

    unsafe {
        if prefix_len > 0 {
            libc::munmap(raw as *mut libc::c_void, prefix_len);
        }
        if suffix_len > 0 {
            libc::munmap(suffix_start as *mut libc::c_void, suffix_len);
        }
    }
    Some(aligned as *mut u8)
}

/// Maps `num_pages` fresh, zeroed, `PAGE_SIZE`-aligned pages from the OS.
/// Returns `None` on failure (the caller surfaces this as an allocation
/// failure, never panics).
#[must_use]
pub fn map_pages(num_pages: usize) -> Option<*mut u8> {
    let len = num_pages * PAGE_SIZE;
    let hint = take_hint();

    if let Some(ptr) = try_fixed_at_hint(hint, len) {
        return Some(ptr);
    }
    if let Some(ptr) = map_with_trim(len) {
        return Some(ptr);
    }
    tracing::error!(num_pages, "failed to map pages from the OS");
    None
}

/// Returns `num_pages` pages starting at `ptr` to the OS.
///
/// # Safety
/// `ptr` must be the base of a mapping of exactly `num_pages * PAGE_SIZE`
/// bytes previously returned by [`map_pages`], with no outstanding
/// references into it.
pub unsafe fn unmap_pages(ptr: *mut u8, num_pages: usize) {
    let len = num_pages * PAGE_SIZE;
    unsafe {
        libc::munmap(ptr.cast(), len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_roundtrip() {
        let ptr = map_pages(4).expect("mmap should succeed");
        assert_eq!(ptr as usize % PAGE_SIZE, 0);
        unsafe {
            ptr.write(0xAB);
            assert_eq!(ptr.read(), 0xAB);
            unmap_pages(ptr, 4);
        }
    }

    #[test]
    fn trimmed_mapping_is_page_aligned_even_without_the_hint() {
        for _ in 0..20 {
            let ptr = map_with_trim(3 * PAGE_SIZE).expect("mmap should succeed");
            assert_eq!(ptr as usize % PAGE_SIZE, 0);
            unsafe { unmap_pages(ptr, 3) };
        }
    }
}
