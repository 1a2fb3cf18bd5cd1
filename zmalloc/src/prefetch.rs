//! Software prefetch hints for the allocation hot path.
//!
//! These are advisory only: on a platform without a prefetch intrinsic they
//! degrade to a no-op.

/// Hints that `ptr` will likely be read soon (e.g. the next free-list node
/// before it's unlinked).
#[inline(always)]
pub fn prefetch_read<T>(ptr: *const T) {
    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "x86_64", not(miri)))] {
            unsafe {
                std::arch::x86_64::_mm_prefetch(ptr.cast::<i8>(), std::arch::x86_64::_MM_HINT_T0);
            }
        } else {
            let _ = ptr;
        }
    }
}

/// Hints that `ptr` will likely be written soon.
#[inline(always)]
pub fn prefetch_write<T>(ptr: *mut T) {
    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "x86_64", not(miri)))] {
            unsafe {
                std::arch::x86_64::_mm_prefetch(ptr.cast::<i8>(), std::arch::x86_64::_MM_HINT_T0);
            }
        } else {
            let _ = ptr;
        }
    }
}
