use super::{FiberStack, StackPointer, MIN_STACK_SIZE};
use std::io;
use std::ptr;

fn page_size() -> usize {
    // Safety: sysconf with _SC_PAGESIZE never fails on POSIX.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(n > 0 && (n as usize).is_power_of_two());
    n as usize
}

/// An independent, heap-backed fiber stack: an anonymous mapping with a
/// leading guard page that traps on overflow.
#[derive(Debug)]
pub struct MmapStack {
    top: StackPointer,
    mmap_len: usize,
}

impl MmapStack {
    /// Reserves a stack of at least `size` usable bytes, plus one guard page.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page = page_size();
        let mmap_len = size
            .checked_add(2 * page - 1)
            .expect("stack size overflow")
            & !(page - 1);

        // Safety: a PROT_NONE anonymous mapping has no preconditions beyond
        // a valid length, checked above.
        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // Leave the first page as the guard; make the rest read/write.
            if libc::mprotect(
                base.cast::<u8>().add(page).cast(),
                mmap_len - page,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(base, mmap_len);
                return Err(err);
            }

            Ok(Self {
                top: StackPointer::new(base as usize + mmap_len).unwrap(),
                mmap_len,
            })
        }
    }
}

impl Drop for MmapStack {
    fn drop(&mut self) {
        let base = self.top.get() - self.mmap_len;
        // Safety: `base`/`mmap_len` describe exactly the mapping created in `new`.
        let ret = unsafe { libc::munmap(base as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0, "munmap of fiber stack failed");
    }
}

// Safety: the mapping is exclusively owned by this struct and is handed to
// exactly one fiber at a time.
unsafe impl FiberStack for MmapStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len).unwrap()
    }
}

/// A single large mapped region shared by every fiber on one worker thread
/// that opted into shared-stack mode. Only one fiber may be actively running
/// on it at a time; fibers that are suspended while targeting this stack
/// keep their used portion copied out into a private spill buffer (see
/// [`crate::fiber::Fiber`]).
#[derive(Debug)]
pub struct SharedStackRegion {
    top: StackPointer,
    mmap_len: usize,
}

/// Default size of a per-worker shared stack. Generous because it is paid
/// for once per worker, not once per fiber.
pub const DEFAULT_SHARED_STACK_SIZE: usize = 8 * 1024 * 1024;

impl SharedStackRegion {
    pub fn new(size: usize) -> io::Result<Self> {
        let inner = MmapStack::new(size)?;
        let top = inner.top;
        let mmap_len = inner.mmap_len;
        // Leak the guard/mapping bookkeeping into our own type; `MmapStack`'s
        // Drop impl would otherwise unmap memory we still want to own.
        std::mem::forget(inner);
        Ok(Self { top, mmap_len })
    }

    #[must_use]
    pub fn top(&self) -> StackPointer {
        self.top
    }

    #[must_use]
    pub fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len).unwrap()
    }
}

impl Drop for SharedStackRegion {
    fn drop(&mut self) {
        let base = self.top.get() - self.mmap_len;
        // Safety: mirrors `MmapStack::drop`; we own this mapping exclusively
        // since `new` forgot the `MmapStack` that originally created it.
        let ret = unsafe { libc::munmap(base as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0, "munmap of shared stack failed");
    }
}

// Safety: callers (the worker run loop) guarantee at most one fiber is
// actively executing on the shared region at any instant; suspended fibers
// hold no reference into the live mapping, only into their spill buffer.
unsafe impl FiberStack for SharedStackRegion {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        SharedStackRegion::bottom(self)
    }
}
