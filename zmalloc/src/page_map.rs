//! Lock-free-read radix tree mapping page numbers to span metadata
//! (spec.md §4.4, §9 "Raw pointer graphs → arena + typed handles").
//!
//! Reads never take a lock: they walk atomics with `Acquire` loads. Inserts
//! happen with the page cache's lock held (the page cache is the only
//! writer), and lazily install intermediate nodes via compare-and-swap so
//! that a racing reader either sees the old (absent) state or the fully
//! published new node, never a half-built one.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 12;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const LEAF_MASK: usize = LEAF_LEN - 1;
const MID_MASK: usize = MID_LEN - 1;
const ROOT_MASK: usize = ROOT_LEN - 1;

static_assertions::const_assert!(ROOT_BITS + MID_BITS + LEAF_BITS <= usize::BITS as usize);

/// Encodes `(span_index, size_class_byte)` into a nonzero slot value.
/// `0` means "unmapped". `span_index` is biased by one to make this work.
#[must_use]
pub fn encode_slot(span_index: u32, class_byte: u8) -> u64 {
    ((u64::from(span_index) + 1) << 8) | u64::from(class_byte)
}

/// Decodes a slot previously produced by [`encode_slot`]. Returns `None` for
/// the unmapped sentinel.
#[must_use]
pub fn decode_slot(slot: u64) -> Option<(u32, u8)> {
    if slot == 0 {
        return None;
    }
    let span_index = u32::try_from((slot >> 8) - 1).expect("span index overflowed u32");
    let class_byte = (slot & 0xff) as u8;
    Some((span_index, class_byte))
}

struct Leaf {
    slots: Vec<AtomicU64>,
}

impl Leaf {
    fn new() -> Box<Self> {
        let mut slots = Vec::with_capacity(LEAF_LEN);
        slots.resize_with(LEAF_LEN, || AtomicU64::new(0));
        Box::new(Self { slots })
    }
}

struct Mid {
    leaves: Vec<AtomicPtr<Leaf>>,
}

impl Mid {
    fn new() -> Box<Self> {
        let mut leaves = Vec::with_capacity(MID_LEN);
        leaves.resize_with(MID_LEN, || AtomicPtr::new(std::ptr::null_mut()));
        Box::new(Self { leaves })
    }
}

impl Drop for Mid {
    fn drop(&mut self) {
        for slot in &self.leaves {
            let ptr = slot.load(Ordering::Relaxed);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

pub struct PageMap {
    roots: Vec<AtomicPtr<Mid>>,
}

impl Drop for PageMap {
    fn drop(&mut self) {
        for slot in &self.roots {
            let ptr = slot.load(Ordering::Relaxed);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    #[must_use]
    pub fn new() -> Self {
        let mut roots = Vec::with_capacity(ROOT_LEN);
        roots.resize_with(ROOT_LEN, || AtomicPtr::new(std::ptr::null_mut()));
        Self { roots }
    }

    fn split(page: usize) -> (usize, usize, usize) {
        let leaf_idx = page & LEAF_MASK;
        let mid_idx = (page >> LEAF_BITS) & MID_MASK;
        let root_idx = (page >> (LEAF_BITS + MID_BITS)) & ROOT_MASK;
        (root_idx, mid_idx, leaf_idx)
    }

    /// Looks up the raw slot value for `page`. Lock-free.
    #[must_use]
    pub fn get(&self, page: usize) -> Option<(u32, u8)> {
        let (root_idx, mid_idx, leaf_idx) = Self::split(page);
        let mid = self.roots[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        let mid = unsafe { &*mid };
        let leaf = mid.leaves[mid_idx].load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        let leaf = unsafe { &*leaf };
        decode_slot(leaf.slots[leaf_idx].load(Ordering::Acquire))
    }

    fn ensure_mid(&self, root_idx: usize) -> &Mid {
        let existing = self.roots[root_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let fresh = Box::into_raw(Mid::new());
        match self.roots[root_idx].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(installed) => {
                drop(unsafe { Box::from_raw(fresh) });
                unsafe { &*installed }
            }
        }
    }

    fn ensure_leaf<'a>(&self, mid: &'a Mid, mid_idx: usize) -> &'a Leaf {
        let existing = mid.leaves[mid_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let fresh = Box::into_raw(Leaf::new());
        match mid.leaves[mid_idx].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(installed) => {
                drop(unsafe { Box::from_raw(fresh) });
                unsafe { &*installed }
            }
        }
    }

    /// Records the mapping for a single page. Callers must hold whatever
    /// external lock serializes inserts (the page cache's mutex).
    pub fn set(&self, page: usize, span_index: u32, class_byte: u8) {
        let (root_idx, mid_idx, leaf_idx) = Self::split(page);
        let mid = self.ensure_mid(root_idx);
        let leaf = self.ensure_leaf(mid, mid_idx);
        leaf.slots[leaf_idx].store(encode_slot(span_index, class_byte), Ordering::Release);
    }

    /// Clears the mapping for a single page.
    pub fn clear(&self, page: usize) {
        let (root_idx, mid_idx, leaf_idx) = Self::split(page);
        let mid = self.roots[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return;
        }
        let mid = unsafe { &*mid };
        let leaf = mid.leaves[mid_idx].load(Ordering::Acquire);
        if leaf.is_null() {
            return;
        }
        let leaf = unsafe { &*leaf };
        leaf.slots[leaf_idx].store(0, Ordering::Release);
    }

    /// Records the mapping for every page in `start..start + num_pages`.
    pub fn set_range(&self, start: usize, num_pages: usize, span_index: u32, class_byte: u8) {
        for page in start..start + num_pages {
            self.set(page, span_index, class_byte);
        }
    }

    pub fn clear_range(&self, start: usize, num_pages: usize) {
        for page in start..start + num_pages {
            self.clear(page);
        }
    }
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_page_returns_none() {
        let map = PageMap::new();
        assert_eq!(map.get(12345), None);
    }

    #[test]
    fn set_then_get_roundtrips() {
        let map = PageMap::new();
        map.set(42, 7, 3);
        assert_eq!(map.get(42), Some((7, 3)));
    }

    #[test]
    fn clear_removes_mapping() {
        let map = PageMap::new();
        map.set(100, 1, 0);
        map.clear(100);
        assert_eq!(map.get(100), None);
    }

    #[test]
    fn set_range_covers_every_page() {
        let map = PageMap::new();
        map.set_range(1000, 130, 9, 5);
        for page in 1000..1130 {
            assert_eq!(map.get(page), Some((9, 5)));
        }
        assert_eq!(map.get(1130), None);
    }

    #[test]
    fn crosses_leaf_and_mid_boundaries() {
        let map = PageMap::new();
        let page = (1 << LEAF_BITS) * 3 + 5;
        map.set(page, 2, 1);
        assert_eq!(map.get(page), Some((2, 1)));
    }
}
