//! Stealable bitmap: one bit per worker, laid out one word per cache line so
//! that setting/clearing a bit never false-shares with a neighbor.

use crossbeam_utils::CachePadded;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A cache-line-striped bitmask with one bit per worker.
///
/// All operations are lock-free, using relaxed or acquire loads/stores on the
/// underlying words. Callers must tolerate stale reads: a bit observed set
/// may have been cleared by the time the caller acts on it, and vice versa.
#[derive(Debug)]
pub struct StealableBitmap {
    words: Box<[CachePadded<AtomicU64>]>,
    len: usize,
}

impl StealableBitmap {
    /// Creates a bitmap with `len` bits, all initially clear.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let num_words = len.div_ceil(BITS_PER_WORD).max(1);
        let words = (0..num_words)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self { words, len }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn word_and_mask(i: usize) -> (usize, u64) {
        (i / BITS_PER_WORD, 1u64 << (i % BITS_PER_WORD))
    }

    /// Sets bit `i`, marking worker `i` as having stealable work.
    pub fn set(&self, i: usize) {
        debug_assert!(i < self.len);
        let (word, mask) = Self::word_and_mask(i);
        self.words[word].fetch_or(mask, Ordering::Release);
    }

    /// Clears bit `i`.
    pub fn clear(&self, i: usize) {
        debug_assert!(i < self.len);
        let (word, mask) = Self::word_and_mask(i);
        self.words[word].fetch_and(!mask, Ordering::Release);
    }

    /// Tests bit `i`.
    #[must_use]
    pub fn test(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (word, mask) = Self::word_and_mask(i);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Returns whether any bit anywhere is set.
    #[must_use]
    pub fn any(&self) -> bool {
        self.words
            .iter()
            .any(|w| w.load(Ordering::Acquire) != 0)
    }

    /// Finds some `i != self_id` with its bit set. Returns `None` if no
    /// other worker currently looks stealable.
    ///
    /// The scan starts at a randomly jittered offset from `self_id` so that
    /// many idle workers waking at once don't all pile onto the same
    /// low-numbered victim, then wraps around checking every other worker
    /// exactly once.
    #[must_use]
    pub fn find_victim(&self, self_id: usize) -> Option<usize> {
        if self.len <= 1 {
            return None;
        }
        let others = self.len - 1;
        let jitter = rand::thread_rng().gen_range(0..others);
        for step in 0..others {
            let offset = 1 + (jitter + step) % others;
            let i = (self_id + offset) % self.len;
            if self.test(i) {
                return Some(i);
            }
        }
        None
    }

    /// Finds some `i` with its bit *clear*, starting the scan at `start` and
    /// wrapping around. Used to place externally-enqueued work on a worker
    /// that hasn't crossed its high watermark yet.
    #[must_use]
    pub fn find_non_stealable(&self, start: usize) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let start = start % self.len;
        for offset in 0..self.len {
            let i = (start + offset) % self.len;
            if !self.test(i) {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_test_roundtrip() {
        let bm = StealableBitmap::new(130);
        assert!(!bm.test(5));
        bm.set(5);
        assert!(bm.test(5));
        assert!(bm.any());
        bm.clear(5);
        assert!(!bm.test(5));
        assert!(!bm.any());
    }

    #[test]
    fn bits_on_different_words_are_independent() {
        let bm = StealableBitmap::new(200);
        bm.set(3);
        bm.set(70);
        bm.set(150);
        assert!(bm.test(3) && bm.test(70) && bm.test(150));
        bm.clear(70);
        assert!(bm.test(3) && !bm.test(70) && bm.test(150));
    }

    #[test]
    fn find_victim_skips_self_and_wraps() {
        let bm = StealableBitmap::new(4);
        bm.set(1);
        // self_id=1 can never return itself.
        assert_eq!(bm.find_victim(1), None);
        bm.set(0);
        assert_eq!(bm.find_victim(1), Some(0));
    }

    #[test]
    fn find_non_stealable_finds_clear_bit_from_start() {
        let bm = StealableBitmap::new(4);
        bm.set(0);
        bm.set(1);
        assert_eq!(bm.find_non_stealable(0), Some(2));
        bm.set(2);
        bm.set(3);
        assert_eq!(bm.find_non_stealable(0), None);
    }

    #[test]
    fn single_worker_has_no_victim() {
        let bm = StealableBitmap::new(1);
        bm.set(0);
        assert_eq!(bm.find_victim(0), None);
    }
}
