//! Page cache: the OS-backed tier of span allocation (spec.md §4.5).
//!
//! Holds idle spans bucketed by page count, grown from and coalesced back
//! toward the OS. Lookups into the page map are lock-free; any insert or
//! removal happens with `inner` locked, matching the page map's own
//! contract.

use crate::object_pool::ObjectPool;
use crate::page_map::PageMap;
use crate::size_class::PAGE_SIZE;
use crate::span::{Span, SpanIndex};
use crate::span_list::SpanList;
use crate::system_alloc;
use std::sync::Mutex;

pub const MAX_BUCKET: usize = 128;
const GROW_PAGES: usize = 128;

struct Inner {
    spans: ObjectPool<Span>,
    /// `buckets[k]` holds idle spans of exactly `k + 1` pages, for
    /// `k + 1 <= MAX_BUCKET`. Spans larger than `MAX_BUCKET` pages are never
    /// cached idle; they are unmapped immediately on release.
    buckets: Vec<SpanList>,
}

pub struct PageCache {
    inner: Mutex<Inner>,
    page_map: PageMap,
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache {
    #[must_use]
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(MAX_BUCKET);
        buckets.resize_with(MAX_BUCKET, SpanList::new);
        Self {
            inner: Mutex::new(Inner {
                spans: ObjectPool::new(),
                buckets,
            }),
            page_map: PageMap::new(),
        }
    }

    #[must_use]
    pub(crate) fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    /// Looks up the span covering `page`, if any.
    #[must_use]
    pub fn span_for_page(&self, page: usize) -> Option<SpanIndex> {
        self.page_map
            .get(page)
            .map(|(idx, _class)| SpanIndex::from_u32(idx))
    }

    /// Returns a raw span of exactly `num_pages` pages, marked in use, with
    /// no size class assigned. Splits a larger cached span or grows from the
    /// OS as needed.
    pub fn new_span(&self, num_pages: usize) -> Option<SpanIndex> {
        assert!(num_pages >= 1);
        let mut inner = self.inner.lock().unwrap();
        self.new_span_locked(&mut inner, num_pages)
    }

    fn new_span_locked(&self, inner: &mut Inner, num_pages: usize) -> Option<SpanIndex> {
        if num_pages > MAX_BUCKET {
            let Some(base) = system_alloc::map_pages(num_pages) else {
                tracing::warn!(num_pages, "OS allocation failed for large raw span");
                return None;
            };
            let start_page = base as usize / PAGE_SIZE;
            tracing::trace!(num_pages, start_page, "mapped large raw span directly from the OS");
            let mut span = Span::new(start_page, num_pages);
            span.in_use = true;
            let idx = inner.spans.insert(span);
            self.page_map.set_range(start_page, num_pages, idx.as_u32(), 0);
            return Some(idx);
        }

        if let Some(idx) = inner.buckets[num_pages - 1].pop_front(&mut inner.spans) {
            inner.spans.get_mut(idx).in_use = true;
            return Some(idx);
        }

        // Split a donor from the smallest larger non-empty bucket.
        for donor_pages in (num_pages + 1)..=MAX_BUCKET {
            if let Some(donor_idx) = inner.buckets[donor_pages - 1].pop_front(&mut inner.spans) {
                let donor = inner.spans.get(donor_idx);
                let donor_start = donor.start_page;
                let remaining = donor.num_pages - num_pages;

                inner.spans.get_mut(donor_idx).start_page = donor_start + num_pages;
                inner.spans.get_mut(donor_idx).num_pages = remaining;
                self.page_map
                    .set_range(donor_start + num_pages, remaining, donor_idx.as_u32(), 0);
                inner.buckets[remaining - 1].push_back(&mut inner.spans, donor_idx);

                let mut new_span = Span::new(donor_start, num_pages);
                new_span.in_use = true;
                let new_idx = inner.spans.insert(new_span);
                self.page_map.set_range(donor_start, num_pages, new_idx.as_u32(), 0);
                return Some(new_idx);
            }
        }

        // Nothing big enough cached; grow from the OS and recurse.
        let grow = num_pages.max(GROW_PAGES);
        let Some(base) = system_alloc::map_pages(grow) else {
            tracing::warn!(grow, "OS allocation failed while growing the page cache");
            return None;
        };
        let start_page = base as usize / PAGE_SIZE;
        tracing::trace!(grow, start_page, "grew page cache from the OS");
        let mut grown = Span::new(start_page, grow);
        grown.in_use = false;
        let idx = inner.spans.insert(grown);
        self.page_map.set_range(start_page, grow, idx.as_u32(), 0);
        inner.buckets[grow - 1].push_back(&mut inner.spans, idx);
        self.new_span_locked(inner, num_pages)
    }

    /// Returns a span to the page cache, coalescing with idle neighbors
    /// where possible. Spans larger than `MAX_BUCKET` pages are unmapped
    /// back to the OS immediately.
    pub fn release_span(&self, idx: SpanIndex) {
        let mut inner = self.inner.lock().unwrap();
        inner.spans.get_mut(idx).in_use = false;
        inner.spans.get_mut(idx).object_size = 0;

        let (start_page, num_pages) = {
            let span = inner.spans.get(idx);
            (span.start_page, span.num_pages)
        };

        if num_pages > MAX_BUCKET {
            tracing::trace!(start_page, num_pages, "unmapping oversized span back to the OS");
            self.page_map.clear_range(start_page, num_pages);
            inner.spans.remove(idx);
            let base = (start_page * PAGE_SIZE) as *mut u8;
            unsafe { system_alloc::unmap_pages(base, num_pages) };
            return;
        }

        let mut idx = idx;
        let mut start_page = start_page;
        let mut num_pages = num_pages;

        // Coalesce forward.
        if let Some((next_idx, next)) = self.page_map.get(start_page + num_pages).and_then(|(i, _)| {
            let next_idx = SpanIndex::from_u32(i);
            let next_pages = inner.spans.get(next_idx).num_pages;
            (!inner.spans.get(next_idx).in_use && num_pages + next_pages <= MAX_BUCKET)
                .then_some((next_idx, next_pages))
        }) {
            inner.buckets[next - 1].remove(&mut inner.spans, next_idx);
            inner.spans.remove(next_idx);
            num_pages += next;
            tracing::trace!(start_page, num_pages, "coalesced with forward neighbor");
        }

        // Coalesce backward.
        if start_page > 0 {
            if let Some((prev_idx, prev_pages, prev_start)) =
                self.page_map.get(start_page - 1).and_then(|(i, _)| {
                    let prev_idx = SpanIndex::from_u32(i);
                    let prev = inner.spans.get(prev_idx);
                    (!prev.in_use && num_pages + prev.num_pages <= MAX_BUCKET)
                        .then_some((prev_idx, prev.num_pages, prev.start_page))
                })
            {
                inner.buckets[prev_pages - 1].remove(&mut inner.spans, prev_idx);
                inner.spans.remove(prev_idx);
                self.page_map.clear_range(start_page, num_pages);
                inner.spans.remove(idx);
                start_page = prev_start;
                num_pages += prev_pages;
                let mut merged = Span::new(start_page, num_pages);
                merged.in_use = false;
                idx = inner.spans.insert(merged);
                tracing::trace!(start_page, num_pages, "coalesced with backward neighbor");
            }
        }

        self.page_map.set_range(start_page, num_pages, idx.as_u32(), 0);
        inner.buckets[num_pages - 1].push_back(&mut inner.spans, idx);
    }

    /// Re-tags every page of `idx`'s span with `class_byte`, used when a raw
    /// span handed out by [`Self::new_span`] is carved up by the central
    /// cache for a particular size class.
    pub fn set_class(&self, idx: SpanIndex, class_byte: u8) {
        let inner = self.inner.lock().unwrap();
        let span = inner.spans.get(idx);
        self.page_map.set_range(span.start_page, span.num_pages, idx.as_u32(), class_byte);
    }

    #[must_use]
    pub fn live_span_count(&self) -> usize {
        self.inner.lock().unwrap().spans.live_count()
    }

    pub fn with_span<R>(&self, idx: SpanIndex, f: impl FnOnce(&Span) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        f(inner.spans.get(idx))
    }

    pub fn with_span_mut<R>(&self, idx: SpanIndex, f: impl FnOnce(&mut Span) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(inner.spans.get_mut(idx))
    }
}

unsafe impl Send for PageCache {}
unsafe impl Sync for PageCache {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_span_grows_from_os_on_cold_start() {
        let cache = PageCache::new();
        let idx = cache.new_span(4).expect("allocation should succeed");
        cache.with_span(idx, |s| assert_eq!(s.num_pages, 4));
    }

    #[test]
    fn released_span_is_reused_by_next_request_of_same_size() {
        let cache = PageCache::new();
        let idx = cache.new_span(4).unwrap();
        let start = cache.with_span(idx, |s| s.start_page);
        cache.release_span(idx);
        let idx2 = cache.new_span(4).unwrap();
        let start2 = cache.with_span(idx2, |s| s.start_page);
        assert_eq!(start, start2);
    }

    #[test]
    fn adjacent_released_spans_coalesce() {
        let cache = PageCache::new();
        let a = cache.new_span(4).unwrap();
        let b = cache.new_span(4).unwrap();
        cache.release_span(a);
        cache.release_span(b);
        let big = cache.new_span(8).unwrap();
        cache.with_span(big, |s| assert_eq!(s.num_pages, 8));
    }

    #[test]
    fn splitting_a_donor_leaves_a_usable_remainder() {
        let cache = PageCache::new();
        let donor = cache.new_span(16).unwrap();
        cache.release_span(donor);
        let small = cache.new_span(4).unwrap();
        cache.with_span(small, |s| assert_eq!(s.num_pages, 4));
        let remainder = cache.new_span(12).unwrap();
        cache.with_span(remainder, |s| assert_eq!(s.num_pages, 12));
    }
}
