//! Intrusive doubly linked list of spans, threaded through a shared
//! [`ObjectPool`] rather than raw pointers (spec.md §9).

use crate::object_pool::ObjectPool;
use crate::span::{Span, SpanIndex};

#[derive(Debug, Default)]
pub struct SpanList {
    head: Option<SpanIndex>,
    tail: Option<SpanIndex>,
    len: usize,
}

impl SpanList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn front(&self) -> Option<SpanIndex> {
        self.head
    }

    pub fn push_back(&mut self, pool: &mut ObjectPool<Span>, idx: SpanIndex) {
        pool.get_mut(idx).prev = self.tail;
        pool.get_mut(idx).next = None;
        match self.tail {
            Some(t) => pool.get_mut(t).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    pub fn pop_front(&mut self, pool: &mut ObjectPool<Span>) -> Option<SpanIndex> {
        let idx = self.head?;
        self.remove(pool, idx);
        Some(idx)
    }

    /// Unlinks `idx` from this list. `idx` must currently be a member.
    pub fn remove(&mut self, pool: &mut ObjectPool<Span>, idx: SpanIndex) {
        let (prev, next) = {
            let span = pool.get(idx);
            (span.prev, span.next)
        };
        match prev {
            Some(p) => pool.get_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => pool.get_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let span = pool.get_mut(idx);
        span.prev = None;
        span.next = None;
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_fifo_order() {
        let mut pool = ObjectPool::new();
        let mut list = SpanList::new();
        let a = pool.insert(Span::new(0, 1));
        let b = pool.insert(Span::new(1, 1));
        list.push_back(&mut pool, a);
        list.push_back(&mut pool, b);
        assert_eq!(list.pop_front(&mut pool), Some(a));
        assert_eq!(list.pop_front(&mut pool), Some(b));
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle_relinks_neighbors() {
        let mut pool = ObjectPool::new();
        let mut list = SpanList::new();
        let a = pool.insert(Span::new(0, 1));
        let b = pool.insert(Span::new(1, 1));
        let c = pool.insert(Span::new(2, 1));
        list.push_back(&mut pool, a);
        list.push_back(&mut pool, b);
        list.push_back(&mut pool, c);
        list.remove(&mut pool, b);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop_front(&mut pool), Some(a));
        assert_eq!(list.pop_front(&mut pool), Some(c));
    }
}
