//! Page cache: the bottom tier. Owns every page obtained from the OS and
//! hands out spans (contiguous page-aligned page runs), splitting oversized
//! free spans and coalescing freed neighbors.
//!
//! Callers wrap the cache in a [`SpinMutex`](crate::sync::SpinMutex); all
//! operations here take `&mut self` and assume they are serialized. Span
//! metadata lives in an internal slab pool whose backing pages are mapped
//! directly, so growing the pool never re-enters the cache.

use crate::PAGE_SIZE;
use crate::platform;
use crate::span_pool::SpanPool;
use core::ptr;
use std::collections::{BTreeMap, HashMap};

/// A contiguous run of pages tracked as a unit.
struct Span {
    /// First word: doubles as the slab freelist link while the record is
    /// pooled.
    next: *mut Span,
    prev: *mut Span,
    addr: usize,
    pages: usize,
    /// Whether the span currently sits on a `free_spans` list.
    free: bool,
}

/// One past the span's last byte.
unsafe fn end_addr(s: *const Span) -> usize {
    unsafe { (*s).addr + (*s).pages * PAGE_SIZE }
}

pub struct PageCache {
    /// page count -> head of a doubly-linked list of free spans of exactly
    /// that size.
    free_spans: BTreeMap<usize, *mut Span>,
    /// start address -> span, for every span currently tracked (free or
    /// handed out).
    span_start: HashMap<usize, *mut Span>,
    /// one-past-end address -> span; the boundary tag enabling O(1)
    /// neighbor lookup when coalescing.
    span_end: HashMap<usize, *mut Span>,
    pool: SpanPool<Span>,
}

// SAFETY: all raw pointers reference slab records owned by this cache; the
// cache is only used behind a lock.
unsafe impl Send for PageCache {}

impl PageCache {
    pub fn new() -> Self {
        Self {
            free_spans: BTreeMap::new(),
            span_start: HashMap::new(),
            span_end: HashMap::new(),
            pool: SpanPool::new(),
        }
    }

    /// Allocate a span of exactly `pages` pages, reusing and splitting a
    /// cached free span when one is large enough, otherwise mapping fresh
    /// memory. Returns a page-aligned pointer, or null if `pages` is zero or
    /// the OS refuses the mapping.
    pub fn allocate_span(&mut self, pages: usize) -> *mut u8 {
        if pages == 0 {
            return ptr::null_mut();
        }

        // First free span with size >= pages.
        let reusable = self.free_spans.range(pages..).next().map(|(_, &s)| s);
        if let Some(span) = reusable {
            unsafe {
                self.detach(span);
                if (*span).pages > pages {
                    // Split: shrink this span, track the tail as a new free
                    // span.
                    self.span_end.remove(&end_addr(span));
                    let tail_addr = (*span).addr + pages * PAGE_SIZE;
                    let tail_pages = (*span).pages - pages;
                    (*span).pages = pages;
                    let tail = self.new_span(tail_addr, tail_pages);
                    self.span_start.insert(tail_addr, tail);
                    self.span_end.insert(end_addr(tail), tail);
                    self.push_free(tail);
                }
                self.span_end.insert(end_addr(span), span);
                return (*span).addr as *mut u8;
            }
        }

        let mem = platform::map(pages * PAGE_SIZE);
        if mem.is_null() {
            return ptr::null_mut();
        }
        let span = self.new_span(mem as usize, pages);
        self.span_start.insert(mem as usize, span);
        self.span_end.insert(unsafe { end_addr(span) }, span);
        mem
    }

    /// Return a span to the cache, coalescing with free neighbors on either
    /// side. Pointers that do not name a tracked span start are ignored.
    ///
    /// # Safety
    ///
    /// If `ptr` names a tracked span, that span must currently be handed
    /// out and must not be used afterwards; freeing it twice corrupts the
    /// free lists.
    pub unsafe fn deallocate_span(&mut self, ptr_: *mut u8) {
        let addr = ptr_ as usize;
        let Some(&found) = self.span_start.get(&addr) else {
            return;
        };
        let mut span = found;
        debug_assert!(unsafe { !(*span).free }, "span freed twice");

        unsafe {
            // Right neighbor: a free span starting where this one ends.
            if let Some(&right) = self.span_start.get(&end_addr(span)) {
                if (*right).free {
                    self.detach(right);
                    self.span_start.remove(&(*right).addr);
                    self.span_end.remove(&end_addr(right));
                    self.span_end.remove(&end_addr(span));
                    (*span).pages += (*right).pages;
                    self.span_end.insert(end_addr(span), span);
                    self.pool.put(right);
                }
            }

            // Left neighbor: a free span ending where this one starts.
            if let Some(&left) = self.span_end.get(&addr) {
                if (*left).free {
                    self.detach(left);
                    self.span_end.remove(&end_addr(left));
                    self.span_start.remove(&(*span).addr);
                    self.span_end.remove(&end_addr(span));
                    (*left).pages += (*span).pages;
                    self.span_end.insert(end_addr(left), left);
                    self.pool.put(span);
                    span = left;
                }
            }

            self.push_free(span);
        }
    }

    /// Total pages currently sitting on free lists.
    pub fn free_pages(&self) -> usize {
        let mut total = 0;
        for (&pages, &head) in &self.free_spans {
            let mut s = head;
            while !s.is_null() {
                total += pages;
                s = unsafe { (*s).next };
            }
        }
        total
    }

    /// Acquire and initialize a span record; grows the metadata slab from a
    /// direct OS mapping when dry.
    fn new_span(&mut self, addr: usize, pages: usize) -> *mut Span {
        let mut span = self.pool.get();
        if span.is_null() {
            let page = platform::map(PAGE_SIZE);
            assert!(
                !page.is_null(),
                "span pool exhausted: OS refused a metadata page"
            );
            unsafe { self.pool.grow(page) };
            span = self.pool.get();
        }
        unsafe {
            (*span).next = ptr::null_mut();
            (*span).prev = ptr::null_mut();
            (*span).addr = addr;
            (*span).pages = pages;
            (*span).free = false;
        }
        span
    }

    /// Unlink a span from its free list. The span must be free.
    unsafe fn detach(&mut self, s: *mut Span) {
        unsafe {
            debug_assert!((*s).free);
            let pages = (*s).pages;
            let prev = (*s).prev;
            let next = (*s).next;
            if prev.is_null() {
                // s heads its list.
                if next.is_null() {
                    self.free_spans.remove(&pages);
                } else {
                    self.free_spans.insert(pages, next);
                }
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*s).prev = ptr::null_mut();
            (*s).next = ptr::null_mut();
            (*s).free = false;
        }
    }

    /// Head-insert a span into the free list for its size.
    unsafe fn push_free(&mut self, s: *mut Span) {
        unsafe {
            let pages = (*s).pages;
            let head = self.free_spans.get(&pages).copied().unwrap_or(ptr::null_mut());
            (*s).next = head;
            (*s).prev = ptr::null_mut();
            (*s).free = true;
            if !head.is_null() {
                (*head).prev = s;
            }
            self.free_spans.insert(pages, s);
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // Every page ever mapped stays reachable from span_start, and spans
        // are disjoint, so each page is unmapped exactly once.
        for (&addr, &span) in &self.span_start {
            let pages = unsafe { (*span).pages };
            unsafe { platform::unmap(addr as *mut u8, pages * PAGE_SIZE) };
        }
        self.free_spans.clear();
        self.span_start.clear();
        self.span_end.clear();
        // Metadata slab pages were mapped directly, not through a span.
        unsafe {
            self.pool
                .release_pages(|page| unsafe { platform::unmap(page, PAGE_SIZE) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_pages_returns_null() {
        let mut cache = PageCache::new();
        assert!(cache.allocate_span(0).is_null());
    }

    #[test]
    fn test_returns_page_aligned_zeroed_memory() {
        let mut cache = PageCache::new();
        let p = cache.allocate_span(3);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        let bytes = unsafe { core::slice::from_raw_parts(p, 3 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { cache.deallocate_span(p) };
    }

    #[test]
    fn test_unknown_pointer_is_ignored() {
        let mut cache = PageCache::new();
        let p = cache.allocate_span(1);
        assert!(!p.is_null());
        // Interior pointer: not a span start.
        unsafe { cache.deallocate_span(p.add(8)) };
        assert_eq!(cache.free_pages(), 0);
        unsafe { cache.deallocate_span(p) };
        assert_eq!(cache.free_pages(), 1);
    }

    #[test]
    fn test_split_and_coalesce_round_trip() {
        let mut cache = PageCache::new();

        let p1 = cache.allocate_span(5);
        assert!(!p1.is_null());
        unsafe { cache.deallocate_span(p1) };

        // A 2-page request splits the cached 5-page span.
        let p2 = cache.allocate_span(2);
        assert_eq!(p2, p1);
        let p3 = cache.allocate_span(3);
        assert_eq!(p3 as usize, p2 as usize + 2 * PAGE_SIZE);
        assert_eq!(cache.free_pages(), 0);

        // Freeing both halves coalesces them back into one span.
        unsafe { cache.deallocate_span(p2) };
        unsafe { cache.deallocate_span(p3) };
        assert_eq!(cache.free_pages(), 5);
        let p4 = cache.allocate_span(5);
        assert_eq!(p4, p1);
        unsafe { cache.deallocate_span(p4) };
    }

    #[test]
    fn test_middle_free_merges_both_neighbors() {
        let mut cache = PageCache::new();
        let base = cache.allocate_span(9);
        assert!(!base.is_null());
        unsafe { cache.deallocate_span(base) };

        let a = cache.allocate_span(2);
        let b = cache.allocate_span(3);
        let c = cache.allocate_span(4);
        assert_eq!(a, base);
        assert_eq!(b as usize, base as usize + 2 * PAGE_SIZE);
        assert_eq!(c as usize, base as usize + 5 * PAGE_SIZE);

        unsafe { cache.deallocate_span(a) };
        unsafe { cache.deallocate_span(c) };
        assert_eq!(cache.free_pages(), 6);
        // Freeing the middle span must fuse all three runs.
        unsafe { cache.deallocate_span(b) };
        assert_eq!(cache.free_pages(), 9);
        let again = cache.allocate_span(9);
        assert_eq!(again, base);
        unsafe { cache.deallocate_span(again) };
    }

    #[test]
    fn test_exact_fit_does_not_split() {
        let mut cache = PageCache::new();
        let p = cache.allocate_span(4);
        unsafe { cache.deallocate_span(p) };
        let q = cache.allocate_span(4);
        assert_eq!(q, p);
        assert_eq!(cache.free_pages(), 0);
        unsafe { cache.deallocate_span(q) };
    }

    #[test]
    fn test_random_churn_spans_never_overlap() {
        let mut cache = PageCache::new();
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut state = 0x9E37_79B9_u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..2000 {
            if next() & 1 == 1 && !live.is_empty() {
                let i = next() as usize % live.len();
                let (addr, _) = live.swap_remove(i);
                unsafe { cache.deallocate_span(addr as *mut u8) };
            } else {
                let pages = (next() as usize % 16) + 1;
                let p = cache.allocate_span(pages);
                assert!(!p.is_null());
                let a0 = p as usize;
                let a1 = a0 + pages * PAGE_SIZE;
                for &(b0, bp) in &live {
                    let b1 = b0 + bp * PAGE_SIZE;
                    assert!(a1 <= b0 || a0 >= b1, "overlapping spans");
                }
                live.push((a0, pages));
            }
        }
        for (addr, _) in live {
            unsafe { cache.deallocate_span(addr as *mut u8) };
        }
    }
}
