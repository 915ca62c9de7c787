//! Central cache: the middle tier. One locked record per size class hands
//! blocks to thread caches in batches and takes them back, returning whole
//! spans to the page cache once enough of them fall idle.
//!
//! Each class owns a doubly-linked list of trackers that still have free
//! blocks, a reverse index locating a block's tracker from its address, and
//! a slab pool for tracker records. Everything sits behind a per-class
//! spinlock padded to its own cache line, so disjoint classes never contend
//! or false-share.

use crate::PAGE_SIZE;
use crate::free_list::FreeObject;
use crate::page_cache::PageCache;
use crate::size_class::{self, CLS_MEDIUM, NUM_CLASSES};
use crate::span_pool::SpanPool;
use crate::span_tracker::SpanTracker;
use crate::sync::{CacheAligned, SpinMutex};
use core::ptr;
use std::collections::{BTreeMap, HashMap};

/// Cap on idle span memory parked per class; above it, empty spans go back
/// to the page cache.
const MAX_BYTES_PER_INDEX: usize = 4 * 1024 * 1024;

/// Most all-free spans class `index` may hold before one is evicted.
pub fn max_empty_spans(index: usize) -> usize {
    let span_bytes = size_class::get_size(index) * size_class::block_count(index);
    MAX_BYTES_PER_INDEX.div_ceil(span_bytes).max(1)
}

/// Block-address -> tracker lookup, keyed differently by segment: small and
/// medium spans cover few pages, so every page gets a hash entry; large and
/// x-large spans are found by predecessor search on their start address.
enum ReverseIndex {
    Pages(HashMap<usize, *mut SpanTracker>),
    Spans(BTreeMap<usize, *mut SpanTracker>),
}

impl ReverseIndex {
    /// Find the tracker owning the block at `addr`, or null.
    unsafe fn lookup(&self, addr: usize) -> *mut SpanTracker {
        match self {
            ReverseIndex::Pages(map) => {
                let page_base = addr & !(PAGE_SIZE - 1);
                map.get(&page_base).copied().unwrap_or(ptr::null_mut())
            }
            ReverseIndex::Spans(map) => {
                let Some((_, &tracker)) = map.range(..=addr).next_back() else {
                    return ptr::null_mut();
                };
                let end = unsafe { (*tracker).span_addr() + (*tracker).pages() * PAGE_SIZE };
                if addr < end { tracker } else { ptr::null_mut() }
            }
        }
    }

    unsafe fn insert(&mut self, tracker: *mut SpanTracker) {
        unsafe {
            let addr = (*tracker).span_addr();
            match self {
                ReverseIndex::Pages(map) => {
                    for p in 0..(*tracker).pages() {
                        map.insert(addr + p * PAGE_SIZE, tracker);
                    }
                }
                ReverseIndex::Spans(map) => {
                    map.insert(addr, tracker);
                }
            }
        }
    }

    unsafe fn remove(&mut self, tracker: *mut SpanTracker) {
        unsafe {
            let addr = (*tracker).span_addr();
            match self {
                ReverseIndex::Pages(map) => {
                    for p in 0..(*tracker).pages() {
                        map.remove(&(addr + p * PAGE_SIZE));
                    }
                }
                ReverseIndex::Spans(map) => {
                    map.remove(&addr);
                }
            }
        }
    }
}

/// Per-class state; guarded by the class spinlock.
struct CentralClass {
    /// Head of the list of trackers with at least one free block.
    /// Fully-allocated trackers are unlinked until a block comes back.
    free_list: *mut SpanTracker,
    /// Trackers on the list whose blocks are all free.
    empty_count: usize,
    reverse: ReverseIndex,
    pool: SpanPool<SpanTracker>,
}

// SAFETY: the raw pointers reference slab records owned by this class; the
// class is only reachable through its lock.
unsafe impl Send for CentralClass {}

impl CentralClass {
    /// Pull one fresh span from the page cache and wrap it in an all-free
    /// tracker registered in the reverse index. Null if the page cache is
    /// exhausted.
    fn fetch_from_page_cache(
        &mut self,
        index: usize,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut SpanTracker {
        let block_size = size_class::get_size(index);
        let count = size_class::block_count(index);
        let pages = (block_size * count).div_ceil(PAGE_SIZE);

        let span = page_cache.lock().allocate_span(pages);
        if span.is_null() {
            return ptr::null_mut();
        }

        let mut tracker = self.pool.get();
        if tracker.is_null() {
            let page = page_cache.lock().allocate_span(1);
            assert!(
                !page.is_null(),
                "tracker pool exhausted: page cache could not supply a metadata page"
            );
            unsafe { self.pool.grow(page) };
            tracker = self.pool.get();
        }
        unsafe {
            (*tracker).reset(span as usize, pages, count);
            self.reverse.insert(tracker);
        }
        tracker
    }

    /// Evict an all-free tracker: drop its reverse-index entries, recycle
    /// the record, give the span back to the page cache.
    unsafe fn return_to_page_cache(
        &mut self,
        tracker: *mut SpanTracker,
        page_cache: &SpinMutex<PageCache>,
    ) {
        unsafe {
            self.empty_count -= 1;
            self.unlink(tracker);
            self.reverse.remove(tracker);
            let span = (*tracker).span_addr() as *mut u8;
            self.pool.put(tracker);
            page_cache.lock().deallocate_span(span);
        }
    }

    unsafe fn push_front(&mut self, t: *mut SpanTracker) {
        unsafe {
            let old = self.free_list;
            (*t).prev = ptr::null_mut();
            (*t).next = old;
            if !old.is_null() {
                (*old).prev = t;
            }
            self.free_list = t;
        }
    }

    unsafe fn unlink(&mut self, t: *mut SpanTracker) {
        unsafe {
            let prev = (*t).prev;
            let next = (*t).next;
            if prev.is_null() {
                self.free_list = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*t).prev = ptr::null_mut();
            (*t).next = ptr::null_mut();
        }
    }
}

pub struct CentralCache {
    classes: Box<[CacheAligned<SpinMutex<CentralClass>>]>,
}

impl CentralCache {
    pub fn new() -> Self {
        let mut classes = Vec::with_capacity(NUM_CLASSES);
        for index in 0..NUM_CLASSES {
            let reverse = if index < CLS_MEDIUM {
                // A class at the 4 MiB cap holds around a thousand pages.
                ReverseIndex::Pages(HashMap::with_capacity(64))
            } else {
                ReverseIndex::Spans(BTreeMap::new())
            };
            classes.push(CacheAligned(SpinMutex::new(CentralClass {
                free_list: ptr::null_mut(),
                empty_count: 0,
                reverse,
                pool: SpanPool::new(),
            })));
        }
        Self {
            classes: classes.into_boxed_slice(),
        }
    }

    /// Hand out up to `max_batch` blocks of class `index` as a
    /// null-terminated chain in ascending address order. Returns `(0, null)`
    /// for an out-of-range request or when the page cache cannot supply a
    /// fresh span.
    pub fn fetch_range(
        &self,
        index: usize,
        max_batch: usize,
        page_cache: &SpinMutex<PageCache>,
    ) -> (usize, *mut FreeObject) {
        if index >= NUM_CLASSES || max_batch == 0 {
            return (0, ptr::null_mut());
        }
        let mut class = self.classes[index].0.lock();

        if class.free_list.is_null() {
            let tracker = class.fetch_from_page_cache(index, page_cache);
            if tracker.is_null() {
                return (0, ptr::null_mut());
            }
            unsafe { class.push_front(tracker) };
            class.empty_count += 1;
        }

        let tracker = class.free_list;
        // SAFETY: listed trackers are live slab records over live spans.
        unsafe {
            let was_empty = (*tracker).all_free();
            let block_size = size_class::get_size(index);
            let (count, head) = (*tracker).allocate_batch(max_batch, block_size);

            if was_empty && count > 0 {
                class.empty_count -= 1;
            }
            if (*tracker).all_allocated() {
                class.unlink(tracker);
            }
            (count, head)
        }
    }

    /// Take back a chain of blocks, not necessarily from one span, marking
    /// each free in its owning tracker. A tracker that just went all-free is
    /// evicted to the page cache once the class holds more empty spans than
    /// [`max_empty_spans`].
    ///
    /// # Safety
    ///
    /// Every block in the chain must have been produced by
    /// [`fetch_range`](Self::fetch_range) for this same `index` and not
    /// freed since. A block the class does not recognize is fatal.
    pub unsafe fn return_range(
        &self,
        head: *mut FreeObject,
        index: usize,
        page_cache: &SpinMutex<PageCache>,
    ) {
        if head.is_null() || index >= NUM_CLASSES {
            return;
        }
        let block_size = size_class::get_size(index);
        let max_empty = max_empty_spans(index);

        let mut class = self.classes[index].0.lock();
        let mut block = head;
        while !block.is_null() {
            let next = unsafe { (*block).next };
            let addr = block as usize;

            let tracker = unsafe { class.reverse.lookup(addr) };
            assert!(!tracker.is_null(), "freed block belongs to no tracked span");
            unsafe {
                let idx = (addr - (*tracker).span_addr()) / block_size;
                assert!(
                    idx < (*tracker).block_count(),
                    "freed block lies outside its span"
                );

                let was_full = (*tracker).all_allocated();
                let was_empty = (*tracker).all_free();
                (*tracker).set_free(idx);

                if was_full {
                    class.push_front(tracker);
                }
                if !was_empty && (*tracker).all_free() {
                    class.empty_count += 1;
                    if class.empty_count > max_empty {
                        class.return_to_page_cache(tracker, page_cache);
                    }
                }
            }
            block = next;
        }
    }

    /// Number of all-free spans class `index` currently holds.
    pub fn empty_spans(&self, index: usize) -> usize {
        self.classes[index].0.lock().empty_count
    }
}
