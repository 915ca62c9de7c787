//! Thread cache (front-end): per-thread freelists, one per size class.
//!
//! The fast path (pop or push on the owning thread's list) takes no locks.
//! An empty list refills with a batch from the central cache; a list that
//! grows past its byte cap sheds half of itself back. Requests above
//! [`MAX_BYTES`] skip both caches and go straight to the page cache.

use crate::PAGE_SIZE;
use crate::central_cache::CentralCache;
use crate::free_list::{FreeList, FreeObject};
use crate::page_cache::PageCache;
use crate::size_class::{self, ALIGNMENT, MAX_BYTES, NUM_CLASSES};
use crate::sync::SpinMutex;
use core::ptr;

/// Per-class byte cap; past it, half the list goes back to the central
/// cache. Keeping half damps oscillation between push and pull phases.
const PER_INDEX_CAP: usize = 256 * 1024;

pub struct ThreadCache {
    lists: [FreeList; NUM_CLASSES],
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_CLASSES],
        }
    }

    /// Allocate `size` bytes. Zero is promoted to [`ALIGNMENT`]; sizes above
    /// [`MAX_BYTES`] come as whole pages from the page cache. Returns null
    /// when memory is exhausted.
    pub fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        let size = if size == 0 { ALIGNMENT } else { size };
        if size > MAX_BYTES {
            let pages = size.div_ceil(PAGE_SIZE);
            return page_cache.lock().allocate_span(pages);
        }

        let index = size_class::get_index(size);
        let obj = self.lists[index].pop();
        if !obj.is_null() {
            return obj as *mut u8;
        }
        self.fetch_from_central(index, central, page_cache)
    }

    /// Return a block allocated with the same `size`. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`allocate`](Self::allocate) on this pool
    /// (any thread) with the same `size`, and must not be used afterwards.
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) {
        if ptr.is_null() {
            return;
        }
        let size = if size == 0 { ALIGNMENT } else { size };
        if size > MAX_BYTES {
            unsafe { page_cache.lock().deallocate_span(ptr) };
            return;
        }

        let index = size_class::get_index(size);
        unsafe { self.lists[index].push(ptr as *mut FreeObject) };

        if self.lists[index].len() * size_class::get_size(index) > PER_INDEX_CAP {
            unsafe { self.return_to_central(index, central, page_cache) };
        }
    }

    /// Slow path: refill from the central cache. The first block goes to the
    /// caller, the rest of the batch onto the local list.
    #[cold]
    fn fetch_from_central(
        &mut self,
        index: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        let batch = size_class::batch_size(index);
        let (count, head) = central.fetch_range(index, batch, page_cache);
        if count == 0 {
            return ptr::null_mut();
        }
        // SAFETY: fetch_range hands over a well-formed chain of `count`
        // blocks owned by no one else.
        unsafe {
            let rest = (*head).next;
            if count > 1 {
                self.lists[index].push_chain(rest, count - 1);
            }
        }
        head as *mut u8
    }

    /// Keep half the list, hand the rest back as one chain.
    unsafe fn return_to_central(
        &mut self,
        index: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) {
        let keep = (self.lists[index].len() / 2).max(1);
        let (count, head) = self.lists[index].split_off(keep);
        if count > 0 {
            unsafe { central.return_range(head, index, page_cache) };
        }
    }

    /// Return every cached block to the central cache (thread teardown).
    pub fn flush(&mut self, central: &CentralCache, page_cache: &SpinMutex<PageCache>) {
        for index in 0..NUM_CLASSES {
            let (count, head) = self.lists[index].take_all();
            if count > 0 {
                // SAFETY: everything on the list came from fetch_from_central
                // for this index.
                unsafe { central.return_range(head, index, page_cache) };
            }
        }
    }

    #[cfg(test)]
    fn cached(&self, index: usize) -> usize {
        self.lists[index].len()
    }
}
