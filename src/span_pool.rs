//! Slab pool for allocator metadata records.
//!
//! `Span` and `SpanTracker` records are carved out of whole pages. Each slab
//! page starts with a small header linking it to the previous slab page,
//! followed by a packed array of record slots. Free slots are threaded
//! through their first word, the same trick the block freelists use.
//! Records are never destructed individually; backing pages are released en
//! masse by whoever supplied them.
//!
//! Locking is the caller's job: the page cache's pool is used under the page
//! cache mutex, each central class's pool under that class's spinlock.

use crate::PAGE_SIZE;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr;

/// Bytes reserved at the start of each slab page for the header link.
const HEADER_SIZE: usize = 64;

#[repr(C)]
struct SlabPage {
    next: *mut SlabPage,
}

#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

pub struct SpanPool<T> {
    pages: *mut SlabPage,
    free: *mut FreeSlot,
    _marker: PhantomData<*mut T>,
}

impl<T> SpanPool<T> {
    pub const fn new() -> Self {
        Self {
            pages: ptr::null_mut(),
            free: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// True when [`get`](Self::get) would return null and the pool needs
    /// [`grow`](Self::grow).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free.is_null()
    }

    /// Pop a record slot. The slot's contents are garbage; the caller must
    /// fully initialize the record before use. Returns null when the pool is
    /// dry.
    pub fn get(&mut self) -> *mut T {
        let slot = self.free;
        if !slot.is_null() {
            // SAFETY: every slot on the freelist was carved by grow().
            self.free = unsafe { (*slot).next };
        }
        slot as *mut T
    }

    /// Return a record slot to the pool. The record is not dropped.
    ///
    /// # Safety
    ///
    /// `record` must have come from [`get`](Self::get) on this pool and must
    /// not be referenced afterwards.
    pub unsafe fn put(&mut self, record: *mut T) {
        if record.is_null() {
            return;
        }
        let slot = record as *mut FreeSlot;
        unsafe { (*slot).next = self.free };
        self.free = slot;
    }

    /// Carve a fresh backing page into record slots.
    ///
    /// # Safety
    ///
    /// `page` must point to [`PAGE_SIZE`] bytes of page-aligned writable
    /// memory owned by the caller for the lifetime of this pool.
    pub unsafe fn grow(&mut self, page: *mut u8) {
        const {
            assert!(size_of::<T>() >= size_of::<*mut ()>());
            assert!(align_of::<T>() <= HEADER_SIZE);
            assert!(HEADER_SIZE >= size_of::<SlabPage>());
            assert!(PAGE_SIZE > HEADER_SIZE + size_of::<T>());
        }
        debug_assert!(!page.is_null() && page as usize % PAGE_SIZE == 0);

        let header = page as *mut SlabPage;
        unsafe { (*header).next = self.pages };
        self.pages = header;

        let base = unsafe { page.add(HEADER_SIZE) };
        let count = (PAGE_SIZE - HEADER_SIZE) / size_of::<T>();
        for i in 0..count {
            let slot = unsafe { base.add(i * size_of::<T>()) } as *mut FreeSlot;
            unsafe { (*slot).next = self.free };
            self.free = slot;
        }
    }

    /// Hand every backing page to `release` and reset the pool. All records
    /// become invalid.
    ///
    /// # Safety
    ///
    /// No record obtained from this pool may be referenced afterwards.
    pub unsafe fn release_pages(&mut self, mut release: impl FnMut(*mut u8)) {
        let mut page = self.pages;
        while !page.is_null() {
            let next = unsafe { (*page).next };
            release(page as *mut u8);
            page = next;
        }
        self.pages = ptr::null_mut();
        self.free = ptr::null_mut();
    }
}
