//! Process-wide façade: wires the three tiers together.
//!
//! The shared tiers live in lazily-initialized statics; each thread gets a
//! cache slot on first use and flushes it back to the central cache when the
//! thread exits. Teardown is best-effort: allocating while the process is
//! tearing down thread-local storage falls back to the central cache.

use crate::central_cache::CentralCache;
use crate::free_list::FreeObject;
use crate::page_cache::PageCache;
use crate::size_class::{self, ALIGNMENT, MAX_BYTES};
use crate::sync::SpinMutex;
use crate::thread_cache::ThreadCache;
use crate::PAGE_SIZE;
use core::cell::UnsafeCell;
use core::ptr;
use std::sync::OnceLock;

// =============================================================================
// Global static state
// =============================================================================

fn page_cache() -> &'static SpinMutex<PageCache> {
    static PAGE_CACHE: OnceLock<SpinMutex<PageCache>> = OnceLock::new();
    PAGE_CACHE.get_or_init(|| SpinMutex::new(PageCache::new()))
}

fn central_cache() -> &'static CentralCache {
    static CENTRAL_CACHE: OnceLock<CentralCache> = OnceLock::new();
    CENTRAL_CACHE.get_or_init(CentralCache::new)
}

// =============================================================================
// Thread-local cache
// =============================================================================

struct CacheSlot(UnsafeCell<ThreadCache>);

impl Drop for CacheSlot {
    fn drop(&mut self) {
        self.0.get_mut().flush(central_cache(), page_cache());
    }
}

thread_local! {
    static THREAD_CACHE: CacheSlot = CacheSlot(UnsafeCell::new(ThreadCache::new()));
}

/// Run `f` against this thread's cache. Returns None while TLS is being
/// constructed or torn down.
#[inline]
fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|slot| {
            // SAFETY: the slot is only ever touched from its owning thread,
            // and nothing in the pool re-enters it.
            unsafe { f(&mut *slot.0.get()) }
        })
        .ok()
}

// =============================================================================
// Public façade
// =============================================================================

/// Allocate `size` bytes.
///
/// The returned pointer is aligned to [`ALIGNMENT`]; requests above
/// [`MAX_BYTES`] bypass the caches and return page-aligned whole pages.
/// Size 0 is promoted to [`ALIGNMENT`]. Returns null when the OS refuses
/// more memory.
pub fn allocate(size: usize) -> *mut u8 {
    if let Some(ptr) = with_thread_cache(|tc| tc.allocate(size, central_cache(), page_cache())) {
        return ptr;
    }
    // TLS slot unavailable (thread teardown): skip the thread tier.
    allocate_direct(size)
}

/// Return a block to the pool.
///
/// Null is a no-op.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] with the same `size` (from any
/// thread) and must not be used afterwards. A mismatched `size` corrupts
/// the pool.
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    let done = with_thread_cache(|tc| unsafe {
        tc.deallocate(ptr, size, central_cache(), page_cache())
    });
    if done.is_none() {
        unsafe { deallocate_direct(ptr, size) };
    }
}

/// Allocate without a thread cache: one block straight from the central
/// cache, or whole pages for large requests.
fn allocate_direct(size: usize) -> *mut u8 {
    let size = if size == 0 { ALIGNMENT } else { size };
    if size > MAX_BYTES {
        return page_cache().lock().allocate_span(size.div_ceil(PAGE_SIZE));
    }
    let index = size_class::get_index(size);
    let (count, head) = central_cache().fetch_range(index, 1, page_cache());
    if count == 0 {
        ptr::null_mut()
    } else {
        head as *mut u8
    }
}

/// Deallocate without a thread cache: a one-block chain straight to the
/// central cache, or whole pages for large requests.
unsafe fn deallocate_direct(ptr: *mut u8, size: usize) {
    let size = if size == 0 { ALIGNMENT } else { size };
    if size > MAX_BYTES {
        unsafe { page_cache().lock().deallocate_span(ptr) };
        return;
    }
    let index = size_class::get_index(size);
    let obj = ptr as *mut FreeObject;
    unsafe {
        (*obj).next = ptr::null_mut();
        central_cache().return_range(obj, index, page_cache());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_aligned() {
        for size in [0, 1, 16, 100, 512, 4096, 65536, MAX_BYTES] {
            let p = allocate(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);
            unsafe { deallocate(p, size) };
        }
    }

    #[test]
    fn test_oversize_is_page_aligned() {
        let p = allocate(MAX_BYTES + 1);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        unsafe { deallocate(p, MAX_BYTES + 1) };

        let p = allocate(1 << 20);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        unsafe { deallocate(p, 1 << 20) };
    }

    #[test]
    fn test_null_deallocate_is_noop() {
        unsafe { deallocate(ptr::null_mut(), 64) };
    }

    #[test]
    fn test_direct_paths_round_trip() {
        // The fallback the façade uses when TLS is gone.
        let p = allocate_direct(64);
        assert!(!p.is_null());
        unsafe { deallocate_direct(p, 64) };

        let p = allocate_direct(MAX_BYTES + 1);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        unsafe { deallocate_direct(p, MAX_BYTES + 1) };
    }

    #[test]
    fn test_thread_exit_flushes_cleanly() {
        let handle = std::thread::spawn(|| {
            let mut ptrs = Vec::new();
            for _ in 0..100 {
                let p = allocate(64);
                assert!(!p.is_null());
                ptrs.push(p);
            }
            for p in ptrs {
                unsafe { deallocate(p, 64) };
            }
            // The thread's cached blocks flush on exit.
        });
        handle.join().unwrap();

        // Blocks freed on a dead thread are visible to a new allocation.
        let p = allocate(64);
        assert!(!p.is_null());
        unsafe { deallocate(p, 64) };
    }
}
