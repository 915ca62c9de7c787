//! OS interface: anonymous page mappings.

use crate::PAGE_SIZE;
use core::ptr;

/// Map `bytes` of anonymous, private, read-write memory.
///
/// `bytes` must be a positive multiple of [`PAGE_SIZE`]. The returned region
/// is page-aligned and zero-filled. Returns null if the OS refuses the
/// mapping.
pub fn map(bytes: usize) -> *mut u8 {
    debug_assert!(bytes > 0 && bytes % PAGE_SIZE == 0);
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

/// Unmap a region previously obtained from [`map`].
///
/// # Safety
///
/// `ptr` and `bytes` must describe exactly a range of pages that is still
/// mapped and no longer referenced.
pub unsafe fn unmap(ptr: *mut u8, bytes: usize) {
    debug_assert!(!ptr.is_null() && bytes % PAGE_SIZE == 0);
    unsafe { libc::munmap(ptr as *mut libc::c_void, bytes) };
}
