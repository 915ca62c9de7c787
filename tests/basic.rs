//! Single-threaded integration tests against the process-wide pool.

use rmempool::{ALIGNMENT, MAX_BYTES, PAGE_SIZE, allocate, deallocate};

unsafe fn fill(ptr: *mut u8, len: usize, byte: u8) {
    unsafe { core::ptr::write_bytes(ptr, byte, len) };
}

unsafe fn verify(ptr: *const u8, len: usize, byte: u8) {
    let slice = unsafe { core::slice::from_raw_parts(ptr, len) };
    assert!(slice.iter().all(|&b| b == byte), "block content clobbered");
}

#[test]
fn test_alloc_write_free_various_sizes() {
    for (i, size) in [1, 8, 16, 17, 100, 512, 513, 1024, 4096, 4097, 65536, 65537, MAX_BYTES]
        .into_iter()
        .enumerate()
    {
        let p = allocate(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGNMENT, 0);
        unsafe {
            fill(p, size, i as u8 + 1);
            verify(p, size, i as u8 + 1);
            deallocate(p, size);
        }
    }
}

#[test]
fn test_zero_size_allocates() {
    let p = allocate(0);
    assert!(!p.is_null());
    assert_eq!(p as usize % ALIGNMENT, 0);
    unsafe { deallocate(p, 0) };
}

#[test]
fn test_null_free_is_noop() {
    unsafe { deallocate(core::ptr::null_mut(), 123) };
}

#[test]
fn test_steady_state_round_trip() {
    // After the first refill, alloc/free of one size keeps recycling the
    // same block from this thread's cache.
    let first = allocate(16);
    assert!(!first.is_null());
    unsafe { deallocate(first, 16) };

    for _ in 0..1000 {
        let p = allocate(16);
        assert_eq!(p, first);
        unsafe { deallocate(p, 16) };
    }
}

#[test]
fn test_outstanding_blocks_do_not_overlap() {
    let size = 48;
    let ptrs: Vec<*mut u8> = (0..4096)
        .map(|i| {
            let p = allocate(size);
            assert!(!p.is_null());
            unsafe { fill(p, size, (i % 251) as u8) };
            p
        })
        .collect();

    // Every block still carries its own pattern: no two overlap.
    for (i, &p) in ptrs.iter().enumerate() {
        unsafe { verify(p, size, (i % 251) as u8) };
    }
    for &p in &ptrs {
        unsafe { deallocate(p, size) };
    }
}

#[test]
fn test_oversize_allocations_are_page_aligned() {
    for _ in 0..10 {
        let p = allocate(1 << 20);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        unsafe {
            fill(p, 1 << 20, 0x5A);
            verify(p, 1 << 20, 0x5A);
            deallocate(p, 1 << 20);
        }
    }

    // One past the tier boundary leaves the class path.
    let p = allocate(MAX_BYTES + 1);
    assert!(!p.is_null());
    assert_eq!(p as usize % PAGE_SIZE, 0);
    unsafe { deallocate(p, MAX_BYTES + 1) };
}

#[test]
fn test_interleaved_sizes_keep_content() {
    let mut live: Vec<(usize, *mut u8, u8)> = Vec::new();
    let mut state = 0x1234_5678_u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let sizes = [16usize, 256, 4096, 65536];

    for op in 0..2000u64 {
        if next() & 1 == 1 && !live.is_empty() {
            let i = next() as usize % live.len();
            let (size, p, tag) = live.swap_remove(i);
            unsafe {
                verify(p, size, tag);
                deallocate(p, size);
            }
        } else {
            let size = sizes[next() as usize % sizes.len()];
            let p = allocate(size);
            assert!(!p.is_null());
            let tag = (op % 249) as u8 + 1;
            unsafe { fill(p, size, tag) };
            live.push((size, p, tag));
        }
    }
    for (size, p, tag) in live {
        unsafe {
            verify(p, size, tag);
            deallocate(p, size);
        }
    }
}

#[test]
fn test_alloc_free_cycles_settle() {
    // Repeated one-shot cycles must not keep acquiring new spans: the block
    // address set stays small and repeats.
    let mut seen = std::collections::HashSet::new();
    for _ in 0..10_000 {
        let p = allocate(128);
        assert!(!p.is_null());
        seen.insert(p as usize);
        unsafe { deallocate(p, 128) };
    }
    assert!(seen.len() <= 64, "steady state should recycle blocks");
}
