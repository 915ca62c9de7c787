//! Size classes: mapping request sizes onto a dense table of block sizes.
//!
//! The table is piecewise-linear: tight 16-byte spacing where requests are
//! small and dense, coarser steps as sizes grow. Four segments cover
//! (0, 256 KiB]; anything larger bypasses the class tiers entirely and is
//! served as whole pages.

/// Block alignment guaranteed by the pool. Every class size is a multiple,
/// and blocks sit at multiples of their class size inside page-aligned
/// spans, so each block is at least this aligned.
pub const ALIGNMENT: usize = 16;

/// Largest request served through the size-class tiers.
pub const MAX_BYTES: usize = 256 * 1024;

/// Segment upper bounds (inclusive).
pub const MAX_SMALL: usize = 512;
pub const MAX_MEDIUM: usize = 4 * 1024;
pub const MAX_LARGE: usize = 64 * 1024;

const STEP_SMALL: usize = ALIGNMENT;
const STEP_MEDIUM: usize = 64;
const STEP_LARGE: usize = 512;
const STEP_XLARGE: usize = 4096;

const SMALL_CLASSES: usize = MAX_SMALL / STEP_SMALL; // 32
const MEDIUM_CLASSES: usize = (MAX_MEDIUM - MAX_SMALL) / STEP_MEDIUM; // 56
const LARGE_CLASSES: usize = (MAX_LARGE - MAX_MEDIUM) / STEP_LARGE; // 120
const XLARGE_CLASSES: usize = (MAX_BYTES - MAX_LARGE) / STEP_XLARGE; // 48

/// First large-segment index. Below it the central cache indexes spans with
/// one hash entry per page; at or above it, by ordered span start.
pub const CLS_MEDIUM: usize = SMALL_CLASSES + MEDIUM_CLASSES; // 88
const CLS_LARGE: usize = CLS_MEDIUM + LARGE_CLASSES; // 208

/// Total number of size classes.
pub const NUM_CLASSES: usize = CLS_LARGE + XLARGE_CLASSES; // 256

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MAX_SMALL % STEP_SMALL == 0);
const _: () = assert!((MAX_MEDIUM - MAX_SMALL) % STEP_MEDIUM == 0);
const _: () = assert!((MAX_LARGE - MAX_MEDIUM) % STEP_LARGE == 0);
const _: () = assert!((MAX_BYTES - MAX_LARGE) % STEP_XLARGE == 0);

/// Round `bytes` up to the pool alignment.
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Map a request size to its class index.
///
/// `bytes` must be in `1..=MAX_BYTES`; callers route larger requests to the
/// page cache before consulting the table.
#[inline]
pub fn get_index(bytes: usize) -> usize {
    debug_assert!(bytes >= 1 && bytes <= MAX_BYTES);
    if bytes <= MAX_SMALL {
        bytes.div_ceil(STEP_SMALL) - 1
    } else if bytes <= MAX_MEDIUM {
        SMALL_CLASSES + (bytes - MAX_SMALL).div_ceil(STEP_MEDIUM) - 1
    } else if bytes <= MAX_LARGE {
        CLS_MEDIUM + (bytes - MAX_MEDIUM).div_ceil(STEP_LARGE) - 1
    } else {
        CLS_LARGE + (bytes - MAX_LARGE).div_ceil(STEP_XLARGE) - 1
    }
}

/// Block size for a class index; the inverse of [`get_index`].
#[inline]
pub fn get_size(index: usize) -> usize {
    debug_assert!(index < NUM_CLASSES);
    if index < SMALL_CLASSES {
        (index + 1) * STEP_SMALL
    } else if index < CLS_MEDIUM {
        MAX_SMALL + (index - SMALL_CLASSES + 1) * STEP_MEDIUM
    } else if index < CLS_LARGE {
        MAX_MEDIUM + (index - CLS_MEDIUM + 1) * STEP_LARGE
    } else {
        MAX_LARGE + (index - CLS_LARGE + 1) * STEP_XLARGE
    }
}

/// Blocks tracked per span for a class.
///
/// Small and medium classes use the full 1024-bit tracker bitmap. Larger
/// classes carry fewer blocks per span so a single span stays at or under
/// 4 MiB.
#[inline]
pub fn block_count(index: usize) -> usize {
    if index < CLS_MEDIUM {
        1024
    } else if index < CLS_LARGE {
        64
    } else {
        16
    }
}

/// How many blocks the thread cache pulls from the central cache at once.
/// Bigger batches amortize the class lock for small blocks; large blocks
/// move in small batches to bound per-thread pinned memory.
#[inline]
pub fn batch_size(index: usize) -> usize {
    if index < SMALL_CLASSES {
        64
    } else if index < CLS_MEDIUM {
        32
    } else if index < CLS_LARGE {
        16
    } else {
        4
    }
}
