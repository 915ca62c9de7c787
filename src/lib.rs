//! rmempool: a thread-caching memory pool.
//!
//! Implements a three-tier allocation pipeline:
//! - Thread-local freelists (fast path, no locks)
//! - Central per-size-class span cache (per-class spinlock)
//! - Page cache (span split/coalesce, OS interface)
//!
//! The pool is an explicit-size allocator: callers pass the allocation size
//! back to [`deallocate`]. Blocks carry no headers; a freed block's first
//! word threads it into the owning freelist.
//!
//! # Usage
//!
//! ```ignore
//! let p = rmempool::allocate(64);
//! assert!(!p.is_null());
//! unsafe { rmempool::deallocate(p, 64) };
//! ```
//!
//! Internal bookkeeping (span maps, reverse indexes) lives on the normal
//! Rust heap, so this crate layers above the system allocator and must not
//! be registered as `#[global_allocator]`.

pub mod size_class;
pub mod platform;
pub mod sync;
pub mod free_list;
pub mod span_pool;
pub mod page_cache;
pub mod span_tracker;
pub mod central_cache;
pub mod thread_cache;
pub mod allocator;
#[cfg(feature = "ffi")]
pub mod ffi;

/// Page size used by the pool (4 KiB).
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// Re-export the façade and its contract constants at crate root.
pub use allocator::{allocate, deallocate};
pub use size_class::{ALIGNMENT, MAX_BYTES};
