//! Streambed: a multithreaded, general-purpose memory allocator
//!
//! Replaces the process heap with thread-local size-class arenas backed by
//! per-thread superpage pools.
//!
//! # Design
//!
//! - **Small objects** (up to half a page) are served from *pageblocks*:
//!   power-of-two page runs dedicated to one slot size, owned exclusively
//!   by one thread. Frees from foreign threads land on a per-pageblock
//!   lock-free garbage stack that the owner collects in bulk.
//! - **Medium objects** (up to a superpage) are power-of-two page chunks
//!   carved straight from a superpage by a buddy allocator.
//! - **Large objects** map directly from the page provider.
//!
//! A page-indexed radix tree lets [`release`] find the owning bookkeeping
//! in O(1) without touching the pointer's content. Pageblocks of exited
//! threads are orphaned; any thread that frees into one adopts it with a
//! single compare-and-swap.
//!
//! # Usage
//!
//! ```no_run
//! use streambed::Streambed;
//!
//! #[global_allocator]
//! static ALLOCATOR: Streambed = Streambed;
//! ```
//!
//! Or directly:
//!
//! ```
//! let p = streambed::allocate(100);
//! assert!(unsafe { streambed::usable_size(p) } >= 100);
//! unsafe { streambed::release(p) };
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
mod heap;
mod list;
mod pageblock;
mod radix;
mod size_class;
mod stack;
mod superpage;
pub mod traits;

use core::alloc::{GlobalAlloc, Layout};

pub use error::AllocError;
pub use heap::{aligned_allocate, allocate, reallocate, release, usable_size};
pub use traits::{MmapPages, PageProvider, install_page_provider};

/// Adapter installing the allocator as Rust's global allocator.
///
/// Zero-size requests satisfy the `GlobalAlloc` contract with a dangling,
/// suitably aligned pointer; the core [`allocate`] itself returns null for
/// them.
pub struct Streambed;

unsafe impl GlobalAlloc for Streambed {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        if layout.align() <= config::OBJECT_GRANULARITY {
            allocate(layout.size())
        } else {
            aligned_allocate(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        unsafe { release(ptr) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= config::OBJECT_GRANULARITY {
            unsafe { reallocate(ptr, new_size) }
        } else {
            // Aligned storage may not be preserved by an in-place resize;
            // take the copying path with the alignment re-requested.
            let fresh = aligned_allocate(layout.align(), new_size);
            if !fresh.is_null() && !ptr.is_null() {
                unsafe {
                    let old = usable_size(ptr);
                    core::ptr::copy_nonoverlapping(ptr, fresh, old.min(new_size));
                    release(ptr);
                }
            }
            fresh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_alloc_contract() {
        let a = Streambed;
        unsafe {
            let layout = Layout::from_size_align(48, 16).unwrap();
            let p = a.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);
            a.dealloc(p, layout);

            // Zero-size allocations are dangling but non-null.
            let empty = Layout::from_size_align(0, 32).unwrap();
            let p = a.alloc(empty);
            assert_eq!(p as usize, 32);
            a.dealloc(p, empty);
        }
    }

    #[test]
    fn test_global_realloc_preserves_alignment() {
        let a = Streambed;
        unsafe {
            let layout = Layout::from_size_align(64, 64).unwrap();
            let p = a.alloc(layout);
            assert_eq!(p as usize % 64, 0);
            core::ptr::write_bytes(p, 0x5a, 64);
            let q = a.realloc(p, layout, 1024);
            assert!(!q.is_null());
            assert_eq!(q as usize % 64, 0);
            for i in 0..64 {
                assert_eq!(*q.add(i), 0x5a);
            }
            a.dealloc(q, Layout::from_size_align(1024, 64).unwrap());
        }
    }
}
