//! Page provider interface
//!
//! The allocator treats the lowest-level source of memory as an opaque
//! collaborator behind a trait, so tests and embedders can substitute
//! their own mapping layer. A process-wide provider is installed once;
//! the default maps anonymous pages with mmap.

use core::ptr::null_mut;

use spin::Once;

use crate::config::PAGE_SIZE;

/// Source and sink of page-aligned virtual ranges.
///
/// `map` must return a page-aligned, zero-initialised range of exactly
/// `bytes` (a page multiple), or null on exhaustion. `unmap` must release
/// the exact range it is given; implementations must accept ranges that
/// are sub-ranges of an earlier `map` (the aligned-allocation path trims
/// head and tail slack off an over-sized mapping).
pub trait PageProvider: Sync {
    fn map(&self, bytes: usize) -> *mut u8;

    /// # Safety
    /// `addr..addr + bytes` must be a mapped range previously obtained from
    /// `map` (or a sub-range of one) with no live allocator data inside it.
    unsafe fn unmap(&self, addr: *mut u8, bytes: usize);
}

/// Default provider over anonymous mmap
pub struct MmapPages;

impl PageProvider for MmapPages {
    fn map(&self, bytes: usize) -> *mut u8 {
        debug_assert!(bytes % PAGE_SIZE == 0);
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::debug!("mmap of {bytes} bytes failed");
            null_mut()
        } else {
            addr.cast()
        }
    }

    unsafe fn unmap(&self, addr: *mut u8, bytes: usize) {
        unsafe { libc::munmap(addr.cast(), bytes) };
    }
}

static DEFAULT_PROVIDER: MmapPages = MmapPages;
static PROVIDER: Once<&'static dyn PageProvider> = Once::new();

/// Install the process-wide page provider.
///
/// Must run before the allocator's first mapping request; once any
/// allocation has happened the provider is fixed. Returns false if a
/// provider (possibly the default) was already in place.
pub fn install_page_provider(provider: &'static dyn PageProvider) -> bool {
    let mut installed = false;
    PROVIDER.call_once(|| {
        installed = true;
        provider
    });
    installed
}

#[inline]
fn provider() -> &'static dyn PageProvider {
    *PROVIDER.call_once(|| &DEFAULT_PROVIDER as &'static dyn PageProvider)
}

/// Map `bytes` of zeroed pages; null on exhaustion.
pub(crate) fn page_alloc(bytes: usize) -> *mut u8 {
    provider().map(bytes)
}

/// Release an exact previously mapped range.
pub(crate) unsafe fn page_free(addr: *mut u8, bytes: usize) {
    unsafe { provider().unmap(addr, bytes) }
}

/// Map `bytes` at an address that is a multiple of `align`, by over-mapping
/// and trimming the slack back to the provider. `bytes` must be a page
/// multiple and `align` a power of two no smaller than the page size.
pub(crate) fn page_alloc_aligned(bytes: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two() && align >= PAGE_SIZE);
    debug_assert!(bytes % PAGE_SIZE == 0);

    let total = match bytes.checked_add(align) {
        Some(t) => t,
        None => return null_mut(),
    };
    let base = page_alloc(total);
    if base.is_null() {
        return null_mut();
    }

    let addr = base as usize;
    let aligned = (addr + align - 1) & !(align - 1);
    let head = aligned - addr;
    let tail = (addr + total) - (aligned + bytes);
    unsafe {
        if head > 0 {
            page_free(base, head);
        }
        if tail > 0 {
            page_free((aligned + bytes) as *mut u8, tail);
        }
    }
    aligned as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmap_roundtrip() {
        let p = MmapPages;
        let addr = p.map(2 * PAGE_SIZE);
        assert!(!addr.is_null());
        assert_eq!(addr as usize % PAGE_SIZE, 0);
        // Anonymous mappings come back zeroed.
        unsafe {
            assert_eq!(*addr, 0);
            assert_eq!(*addr.add(2 * PAGE_SIZE - 1), 0);
            p.unmap(addr, 2 * PAGE_SIZE);
        }
    }

    #[test]
    fn test_aligned_mapping() {
        let addr = page_alloc_aligned(PAGE_SIZE, 1 << 16);
        assert!(!addr.is_null());
        assert_eq!(addr as usize % (1 << 16), 0);
        unsafe { page_free(addr, PAGE_SIZE) };
    }
}
