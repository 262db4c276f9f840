//! Page-indexed metadata map
//!
//! A three-level radix tree from page number to a tagged record describing
//! how the page's memory is organised: small pages name their pageblock,
//! medium pages name their superpage header and chunk size, large pages
//! carry the mapping's byte length. Lookup is lock-free and read-only after
//! publication; interior nodes are installed with compare-and-swap so
//! racing registrations are harmless.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::config::{PAGE_BITS, PAGE_SIZE};
use crate::error::AllocError;
use crate::pageblock::Pageblock;
use crate::superpage::Superpage;
use crate::traits::{page_alloc, page_free};

/// Bits of a page number
const RADIX_BITS: usize = usize::BITS as usize - PAGE_BITS;
/// Interior levels take the larger share when the split is uneven
const INTERIOR_BITS: usize = RADIX_BITS.div_ceil(3);
const LEAF_BITS: usize = RADIX_BITS - 2 * INTERIOR_BITS;
const INTERIOR_SIZE: usize = 1 << INTERIOR_BITS;
const LEAF_SIZE: usize = 1 << LEAF_BITS;

/// How a page's memory is organised, recorded per page at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRecord {
    /// The page belongs to a pageblock of small objects
    Small { pageblock: *mut Pageblock },
    /// The page starts a medium chunk carved from a superpage
    Medium {
        header: *mut Superpage,
        pages_log2: u32,
    },
    /// The page starts a large mapping obtained straight from the provider
    Large { bytes: usize },
}

const TAG_SMALL: u64 = 1;
const TAG_MEDIUM: u64 = 2;
const TAG_LARGE: u64 = 3;
const TAG_MASK: u64 = 0b11;

/// Medium records steal bits 2..8 for log2(pages); superpage headers are
/// 1024-byte aligned so the pointer's low bits are free.
const MEDIUM_LOG_SHIFT: u64 = 2;
const MEDIUM_LOG_MASK: u64 = 0x3f << MEDIUM_LOG_SHIFT;

fn pack(record: PageRecord) -> u64 {
    match record {
        PageRecord::Small { pageblock } => {
            debug_assert_eq!(pageblock as u64 & TAG_MASK, 0);
            pageblock as u64 | TAG_SMALL
        }
        PageRecord::Medium { header, pages_log2 } => {
            debug_assert_eq!(header as u64 & (MEDIUM_LOG_MASK | TAG_MASK), 0);
            debug_assert!(pages_log2 < 64);
            header as u64 | ((pages_log2 as u64) << MEDIUM_LOG_SHIFT) | TAG_MEDIUM
        }
        PageRecord::Large { bytes } => ((bytes as u64) << 2) | TAG_LARGE,
    }
}

fn unpack(word: u64) -> Option<PageRecord> {
    match word & TAG_MASK {
        TAG_SMALL => Some(PageRecord::Small {
            pageblock: (word & !TAG_MASK) as *mut Pageblock,
        }),
        TAG_MEDIUM => Some(PageRecord::Medium {
            header: (word & !(MEDIUM_LOG_MASK | TAG_MASK)) as *mut Superpage,
            pages_log2: ((word & MEDIUM_LOG_MASK) >> MEDIUM_LOG_SHIFT) as u32,
        }),
        TAG_LARGE => Some(PageRecord::Large {
            bytes: (word >> 2) as usize,
        }),
        _ => None,
    }
}

#[repr(C)]
struct Interior {
    slots: [AtomicPtr<u8>; INTERIOR_SIZE],
}

#[repr(C)]
struct Leaf {
    values: [AtomicU64; LEAF_SIZE],
}

const _: () = assert!(core::mem::size_of::<Interior>() % PAGE_SIZE == 0);
const _: () = assert!(core::mem::size_of::<Leaf>() % PAGE_SIZE == 0);

static ROOT: AtomicPtr<Interior> = AtomicPtr::new(null_mut());

/// Allocate a zeroed node of `bytes`. Fresh provider pages are zeroed, so
/// every slot starts null and every leaf value starts unregistered.
fn node_alloc(bytes: usize) -> *mut u8 {
    page_alloc(bytes)
}

/// Get or CAS-install the child pointer in an interior slot. The loser of
/// an install race frees its node back to the provider.
fn child(slot: &AtomicPtr<u8>, bytes: usize) -> Result<*mut u8, AllocError> {
    let existing = slot.load(Ordering::Acquire);
    if !existing.is_null() {
        return Ok(existing);
    }
    let fresh = node_alloc(bytes);
    if fresh.is_null() {
        return Err(AllocError::OutOfMemory);
    }
    match slot.compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(fresh),
        Err(winner) => {
            unsafe { page_free(fresh, bytes) };
            Ok(winner)
        }
    }
}

fn root() -> Result<*mut Interior, AllocError> {
    let existing = ROOT.load(Ordering::Acquire);
    if !existing.is_null() {
        return Ok(existing);
    }
    let fresh = node_alloc(core::mem::size_of::<Interior>()).cast::<Interior>();
    if fresh.is_null() {
        return Err(AllocError::OutOfMemory);
    }
    match ROOT.compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(fresh),
        Err(winner) => {
            unsafe { page_free(fresh.cast(), core::mem::size_of::<Interior>()) };
            Ok(winner)
        }
    }
}

#[inline]
fn split(page: usize) -> (usize, usize, usize) {
    (
        page >> (INTERIOR_BITS + LEAF_BITS),
        (page >> LEAF_BITS) & (INTERIOR_SIZE - 1),
        page & (LEAF_SIZE - 1),
    )
}

/// Publish `record` under every page of `start..start + num_pages * PAGE`.
///
/// Leaf writes are plain stores: each page has at most one live record at a
/// time, so only node installation needs synchronisation.
pub fn register(start: *mut u8, num_pages: usize, record: PageRecord) -> Result<(), AllocError> {
    let word = pack(record);
    let mut page = start as usize >> PAGE_BITS;
    for _ in 0..num_pages {
        let (l1, l2, l3) = split(page);
        let root = root()?;
        let mid = child(
            unsafe { &(*root).slots[l1] },
            core::mem::size_of::<Interior>(),
        )?
        .cast::<Interior>();
        let leaf = child(
            unsafe { &(*mid).slots[l2] },
            core::mem::size_of::<Leaf>(),
        )?
        .cast::<Leaf>();
        unsafe { (*leaf).values[l3].store(word, Ordering::Release) };
        page += 1;
    }
    Ok(())
}

/// Record for the page containing `addr`, or None if that page was never
/// registered (a contract violation on the free path).
pub fn lookup(addr: *const u8) -> Option<PageRecord> {
    let page = addr as usize >> PAGE_BITS;
    let (l1, l2, l3) = split(page);

    let root = ROOT.load(Ordering::Acquire);
    if root.is_null() {
        return None;
    }
    let mid = unsafe { (*root).slots[l1].load(Ordering::Acquire) }.cast::<Interior>();
    if mid.is_null() {
        return None;
    }
    let leaf = unsafe { (*mid).slots[l2].load(Ordering::Acquire) }.cast::<Leaf>();
    if leaf.is_null() {
        return None;
    }
    unpack(unsafe { (*leaf).values[l3].load(Ordering::Acquire) })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Addresses in a range no other test registers.
    const BASE: usize = 0x6100_0000_0000;

    #[test]
    fn test_pack_unpack() {
        let small = PageRecord::Small {
            pageblock: 0x7f00_dead_d000u64 as *mut Pageblock,
        };
        assert_eq!(unpack(pack(small)), Some(small));

        let medium = PageRecord::Medium {
            header: 0x7f00_0000_ec00u64 as *mut Superpage,
            pages_log2: 6,
        };
        assert_eq!(unpack(pack(medium)), Some(medium));

        let large = PageRecord::Large { bytes: 48 * 1024 * 1024 };
        assert_eq!(unpack(pack(large)), Some(large));

        assert_eq!(unpack(0), None);
    }

    #[test]
    fn test_register_lookup() {
        let start = BASE as *mut u8;
        let record = PageRecord::Small {
            pageblock: BASE as *mut Pageblock,
        };
        register(start, 4, record).unwrap();

        // Every page of the range, and interior addresses, resolve.
        for offset in [0, 1, PAGE_SIZE, 2 * PAGE_SIZE + 77, 4 * PAGE_SIZE - 1] {
            assert_eq!(lookup((BASE + offset) as *const u8), Some(record));
        }
        // The page after the range does not.
        assert_eq!(lookup((BASE + 4 * PAGE_SIZE) as *const u8), None);
    }

    #[test]
    fn test_reregistration_overwrites() {
        let start = (BASE + 0x100_0000) as *mut u8;
        register(start, 1, PageRecord::Large { bytes: PAGE_SIZE }).unwrap();
        let medium = PageRecord::Medium {
            header: (BASE + 0x200_0000) as *mut Superpage,
            pages_log2: 3,
        };
        register(start, 1, medium).unwrap();
        assert_eq!(lookup(start), Some(medium));
    }
}
