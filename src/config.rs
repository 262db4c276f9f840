//! Allocator geometry and policy constants

/// Page size (4KB on every target we care about)
pub const PAGE_SIZE: usize = 4096;

/// log2 of the page size
pub const PAGE_BITS: usize = 12;

/// Pageblock headers are padded to this boundary so the object pool
/// starts on its own pair of cache lines.
pub const CACHE_LINE_SIZE: usize = 128;

/// Superpage size. Must be a power-of-two multiple of the page size.
pub const SUPERPAGE_SIZE: usize = 4 * 1024 * 1024;

/// Number of pages managed by one superpage
pub const PAGES_PER_SUPERPAGE: usize = SUPERPAGE_SIZE / PAGE_SIZE;

/// Highest buddy order; a chunk of this order spans the whole superpage
pub const TOP_ORDER: usize = PAGES_PER_SUPERPAGE.trailing_zeros() as usize;

/// Number of buddy orders (0..=TOP_ORDER)
pub const BUDDY_ORDERS: usize = TOP_ORDER + 1;

/// Sentinel for "no free chunk at any order"
pub const NO_FREE_ORDER: u16 = BUDDY_ORDERS as u16;

/// Minimum object granularity; slots store a 2-byte freelist link so this
/// must stay at least pointer-word sized for alignment guarantees.
pub const OBJECT_GRANULARITY: usize = 8;

/// Largest object served from a pageblock. Anything bigger goes to a
/// superpage chunk (medium) or straight to the page provider (large).
pub const MAX_SMALL_SIZE: usize = PAGE_SIZE / 2;

/// Smallest pageblock (power-of-two)
pub const MIN_PAGEBLOCK: usize = 4 * PAGE_SIZE;

/// Largest pageblock (power-of-two)
pub const MAX_PAGEBLOCK: usize = 64 * PAGE_SIZE;

/// Number of distinct pageblock sizes
pub const PAGEBLOCK_SIZE_CLASSES: usize =
    (MAX_PAGEBLOCK / MIN_PAGEBLOCK).trailing_zeros() as usize + 1;

/// Target object count when sizing a fresh pageblock
pub const OBJECTS_PER_PAGEBLOCK: usize = 1024;

/// Per-thread inactive pageblock cache capacity, per pageblock size
pub const MAX_PRIVATE_INACTIVE: usize = 4;

/// Global free pageblock list capacity, per pageblock size. Beyond this
/// a fully free pageblock's chunk goes back to its superpage.
pub const MAX_GLOBAL_FREE: usize = 32;

/// Reserved owner id for pageblocks whose owning thread has exited.
/// Never handed out to a real thread.
pub const ORPHAN: u32 = u32::MAX;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(SUPERPAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_PAGEBLOCK.is_power_of_two());
const _: () = assert!(MAX_PAGEBLOCK.is_power_of_two());
const _: () = assert!(MIN_PAGEBLOCK >= PAGE_SIZE);
const _: () = assert!(MAX_PAGEBLOCK <= SUPERPAGE_SIZE);
const _: () = assert!(1 << TOP_ORDER == PAGES_PER_SUPERPAGE);
const _: () = assert!(MAX_SMALL_SIZE.is_power_of_two());
const _: () = assert!(OBJECT_GRANULARITY >= core::mem::size_of::<u16>());

/// Pageblock size in bytes for a pageblock size class index
pub const fn pageblock_class_bytes(size_index: usize) -> usize {
    MIN_PAGEBLOCK << size_index
}

/// Pageblock size class index for a pageblock of `bytes` total
pub const fn pageblock_size_index(bytes: usize) -> usize {
    (bytes / MIN_PAGEBLOCK).trailing_zeros() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pageblock_size_index_roundtrip() {
        for i in 0..PAGEBLOCK_SIZE_CLASSES {
            assert_eq!(pageblock_size_index(pageblock_class_bytes(i)), i);
        }
        assert_eq!(pageblock_size_index(MIN_PAGEBLOCK), 0);
        assert_eq!(pageblock_size_index(MAX_PAGEBLOCK), PAGEBLOCK_SIZE_CLASSES - 1);
    }

    #[test]
    fn test_geometry() {
        assert_eq!(PAGES_PER_SUPERPAGE, 1024);
        assert_eq!(TOP_ORDER, 10);
        assert_eq!(PAGEBLOCK_SIZE_CLASSES, 5);
    }
}
