//! Pageblock layer
//!
//! A pageblock is a power-of-two run of pages carved from a superpage and
//! dedicated to one object size. Its header sits at the start of the chunk;
//! the rest is an array of equal slots addressed by one-based indices that
//! double as freelist links threaded through each slot's first two bytes.
//!
//! Every slot is in exactly one of four places: handed out, on the owner's
//! local freed list, on the remote garbage stack, or in the never-used
//! tail. Only the owning thread touches the plain header fields; foreign
//! threads interact solely through `together`, a single word packing the
//! owner id with the garbage stack head so both move under one CAS.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{CACHE_LINE_SIZE, ORPHAN};
use crate::list::ListNode;
use crate::size_class::classify;
use crate::superpage::Superpage;

/// Header area reserved at the start of each chunk
pub const PAGEBLOCK_HEADER: usize = CACHE_LINE_SIZE;

/// Garbage stack head: one-based index of the top slot plus the number of
/// slots currently threaded on the stack. The count both sizes the splice
/// at collection time and versions the word against ABA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GarbageHead {
    next: u16,
    count: u16,
}

const EMPTY: GarbageHead = GarbageHead { next: 0, count: 0 };

#[inline]
fn pack(owner: u32, head: GarbageHead) -> u64 {
    (owner as u64) << 32 | (head.next as u64) << 16 | head.count as u64
}

#[inline]
fn unpack(word: u64) -> (u32, GarbageHead) {
    (
        (word >> 32) as u32,
        GarbageHead {
            next: (word >> 16) as u16,
            count: word as u16,
        },
    )
}

#[repr(C)]
pub struct Pageblock {
    /// Superpage back-pointer; must stay the first field, the chunk
    /// free-list layout in the buddy scheme leaves this word alone.
    sph: *mut Superpage,
    next: *mut Pageblock,
    prev: *mut Pageblock,
    /// One-based index of the first locally recycled slot; 0 = none
    freed: u16,
    /// One-based index of the next never-used slot; 0 = tail exhausted
    unallocated: u16,
    object_size: u32,
    capacity: u32,
    /// Local free slots plus the never-used tail; garbage slots count only
    /// once collected
    free_objects: u32,
    /// Whole chunk size, header included
    chunk_bytes: u32,
    /// Owning thread's heap, for ownership assertions
    owning_heap: *const (),
    /// Packed (owning_thread, garbage head)
    together: AtomicU64,
    mem_pool: *mut u8,
}

const _: () = assert!(core::mem::size_of::<Pageblock>() <= PAGEBLOCK_HEADER);

unsafe impl ListNode for Pageblock {
    unsafe fn next_of(node: *mut Self) -> *mut Self {
        unsafe { (*node).next }
    }
    unsafe fn set_next_of(node: *mut Self, next: *mut Self) {
        unsafe { (*node).next = next }
    }
    unsafe fn prev_of(node: *mut Self) -> *mut Self {
        unsafe { (*node).prev }
    }
    unsafe fn set_prev_of(node: *mut Self, prev: *mut Self) {
        unsafe { (*node).prev = prev }
    }
}

impl Pageblock {
    /// Lay a pageblock header over a fresh chunk.
    ///
    /// # Safety
    /// `pb` must point at the start of an unused chunk of `chunk_bytes`
    /// obtained from `sph`.
    pub unsafe fn init(
        pb: *mut Pageblock,
        sph: *mut Superpage,
        chunk_bytes: usize,
        object_size: usize,
        owner: u32,
        heap: *const (),
    ) {
        let mem_pool = (pb as usize + PAGEBLOCK_HEADER) as *mut u8;
        let capacity = (chunk_bytes - PAGEBLOCK_HEADER) / object_size;
        unsafe {
            pb.write(Pageblock {
                sph,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
                freed: 0,
                unallocated: 1,
                object_size: object_size as u32,
                capacity: capacity as u32,
                free_objects: capacity as u32,
                chunk_bytes: chunk_bytes as u32,
                owning_heap: heap,
                together: AtomicU64::new(pack(owner, EMPTY)),
                mem_pool,
            });
        }
    }

    /// Claim ownership of a pageblock taken off a global list, preserving
    /// any garbage that raced in while it was unowned.
    pub unsafe fn claim(pb: *mut Pageblock, owner: u32, heap: *const ()) {
        unsafe {
            let together = &(*pb).together;
            let mut cur = together.load(Ordering::Acquire);
            loop {
                let (_, head) = unpack(cur);
                match together.compare_exchange_weak(
                    cur,
                    pack(owner, head),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(seen) => cur = seen,
                }
            }
            (*pb).owning_heap = heap;
        }
    }

    /// Reset slot geometry for reuse under a (possibly different) object
    /// size. Only valid on a fully free pageblock.
    pub unsafe fn reset_geometry(pb: *mut Pageblock, object_size: usize) {
        unsafe {
            if (*pb).object_size as usize == object_size {
                return;
            }
            debug_assert_eq!((*pb).free_objects, (*pb).capacity);
            let capacity = ((*pb).chunk_bytes as usize - PAGEBLOCK_HEADER) / object_size;
            (*pb).freed = 0;
            (*pb).unallocated = 1;
            (*pb).object_size = object_size as u32;
            (*pb).capacity = capacity as u32;
            (*pb).free_objects = capacity as u32;
        }
    }

    #[inline]
    unsafe fn slot_ptr(pb: *mut Pageblock, index: u16) -> *mut u8 {
        unsafe {
            (*pb)
                .mem_pool
                .add((index as usize - 1) * (*pb).object_size as usize)
        }
    }

    #[inline]
    unsafe fn slot_index(pb: *mut Pageblock, slot: *mut u8) -> u16 {
        unsafe {
            ((slot as usize - (*pb).mem_pool as usize) / (*pb).object_size as usize + 1) as u16
        }
    }

    #[inline]
    unsafe fn read_link(slot: *mut u8) -> u16 {
        unsafe { (slot as *const u16).read() }
    }

    #[inline]
    unsafe fn write_link(slot: *mut u8, next: u16) {
        unsafe { (slot as *mut u16).write(next) }
    }

    /// Take one slot. The caller must have ensured `free_objects > 0`.
    ///
    /// # Safety
    /// Owner thread only.
    pub unsafe fn acquire_slot(pb: *mut Pageblock) -> *mut u8 {
        unsafe {
            debug_assert!((*pb).free_objects > 0);
            let slot;
            if (*pb).freed != 0 {
                slot = Self::slot_ptr(pb, (*pb).freed);
                (*pb).freed = Self::read_link(slot);
            } else {
                slot = Self::slot_ptr(pb, (*pb).unallocated);
                (*pb).unallocated += 1;
                if (*pb).unallocated as u32 > (*pb).capacity {
                    (*pb).unallocated = 0;
                }
            }
            (*pb).free_objects -= 1;
            slot
        }
    }

    /// Prepend a slot to the local freed list.
    ///
    /// # Safety
    /// Owner thread only; `slot` must be a live slot of this pageblock.
    pub unsafe fn release_local(pb: *mut Pageblock, slot: *mut u8) {
        unsafe {
            Self::write_link(slot, (*pb).freed);
            (*pb).freed = Self::slot_index(pb, slot);
            (*pb).free_objects += 1;
        }
    }

    /// Swap the garbage stack empty and splice the recovered slots onto the
    /// local freed list.
    ///
    /// # Safety
    /// Owner thread only.
    pub unsafe fn collect_garbage(pb: *mut Pageblock) {
        let together = unsafe { &(*pb).together };
        let mut cur = together.load(Ordering::Acquire);
        let head = loop {
            let (owner, head) = unpack(cur);
            if head == EMPTY {
                return;
            }
            match together.compare_exchange_weak(
                cur,
                pack(owner, EMPTY),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break head,
                Err(seen) => cur = seen,
            }
        };

        unsafe {
            if (*pb).freed == 0 {
                (*pb).freed = head.next;
            } else {
                // Walk the recovered chain to its tail and hook the
                // existing freed list behind it. Cold path.
                let mut tail = head.next;
                for _ in 1..head.count {
                    tail = Self::read_link(Self::slot_ptr(pb, tail));
                }
                Self::write_link(Self::slot_ptr(pb, tail), (*pb).freed);
                (*pb).freed = head.next;
            }
            (*pb).free_objects += head.count as u32;
        }
    }

    /// Push a slot onto the garbage stack from a non-owner thread. Returns
    /// false without pushing if the pageblock is observed to be an orphan;
    /// the caller should attempt adoption instead.
    pub unsafe fn release_remote(pb: *mut Pageblock, slot: *mut u8) -> bool {
        let index = unsafe { Self::slot_index(pb, slot) };
        let together = unsafe { &(*pb).together };
        let mut cur = together.load(Ordering::Acquire);
        loop {
            let (owner, head) = unpack(cur);
            if owner == ORPHAN {
                return false;
            }
            unsafe { Self::write_link(slot, head.next) };
            let new = GarbageHead {
                next: index,
                count: head.count + 1,
            };
            match together.compare_exchange_weak(
                cur,
                pack(owner, new),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Garbage push that tolerates any owner, orphans included. Used only
    /// when the freeing thread's heap is already torn down and adoption is
    /// impossible.
    pub unsafe fn release_remote_any(pb: *mut Pageblock, slot: *mut u8) {
        let index = unsafe { Self::slot_index(pb, slot) };
        let together = unsafe { &(*pb).together };
        let mut cur = together.load(Ordering::Acquire);
        loop {
            let (owner, head) = unpack(cur);
            unsafe { Self::write_link(slot, head.next) };
            let new = GarbageHead {
                next: index,
                count: head.count + 1,
            };
            match together.compare_exchange_weak(
                cur,
                pack(owner, new),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Attempt to adopt an orphaned pageblock. Fails if another thread got
    /// there first or the orphan state was never observed.
    pub unsafe fn try_adopt(pb: *mut Pageblock, owner: u32, heap: *const ()) -> bool {
        let together = unsafe { &(*pb).together };
        let mut cur = together.load(Ordering::Acquire);
        loop {
            let (seen_owner, head) = unpack(cur);
            if seen_owner != ORPHAN {
                return false;
            }
            match together.compare_exchange_weak(
                cur,
                pack(owner, head),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    unsafe { (*pb).owning_heap = heap };
                    return true;
                }
                Err(seen) => cur = seen,
            }
        }
    }

    /// One-shot attempt to mark a fully allocated pageblock as orphaned on
    /// thread exit. Fails if a remote free raced in, in which case the
    /// block has garbage and belongs on the global partial list instead.
    pub unsafe fn try_orphan(pb: *mut Pageblock) -> bool {
        let together = unsafe { &(*pb).together };
        let cur = together.load(Ordering::Acquire);
        let (owner, head) = unpack(cur);
        debug_assert_ne!(owner, ORPHAN);
        if head != EMPTY {
            return false;
        }
        together
            .compare_exchange(
                cur,
                pack(ORPHAN, EMPTY),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    pub unsafe fn owner(pb: *mut Pageblock) -> u32 {
        unpack(unsafe { (*pb).together.load(Ordering::Acquire) }).0
    }

    #[inline]
    pub unsafe fn has_garbage(pb: *mut Pageblock) -> bool {
        unpack(unsafe { (*pb).together.load(Ordering::Acquire) }).1 != EMPTY
    }

    #[inline]
    pub unsafe fn free_objects(pb: *mut Pageblock) -> u32 {
        unsafe { (*pb).free_objects }
    }

    #[inline]
    pub unsafe fn is_fully_free(pb: *mut Pageblock) -> bool {
        unsafe { (*pb).free_objects == (*pb).capacity }
    }

    #[inline]
    pub unsafe fn object_size(pb: *mut Pageblock) -> usize {
        unsafe { (*pb).object_size as usize }
    }

    #[inline]
    pub unsafe fn chunk_bytes(pb: *mut Pageblock) -> usize {
        unsafe { (*pb).chunk_bytes as usize }
    }

    #[inline]
    pub unsafe fn superpage(pb: *mut Pageblock) -> *mut Superpage {
        unsafe { (*pb).sph }
    }

    #[inline]
    pub unsafe fn owning_heap(pb: *mut Pageblock) -> *const () {
        unsafe { (*pb).owning_heap }
    }

    /// Size class this pageblock currently serves
    #[inline]
    pub unsafe fn size_class(pb: *mut Pageblock) -> usize {
        classify(unsafe { (*pb).object_size as usize })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_PAGEBLOCK;
    use crate::traits::{page_alloc, page_free};

    fn fresh(object_size: usize) -> *mut Pageblock {
        let chunk = page_alloc(MIN_PAGEBLOCK);
        assert!(!chunk.is_null());
        let pb = chunk.cast::<Pageblock>();
        unsafe {
            Pageblock::init(
                pb,
                core::ptr::null_mut(),
                MIN_PAGEBLOCK,
                object_size,
                7,
                core::ptr::null(),
            )
        };
        pb
    }

    fn teardown(pb: *mut Pageblock) {
        unsafe { page_free(pb.cast(), MIN_PAGEBLOCK) };
    }

    unsafe fn freed_len(pb: *mut Pageblock) -> u32 {
        let mut n = 0;
        let mut idx = unsafe { (*pb).freed };
        while idx != 0 {
            n += 1;
            idx = unsafe { Pageblock::read_link(Pageblock::slot_ptr(pb, idx)) };
        }
        n
    }

    /// in-use + local free + garbage + never-used = capacity
    unsafe fn check_accounting(pb: *mut Pageblock, in_use: u32) {
        unsafe {
            let never_used = if (*pb).unallocated == 0 {
                0
            } else {
                (*pb).capacity - ((*pb).unallocated as u32 - 1)
            };
            let garbage = unpack((*pb).together.load(Ordering::Acquire)).1.count as u32;
            assert_eq!(
                in_use + freed_len(pb) + garbage + never_used,
                (*pb).capacity
            );
            assert_eq!((*pb).free_objects, freed_len(pb) + never_used);
        }
    }

    #[test]
    fn test_lifo_slot_reuse() {
        let pb = fresh(40);
        unsafe {
            let a = Pageblock::acquire_slot(pb);
            let b = Pageblock::acquire_slot(pb);
            assert_eq!(b as usize - a as usize, 40);
            check_accounting(pb, 2);

            Pageblock::release_local(pb, a);
            check_accounting(pb, 1);
            // Most recently freed slot comes back first.
            assert_eq!(Pageblock::acquire_slot(pb), a);
            check_accounting(pb, 2);
        }
        teardown(pb);
    }

    #[test]
    fn test_exhaustion_sets_tail_sentinel() {
        let pb = fresh(512);
        unsafe {
            let capacity = (*pb).capacity;
            for _ in 0..capacity {
                Pageblock::acquire_slot(pb);
            }
            assert_eq!((*pb).unallocated, 0);
            assert_eq!((*pb).free_objects, 0);
            check_accounting(pb, capacity);
        }
        teardown(pb);
    }

    #[test]
    fn test_remote_free_and_collect() {
        let pb = fresh(64);
        unsafe {
            let a = Pageblock::acquire_slot(pb);
            let b = Pageblock::acquire_slot(pb);
            let c = Pageblock::acquire_slot(pb);

            assert!(Pageblock::release_remote(pb, a));
            assert!(Pageblock::release_remote(pb, c));
            assert!(Pageblock::has_garbage(pb));
            check_accounting(pb, 1); // b in use; a, c on garbage

            Pageblock::collect_garbage(pb);
            assert!(!Pageblock::has_garbage(pb));
            check_accounting(pb, 1);

            // Stack order: c was pushed last, comes back first.
            assert_eq!(Pageblock::acquire_slot(pb), c);
            assert_eq!(Pageblock::acquire_slot(pb), a);
            Pageblock::release_local(pb, b);
            check_accounting(pb, 2);
        }
        teardown(pb);
    }

    #[test]
    fn test_collect_splices_behind_local_frees() {
        let pb = fresh(64);
        unsafe {
            let a = Pageblock::acquire_slot(pb);
            let b = Pageblock::acquire_slot(pb);
            let c = Pageblock::acquire_slot(pb);

            Pageblock::release_local(pb, b);
            assert!(Pageblock::release_remote(pb, a));
            assert!(Pageblock::release_remote(pb, c));
            Pageblock::collect_garbage(pb);
            check_accounting(pb, 0);

            // Garbage chain first (LIFO), then the older local free.
            assert_eq!(Pageblock::acquire_slot(pb), c);
            assert_eq!(Pageblock::acquire_slot(pb), a);
            assert_eq!(Pageblock::acquire_slot(pb), b);
        }
        teardown(pb);
    }

    #[test]
    fn test_orphan_adoption() {
        let pb = fresh(24);
        unsafe {
            let capacity = (*pb).capacity;
            let mut slots = Vec::new();
            for _ in 0..capacity {
                slots.push(Pageblock::acquire_slot(pb));
            }
            assert!(Pageblock::try_orphan(pb));
            assert_eq!(Pageblock::owner(pb), ORPHAN);

            // A remote free on an orphan refuses and defers to adoption.
            assert!(!Pageblock::release_remote(pb, slots[0]));
            assert!(Pageblock::try_adopt(pb, 9, core::ptr::null()));
            assert_eq!(Pageblock::owner(pb), 9);
            assert!(!Pageblock::try_adopt(pb, 10, core::ptr::null()));

            // Owned again: remote frees land on the garbage stack.
            assert!(Pageblock::release_remote(pb, slots[0]));
            Pageblock::collect_garbage(pb);
            check_accounting(pb, capacity - 1);
        }
        teardown(pb);
    }

    #[test]
    fn test_orphan_blocked_by_garbage() {
        let pb = fresh(24);
        unsafe {
            let a = Pageblock::acquire_slot(pb);
            let capacity = (*pb).capacity;
            for _ in 1..capacity {
                Pageblock::acquire_slot(pb);
            }
            assert!(Pageblock::release_remote(pb, a));
            // The raced-in garbage blocks orphaning.
            assert!(!Pageblock::try_orphan(pb));
        }
        teardown(pb);
    }

    #[test]
    fn test_reset_geometry_for_new_class() {
        let pb = fresh(8);
        unsafe {
            let old_capacity = (*pb).capacity;
            Pageblock::reset_geometry(pb, 128);
            assert_eq!(Pageblock::object_size(pb), 128);
            assert!((*pb).capacity < old_capacity);
            assert_eq!((*pb).free_objects, (*pb).capacity);
            assert_eq!((*pb).freed, 0);
            assert_eq!((*pb).unallocated, 1);
            check_accounting(pb, 0);
        }
        teardown(pb);
    }
}
