//! Size-class front end and thread lifecycle
//!
//! Each thread owns an array of active pageblock lists indexed by size
//! class, a bounded cache of fully free pageblocks per pageblock size, and
//! a superpage pool. Orphaned pageblocks from exited threads live on global
//! lock-free lists until some thread adopts them. The thread-local heap's
//! drop is the thread finalizer.

use core::cell::{Cell, UnsafeCell};
use core::ptr::null_mut;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{
    CACHE_LINE_SIZE, MAX_GLOBAL_FREE, MAX_PRIVATE_INACTIVE, MAX_SMALL_SIZE, OBJECT_GRANULARITY,
    ORPHAN, PAGEBLOCK_SIZE_CLASSES, PAGE_BITS, PAGE_SIZE, SUPERPAGE_SIZE,
    pageblock_size_index,
};
use crate::error::die;
use crate::list::{DoubleList, ListNode};
use crate::pageblock::Pageblock;
use crate::radix::{self, PageRecord};
use crate::size_class::{
    NUM_SIZE_CLASSES, classify, classify_aligned, pageblock_bytes, representative,
};
use crate::stack::VersionedStack;
use crate::superpage::SuperpagePool;
use crate::traits::{page_alloc, page_alloc_aligned, page_free};

/// Orphaned pageblocks that still hold live objects, by size class
static GLOBAL_PARTIAL: [VersionedStack; NUM_SIZE_CLASSES] =
    [const { VersionedStack::new() }; NUM_SIZE_CLASSES];

/// Fully free pageblocks awaiting reuse by any thread, by pageblock size
static GLOBAL_FREE: [VersionedStack; PAGEBLOCK_SIZE_CLASSES] =
    [const { VersionedStack::new() }; PAGEBLOCK_SIZE_CLASSES];

/// Process-wide thread id source; ids are never reused. The ORPHAN
/// sentinel is unreachable in practice.
static THREAD_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_thread_id() -> u32 {
    let id = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
    if id == ORPHAN {
        die("thread id space exhausted");
    }
    id
}

/// Bounded LIFO of fully free pageblocks, owner-thread only
struct InactiveCache {
    head: *mut Pageblock,
    len: usize,
}

impl InactiveCache {
    const fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
        }
    }

    unsafe fn push(&mut self, pb: *mut Pageblock) {
        unsafe { Pageblock::set_next_of(pb, self.head) };
        self.head = pb;
        self.len += 1;
    }

    fn pop(&mut self) -> *mut Pageblock {
        let pb = self.head;
        if !pb.is_null() {
            self.head = unsafe { Pageblock::next_of(pb) };
            self.len -= 1;
        }
        pb
    }
}

pub struct ThreadHeap {
    active: [DoubleList<Pageblock>; NUM_SIZE_CLASSES],
    inactive: [InactiveCache; PAGEBLOCK_SIZE_CLASSES],
    pool: *mut SuperpagePool,
    tid: u32,
}

impl ThreadHeap {
    fn new() -> Self {
        Self {
            active: [const { DoubleList::new() }; NUM_SIZE_CLASSES],
            inactive: [const { InactiveCache::new() }; PAGEBLOCK_SIZE_CLASSES],
            pool: null_mut(),
            tid: next_thread_id(),
        }
    }

    fn tag(&self) -> *const () {
        self as *const ThreadHeap as *const ()
    }

    /// The thread's superpage pool, created on first use. The record is
    /// leaked on exit so foreign threads can keep locking it.
    fn pool(&mut self) -> *mut SuperpagePool {
        if self.pool.is_null() {
            self.pool = SuperpagePool::create();
        }
        self.pool
    }
}

impl Drop for ThreadHeap {
    fn drop(&mut self) {
        finalize(self);
    }
}

thread_local! {
    static IN_OPERATION: Cell<bool> = const { Cell::new(false) };
    static HEAP: UnsafeCell<ThreadHeap> = UnsafeCell::new(ThreadHeap::new());
}

/// Run `f` against this thread's heap. None when the heap is unreachable:
/// during thread teardown, or re-entrantly (a logger allocating inside an
/// allocator call). Callers degrade to heap-free paths in that case.
fn with_heap<R>(f: impl FnOnce(&mut ThreadHeap) -> R) -> Option<R> {
    let entered = IN_OPERATION
        .try_with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        })
        .unwrap_or(false);
    if !entered {
        return None;
    }
    let result = HEAP.try_with(|cell| f(unsafe { &mut *cell.get() })).ok();
    let _ = IN_OPERATION.try_with(|flag| flag.set(false));
    result
}

fn round_up_pages(bytes: usize) -> Option<usize> {
    bytes
        .checked_add(PAGE_SIZE - 1)
        .map(|b| b & !(PAGE_SIZE - 1))
}

/// Allocate `bytes`; null for zero-size requests and on exhaustion.
pub fn allocate(bytes: usize) -> *mut u8 {
    if bytes == 0 {
        return null_mut();
    }
    if bytes <= MAX_SMALL_SIZE {
        if let Some(slot) = with_heap(|heap| alloc_small(heap, bytes)) {
            return slot;
        }
    } else if bytes <= SUPERPAGE_SIZE {
        if let Some(chunk) = with_heap(|heap| alloc_medium(heap, bytes)) {
            return chunk;
        }
    }
    direct_large_alloc(bytes)
}

fn alloc_small(heap: &mut ThreadHeap, bytes: usize) -> *mut u8 {
    let class = classify(bytes);
    unsafe {
        let mut pb = heap.active[class].head();

        // An exhausted head may have accrued remote frees: collect them,
        // and demote the block if that recovered nothing.
        if !pb.is_null() && Pageblock::free_objects(pb) == 0 {
            Pageblock::collect_garbage(pb);
            if Pageblock::free_objects(pb) == 0 {
                heap.active[class].rotate_back();
            }
        }
        if pb.is_null() || Pageblock::free_objects(pb) == 0 {
            pb = get_free_pageblock(heap, class);
            if pb.is_null() {
                return null_mut();
            }
        }

        debug_assert_eq!(Pageblock::owner(pb), heap.tid);
        debug_assert_eq!(Pageblock::owning_heap(pb), heap.tag());

        let slot = Pageblock::acquire_slot(pb);
        if Pageblock::free_objects(pb) == 0 {
            heap.active[class].rotate_back();
        }
        slot
    }
}

/// Find or make a pageblock with a free object for `class` and put it at
/// the head of the active list. Null on exhaustion.
fn get_free_pageblock(heap: &mut ThreadHeap, class: usize) -> *mut Pageblock {
    let block_bytes = pageblock_bytes(class);
    let size_index = pageblock_size_index(block_bytes);
    unsafe {
        let mut pb = heap.inactive[size_index].pop();
        let mut from_global = false;
        if pb.is_null() {
            pb = GLOBAL_PARTIAL[class].pop();
            if pb.is_null() {
                pb = GLOBAL_FREE[size_index].pop();
            }
            from_global = !pb.is_null();
        }

        if pb.is_null() {
            let pool = heap.pool();
            if pool.is_null() {
                return null_mut();
            }
            let Some((chunk, sph)) = (*pool).supermap(block_bytes) else {
                return null_mut();
            };
            let record = PageRecord::Small {
                pageblock: chunk.cast(),
            };
            if radix::register(chunk, block_bytes >> PAGE_BITS, record).is_err() {
                SuperpagePool::superunmap(sph, chunk, block_bytes);
                return null_mut();
            }
            pb = chunk.cast();
            Pageblock::init(
                pb,
                sph,
                block_bytes,
                representative(class),
                heap.tid,
                heap.tag(),
            );
        } else {
            Pageblock::claim(pb, heap.tid, heap.tag());
            if from_global {
                // Absorb remote frees accrued while the block sat unowned.
                Pageblock::collect_garbage(pb);
            }
            Pageblock::reset_geometry(pb, representative(class));
            debug_assert!(Pageblock::free_objects(pb) > 0);
        }

        heap.active[class].push_front(pb);
        pb
    }
}

fn alloc_medium(heap: &mut ThreadHeap, bytes: usize) -> *mut u8 {
    let chunk_bytes = bytes.next_power_of_two().max(PAGE_SIZE);
    unsafe {
        let pool = heap.pool();
        if pool.is_null() {
            return null_mut();
        }
        let Some((chunk, sph)) = (*pool).supermap(chunk_bytes) else {
            return null_mut();
        };
        let record = PageRecord::Medium {
            header: sph,
            pages_log2: (chunk_bytes >> PAGE_BITS).trailing_zeros(),
        };
        // Only the first page: release() only ever sees the chunk start.
        if radix::register(chunk, 1, record).is_err() {
            SuperpagePool::superunmap(sph, chunk, chunk_bytes);
            return null_mut();
        }
        chunk
    }
}

/// Page-provider-direct allocation. Serves everything past the superpage
/// size, and doubles as the degraded path when the thread heap is
/// unreachable.
fn direct_large_alloc(bytes: usize) -> *mut u8 {
    let Some(map_bytes) = round_up_pages(bytes) else {
        return null_mut();
    };
    let mem = page_alloc(map_bytes);
    if mem.is_null() {
        return null_mut();
    }
    if radix::register(mem, 1, PageRecord::Large { bytes: map_bytes }).is_err() {
        unsafe { page_free(mem, map_bytes) };
        return null_mut();
    }
    mem
}

/// Release a pointer previously returned by this allocator; null is a
/// no-op.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator.
pub unsafe fn release(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match radix::lookup(ptr) {
        Some(PageRecord::Large { bytes }) => unsafe { page_free(ptr, bytes) },
        Some(PageRecord::Medium { header, pages_log2 }) => unsafe {
            SuperpagePool::superunmap(header, ptr, PAGE_SIZE << pages_log2)
        },
        Some(PageRecord::Small { pageblock }) => unsafe { free_small(ptr, pageblock) },
        None => {
            if cfg!(debug_assertions) {
                die("release of a pointer the allocator does not own");
            }
        }
    }
}

unsafe fn free_small(ptr: *mut u8, pb: *mut Pageblock) {
    let handled = with_heap(|heap| unsafe {
        let class = Pageblock::size_class(pb);
        loop {
            let owner = Pageblock::owner(pb);
            if owner == heap.tid {
                local_free(heap, class, pb, ptr);
                return;
            }
            if owner == ORPHAN {
                if Pageblock::try_adopt(pb, heap.tid, heap.tag()) {
                    heap.active[class].push_front(pb);
                    local_free(heap, class, pb, ptr);
                    return;
                }
                // Lost the adoption race; the new parent takes the free.
                continue;
            }
            if Pageblock::release_remote(pb, ptr) {
                return;
            }
            // The owner exited mid-push; retry as adoption.
        }
    });
    if handled.is_none() {
        // Thread teardown: no heap to adopt into, park the slot on the
        // garbage stack for whoever owns or adopts the block next.
        unsafe { Pageblock::release_remote_any(pb, ptr) };
    }
}

unsafe fn local_free(heap: &mut ThreadHeap, class: usize, pb: *mut Pageblock, slot: *mut u8) {
    unsafe {
        Pageblock::release_local(pb, slot);
        if Pageblock::is_fully_free(pb) {
            heap.active[class].remove(pb);
            let size_index = pageblock_size_index(Pageblock::chunk_bytes(pb));
            if heap.inactive[size_index].len < MAX_PRIVATE_INACTIVE {
                heap.inactive[size_index].push(pb);
            } else {
                insert_global_free(pb);
            }
        } else if Pageblock::free_objects(pb) == 1 && heap.active[class].head() != pb {
            // 0 -> 1 transition: promote so the next allocation hits it.
            heap.active[class].remove(pb);
            heap.active[class].push_front(pb);
        }
    }
}

/// Park a fully free pageblock globally, or give its chunk back to the
/// superpage once the global cache is full.
unsafe fn insert_global_free(pb: *mut Pageblock) {
    unsafe {
        let chunk_bytes = Pageblock::chunk_bytes(pb);
        let size_index = pageblock_size_index(chunk_bytes);
        if GLOBAL_FREE[size_index].count() >= MAX_GLOBAL_FREE {
            SuperpagePool::superunmap(Pageblock::superpage(pb), pb.cast(), chunk_bytes);
        } else {
            GLOBAL_FREE[size_index].push(pb);
        }
    }
}

/// Thread finalizer: every pageblock the thread still owns moves to a
/// global list or is orphaned; inactive caches drain to the global free
/// lists. Superpages are left in place, reachable through live pageblocks.
fn finalize(heap: &mut ThreadHeap) {
    unsafe {
        for class in 0..NUM_SIZE_CLASSES {
            let mut pb = heap.active[class].head();
            while !pb.is_null() {
                let next = Pageblock::next_of(pb);
                if Pageblock::is_fully_free(pb) {
                    insert_global_free(pb);
                } else if Pageblock::free_objects(pb) > 0 || Pageblock::has_garbage(pb) {
                    GLOBAL_PARTIAL[class].push(pb);
                } else if !Pageblock::try_orphan(pb) {
                    // A remote free raced the orphan transition in.
                    GLOBAL_PARTIAL[class].push(pb);
                }
                pb = next;
            }
        }
        for size_index in 0..PAGEBLOCK_SIZE_CLASSES {
            loop {
                let pb = heap.inactive[size_index].pop();
                if pb.is_null() {
                    break;
                }
                insert_global_free(pb);
            }
        }
    }
    log::debug!("thread {} heap finalised", heap.tid);
}

/// Usable size of an allocation: the slot, chunk or mapping size backing
/// it. Zero for null or foreign pointers.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    match radix::lookup(ptr) {
        Some(PageRecord::Small { pageblock }) => unsafe { Pageblock::object_size(pageblock) },
        Some(PageRecord::Medium { pages_log2, .. }) => PAGE_SIZE << pages_log2,
        Some(PageRecord::Large { bytes }) => bytes,
        None => 0,
    }
}

/// Resize an allocation, preserving `min(old, new)` bytes. Stays in place
/// whenever the backing storage class would not change.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator.
pub unsafe fn reallocate(ptr: *mut u8, bytes: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(bytes);
    }
    if bytes == 0 {
        unsafe { release(ptr) };
        return null_mut();
    }
    let Some(record) = radix::lookup(ptr) else {
        if cfg!(debug_assertions) {
            die("reallocate of a pointer the allocator does not own");
        }
        return null_mut();
    };

    let old_usable;
    let in_place = match record {
        PageRecord::Small { pageblock } => {
            let old = unsafe { Pageblock::object_size(pageblock) };
            old_usable = old;
            (bytes <= MAX_SMALL_SIZE && classify(bytes) == classify(old))
                || (bytes < old && bytes > old / 2)
        }
        PageRecord::Medium { pages_log2, .. } => {
            old_usable = PAGE_SIZE << pages_log2;
            bytes > MAX_SMALL_SIZE
                && bytes <= SUPERPAGE_SIZE
                && bytes.next_power_of_two().max(PAGE_SIZE) == old_usable
        }
        PageRecord::Large { bytes: old } => {
            old_usable = old;
            round_up_pages(bytes) == Some(old)
        }
    };
    if in_place {
        return ptr;
    }

    let fresh = allocate(bytes);
    if fresh.is_null() {
        return null_mut();
    }
    unsafe {
        core::ptr::copy_nonoverlapping(ptr, fresh, old_usable.min(bytes));
        release(ptr);
    }
    fresh
}

/// Allocate `bytes` at an address that is a multiple of `align`. Null for
/// zero sizes, non-power-of-two alignments, and on exhaustion.
pub fn aligned_allocate(align: usize, bytes: usize) -> *mut u8 {
    if bytes == 0 || !align.is_power_of_two() {
        return null_mut();
    }
    if align <= OBJECT_GRANULARITY {
        return allocate(bytes);
    }
    // Slots sit on multiples of the object size from a 128-aligned pool,
    // so a class whose size is a multiple of the alignment suffices.
    if align <= CACHE_LINE_SIZE {
        if let Some(class) = classify_aligned(bytes, align) {
            return allocate(representative(class));
        }
    }
    // Medium chunks are page-aligned.
    if align <= PAGE_SIZE && bytes <= SUPERPAGE_SIZE {
        if let Some(chunk) = with_heap(|heap| alloc_medium(heap, bytes)) {
            return chunk;
        }
    }
    aligned_large_alloc(align, bytes)
}

/// Over-map and trim so the mapping itself starts on the alignment
/// boundary; the trimmed range is registered and released as a large
/// object.
fn aligned_large_alloc(align: usize, bytes: usize) -> *mut u8 {
    let align = align.max(PAGE_SIZE);
    let Some(map_bytes) = round_up_pages(bytes) else {
        return null_mut();
    };
    let mem = page_alloc_aligned(map_bytes, align);
    if mem.is_null() {
        return null_mut();
    }
    if radix::register(mem, 1, PageRecord::Large { bytes: map_bytes }).is_err() {
        unsafe { page_free(mem, map_bytes) };
        return null_mut();
    }
    mem
}
