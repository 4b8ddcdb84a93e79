// Fixed-slot node arena carved out of a caller-supplied memory region.
//
// The arena hands out stable addresses: a freed slot is reused at the same
// address, and a slot's bytes are never touched by the arena itself. All
// free-list bookkeeping lives in a side table in the arena header, so the
// persistence witnesses the queues keep inside node memory survive a
// free/alloc cycle untouched. Recovery resets the volatile header and then
// walks every slot, chunk by chunk, to decide which ones are still live.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Chunk granularity of the slot walk. Each chunk densely packs
/// `CHUNK_SIZE / size_of::<N>()` slots.
pub const CHUNK_SIZE: usize = 64 * 1024;

const HEADER_ALIGN: usize = 128;

// free_head packs [32-bit tag | 32-bit idx+1]; 0 in the low half is the
// empty list. The tag makes the Treiber pop immune to reuse races.
const IDX_MASK: u64 = 0xffff_ffff;

#[repr(C)]
pub struct NodePool<N> {
    slots: *mut N,
    links: *mut AtomicU64,
    free_head: AtomicU64,
    bump: AtomicUsize,
    capacity: usize,
    _marker: PhantomData<N>,
}

unsafe impl<N> Send for NodePool<N> {}
unsafe impl<N> Sync for NodePool<N> {}

impl<N> NodePool<N> {
    pub fn slots_per_chunk() -> usize {
        assert!(mem::size_of::<N>() <= CHUNK_SIZE);
        CHUNK_SIZE / mem::size_of::<N>()
    }

    /// Number of slots actually provisioned for a requested capacity
    /// (rounded up to whole chunks).
    pub fn slot_count(capacity: usize) -> usize {
        let per_chunk = Self::slots_per_chunk();
        capacity.div_ceil(per_chunk) * per_chunk
    }

    /// Bytes of region needed for `capacity` slots, header and side table
    /// included. The region must be at least 128-byte aligned.
    pub fn region_size(capacity: usize) -> usize {
        let cap = Self::slot_count(capacity);
        let header = (mem::size_of::<Self>() + HEADER_ALIGN - 1) & !(HEADER_ALIGN - 1);
        let links = (cap * mem::size_of::<AtomicU64>() + HEADER_ALIGN - 1) & !(HEADER_ALIGN - 1);
        header + links + cap * mem::size_of::<N>()
    }

    /// Formats an arena into `mem`.
    ///
    /// # Safety
    /// `mem` must be a zeroed, 128-byte-aligned region of at least
    /// `region_size(capacity)` bytes, valid for the arena's lifetime. The
    /// queues additionally rely on the zeroing: a never-allocated slot must
    /// read as all-zero bytes.
    pub unsafe fn init_in_region(mem: *mut u8, capacity: usize) -> &'static mut Self {
        let cap = Self::slot_count(capacity);
        assert!(cap > 0 && (cap as u64) < IDX_MASK, "bad arena capacity");
        assert!(mem::align_of::<N>() <= HEADER_ALIGN);

        let header = (mem::size_of::<Self>() + HEADER_ALIGN - 1) & !(HEADER_ALIGN - 1);
        let links_bytes =
            (cap * mem::size_of::<AtomicU64>() + HEADER_ALIGN - 1) & !(HEADER_ALIGN - 1);
        let links = mem.add(header) as *mut AtomicU64;
        let slots = mem.add(header + links_bytes) as *mut N;

        let pool = mem as *mut Self;
        ptr::write(
            pool,
            Self {
                slots,
                links,
                free_head: AtomicU64::new(0),
                bump: AtomicUsize::new(0),
                capacity: cap,
                _marker: PhantomData,
            },
        );
        &mut *pool
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a slot out of the arena. Panics when the arena is exhausted;
    /// sizing the region below the live-node high-water mark is a
    /// programmer error.
    pub unsafe fn alloc(&self) -> *mut N {
        loop {
            if let Some(node) = self.pop_free() {
                return node;
            }
            let idx = self.bump.load(Ordering::Relaxed);
            if idx >= self.capacity {
                if let Some(node) = self.pop_free() {
                    return node;
                }
                panic!("node pool exhausted");
            }
            if self
                .bump
                .compare_exchange_weak(idx, idx + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return self.slots.add(idx);
            }
        }
    }

    unsafe fn pop_free(&self) -> Option<*mut N> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let idx1 = head & IDX_MASK;
            if idx1 == 0 {
                return None;
            }
            let idx = (idx1 - 1) as usize;
            let next = (*self.links.add(idx)).load(Ordering::Relaxed) & IDX_MASK;
            let tagged = ((head >> 32).wrapping_add(1)) << 32 | next;
            if self
                .free_head
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(self.slots.add(idx));
            }
        }
    }

    /// Returns a slot to the arena. The slot's bytes are left untouched.
    pub unsafe fn free(&self, node: *mut N) {
        let idx = usize::try_from(node.offset_from(self.slots)).expect("foreign node freed");
        debug_assert!(idx < self.capacity);
        let link = &*self.links.add(idx);
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            link.store(head & IDX_MASK, Ordering::Relaxed);
            let tagged = ((head >> 32).wrapping_add(1)) << 32 | (idx as u64 + 1);
            if self
                .free_head
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Recovery entry: the volatile header is garbage after a crash, so
    /// treat every slot as allocated. The recovery sweep then frees the
    /// slots that are not part of the rebuilt queue.
    pub unsafe fn reset_assume_full(&self) {
        self.free_head.store(0, Ordering::Relaxed);
        self.bump.store(self.capacity, Ordering::Relaxed);
    }

    /// Recovery entry for the volatile twin arena: everything is reusable.
    pub unsafe fn reset_empty(&self) {
        self.free_head.store(0, Ordering::Relaxed);
        self.bump.store(0, Ordering::Relaxed);
    }

    /// Visits every slot of every chunk. Single-threaded use only.
    pub unsafe fn for_each_slot(&self, mut f: impl FnMut(*mut N)) {
        let per_chunk = Self::slots_per_chunk();
        let chunks = self.capacity / per_chunk;
        for c in 0..chunks {
            let chunk = self.slots.add(c * per_chunk);
            for i in 0..per_chunk {
                f(chunk.add(i));
            }
        }
    }
}
