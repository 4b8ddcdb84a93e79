// Durable Michael-Scott queue, unlinked flavor with optimistic persistence.
// Twin nodes as in the optimistic linked queue, but the persistent twin
// carries no links at all: just `{item, index, linked}`. The volatile list
// drives the operations; recovery takes the largest head index any thread
// wrote non-temporally, sweeps the persistent arena for witnessed nodes
// past it, and rebuilds the queue by index sort.
//
// An enqueue acknowledges only after flushing its twin's `linked` witness,
// so a surviving index k + 1 vouches for k. Where that vouching was voided
// by a lost writeback, the index sequence has a gap: everything above the
// first gap is unacknowledged and is discarded during recovery.

use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use log::debug;

use crate::persist::{flush, nt_store8, sfence};
use crate::pool::NodePool;
use crate::{DurableQueue, MAX_THREADS};

// `linked` is shared between the owning enqueuer and helpers that persist
// the pending tail before swinging `Tail` past it.
#[repr(C, align(32))]
struct PersistentNode<T> {
    item: MaybeUninit<T>,
    index: u64,
    linked: AtomicBool,
}

impl<T: Copy> PersistentNode<T> {
    unsafe fn initialize(node: *mut Self, item: MaybeUninit<T>) {
        ptr::addr_of_mut!((*node).item).write(item);
        (*node).linked.store(false, Ordering::Relaxed);
        // `linked` must be down before the index is later raised.
        fence(Ordering::Release);
    }
}

#[repr(C, align(32))]
struct VolatileNode<T> {
    item: MaybeUninit<T>,
    index: u64,
    next: AtomicPtr<VolatileNode<T>>,
    pnode: *mut PersistentNode<T>,
}

#[repr(C, align(128))]
struct LocalData<T> {
    node_to_retire: *mut VolatileNode<T>,
    _pad: [u8; 56],
    // Largest index this thread has observed at the head, written
    // non-temporally before any dequeue may return.
    head_index: u64,
}

#[repr(C)]
pub struct OptUnlinkedQueue<T: Copy + Send + 'static> {
    head: CachePadded<AtomicPtr<VolatileNode<T>>>,
    tail: CachePadded<AtomicPtr<VolatileNode<T>>>,
    local: *mut LocalData<T>,
    ppool: *mut NodePool<PersistentNode<T>>,
    vpool: *mut NodePool<VolatileNode<T>>,
}

unsafe impl<T: Copy + Send + 'static> Send for OptUnlinkedQueue<T> {}
unsafe impl<T: Copy + Send + 'static> Sync for OptUnlinkedQueue<T> {}

impl<T: Copy + Send + 'static> OptUnlinkedQueue<T> {
    /// Persistent-region bytes: queue header, per-thread local data, and
    /// the persistent-twin arena.
    pub fn shared_size(capacity: usize) -> usize {
        let queue = (mem::size_of::<Self>() + 127) & !127;
        let local = MAX_THREADS * mem::size_of::<LocalData<T>>();
        queue + local + NodePool::<PersistentNode<T>>::region_size(capacity)
    }

    /// Volatile-region bytes for the volatile-twin arena.
    pub fn volatile_size(capacity: usize) -> usize {
        NodePool::<VolatileNode<T>>::region_size(capacity)
    }

    /// Formats a fresh queue across the two regions.
    ///
    /// # Safety
    /// Same contract as the optimistic linked queue: zeroed, 128-byte-
    /// aligned regions of `shared_size`/`volatile_size` bytes, outliving
    /// the queue, with `pmem` remapped at the same address on reopen.
    pub unsafe fn init_in_shared(
        pmem: *mut u8,
        vmem: *mut u8,
        capacity: usize,
    ) -> &'static mut Self {
        let queue_ptr = pmem as *mut Self;
        let queue_end = (mem::size_of::<Self>() + 127) & !127;
        let local = pmem.add(queue_end) as *mut LocalData<T>;
        let ppool_offset = queue_end + MAX_THREADS * mem::size_of::<LocalData<T>>();
        let ppool = NodePool::<PersistentNode<T>>::init_in_region(pmem.add(ppool_offset), capacity);
        let vpool = NodePool::<VolatileNode<T>>::init_in_region(vmem, capacity);

        for i in 0..MAX_THREADS {
            let ld = local.add(i);
            ptr::addr_of_mut!((*ld).node_to_retire).write(ptr::null_mut());
            nt_store8(ptr::addr_of_mut!((*ld).head_index), 0);
        }

        let dummy_pnode = ppool.alloc();
        PersistentNode::initialize(dummy_pnode, MaybeUninit::uninit());
        ptr::addr_of_mut!((*dummy_pnode).index).write(0);
        let dummy = vpool.alloc();
        (*dummy).next.store(ptr::null_mut(), Ordering::Relaxed);
        ptr::addr_of_mut!((*dummy).index).write(0);
        ptr::addr_of_mut!((*dummy).pnode).write(dummy_pnode);

        ptr::write(
            queue_ptr,
            Self {
                head: CachePadded::new(AtomicPtr::new(dummy)),
                tail: CachePadded::new(AtomicPtr::new(dummy)),
                local,
                ppool: ppool as *mut _,
                vpool: vpool as *mut _,
            },
        );
        sfence();

        &mut *queue_ptr
    }

    pub fn enqueue(&self, item: T, tid: usize) {
        debug_assert!(tid < MAX_THREADS);
        unsafe {
            let new_node = self.alloc_node(MaybeUninit::new(item));
            loop {
                let tail = self.tail.load(Ordering::Acquire);
                let mut tail_next = (*tail).next.load(Ordering::Acquire);
                if tail_next.is_null() {
                    let pnode = (*new_node).pnode;
                    ptr::addr_of_mut!((*pnode).index).write((*tail).index + 1);
                    ptr::addr_of_mut!((*new_node).index).write((*pnode).index);
                    match (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.persist_pending(new_node);
                            let _ = self.tail.compare_exchange(
                                tail,
                                new_node,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                            return;
                        }
                        Err(actual) => tail_next = actual,
                    }
                }
                self.persist_pending(tail_next);
                let _ = self
                    .tail
                    .compare_exchange(tail, tail_next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    pub fn dequeue(&self, tid: usize) -> Option<T> {
        debug_assert!(tid < MAX_THREADS);
        unsafe {
            loop {
                let head = self.head.load(Ordering::Acquire);
                let head_next = (*head).next.load(Ordering::Acquire);
                if head_next.is_null() {
                    let ld = self.local.add(tid);
                    nt_store8(ptr::addr_of_mut!((*ld).head_index), (*head).index);
                    sfence();
                    return None;
                }
                if self
                    .head
                    .compare_exchange(head, head_next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let item = (*head_next).item.assume_init_read();
                    let ld = self.local.add(tid);
                    nt_store8(ptr::addr_of_mut!((*ld).head_index), (*head_next).index);
                    sfence();

                    let retire = (*ld).node_to_retire;
                    if !retire.is_null() {
                        (*self.ppool).free((*retire).pnode);
                        (*self.vpool).free(retire);
                    }
                    (*ld).node_to_retire = head;

                    return Some(item);
                }
            }
        }
    }

    /// Rebuilds the queue from the persistent twins and the per-thread
    /// head-index witnesses. Single-threaded; resets the volatile arena
    /// itself. Safe to re-run if the machine dies mid-recovery.
    pub fn recover(&mut self) {
        unsafe {
            for i in 0..MAX_THREADS {
                (*self.local.add(i)).node_to_retire = ptr::null_mut();
            }
            (*self.vpool).reset_empty();
            (*self.ppool).reset_assume_full();

            let head_index = self.max_local_head_index();

            let ppool = &*self.ppool;
            let mut survivors: Vec<*mut PersistentNode<T>> = Vec::new();
            ppool.for_each_slot(|pnode| unsafe {
                if (*pnode).linked.load(Ordering::Relaxed) && (*pnode).index > head_index {
                    survivors.push(pnode);
                } else {
                    ppool.free(pnode);
                }
            });
            survivors.sort_unstable_by_key(|&pnode| unsafe { (*pnode).index });

            // Keep only the contiguous run starting right past the head
            // index. An enqueue acknowledges after its witness is durable,
            // so everything above the first missing index was still in
            // flight; clear and free it.
            let mut kept = 0;
            let mut expected = head_index + 1;
            for &pnode in &survivors {
                if (*pnode).index != expected {
                    break;
                }
                kept += 1;
                expected += 1;
            }
            for &pnode in &survivors[kept..] {
                (*pnode).linked.store(false, Ordering::Relaxed);
                flush(pnode);
                ppool.free(pnode);
            }
            survivors.truncate(kept);

            // The dummy is allocated only after the sweep, so the sweep
            // cannot retire its persistent twin.
            let dummy_pnode = ppool.alloc();
            PersistentNode::initialize(dummy_pnode, MaybeUninit::uninit());
            ptr::addr_of_mut!((*dummy_pnode).index).write(head_index);
            let dummy = (*self.vpool).alloc();
            (*dummy).next.store(ptr::null_mut(), Ordering::Relaxed);
            ptr::addr_of_mut!((*dummy).index).write(head_index);
            ptr::addr_of_mut!((*dummy).pnode).write(dummy_pnode);
            self.head.store(dummy, Ordering::Relaxed);

            let mut pred = dummy;
            for &pnode in &survivors {
                let node = (*self.vpool).alloc();
                ptr::addr_of_mut!((*node).item).write(ptr::addr_of!((*pnode).item).read());
                ptr::addr_of_mut!((*node).index).write((*pnode).index);
                ptr::addr_of_mut!((*node).pnode).write(pnode);
                (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                (*pred).next.store(node, Ordering::Relaxed);
                pred = node;
            }
            (*pred).next.store(ptr::null_mut(), Ordering::Relaxed);
            self.tail.store(pred, Ordering::Relaxed);
            sfence();

            debug!(
                "opt unlinked queue recovered, head index {}, {} live nodes",
                head_index,
                survivors.len()
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            let head = self.head.load(Ordering::Acquire);
            (*head).next.load(Ordering::Acquire).is_null()
        }
    }

    // Recovery discards everything above the first index gap on the claim
    // that a surviving k + 1 vouches for k. That claim only holds if no
    // successor can be installed before k's witness is durable, so every
    // tail swing persists the pending node first.
    unsafe fn persist_pending(&self, node: *mut VolatileNode<T>) {
        let pnode = (*node).pnode;
        (*pnode).linked.store(true, Ordering::Release);
        flush(pnode);
        sfence();
    }

    unsafe fn alloc_node(&self, item: MaybeUninit<T>) -> *mut VolatileNode<T> {
        let pnode = (*self.ppool).alloc();
        PersistentNode::initialize(pnode, item);
        let node = (*self.vpool).alloc();
        ptr::addr_of_mut!((*node).item).write(item);
        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        ptr::addr_of_mut!((*node).pnode).write(pnode);
        node
    }

    unsafe fn max_local_head_index(&self) -> u64 {
        let mut head_index = 0;
        for i in 0..MAX_THREADS {
            let observed = (*self.local.add(i)).head_index;
            if observed > head_index {
                head_index = observed;
            }
        }
        head_index
    }
}

impl<T: Copy + Send + 'static> DurableQueue<T> for OptUnlinkedQueue<T> {
    fn enqueue(&self, item: T, tid: usize) {
        OptUnlinkedQueue::enqueue(self, item, tid)
    }

    fn dequeue(&self, tid: usize) -> Option<T> {
        OptUnlinkedQueue::dequeue(self, tid)
    }

    fn recover(&mut self) {
        OptUnlinkedQueue::recover(self)
    }

    fn is_empty(&self) -> bool {
        OptUnlinkedQueue::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    fn new_queue(capacity: usize) -> &'static mut OptUnlinkedQueue<u64> {
        unsafe {
            let pbytes = OptUnlinkedQueue::<u64>::shared_size(capacity);
            let vbytes = OptUnlinkedQueue::<u64>::volatile_size(capacity);
            let pmem = alloc_zeroed(Layout::from_size_align(pbytes, 128).unwrap());
            let vmem = alloc_zeroed(Layout::from_size_align(vbytes, 128).unwrap());
            assert!(!pmem.is_null() && !vmem.is_null());
            OptUnlinkedQueue::init_in_shared(pmem, vmem, capacity)
        }
    }

    // Digs out the persistent twin of the node holding `index`.
    unsafe fn pnode_of(q: &OptUnlinkedQueue<u64>, index: u64) -> *mut PersistentNode<u64> {
        let mut curr = q.head.load(Ordering::Acquire);
        loop {
            assert!(!curr.is_null(), "index {index} not reachable");
            if (*curr).index == index {
                return (*curr).pnode;
            }
            curr = (*curr).next.load(Ordering::Acquire);
        }
    }

    #[test]
    fn lost_middle_witness_truncates_the_suffix() {
        let q = new_queue(256);
        for i in 1..=5u64 {
            q.enqueue(i, 0);
        }
        unsafe {
            // The writeback of index 3's witness never completed; 1 and 2
            // are durable, everything above the gap is unacknowledged.
            let pnode = pnode_of(q, 3);
            (*pnode).linked.store(false, Ordering::Relaxed);
        }
        q.recover();
        assert_eq!(q.dequeue(0), Some(1));
        assert_eq!(q.dequeue(0), Some(2));
        assert_eq!(q.dequeue(0), None);
        // The discarded slots are reusable and the queue keeps going.
        q.enqueue(9, 1);
        assert_eq!(q.dequeue(1), Some(9));
    }

    #[test]
    fn recovery_after_partial_drain_keeps_the_remainder() {
        let q = new_queue(256);
        for i in 1..=4u64 {
            q.enqueue(i, 0);
        }
        assert_eq!(q.dequeue(1), Some(1));
        q.recover();
        for i in 2..=4u64 {
            assert_eq!(q.dequeue(0), Some(i));
        }
        assert_eq!(q.dequeue(0), None);
    }

    #[test]
    fn fully_drained_queue_recovers_empty() {
        let q = new_queue(256);
        for i in 1..=3u64 {
            q.enqueue(i, 0);
        }
        for i in 1..=3u64 {
            assert_eq!(q.dequeue(0), Some(i));
        }
        // Retired twins went back to the arena with `linked` still set;
        // their indices sit at or below the durable head index.
        q.recover();
        assert_eq!(q.dequeue(0), None);
        q.enqueue(4, 0);
        assert_eq!(q.dequeue(0), Some(4));
    }

    #[test]
    fn recovery_is_idempotent() {
        let q = new_queue(256);
        for i in 1..=5u64 {
            q.enqueue(i, 0);
        }
        q.recover();
        q.recover();
        for i in 1..=5u64 {
            assert_eq!(q.dequeue(0), Some(i));
        }
        assert_eq!(q.dequeue(0), None);
    }
}
