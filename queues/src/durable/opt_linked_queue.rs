// Durable Michael-Scott queue, linked flavor with optimistic persistence.
// Every logical node is a twin pair: a volatile node in DRAM carrying the
// operational `next`/`pred` links, and a persistent node in PMEM carrying
// `{item, pred, index}`. The enqueue critical path issues no fence-ordered
// flush of its own node; instead the suffix walk of the next successful
// enqueue (or recovery) completes it, and a per-thread pair of detachable
// last-enqueue witnesses, written with non-temporal stores, tells recovery
// where a legal tail may be.
//
// A witness slot is a {ptr, index} pair that cannot be written atomically,
// so both halves carry the thread's current validity bit (bit 0 of the
// pointer, bit 63 of the index). Recovery accepts a slot only when the two
// bits agree; alternating between two slots per thread guarantees at least
// one slot survives any crash untorn.

use std::collections::HashSet;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use log::debug;

use crate::persist::{flush, nt_store8, sfence};
use crate::pool::NodePool;
use crate::{DurableQueue, MAX_THREADS};

const VALID_BIT_IN_PTR: u32 = 0;
const VALID_BIT_IN_INDEX: u32 = 63;

fn zero_bit(value: u64, bit: u32) -> u64 {
    value & !(1u64 << bit)
}

fn apply_bit(value: u64, bit: u32, bit_value: u64) -> u64 {
    zero_bit(value, bit) | (bit_value << bit)
}

fn get_bit(value: u64, bit: u32) -> u64 {
    (value >> bit) & 1
}

// Persistent twin. `pred` forms the durable chain, running tail -> head.
// 32-byte alignment keeps bit 0 of the node address free for the validity
// tag and, for small items, the whole twin inside one cache line.
#[repr(C, align(32))]
struct PersistentNode<T> {
    item: MaybeUninit<T>,
    pred: *mut PersistentNode<T>,
    index: u64,
}

#[repr(C, align(32))]
struct VolatileNode<T> {
    item: MaybeUninit<T>,
    next: AtomicPtr<VolatileNode<T>>,
    pred: AtomicPtr<VolatileNode<T>>,
    index: u64,
    pnode: *mut PersistentNode<T>,
}

// One detachable last-enqueue witness; both fields are tagged with the
// owner thread's validity bit.
#[repr(C)]
struct LastEnqueue {
    ptr: u64,
    index: u64,
}

#[repr(C, align(64))]
struct WitnessPair {
    slots: [LastEnqueue; 2],
}

#[repr(C, align(128))]
struct LocalData<T> {
    node_to_retire: *mut VolatileNode<T>,
    valid_bit: u64,
    cursor: usize,
    witness: WitnessPair,
    // Largest index this thread has observed at the head, written
    // non-temporally before any dequeue may return.
    head_index: u64,
}

#[repr(C)]
pub struct OptLinkedQueue<T: Copy + Send + 'static> {
    head: CachePadded<AtomicPtr<VolatileNode<T>>>,
    tail: CachePadded<AtomicPtr<VolatileNode<T>>>,
    local: *mut LocalData<T>,
    ppool: *mut NodePool<PersistentNode<T>>,
    vpool: *mut NodePool<VolatileNode<T>>,
}

unsafe impl<T: Copy + Send + 'static> Send for OptLinkedQueue<T> {}
unsafe impl<T: Copy + Send + 'static> Sync for OptLinkedQueue<T> {}

impl<T: Copy + Send + 'static> OptLinkedQueue<T> {
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
    /// `pmem` must be a zeroed, 128-byte-aligned persistent region of at
    /// least `shared_size(capacity)` bytes; `vmem` a zeroed, 128-byte-
    /// aligned volatile region of at least `volatile_size(capacity)` bytes.
    /// Both must outlive the queue, and a reopen after a crash must map
    /// `pmem` at the same address.
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
            ptr::addr_of_mut!((*ld).valid_bit).write(1);
            ptr::addr_of_mut!((*ld).cursor).write(0);
            nt_store8(ptr::addr_of_mut!((*ld).witness.slots[0].index), 0);
            nt_store8(ptr::addr_of_mut!((*ld).witness.slots[1].index), 0);
            nt_store8(ptr::addr_of_mut!((*ld).witness.slots[0].ptr), 0);
            nt_store8(ptr::addr_of_mut!((*ld).witness.slots[1].ptr), 0);
            nt_store8(ptr::addr_of_mut!((*ld).head_index), 0);
        }

        // The dummy needs no flush: recovery reconstructs the head from the
        // per-thread witnesses and never reaches it.
        let dummy_pnode = ppool.alloc();
        ptr::addr_of_mut!((*dummy_pnode).pred).write(ptr::null_mut());
        ptr::addr_of_mut!((*dummy_pnode).index).write(0);
        let dummy = vpool.alloc();
        (*dummy).next.store(ptr::null_mut(), Ordering::Relaxed);
        (*dummy).pred.store(ptr::null_mut(), Ordering::Relaxed);
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
                    (*new_node).pred.store(tail, Ordering::Relaxed);
                    ptr::addr_of_mut!((*new_node).index).write((*tail).index + 1);
                    let pnode = (*new_node).pnode;
                    ptr::addr_of_mut!((*pnode).pred).write((*tail).pnode);
                    // The persistent pred must be in place before the index
                    // that makes the twin eligible for a recovery chain.
                    fence(Ordering::Release);
                    ptr::addr_of_mut!((*pnode).index).write((*new_node).index);
                    match (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            let _ = self.tail.compare_exchange(
                                tail,
                                new_node,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                            self.flush_unpersisted_suffix(new_node);
                            self.record_last_enqueue(new_node, tid);
                            sfence();

                            (*new_node).pred.store(ptr::null_mut(), Ordering::Relaxed);
                            return;
                        }
                        Err(actual) => tail_next = actual,
                    }
                }
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

                    (*head_next).pred.store(ptr::null_mut(), Ordering::Relaxed);

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
    /// witnesses. Single-threaded; the volatile arena must be freshly
    /// reset, which this method does itself. Safe to re-run if the machine
    /// dies mid-recovery.
    pub fn recover(&mut self) {
        unsafe {
            for i in 0..MAX_THREADS {
                (*self.local.add(i)).node_to_retire = ptr::null_mut();
            }
            (*self.vpool).reset_empty();
            (*self.ppool).reset_assume_full();

            let head_index = self.max_local_head_index();
            let potential_tails = self.potential_tails(head_index);

            // Tail -> head chain of the first candidate that materializes.
            let mut chain: Vec<*mut PersistentNode<T>> = Vec::new();
            for &(index, pnode) in potential_tails.iter().rev() {
                if self.collect_chain_if_tail(pnode, index, head_index, &mut chain) {
                    break;
                }
            }

            self.retire_non_queue_nodes(&chain, head_index);

            // A fresh dummy, allocated only after the sweep so the sweep
            // cannot retire its persistent twin.
            let dummy_pnode = (*self.ppool).alloc();
            ptr::addr_of_mut!((*dummy_pnode).index).write(head_index);
            let dummy = (*self.vpool).alloc();
            (*dummy).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*dummy).pred.store(ptr::null_mut(), Ordering::Relaxed);
            ptr::addr_of_mut!((*dummy).index).write(head_index);
            ptr::addr_of_mut!((*dummy).pnode).write(dummy_pnode);
            self.head.store(dummy, Ordering::Relaxed);

            self.rebuild_volatile_queue(dummy, &chain);
            self.recover_last_enqueues();
            sfence();

            debug!(
                "opt linked queue recovered, head index {}, {} live nodes",
                head_index,
                chain.len()
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            let head = self.head.load(Ordering::Acquire);
            (*head).next.load(Ordering::Acquire).is_null()
        }
    }

    unsafe fn alloc_node(&self, item: MaybeUninit<T>) -> *mut VolatileNode<T> {
        let pnode = (*self.ppool).alloc();
        ptr::addr_of_mut!((*pnode).item).write(item);
        let node = (*self.vpool).alloc();
        ptr::addr_of_mut!((*node).item).write(item);
        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        ptr::addr_of_mut!((*node).pnode).write(pnode);
        node
    }

    // Flushes the persistent twins of the reverse-reachable suffix whose
    // enqueuers have not yet completed their own persistence.
    unsafe fn flush_unpersisted_suffix(&self, node: *mut VolatileNode<T>) {
        let mut curr = node;
        loop {
            let pred = (*curr).pred.load(Ordering::Acquire);
            if pred.is_null() {
                return;
            }
            flush((*curr).pnode);
            curr = pred;
        }
    }

    unsafe fn record_last_enqueue(&self, node: *mut VolatileNode<T>, tid: usize) {
        let ld = self.local.add(tid);
        let i = (*ld).cursor;
        let slot = ptr::addr_of_mut!((*ld).witness.slots[i]);
        // Pointer before index: were the index to land alone, it could pair
        // with a stale pointer to a reclaimed twin that another thread is
        // already reusing under this very index.
        nt_store8(
            ptr::addr_of_mut!((*slot).ptr),
            apply_bit((*node).pnode as u64, VALID_BIT_IN_PTR, (*ld).valid_bit),
        );
        nt_store8(
            ptr::addr_of_mut!((*slot).index),
            apply_bit((*node).index, VALID_BIT_IN_INDEX, (*ld).valid_bit),
        );
        // The validity bit flips once both slots were written with it.
        (*ld).valid_bit ^= i as u64;
        (*ld).cursor ^= 1;
    }

    unsafe fn reset_last_enqueue(&self, tid: usize) {
        let ld = self.local.add(tid);
        nt_store8(ptr::addr_of_mut!((*ld).witness.slots[0].index), 0);
        nt_store8(ptr::addr_of_mut!((*ld).witness.slots[1].index), 0);
        nt_store8(ptr::addr_of_mut!((*ld).witness.slots[0].ptr), 0);
        nt_store8(ptr::addr_of_mut!((*ld).witness.slots[1].ptr), 0);
        (*ld).valid_bit = 1;
        (*ld).cursor = 0;
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

    // Every untorn, non-null witness past the head index, sorted by index
    // ascending.
    unsafe fn potential_tails(&self, head_index: u64) -> Vec<(u64, *mut PersistentNode<T>)> {
        let mut tails = Vec::new();
        for i in 0..MAX_THREADS {
            let ld = self.local.add(i);
            for j in 0..2 {
                let raw_ptr = (*ld).witness.slots[j].ptr;
                let raw_index = (*ld).witness.slots[j].index;
                if get_bit(raw_index, VALID_BIT_IN_INDEX) != get_bit(raw_ptr, VALID_BIT_IN_PTR) {
                    // Torn mid-write; the twin slot covers for it.
                    continue;
                }
                let index = zero_bit(raw_index, VALID_BIT_IN_INDEX);
                let pnode = zero_bit(raw_ptr, VALID_BIT_IN_PTR) as *mut PersistentNode<T>;
                if index <= head_index || pnode.is_null() {
                    continue;
                }
                tails.push((index, pnode));
            }
        }
        tails.sort_unstable_by_key(|t| t.0);
        tails
    }

    // Tries to materialize the queue with `tail` as its last node by
    // walking `pred` down to the node right past the head index. Each hop
    // must decrement the index by exactly one and the candidate must still
    // carry the witnessed index; anything else marks a torn or stale
    // suffix.
    unsafe fn collect_chain_if_tail(
        &self,
        tail: *mut PersistentNode<T>,
        index: u64,
        head_index: u64,
        chain: &mut Vec<*mut PersistentNode<T>>,
    ) -> bool {
        if (*tail).index != index {
            return false;
        }
        let mut curr = tail;
        loop {
            chain.push(curr);
            if (*curr).index == head_index + 1 {
                return true;
            }
            let pred = (*curr).pred;
            if (*pred).index != (*curr).index - 1 {
                chain.clear();
                return false;
            }
            curr = pred;
        }
    }

    unsafe fn retire_non_queue_nodes(
        &self,
        chain: &[*mut PersistentNode<T>],
        head_index: u64,
    ) {
        let queue_nodes: HashSet<*mut PersistentNode<T>> = chain.iter().copied().collect();
        let ppool = &*self.ppool;
        ppool.for_each_slot(|pnode| unsafe {
            if !queue_nodes.contains(&pnode) {
                if (*pnode).index > head_index {
                    ptr::addr_of_mut!((*pnode).index).write(0);
                    flush(pnode);
                }
                ppool.free(pnode);
            }
        });
    }

    // Mirrors the recovered persistent chain (tail -> head order) into
    // fresh volatile twins and rewires Head/Tail.
    unsafe fn rebuild_volatile_queue(
        &self,
        dummy: *mut VolatileNode<T>,
        chain: &[*mut PersistentNode<T>],
    ) {
        let mut volatile_tail: *mut VolatileNode<T> = ptr::null_mut();
        let mut subsequent: *mut VolatileNode<T> = ptr::null_mut();
        for &pnode in chain {
            let node = (*self.vpool).alloc();
            (*node).next.store(subsequent, Ordering::Relaxed);
            (*node).pred.store(ptr::null_mut(), Ordering::Relaxed);
            ptr::addr_of_mut!((*node).item).write(ptr::addr_of!((*pnode).item).read());
            ptr::addr_of_mut!((*node).index).write((*pnode).index);
            ptr::addr_of_mut!((*node).pnode).write(pnode);
            if volatile_tail.is_null() {
                volatile_tail = node;
            }
            subsequent = node;
        }
        if volatile_tail.is_null() {
            volatile_tail = dummy;
        }
        (*dummy).next.store(subsequent, Ordering::Relaxed);
        self.tail.store(volatile_tail, Ordering::Relaxed);
    }

    unsafe fn is_valid_tail(&self, slot: &LastEnqueue) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        zero_bit(slot.index, VALID_BIT_IN_INDEX) == (*tail).index
            && zero_bit(slot.ptr, VALID_BIT_IN_PTR) as *mut PersistentNode<T> == (*tail).pnode
            && zero_bit(slot.index, VALID_BIT_IN_INDEX) > (*head).index
            && get_bit(slot.index, VALID_BIT_IN_INDEX) == get_bit(slot.ptr, VALID_BIT_IN_PTR)
    }

    // Keeps, per thread, at most the witness slot that refers to the
    // recovered tail, and re-arms the cursor and validity bit so the
    // thread's next enqueue atomically supersedes the kept slot.
    unsafe fn recover_last_enqueues(&self) {
        for i in 0..MAX_THREADS {
            let ld = self.local.add(i);
            let slot0 = ptr::addr_of!((*ld).witness.slots[0]).read();
            let slot1 = ptr::addr_of!((*ld).witness.slots[1]).read();
            if !self.is_valid_tail(&slot0) && !self.is_valid_tail(&slot1) {
                self.reset_last_enqueue(i);
            } else if self.is_valid_tail(&slot0) {
                nt_store8(ptr::addr_of_mut!((*ld).witness.slots[1].index), 0);
                nt_store8(ptr::addr_of_mut!((*ld).witness.slots[1].ptr), 0);
                (*ld).cursor = 1;
                // The next write to slot 0 must carry the opposite bit.
                (*ld).valid_bit = get_bit(slot0.index, VALID_BIT_IN_INDEX);
            } else {
                nt_store8(ptr::addr_of_mut!((*ld).witness.slots[0].index), 0);
                nt_store8(ptr::addr_of_mut!((*ld).witness.slots[0].ptr), 0);
                (*ld).cursor = 0;
                (*ld).valid_bit = get_bit(slot1.index, VALID_BIT_IN_INDEX) ^ 1;
            }
        }
    }
}

impl<T: Copy + Send + 'static> DurableQueue<T> for OptLinkedQueue<T> {
    fn enqueue(&self, item: T, tid: usize) {
        OptLinkedQueue::enqueue(self, item, tid)
    }

    fn dequeue(&self, tid: usize) -> Option<T> {
        OptLinkedQueue::dequeue(self, tid)
    }

    fn recover(&mut self) {
        OptLinkedQueue::recover(self)
    }

    fn is_empty(&self) -> bool {
        OptLinkedQueue::is_empty(self)
    }
}
