// Durable Michael-Scott queue, linked flavor with eager persistence: the
// `next` chain is part of the persistent image, and every mutation is made
// durable before the operation that issued it returns.
//
// Each node carries a transient reverse link `pred`, alive only between the
// CAS that installs the node and the completion of the suffix flush. An
// enqueuer that wins the tail CAS walks `pred` backwards and flushes every
// node it meets, so a stalled predecessor can never leave its own node
// undurable underneath an acknowledged successor. `pred` is cleared
// afterwards, keeping the walked suffix O(1) amortized.

use std::collections::HashSet;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use log::debug;

use crate::persist::{flush, sfence};
use crate::pool::NodePool;
use crate::{DurableQueue, MAX_THREADS};

#[repr(C, align(32))]
struct Node<T> {
    item: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
    pred: AtomicPtr<Node<T>>,
    // Persistent witness that this node belongs to the logical queue. Set
    // after `item`/`next`, cleared before the slot goes back to the arena.
    initialized: bool,
}

impl<T: Copy> Node<T> {
    // Slot bytes may be stale from an earlier life; every field except
    // `pred` is rewritten here, `initialized` last.
    unsafe fn initialize(node: *mut Self, item: MaybeUninit<T>) {
        ptr::addr_of_mut!((*node).item).write(item);
        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        fence(Ordering::Release);
        ptr::addr_of_mut!((*node).initialized).write(true);
    }
}

#[repr(C, align(128))]
struct RetireSlot<T> {
    // Node detached by this thread's most recent successful dequeue,
    // deferred one step so a racing reader cannot meet a reused slot.
    ptr: *mut Node<T>,
}

#[repr(C)]
pub struct LinkedQueue<T: Copy + Send + 'static> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    retire: *mut RetireSlot<T>,
    pool: *mut NodePool<Node<T>>,
}

unsafe impl<T: Copy + Send + 'static> Send for LinkedQueue<T> {}
unsafe impl<T: Copy + Send + 'static> Sync for LinkedQueue<T> {}

impl<T: Copy + Send + 'static> LinkedQueue<T> {
    pub fn shared_size(capacity: usize) -> usize {
        let queue = (mem::size_of::<Self>() + 127) & !127;
        let retire = MAX_THREADS * mem::size_of::<RetireSlot<T>>();
        queue + retire + NodePool::<Node<T>>::region_size(capacity)
    }

    /// Formats a fresh queue into `mem`.
    ///
    /// # Safety
    /// `mem` must be a zeroed, 128-byte-aligned persistent region of at
    /// least `shared_size(capacity)` bytes that outlives the queue.
    /// Reopening after a crash must map the region at the same address.
    pub unsafe fn init_in_shared(mem: *mut u8, capacity: usize) -> &'static mut Self {
        let queue_ptr = mem as *mut Self;
        let queue_end = (mem::size_of::<Self>() + 127) & !127;
        let retire = mem.add(queue_end) as *mut RetireSlot<T>;
        let pool_offset = queue_end + MAX_THREADS * mem::size_of::<RetireSlot<T>>();
        let pool = NodePool::<Node<T>>::init_in_region(mem.add(pool_offset), capacity);

        for i in 0..MAX_THREADS {
            ptr::addr_of_mut!((*retire.add(i)).ptr).write(ptr::null_mut());
        }

        let dummy = pool.alloc();
        Node::initialize(dummy, MaybeUninit::uninit());
        (*dummy).pred.store(ptr::null_mut(), Ordering::Relaxed);

        ptr::write(
            queue_ptr,
            Self {
                head: CachePadded::new(AtomicPtr::new(dummy)),
                tail: CachePadded::new(AtomicPtr::new(dummy)),
                retire,
                pool: pool as *mut _,
            },
        );
        flush(dummy);
        flush(&*(*queue_ptr).head);
        sfence();

        &mut *queue_ptr
    }

    pub fn enqueue(&self, item: T, tid: usize) {
        debug_assert!(tid < MAX_THREADS);
        unsafe {
            let new_node = (*self.pool).alloc();
            Node::initialize(new_node, MaybeUninit::new(item));
            loop {
                let tail = self.tail.load(Ordering::Acquire);
                let mut tail_next = (*tail).next.load(Ordering::Acquire);
                if tail_next.is_null() {
                    (*new_node).pred.store(tail, Ordering::Relaxed);
                    match (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.flush_unpersisted_suffix(new_node);
                            let _ = self.tail.compare_exchange(
                                tail,
                                new_node,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
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
                    // The empty answer is reportable only once the observed
                    // head is durable; otherwise recovery could resurface an
                    // item this caller just denied existed.
                    flush(&*self.head);
                    sfence();
                    return None;
                }
                if self
                    .head
                    .compare_exchange(head, head_next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let item = (*head_next).item.assume_init_read();
                    let slot = self.retire.add(tid);
                    if !(*slot).ptr.is_null() {
                        // Null only before this thread's first successful
                        // dequeue.
                        flush(ptr::addr_of!((*(*slot).ptr).initialized));
                    }
                    flush(&*self.head);
                    sfence();

                    (*head_next).pred.store(ptr::null_mut(), Ordering::Relaxed);

                    if !(*slot).ptr.is_null() {
                        (*self.pool).free((*slot).ptr);
                    }
                    ptr::addr_of_mut!((*head).initialized).write(false);
                    (*slot).ptr = head;

                    return Some(item);
                }
            }
        }
    }

    /// Rebuilds the queue from the persistent image. Single-threaded; safe
    /// to re-run if the machine dies mid-recovery.
    pub fn recover(&mut self) {
        unsafe {
            for i in 0..MAX_THREADS {
                (*self.retire.add(i)).ptr = ptr::null_mut();
            }
            (*self.pool).reset_assume_full();

            let mut queue_nodes: HashSet<*mut Node<T>> = HashSet::new();
            let last = self.collect_queue_nodes(&mut queue_nodes);
            self.retire_non_queue_nodes(&queue_nodes);

            (*last).pred.store(ptr::null_mut(), Ordering::Relaxed);
            self.tail.store(last, Ordering::Release);
            sfence();

            debug!(
                "linked queue recovered, {} nodes incl. dummy",
                queue_nodes.len()
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            let head = self.head.load(Ordering::Acquire);
            (*head).next.load(Ordering::Acquire).is_null()
        }
    }

    // Completes the persistence of the suffix ending at `node`: flushes it
    // and every reverse-reachable predecessor whose own flush may still be
    // in flight.
    unsafe fn flush_unpersisted_suffix(&self, node: *mut Node<T>) {
        let mut curr = node;
        loop {
            flush(curr);
            curr = (*curr).pred.load(Ordering::Acquire);
            if curr.is_null() {
                return;
            }
        }
    }

    // Walks `next` from the head; a node is a queue member iff its
    // `initialized` witness survived. The walk stops at a null successor or
    // truncates at the first allocated-but-unlinked one. Returns the last
    // queue node.
    unsafe fn collect_queue_nodes(
        &self,
        queue_nodes: &mut HashSet<*mut Node<T>>,
    ) -> *mut Node<T> {
        let mut curr = self.head.load(Ordering::Relaxed);
        if !(*curr).initialized {
            // Crash before the freshly formatted dummy became durable.
            Node::initialize(curr, MaybeUninit::uninit());
            queue_nodes.insert(curr);
            return curr;
        }
        loop {
            queue_nodes.insert(curr);
            let next = (*curr).next.load(Ordering::Relaxed);
            if next.is_null() {
                return curr;
            }
            if !(*next).initialized {
                (*curr).next.store(ptr::null_mut(), Ordering::Relaxed);
                flush(curr);
                return curr;
            }
            curr = next;
        }
    }

    // Sweeps the arena: every surviving node outside the recovered set has
    // its witness cleared and durably so, then goes back to the arena.
    unsafe fn retire_non_queue_nodes(&self, queue_nodes: &HashSet<*mut Node<T>>) {
        let pool = &*self.pool;
        pool.for_each_slot(|node| unsafe {
            if !queue_nodes.contains(&node) {
                if (*node).initialized {
                    ptr::addr_of_mut!((*node).initialized).write(false);
                    flush(node);
                }
                pool.free(node);
            }
        });
    }
}

impl<T: Copy + Send + 'static> DurableQueue<T> for LinkedQueue<T> {
    fn enqueue(&self, item: T, tid: usize) {
        LinkedQueue::enqueue(self, item, tid)
    }

    fn dequeue(&self, tid: usize) -> Option<T> {
        LinkedQueue::dequeue(self, tid)
    }

    fn recover(&mut self) {
        LinkedQueue::recover(self)
    }

    fn is_empty(&self) -> bool {
        LinkedQueue::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    fn new_queue(capacity: usize) -> &'static mut LinkedQueue<u64> {
        unsafe {
            let bytes = LinkedQueue::<u64>::shared_size(capacity);
            let mem = alloc_zeroed(Layout::from_size_align(bytes, 128).unwrap());
            assert!(!mem.is_null());
            LinkedQueue::init_in_shared(mem, capacity)
        }
    }

    #[test]
    fn unlinked_successor_is_truncated_on_recovery() {
        let q = new_queue(256);
        q.enqueue(10, 0);
        q.enqueue(20, 0);
        q.enqueue(42, 0);
        unsafe {
            // The last CAS won, but the node's witness never became
            // durable before the crash.
            let tail = q.tail.load(Ordering::Acquire);
            ptr::addr_of_mut!((*tail).initialized).write(false);
        }
        q.recover();
        assert_eq!(q.dequeue(0), Some(10));
        assert_eq!(q.dequeue(0), Some(20));
        assert_eq!(q.dequeue(0), None);
    }

    #[test]
    fn truncated_node_slot_is_reusable() {
        let q = new_queue(256);
        q.enqueue(1, 0);
        q.enqueue(2, 0);
        unsafe {
            let tail = q.tail.load(Ordering::Acquire);
            ptr::addr_of_mut!((*tail).initialized).write(false);
        }
        q.recover();
        // The truncated slot went back to the arena; the queue keeps
        // working and stays FIFO.
        q.enqueue(3, 1);
        assert_eq!(q.dequeue(1), Some(1));
        assert_eq!(q.dequeue(1), Some(3));
        assert_eq!(q.dequeue(1), None);
    }

    #[test]
    fn recovery_is_idempotent() {
        let q = new_queue(256);
        for i in 0..5 {
            q.enqueue(i, 0);
        }
        assert_eq!(q.dequeue(0), Some(0));
        q.recover();
        q.recover();
        for i in 1..5 {
            assert_eq!(q.dequeue(0), Some(i));
        }
        assert_eq!(q.dequeue(0), None);
    }

    #[test]
    fn retired_nodes_cycle_through_the_arena() {
        let q = new_queue(64);
        // Far more operations than slots: dequeued nodes must come back.
        for round in 0..20_000u64 {
            q.enqueue(round, 0);
            assert_eq!(q.dequeue(0), Some(round));
        }
        assert!(q.is_empty());
    }
}
