// Durable Michael-Scott queue, unlinked flavor with eager persistence. The
// `next` chain is volatile; what persists per node is a strictly increasing
// logical index plus a `linked` witness, set after the installing CAS and
// flushed before the enqueue returns. Recovery never follows pointers: it
// sweeps the arena, keeps every witnessed node past the durable head index,
// and re-links the survivors in index order behind a fresh dummy.
//
// `Head` is a 16-byte {index, ptr} pair advanced by one double-word CAS, so
// the durable head index can never disagree with the head pointer. The pair
// lives in a `crossbeam` `AtomicCell<u128>`, which compiles to cmpxchg16b
// where the hardware has it.

use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::CachePadded;
use log::debug;

use crate::persist::{flush, sfence};
use crate::pool::NodePool;
use crate::{DurableQueue, MAX_THREADS};

const fn pack_u128(index: u64, ptr: u64) -> u128 {
    ((index as u128) << 64) | ptr as u128
}

const fn unpack_u128(w: u128) -> (u64, u64) {
    ((w >> 64) as u64, w as u64)
}

#[repr(C, align(32))]
struct Node<T> {
    item: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
    // Persistent witness: true once the node was installed by CAS. A slab
    // survivor counts as a queue member iff `linked` is set and its index
    // lies past the durable head index.
    linked: bool,
    index: u64,
}

impl<T: Copy> Node<T> {
    unsafe fn initialize(node: *mut Self, item: MaybeUninit<T>) {
        ptr::addr_of_mut!((*node).item).write(item);
        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        ptr::addr_of_mut!((*node).linked).write(false);
        // `linked` must be down before the index is later raised; a torn
        // cache-line writeback may otherwise pair the old witness with the
        // new index.
        fence(Ordering::Release);
    }
}

#[repr(C, align(128))]
struct RetireSlot<T> {
    ptr: *mut Node<T>,
}

#[repr(C)]
pub struct UnlinkedQueue<T: Copy + Send + 'static> {
    head: CachePadded<AtomicCell<u128>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    retire: *mut RetireSlot<T>,
    pool: *mut NodePool<Node<T>>,
}

unsafe impl<T: Copy + Send + 'static> Send for UnlinkedQueue<T> {}
unsafe impl<T: Copy + Send + 'static> Sync for UnlinkedQueue<T> {}

impl<T: Copy + Send + 'static> UnlinkedQueue<T> {
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
        (*dummy).index = 0;

        ptr::write(
            queue_ptr,
            Self {
                head: CachePadded::new(AtomicCell::new(pack_u128(0, dummy as u64))),
                tail: CachePadded::new(AtomicPtr::new(dummy)),
                retire,
                pool: pool as *mut _,
            },
        );
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
                    (*new_node).index = (*tail).index + 1;
                    match (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            ptr::addr_of_mut!((*new_node).linked).write(true);
                            flush(new_node);
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
                let head = self.head.load();
                let (_, head_ptr) = unpack_u128(head);
                let head_ptr = head_ptr as *mut Node<T>;
                let head_next = (*head_ptr).next.load(Ordering::Acquire);
                if head_next.is_null() {
                    flush(&*self.head);
                    sfence();
                    return None;
                }
                let replacement = pack_u128((*head_next).index, head_next as u64);
                if self.head.compare_exchange(head, replacement).is_ok() {
                    let item = (*head_next).item.assume_init_read();
                    flush(&*self.head);
                    sfence();

                    let slot = self.retire.add(tid);
                    if !(*slot).ptr.is_null() {
                        (*self.pool).free((*slot).ptr);
                    }
                    (*slot).ptr = head_ptr;

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

            let (head_index, _) = unpack_u128(self.head.load());

            let pool = &*self.pool;
            let mut survivors: Vec<*mut Node<T>> = Vec::new();
            pool.for_each_slot(|node| unsafe {
                if (*node).linked && (*node).index > head_index {
                    survivors.push(node);
                } else {
                    pool.free(node);
                }
            });
            survivors.sort_unstable_by_key(|&node| unsafe { (*node).index });

            // The dummy is allocated only after the sweep, so the sweep
            // cannot retire it.
            let dummy = pool.alloc();
            Node::initialize(dummy, MaybeUninit::uninit());
            (*dummy).index = head_index;
            self.head.store(pack_u128(head_index, dummy as u64));

            let mut pred = dummy;
            for &node in &survivors {
                (*pred).next.store(node, Ordering::Relaxed);
                pred = node;
            }
            (*pred).next.store(ptr::null_mut(), Ordering::Relaxed);
            self.tail.store(pred, Ordering::Release);
            sfence();

            debug!(
                "unlinked queue recovered, head index {}, {} live nodes",
                head_index,
                survivors.len()
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            let (_, head_ptr) = unpack_u128(self.head.load());
            (*(head_ptr as *mut Node<T>))
                .next
                .load(Ordering::Acquire)
                .is_null()
        }
    }
}

impl<T: Copy + Send + 'static> DurableQueue<T> for UnlinkedQueue<T> {
    fn enqueue(&self, item: T, tid: usize) {
        UnlinkedQueue::enqueue(self, item, tid)
    }

    fn dequeue(&self, tid: usize) -> Option<T> {
        UnlinkedQueue::dequeue(self, tid)
    }

    fn recover(&mut self) {
        UnlinkedQueue::recover(self)
    }

    fn is_empty(&self) -> bool {
        UnlinkedQueue::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    fn new_queue(capacity: usize) -> &'static mut UnlinkedQueue<u64> {
        unsafe {
            let bytes = UnlinkedQueue::<u64>::shared_size(capacity);
            let mem = alloc_zeroed(Layout::from_size_align(bytes, 128).unwrap());
            assert!(!mem.is_null());
            UnlinkedQueue::init_in_shared(mem, capacity)
        }
    }

    #[test]
    fn head_pair_packs_and_unpacks() {
        let w = pack_u128(7, 0xdead_0000);
        assert_eq!(unpack_u128(w), (7, 0xdead_0000));
    }

    #[test]
    fn lost_linked_witness_drops_the_tail() {
        let q = new_queue(256);
        q.enqueue(1, 0);
        q.enqueue(2, 0);
        q.enqueue(3, 0);
        unsafe {
            // The tail's witness never reached the persistence domain.
            let tail = q.tail.load(Ordering::Acquire);
            ptr::addr_of_mut!((*tail).linked).write(false);
        }
        q.recover();
        assert_eq!(q.dequeue(0), Some(1));
        assert_eq!(q.dequeue(0), Some(2));
        assert_eq!(q.dequeue(0), None);
    }

    #[test]
    fn recovery_relinks_in_index_order() {
        let q = new_queue(256);
        for i in 1..=6u64 {
            q.enqueue(i, 0);
        }
        assert_eq!(q.dequeue(0), Some(1));
        assert_eq!(q.dequeue(0), Some(2));
        q.recover();
        for i in 3..=6u64 {
            assert_eq!(q.dequeue(0), Some(i));
        }
        assert_eq!(q.dequeue(0), None);
    }

    #[test]
    fn freed_slots_with_stale_witness_are_not_resurrected() {
        let q = new_queue(256);
        for i in 1..=4u64 {
            q.enqueue(i, 0);
        }
        for i in 1..=4u64 {
            assert_eq!(q.dequeue(0), Some(i));
        }
        // Dequeued slots went back to the arena with `linked` still set;
        // their indices sit at or below the durable head index.
        q.recover();
        assert_eq!(q.dequeue(0), None);
        q.enqueue(9, 1);
        assert_eq!(q.dequeue(1), Some(9));
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
