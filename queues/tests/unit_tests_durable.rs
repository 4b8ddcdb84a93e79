use durable_queues::{LinkedQueue, OptLinkedQueue, OptUnlinkedQueue, UnlinkedQueue};
use std::sync::{Arc, Barrier};
use std::thread;

const NUM_THREADS: usize = 4;
const ITEMS_PER_THREAD: usize = 1000;
const QUEUE_CAPACITY: usize = 32 * 1024;

fn create_aligned_memory(size: usize) -> *mut u8 {
    use std::alloc::{alloc_zeroed, Layout};

    unsafe {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = alloc_zeroed(layout);
        if ptr.is_null() {
            panic!("Failed to allocate aligned memory");
        }
        ptr
    }
}

fn new_linked() -> &'static mut LinkedQueue<usize> {
    unsafe {
        let mem = create_aligned_memory(LinkedQueue::<usize>::shared_size(QUEUE_CAPACITY));
        LinkedQueue::init_in_shared(mem, QUEUE_CAPACITY)
    }
}

fn new_unlinked() -> &'static mut UnlinkedQueue<usize> {
    unsafe {
        let mem = create_aligned_memory(UnlinkedQueue::<usize>::shared_size(QUEUE_CAPACITY));
        UnlinkedQueue::init_in_shared(mem, QUEUE_CAPACITY)
    }
}

fn new_opt_linked() -> &'static mut OptLinkedQueue<usize> {
    unsafe {
        let pmem = create_aligned_memory(OptLinkedQueue::<usize>::shared_size(QUEUE_CAPACITY));
        let vmem = create_aligned_memory(OptLinkedQueue::<usize>::volatile_size(QUEUE_CAPACITY));
        OptLinkedQueue::init_in_shared(pmem, vmem, QUEUE_CAPACITY)
    }
}

fn new_opt_unlinked() -> &'static mut OptUnlinkedQueue<usize> {
    unsafe {
        let pmem = create_aligned_memory(OptUnlinkedQueue::<usize>::shared_size(QUEUE_CAPACITY));
        let vmem =
            create_aligned_memory(OptUnlinkedQueue::<usize>::volatile_size(QUEUE_CAPACITY));
        OptUnlinkedQueue::init_in_shared(pmem, vmem, QUEUE_CAPACITY)
    }
}

macro_rules! durable_queue_tests {
    ($init:expr, $test_name:ident) => {
        mod $test_name {
            use super::*;

            #[test]
            fn test_single_thread_fifo() {
                let queue = $init;
                assert!(queue.is_empty());
                queue.enqueue(10, 0);
                queue.enqueue(20, 0);
                assert!(!queue.is_empty());
                assert_eq!(queue.dequeue(0), Some(10));
                assert_eq!(queue.dequeue(0), Some(20));
                assert_eq!(queue.dequeue(0), None);
                assert!(queue.is_empty());

                for i in 0..5 {
                    queue.enqueue(i, 0);
                }
                for i in 0..5 {
                    assert_eq!(queue.dequeue(0), Some(i));
                }
                assert_eq!(queue.dequeue(0), None);
            }

            #[test]
            fn test_empty_dequeue_is_stable() {
                let queue = $init;
                for _ in 0..3 {
                    assert_eq!(queue.dequeue(0), None);
                }
                queue.enqueue(1, 0);
                assert_eq!(queue.dequeue(1), Some(1));
                assert_eq!(queue.dequeue(1), None);
            }

            #[test]
            fn test_two_producers_keep_program_order() {
                let queue = Arc::new($init);
                let barrier = Arc::new(Barrier::new(2));

                let mut handles = vec![];
                for tid in 0..2usize {
                    let q = queue.clone();
                    let b = barrier.clone();
                    handles.push(thread::spawn(move || {
                        b.wait();
                        // Producer 0 enqueues 1 then 2; producer 1 enqueues
                        // 3 then 4.
                        q.enqueue(tid * 2 + 1, tid);
                        q.enqueue(tid * 2 + 2, tid);
                    }));
                }
                for handle in handles {
                    handle.join().unwrap();
                }

                let mut drained = Vec::new();
                while let Some(item) = queue.dequeue(2) {
                    drained.push(item);
                }
                assert_eq!(drained.len(), 4);
                let pos = |x: usize| drained.iter().position(|&v| v == x).unwrap();
                assert!(pos(1) < pos(2));
                assert!(pos(3) < pos(4));
            }

            #[test]
            fn test_producers_consumers_drain_everything() {
                let queue = Arc::new($init);
                let barrier = Arc::new(Barrier::new(NUM_THREADS * 2));
                let mut handles = vec![];

                for tid in 0..NUM_THREADS {
                    let q = queue.clone();
                    let b = barrier.clone();
                    handles.push(thread::spawn(move || {
                        b.wait();
                        for i in 0..ITEMS_PER_THREAD {
                            q.enqueue(tid * ITEMS_PER_THREAD + i, tid);
                        }
                        Vec::new()
                    }));
                }

                for tid in 0..NUM_THREADS {
                    let q = queue.clone();
                    let b = barrier.clone();
                    handles.push(thread::spawn(move || {
                        b.wait();
                        let mut items = Vec::new();
                        for _ in 0..ITEMS_PER_THREAD {
                            loop {
                                match q.dequeue(NUM_THREADS + tid) {
                                    Some(item) => {
                                        items.push(item);
                                        break;
                                    }
                                    None => thread::yield_now(),
                                }
                            }
                        }
                        items
                    }));
                }

                let mut all_items = Vec::new();
                for handle in handles {
                    all_items.extend(handle.join().unwrap());
                }

                assert_eq!(all_items.len(), NUM_THREADS * ITEMS_PER_THREAD);
                all_items.sort();
                for (i, &item) in all_items.iter().enumerate() {
                    assert_eq!(item, i);
                }
            }

            #[test]
            fn test_concurrent_enqueues_recover_in_per_thread_order() {
                let queue = $init;
                let queue_ptr: *mut _ = queue;
                let queue: &'static _ = unsafe { &*queue_ptr };
                let barrier = Arc::new(Barrier::new(NUM_THREADS));

                let mut handles = vec![];
                for tid in 0..NUM_THREADS {
                    let b = barrier.clone();
                    handles.push(thread::spawn(move || {
                        b.wait();
                        for i in 0..ITEMS_PER_THREAD {
                            queue.enqueue(tid * ITEMS_PER_THREAD + i, tid);
                        }
                    }));
                }
                for handle in handles {
                    handle.join().unwrap();
                }

                let queue = unsafe { &mut *queue_ptr };
                queue.recover();

                let mut next_expected = vec![0usize; NUM_THREADS];
                let mut drained = 0;
                while let Some(item) = queue.dequeue(0) {
                    let tid = item / ITEMS_PER_THREAD;
                    let seq = item % ITEMS_PER_THREAD;
                    assert_eq!(
                        seq, next_expected[tid],
                        "per-thread order broken across recovery"
                    );
                    next_expected[tid] += 1;
                    drained += 1;
                }
                assert_eq!(drained, NUM_THREADS * ITEMS_PER_THREAD);
            }
        }
    };
}

durable_queue_tests!(new_linked(), linked_queue_tests);
durable_queue_tests!(new_unlinked(), unlinked_queue_tests);
durable_queue_tests!(new_opt_linked(), opt_linked_queue_tests);
durable_queue_tests!(new_opt_unlinked(), opt_unlinked_queue_tests);
