pub mod durable;
pub mod persist;
pub mod pool;

pub use durable::LinkedQueue;
pub use durable::OptLinkedQueue;
pub use durable::OptUnlinkedQueue;
pub use durable::UnlinkedQueue;

// Upper bound on the thread ids accepted by queue operations. Per-thread
// state is indexed by tid and laid out in the persistent header, so changing
// this is an ABI break for existing regions.
pub const MAX_THREADS: usize = 256;

// Common interface for all durable queues.
//
// Items are treated as value bits: `T: Copy`, and a dequeued slot is never
// dropped.
pub trait DurableQueue<T: Copy + Send>: Send + Sync {
    /// Appends `item` at the tail. Never fails; completes in a bounded
    /// number of CASes as long as other threads make progress.
    fn enqueue(&self, item: T, tid: usize);

    /// Detaches and returns the item at the head, or `None` when the queue
    /// is empty.
    fn dequeue(&self, tid: usize) -> Option<T>;

    /// Rebuilds a consistent queue from whatever survived in the persistent
    /// region. Must be called exactly once, by a single thread, before any
    /// operation on a reopened queue.
    fn recover(&mut self);

    /// True when no item is reachable from the head. A snapshot; not
    /// ordered against in-flight operations.
    fn is_empty(&self) -> bool;
}
