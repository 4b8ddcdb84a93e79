pub mod linked_queue;
pub mod opt_linked_queue;
pub mod opt_unlinked_queue;
pub mod unlinked_queue;

pub use linked_queue::LinkedQueue;
pub use opt_linked_queue::OptLinkedQueue;
pub use opt_unlinked_queue::OptUnlinkedQueue;
pub use unlinked_queue::UnlinkedQueue;
