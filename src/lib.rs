//! A concurrent, time-ordered delay queue.
//!
//! Values are inserted with a time-to-live and delivered on a channel once
//! their deadline elapses, in deadline order (insertion order breaks ties).
//! Pending entries can be cancelled with the key returned at insertion,
//! flushed immediately with delivery ([`DeadlineQueue::drain`]) or discarded
//! silently ([`DeadlineQueue::purge`]). A building block for
//! timeout/expiry/retry-scheduling subsystems.
//!
//! Delivery is asynchronous and decoupled from the queue's bookkeeping: each
//! expired value is handed to the channel by its own task, so consumers that
//! lag never block insertion, removal or the expiry of later entries. There
//! is no bound on in-flight deliveries if entries expire faster than the
//! consumer drains them.
//!
//! ```
//! use deadline_queue::DeadlineQueue;
//! use deadline_queue::test_utils::test_logger;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let (queue, mut expired) = DeadlineQueue::new(test_logger());
//!
//!     queue.add("slow", Duration::from_millis(500));
//!     let key = queue.add("cancelled", Duration::from_millis(500));
//!     queue.add("fast", Duration::from_millis(50));
//!
//!     assert_eq!(queue.remove(&key), Ok("cancelled"));
//!     assert_eq!(expired.recv().await, Some("fast"));
//!     assert_eq!(expired.recv().await, Some("slow"));
//! }
//! ```

mod alarm;
mod entry;
mod queue;
mod store;
pub mod test_utils;

pub use entry::EntryKey;
pub use queue::DeadlineQueue;

/// Errors surfaced by [`DeadlineQueue`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The key does not match any pending entry: it was already removed,
    /// delivered, drained or purged.
    UnknownEntry,
}
