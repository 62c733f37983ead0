//! Persistent write queue for mutations made while the backend is unreachable.
//!
//! - Ordered by enqueue time, drained sequentially
//! - Whole list persisted after every mutation
//! - One process at a time holds the lists through a lease in the database
//! - Failed replays back off exponentially; entries that hit the attempt
//!   ceiling move to a persisted dead-letter list instead of being dropped

mod manager;
mod storage;
mod types;

pub use manager::{QueueView, WriteQueue};
pub use storage::{QueueError, QueueStore, SqliteQueueStore};
pub use types::{DrainReport, OperationKind, QueuedOperation, RetryPolicy};
