//! Self-locking ordering structures shared by the mirror and the index facade.
//!
//! Every structure guards its state with one internal mutex, so producers on watcher
//! threads and the background worker can enqueue, dequeue and remove concurrently.

mod fifo;
mod grouping;
mod ordered;

pub use fifo::{FifoMap, FifoSet};
pub use grouping::SetGrouping;
pub use ordered::{OrderedMap, OrderedSet};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Guarded state in this crate is only mutated through short, non-panicking critical
/// sections, so a poisoned lock still holds a consistent value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
