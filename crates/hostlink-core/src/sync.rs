use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a shared table, recovering the guard if a previous holder panicked.
///
/// Table mutations are single inserts and removes, so a panic elsewhere never
/// leaves the map half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
