use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod activity;
pub mod backoff;
pub mod binding;
pub mod conflict;
pub mod detector;
pub mod engine;
pub mod executor;
pub mod index;
pub mod local_watcher;
pub mod paths;
pub mod scheduler;
pub mod state;
pub mod transfer;

/// State guarded here is only touched between await points, so a poisoned
/// lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
