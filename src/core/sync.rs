//! Lock Helpers
//!
//! Game state is shared between the render loop, AI tasks and command
//! handlers. Each domain has its own `RwLock`; operations take only the locks
//! they need, always in this order:
//!
//! ```text
//! all-neurons -> nucleus -> potentials -> resources -> technologies -> field
//! ```
//!
//! A lock of one player is never held while a lock of another player is
//! acquired. A panicking holder poisons the lock; the data is still
//! consistent at every release point, so poisoning is ignored.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a shared lock.
#[inline]
pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire an exclusive lock.
#[inline]
pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire a mutex. Mutexes (random generator, statistics, deltas) are leaves:
/// nothing else is locked while one is held.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
