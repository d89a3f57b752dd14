//! Usage: `lock_or_recover()` for the in-process caches and the accounting buffer.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) trait MutexExt<T> {
    /// Locks, taking the guard back out of a poisoned mutex.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        let site = std::panic::Location::caller();
        self.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::warn!(
                guarded = std::any::type_name::<T>(),
                site = %site,
                "recovering poisoned lock"
            );
            self.clear_poison();
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn poisoned_buffer_keeps_its_contents() {
        let records = Arc::new(Mutex::new(vec![1u64, 2]));
        let writer = Arc::clone(&records);

        let _ = std::thread::spawn(move || {
            let mut guard = writer.lock().unwrap();
            guard.push(3);
            panic!("writer died mid-append");
        })
        .join();

        assert_eq!(*records.lock_or_recover(), vec![1, 2, 3]);
        assert!(!records.is_poisoned());
    }
}
