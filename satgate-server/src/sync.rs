//! Lock helpers shared by the stream, RTCP and control threads.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::error;

/// How long a cross-thread control operation may wait on an object lock
/// before it is treated as a suspected deadlock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Lock, treating a poisoned mutex as still usable. Only the stream and
/// RTCP threads touch these objects and neither holds a guard across a
/// panic boundary of interest.
pub fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bounded lock for control-plane entry points.
///
/// Spins on `try_lock` up to [`LOCK_TIMEOUT`]; on expiry the suspected
/// deadlock is logged and `None` is returned so the caller fails the
/// operation instead of touching shared state unlocked.
pub fn lock_or_give_up<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Option<MutexGuard<'a, T>> {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    error!("Possible deadlock on {what} lock, giving up the operation");
                    return None;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_succeeds() {
        let mutex = Mutex::new(5);
        let guard = lock_or_give_up(&mutex, "test").expect("lock");
        assert_eq!(*guard, 5);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let clone = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().expect("lock");
            panic!("poison it");
        })
        .join();
        assert_eq!(*lock_ignore_poison(&mutex), 1);
    }
}
