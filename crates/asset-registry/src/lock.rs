//! Interface lock discipline.
//!
//! A single multi-reader/single-writer lock guards all registry state. The
//! lock is not reentrant: no code holding it may invoke a user callback or
//! broadcast an event (see `events`). A high-priority-waiter counter lets a
//! blocking reader ask the background writer to yield instead of greedily
//! re-acquiring in a tight loop. The separate [`TickLock`] serializes which
//! thread may run the gather tick body; it is never held while sleeping on
//! the interface lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Multi-reader/single-writer lock over the guarded registry state.
pub struct InterfaceLock<T> {
    data: RwLock<T>,
    high_priority_waiters: AtomicUsize,
}

impl<T> InterfaceLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            data: RwLock::new(data),
            high_priority_waiters: AtomicUsize::new(0),
        }
    }

    /// Shared read access. Multiple concurrent readers allowed.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read()
    }

    /// Exclusive write access.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.data.write()
    }

    /// Read access for a caller that needs low latency; while waiting, the
    /// background writer observes [`Self::has_high_priority_waiters`] and
    /// yields promptly.
    pub fn read_high_priority(&self) -> RwLockReadGuard<'_, T> {
        self.high_priority_waiters.fetch_add(1, Ordering::SeqCst);
        let guard = self.data.read();
        self.high_priority_waiters.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    /// Checked by long-running writers between work items.
    #[inline]
    pub fn has_high_priority_waiters(&self) -> bool {
        self.high_priority_waiters.load(Ordering::Relaxed) > 0
    }
}

/// Serializes "who may run the tick body right now" between the
/// notification thread and a take-over caller. Distinct from the data lock;
/// acquiring it never requires the interface lock.
#[derive(Default)]
pub struct TickLock {
    inner: Mutex<()>,
}

impl TickLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until this thread may run the tick body.
    #[inline]
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }

    /// Non-blocking variant for opportunistic ticks.
    #[inline]
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, ()>> {
        self.inner.try_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_are_concurrent() {
        let lock = Arc::new(InterfaceLock::new(5usize));
        let first = lock.read();
        let second = lock.read();
        assert_eq!(*first + *second, 10);
    }

    #[test]
    fn high_priority_waiters_are_visible_to_writer() {
        let lock = Arc::new(InterfaceLock::new(0usize));
        assert!(!lock.has_high_priority_waiters());

        let writer_guard = lock.write();
        let reader_lock = lock.clone();
        let reader = thread::spawn(move || {
            let guard = reader_lock.read_high_priority();
            *guard
        });

        // The blocked reader registers before acquiring.
        for _ in 0..200 {
            if lock.has_high_priority_waiters() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(lock.has_high_priority_waiters());

        drop(writer_guard);
        reader.join().unwrap();
        assert!(!lock.has_high_priority_waiters());
    }

    #[test]
    fn tick_lock_excludes_second_runner() {
        let tick = TickLock::new();
        let guard = tick.acquire();
        assert!(tick.try_acquire().is_none());
        drop(guard);
        assert!(tick.try_acquire().is_some());
    }
}
