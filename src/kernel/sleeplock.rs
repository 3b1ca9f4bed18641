// Long-term lock for data that may be held across a disk operation --
// buffer contents, an in-memory inode. Built directly on top of
// `Semaphore` rather than its own machinery, the way the original
// treats `SleepLock` as a `#define` for a binary semaphore
// (`init_sleeplock(l) == init_sem(l, 1)`,
// `acquire_sleeplock == wait_sem` (alertable)).

use crate::semaphore::Semaphore;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

pub struct SleepLock<T: ?Sized> {
    sem: Semaphore,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            sem: Semaphore::new(1, name),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Acquires the lock, alertable: a concurrent `kill` of this process
    /// can cut the wait short. Callers that must not be interrupted
    /// (recovery/mkfs-style paths with no live process context) use
    /// `lock_unalertable` instead.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let ok = self.sem.wait(true);
        assert!(ok, "SleepLock::lock {}: interrupted", self.name);
        SleepLockGuard { lock: self }
    }

    /// Acquires the lock without being interruptible by `kill`.
    pub fn lock_unalertable(&self) -> SleepLockGuard<'_, T> {
        let ok = self.sem.wait(false);
        assert!(ok, "SleepLock::lock_unalertable {}: unreachable", self.name);
        SleepLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        if self.sem.try_wait() {
            Some(SleepLockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn unlock(guard: SleepLockGuard<'_, T>) -> &'_ SleepLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Bypasses the lock. Only safe where the caller can prove exclusive
    /// access some other way.
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.sem.post();
    }
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    pub fn sleep_lock(&self) -> &'a SleepLock<T> {
        self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_then_try_lock_fails_while_held() {
        let l = SleepLock::new(0usize, "test");
        let g = l.try_lock().expect("first try_lock should succeed");
        assert!(l.try_lock().is_none());
        drop(g);
        assert!(l.try_lock().is_some());
    }

    #[test]
    fn deref_reads_and_writes_through() {
        let l = SleepLock::new(41usize, "test");
        *l.try_lock().unwrap() += 1;
        assert_eq!(*l.try_lock().unwrap(), 42);
    }

    #[test]
    fn unlock_returns_same_lock_and_releases_it() {
        let l = SleepLock::new((), "test");
        let g = l.try_lock().unwrap();
        let same = SleepLock::unlock(g);
        assert!(core::ptr::eq(same, &l));
        assert!(l.try_lock().is_some());
    }
}
