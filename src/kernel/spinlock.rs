// Mutual-exclusion spinlock: a single boolean flag, test-and-set to
// acquire, clear-with-release to free. No recursion, no blocking while
// held -- callers release before sleeping on a semaphore or sleep-lock.
//
// Wrapped around the data it protects, xv6-style, rather than used bare:
// `Mutex<T>` so the type system forces a lock before any access.

use crate::proc::CPUS;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    // Interrupts stay disabled for as long as any spinlock on this CPU is
    // held; dropped after `mutex`'s own field below it, so the lock is
    // released before interrupts are possibly re-enabled.
    _intr_lock: crate::proc::IntrLock<'a>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let intr_lock = CPUS.intr_lock();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard {
                mutex: self,
                _intr_lock: intr_lock,
            })
        } else {
            None
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let intr_lock = CPUS.intr_lock();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        MutexGuard {
            mutex: self,
            _intr_lock: intr_lock,
        }
    }

    /// Sanity check used at points that assert "the caller must already
    /// hold this lock", mirroring the assertions in the original C.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn unlock(guard: MutexGuard<'_, T>) -> &'_ Mutex<T> {
        let mutex = guard.mutex;
        drop(guard);
        mutex
    }

    /// Bypasses the lock entirely. Only safe where the caller can prove
    /// exclusive access some other way (process exited, single-core boot
    /// inspection from `procdump`-like debug paths).
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }

    /// Clears the lock without going through a `MutexGuard`'s `Drop`,
    /// and without this call itself having taken the lock via
    /// `IntrLock`. Used exactly once: the scheduler's idle loop forcibly
    /// releases the previously-dispatched process's own lock, which that
    /// process left held (and its guard `mem::forget`-en) across the
    /// context switch back to idle. See `proc::run_idle`/`proc::Proc::sched`.
    ///
    /// `mem::forget`-ing that guard also forgets the `IntrLock` embedded
    /// in it, so the interrupt-disable nesting it pushed would otherwise
    /// never be popped and `intena` would never be restored -- finish
    /// that pop here, in the same place and on the same CPU that the
    /// forgotten guard's `locked` flag is cleared.
    pub unsafe fn force_unlock(&self) {
        assert!(self.holding(), "force_unlock: not held");
        self.locked.store(false, Ordering::Release);
        CPUS.pop_intr_nesting();
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.mutex.holding()
    }
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_then_lock_fails_while_held() {
        let m = Mutex::new(0usize, "test");
        let g1 = m.try_lock().expect("first lock should succeed");
        assert!(m.try_lock().is_none());
        drop(g1);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn deref_reads_and_writes_through() {
        let m = Mutex::new(41usize, "test");
        *m.lock() += 1;
        assert_eq!(*m.lock(), 42);
    }
}
