// Counting semaphore with an explicit FIFO wait list, targeted wakeups,
// and alertable/non-alertable sleeps. Grounded directly in the original
// `common/sem.c`'s `_wait_sem`/`_post_sem`: we keep a wait record per
// blocked process (rather than xv6's broadcast-wakeup-by-address idiom
// the teacher's `semaphore.rs`/`condvar.rs` use) because `kill` needs to
// wake exactly one alertable waiter without disturbing the rest of the
// queue.

use crate::proc::{Proc, ProcState, CPUS};
use crate::spinlock::Mutex;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

struct WaitNode {
    proc: Arc<Proc>,
    // Set by `post` before waking the waiter; distinguishes "woken
    // because a post arrived" from "woken because `kill` alerted an
    // alertable sleep".
    up: AtomicBool,
}

struct SemInner {
    val: isize,
    waiters: VecDeque<Arc<WaitNode>>,
}

pub struct Semaphore {
    inner: Mutex<SemInner>,
}

impl Semaphore {
    pub const fn new(val: isize, name: &'static str) -> Self {
        Self {
            inner: Mutex::new(
                SemInner {
                    val,
                    waiters: VecDeque::new(),
                },
                name,
            ),
        }
    }

    /// Try to take one unit without blocking.
    pub fn try_wait(&self) -> bool {
        let mut guard = self.inner.lock();
        if guard.val > 0 {
            guard.val -= 1;
            true
        } else {
            false
        }
    }

    /// Current count: non-negative means units are available, negative
    /// is the (negated) number of queued waiters. Does not block.
    pub fn query(&self) -> isize {
        self.inner.lock().val
    }

    /// Returns the current count and resets it to zero, without
    /// disturbing any queued waiters.
    pub fn drain(&self) -> isize {
        let mut guard = self.inner.lock();
        core::mem::replace(&mut guard.val, 0)
    }

    /// Posts repeatedly until no waiter remains queued.
    pub fn post_all(&self) {
        loop {
            if self.inner.lock().waiters.is_empty() {
                break;
            }
            self.post();
        }
    }

    /// Blocks until a unit is available. `alertable` selects `SLEEPING`
    /// (a concurrent `kill` can cut the wait short) vs `DEEPSLEEPING`
    /// (immune to `kill`). Returns `true` if a unit was obtained, `false`
    /// if an alertable wait was cut short by `kill` -- in which case the
    /// reservation is returned and the caller's place in line is given up.
    pub fn wait(&self, alertable: bool) -> bool {
        let mut guard = self.inner.lock();
        guard.val -= 1;
        if guard.val >= 0 {
            return true;
        }

        let me = CPUS
            .my_proc()
            .expect("Semaphore::wait: no current proc")
            .clone();
        let node = Arc::new(WaitNode {
            proc: me.clone(),
            up: AtomicBool::new(false),
        });
        guard.waiters.push_back(node.clone());

        let state = if alertable {
            ProcState::Sleeping
        } else {
            ProcState::DeepSleeping
        };
        guard = me.sleep_on(guard, state);

        if node.up.load(Ordering::Acquire) {
            true
        } else {
            // Woken by `kill`, not by a post: give the unit back and
            // drop out of the queue.
            guard.val += 1;
            guard.waiters.retain(|n| !Arc::ptr_eq(n, &node));
            false
        }
    }

    /// Releases one unit. If a waiter is queued, wakes the oldest one and
    /// hands it the unit directly rather than letting it re-race for it.
    pub fn post(&self) {
        let mut guard = self.inner.lock();
        guard.val += 1;
        if guard.val <= 0 {
            let node = guard
                .waiters
                .pop_front()
                .expect("Semaphore::post: val <= 0 with no waiters");
            node.up.store(true, Ordering::Release);
            let proc = node.proc.clone();
            drop(guard);
            proc.activate(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_reflects_pending_waiters() {
        let s = Semaphore::new(2, "test");
        assert_eq!(s.query(), 2);
        assert!(s.try_wait());
        assert!(s.try_wait());
        assert!(!s.try_wait());
        assert_eq!(s.query(), 0);
    }

    #[test]
    fn drain_zeroes_and_returns_prior_count() {
        let s = Semaphore::new(3, "test");
        assert_eq!(s.drain(), 3);
        assert_eq!(s.query(), 0);
    }

    #[test]
    fn post_with_no_waiters_just_increments() {
        let s = Semaphore::new(0, "test");
        s.post();
        assert_eq!(s.query(), 1);
    }
}
