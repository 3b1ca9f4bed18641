// Atomic reference count, shared between records that need more than one
// live pointer but no data protected by a lock of its own (block-cache
// entries, in-memory inodes, the page-allocator's in-use counter). Not a
// smart pointer -- callers decide what "last reference dropped" means for
// the record it's embedded in.
//
// Signed and initialized to zero, per spec: this permits the common idiom
// where the count tracks *additional* references beyond an implicit one
// (`decrement` reports "last owner released" iff the post-decrement value
// is <= 0, not just == 0).

use core::sync::atomic::{AtomicIsize, Ordering};

#[derive(Debug, Default)]
pub struct RefCount(AtomicIsize);

impl RefCount {
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    pub fn get(&self) -> isize {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) -> isize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the count and reports whether the post-decrement value
    /// is <= 0 -- "last owner released".
    pub fn decrement(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) - 1 <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_then_decrement_to_zero() {
        let rc = RefCount::new();
        assert_eq!(rc.increment(), 1);
        assert_eq!(rc.increment(), 2);
        assert!(!rc.decrement());
        assert!(rc.decrement());
        assert_eq!(rc.get(), 0);
    }

    #[test]
    fn decrement_past_zero_keeps_reporting_released() {
        let rc = RefCount::new();
        assert!(rc.decrement());
        assert_eq!(rc.get(), -1);
        assert!(rc.decrement());
    }
}
