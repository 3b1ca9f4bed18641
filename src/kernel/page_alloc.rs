// Physical page allocator: a singly-linked free list threaded through
// the free pages themselves, exactly as the original `kernel/mem.c`'s
// `kinit`/`kalloc_page`/`kfree_page` do it. One spinlock guards the
// list head; the slab allocator built on top of this is what actually
// absorbs per-CPU contention for small objects.

use crate::arch::{pgroundup, PGSIZE};
use crate::refcount::RefCount;
use crate::spinlock::Mutex;
use core::ptr::NonNull;

struct FreePage {
    next: Option<NonNull<FreePage>>,
}

/// The free-list threading logic on its own, with no locking and no
/// dependency on a running kernel -- the part `#[cfg(test)]` exercises
/// directly on the host. The global allocator below is a thin
/// spinlock-guarded shell around one of these.
struct FreeList {
    head: Option<NonNull<FreePage>>,
}
unsafe impl Send for FreeList {}

impl FreeList {
    const fn empty() -> Self {
        Self { head: None }
    }

    /// # Safety
    /// `pa` must be a valid, page-aligned, writable page this list does
    /// not already contain.
    unsafe fn push(&mut self, pa: *mut u8) {
        debug_assert_eq!(pa as usize % PGSIZE, 0, "FreeList::push: misaligned");
        let node = pa as *mut FreePage;
        node.write(FreePage { next: self.head });
        self.head = NonNull::new(node);
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let head = self.head?;
        self.head = unsafe { head.as_ref().next };
        Some(head.cast())
    }
}

static FREE_LIST: Mutex<FreeList> = Mutex::new(FreeList::empty(), "page_alloc");

/// Number of pages currently handed out (held, not free). Used by tests
/// and by `kalloc`/`kfree` bookkeeping in the slab allocator.
pub static PAGES_IN_USE: RefCount = RefCount::new();

/// Seeds the free list with every whole page in `[start, end)`. `start`
/// is rounded up to a page boundary; `end` is assumed already aligned
/// (the top of usable physical memory). Called exactly once at boot,
/// before any other CPU is started.
///
/// # Safety
/// `[start, end)` must be unused, valid, writable physical memory the
/// allocator is taking exclusive ownership of.
pub unsafe fn init(start: usize, end: usize) {
    let mut p = pgroundup(start);
    let mut list = FREE_LIST.lock();
    while p + PGSIZE <= end {
        list.push(p as *mut u8);
        p += PGSIZE;
    }
}

/// Allocates one zeroed 4 KiB page. Panics on exhaustion: physical
/// memory exhaustion has no recoverable path in this kernel (spec.md's
/// "resource exhaustion panics" rule).
pub fn alloc_page() -> NonNull<u8> {
    let mut list = FREE_LIST.lock();
    let ptr = list.pop().expect("alloc_page: out of memory");
    drop(list);
    PAGES_IN_USE.increment();
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, PGSIZE) };
    ptr
}

/// Returns a page allocated by `alloc_page` to the free list.
///
/// # Safety
/// `pa` must be a page this allocator previously handed out via
/// `alloc_page`, and must not be referenced again afterwards.
pub unsafe fn free_page(pa: NonNull<u8>) {
    FREE_LIST.lock().push(pa.as_ptr());
    PAGES_IN_USE.decrement();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises `FreeList` directly -- no spinlock, no running kernel,
    // just the free-list threading the real allocator is a thin shell
    // around.
    fn arena(pages: usize) -> (*mut u8, core::alloc::Layout) {
        let layout = core::alloc::Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        (unsafe { alloc::alloc::alloc(layout) }, layout)
    }

    #[test]
    fn push_then_pop_is_lifo_and_reusable() {
        let (base, layout) = arena(4);
        let mut list = FreeList::empty();
        unsafe {
            for i in 0..4 {
                list.push(base.add(i * PGSIZE));
            }
        }
        let a = list.pop().unwrap();
        let b = list.pop().unwrap();
        assert_ne!(a, b);
        unsafe {
            list.push(a.as_ptr());
            list.push(b.as_ptr());
        }
        for _ in 0..4 {
            assert!(list.pop().is_some());
        }
        assert!(list.pop().is_none());
        unsafe { alloc::alloc::dealloc(base, layout) };
    }

    #[test]
    fn empty_list_pops_none() {
        assert!(FreeList::empty().pop().is_none());
    }
}
