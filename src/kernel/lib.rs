#![cfg_attr(not(test), no_std)]
#![feature(alloc_error_handler)]
#![feature(allocator_api)]
#![feature(naked_functions)]
#![feature(asm_const)]
extern crate alloc;

pub mod arch;
pub mod bio;
pub mod fs;
pub mod lazy;
pub mod log;
pub mod memlayout;
pub mod page_alloc;
pub mod param;
pub mod pgdir;
#[macro_use]
pub mod printf;
pub mod proc;
pub mod refcount;
pub mod semaphore;
pub mod slab;
pub mod sleeplock;
pub mod spinlock;
pub mod swtch;
pub mod uart;
pub mod virtio_disk;

/// Host test support only. `bio::BCACHE`, `log::LOG`, and `fs::SB` are
/// process-wide singletons by design (spec.md §9's "Global mutable
/// state") -- correct for a kernel with exactly one disk, but it means
/// any host test that exercises them through `fs`'s free functions
/// (which hardcode the statics, not an injected handle) shares state
/// with every other such test in the binary. Serialize just those
/// tests on this lock rather than threading a cache/log handle through
/// the whole inode-layer API for the host harness's sake alone.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::spinlock::Mutex;
    pub static GLOBAL_STATE_TEST_LOCK: Mutex<()> = Mutex::new((), "global state test lock");
}

/// The kernel's only allocator: every `alloc`-crate container
/// (`Arc`, `VecDeque`, `Vec`, ...) used throughout bio/log/fs/proc
/// bottoms out here, which in turn is a thin dispatcher over
/// `slab::kalloc`/`kfree` for anything that fits a slab class and
/// `page_alloc` for anything bigger. Gated on the real hardware target,
/// not merely `cfg(not(test))`: this crate's lib target is also
/// compiled as the `mkfs` binary's on-disk-layout dependency on the
/// host, and that host binary must keep using `std`'s own allocator
/// instead of one built over physical memory nothing has registered.
#[cfg(target_os = "none")]
struct KernelAlloc;

#[cfg(target_os = "none")]
unsafe impl core::alloc::GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        let largest_slab = *param::SLAB_SIZES.last().unwrap();
        if layout.size() <= largest_slab {
            slab::kalloc(layout.size()).as_ptr()
        } else if layout.size() <= param::PGSIZE {
            page_alloc::alloc_page().as_ptr()
        } else {
            panic!("alloc: {:?} exceeds a single page, unsupported", layout);
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: core::alloc::Layout) {
        let largest_slab = *param::SLAB_SIZES.last().unwrap();
        let ptr = core::ptr::NonNull::new_unchecked(ptr);
        if layout.size() <= largest_slab {
            slab::kfree(ptr, layout.size());
        } else {
            page_alloc::free_page(ptr);
        }
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: KernelAlloc = KernelAlloc;

#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("allocation failed: {:?}", layout);
}
