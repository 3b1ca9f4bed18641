// The thin hardware-access layer the rest of the kernel is written
// against: interrupt masking, this core's id, and the page-size
// constants everything else imports from here rather than hand-rolling
// a magic number. Everything in this file is a handful of instructions;
// nothing here decides policy.

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}
pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

#[cfg(target_os = "none")]
mod hw {
    use aarch64_cpu::asm::barrier;
    use aarch64_cpu::registers::{DAIF, MPIDR_EL1};
    use tock_registers::interfaces::Readable;

    /// Enable IRQ/FIQ delivery on this core (clear DAIF.I and DAIF.F).
    pub fn intr_on() {
        unsafe { core::arch::asm!("msr daifclr, #3") };
    }

    /// Disable IRQ/FIQ delivery on this core (set DAIF.I and DAIF.F).
    pub fn intr_off() {
        unsafe { core::arch::asm!("msr daifset, #3") };
    }

    /// Are interrupts currently enabled on this core?
    pub fn intr_get() -> bool {
        DAIF.read(DAIF::I) == 0
    }

    /// This core's affinity-0 id, as assigned by `set_cpu_on`/PSCI at
    /// boot. Must be called with interrupts disabled -- otherwise the
    /// kernel could be preempted and rescheduled onto a different core
    /// between reading this and using it.
    pub unsafe fn cpu_id() -> usize {
        (MPIDR_EL1.get() & 0xff) as usize
    }

    /// Full data synchronization barrier, used around MMIO register
    /// writes to the block device and UART.
    pub fn dsb() {
        barrier::dsb(barrier::SY);
    }
}

/// Host stand-in for the four primitives above, used only so the
/// `#[cfg(test)]` blocks scattered through the core (spinlock,
/// semaphore, proc, ...) can link and run on the host. There is exactly
/// one "CPU" here -- cargo test's single worker -- so `intr_*` just
/// tracks one boolean and `cpu_id` is always 0.
#[cfg(not(target_os = "none"))]
mod hw {
    use core::sync::atomic::{AtomicBool, Ordering};

    static INTR_ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn intr_on() {
        INTR_ENABLED.store(true, Ordering::SeqCst);
    }
    pub fn intr_off() {
        INTR_ENABLED.store(false, Ordering::SeqCst);
    }
    pub fn intr_get() -> bool {
        INTR_ENABLED.load(Ordering::SeqCst)
    }
    pub unsafe fn cpu_id() -> usize {
        0
    }
    pub fn dsb() {}
}

pub use hw::{cpu_id, dsb, intr_get, intr_off, intr_on};
