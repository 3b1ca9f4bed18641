// Kernel-thread context switch: save the callee-saved registers of the
// outgoing context, restore them from the incoming one, and return into
// whatever `ra` that incoming context last saved. Grounded in the
// original `swtch.S`'s shape (save/restore callee-saved regs plus the
// stack pointer, nothing else -- the trap path owns everything
// caller-saved) but written for AAPCS64: x19-x28 and fp/lr are the
// callee-saved integer registers, and sp must be saved/restored by hand
// since AArch64 has no "push sp" instruction.

use core::arch::asm;

/// Saved registers for a kernel context switch. Field order matches the
/// store/load order in `swtch`'s assembly below -- do not reorder one
/// without the other.
#[derive(Debug)]
#[repr(C)]
pub struct Context {
    sp: usize,

    // callee-saved, AAPCS64: x19-x28, fp (x29), lr (x30)
    x19: usize,
    x20: usize,
    x21: usize,
    x22: usize,
    x23: usize,
    x24: usize,
    x25: usize,
    x26: usize,
    x27: usize,
    x28: usize,
    fp: usize,
    lr: usize,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            sp: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
        }
    }

    /// A context that, when switched to, starts `entry` running on a
    /// fresh stack topped at `stack_top`. `entry` never returns (it's a
    /// process's kernel-side trampoline); `lr` pointing at it is enough,
    /// there is no caller frame to unwind back into.
    pub fn new_entry(entry: usize, stack_top: usize) -> Self {
        let mut ctx = Self::zeroed();
        ctx.sp = stack_top;
        ctx.lr = entry;
        ctx
    }
}

/// Switches kernel context: saves the currently running thread's
/// callee-saved registers and stack pointer into `*from`, then loads
/// `*to`'s into the live registers and returns. The return address
/// restored from `to.lr` is where control actually resumes -- for a
/// thread resumed after a previous `swtch`, that's the instruction
/// right after its own call here; for a brand new thread, it's
/// whatever `Context::new_entry` set.
///
/// # Safety
/// `from` and `to` must be valid, non-aliased pointers to `Context`s
/// owned by kernel stacks that are not concurrently in use. The caller
/// must hold whatever locks the target thread's invariants require
/// (see `proc::Proc::sched`/`proc::run_idle`) -- `swtch` itself does no
/// synchronization.
#[cfg(target_os = "none")]
#[naked]
pub unsafe extern "C" fn swtch(from: *mut Context, to: *mut Context) {
    asm!(
        "stp x19, x20, [x0, #8]",
        "stp x21, x22, [x0, #24]",
        "stp x23, x24, [x0, #40]",
        "stp x25, x26, [x0, #56]",
        "stp x27, x28, [x0, #72]",
        "stp x29, x30, [x0, #88]",
        "mov x9, sp",
        "str x9, [x0]",
        "ldp x19, x20, [x1, #8]",
        "ldp x21, x22, [x1, #24]",
        "ldp x23, x24, [x1, #40]",
        "ldp x25, x26, [x1, #56]",
        "ldp x27, x28, [x1, #72]",
        "ldp x29, x30, [x1, #88]",
        "ldr x9, [x1]",
        "mov sp, x9",
        "ret",
        options(noreturn)
    );
}

/// Host stand-in so `proc.rs`'s data structures (`Cpu`, `KernelStack`,
/// the process table) link and its non-scheduling unit tests run under
/// `cargo test` and in the `mkfs` binary, neither of which ever
/// actually dispatches a process. Nothing on the host calls this --
/// the real asm version above is the only one that ever runs.
#[cfg(not(target_os = "none"))]
pub unsafe extern "C" fn swtch(_from: *mut Context, _to: *mut Context) {
    unreachable!("swtch: no real context switch on a hosted build")
}
