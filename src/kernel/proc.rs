// Per-CPU scheduler plus the process table. Grounded in the teacher's
// `proc.rs`/`sched`-style plumbing (per-CPU struct, intrusive process
// node, `push_off`/`pop_off` interrupt-disable nesting) but rebuilt
// against the *other* scheduler shape documented in the source: one
// idle thread per CPU plus a single shared runnable FIFO, the "one-hop"
// design (`run -> idle -> run`) named as final author intent.
//
// A process reaches the scheduler only through `sched(new_state)`,
// which always switches back to *this CPU's* idle process; re-entry to
// a specific runnable process is solely the idle process's job via
// `pick_next`. This keeps the cross-CPU lock handoff to exactly one
// case: a process's own lock, already held by its caller and handed to
// `sched`, is forgotten across the switch away and released by the
// idle process that picked it up next (see `Mutex::force_unlock` in
// `spinlock.rs`). Outside that narrow window -- the rest of a
// process's time actually running -- its own lock is free, same as
// any other process's.

use crate::page_alloc;
use crate::param::{MAX_PID, NCPU, NPROC, PGSIZE, RESERVED_PID_MAX};
use crate::pgdir::PageDirectory;
use crate::semaphore::Semaphore;
use crate::spinlock::{Mutex, MutexGuard};
use crate::swtch::{swtch, Context};
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub static CPUS: Cpus = Cpus::new();
pub static PROCS: Mutex<Vec<Arc<Proc>>> = Mutex::new(Vec::new(), "proc table");
static SCHED_QUEUE: Mutex<VecDeque<Arc<Proc>>> = Mutex::new(VecDeque::new(), "sched queue");
static PID_BITMAP: Mutex<PidBitmap> = Mutex::new(PidBitmap::new(), "pid bitmap");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    DeepSleeping,
    Zombie,
}
use ProcState as PS;

/// Per-process kernel stack: one page, trap frame at the base, kernel
/// switch context at the top, mirroring spec.md's data model. The trap
/// frame's actual field layout is the exception-entry path's concern
/// (out of scope here per spec.md §1); this core only needs a fixed,
/// opaque region of the right size and the switch `Context` it owns.
#[repr(C, align(4096))]
struct KernelStack {
    trapframe: UnsafeCell<[u8; PGSIZE / 2]>,
    switch_ctx: UnsafeCell<Context>,
    _pad: UnsafeCell<[u8; PGSIZE / 2 - core::mem::size_of::<Context>()]>,
}

struct StackPage(core::ptr::NonNull<KernelStack>);
unsafe impl Send for StackPage {}

impl StackPage {
    fn alloc() -> Self {
        Self(page_alloc::alloc_page().cast())
    }
    fn context(&self) -> *mut Context {
        unsafe { self.0.as_ref().switch_ctx.get() }
    }
    fn top(&self) -> usize {
        self.0.as_ptr() as usize + PGSIZE
    }
}

impl Drop for StackPage {
    fn drop(&mut self) {
        unsafe { page_alloc::free_page(self.0.cast()) };
    }
}

pub struct ProcInner {
    pub state: ProcState,
    pub killed: bool,
    exitcode: i32,
    parent: Option<Weak<Proc>>,
    children: Vec<Arc<Proc>>,
    stack: Option<StackPage>,
    dir: Option<PageDirectory>,
    entry: Option<(extern "C" fn(usize) -> !, usize)>,
}

pub struct Proc {
    pub pid: usize,
    pub idle: bool,
    pub childexit: Semaphore,
    inner: Mutex<ProcInner>,
}

impl Proc {
    fn new(pid: usize, idle: bool) -> Arc<Self> {
        Arc::new(Self {
            pid,
            idle,
            childexit: Semaphore::new(0, "childexit"),
            inner: Mutex::new(
                ProcInner {
                    state: PS::Unused,
                    killed: false,
                    exitcode: 0,
                    parent: None,
                    children: Vec::new(),
                    stack: None,
                    dir: None,
                    entry: None,
                },
                "proc",
            ),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, ProcInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> ProcState {
        self.inner.lock().state
    }

    pub fn killed(&self) -> bool {
        self.inner.lock().killed
    }

    /// The spin-then-sleep pattern documented in spec.md §4.C and §9:
    /// release `guard`'s spinlock, switch this process to `state`, and
    /// reacquire the same lock once woken. Used by `Semaphore::wait` and
    /// by the log's admission-control wait (itself built over a
    /// semaphore), so there is exactly one place this handoff is coded.
    pub fn sleep_on<'a, T>(self: &Arc<Self>, guard: MutexGuard<'a, T>, state: ProcState) -> MutexGuard<'a, T> {
        let mutex = {
            let mut me = self.inner.lock();
            assert!(!me.killed || state == PS::DeepSleeping, "sleep_on: killed process sleeping alertably");
            me.state = state;
            let mutex = MutexGuard::unlock(guard);
            self.sched(me, state);
            mutex
        };
        mutex.lock()
    }

    /// `sched(me, new_state)`: caller already holds (and is handing
    /// over) its own process lock, with `me.state` already set to
    /// `new_state`. Detaches from the run queue if the new state can't
    /// run, forgets the guard, and always switches back to this CPU's
    /// idle process -- which releases the forgotten lock once the
    /// switch back here returns control to it. Returning from `sched`
    /// means some future idle pass picked this process again.
    fn sched(self: &Arc<Self>, me: MutexGuard<'_, ProcInner>, new_state: ProcState) {
        debug_assert_eq!(me.state, new_state);
        let ctx_ptr = me.stack.as_ref().expect("sched: no kernel stack").context();
        // Leave our own lock held across the switch; the idle process
        // that next dispatches us releases it via `force_unlock`
        // (spinlock.rs) once the switch back below returns control to it.
        core::mem::forget(me);

        if matches!(new_state, PS::Sleeping | PS::DeepSleeping | PS::Zombie) {
            // Detach from the run queue: a non-runnable process must not
            // be picked by another CPU's idle loop.
            SCHED_QUEUE.lock().retain(|p| !Arc::ptr_eq(p, self));
        }

        let idle_ctx = CPUS.idle_context();
        unsafe { swtch(ctx_ptr, idle_ctx) };
    }

    /// Legal transitions per spec.md §4.F's table. Returns whether the
    /// process actually moved onto the run queue.
    pub fn activate(self: &Arc<Self>, onalert: bool) -> bool {
        let mut me = self.inner.lock();
        match me.state {
            PS::Running | PS::Runnable | PS::Zombie => false,
            PS::Unused | PS::Sleeping => {
                me.state = PS::Runnable;
                drop(me);
                SCHED_QUEUE.lock().push_back(self.clone());
                true
            }
            PS::DeepSleeping => {
                if onalert {
                    false
                } else {
                    me.state = PS::Runnable;
                    drop(me);
                    SCHED_QUEUE.lock().push_back(self.clone());
                    true
                }
            }
        }
    }

    /// `kill`'s alert half: marks `killed` then activates with
    /// `onalert=true` so a deep-sleeping process stays asleep.
    pub fn alert(self: &Arc<Self>) {
        self.inner.lock().killed = true;
        self.activate(true);
    }
}

/// Per-CPU idle-process state plus the interrupt-disable nesting
/// counter (`push_off`/`pop_off` in the original), one per core.
pub struct Cpu {
    idle: Option<Arc<Proc>>,
    current: UnsafeCell<Option<Arc<Proc>>>,
    idle_ctx: UnsafeCell<Context>,
    noff: UnsafeCell<isize>,
    intena: UnsafeCell<bool>,
}
unsafe impl Sync for Cpu {}

pub struct Cpus([Cpu; NCPU]);
unsafe impl Sync for Cpus {}

pub struct IntrLock<'a> {
    cpu: &'a Cpu,
}

impl Cpus {
    const fn new() -> Self {
        Self(array_of_cpus())
    }

    pub fn this(&self) -> &Cpu {
        &self.0[unsafe { crate::arch::cpu_id() }]
    }

    pub fn my_proc(&self) -> Option<Arc<Proc>> {
        unsafe { (*self.this().current.get()).clone() }
    }

    pub fn idle_context(&self) -> *mut Context {
        self.this().idle_ctx.get()
    }

    /// `push_off`: disables interrupts (no-op if already disabled),
    /// remembering nesting depth so a later drop only re-enables once
    /// the outermost guard goes away.
    pub fn intr_lock(&self) -> IntrLock<'_> {
        let cpu = self.this();
        let was_enabled = crate::arch::intr_get();
        crate::arch::intr_off();
        unsafe {
            let noff = &mut *cpu.noff.get();
            if *noff == 0 {
                *cpu.intena.get() = was_enabled;
            }
            *noff += 1;
        }
        IntrLock { cpu }
    }

    /// `pop_off`'s bookkeeping without an `IntrLock` value to drop.
    ///
    /// A process's own lock is re-acquired (pushing `noff`) immediately
    /// before every voluntary `sched`, then `mem::forget`-en so the
    /// `locked` flag survives the switch to this CPU's idle process
    /// (`Proc::sched`). Forgetting the guard also forgets the `IntrLock`
    /// embedded in it, so nothing would otherwise ever pop that nesting
    /// level or restore `intena` -- `noff` would only grow and
    /// interrupts could never come back on. `force_unlock`
    /// (spinlock.rs) calls this to finish that pop on the idle
    /// process's behalf, on the same CPU, in the same place it clears
    /// the forgotten guard's `locked` flag.
    ///
    /// # Safety
    /// Must run on the CPU whose `IntrLock` was forgotten, with no
    /// other push between the forget and this call.
    pub unsafe fn pop_intr_nesting(&self) {
        self.this().pop_off();
    }
}

impl Cpu {
    /// Shared by `IntrLock::drop` (the ordinary case) and
    /// `Cpus::pop_intr_nesting` (finishing a pop whose `IntrLock` was
    /// `mem::forget`-en across a voluntary `sched`).
    unsafe fn pop_off(&self) {
        let noff = &mut *self.noff.get();
        assert!(*noff > 0, "pop_off without a push");
        *noff -= 1;
        if *noff == 0 && *self.intena.get() {
            crate::arch::intr_on();
        }
    }
}

impl<'a> Drop for IntrLock<'a> {
    fn drop(&mut self) {
        unsafe { self.cpu.pop_off() };
    }
}

const fn array_of_cpus() -> [Cpu; NCPU] {
    const ZERO: Cpu = Cpu {
        idle: None,
        current: UnsafeCell::new(None),
        idle_ctx: UnsafeCell::new(Context::zeroed()),
        noff: UnsafeCell::new(0),
        intena: UnsafeCell::new(false),
    };
    [ZERO; NCPU]
}

struct PidBitmap {
    bits: [u64; MAX_PID / 64],
}

impl PidBitmap {
    const fn new() -> Self {
        let mut bits = [0u64; MAX_PID / 64];
        // Reserve pid 0 and every pid up to RESERVED_PID_MAX, matching
        // spec.md's "1..NCPU+1 reserved for idle threads and root".
        let mut p = 0;
        while p <= RESERVED_PID_MAX {
            bits[p / 64] |= 1 << (p % 64);
            p += 1;
        }
        Self { bits }
    }

    fn alloc(&mut self) -> usize {
        for word in 0..self.bits.len() {
            if self.bits[word] != u64::MAX {
                for bit in 0..64 {
                    if self.bits[word] & (1 << bit) == 0 {
                        self.bits[word] |= 1 << bit;
                        return word * 64 + bit;
                    }
                }
            }
        }
        panic!("PidBitmap::alloc: out of pids");
    }

    fn free(&mut self, pid: usize) {
        self.bits[pid / 64] &= !(1 << (pid % 64));
    }
}

extern "C" fn proc_entry_trampoline() -> ! {
    let p = CPUS.my_proc().expect("proc_entry_trampoline: no current proc");
    // `run_idle` releases our lock normally before switching to us, so
    // it's free to take here like any other process-local access.
    let (entry, arg) = {
        let mut inner = p.inner.lock();
        inner.entry.take().expect("proc_entry_trampoline: no entry")
    };
    entry(arg)
}

/// Allocates a fresh process record, a kernel stack, and wires a kernel
/// context whose return path enters `proc_entry_trampoline`, which in
/// turn releases the process lock and jumps to `entry(arg)`.
pub fn create_proc() -> Arc<Proc> {
    let pid = PID_BITMAP.lock().alloc();
    let p = Proc::new(pid, false);
    let stack = StackPage::alloc();
    unsafe {
        let ctx = &mut *stack.context();
        *ctx = Context::new_entry(proc_entry_trampoline as usize, stack.top());
    }
    {
        let mut inner = p.inner.lock();
        inner.stack = Some(stack);
        inner.dir = Some(PageDirectory::new());
    }
    PROCS.lock().push(p.clone());
    p
}

/// `start_proc(p, entry, arg)`: parents `p` to root if unparented,
/// installs the entry point, and activates it.
pub fn start_proc(p: &Arc<Proc>, entry: extern "C" fn(usize) -> !, arg: usize) {
    {
        let mut inner = p.inner.lock();
        inner.entry = Some((entry, arg));
        if inner.parent.is_none() {
            if let Some(root) = root_proc() {
                if !Arc::ptr_eq(p, &root) {
                    inner.parent = Some(Arc::downgrade(&root));
                    drop(inner);
                    root.inner.lock().children.push(p.clone());
                    p.activate(false);
                    return;
                }
            }
        }
    }
    p.activate(false);
}

static ROOT: Mutex<Option<Arc<Proc>>> = Mutex::new(None, "root proc");

pub fn root_proc() -> Option<Arc<Proc>> {
    ROOT.lock().clone()
}

pub fn set_root_proc(p: Arc<Proc>) {
    *ROOT.lock() = Some(p);
}

/// Per-CPU idle loop: repeatedly `pick_next`s a runnable process that
/// isn't itself and whose lock is free, round-robins it to the queue
/// tail, and switches to it; falls back to spinning when the queue has
/// nothing pickable right now.
pub fn run_idle() -> ! {
    loop {
        if crate::printf::HALTED.load(core::sync::atomic::Ordering::Relaxed) {
            loop {
                core::hint::spin_loop();
            }
        }
        if let Some(p) = pick_next() {
            let ctx_ptr = {
                let mut queue = SCHED_QUEUE.lock();
                queue.push_back(p.clone());
                drop(queue);
                let mut inner = p.inner.lock();
                inner.state = PS::Running;
                inner.stack.as_ref().unwrap().context()
                // `inner` drops here -- the lock is free for the whole
                // span the process runs, not just this dispatch.
            };
            unsafe {
                *CPUS.this().current.get() = Some(p);
                swtch(CPUS.idle_context(), ctx_ptr);
                // Back here: the process gave up control via `sched`,
                // which left its own lock held and its guard forgotten
                // across the switch. Release it now on its behalf -- the
                // one cross-CPU lock handoff in the system.
                let p = (*CPUS.this().current.get()).take().unwrap();
                p.inner.mutex_unlock_after_switch();
            }
        } else {
            core::hint::spin_loop();
        }
    }
}

impl Mutex<ProcInner> {
    unsafe fn mutex_unlock_after_switch(&self) {
        self.force_unlock();
    }
}

fn pick_next() -> Option<Arc<Proc>> {
    let mut queue = SCHED_QUEUE.lock();
    let len = queue.len();
    for _ in 0..len {
        let p = queue.pop_front()?;
        if p.inner.holding() {
            queue.push_back(p);
            continue;
        }
        let runnable = matches!(p.inner.try_lock().map(|g| g.state), Some(PS::Runnable));
        if runnable {
            return Some(p);
        }
        queue.push_back(p);
    }
    None
}

/// Timer-driven preemption entry point: called from the (out-of-scope)
/// timer interrupt handler on every tick. Takes the caller's own
/// process lock and calls `sched(Runnable)`.
pub fn timer_tick(p: &Arc<Proc>) {
    let mut me = p.inner.lock();
    me.state = PS::Runnable;
    p.sched(me, PS::Runnable);
}

/// `wait(&exitcode)`: reaps one zombie child of the calling process, or
/// blocks on `childexit` and retries. Returns `None` if the caller has
/// no children at all.
pub fn wait(caller: &Arc<Proc>) -> Option<(usize, i32)> {
    loop {
        let mut inner = caller.inner.lock();
        if inner.children.is_empty() {
            return None;
        }
        if let Some(idx) = inner
            .children
            .iter()
            .position(|c| c.inner.lock().state == PS::Zombie)
        {
            let child = inner.children.remove(idx);
            drop(inner);
            let (pid, code) = {
                let mut cinner = child.inner.lock();
                cinner.stack.take();
                cinner.dir.take();
                (child.pid, cinner.exitcode)
            };
            PROCS.lock().retain(|p| !Arc::ptr_eq(p, &child));
            PID_BITMAP.lock().free(pid);
            return Some((pid, code));
        }
        drop(inner);
        caller.childexit.wait(true);
    }
}

/// `exit(code)`: re-parents every child to root, posts the parent's
/// `childexit`, and transitions to `ZOMBIE`. Panics if called from
/// root (spec.md §7: "exiting root" is a programmer-contract panic).
pub fn exit(caller: &Arc<Proc>, code: i32) -> ! {
    let root = root_proc().expect("exit: no root proc");
    assert!(!Arc::ptr_eq(caller, &root), "exit: root process exited");

    let children: Vec<Arc<Proc>> = core::mem::take(&mut caller.inner.lock().children);
    if !children.is_empty() {
        let mut root_inner = root.inner.lock();
        for c in &children {
            c.inner.lock().parent = Some(Arc::downgrade(&root));
            root_inner.children.push(c.clone());
        }
        drop(root_inner);
        root.activate(false);
    }

    let parent = caller.inner.lock().parent.as_ref().and_then(Weak::upgrade);

    let mut me = caller.inner.lock();
    me.exitcode = code;
    me.state = PS::Zombie;
    // Post before the final `sched`: that call transitions to ZOMBIE and
    // never returns, so anything after it would be dead code.
    if let Some(parent) = parent {
        parent.childexit.post();
    }
    caller.sched(me, PS::Zombie);
    unreachable!("exit: sched(ZOMBIE) returned");
}

/// `kill(pid)`: rejects reserved pids, DFS-searches the process tree,
/// marks `killed` and alerts on a hit.
#[derive(Debug, PartialEq, Eq)]
pub enum KillError {
    ReservedPid,
    NotFound,
}

pub fn kill(pid: usize) -> Result<(), KillError> {
    if pid <= RESERVED_PID_MAX || pid >= MAX_PID {
        return Err(KillError::ReservedPid);
    }
    let procs = PROCS.lock();
    for p in procs.iter() {
        if p.pid == pid {
            p.alert();
            return Ok(());
        }
    }
    Err(KillError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_bitmap_reserves_idle_and_root() {
        let mut bm = PidBitmap::new();
        for pid in 0..=RESERVED_PID_MAX {
            assert_ne!(bm.alloc(), pid, "reserved pid handed out");
        }
    }

    #[test]
    fn pid_bitmap_alloc_free_reuses_slot() {
        let mut bm = PidBitmap::new();
        let a = bm.alloc();
        bm.free(a);
        let b = bm.alloc();
        assert_eq!(a, b);
    }
}
