#![no_std]
#![no_main]

extern crate alloc;

use core::sync::atomic::{AtomicBool, Ordering};
use kernel::bio::BlockDevice;
use kernel::memlayout::{PSCI_CPU_ON, SECONDARY_ENTRY};
use kernel::param::{HEARTBEAT_TICKS, NCPU};
use kernel::proc::{self, CPUS};
use kernel::{fs, page_alloc, println, virtio_disk};

static STARTED: AtomicBool = AtomicBool::new(false);

/// Physical memory handed to the page allocator, following the
/// teacher's own convention of reserving a fixed kernel image window
/// and giving everything above it to `page_alloc`. QEMU's aarch64
/// "virt" machine places RAM at 0x4000_0000; 128 MiB is enough for this
/// kernel's needs and fits comfortably inside `-m 256M`.
const KERNEL_END: usize = 0x4020_0000;
const PHYS_END: usize = 0x4800_0000;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    let cpuid = unsafe { kernel::arch::cpu_id() };
    if cpuid == 0 {
        println!();
        println!("armcore kernel is booting");
        println!();
        unsafe { page_alloc::init(KERNEL_END, PHYS_END) };
        virtio_disk::init();
        fs::init(&virtio_disk::DISK);
        wake_secondary_cpus();
        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        println!("cpu {} starting", cpuid);
    }

    if cpuid == 0 {
        boot_root_process();
    }

    proc::run_idle()
}

/// Reads partition table entry #2 from the MBR (offset 0x1CE: LBA at
/// +8, sector count at +12, both little-endian u32) and creates the
/// first runnable process. Out of scope per spec.md §1 is everything
/// that process would actually execute -- `start_proc`'s entry point is
/// a placeholder.
fn boot_root_process() {
    let mut mbr = [0u8; 512];
    virtio_disk::DISK.read(0, &mut mbr);
    let entry_off = 0x1CE;
    let _lba = u32::from_le_bytes(mbr[entry_off + 8..entry_off + 12].try_into().unwrap());
    let _sectors = u32::from_le_bytes(mbr[entry_off + 12..entry_off + 16].try_into().unwrap());

    let root = proc::create_proc();
    proc::set_root_proc(root.clone());
    proc::start_proc(&root, root_entry, 0);
}

extern "C" fn root_entry(_arg: usize) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Boots every non-primary core through PSCI `CPU_ON`, each one
/// re-entering at `_start` via the fixed secondary-entry address.
fn wake_secondary_cpus() {
    for id in 1..NCPU {
        unsafe {
            core::arch::asm!(
                "mov x0, {psci}",
                "mov x1, {target}",
                "mov x2, {entry}",
                "mov x3, xzr",
                "hvc #0",
                psci = in(reg) PSCI_CPU_ON,
                target = in(reg) id as u64,
                entry = in(reg) SECONDARY_ENTRY as u64,
                out("x0") _, out("x1") _, out("x2") _, out("x3") _,
            );
        }
    }
}

/// Called from the timer IRQ handler (out of scope here, per spec.md
/// §1) once per tick; emits a heartbeat line every `HEARTBEAT_TICKS`
/// and asks the scheduler to consider preempting the running process.
pub fn on_timer_tick(ticks: u64) {
    if ticks % HEARTBEAT_TICKS == 0 {
        println!("cpu {} heartbeat", unsafe { kernel::arch::cpu_id() });
    }
    if let Some(p) = CPUS.my_proc() {
        proc::timer_tick(&p);
    }
}
