// Fixed physical addresses for the virtualized platform this kernel
// targets (QEMU's aarch64 "virt" machine). Just addresses -- no MMIO
// access happens here, that's `uart.rs`/`virtio_disk.rs`'s job.

/// PL011 UART0 data/control registers.
pub const UART0: usize = 0x0900_0000;

/// First virtio-mmio slot QEMU's "virt" machine exposes; the block
/// device is whichever slot the `-device virtio-blk-device` command
/// line argument landed it in, 0 by convention here.
pub const VIRTIO0: usize = 0x0a00_0000;
pub const VIRTIO0_SIZE: usize = 0x200;

/// Where a secondary core's PC is set to just before its PSCI `CPU_ON`
/// call -- the boot-up mailbox address spec.md's platform section
/// names. Filled in by the (out-of-scope) bootstrap path; the core
/// only needs the constant to issue the call.
pub const SECONDARY_ENTRY: usize = 0x4000_0000;

/// PSCI `CPU_ON` function id (SMC64 calling convention).
pub const PSCI_CPU_ON: u64 = 0xC400_0003;
