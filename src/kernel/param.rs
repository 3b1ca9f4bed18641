// Compile-time tunables. Grouped the way the rest of the kernel expects to
// find them: one flat module, no sub-namespacing, imported with `use
// crate::param::*;` at call sites.

/// Number of CPUs this image is built for.
pub const NCPU: usize = 8;

/// Maximum number of live process records, idle processes included.
pub const NPROC: usize = 64;

/// PIDs are allocated from a bitmap over `1..MAX_PID`; bit 0 (pid 0) is
/// never handed out.
pub const MAX_PID: usize = 32768;

/// PIDs `1..=NCPU` are reserved for the per-CPU idle processes, and
/// `NCPU + 1` for `root`. `kill` rejects anything at or below this.
pub const RESERVED_PID_MAX: usize = NCPU + 1;

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}
pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// Disk sector / cached-block size.
pub const BLOCK_SIZE: usize = 512;

/// Depth of the single split virtqueue the block driver drives.
pub const NQUEUE: usize = 8;

/// Resident block-cache size before eviction is attempted.
pub const EVICTION_THRESHOLD: usize = 20;

/// Per-transaction write budget, admission-controlled by `begin_op`.
pub const OP_MAX_NUM_BLOCKS: usize = 10;

/// Records in the on-disk log header: `(BLOCK_SIZE - 8) / 8`.
pub const LOG_MAX_SIZE: usize = (BLOCK_SIZE - 8) / 8;

/// Slab size classes, smallest to largest. Anything bigger falls through
/// to a whole page.
pub const SLAB_SIZES: [usize; 8] = [8, 16, 32, 64, 128, 256, 512, 1024];
pub const NUM_SLAB_SIZES: usize = SLAB_SIZES.len();

/// Per-CPU magazine capacity, one magazine per slab class per CPU.
pub const CPU_CACHE_SIZE: usize = 32;

/// Direct and indirect block-pointer counts in an inode, named
/// explicitly in spec.md §3/§6: `addrs[12]` plus one `indirect`
/// pointer, giving `MAXFILE = (12 + 128) * 512 = 71680` bytes and
/// putting the boundary between the direct and indirect regions at
/// block 11/12 (spec.md §8's boundary test).
pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BLOCK_SIZE / core::mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Bytes of a directory-entry name, NUL-padded, not NUL-terminated at 14.
pub const DIRSIZ: usize = 14;

/// Bits guarded by one bitmap block.
pub const BIT_PER_BLOCK: usize = BLOCK_SIZE * 8;

/// Nominal nanoseconds between timer-driven preemptions (20 ms).
pub const TICK_MS: u64 = 20;

/// How many scheduler ticks between per-CPU heartbeat log lines.
pub const HEARTBEAT_TICKS: u64 = 250; // ~5s at a 20ms tick

/// The device the root file system lives on.
pub const ROOTDEV: usize = 1;
