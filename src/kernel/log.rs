// Write-ahead log: a physical redo log over whole blocks, grounded in
// the teacher's `log.rs` for the overall commit shape (header block +
// N body blocks, `begin_op`/`end_op` bracket transactions, commit only
// runs when the last outstanding op ends) but rebuilt against spec.md
// §4.I directly: the on-disk header layout differs from the teacher's
// (`num_blocks`/`block_no` vs `n`/`block`), admission control is an
// explicit capacity inequality rather than a single `LOGSIZE` bound,
// and waiters are tracked explicitly (FIFO wake-all) instead of going
// through the teacher's broadcast-by-address `PROCS.wakeup`.

use crate::bio::{BlockDevice, BCACHE};
use crate::param::{LOG_MAX_SIZE, OP_MAX_NUM_BLOCKS};
use crate::proc::{Proc, ProcState, CPUS};
use crate::spinlock::Mutex;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use zerocopy::{AsBytes, FromBytes};

/// Per-transaction write budget. `begin_op` sets this to
/// `OP_MAX_NUM_BLOCKS`; every distinct block a transaction logs for
/// the first time charges one unit (see `log_write`).
#[derive(Default)]
pub struct Ctx {
    pub rm: usize,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct LogHeaderOnDisk {
    num_blocks: u64,
    block_no: [u64; LOG_MAX_SIZE],
}

struct LogState {
    num_blocks: u32,
    block_no: [u32; LOG_MAX_SIZE],
    count: usize,
    committing: bool,
    waiters: VecDeque<Arc<Proc>>,
}

impl LogState {
    const fn new() -> Self {
        Self {
            num_blocks: 0,
            block_no: [0; LOG_MAX_SIZE],
            count: 0,
            committing: false,
            waiters: VecDeque::new(),
        }
    }
}

pub struct Log {
    log_start: AtomicU32,
    capacity: AtomicU32,
    state: Mutex<LogState>,
}

impl Log {
    const fn new() -> Self {
        Self {
            log_start: AtomicU32::new(0),
            capacity: AtomicU32::new(0),
            state: Mutex::new(LogState::new(), "log"),
        }
    }

    /// Called once at boot after the super block is known. Recovers any
    /// committed-but-not-truncated transaction left over from a crash.
    pub fn init(&self, dev: &dyn BlockDevice, log_start: u32, num_log_blocks: u32) {
        self.log_start.store(log_start, Ordering::Relaxed);
        let capacity = core::cmp::min(num_log_blocks.saturating_sub(1), LOG_MAX_SIZE as u32);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.recover(dev);
    }

    fn read_header(&self, dev: &dyn BlockDevice) -> (u32, [u32; LOG_MAX_SIZE]) {
        let hblock = BCACHE.acquire(dev, self.log_start.load(Ordering::Relaxed));
        let (num_blocks, block_no) = {
            let guard = hblock.data().lock_unalertable();
            let disk = LogHeaderOnDisk::read_from_prefix(&guard[..])
                .expect("log: header block too small");
            let mut block_no = [0u32; LOG_MAX_SIZE];
            for (dst, src) in block_no.iter_mut().zip(disk.block_no.iter()) {
                *dst = *src as u32;
            }
            (disk.num_blocks as u32, block_no)
        };
        BCACHE.release(&hblock);
        (num_blocks, block_no)
    }

    fn write_header(&self, dev: &dyn BlockDevice, num_blocks: u32, block_no: &[u32; LOG_MAX_SIZE]) {
        let hblock = BCACHE.acquire(dev, self.log_start.load(Ordering::Relaxed));
        {
            let mut guard = hblock.data().lock_unalertable();
            let mut disk = LogHeaderOnDisk {
                num_blocks: num_blocks as u64,
                block_no: [0; LOG_MAX_SIZE],
            };
            for (dst, src) in disk.block_no.iter_mut().zip(block_no.iter()) {
                *dst = *src as u64;
            }
            guard[..].copy_from_slice(disk.as_bytes());
        }
        BCACHE.sync(dev, None, &hblock);
        BCACHE.release(&hblock);
    }

    /// Recovery on boot: treats the on-disk header as authoritative (no
    /// in-memory `pinned` state exists yet to clear) and replays the
    /// transaction it describes, then truncates -- idempotent if called
    /// again with an already-zeroed header.
    fn recover(&self, dev: &dyn BlockDevice) {
        let (num_blocks, block_no) = self.read_header(dev);
        self.install(dev, num_blocks, &block_no, false);
        self.write_header(dev, 0, &[0; LOG_MAX_SIZE]);
    }

    /// Copies each logged block from its log-body slot back to its home
    /// location. `clear_pinned` is false during boot recovery (nothing
    /// is resident yet) and true during a live commit.
    fn install(&self, dev: &dyn BlockDevice, num_blocks: u32, block_no: &[u32; LOG_MAX_SIZE], clear_pinned: bool) {
        let log_start = self.log_start.load(Ordering::Relaxed);
        for i in 0..num_blocks as usize {
            let log_block = BCACHE.acquire(dev, log_start + 1 + i as u32);
            let home = BCACHE.acquire(dev, block_no[i]);
            {
                let src = log_block.data().lock_unalertable();
                let mut dst = home.data().lock_unalertable();
                **dst = **src;
            }
            BCACHE.sync(dev, None, &home);
            if clear_pinned {
                home.unpin();
            }
            BCACHE.release(&home);
            BCACHE.release(&log_block);
        }
    }

    fn commit(&self, dev: &dyn BlockDevice) {
        let (num_blocks, block_no) = {
            let guard = self.state.lock();
            (guard.num_blocks, guard.block_no)
        };
        if num_blocks == 0 {
            return;
        }
        let log_start = self.log_start.load(Ordering::Relaxed);
        // Step 1: copy each logged block's cached contents into its log
        // body slot and write that slot to disk.
        for i in 0..num_blocks as usize {
            let cached = BCACHE.acquire(dev, block_no[i]);
            let log_block = BCACHE.acquire(dev, log_start + 1 + i as u32);
            {
                let src = cached.data().lock_unalertable();
                let mut dst = log_block.data().lock_unalertable();
                **dst = **src;
            }
            BCACHE.sync(dev, None, &log_block);
            BCACHE.release(&log_block);
            BCACHE.release(&cached);
        }
        // Step 2: the header write is the commit point.
        self.write_header(dev, num_blocks, &block_no);
        // Step 3: copy back out to home locations, unpinning.
        self.install(dev, num_blocks, &block_no, true);
        // Step 4: truncate the log.
        self.write_header(dev, 0, &[0; LOG_MAX_SIZE]);
        let mut guard = self.state.lock();
        guard.num_blocks = 0;
    }

    fn wake_all(guard: &mut LogState) {
        while let Some(p) = guard.waiters.pop_front() {
            p.activate(false);
        }
    }

    /// Blocks until there's no commit in progress and this op's worst
    /// case (`OP_MAX_NUM_BLOCKS` more blocks) still fits under capacity.
    pub fn begin_op(&self) -> Ctx {
        let mut guard = self.state.lock();
        loop {
            let would_fit = guard.num_blocks as usize + (guard.count + 1) * OP_MAX_NUM_BLOCKS
                <= self.capacity.load(Ordering::Relaxed) as usize;
            if !guard.committing && would_fit {
                guard.count += 1;
                break;
            }
            let me = CPUS.my_proc().expect("begin_op: no current proc");
            guard.waiters.push_back(me.clone());
            guard = me.sleep_on(guard, ProcState::Sleeping);
        }
        Ctx {
            rm: OP_MAX_NUM_BLOCKS,
        }
    }

    /// Ends a transaction. The last outstanding op triggers the commit;
    /// everyone else just wakes whoever might now fit under capacity.
    pub fn end_op(&self, ctx: &mut Ctx, dev: &dyn BlockDevice) {
        ctx.rm = 0;
        let should_commit = {
            let mut guard = self.state.lock();
            guard.count -= 1;
            assert!(!guard.committing, "end_op: commit already in progress");
            if guard.count > 0 {
                Self::wake_all(&mut guard);
                false
            } else {
                guard.committing = true;
                true
            }
        };

        if should_commit {
            self.commit(dev);
            let mut guard = self.state.lock();
            guard.committing = false;
            Self::wake_all(&mut guard);
        }
    }

    /// Registers `block_no` in the current transaction's header if it
    /// isn't there already, charging `ctx`'s budget once per block.
    pub fn write(&self, ctx: &mut Ctx, block_no: u32) {
        let mut guard = self.state.lock();
        assert!(guard.count > 0, "log: write outside a transaction");
        if guard.block_no[..guard.num_blocks as usize]
            .iter()
            .any(|&b| b == block_no)
        {
            return;
        }
        assert!(
            (guard.num_blocks as usize) < LOG_MAX_SIZE,
            "log: write exceeds per-transaction header capacity"
        );
        let idx = guard.num_blocks as usize;
        guard.block_no[idx] = block_no;
        guard.num_blocks += 1;
        ctx.rm = ctx
            .rm
            .checked_sub(1)
            .expect("log: write exceeds transaction's block budget");
    }
}

pub static LOG: Log = Log::new();

/// Thin free function so `bio::Cache::sync` doesn't need to know about
/// `Log`'s internals, matching the teacher's `LOG.write(bp)` call
/// shape at the use site.
pub fn log_write(ctx: &mut Ctx, block_no: u32) {
    LOG.write(ctx, block_no);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::BCACHE;
    use alloc::vec;

    // `bio::BCACHE` is a single process-wide static keyed only by
    // absolute block number, not by which `BlockDevice` it came from
    // (spec.md §9's "global mutable state" -- correct for a kernel
    // with exactly one disk). `fs.rs`'s tests exercise that same
    // static over block numbers up to its `NUM_BLOCKS` (400). Pick a
    // disjoint range here so a resident, `valid` cache entry left by
    // one test module is never mistaken for this module's freshly
    // crafted disk bytes.
    const NUM_BLOCKS: u32 = 1000;
    const NUM_LOG_BLOCKS: u32 = 16;

    struct MockDisk {
        blocks: Mutex<alloc::vec::Vec<[u8; 512]>>,
    }
    impl MockDisk {
        fn new() -> Self {
            Self {
                blocks: Mutex::new(vec![[0u8; 512]; NUM_BLOCKS as usize], "mock"),
            }
        }
    }
    impl BlockDevice for MockDisk {
        fn read(&self, sector: u32, dst: &mut [u8; 512]) {
            *dst = self.blocks.lock()[sector as usize];
        }
        fn write(&self, sector: u32, src: &[u8; 512]) {
            self.blocks.lock()[sector as usize] = *src;
        }
    }

    /// Scenario 3 (spec.md §8): a transaction that completes commit
    /// (home locations written, header still non-empty) survives a
    /// simulated crash before step 4's truncation -- a fresh `Log`
    /// replaying that header on "reboot" finds the post-commit contents
    /// already at home, and a second recovery pass over the
    /// now-zeroed header is a no-op.
    #[test]
    fn recovery_replays_uninstalled_header_and_is_idempotent() {
        let _guard = crate::test_support::GLOBAL_STATE_TEST_LOCK.lock();
        // Dedicated log-start distinct from every other test in the
        // binary (see the module-level note above) -- this test reads
        // disk bytes it wrote directly, bypassing `BCACHE`, so it must
        // be the first and only thing ever to touch these block
        // numbers or a resident cache entry from another test would
        // shadow them.
        const LOG_START: u32 = 900;
        let dev = MockDisk::new();
        let target_block: u32 = 970;

        // Simulate a commit that reached step 2 (header written) but
        // crashed before step 3/4: write the log body and header
        // directly, leaving home location untouched.
        let mut payload = [0u8; 512];
        payload[0] = 0xAA;
        dev.blocks.lock()[(LOG_START + 1) as usize] = payload;
        let mut header = [0u8; 512];
        header[0..8].copy_from_slice(&1u64.to_le_bytes());
        header[8..16].copy_from_slice(&(target_block as u64).to_le_bytes());
        dev.blocks.lock()[LOG_START as usize] = header;

        assert_ne!(dev.blocks.lock()[target_block as usize], payload);

        let log = Log::new();
        log.init(&dev, LOG_START, NUM_LOG_BLOCKS);

        assert_eq!(
            dev.blocks.lock()[target_block as usize],
            payload,
            "recovery must install the logged block to its home location"
        );
        let (num_blocks, _) = log.read_header(&dev);
        assert_eq!(num_blocks, 0, "recovery must truncate the header");

        // Re-running recovery against the now-zeroed header changes
        // nothing further.
        let before = dev.blocks.lock().clone();
        log.recover(&dev);
        assert_eq!(*dev.blocks.lock(), before, "second recovery pass must be idempotent");
    }

    /// A single committed transaction is visible at its home block
    /// once `end_op` returns, and the header is truncated back to
    /// empty (ready for the next transaction).
    #[test]
    fn single_transaction_commits_to_home_and_truncates() {
        let _guard = crate::test_support::GLOBAL_STATE_TEST_LOCK.lock();
        const LOG_START: u32 = 930;
        let dev = MockDisk::new();
        let log = Log::new();
        log.init(&dev, LOG_START, NUM_LOG_BLOCKS);

        let target_block: u32 = 980;
        let mut ctx = log.begin_op();
        let b = BCACHE.acquire(&dev, target_block);
        {
            let mut guard = b.data().lock_unalertable();
            guard[0] = 0x42;
        }
        BCACHE.sync(&dev, Some(&mut ctx), &b);
        BCACHE.release(&b);
        log.end_op(&mut ctx, &dev);

        assert_eq!(dev.blocks.lock()[target_block as usize][0], 0x42);
        let (num_blocks, _) = log.read_header(&dev);
        assert_eq!(num_blocks, 0, "commit must truncate the header");
        assert!(!b.is_pinned(), "commit must unpin logged blocks");
    }

    #[test]
    fn begin_op_capacity_matches_header_and_block_budget() {
        let capacity = core::cmp::min(NUM_LOG_BLOCKS - 1, LOG_MAX_SIZE as u32);
        assert_eq!(capacity, NUM_LOG_BLOCKS - 1, "small logs are bounded by block count, not header size");
    }
}
