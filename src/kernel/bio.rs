// Block cache: a bounded, sleep-lock-guarded resident set over 512-byte
// disk blocks. Grounded in the teacher's `bio.rs` for the overall shape
// (a cache-wide spinlock protecting an LRU list of `SleepLock`-guarded
// buffers) but rebuilt against spec.md §4.H directly -- the teacher's
// version is single-core xv6-style (`Rc`/`Weak` LRU links, no
// `acquire_count`/`pinned` fields, no eviction bound); this one tracks
// exactly the fields and eviction policy spec.md names and is
// `Send`/`Sync` throughout instead of `Rc`-based.

use crate::log::{log_write, Ctx};
use crate::param::{BIT_PER_BLOCK, BLOCK_SIZE, EVICTION_THRESHOLD};
use crate::sleeplock::SleepLock;
use crate::spinlock::Mutex;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

/// The cache's only dependency on the actual transport: read/write one
/// 512-byte sector. Implemented by `virtio_disk::Disk`; the cache is
/// generic over it (as `&dyn BlockDevice`) so tests can plug in an
/// in-memory mock instead of real hardware (SPEC_FULL.md §10.4).
pub trait BlockDevice: Sync {
    fn read(&self, sector: u32, dst: &mut [u8; BLOCK_SIZE]);
    fn write(&self, sector: u32, src: &[u8; BLOCK_SIZE]);
}

pub struct BlockData {
    valid: bool,
    data: [u8; BLOCK_SIZE],
}

impl core::ops::Deref for BlockData {
    type Target = [u8; BLOCK_SIZE];
    fn deref(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }
}
impl core::ops::DerefMut for BlockData {
    fn deref_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }
}

/// One resident block. `acquire_count` and `pinned` are read and
/// written only under the cache's LRU lock; the bytes themselves are
/// guarded separately by `sleeplock`, the same split the teacher's
/// `Buf`/`Data` pair makes. The sleep-lock is held only transiently by
/// `Cache::acquire` (to perform the first-touch device read) and by
/// whichever caller is actively reading or writing the bytes -- not
/// for the whole acquire/release span, which `acquire_count` already
/// tracks.
pub struct Block {
    pub block_no: u32,
    acquire_count: Mutex<usize>,
    pinned: Mutex<bool>,
    sleeplock: SleepLock<BlockData>,
}

impl Block {
    fn new(block_no: u32) -> Arc<Self> {
        Arc::new(Self {
            block_no,
            acquire_count: Mutex::new(0, "block.acquire_count"),
            pinned: Mutex::new(false, "block.pinned"),
            sleeplock: SleepLock::new(
                BlockData {
                    valid: false,
                    data: [0; BLOCK_SIZE],
                },
                "block.data",
            ),
        })
    }

    pub fn pin(&self) {
        *self.pinned.lock() = true;
    }
    pub fn unpin(&self) {
        *self.pinned.lock() = false;
    }
    pub fn is_pinned(&self) -> bool {
        *self.pinned.lock()
    }

    /// Bytes must only be touched while holding the guard this
    /// returns, and only after confirming the caller's own
    /// `acquire`/`release` bracket is still open.
    pub fn data(&self) -> &SleepLock<BlockData> {
        &self.sleeplock
    }
}

/// The LRU list itself plus the eviction policy, kept as a plain,
/// un-global'd struct so it can be exercised directly (SPEC_FULL.md
/// §10.4) without a real device or scheduler underneath it.
struct Lru {
    // front = most recently used.
    list: VecDeque<Arc<Block>>,
}

impl Lru {
    const fn new() -> Self {
        Self {
            list: VecDeque::new(),
        }
    }

    fn find(&self, block_no: u32) -> Option<Arc<Block>> {
        self.list.iter().find(|b| b.block_no == block_no).cloned()
    }

    fn promote(&mut self, block_no: u32) {
        if let Some(pos) = self.list.iter().position(|b| b.block_no == block_no) {
            let b = self.list.remove(pos).unwrap();
            self.list.push_front(b);
        }
    }

    /// Evicts from the tail, skipping any block still in use, until the
    /// list is back under `EVICTION_THRESHOLD` or there is nothing left
    /// that can be evicted.
    fn evict_if_over_threshold(&mut self) {
        if self.list.len() <= EVICTION_THRESHOLD {
            return;
        }
        let mut scanned = 0;
        while self.list.len() > EVICTION_THRESHOLD && scanned < self.list.len() {
            let tail = self.list.len() - 1 - scanned;
            let b = &self.list[tail];
            if *b.acquire_count.lock() > 0 || b.is_pinned() {
                scanned += 1;
                continue;
            }
            self.list.remove(tail);
        }
    }
}

pub struct Cache {
    lru: Mutex<Lru>,
}

impl Cache {
    pub const fn new() -> Self {
        Self {
            lru: Mutex::new(Lru::new(), "bcache"),
        }
    }

    /// Finds-or-creates the resident entry for `block_no`, bumps its
    /// `acquire_count`, promotes it to the LRU head, then -- outside
    /// the cache lock -- takes the block's own sleep-lock and reads it
    /// in from `dev` the first time it's touched.
    pub fn acquire(&self, dev: &dyn BlockDevice, block_no: u32) -> Arc<Block> {
        let block = {
            let mut lru = self.lru.lock();
            lru.evict_if_over_threshold();
            if let Some(b) = lru.find(block_no) {
                *b.acquire_count.lock() += 1;
                lru.promote(block_no);
                b
            } else {
                let b = Block::new(block_no);
                *b.acquire_count.lock() = 1;
                lru.list.push_front(b.clone());
                b
            }
        };

        let mut guard = block.sleeplock.lock_unalertable();
        if !guard.valid {
            dev.read(block_no, &mut guard.data);
            guard.valid = true;
        }
        drop(guard);
        block
    }

    /// Decrements `acquire_count` for a block the caller is done with.
    /// The caller must not hold a `data()` guard on it when calling
    /// this.
    pub fn release(&self, block: &Arc<Block>) {
        let mut count = block.acquire_count.lock();
        assert!(*count > 0, "Cache::release: acquire_count underflow");
        *count -= 1;
    }

    /// Writes `block` through to `dev` outside any transaction, or, if
    /// `ctx` is `Some`, pins it and registers it in the log (charging
    /// `ctx`'s per-transaction budget once per block, the first time).
    pub fn sync(&self, dev: &dyn BlockDevice, ctx: Option<&mut Ctx>, block: &Arc<Block>) {
        match ctx {
            None => {
                let guard = block.sleeplock.lock_unalertable();
                dev.write(block.block_no, &guard.data);
            }
            Some(ctx) => {
                block.pin();
                log_write(ctx, block.block_no);
            }
        }
    }

    /// Scans the bitmap region for the first zero bit, claims it,
    /// zeroes the corresponding data block, and syncs both. Returns the
    /// newly allocated data block's absolute block number.
    pub fn alloc(
        &self,
        dev: &dyn BlockDevice,
        ctx: &mut Ctx,
        bitmap_start: u32,
        num_blocks: u32,
    ) -> u32 {
        let mut b = 0u32;
        while b < num_blocks {
            let bmap_block = self.acquire(dev, bitmap_start + b / BIT_PER_BLOCK as u32);
            let span = core::cmp::min(BIT_PER_BLOCK as u32, num_blocks - b);
            let found = {
                let mut guard = bmap_block.sleeplock.lock_unalertable();
                let mut found = None;
                for i in 0..span {
                    let bit = (b + i) as usize % BIT_PER_BLOCK;
                    let byte = bit / 8;
                    let mask = 1u8 << (bit % 8);
                    if guard.data[byte] & mask == 0 {
                        guard.data[byte] |= mask;
                        found = Some(b + i);
                        break;
                    }
                }
                found
            };
            self.sync(dev, Some(ctx), &bmap_block);
            self.release(&bmap_block);
            if let Some(block_no) = found {
                let data_block = self.acquire(dev, block_no);
                {
                    let mut guard = data_block.sleeplock.lock_unalertable();
                    guard.data = [0; BLOCK_SIZE];
                }
                self.sync(dev, Some(ctx), &data_block);
                self.release(&data_block);
                return block_no;
            }
            b += span;
        }
        panic!("Cache::alloc: out of data blocks");
    }

    /// Clears bit `b` in the bitmap and syncs the owning bitmap block.
    pub fn free(&self, dev: &dyn BlockDevice, ctx: &mut Ctx, bitmap_start: u32, b: u32) {
        let bmap_block = self.acquire(dev, bitmap_start + b / BIT_PER_BLOCK as u32);
        {
            let mut guard = bmap_block.sleeplock.lock_unalertable();
            let bit = b as usize % BIT_PER_BLOCK;
            let byte = bit / 8;
            let mask = 1u8 << (bit % 8);
            assert!(guard.data[byte] & mask != 0, "Cache::free: double free");
            guard.data[byte] &= !mask;
        }
        self.sync(dev, Some(ctx), &bmap_block);
        self.release(&bmap_block);
    }
}

pub static BCACHE: Cache = Cache::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinlock::Mutex as StdMutex;

    struct MockDisk {
        blocks: StdMutex<alloc::vec::Vec<[u8; BLOCK_SIZE]>>,
    }

    impl MockDisk {
        fn new(n: usize) -> Self {
            Self {
                blocks: StdMutex::new(alloc::vec![[0u8; BLOCK_SIZE]; n], "mock_disk"),
            }
        }
    }

    impl BlockDevice for MockDisk {
        fn read(&self, sector: u32, dst: &mut [u8; BLOCK_SIZE]) {
            *dst = self.blocks.lock()[sector as usize];
        }
        fn write(&self, sector: u32, src: &[u8; BLOCK_SIZE]) {
            self.blocks.lock()[sector as usize] = *src;
        }
    }

    #[test]
    fn acquire_then_acquire_promotes_and_reuses() {
        let dev = MockDisk::new(4);
        let cache = Cache::new();
        let a = cache.acquire(&dev, 2);
        let b = cache.acquire(&dev, 2);
        assert!(Arc::ptr_eq(&a, &b));
        cache.release(&a);
        cache.release(&b);
    }

    #[test]
    fn eviction_skips_acquired_and_pinned_blocks() {
        let dev = MockDisk::new(EVICTION_THRESHOLD + 4);
        let cache = Cache::new();
        let held = cache.acquire(&dev, 0);
        held.pin();
        cache.release(&held);
        for i in 1..=(EVICTION_THRESHOLD as u32 + 2) {
            let b = cache.acquire(&dev, i);
            cache.release(&b);
        }
        let lru = cache.lru.lock();
        assert!(lru.find(0).is_some(), "pinned block must not be evicted");
    }
}
