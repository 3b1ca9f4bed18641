// Inode layer: allocation, lookup, byte-range read/write and directory
// entry manipulation, all addressed explicitly by inode number through
// a caller-supplied `log::Ctx` -- never by path. Grounded in the
// teacher's `fs.rs` for the five-layer shape (blocks / log / inodes /
// directories / names) and the in-memory inode cache it keeps over the
// block cache, but this file keeps only the first three layers:
// directory *entries* are manipulated here (spec.md §4.J), but path
// resolution, `link`/`unlink`, and the syscall-facing `Path`/`namei`
// machinery the teacher builds on top are out of scope and have been
// dropped.

use crate::bio::{BlockDevice, BCACHE};
use crate::lazy::SyncOnceCell;
use crate::log::Ctx;
use crate::param::{BIT_PER_BLOCK, BLOCK_SIZE, DIRSIZ, MAXFILE, NDIRECT, NINDIRECT};
use crate::spinlock::Mutex;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

pub const ROOT_INODE: u32 = 1;

/// On-disk inode type. `INVALID` (zero) marks a free slot; spec.md
/// §4.J only ever tests against `INVALID`, so the remaining values are
/// opaque payload as far as this layer is concerned.
pub const T_INVALID: u16 = 0;
pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;
pub const T_DEVICE: u16 = 3;

/// Super block, read once at `init` and never mutated afterward.
#[derive(Clone, Copy, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct SuperBlock {
    pub num_blocks: u32,
    pub num_data_blocks: u32,
    pub num_inodes: u32,
    pub num_log_blocks: u32,
    pub log_start: u32,
    pub inode_start: u32,
    pub bitmap_start: u32,
}

pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<DInode>();

/// The on-disk inode record, shared verbatim with `mkfs` so the image
/// builder and the kernel agree on layout byte-for-byte.
#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct DInode {
    pub type_: u16,
    pub major: u16,
    pub minor: u16,
    pub num_links: u16,
    pub num_bytes: u32,
    pub addrs: [u32; NDIRECT],
    pub indirect: u32,
}

impl DInode {
    pub const fn zeroed() -> Self {
        Self {
            type_: 0,
            major: 0,
            minor: 0,
            num_links: 0,
            num_bytes: 0,
            addrs: [0; NDIRECT],
            indirect: 0,
        }
    }
}

/// The on-disk directory entry, also shared with `mkfs`.
#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct DirEnt {
    pub inode_no: u16,
    pub name: [u8; DIRSIZ],
}

impl DirEnt {
    pub const fn zeroed() -> Self {
        Self {
            inode_no: 0,
            name: [0; DIRSIZ],
        }
    }
}

static SB: SyncOnceCell<SuperBlock> = SyncOnceCell::new();

pub fn super_block() -> &'static SuperBlock {
    SB.get().expect("fs: super block not initialized")
}

/// An in-memory inode record. `type_`, `major`, `minor`, `num_links`,
/// `num_bytes`, `addrs`, `indirect` mirror the on-disk fields; `valid`
/// tracks whether they've been loaded from disk yet, guarded by
/// `data`'s sleep-lock the same way `bio::Block::valid` is.
pub struct Inode {
    pub inode_no: u32,
    refs: Mutex<usize>,
    data: crate::sleeplock::SleepLock<InodeData>,
}

struct InodeData {
    valid: bool,
    type_: u16,
    major: u16,
    minor: u16,
    num_links: u16,
    num_bytes: u32,
    addrs: [u32; NDIRECT],
    indirect: u32,
}

impl InodeData {
    const fn zeroed() -> Self {
        Self {
            valid: false,
            type_: T_INVALID,
            major: 0,
            minor: 0,
            num_links: 0,
            num_bytes: 0,
            addrs: [0; NDIRECT],
            indirect: 0,
        }
    }
}

/// Table of in-memory inodes currently referenced by someone, analogous
/// to `bio::Cache`'s resident set but unbounded -- spec.md names no
/// eviction policy for inodes, only ref-counting.
struct Table {
    list: VecDeque<Arc<Inode>>,
}

static TABLE: Mutex<Table> = Mutex::new(
    Table {
        list: VecDeque::new(),
    },
    "inode_table",
);

/// Reads the super block (at block 1, per spec.md §6's on-disk layout)
/// and arms the log over the log region it names. Must run before any
/// other `fs::` call.
pub fn init(dev: &dyn BlockDevice) {
    let sb_block = BCACHE.acquire(dev, 1);
    let sb = {
        let guard = sb_block.data().lock_unalertable();
        SuperBlock::read_from_prefix(&guard[..]).expect("fs: super block read failed")
    };
    BCACHE.release(&sb_block);
    crate::log::LOG.init(dev, sb.log_start, sb.num_log_blocks);
    SB.set(sb).ok();
}

fn inode_block(inode_no: u32) -> u32 {
    super_block().inode_start + inode_no / INODES_PER_BLOCK as u32
}

fn read_dinode(dev: &dyn BlockDevice, inode_no: u32) -> DInode {
    let b = BCACHE.acquire(dev, inode_block(inode_no));
    let dinode = {
        let guard = b.data().lock_unalertable();
        let offset = (inode_no as usize % INODES_PER_BLOCK) * core::mem::size_of::<DInode>();
        DInode::read_from_prefix(&guard[offset..]).expect("fs: on-disk inode read failed")
    };
    BCACHE.release(&b);
    dinode
}

fn write_dinode(dev: &dyn BlockDevice, ctx: &mut Ctx, inode_no: u32, dinode: &DInode) {
    let b = BCACHE.acquire(dev, inode_block(inode_no));
    {
        let mut guard = b.data().lock_unalertable();
        let offset = (inode_no as usize % INODES_PER_BLOCK) * core::mem::size_of::<DInode>();
        guard[offset..offset + core::mem::size_of::<DInode>()].copy_from_slice(dinode.as_bytes());
    }
    BCACHE.sync(dev, Some(ctx), &b);
    BCACHE.release(&b);
}

/// Scans the inode table from inode 1 upward for the first on-disk
/// slot whose type is `INVALID`, stamps it `{type_, rest zero}`, and
/// syncs it. Panics on exhaustion (spec.md §7: resource exhaustion here
/// is a fatal panic).
pub fn alloc(dev: &dyn BlockDevice, ctx: &mut Ctx, type_: u16) -> u32 {
    let num_inodes = super_block().num_inodes;
    for inode_no in 1..num_inodes {
        let existing = read_dinode(dev, inode_no);
        if existing.type_ == T_INVALID {
            let dinode = DInode {
                type_,
                ..DInode::zeroed()
            };
            write_dinode(dev, ctx, inode_no, &dinode);
            return inode_no;
        }
    }
    panic!("fs::alloc: no free inodes");
}

/// Finds or creates the in-memory record for `inode_no`, bumping its
/// ref-count. On a fresh record, briefly takes and releases the
/// sleep-lock purely as a memory barrier before returning -- matching
/// spec.md §4.J exactly, since the record starts invalid and is loaded
/// lazily on first real use.
pub fn get(inode_no: u32) -> Arc<Inode> {
    let mut table = TABLE.lock();
    if let Some(ip) = table.list.iter().find(|ip| ip.inode_no == inode_no) {
        *ip.refs.lock() += 1;
        let ip = ip.clone();
        drop(table);
        drop(ip.data.lock_unalertable());
        return ip;
    }

    let ip = Arc::new(Inode {
        inode_no,
        refs: Mutex::new(1, "inode.refs"),
        data: crate::sleeplock::SleepLock::new(InodeData::zeroed(), "inode.data"),
    });
    table.list.push_back(ip.clone());
    drop(table);
    drop(ip.data.lock_unalertable());
    ip
}

/// `do_write == false`: if invalid, lazily loads the on-disk entry.
/// `do_write == true`: the record must already be valid; writes it
/// back through the block cache. Invalid + do_write is a programmer
/// error (spec.md §7).
pub fn sync(dev: &dyn BlockDevice, ctx: Option<&mut Ctx>, ip: &Arc<Inode>, do_write: bool) {
    let mut guard = ip.data.lock_unalertable();
    if !guard.valid {
        assert!(!do_write, "fs::sync: write of an invalid inode");
        let dinode = read_dinode(dev, ip.inode_no);
        guard.type_ = dinode.type_;
        guard.major = dinode.major;
        guard.minor = dinode.minor;
        guard.num_links = dinode.num_links;
        guard.num_bytes = dinode.num_bytes;
        guard.addrs = dinode.addrs;
        guard.indirect = dinode.indirect;
        guard.valid = true;
        return;
    }
    if do_write {
        let ctx = ctx.expect("fs::sync: do_write requires a transaction ctx");
        let dinode = DInode {
            type_: guard.type_,
            major: guard.major,
            minor: guard.minor,
            num_links: guard.num_links,
            num_bytes: guard.num_bytes,
            addrs: guard.addrs,
            indirect: guard.indirect,
        };
        write_dinode(dev, ctx, ip.inode_no, &dinode);
    }
}

/// Drops one reference. If it was the last one, the record is valid,
/// and `num_links == 0`, the inode is truly dead: detach it from the
/// table, free its blocks, mark it `INVALID` on disk, and drop the
/// record.
pub fn put(dev: &dyn BlockDevice, ctx: &mut Ctx, ip: Arc<Inode>) {
    let mut table = TABLE.lock();
    let last_ref = *ip.refs.lock() == 1;
    let (valid, num_links) = {
        let guard = ip.data.lock_unalertable();
        (guard.valid, guard.num_links)
    };
    if last_ref && valid && num_links == 0 {
        if let Some(pos) = table.list.iter().position(|p| Arc::ptr_eq(p, &ip)) {
            table.list.remove(pos);
        }
        drop(table);
        let mut guard = ip.data.lock_unalertable();
        clear_locked(dev, ctx, &mut guard);
        guard.type_ = T_INVALID;
        let dinode = DInode {
            type_: T_INVALID,
            major: guard.major,
            minor: guard.minor,
            num_links: guard.num_links,
            num_bytes: guard.num_bytes,
            addrs: guard.addrs,
            indirect: guard.indirect,
        };
        write_dinode(dev, ctx, ip.inode_no, &dinode);
        guard.valid = false;
    } else {
        *ip.refs.lock() -= 1;
    }
}

fn clear_locked(dev: &dyn BlockDevice, ctx: &mut Ctx, guard: &mut InodeData) {
    for addr in guard.addrs.iter_mut() {
        if *addr != 0 {
            BCACHE.free(dev, ctx, super_block().bitmap_start, *addr);
            *addr = 0;
        }
    }
    if guard.indirect != 0 {
        let indirect_block = BCACHE.acquire(dev, guard.indirect);
        let ptrs = {
            let data = indirect_block.data().lock_unalertable();
            let mut ptrs = [0u32; NINDIRECT];
            for (i, p) in ptrs.iter_mut().enumerate() {
                *p = u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
            }
            ptrs
        };
        BCACHE.release(&indirect_block);
        for p in ptrs {
            if p != 0 {
                BCACHE.free(dev, ctx, super_block().bitmap_start, p);
            }
        }
        BCACHE.free(dev, ctx, super_block().bitmap_start, guard.indirect);
        guard.indirect = 0;
    }
    guard.num_bytes = 0;
}

/// Frees every block an inode owns, direct and (if present) indirect.
pub fn clear(dev: &dyn BlockDevice, ctx: &mut Ctx, ip: &Arc<Inode>) {
    let mut guard = ip.data.lock_unalertable();
    clear_locked(dev, ctx, &mut guard);
}

/// Maps a logical block index to a physical block number, allocating
/// lazily when `ctx` is `Some`. Panics on an out-of-range index
/// (spec.md §7: programmer-contract violation).
pub fn map(dev: &dyn BlockDevice, mut ctx: Option<&mut Ctx>, ip: &Arc<Inode>, blkidx: usize) -> u32 {
    let mut guard = ip.data.lock_unalertable();
    if blkidx < NDIRECT {
        if guard.addrs[blkidx] == 0 {
            if let Some(ctx) = ctx.as_deref_mut() {
                guard.addrs[blkidx] =
                    BCACHE.alloc(dev, ctx, super_block().bitmap_start, super_block().num_blocks);
            }
        }
        return guard.addrs[blkidx];
    }
    let idx = blkidx - NDIRECT;
    assert!(idx < NINDIRECT, "fs::map: block index out of range");

    if guard.indirect == 0 {
        match ctx.as_deref_mut() {
            Some(ctx) => {
                guard.indirect = BCACHE.alloc(
                    dev,
                    ctx,
                    super_block().bitmap_start,
                    super_block().num_blocks,
                );
            }
            None => return 0,
        }
    }

    let indirect_block = BCACHE.acquire(dev, guard.indirect);
    let existing = {
        let data = indirect_block.data().lock_unalertable();
        u32::from_le_bytes(data[idx * 4..idx * 4 + 4].try_into().unwrap())
    };
    let result = if existing != 0 {
        existing
    } else if let Some(ctx) = ctx.as_deref_mut() {
        let new_block =
            BCACHE.alloc(dev, ctx, super_block().bitmap_start, super_block().num_blocks);
        {
            let mut data = indirect_block.data().lock_unalertable();
            data[idx * 4..idx * 4 + 4].copy_from_slice(&new_block.to_le_bytes());
        }
        BCACHE.sync(dev, Some(ctx), &indirect_block);
        new_block
    } else {
        0
    };
    BCACHE.release(&indirect_block);
    result
}

/// Clamps `n` to what's actually in the file, then copies byte-for-byte
/// out of the blocks covering `[off, off+n)`. A zero block pointer
/// (never allocated, or beyond `num_bytes`) reads as zeroes.
pub fn read(dev: &dyn BlockDevice, ip: &Arc<Inode>, dst: &mut [u8], off: u32, n: u32) -> u32 {
    let num_bytes = { ip.data.lock_unalertable().num_bytes };
    let n = n.min(num_bytes.saturating_sub(off));
    if off > num_bytes || n == 0 {
        return 0;
    }

    let mut total = 0u32;
    while total < n {
        let blkidx = ((off + total) / BLOCK_SIZE as u32) as usize;
        let block_off = (off + total) as usize % BLOCK_SIZE;
        let chunk = core::cmp::min(n - total, (BLOCK_SIZE - block_off) as u32) as usize;
        let block_no = map(dev, None, ip, blkidx);
        let dst_range = total as usize..total as usize + chunk;
        if block_no == 0 {
            dst[dst_range].fill(0);
        } else {
            let b = BCACHE.acquire(dev, block_no);
            {
                let guard = b.data().lock_unalertable();
                dst[dst_range].copy_from_slice(&guard[block_off..block_off + chunk]);
            }
            BCACHE.release(&b);
        }
        total += chunk as u32;
    }
    total
}

/// Writes `src` at `[off, off+n)`, allocating blocks as needed, and
/// grows `num_bytes` if the write extends past the current end.
/// `off + n` must stay within `MAXFILE` blocks worth of bytes.
pub fn write(dev: &dyn BlockDevice, ctx: &mut Ctx, ip: &Arc<Inode>, src: &[u8], off: u32, n: u32) -> u32 {
    assert!(
        (off as u64 + n as u64) <= (MAXFILE * BLOCK_SIZE) as u64,
        "fs::write: beyond max file size"
    );

    let mut total = 0u32;
    while total < n {
        let blkidx = ((off + total) / BLOCK_SIZE as u32) as usize;
        let block_off = (off + total) as usize % BLOCK_SIZE;
        let chunk = core::cmp::min(n - total, (BLOCK_SIZE - block_off) as u32) as usize;
        let block_no = map(dev, Some(&mut *ctx), ip, blkidx);
        let b = BCACHE.acquire(dev, block_no);
        {
            let mut guard = b.data().lock_unalertable();
            let src_range = total as usize..total as usize + chunk;
            guard[block_off..block_off + chunk].copy_from_slice(&src[src_range]);
        }
        BCACHE.sync(dev, Some(&mut *ctx), &b);
        BCACHE.release(&b);
        total += chunk as u32;
    }

    let mut guard = ip.data.lock_unalertable();
    if off + total > guard.num_bytes {
        guard.num_bytes = off + total;
    }
    drop(guard);
    sync(dev, Some(ctx), ip, true);
    total
}

fn dirent_name(name: &str) -> [u8; DIRSIZ] {
    let mut buf = [0u8; DIRSIZ];
    let bytes = name.as_bytes();
    let len = bytes.len().min(DIRSIZ);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn dirent_matches(entry_name: &[u8; DIRSIZ], name: &str) -> bool {
    entry_name == &dirent_name(name)
}

/// Linearly scans `dir`'s 16-byte entries for `name`; a non-zero
/// `inode_no` with matching bytes is a hit. Returns `0` on a miss
/// (inode 0 is never a valid allocatable inode, see `ROOT_INODE`).
pub fn lookup(dev: &dyn BlockDevice, dir: &Arc<Inode>, name: &str, off_out: &mut u32) -> u32 {
    let num_bytes = { dir.data.lock_unalertable().num_bytes };
    let entry_size = core::mem::size_of::<DirEnt>() as u32;
    let mut off = 0;
    while off < num_bytes {
        let mut raw = [0u8; 16];
        read(dev, dir, &mut raw, off, entry_size);
        let entry = DirEnt::read_from(&raw[..]).expect("fs::lookup: short directory entry");
        if entry.inode_no != 0 && dirent_matches(&entry.name, name) {
            *off_out = off;
            return entry.inode_no as u32;
        }
        off += entry_size;
    }
    0
}

/// Rejects a duplicate name; otherwise finds the first free slot
/// (`inode_no == 0`) or appends, writes the entry, and returns the
/// slot's byte offset.
pub fn insert(dev: &dyn BlockDevice, ctx: &mut Ctx, dir: &Arc<Inode>, name: &str, ino: u32) -> u32 {
    let mut unused_off = 0;
    assert_eq!(lookup(dev, dir, name, &mut unused_off), 0, "fs::insert: duplicate name");

    let num_bytes = { dir.data.lock_unalertable().num_bytes };
    let entry_size = core::mem::size_of::<DirEnt>() as u32;
    let mut off = 0;
    let mut free_off = num_bytes;
    while off < num_bytes {
        let mut raw = [0u8; 16];
        read(dev, dir, &mut raw, off, entry_size);
        let entry = DirEnt::read_from(&raw[..]).expect("fs::insert: short directory entry");
        if entry.inode_no == 0 {
            free_off = off;
            break;
        }
        off += entry_size;
    }

    let entry = DirEnt {
        inode_no: ino as u16,
        name: dirent_name(name),
    };
    write(dev, ctx, dir, entry.as_bytes(), free_off, entry_size);
    free_off
}

/// Overwrites the entry at byte offset `off` with zeros. `off` must be
/// entry-aligned and within the directory's current length.
pub fn remove(dev: &dyn BlockDevice, ctx: &mut Ctx, dir: &Arc<Inode>, off: u32) {
    let entry_size = core::mem::size_of::<DirEnt>() as u32;
    let num_bytes = { dir.data.lock_unalertable().num_bytes };
    assert_eq!(off % entry_size, 0, "fs::remove: misaligned directory offset");
    assert!(off < num_bytes, "fs::remove: offset out of range");
    let zero = [0u8; 16];
    write(dev, ctx, dir, &zero, off, entry_size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LOG;
    use alloc::vec;

    const NUM_BLOCKS: u32 = 400;
    const NUM_LOG_BLOCKS: u32 = 16;
    const LOG_START: u32 = 2;
    const INODE_START: u32 = LOG_START + NUM_LOG_BLOCKS;
    const NUM_INODES: u32 = 64;
    const INODE_BLOCKS: u32 = (NUM_INODES as usize).div_ceil(INODES_PER_BLOCK) as u32;
    const BITMAP_START: u32 = INODE_START + INODE_BLOCKS;
    const NUM_DATA_BLOCKS: u32 = 200;

    struct MockDisk {
        blocks: crate::spinlock::Mutex<alloc::vec::Vec<[u8; BLOCK_SIZE]>>,
    }
    impl MockDisk {
        fn new() -> Self {
            Self {
                blocks: crate::spinlock::Mutex::new(vec![[0u8; BLOCK_SIZE]; NUM_BLOCKS as usize], "mock"),
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

    fn setup(dev: &MockDisk) {
        let sb = SuperBlock {
            num_blocks: NUM_BLOCKS,
            num_data_blocks: NUM_DATA_BLOCKS,
            num_inodes: NUM_INODES,
            num_log_blocks: NUM_LOG_BLOCKS,
            log_start: LOG_START,
            inode_start: INODE_START,
            bitmap_start: BITMAP_START,
        };
        dev.blocks.lock()[1][..core::mem::size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());

        // Mirror mkfs's `balloc`: mark the metadata region -- boot/super,
        // log, inode table, and the bitmap block itself -- as allocated
        // before anything calls `BCACHE.alloc`. Otherwise the allocator's
        // first-zero-bit scan hands out block 0 as the first "data"
        // block, and `map`/`read` read 0 back as their unallocated
        // sentinel instead of a real block number.
        const NMETA: u32 = BITMAP_START + 1;
        assert!((NMETA as usize) < BIT_PER_BLOCK, "test fs image too small for a single bitmap block");
        let mut bitmap = [0u8; BLOCK_SIZE];
        for i in 0..NMETA {
            bitmap[i as usize / 8] |= 1 << (i % 8);
        }
        dev.blocks.lock()[BITMAP_START as usize] = bitmap;

        LOG.init(dev, sb.log_start, sb.num_log_blocks);
        SB.set(sb).ok();
    }

    #[test]
    fn alloc_write_read_round_trip() {
        let _guard = crate::test_support::GLOBAL_STATE_TEST_LOCK.lock();
        let dev = MockDisk::new();
        setup(&dev);

        let mut ctx = LOG.begin_op();
        let ino = alloc(&dev, &mut ctx, T_FILE);
        let ip = get(ino);
        sync(&dev, None, &ip, false);

        let data = vec![b'A'; 600];
        let written = write(&dev, &mut ctx, &ip, &data, 0, 600);
        LOG.end_op(&mut ctx, &dev);
        assert_eq!(written, 600);
        assert_eq!(ip.data.lock().num_bytes, 600);

        let mut out = vec![0u8; 600];
        let n = read(&dev, &ip, &mut out, 0, 600);
        assert_eq!(n, 600);
        assert_eq!(out, data);
    }

    #[test]
    fn directory_insert_lookup_remove_reuses_hole() {
        let _guard = crate::test_support::GLOBAL_STATE_TEST_LOCK.lock();
        let dev = MockDisk::new();
        setup(&dev);

        let mut ctx = LOG.begin_op();
        let dir_ino = alloc(&dev, &mut ctx, T_DIR);
        let dir = get(dir_ino);
        sync(&dev, None, &dir, false);

        let off0 = insert(&dev, &mut ctx, &dir, "foo", 5);
        assert_eq!(off0, 0);
        let mut found_off = u32::MAX;
        assert_eq!(lookup(&dev, &dir, "foo", &mut found_off), 5);
        assert_eq!(found_off, 0);

        remove(&dev, &mut ctx, &dir, 0);
        assert_eq!(lookup(&dev, &dir, "foo", &mut found_off), 0);

        let off1 = insert(&dev, &mut ctx, &dir, "bar", 7);
        assert_eq!(off1, 0, "freed slot should be reused");
        LOG.end_op(&mut ctx, &dev);
    }
}
