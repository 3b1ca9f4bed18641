// Offline image builder: formats a flat disk image with the on-disk
// layout `kernel::fs` expects -- boot block, super block, zeroed log,
// zeroed inode table, a bitmap with the metadata region pre-marked
// used, and a root directory -- then optionally copies host files in
// as flat-content inodes so a test has something bigger than an empty
// tree to read back. Grounded in the teacher's `mkfs/main.rs` for the
// overall sector-by-sector build shape (`FsImg`'s `wsect`/`rsect`,
// `ialloc`/`iappend`/`balloc`); rewritten against the layout this
// crate's `kernel::fs` actually implements, and built against that
// module directly (not a hand-duplicated struct set) so the image
// builder and the kernel can never drift apart on field layout.
//
// There is no path resolution or syscall ABI in this crate (out of
// scope), so unlike the teacher's mkfs the files this copies in sit
// directly off the root directory by name and nothing ever executes
// them.

use mkfs::fs::{DInode, DirEnt, SuperBlock, INODES_PER_BLOCK, ROOT_INODE, T_DIR, T_FILE};
use mkfs::param::{BIT_PER_BLOCK, BLOCK_SIZE, DIRSIZ, MAXFILE, NDIRECT, NINDIRECT};
use std::convert::TryInto;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process;
use zerocopy::{AsBytes, FromBytes};

/// Total 512-byte blocks in the generated image (1000 KiB).
const FSSIZE: usize = 2000;
const NINODES: usize = 200;
/// Capacity is `NUM_LOG_BLOCKS - 1` header-tracked records; sized well
/// above `OP_MAX_NUM_BLOCKS` so a transaction never starves for log space.
const NUM_LOG_BLOCKS: usize = 32;

const LOG_START: usize = 2;
const INODE_BLOCKS: usize = NINODES / INODES_PER_BLOCK + 1;
const INODE_START: usize = LOG_START + NUM_LOG_BLOCKS;
/// Same one-block-of-slop convention as the teacher's `NBITMAP`.
const NUM_BITMAP_BLOCKS: usize = FSSIZE / BIT_PER_BLOCK + 1;
const BITMAP_START: usize = INODE_START + INODE_BLOCKS;
const NMETA: usize = BITMAP_START + NUM_BITMAP_BLOCKS;
const NUM_DATA_BLOCKS: usize = FSSIZE - NMETA;

static ZEROS: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

struct FsImg {
    sb: SuperBlock,
    img: File,
    free_inode: u32,
    free_block: u32,
}

impl FsImg {
    fn new<P: AsRef<Path>>(sb: SuperBlock, path: P) -> io::Result<Self> {
        Ok(Self {
            sb,
            img: OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .read(true)
                .open(path)?,
            free_inode: ROOT_INODE,
            free_block: NMETA as u32,
        })
    }

    fn wsect(&mut self, sec: u32, buf: &[u8; BLOCK_SIZE]) -> io::Result<()> {
        self.img.seek(SeekFrom::Start(sec as u64 * BLOCK_SIZE as u64))?;
        self.img.write_all(buf)
    }

    fn rsect(&mut self, sec: u32, buf: &mut [u8; BLOCK_SIZE]) -> io::Result<()> {
        self.img.seek(SeekFrom::Start(sec as u64 * BLOCK_SIZE as u64))?;
        self.img.read_exact(buf)
    }

    fn winode(&mut self, inode_no: u32, dinode: &DInode) -> io::Result<()> {
        let block_no = self.sb.inode_start + inode_no / INODES_PER_BLOCK as u32;
        let mut buf = [0u8; BLOCK_SIZE];
        self.rsect(block_no, &mut buf)?;
        let slot = inode_no as usize % INODES_PER_BLOCK;
        let size = core::mem::size_of::<DInode>();
        buf[slot * size..(slot + 1) * size].copy_from_slice(dinode.as_bytes());
        self.wsect(block_no, &buf)
    }

    fn rinode(&mut self, inode_no: u32) -> io::Result<DInode> {
        let block_no = self.sb.inode_start + inode_no / INODES_PER_BLOCK as u32;
        let mut buf = [0u8; BLOCK_SIZE];
        self.rsect(block_no, &mut buf)?;
        let slot = inode_no as usize % INODES_PER_BLOCK;
        let size = core::mem::size_of::<DInode>();
        Ok(DInode::read_from(&buf[slot * size..(slot + 1) * size]).unwrap())
    }

    fn ialloc(&mut self, type_: u16) -> io::Result<u32> {
        let inode_no = self.free_inode;
        self.free_inode += 1;
        let mut dinode = DInode::zeroed();
        dinode.type_ = type_;
        dinode.num_links = 1;
        self.winode(inode_no, &dinode)?;
        Ok(inode_no)
    }

    /// Marks the bits for blocks `[0, used)` as allocated: blocks 0..NMETA
    /// are the boot/super/log/inode/bitmap regions mkfs itself occupies,
    /// never available to `fs::map`'s allocator.
    fn balloc(&mut self, used: u32) -> io::Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        assert!((used as usize) < BIT_PER_BLOCK, "mkfs: image too small for a single bitmap block");
        for i in 0..used {
            buf[i as usize / 8] |= 1 << (i % 8);
        }
        self.wsect(self.sb.bitmap_start, &buf)
    }

    fn iappend(&mut self, inode_no: u32, data: &[u8]) -> io::Result<()> {
        let mut dinode = self.rinode(inode_no)?;
        let mut off = dinode.num_bytes as usize;
        let mut n = data.len();
        let mut p = 0usize;

        while n > 0 {
            let fbn = off / BLOCK_SIZE;
            assert!(fbn < MAXFILE, "mkfs: file exceeds MAXFILE");
            let block_no = if fbn < NDIRECT {
                if dinode.addrs[fbn] == 0 {
                    dinode.addrs[fbn] = self.free_block;
                    self.free_block += 1;
                }
                dinode.addrs[fbn]
            } else {
                let idx = fbn - NDIRECT;
                if dinode.indirect == 0 {
                    dinode.indirect = self.free_block;
                    self.free_block += 1;
                    self.wsect(dinode.indirect, &ZEROS)?;
                }
                let mut indirect_buf = [0u8; BLOCK_SIZE];
                self.rsect(dinode.indirect, &mut indirect_buf)?;
                let mut indirect: [u32; NINDIRECT] =
                    FromBytes::read_from(&indirect_buf[..]).unwrap();
                if indirect[idx] == 0 {
                    indirect[idx] = self.free_block;
                    self.free_block += 1;
                    self.wsect(dinode.indirect, indirect.as_bytes().try_into().unwrap())?;
                }
                indirect[idx]
            };

            let n1 = std::cmp::min(n, (fbn + 1) * BLOCK_SIZE - off);
            let mut buf = [0u8; BLOCK_SIZE];
            self.rsect(block_no, &mut buf)?;
            buf[off - fbn * BLOCK_SIZE..off - fbn * BLOCK_SIZE + n1]
                .copy_from_slice(&data[p..p + n1]);
            self.wsect(block_no, &buf)?;

            n -= n1;
            off += n1;
            p += n1;
        }
        dinode.num_bytes = off as u32;
        self.winode(inode_no, &dinode)
    }
}

fn dir_entry(inode_no: u32, name: &str) -> DirEnt {
    assert!(name.len() < DIRSIZ, "mkfs: name longer than DIRSIZ");
    let mut de = DirEnt::zeroed();
    de.inode_no = inode_no as u16;
    de.name[..name.len()].copy_from_slice(name.as_bytes());
    de
}

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: mkfs fs.img [files...]");
        process::exit(1);
    }

    assert_eq!(BLOCK_SIZE % core::mem::size_of::<DInode>(), 0);
    assert_eq!(BLOCK_SIZE % core::mem::size_of::<DirEnt>(), 0);

    let sb = SuperBlock {
        num_blocks: FSSIZE as u32,
        num_data_blocks: NUM_DATA_BLOCKS as u32,
        num_inodes: NINODES as u32,
        num_log_blocks: NUM_LOG_BLOCKS as u32,
        log_start: LOG_START as u32,
        inode_start: INODE_START as u32,
        bitmap_start: BITMAP_START as u32,
    };

    eprintln!(
        "mkfs: {} total blocks, {} meta (log {} inode {} bitmap {}), {} data",
        FSSIZE, NMETA, NUM_LOG_BLOCKS, INODE_BLOCKS, NUM_BITMAP_BLOCKS, NUM_DATA_BLOCKS
    );

    let mut img = FsImg::new(sb, &args[1])?;

    for sec in 0..FSSIZE as u32 {
        img.wsect(sec, &ZEROS)?;
    }

    let mut sb_buf = [0u8; BLOCK_SIZE];
    sb_buf[..core::mem::size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
    img.wsect(1, &sb_buf)?;

    let root_ino = img.ialloc(T_DIR)?;
    assert_eq!(root_ino, ROOT_INODE);
    img.iappend(root_ino, dir_entry(root_ino, ".").as_bytes())?;
    img.iappend(root_ino, dir_entry(root_ino, "..").as_bytes())?;

    for path in args[2..].iter().map(Path::new).filter(|p| p.exists()) {
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.len() < DIRSIZ, "mkfs: {} name too long", name);

        let ino = img.ialloc(T_FILE)?;
        img.iappend(root_ino, dir_entry(ino, name).as_bytes())?;

        let mut fd = File::open(path)?;
        let mut buf = [0u8; BLOCK_SIZE];
        loop {
            let n = fd.read(&mut buf)?;
            if n == 0 {
                break;
            }
            img.iappend(ino, &buf[..n])?;
        }
    }

    img.balloc(img.free_block)
}
