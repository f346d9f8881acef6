// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! ext4 authoring and mount-less reading for the root partition.
//!
//! The writer produces a complete ext4 filesystem from a staging directory:
//! 4 KiB blocks, dynamic revision, `filetype`/`extents`/`flex_bg` incompat
//! features, `sparse_super` backups, no journal, and no metadata checksums.
//! With flex_bg, all bitmaps and inode tables live in one region near the
//! start of the disk, which keeps the allocator a simple forward scan.
//!
//! Authoring is deterministic: directory entries are name-sorted, all
//! timestamps are the epoch, and the filesystem UUID is a fixed constant, so
//! identical staging trees produce byte-identical images. The target range
//! must start out zeroed, which is always the case for a freshly allocated
//! output file.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use ext4_view::Ext4;
use thiserror::Error;
use zerocopy::{byteorder::little_endian, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::{self, ReadFixedSizeExt, WriteZerosExt};

/// Offset of the primary superblock from the start of the filesystem.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Offset of the volume label field within the superblock.
pub const VOLUME_LABEL_OFFSET: u64 = SUPERBLOCK_OFFSET + 120;
/// Size of the NUL-padded volume label field.
pub const VOLUME_LABEL_SIZE: usize = 16;
/// Offset of the little-endian superblock magic from the start of the
/// filesystem.
pub const MAGIC_OFFSET: u64 = 0x438;

const MAGIC: u16 = 0xef53;

const BLOCK_SIZE: u32 = 4096;
/// `block size == 1024 << log`.
const LOG_BLOCK_SIZE: u32 = 2;
/// Fixed at 8 * block size so one bitmap block covers a full group.
const BLOCKS_PER_GROUP: u32 = 8 * BLOCK_SIZE;
const INODE_SIZE: u32 = 256;
const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE;
const DESC_SIZE: u32 = 32;

const ROOT_INODE: u32 = 2;
/// Inodes 1-10 are reserved; the first usable inode matches mkfs defaults.
const FIRST_INODE: u32 = 11;
/// mkfs default inode density.
const BYTES_PER_INODE: u64 = 16384;

/// Initialized extents are limited to 2^15 blocks.
const MAX_EXTENT_LEN: u64 = 32768;
/// An inode's i_block area holds the extent header plus four extents. Real
/// rootfs trees never need more; anything that does is rejected rather than
/// growing an extent tree.
const MAX_INLINE_EXTENTS: usize = 4;

const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const INCOMPAT_FLEX_BG: u32 = 0x0200;
const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
const RO_COMPAT_LARGE_FILE: u32 = 0x0002;

/// i_flags bit marking an extent-mapped inode.
const EXTENTS_FL: u32 = 0x0008_0000;
const EXTENT_MAGIC: u16 = 0xf30a;

const S_IFREG: u16 = 0x8000;
const S_IFDIR: u16 = 0x4000;
const S_IFLNK: u16 = 0xa000;

const FT_REG_FILE: u8 = 1;
const FT_DIR: u8 = 2;
const FT_SYMLINK: u8 = 7;

/// Fixed UUID keeps authoring reproducible.
const FS_UUID: [u8; 16] = *b"sbcforge-rootfs\0";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image size of {0} bytes is not a multiple of the block size")]
    UnalignedSize(u64),
    #[error("Staging tree does not fit in the image")]
    OutOfSpace,
    #[error("Staging tree has more entries than the image has inodes")]
    OutOfInodes,
    #[error("File cannot be covered by {MAX_INLINE_EXTENTS} extents: {:?}", .0.as_bstr())]
    TooFragmented(Vec<u8>),
    #[error("Symlink target exceeds one block: {:?}", .0.as_bstr())]
    SymlinkTooLong(Vec<u8>),
    #[error("Entry name exceeds 255 bytes: {:?}", .0.as_bstr())]
    NameTooLong(Vec<u8>),
    #[error("Volume label exceeds {VOLUME_LABEL_SIZE} bytes: {0:?}")]
    LabelTooLong(String),
    #[error("Failed to read ext4 image")]
    Read(#[source] ext4_view::Ext4Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C, packed)]
struct RawSuperblock {
    inodes_count: little_endian::U32,
    blocks_count_lo: little_endian::U32,
    r_blocks_count_lo: little_endian::U32,
    free_blocks_count_lo: little_endian::U32,
    free_inodes_count: little_endian::U32,
    first_data_block: little_endian::U32,
    log_block_size: little_endian::U32,
    log_cluster_size: little_endian::U32,
    blocks_per_group: little_endian::U32,
    clusters_per_group: little_endian::U32,
    inodes_per_group: little_endian::U32,
    mtime: little_endian::U32,
    wtime: little_endian::U32,
    mnt_count: little_endian::U16,
    max_mnt_count: little_endian::U16,
    magic: little_endian::U16,
    state: little_endian::U16,
    errors: little_endian::U16,
    minor_rev_level: little_endian::U16,
    lastcheck: little_endian::U32,
    checkinterval: little_endian::U32,
    creator_os: little_endian::U32,
    rev_level: little_endian::U32,
    def_resuid: little_endian::U16,
    def_resgid: little_endian::U16,
    first_ino: little_endian::U32,
    inode_size: little_endian::U16,
    block_group_nr: little_endian::U16,
    feature_compat: little_endian::U32,
    feature_incompat: little_endian::U32,
    feature_ro_compat: little_endian::U32,
    uuid: [u8; 16],
    volume_name: [u8; VOLUME_LABEL_SIZE],
    last_mounted: [u8; 64],
    algorithm_usage_bitmap: little_endian::U32,
    prealloc_blocks: u8,
    prealloc_dir_blocks: u8,
    reserved_gdt_blocks: little_endian::U16,
    journal_uuid: [u8; 16],
    journal_inum: little_endian::U32,
    journal_dev: little_endian::U32,
    last_orphan: little_endian::U32,
    hash_seed: [little_endian::U32; 4],
    def_hash_version: u8,
    jnl_backup_type: u8,
    desc_size: little_endian::U16,
    default_mount_opts: little_endian::U32,
    first_meta_bg: little_endian::U32,
    mkfs_time: little_endian::U32,
    jnl_blocks: [little_endian::U32; 17],
    blocks_count_hi: little_endian::U32,
    r_blocks_count_hi: little_endian::U32,
    free_blocks_count_hi: little_endian::U32,
    min_extra_isize: little_endian::U16,
    want_extra_isize: little_endian::U16,
    flags: little_endian::U32,
    raid_stride: little_endian::U16,
    mmp_update_interval: little_endian::U16,
    mmp_block: little_endian::U64,
    raid_stripe_width: little_endian::U32,
    log_groups_per_flex: u8,
    checksum_type: u8,
    encryption_level: u8,
    reserved_pad: u8,
    kbytes_written: little_endian::U64,
    reserved: [u8; 640],
}

#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C, packed)]
struct RawGroupDesc {
    block_bitmap_lo: little_endian::U32,
    inode_bitmap_lo: little_endian::U32,
    inode_table_lo: little_endian::U32,
    free_blocks_count_lo: little_endian::U16,
    free_inodes_count_lo: little_endian::U16,
    used_dirs_count_lo: little_endian::U16,
    flags: little_endian::U16,
    exclude_bitmap_lo: little_endian::U32,
    block_bitmap_csum_lo: little_endian::U16,
    inode_bitmap_csum_lo: little_endian::U16,
    itable_unused_lo: little_endian::U16,
    checksum: little_endian::U16,
}

#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C, packed)]
struct RawInode {
    mode: little_endian::U16,
    uid: little_endian::U16,
    size_lo: little_endian::U32,
    atime: little_endian::U32,
    ctime: little_endian::U32,
    mtime: little_endian::U32,
    dtime: little_endian::U32,
    gid: little_endian::U16,
    links_count: little_endian::U16,
    blocks_lo: little_endian::U32,
    flags: little_endian::U32,
    osd1: little_endian::U32,
    block: [u8; 60],
    generation: little_endian::U32,
    file_acl_lo: little_endian::U32,
    size_high: little_endian::U32,
    obso_faddr: little_endian::U32,
    osd2: [u8; 12],
    extra_isize: little_endian::U16,
    checksum_hi: little_endian::U16,
    ctime_extra: little_endian::U32,
    mtime_extra: little_endian::U32,
    atime_extra: little_endian::U32,
    crtime: little_endian::U32,
    crtime_extra: little_endian::U32,
    version_hi: little_endian::U32,
    projid: little_endian::U32,
    reserved: [u8; 96],
}

#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C, packed)]
struct RawExtentHeader {
    magic: little_endian::U16,
    entries: little_endian::U16,
    max: little_endian::U16,
    depth: little_endian::U16,
    generation: little_endian::U32,
}

#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C, packed)]
struct RawExtent {
    block: little_endian::U32,
    len: little_endian::U16,
    start_hi: little_endian::U16,
    start_lo: little_endian::U32,
}

/// An entry scanned from the staging tree. Anything that isn't a regular
/// file, directory, or symlink is not representable in the image and is
/// skipped during the scan.
struct Node {
    name: Vec<u8>,
    /// Low 9 mode bits.
    mode: u16,
    ino: u32,
    kind: NodeKind,
}

enum NodeKind {
    Dir { children: Vec<Node> },
    File { source: PathBuf, size: u64 },
    Symlink { target: Vec<u8> },
}

#[cfg(unix)]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;

    name.as_bytes().to_vec()
}

#[cfg(unix)]
fn link_target_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;

    target.as_os_str().as_bytes().to_vec()
}

fn low_mode(metadata: &fs::Metadata) -> u16 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        (metadata.permissions().mode() & 0o777) as u16
    }
    #[cfg(not(unix))]
    {
        if metadata.permissions().readonly() {
            0o555
        } else {
            0o755
        }
    }
}

/// Scan one directory level, sorted by name so that authoring does not depend
/// on readdir order.
fn scan_tree(dir: &Path) -> Result<Vec<Node>> {
    let mut entries = dir.read_dir()?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut nodes = Vec::with_capacity(entries.len());

    for entry in entries {
        let name = name_bytes(&entry.file_name());
        if name.len() > 255 {
            return Err(Error::NameTooLong(name));
        }

        let metadata = entry.path().symlink_metadata()?;
        let mode = low_mode(&metadata);

        let kind = if metadata.is_dir() {
            NodeKind::Dir {
                children: scan_tree(&entry.path())?,
            }
        } else if metadata.is_file() {
            NodeKind::File {
                source: entry.path(),
                size: metadata.len(),
            }
        } else if metadata.is_symlink() {
            NodeKind::Symlink {
                target: link_target_bytes(&fs::read_link(entry.path())?),
            }
        } else {
            // Devices, fifos, and sockets.
            continue;
        };

        nodes.push(Node {
            name,
            mode,
            ino: 0,
            kind,
        });
    }

    Ok(nodes)
}

fn count_nodes(nodes: &[Node]) -> u32 {
    let mut count = nodes.len() as u32;

    for node in nodes {
        if let NodeKind::Dir { children } = &node.kind {
            count += count_nodes(children);
        }
    }

    count
}

/// Whether a group holds a superblock + group descriptor backup under the
/// sparse_super rules: group 0 and powers of 3, 5, and 7.
fn is_sparse_super_group(group: u32) -> bool {
    fn is_power_of(mut value: u32, base: u32) -> bool {
        loop {
            if value == 1 {
                return true;
            } else if value % base != 0 {
                return false;
            }

            value /= base;
        }
    }

    group == 0 || is_power_of(group, 3) || is_power_of(group, 5) || is_power_of(group, 7)
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    blocks_count: u64,
    groups: u32,
    inodes_per_group: u32,
    gdt_blocks: u32,
    itable_blocks: u32,
}

impl Geometry {
    fn compute(size: u64, inode_demand: u32) -> Result<Self> {
        if size == 0 || size % u64::from(BLOCK_SIZE) != 0 {
            return Err(Error::UnalignedSize(size));
        }

        let blocks_count = size / u64::from(BLOCK_SIZE);
        let groups = blocks_count.div_ceil(u64::from(BLOCKS_PER_GROUP)) as u32;

        // mkfs-style inode density, bumped if the tree needs more, rounded so
        // inode tables are whole blocks, and capped so the inode bitmap fits
        // in one block.
        let desired = (size / BYTES_PER_INODE).max(u64::from(inode_demand) + 32);
        let inodes_per_group = desired
            .div_ceil(u64::from(groups))
            .next_multiple_of(u64::from(INODES_PER_BLOCK))
            .min(u64::from(8 * BLOCK_SIZE)) as u32;

        if u64::from(inodes_per_group) * u64::from(groups) < u64::from(inode_demand) {
            return Err(Error::OutOfInodes);
        }

        Ok(Self {
            blocks_count,
            groups,
            inodes_per_group,
            gdt_blocks: (groups * DESC_SIZE).div_ceil(BLOCK_SIZE),
            itable_blocks: inodes_per_group / INODES_PER_BLOCK,
        })
    }

    fn total_inodes(&self) -> u32 {
        self.groups * self.inodes_per_group
    }

    fn log_groups_per_flex(&self) -> u8 {
        // All metadata lives in one flex cluster.
        let mut log = 0u8;
        while (1u64 << log) < u64::from(self.groups) {
            log += 1;
        }

        log
    }
}

/// Forward-scanning block allocator over the whole disk. Freed blocks are
/// never handed out again, which is fine for a single write-once pass.
struct Allocator {
    bitmap: Vec<u8>,
    blocks_count: u64,
    cursor: u64,
}

impl Allocator {
    fn new(geometry: &Geometry) -> Self {
        let mut allocator = Self {
            bitmap: vec![0u8; geometry.groups as usize * BLOCK_SIZE as usize],
            blocks_count: geometry.blocks_count,
            cursor: 0,
        };

        // Mark the nonexistent tail of the last group as in use so the
        // bitmap can be written out verbatim.
        let total_bits = u64::from(geometry.groups) * u64::from(BLOCKS_PER_GROUP);
        for block in geometry.blocks_count..total_bits {
            allocator.set(block);
        }

        allocator
    }

    fn set(&mut self, block: u64) {
        self.bitmap[(block / 8) as usize] |= 1 << (block % 8);
    }

    fn is_set(&self, block: u64) -> bool {
        self.bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    fn reserve_range(&mut self, start: u64, len: u64) -> Result<()> {
        if start + len > self.blocks_count {
            return Err(Error::OutOfSpace);
        }

        for block in start..start + len {
            self.set(block);
        }

        Ok(())
    }

    fn find_free_from(&self, mut block: u64) -> Option<u64> {
        while block < self.blocks_count {
            if !self.is_set(block) {
                return Some(block);
            }

            block += 1;
        }

        None
    }

    /// Allocate `len` contiguous blocks (used for inode tables, which cannot
    /// be split).
    fn alloc_contiguous(&mut self, len: u64) -> Result<u64> {
        let mut start = self.find_free_from(self.cursor).ok_or(Error::OutOfSpace)?;

        'outer: loop {
            for i in 0..len {
                if start + i >= self.blocks_count {
                    return Err(Error::OutOfSpace);
                }
                if self.is_set(start + i) {
                    start = self
                        .find_free_from(start + i + 1)
                        .ok_or(Error::OutOfSpace)?;
                    continue 'outer;
                }
            }

            for i in 0..len {
                self.set(start + i);
            }
            self.cursor = start + len;

            return Ok(start);
        }
    }

    /// Allocate `blocks` blocks as a list of maximal runs. Runs are split
    /// around already-reserved blocks (eg. superblock backups) and capped at
    /// the maximum extent length.
    fn alloc_extents(&mut self, mut blocks: u64) -> Result<Vec<(u64, u64)>> {
        let mut runs = Vec::<(u64, u64)>::new();

        while blocks > 0 {
            let start = self.find_free_from(self.cursor).ok_or(Error::OutOfSpace)?;
            let mut len = 0;

            while len < blocks
                && len < MAX_EXTENT_LEN
                && start + len < self.blocks_count
                && !self.is_set(start + len)
            {
                len += 1;
            }

            for block in start..start + len {
                self.set(block);
            }
            self.cursor = start + len;
            blocks -= len;

            match runs.last_mut() {
                Some(last) if last.0 + last.1 == start && last.1 + len <= MAX_EXTENT_LEN => {
                    last.1 += len;
                }
                _ => runs.push((start, len)),
            }
        }

        Ok(runs)
    }
}

/// Builds classic linear directory blocks. Entries never cross a block
/// boundary; the last entry in each block absorbs the remaining space in its
/// rec_len.
struct DirDataBuilder {
    data: Vec<u8>,
    block_start: usize,
    last_entry: usize,
}

impl DirDataBuilder {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            block_start: 0,
            last_entry: 0,
        }
    }

    fn add(&mut self, ino: u32, file_type: u8, name: &[u8]) -> Result<()> {
        if name.len() > 255 {
            return Err(Error::NameTooLong(name.to_vec()));
        }

        let needed = 8 + name.len().next_multiple_of(4);
        let used = self.data.len() - self.block_start;
        if used + needed > BLOCK_SIZE as usize {
            self.finish_block();
        }

        self.last_entry = self.data.len();
        self.data.extend_from_slice(&ino.to_le_bytes());
        self.data.extend_from_slice(&(needed as u16).to_le_bytes());
        self.data.push(name.len() as u8);
        self.data.push(file_type);
        self.data.extend_from_slice(name);
        self.data.resize(self.last_entry + needed, 0);

        Ok(())
    }

    fn finish_block(&mut self) {
        if self.data.len() == self.block_start {
            return;
        }

        let block_end = self.block_start + BLOCK_SIZE as usize;
        let rec_len = (block_end - self.last_entry) as u16;
        self.data[self.last_entry + 4..self.last_entry + 6]
            .copy_from_slice(&rec_len.to_le_bytes());
        self.data.resize(block_end, 0);
        self.block_start = block_end;
    }

    fn finish(mut self) -> Vec<u8> {
        self.finish_block();
        self.data
    }
}

/// Encode the inline extent list into an inode's i_block area.
fn extent_i_block(extents: &[(u64, u64, u64)]) -> [u8; 60] {
    assert!(extents.len() <= MAX_INLINE_EXTENTS);

    let mut result = [0u8; 60];

    let header = RawExtentHeader {
        magic: EXTENT_MAGIC.into(),
        entries: (extents.len() as u16).into(),
        max: (MAX_INLINE_EXTENTS as u16).into(),
        depth: 0.into(),
        generation: 0.into(),
    };
    result[..12].copy_from_slice(header.as_bytes());

    for (i, &(logical, physical, len)) in extents.iter().enumerate() {
        let extent = RawExtent {
            block: (logical as u32).into(),
            len: (len as u16).into(),
            start_hi: ((physical >> 32) as u16).into(),
            start_lo: (physical as u32).into(),
        };
        result[12 + i * 12..24 + i * 12].copy_from_slice(extent.as_bytes());
    }

    result
}

fn new_inode(mode: u16, size: u64, links: u16, blocks: u64, flags: u32, block: [u8; 60]) -> RawInode {
    let mut inode = RawInode::new_zeroed();
    inode.mode = mode.into();
    inode.size_lo = (size as u32).into();
    inode.size_high = ((size >> 32) as u32).into();
    inode.links_count = links.into();
    // Charged in 512-byte units.
    inode.blocks_lo = ((blocks * u64::from(BLOCK_SIZE) / 512) as u32).into();
    inode.flags = flags.into();
    inode.block = block;
    inode.extra_isize = 32.into();
    inode
}

struct ImageWriter<'a, W: Write + Seek> {
    writer: &'a mut W,
    geometry: Geometry,
    allocator: Allocator,
    block_bitmap_blocks: Vec<u64>,
    inode_bitmap_blocks: Vec<u64>,
    inode_table_blocks: Vec<u64>,
    inodes: Vec<(u32, RawInode)>,
    next_ino: u32,
    cancel_signal: &'a AtomicBool,
}

impl<'a, W: Write + Seek> ImageWriter<'a, W> {
    fn new(
        writer: &'a mut W,
        geometry: Geometry,
        cancel_signal: &'a AtomicBool,
    ) -> Result<Self> {
        let mut allocator = Allocator::new(&geometry);

        // Superblock + GDT copies claim the head of every sparse_super group.
        for group in 0..geometry.groups {
            if is_sparse_super_group(group) {
                allocator.reserve_range(
                    u64::from(group) * u64::from(BLOCKS_PER_GROUP),
                    1 + u64::from(geometry.gdt_blocks),
                )?;
            }
        }

        let mut block_bitmap_blocks = Vec::with_capacity(geometry.groups as usize);
        let mut inode_bitmap_blocks = Vec::with_capacity(geometry.groups as usize);
        let mut inode_table_blocks = Vec::with_capacity(geometry.groups as usize);

        for _ in 0..geometry.groups {
            block_bitmap_blocks.push(allocator.alloc_contiguous(1)?);
        }
        for _ in 0..geometry.groups {
            inode_bitmap_blocks.push(allocator.alloc_contiguous(1)?);
        }
        for _ in 0..geometry.groups {
            inode_table_blocks.push(allocator.alloc_contiguous(u64::from(geometry.itable_blocks))?);
        }

        Ok(Self {
            writer,
            geometry,
            allocator,
            block_bitmap_blocks,
            inode_bitmap_blocks,
            inode_table_blocks,
            inodes: Vec::new(),
            next_ino: FIRST_INODE,
            cancel_signal,
        })
    }

    fn seek_block(&mut self, block: u64) -> io::Result<()> {
        self.writer
            .seek(SeekFrom::Start(block * u64::from(BLOCK_SIZE)))?;
        Ok(())
    }

    fn alloc_ino(&mut self) -> Result<u32> {
        if self.next_ino > self.geometry.total_inodes() {
            return Err(Error::OutOfInodes);
        }

        let ino = self.next_ino;
        self.next_ino += 1;
        Ok(ino)
    }

    /// Allocate and write one logical run of data, returning the inline
    /// extent list.
    fn write_data_blocks(
        &mut self,
        name: &[u8],
        data_blocks: u64,
        mut fill: impl FnMut(&mut W, u64, &AtomicBool) -> Result<()>,
    ) -> Result<Vec<(u64, u64, u64)>> {
        let runs = self.allocator.alloc_extents(data_blocks)?;
        if runs.len() > MAX_INLINE_EXTENTS {
            return Err(Error::TooFragmented(name.to_vec()));
        }

        let mut extents = Vec::with_capacity(runs.len());
        let mut logical = 0;

        for (start, len) in runs {
            self.seek_block(start)?;
            fill(self.writer, len, self.cancel_signal)?;

            extents.push((logical, start, len));
            logical += len;
        }

        Ok(extents)
    }

    fn write_file(&mut self, node: &Node, source: &Path, size: u64) -> Result<()> {
        let data_blocks = size.div_ceil(u64::from(BLOCK_SIZE));
        let mut reader = File::open(source)?;
        let mut remaining = size;

        let extents = self.write_data_blocks(&node.name, data_blocks, |writer, len, cancel| {
            let capacity = len * u64::from(BLOCK_SIZE);
            let to_copy = remaining.min(capacity);

            stream::copy_n(&mut reader, &mut *writer, to_copy, cancel)?;
            writer.write_zeros_exact(capacity - to_copy)?;

            remaining -= to_copy;
            Ok(())
        })?;

        self.inodes.push((
            node.ino,
            new_inode(
                S_IFREG | node.mode,
                size,
                1,
                data_blocks,
                EXTENTS_FL,
                extent_i_block(&extents),
            ),
        ));

        Ok(())
    }

    fn write_symlink(&mut self, node: &Node, target: &[u8]) -> Result<()> {
        let inode = if target.len() < 60 {
            // Fast symlink: the target lives in i_block directly.
            let mut block = [0u8; 60];
            block[..target.len()].copy_from_slice(target);

            new_inode(S_IFLNK | node.mode, target.len() as u64, 1, 0, 0, block)
        } else if target.len() < BLOCK_SIZE as usize {
            let extents = self.write_data_blocks(&node.name, 1, |writer, _len, _cancel| {
                writer.write_all(target)?;
                writer.write_zeros_exact(u64::from(BLOCK_SIZE) - target.len() as u64)?;
                Ok(())
            })?;

            new_inode(
                S_IFLNK | node.mode,
                target.len() as u64,
                1,
                1,
                EXTENTS_FL,
                extent_i_block(&extents),
            )
        } else {
            return Err(Error::SymlinkTooLong(node.name.clone()));
        };

        self.inodes.push((node.ino, inode));

        Ok(())
    }

    fn write_dir(
        &mut self,
        ino: u32,
        parent_ino: u32,
        mode: u16,
        name: &[u8],
        children: &mut [Node],
    ) -> Result<()> {
        stream::check_cancel(self.cancel_signal)?;

        for child in children.iter_mut() {
            child.ino = self.alloc_ino()?;
        }

        let mut dirents = DirDataBuilder::new();
        dirents.add(ino, FT_DIR, b".")?;
        dirents.add(parent_ino, FT_DIR, b"..")?;

        for child in children.iter() {
            let file_type = match &child.kind {
                NodeKind::Dir { .. } => FT_DIR,
                NodeKind::File { .. } => FT_REG_FILE,
                NodeKind::Symlink { .. } => FT_SYMLINK,
            };
            dirents.add(child.ino, file_type, &child.name)?;
        }

        let data = dirents.finish();
        let data_blocks = (data.len() / BLOCK_SIZE as usize) as u64;
        let mut offset = 0usize;

        let extents = self.write_data_blocks(name, data_blocks, |writer, len, _cancel| {
            let take = (len * u64::from(BLOCK_SIZE)) as usize;
            writer.write_all(&data[offset..offset + take])?;
            offset += take;
            Ok(())
        })?;

        let subdirs = children
            .iter()
            .filter(|c| matches!(c.kind, NodeKind::Dir { .. }))
            .count();
        let links = 2 + subdirs as u16;

        self.inodes.push((
            ino,
            new_inode(
                S_IFDIR | mode,
                data.len() as u64,
                links,
                data_blocks,
                EXTENTS_FL,
                extent_i_block(&extents),
            ),
        ));

        for child in children.iter_mut() {
            let child_ino = child.ino;
            match &mut child.kind {
                NodeKind::Dir { children } => {
                    let mut grandchildren = std::mem::take(children);
                    self.write_dir(child_ino, ino, child.mode, &child.name, &mut grandchildren)?;
                }
                NodeKind::File { source, size } => {
                    let (source, size) = (source.clone(), *size);
                    self.write_file(child, &source, size)?;
                }
                NodeKind::Symlink { target } => {
                    let target = target.clone();
                    self.write_symlink(child, &target)?;
                }
            }
        }

        Ok(())
    }

    /// Write the inode tables, bitmaps, group descriptors, and superblocks
    /// once all data has been placed.
    fn finalize(mut self) -> Result<()> {
        let geometry = self.geometry;
        let groups = geometry.groups as usize;
        let ipg = geometry.inodes_per_group;

        // Inode tables. Unused slots stay zero, which the fresh target
        // already guarantees.
        let inodes = std::mem::take(&mut self.inodes);
        for (ino, inode) in &inodes {
            let group = u64::from((ino - 1) / ipg);
            let index = u64::from((ino - 1) % ipg);

            let table = self.inode_table_blocks[group as usize];
            self.writer.seek(SeekFrom::Start(
                table * u64::from(BLOCK_SIZE) + index * u64::from(INODE_SIZE),
            ))?;
            self.writer.write_all(inode.as_bytes())?;
        }

        // Inode bitmaps: reserved inodes 1-10, every allocated inode, and the
        // padding bits past inodes_per_group.
        let mut inode_bitmaps = vec![vec![0u8; BLOCK_SIZE as usize]; groups];
        let mut set_ino = |bitmaps: &mut Vec<Vec<u8>>, ino: u32| {
            let group = ((ino - 1) / ipg) as usize;
            let index = ((ino - 1) % ipg) as usize;
            bitmaps[group][index / 8] |= 1 << (index % 8);
        };

        for ino in 1..FIRST_INODE {
            set_ino(&mut inode_bitmaps, ino);
        }
        for (ino, _) in &inodes {
            set_ino(&mut inode_bitmaps, *ino);
        }
        for bitmap in &mut inode_bitmaps {
            for index in ipg..8 * BLOCK_SIZE {
                bitmap[(index / 8) as usize] |= 1 << (index % 8);
            }
        }

        for (group, bitmap) in inode_bitmaps.iter().enumerate() {
            let block = self.inode_bitmap_blocks[group];
            self.seek_block(block)?;
            self.writer.write_all(bitmap)?;
        }

        // Block bitmaps come straight out of the allocator, one block per
        // group by construction.
        for group in 0..groups {
            let block = self.block_bitmap_blocks[group];
            let slice =
                &self.allocator.bitmap[group * BLOCK_SIZE as usize..(group + 1) * BLOCK_SIZE as usize];
            let slice = slice.to_vec();
            self.seek_block(block)?;
            self.writer.write_all(&slice)?;
        }

        // Per-group accounting.
        let mut used_dirs = vec![0u16; groups];
        for (ino, inode) in &inodes {
            if inode.mode.get() & S_IFDIR != 0 {
                used_dirs[((ino - 1) / ipg) as usize] += 1;
            }
        }

        let mut free_blocks_per_group = vec![0u32; groups];
        for group in 0..groups {
            let slice =
                &self.allocator.bitmap[group * BLOCK_SIZE as usize..(group + 1) * BLOCK_SIZE as usize];
            free_blocks_per_group[group] =
                slice.iter().map(|b| b.count_zeros()).sum::<u32>();
        }

        let mut free_inodes_per_group = vec![0u32; groups];
        for group in 0..groups {
            free_inodes_per_group[group] = inode_bitmaps[group]
                .iter()
                .map(|b| b.count_zeros())
                .sum::<u32>();
        }

        let free_blocks = free_blocks_per_group.iter().map(|&n| u64::from(n)).sum::<u64>();
        let free_inodes = free_inodes_per_group.iter().sum::<u32>();

        // Group descriptor table.
        let mut gdt = vec![0u8; geometry.gdt_blocks as usize * BLOCK_SIZE as usize];
        for group in 0..groups {
            let desc = RawGroupDesc {
                block_bitmap_lo: (self.block_bitmap_blocks[group] as u32).into(),
                inode_bitmap_lo: (self.inode_bitmap_blocks[group] as u32).into(),
                inode_table_lo: (self.inode_table_blocks[group] as u32).into(),
                free_blocks_count_lo: (free_blocks_per_group[group] as u16).into(),
                free_inodes_count_lo: (free_inodes_per_group[group] as u16).into(),
                used_dirs_count_lo: used_dirs[group].into(),
                flags: 0.into(),
                exclude_bitmap_lo: 0.into(),
                block_bitmap_csum_lo: 0.into(),
                inode_bitmap_csum_lo: 0.into(),
                itable_unused_lo: 0.into(),
                checksum: 0.into(),
            };
            gdt[group * DESC_SIZE as usize..(group + 1) * DESC_SIZE as usize]
                .copy_from_slice(desc.as_bytes());
        }

        let mut superblock = RawSuperblock::new_zeroed();
        superblock.inodes_count = geometry.total_inodes().into();
        superblock.blocks_count_lo = (geometry.blocks_count as u32).into();
        superblock.free_blocks_count_lo = (free_blocks as u32).into();
        superblock.free_inodes_count = free_inodes.into();
        superblock.first_data_block = 0.into();
        superblock.log_block_size = LOG_BLOCK_SIZE.into();
        superblock.log_cluster_size = LOG_BLOCK_SIZE.into();
        superblock.blocks_per_group = BLOCKS_PER_GROUP.into();
        superblock.clusters_per_group = BLOCKS_PER_GROUP.into();
        superblock.inodes_per_group = ipg.into();
        superblock.max_mnt_count = 0xffff.into();
        superblock.magic = MAGIC.into();
        // Cleanly unmounted.
        superblock.state = 1.into();
        // Continue on errors.
        superblock.errors = 1.into();
        superblock.creator_os = 0.into();
        superblock.rev_level = 1.into();
        superblock.first_ino = FIRST_INODE.into();
        superblock.inode_size = (INODE_SIZE as u16).into();
        superblock.feature_incompat =
            (INCOMPAT_FILETYPE | INCOMPAT_EXTENTS | INCOMPAT_FLEX_BG).into();
        superblock.feature_ro_compat = (RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE).into();
        superblock.uuid = FS_UUID;
        superblock.min_extra_isize = 32.into();
        superblock.want_extra_isize = 32.into();
        superblock.log_groups_per_flex = geometry.log_groups_per_flex();

        // Backup copies first, then the primary.
        for group in 1..geometry.groups {
            if !is_sparse_super_group(group) {
                continue;
            }

            let first_block = u64::from(group) * u64::from(BLOCKS_PER_GROUP);
            superblock.block_group_nr = (group as u16).into();

            self.seek_block(first_block)?;
            self.writer.write_all(superblock.as_bytes())?;

            self.seek_block(first_block + 1)?;
            self.writer.write_all(&gdt)?;
        }

        superblock.block_group_nr = 0.into();
        self.writer.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        self.writer.write_all(superblock.as_bytes())?;

        self.seek_block(1)?;
        self.writer.write_all(&gdt)?;

        // Make sure the target spans the full image size even when nothing
        // was allocated in the final block.
        if !self.allocator.is_set(geometry.blocks_count - 1) {
            self.writer.seek(SeekFrom::Start(
                geometry.blocks_count * u64::from(BLOCK_SIZE) - 1,
            ))?;
            self.writer.write_all(&[0])?;
        }

        self.writer.flush()?;

        Ok(())
    }
}

/// Author an ext4 image of exactly `size` bytes from the staging tree at
/// `tree`, writing it to `writer` (position 0 is the start of the
/// filesystem). The target range must be zero-filled beforehand; a freshly
/// allocated image file satisfies this.
pub fn build_image(
    tree: &Path,
    writer: &mut (impl Write + Seek),
    size: u64,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut root_children = scan_tree(tree)?;
    let root_mode = low_mode(&tree.metadata()?);

    // Reserved inodes plus one per tree entry.
    let inode_demand = FIRST_INODE - 1 + count_nodes(&root_children);
    let geometry = Geometry::compute(size, inode_demand)?;

    let mut image_writer = ImageWriter::new(writer, geometry, cancel_signal)?;
    image_writer.write_dir(ROOT_INODE, ROOT_INODE, root_mode, b"/", &mut root_children)?;
    image_writer.finalize()?;

    Ok(())
}

/// Overwrite the superblock volume label, NUL-padded to its fixed 16 bytes.
pub fn set_volume_label(writer: &mut (impl Write + Seek), label: &str) -> Result<()> {
    if label.len() > VOLUME_LABEL_SIZE {
        return Err(Error::LabelTooLong(label.to_owned()));
    }

    let mut buf = [0u8; VOLUME_LABEL_SIZE];
    buf[..label.len()].copy_from_slice(label.as_bytes());

    writer.seek(SeekFrom::Start(VOLUME_LABEL_OFFSET))?;
    writer.write_all(&buf)?;

    Ok(())
}

/// Read the raw NUL-padded volume label from the superblock.
pub fn volume_label(reader: &mut (impl Read + Seek)) -> Result<[u8; VOLUME_LABEL_SIZE]> {
    reader.seek(SeekFrom::Start(VOLUME_LABEL_OFFSET))?;
    Ok(reader.read_array_exact::<VOLUME_LABEL_SIZE>()?)
}

/// Check for the ext4 superblock magic.
pub fn has_magic(reader: &mut (impl Read + Seek)) -> Result<bool> {
    reader.seek(SeekFrom::Start(MAGIC_OFFSET))?;
    let raw = reader.read_array_exact::<2>()?;

    Ok(u16::from_le_bytes(raw) == MAGIC)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn extract_dir(fs: &Ext4, dir: &[u8], dest: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    for entry in fs.read_dir(dir).map_err(Error::Read)? {
        stream::check_cancel(cancel_signal)?;

        let entry = entry.map_err(Error::Read)?;
        let name = entry.file_name();
        let name: &[u8] = name.as_ref();
        if name == b"." || name == b".." {
            continue;
        }

        let mut path = dir.to_vec();
        if !path.ends_with(b"/") {
            path.push(b'/');
        }
        path.extend_from_slice(name);

        #[cfg(unix)]
        let host_name = {
            use std::os::unix::ffi::OsStrExt;

            std::ffi::OsStr::from_bytes(name).to_owned()
        };
        #[cfg(not(unix))]
        let host_name = std::ffi::OsString::from(String::from_utf8_lossy(name).into_owned());

        let target = dest.join(&host_name);
        let file_type = entry.file_type().map_err(Error::Read)?;

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            extract_dir(fs, &path, &target, cancel_signal)?;
        } else if file_type.is_regular_file() {
            let data = fs.read(path.as_slice()).map_err(Error::Read)?;
            fs::write(&target, data)?;

            let metadata = entry.metadata().map_err(Error::Read)?;
            apply_mode(&target, metadata.mode().into())?;
        }
        // Symlinks, devices, fifos, and sockets are not materialized.
    }

    Ok(())
}

/// Walk a whole-disk ext4 image without mounting it and stream every regular
/// file out to `dest_dir`, preserving mode bits. Directories are mirrored;
/// all other entry types are skipped.
pub fn extract_image(image: &Path, dest_dir: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    let fs = Ext4::load_from_path(image).map_err(Error::Read)?;

    fs::create_dir_all(dest_dir)?;
    extract_dir(&fs, b"/", dest_dir, cancel_signal)
}
