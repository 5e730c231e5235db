//! On-disk structures, bit-exact with classic ext2.
//!
//! All integers are little endian; the structures are `packed` and are only
//! ever moved in and out of block buffers with unaligned reads and writes.

use bitflags::bitflags;

use crate::block_cache::Pod;
use crate::config::{
    BLOCK_POINTERS, EXT2_MAGIC, GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
use crate::error::{FileSystemError, FsResult};
use crate::vfs::InodeType;

// ===== Superblock =====

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    // dynamic revision
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub algo_bitmap: u32,
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,
    pub reserved_gdt_blocks: u16,
    pub journal_uuid: [u8; 16],
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,
    pub reserved: [u8; 788],
}

unsafe impl Pod for SuperBlock {}

impl SuperBlock {
    /// Reject anything this driver cannot mount.
    pub fn validate(&self) -> FsResult<()> {
        if self.magic != EXT2_MAGIC {
            return Err(FileSystemError::InvalidFileSystem);
        }
        if self.log_block_size > 6 {
            return Err(FileSystemError::InvalidFileSystem);
        }
        let bs = self.block_size();
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
            return Err(FileSystemError::InvalidFileSystem);
        }
        if self.blocks_per_group == 0 || self.inodes_per_group == 0 {
            return Err(FileSystemError::InvalidFileSystem);
        }
        if self.blocks_per_group as usize > bs * 8 || self.inodes_per_group as usize > bs * 8 {
            return Err(FileSystemError::InvalidFileSystem);
        }
        let expected_first = if bs == 1024 { 1 } else { 0 };
        if self.first_data_block != expected_first || self.blocks_count <= self.first_data_block {
            return Err(FileSystemError::InvalidFileSystem);
        }
        let isz = self.inode_size();
        if isz < GOOD_OLD_INODE_SIZE || !isz.is_power_of_two() || isz > bs {
            return Err(FileSystemError::InvalidFileSystem);
        }
        let unknown = FeatureIncompat::from_bits_retain(self.feature_incompat) - FeatureIncompat::SUPPORTED;
        if self.rev_level >= 1 && !unknown.is_empty() {
            log::warn!("unsupported incompatible features {:#x}", unknown.bits());
            return Err(FileSystemError::Unsupported);
        }
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        MIN_BLOCK_SIZE << self.log_block_size
    }

    pub fn group_count(&self) -> u32 {
        (self.blocks_count - self.first_data_block).div_ceil(self.blocks_per_group)
    }

    pub fn inode_size(&self) -> usize {
        if self.rev_level == 0 {
            GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size as usize
        }
    }

    /// First inode number not reserved by the filesystem.
    pub fn first_ino(&self) -> u32 {
        if self.rev_level == 0 {
            GOOD_OLD_FIRST_INO
        } else {
            self.first_ino
        }
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::from_raw(self.errors)
    }

    pub fn creator_os(&self) -> CreatorOs {
        CreatorOs::from_raw(self.creator_os)
    }

    /// Mount read-write only when every read-only-compatible feature is
    /// understood.
    pub fn writable(&self) -> bool {
        let ro = FeatureRoCompat::from_bits_retain(self.feature_ro_compat);
        self.rev_level == 0 || FeatureRoCompat::SUPPORTED.contains(ro)
    }

    pub fn has_filetype(&self) -> bool {
        self.rev_level >= 1 && FeatureIncompat::from_bits_retain(self.feature_incompat).contains(FeatureIncompat::FILETYPE)
    }

    pub fn sparse_super(&self) -> bool {
        self.rev_level >= 1
            && FeatureRoCompat::from_bits_retain(self.feature_ro_compat).contains(FeatureRoCompat::SPARSE_SUPER)
    }

    pub fn inode_table_blocks(&self) -> u32 {
        (self.inodes_per_group as usize * self.inode_size()).div_ceil(self.block_size()) as u32
    }

    pub fn desc_blocks(&self) -> u32 {
        (self.group_count() as usize * size_of::<GroupDesc>()).div_ceil(self.block_size()) as u32
    }

    pub fn volume_name(&self) -> &[u8] {
        let end = self.volume_name.iter().position(|&b| b == 0).unwrap_or(16);
        &self.volume_name[..end]
    }
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    while n > 1 && n % base == 0 {
        n /= base;
    }
    n == 1
}

/// What to do when the driver detects on-disk corruption (`s_errors`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Continue,
    RemountReadOnly,
    Panic,
}

impl ErrorPolicy {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            2 => ErrorPolicy::RemountReadOnly,
            3 => ErrorPolicy::Panic,
            _ => ErrorPolicy::Continue,
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ErrorPolicy::Continue => 1,
            ErrorPolicy::RemountReadOnly => 2,
            ErrorPolicy::Panic => 3,
        }
    }
}

/// `s_state` values.
pub const STATE_VALID: u16 = 1;
pub const STATE_ERROR: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatorOs {
    Linux,
    Hurd,
    Masix,
    FreeBsd,
    Lites,
    Unknown(u32),
}

impl CreatorOs {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => CreatorOs::Linux,
            1 => CreatorOs::Hurd,
            2 => CreatorOs::Masix,
            3 => CreatorOs::FreeBsd,
            4 => CreatorOs::Lites,
            other => CreatorOs::Unknown(other),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureCompat: u32 {
        const DIR_PREALLOC = 0x0001;
        const IMAGIC_INODES = 0x0002;
        const HAS_JOURNAL = 0x0004;
        const EXT_ATTR = 0x0008;
        const RESIZE_INODE = 0x0010;
        const DIR_INDEX = 0x0020;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureIncompat: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE = 0x0002;
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureRoCompat: u32 {
        const SPARSE_SUPER = 0x0001;
        const LARGE_FILE = 0x0002;
        const BTREE_DIR = 0x0004;
    }
}

impl FeatureIncompat {
    pub const SUPPORTED: Self = Self::FILETYPE;
}

impl FeatureRoCompat {
    pub const SUPPORTED: Self = Self::SPARSE_SUPER.union(Self::LARGE_FILE);
}

/// Mount-time constants derived from the superblock.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub block_size: usize,
    pub inode_size: usize,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_data_block: u32,
    pub group_count: u32,
    pub first_ino: u32,
    pub desc_blocks: u32,
    pub inode_table_blocks: u32,
    /// Blocks after the superblock copy reserved for descriptor growth.
    pub reserved_gdt_blocks: u32,
    pub sparse_super: bool,
    pub filetype: bool,
    pub creator_os: CreatorOs,
}

impl Geometry {
    pub fn new(sb: &SuperBlock) -> Self {
        let resize = sb.rev_level >= 1
            && FeatureCompat::from_bits_retain(sb.feature_compat).contains(FeatureCompat::RESIZE_INODE);
        Self {
            block_size: sb.block_size(),
            inode_size: sb.inode_size(),
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            first_data_block: sb.first_data_block,
            group_count: sb.group_count(),
            first_ino: sb.first_ino(),
            desc_blocks: sb.desc_blocks(),
            inode_table_blocks: sb.inode_table_blocks(),
            reserved_gdt_blocks: if resize { sb.reserved_gdt_blocks as u32 } else { 0 },
            sparse_super: sb.sparse_super(),
            filetype: sb.has_filetype(),
            creator_os: sb.creator_os(),
        }
    }

    /// Block addresses held by one indirection block.
    pub fn addrs_per_block(&self) -> u32 {
        (self.block_size / 4) as u32
    }

    pub fn sectors_per_block(&self) -> u32 {
        (self.block_size / 512) as u32
    }

    /// (group, index within group) of inode `ino`.
    pub fn inode_group(&self, ino: u32) -> (u32, u32) {
        ((ino - 1) / self.inodes_per_group, (ino - 1) % self.inodes_per_group)
    }

    /// (group, bit within the group's block bitmap) of `block`.
    pub fn block_group(&self, block: u32) -> (u32, u32) {
        let rel = block - self.first_data_block;
        (rel / self.blocks_per_group, rel % self.blocks_per_group)
    }

    pub fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    pub fn blocks_in_group(&self, group: u32) -> u32 {
        core::cmp::min(self.blocks_per_group, self.blocks_count - self.group_first_block(group))
    }

    pub fn group_has_super(&self, group: u32) -> bool {
        group <= 1 || !self.sparse_super || [3u32, 5, 7].iter().any(|&base| is_power_of(group, base))
    }

    /// Superblock copy, descriptor table and reserved descriptor blocks at
    /// the start of `group`.
    pub fn super_overhead(&self, group: u32) -> u32 {
        if self.group_has_super(group) {
            1 + self.desc_blocks + self.reserved_gdt_blocks
        } else {
            0
        }
    }

    /// (block, byte offset) of group descriptor `group` in the primary table.
    pub fn desc_location(&self, group: u32) -> (u32, usize) {
        let per_block = self.block_size / size_of::<GroupDesc>();
        let group = group as usize;
        (
            self.first_data_block + 1 + (group / per_block) as u32,
            (group % per_block) * size_of::<GroupDesc>(),
        )
    }

    /// Last logical block index a file can map, plus one.
    pub fn max_file_blocks(&self) -> u64 {
        let apb = self.addrs_per_block() as u64;
        let total = 12 + apb + apb * apb + apb * apb * apb;
        core::cmp::min(total, u32::MAX as u64)
    }
}

// ===== Block group descriptor =====

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
    pub pad: u16,
    pub reserved: [u8; 12],
}

unsafe impl Pod for GroupDesc {}

// ===== Inode =====

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size_lo: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// In 512-byte units, indirection blocks included.
    pub blocks: u32,
    pub flags: u32,
    pub osd1: u32,
    pub block: [u32; BLOCK_POINTERS],
    pub generation: u32,
    pub file_acl: u32,
    /// Upper half of the size for regular files, `dir_acl` otherwise.
    pub size_high: u32,
    pub faddr: u32,
    pub osd2: [u8; 12],
}

unsafe impl Pod for DiskInode {}

/// File type bits of `i_mode`.
pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

bitflags! {
    /// Permission part of `i_mode`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u16 {
        const SET_UID = 0o4000;
        const SET_GID = 0o2000;
        const STICKY = 0o1000;
        const OWNER_READ = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC = 0o100;
        const GROUP_READ = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC = 0o010;
        const OTHER_READ = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC = 0o001;
    }

    /// `i_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InodeFlags: u32 {
        const SECURE_DELETE = 0x0000_0001;
        const UNDELETE = 0x0000_0002;
        const COMPRESS = 0x0000_0004;
        const SYNC = 0x0000_0008;
        const IMMUTABLE = 0x0000_0010;
        const APPEND = 0x0000_0020;
        const NO_DUMP = 0x0000_0040;
        const NO_ATIME = 0x0000_0080;
        const INDEX = 0x0000_1000;
        const JOURNAL_DATA = 0x0000_4000;
        const NO_TAIL = 0x0000_8000;
        const DIR_SYNC = 0x0001_0000;
        const TOP_DIR = 0x0002_0000;
    }
}

pub fn mode_type(kind: InodeType) -> u16 {
    match kind {
        InodeType::File => S_IFREG,
        InodeType::Directory => S_IFDIR,
        InodeType::SymLink => S_IFLNK,
        InodeType::CharDevice => S_IFCHR,
        InodeType::BlockDevice => S_IFBLK,
        InodeType::Fifo => S_IFIFO,
        InodeType::Socket => S_IFSOCK,
    }
}

/// Creator-OS dependent tail of the inode (`osd2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsSpecific {
    Linux {
        frag: u8,
        fsize: u8,
        uid_high: u16,
        gid_high: u16,
    },
    Hurd {
        frag: u8,
        fsize: u8,
        mode_high: u16,
        uid_high: u16,
        gid_high: u16,
        author: u32,
    },
    Masix {
        frag: u8,
        fsize: u8,
    },
    Raw([u8; 12]),
}

impl DiskInode {
    pub fn kind(&self) -> InodeType {
        match self.mode & S_IFMT {
            S_IFDIR => InodeType::Directory,
            S_IFLNK => InodeType::SymLink,
            S_IFCHR => InodeType::CharDevice,
            S_IFBLK => InodeType::BlockDevice,
            S_IFIFO => InodeType::Fifo,
            S_IFSOCK => InodeType::Socket,
            _ => InodeType::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn permissions(&self) -> Permissions {
        Permissions::from_bits_truncate(self.mode)
    }

    pub fn set_permissions(&mut self, perm: Permissions) {
        self.mode = (self.mode & S_IFMT) | perm.bits();
    }

    pub fn size(&self) -> u64 {
        let lo = self.size_lo as u64;
        if self.kind() == InodeType::File {
            lo | (self.size_high as u64) << 32
        } else {
            lo
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.size_lo = size as u32;
        if self.kind() == InodeType::File {
            self.size_high = (size >> 32) as u32;
        }
    }

    pub fn os_specific(&self, os: CreatorOs) -> OsSpecific {
        let raw = self.osd2;
        let half = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        match os {
            CreatorOs::Linux => OsSpecific::Linux {
                frag: raw[0],
                fsize: raw[1],
                uid_high: half(4),
                gid_high: half(6),
            },
            CreatorOs::Hurd => OsSpecific::Hurd {
                frag: raw[0],
                fsize: raw[1],
                mode_high: half(2),
                uid_high: half(4),
                gid_high: half(6),
                author: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            },
            CreatorOs::Masix => OsSpecific::Masix {
                frag: raw[0],
                fsize: raw[1],
            },
            _ => OsSpecific::Raw(raw),
        }
    }

    pub fn set_os_specific(&mut self, value: OsSpecific) {
        let mut raw = self.osd2;
        match value {
            OsSpecific::Linux { frag, fsize, uid_high, gid_high } => {
                raw[0] = frag;
                raw[1] = fsize;
                raw[4..6].copy_from_slice(&uid_high.to_le_bytes());
                raw[6..8].copy_from_slice(&gid_high.to_le_bytes());
            }
            OsSpecific::Hurd { frag, fsize, mode_high, uid_high, gid_high, author } => {
                raw[0] = frag;
                raw[1] = fsize;
                raw[2..4].copy_from_slice(&mode_high.to_le_bytes());
                raw[4..6].copy_from_slice(&uid_high.to_le_bytes());
                raw[6..8].copy_from_slice(&gid_high.to_le_bytes());
                raw[8..12].copy_from_slice(&author.to_le_bytes());
            }
            OsSpecific::Masix { frag, fsize } => {
                raw[0] = frag;
                raw[1] = fsize;
            }
            OsSpecific::Raw(bytes) => raw = bytes,
        }
        self.osd2 = raw;
    }

    /// Full owner id; only Linux and Hurd carry the upper 16 bits.
    pub fn owner(&self, os: CreatorOs) -> (u32, u32) {
        let (uid_high, gid_high) = match self.os_specific(os) {
            OsSpecific::Linux { uid_high, gid_high, .. } | OsSpecific::Hurd { uid_high, gid_high, .. } => {
                (uid_high, gid_high)
            }
            _ => (0, 0),
        };
        (
            self.uid as u32 | (uid_high as u32) << 16,
            self.gid as u32 | (gid_high as u32) << 16,
        )
    }

    pub fn set_owner(&mut self, os: CreatorOs, uid: u32, gid: u32) {
        self.uid = uid as u16;
        self.gid = gid as u16;
        match self.os_specific(os) {
            OsSpecific::Linux { frag, fsize, .. } => self.set_os_specific(OsSpecific::Linux {
                frag,
                fsize,
                uid_high: (uid >> 16) as u16,
                gid_high: (gid >> 16) as u16,
            }),
            OsSpecific::Hurd { frag, fsize, mode_high, author, .. } => self.set_os_specific(OsSpecific::Hurd {
                frag,
                fsize,
                mode_high,
                uid_high: (uid >> 16) as u16,
                gid_high: (gid >> 16) as u16,
                author,
            }),
            _ => {}
        }
    }
}

// ===== Directory entries =====

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirEntryHeader {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
    // followed by name[name_len]
}

unsafe impl Pod for DirEntryHeader {}

pub const DIRENT_HEADER_SIZE: usize = size_of::<DirEntryHeader>();

/// Smallest record that holds a name of `name_len` bytes.
pub const fn dirent_size(name_len: usize) -> usize {
    (DIRENT_HEADER_SIZE + name_len + 3) & !3
}

/// `rec_len` of a record spanning a whole 64 KiB block does not fit in 16
/// bits and is stored as 65535.
pub const fn rec_len_from_disk(raw: u16) -> usize {
    if raw == u16::MAX { 65536 } else { raw as usize }
}

pub const fn rec_len_to_disk(len: usize) -> u16 {
    if len >= 65535 { u16::MAX } else { len as u16 }
}

/// Directory entry type tags (`file_type`).
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

pub fn dirent_type(kind: InodeType) -> u8 {
    match kind {
        InodeType::File => FT_REG_FILE,
        InodeType::Directory => FT_DIR,
        InodeType::SymLink => FT_SYMLINK,
        InodeType::CharDevice => FT_CHRDEV,
        InodeType::BlockDevice => FT_BLKDEV,
        InodeType::Fifo => FT_FIFO,
        InodeType::Socket => FT_SOCK,
    }
}

pub fn dirent_kind(tag: u8) -> Option<InodeType> {
    match tag {
        FT_REG_FILE => Some(InodeType::File),
        FT_DIR => Some(InodeType::Directory),
        FT_SYMLINK => Some(InodeType::SymLink),
        FT_CHRDEV => Some(InodeType::CharDevice),
        FT_BLKDEV => Some(InodeType::BlockDevice),
        FT_FIFO => Some(InodeType::Fifo),
        FT_SOCK => Some(InodeType::Socket),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::{bytes_of, zeroed};

    #[test]
    fn structure_sizes() {
        assert_eq!(size_of::<SuperBlock>(), 1024);
        assert_eq!(size_of::<GroupDesc>(), 32);
        assert_eq!(size_of::<DiskInode>(), 128);
        assert_eq!(size_of::<DirEntryHeader>(), 8);
    }

    #[test]
    fn superblock_field_offsets() {
        let mut sb: SuperBlock = zeroed();
        sb.magic = EXT2_MAGIC;
        sb.rev_level = 0x0102_0304;
        sb.inode_size = 0xAABB;
        let bytes = bytes_of(&sb);
        assert_eq!(&bytes[56..58], &[0x53, 0xEF]);
        assert_eq!(&bytes[76..80], &[4, 3, 2, 1]);
        assert_eq!(&bytes[88..90], &[0xBB, 0xAA]);
    }

    #[test]
    fn revision_zero_defaults() {
        let mut sb: SuperBlock = zeroed();
        sb.inode_size = 256;
        sb.first_ino = 20;
        assert_eq!(sb.inode_size(), 128);
        assert_eq!(sb.first_ino(), 11);
        sb.rev_level = 1;
        assert_eq!(sb.inode_size(), 256);
        assert_eq!(sb.first_ino(), 20);
    }

    #[test]
    fn sparse_backup_groups() {
        let mut sb: SuperBlock = zeroed();
        sb.rev_level = 1;
        sb.log_block_size = 0;
        sb.first_data_block = 1;
        sb.blocks_count = 30 * 1024 + 1;
        sb.blocks_per_group = 1024;
        sb.inodes_per_group = 64;
        sb.inode_size = 128;
        sb.feature_ro_compat = FeatureRoCompat::SPARSE_SUPER.bits();
        let geo = Geometry::new(&sb);
        assert_eq!(geo.group_count, 30);
        let with: alloc::vec::Vec<u32> = (0..30).filter(|&g| geo.group_has_super(g)).collect();
        assert_eq!(with, [0, 1, 3, 5, 7, 9, 25, 27]);
    }

    #[test]
    fn geometry_locations() {
        let mut sb: SuperBlock = zeroed();
        sb.first_data_block = 1;
        sb.blocks_count = 2049;
        sb.blocks_per_group = 1024;
        sb.inodes_per_group = 128;
        let geo = Geometry::new(&sb);
        assert_eq!(geo.inode_group(2), (0, 1));
        assert_eq!(geo.inode_group(129), (1, 0));
        assert_eq!(geo.block_group(1025), (1, 0));
        assert_eq!(geo.desc_location(1), (2, 32));
        assert_eq!(geo.inode_table_blocks, 16);
        assert_eq!(geo.max_file_blocks(), 12 + 256 + 256 * 256 + 256 * 256 * 256);
    }

    #[test]
    fn large_file_size_uses_high_half() {
        let mut inode = DiskInode { mode: S_IFREG | 0o644, ..Default::default() };
        inode.set_size(0x1_0000_0010);
        assert_eq!({ inode.size_lo }, 0x10);
        assert_eq!({ inode.size_high }, 1);
        assert_eq!(inode.size(), 0x1_0000_0010);

        let mut dir = DiskInode { mode: S_IFDIR | 0o755, size_high: 7, ..Default::default() };
        dir.set_size(2048);
        assert_eq!(dir.size(), 2048);
    }

    #[test]
    fn linux_owner_high_bits() {
        let mut inode = DiskInode::default();
        inode.set_owner(CreatorOs::Linux, 0x0001_0002, 0x0003_0004);
        assert_eq!((inode.uid, inode.gid), (2, 4));
        assert_eq!(inode.owner(CreatorOs::Linux), (0x0001_0002, 0x0003_0004));
        assert_eq!(
            inode.os_specific(CreatorOs::Linux),
            OsSpecific::Linux { frag: 0, fsize: 0, uid_high: 1, gid_high: 3 }
        );
        // Masix has no high owner bits.
        assert_eq!(inode.owner(CreatorOs::Masix), (2, 4));
    }

    #[test]
    fn permission_bits_keep_type() {
        let mut inode = DiskInode { mode: S_IFDIR | 0o700, ..Default::default() };
        inode.set_permissions(Permissions::from_bits_truncate(0o755));
        assert_eq!({ inode.mode }, S_IFDIR | 0o755);
        assert!(inode.is_dir());
    }

    #[test]
    fn dirent_sizes_round_to_four() {
        assert_eq!(dirent_size(1), 12);
        assert_eq!(dirent_size(2), 12);
        assert_eq!(dirent_size(4), 12);
        assert_eq!(dirent_size(5), 16);
        assert_eq!(rec_len_from_disk(rec_len_to_disk(65536)), 65536);
        assert_eq!(rec_len_from_disk(rec_len_to_disk(1012)), 1012);
    }

    #[test]
    fn unknown_errors_value_means_continue() {
        assert_eq!(ErrorPolicy::from_raw(0), ErrorPolicy::Continue);
        assert_eq!(ErrorPolicy::from_raw(ErrorPolicy::Panic.to_raw()), ErrorPolicy::Panic);
    }
}
