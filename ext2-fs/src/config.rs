use log::LevelFilter;

use crate::layout::ErrorPolicy;

// 日志配置
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Debug;

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Device sector size. Every `BlockDevice` transfers in units of this.
pub const SECTOR_SIZE: usize = 512;

/// Byte offset of the primary superblock from the partition start,
/// independent of the filesystem block size.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;

pub const EXT2_MAGIC: u16 = 0xEF53;

/// Inode number of the root directory.
pub const ROOT_INO: u32 = 2;

/// First usable inode on revision 0 volumes.
pub const GOOD_OLD_FIRST_INO: u32 = 11;
pub const GOOD_OLD_INODE_SIZE: usize = 128;

pub const DIRECT_BLOCKS: usize = 12;
pub const INDIRECT_SLOT: usize = 12;
pub const DOUBLE_INDIRECT_SLOT: usize = 13;
pub const TRIPLE_INDIRECT_SLOT: usize = 14;
pub const BLOCK_POINTERS: usize = 15;

pub const MAX_NAME_LEN: usize = 255;

/// Symlink targets shorter than this live inside the block pointer array.
pub const FAST_SYMLINK_MAX: usize = BLOCK_POINTERS * 4;

pub const MIN_BLOCK_SIZE: usize = 1024;
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Size in bytes of the bookkeeping kept per cache slot, used when sizing a
/// cache from a memory budget.
pub const CACHE_ENTRY_OVERHEAD: usize = 32;

/// Per-mount tunables.
#[derive(Debug, Clone, Copy)]
pub struct MountConfig {
    /// Number of filesystem blocks held by the disk block cache.
    pub disk_cache_slots: usize,
    /// Number of parsed inodes held by the inode cache.
    pub inode_cache_slots: usize,
    /// Writes covering at least this many blocks are laid out as one
    /// contiguous run of freshly allocated blocks. Zero disables it.
    pub contiguous_write_threshold: usize,
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            disk_cache_slots: 64,
            inode_cache_slots: 32,
            contiguous_write_threshold: 4,
            read_only: false,
        }
    }
}

impl MountConfig {
    /// Size both caches from a byte budget, three quarters of it going to
    /// disk blocks.
    pub fn from_memory_budget(bytes: usize, block_size: usize) -> Self {
        let disk_bytes = bytes / 4 * 3;
        let inode_bytes = bytes - disk_bytes;
        Self {
            disk_cache_slots: cache_entries(disk_bytes, block_size).max(8),
            inode_cache_slots: cache_entries(inode_bytes, GOOD_OLD_INODE_SIZE * 2).max(4),
            ..Self::default()
        }
    }
}

/// How many slots of `slab_size` bytes fit into `bytes`, counting the
/// per-slot bookkeeping.
pub const fn cache_entries(bytes: usize, slab_size: usize) -> usize {
    bytes / (slab_size + CACHE_ENTRY_OVERHEAD)
}

/// Inverse of [`cache_entries`].
pub const fn cache_calc_size(entries: usize, slab_size: usize) -> usize {
    entries * (slab_size + CACHE_ENTRY_OVERHEAD)
}

/// Parameters for [`crate::mkfs::format`].
#[derive(Debug, Clone, Copy)]
pub struct FormatConfig {
    pub block_size: usize,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// 0 = fixed 128-byte inodes, 1 = dynamic revision.
    pub revision: u32,
    pub inode_size: u16,
    pub error_policy: ErrorPolicy,
    pub volume_name: [u8; 16],
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 256,
            revision: 1,
            inode_size: 128,
            error_policy: ErrorPolicy::Panic,
            volume_name: [0; 16],
        }
    }
}
