//! Volume formatter.
//!
//! Lays out a fresh ext2 volume over the whole device: superblock and
//! descriptor table (with backups in the groups that carry them), per-group
//! bitmaps and zeroed inode tables, the root directory and `lost+found`.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::block_cache::{self, BlockCache, zeroed};
use crate::block_dev::BlockDevice;
use crate::config::{
    EXT2_MAGIC, FormatConfig, GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, ROOT_INO,
    SECTOR_SIZE, SUPERBLOCK_OFFSET,
};
use crate::diskio::DiskIo;
use crate::error::{FileSystemError, FsResult};
use crate::layout::{
    CreatorOs, DIRENT_HEADER_SIZE, DirEntryHeader, DiskInode, FeatureIncompat, FeatureRoCompat, Geometry, GroupDesc,
    S_IFDIR, STATE_VALID, SuperBlock, dirent_size, rec_len_to_disk,
};

/// Slots of the scratch block cache used while formatting.
const FORMAT_CACHE_SLOTS: usize = 16;

const MAX_PER_GROUP: usize = 65528;

/// Inode number of `lost+found`: the first unreserved inode.
fn lost_found_ino(sb: &SuperBlock) -> u32 {
    sb.first_ino()
}

/// Build the superblock for `blocks_count` blocks, or `None` if that many
/// blocks cannot hold one group's metadata plus the two directories.
fn plan(config: &FormatConfig, blocks_count: u32, now: u32) -> Option<SuperBlock> {
    let bs = config.block_size;
    let first_data_block = if bs == MIN_BLOCK_SIZE { 1 } else { 0 };
    if blocks_count <= first_data_block {
        return None;
    }
    let inode_size = if config.revision == 0 { GOOD_OLD_INODE_SIZE } else { config.inode_size as usize };
    // Round up so the inode table fills whole blocks.
    let table_blocks = (config.inodes_per_group as usize * inode_size).div_ceil(bs);
    let inodes_per_group = core::cmp::min(table_blocks * bs / inode_size, core::cmp::min(bs * 8, MAX_PER_GROUP)) as u32;
    let group_count = (blocks_count - first_data_block).div_ceil(config.blocks_per_group);

    let mut sb: SuperBlock = zeroed();
    sb.inodes_count = group_count.checked_mul(inodes_per_group)?;
    sb.blocks_count = blocks_count;
    sb.first_data_block = first_data_block;
    sb.log_block_size = (bs / MIN_BLOCK_SIZE).trailing_zeros();
    sb.log_frag_size = sb.log_block_size;
    sb.blocks_per_group = config.blocks_per_group;
    sb.frags_per_group = config.blocks_per_group;
    sb.inodes_per_group = inodes_per_group;
    sb.wtime = now;
    sb.max_mnt_count = u16::MAX;
    sb.magic = EXT2_MAGIC;
    sb.state = STATE_VALID;
    sb.errors = config.error_policy.to_raw();
    sb.lastcheck = now;
    sb.creator_os = 0;
    sb.rev_level = config.revision;
    if config.revision >= 1 {
        sb.first_ino = GOOD_OLD_FIRST_INO;
        sb.inode_size = inode_size as u16;
        sb.feature_incompat = FeatureIncompat::FILETYPE.bits();
        sb.feature_ro_compat = (FeatureRoCompat::SPARSE_SUPER | FeatureRoCompat::LARGE_FILE).bits();
    }
    sb.volume_name = config.volume_name;
    for (i, byte) in sb.uuid.iter_mut().enumerate() {
        *byte = (now.rotate_left(i as u32 * 5) ^ blocks_count.rotate_right(i as u32 * 3)) as u8;
    }

    let geo = Geometry::new(&sb);
    let last = group_count - 1;
    let room = geo.blocks_in_group(last);
    let extra = if last == 0 { 2 } else { 0 };
    if room < geo.super_overhead(last) + 2 + geo.inode_table_blocks + extra + 1 {
        return None;
    }
    Some(sb)
}

fn check_config(config: &FormatConfig) -> FsResult<()> {
    let bs = config.block_size;
    if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) || bs % SECTOR_SIZE != 0 {
        return Err(FileSystemError::InvalidArgument);
    }
    // Group free counts are 16 bits wide.
    let per_group_max = core::cmp::min(bs * 8, MAX_PER_GROUP);
    if config.blocks_per_group == 0
        || config.blocks_per_group as usize > per_group_max
        || config.blocks_per_group % 8 != 0
    {
        return Err(FileSystemError::InvalidArgument);
    }
    if config.inodes_per_group < GOOD_OLD_FIRST_INO + 1 || config.inodes_per_group as usize > per_group_max {
        return Err(FileSystemError::InvalidArgument);
    }
    if config.revision > 1 {
        return Err(FileSystemError::Unsupported);
    }
    let isz = config.inode_size as usize;
    if config.revision == 1 && (isz < GOOD_OLD_INODE_SIZE || !isz.is_power_of_two() || isz > bs) {
        return Err(FileSystemError::InvalidArgument);
    }
    Ok(())
}

/// One directory block holding `entries` in order; the last record runs to
/// the end of the block.
fn dir_block(bs: usize, entries: &[(u32, &[u8])], filetype: bool) -> Vec<u8> {
    let mut block = vec![0u8; bs];
    let mut offset = 0;
    for (i, &(ino, name)) in entries.iter().enumerate() {
        let rec_len = if i + 1 == entries.len() { bs - offset } else { dirent_size(name.len()) };
        let header = DirEntryHeader {
            inode: ino,
            rec_len: rec_len_to_disk(rec_len),
            name_len: name.len() as u8,
            // Only directories are created here.
            file_type: if filetype { crate::layout::FT_DIR } else { 0 },
        };
        block[offset..offset + DIRENT_HEADER_SIZE].copy_from_slice(block_cache::bytes_of(&header));
        block[offset + DIRENT_HEADER_SIZE..offset + DIRENT_HEADER_SIZE + name.len()].copy_from_slice(name);
        offset += rec_len;
    }
    block
}

fn set_bits(bits: &mut [u8], range: core::ops::Range<usize>) {
    for bit in range {
        bits[bit / 8] |= 1 << (bit % 8);
    }
}

/// Format `device` with `config`. `now` stamps the new inodes and the
/// superblock.
pub fn format(device: &Arc<dyn BlockDevice>, config: &FormatConfig, now: u32) -> FsResult<()> {
    check_config(config)?;
    if device.block_size() != SECTOR_SIZE {
        return Err(FileSystemError::InvalidArgument);
    }
    let bs = config.block_size;
    let device_blocks = (device.num_blocks() as u64 * SECTOR_SIZE as u64 / bs as u64).min(u32::MAX as u64) as u32;

    // A trailing group too small for its own metadata is left off.
    let mut blocks_count = device_blocks;
    let mut sb = loop {
        if let Some(sb) = plan(config, blocks_count, now) {
            break sb;
        }
        let first_data_block = if bs == MIN_BLOCK_SIZE { 1 } else { 0 };
        let groups = blocks_count.saturating_sub(first_data_block).div_ceil(config.blocks_per_group);
        if groups <= 1 {
            log::warn!("mkfs: {} blocks are too few for a volume", device_blocks);
            return Err(FileSystemError::NoSpace);
        }
        blocks_count = first_data_block + (groups - 1) * config.blocks_per_group;
    };
    let geo = Geometry::new(&sb);
    let cache = block_cache::block_cache(device.clone(), bs, FORMAT_CACHE_SLOTS)?;
    let io = DiskIo::new(&cache);

    let lost_found = lost_found_ino(&sb);
    let filetype = geo.filetype;
    let mut descs = Vec::with_capacity(geo.group_count as usize);
    let mut root_block = 0;

    for group in 0..geo.group_count {
        let first = geo.group_first_block(group);
        let overhead = geo.super_overhead(group);
        let block_bitmap = first + overhead;
        let inode_bitmap = block_bitmap + 1;
        let inode_table = inode_bitmap + 1;
        let data_start = inode_table + geo.inode_table_blocks;
        let in_group = geo.blocks_in_group(group);

        let mut used_blocks = data_start - first;
        let mut used_inodes = 0;
        let mut dirs = 0;
        if group == 0 {
            root_block = data_start;
            used_blocks += 2;
            used_inodes = lost_found;
            dirs = 2;
        }

        let mut bits = vec![0u8; bs];
        set_bits(&mut bits, 0..used_blocks as usize);
        set_bits(&mut bits, in_group as usize..bs * 8);
        io.write(&bits, block_bitmap as u64 * bs as u64)?;

        let mut bits = vec![0u8; bs];
        set_bits(&mut bits, 0..used_inodes as usize);
        set_bits(&mut bits, geo.inodes_per_group as usize..bs * 8);
        io.write(&bits, inode_bitmap as u64 * bs as u64)?;

        io.zero(inode_table as u64 * bs as u64, geo.inode_table_blocks as usize * bs)?;

        descs.push(GroupDesc {
            block_bitmap,
            inode_bitmap,
            inode_table,
            free_blocks_count: (in_group - used_blocks) as u16,
            free_inodes_count: (geo.inodes_per_group - used_inodes) as u16,
            used_dirs_count: dirs,
            ..GroupDesc::default()
        });
    }

    sb.free_blocks_count = descs.iter().map(|d| d.free_blocks_count as u32).sum();
    sb.free_inodes_count = descs.iter().map(|d| d.free_inodes_count as u32).sum();

    // Root and lost+found.
    let lost_found_block = root_block + 1;
    io.write(
        &dir_block(bs, &[(ROOT_INO, &b"."[..]), (ROOT_INO, &b".."[..]), (lost_found, &b"lost+found"[..])], filetype),
        root_block as u64 * bs as u64,
    )?;
    io.write(
        &dir_block(bs, &[(lost_found, &b"."[..]), (ROOT_INO, &b".."[..])], filetype),
        lost_found_block as u64 * bs as u64,
    )?;
    let dir_inode = |perm: u16, links: u16, block: u32| {
        let mut inode = DiskInode {
            mode: S_IFDIR | perm,
            links_count: links,
            atime: now,
            ctime: now,
            mtime: now,
            blocks: geo.sectors_per_block(),
            ..DiskInode::default()
        };
        inode.set_size(bs as u64);
        inode.block[0] = block;
        inode
    };
    let table = descs[0].inode_table as u64 * bs as u64;
    let slot = |ino: u32| table + (ino as u64 - 1) * geo.inode_size as u64;
    io.write_pod(&dir_inode(0o755, 3, root_block), slot(ROOT_INO))?;
    io.write_pod(&dir_inode(0o700, 2, lost_found_block), slot(lost_found))?;

    // Superblock and descriptor table, then their backups.
    for group in (0..geo.group_count).filter(|&g| geo.group_has_super(g)) {
        let first = geo.group_first_block(group);
        let mut copy = sb;
        copy.block_group_nr = group as u16;
        let (sb_offset, table_block) = if group == 0 {
            (SUPERBLOCK_OFFSET, geo.desc_location(0).0)
        } else {
            (first as u64 * bs as u64, first + 1)
        };
        if group != 0 && bs > crate::config::SUPERBLOCK_SIZE {
            io.zero(sb_offset, bs)?;
        }
        io.write_pod(&copy, sb_offset)?;
        io.zero(table_block as u64 * bs as u64, geo.desc_blocks as usize * bs)?;
        write_descs(&io, &descs, table_block as u64 * bs as u64)?;
    }

    cache.sync_all()?;
    device.sync()?;
    log::info!(
        "mkfs: {} blocks of {} bytes in {} groups, {} inodes ({} creator)",
        geo.blocks_count,
        bs,
        geo.group_count,
        geo.inodes_count,
        if geo.creator_os == CreatorOs::Linux { "linux" } else { "other" }
    );
    Ok(())
}

fn write_descs(io: &DiskIo<'_>, descs: &[GroupDesc], base: u64) -> FsResult<()> {
    for (i, desc) in descs.iter().enumerate() {
        io.write_pod(desc, base + (i * size_of::<GroupDesc>()) as u64)?;
    }
    Ok(())
}

/// Scratch cache over `device`, for tools that inspect a volume without
/// mounting it.
pub fn scratch_cache(device: &Arc<dyn BlockDevice>, block_size: usize) -> FsResult<BlockCache> {
    block_cache::block_cache(device.clone(), block_size, FORMAT_CACHE_SLOTS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_dev::RamDisk;
    use crate::config::MountConfig;
    use crate::ext2::Ext2FileSystem;
    use crate::layout::ErrorPolicy;
    use crate::time::ManualClock;

    fn disk(bytes: usize) -> Arc<dyn BlockDevice> {
        Arc::new(RamDisk::with_bytes(bytes))
    }

    fn read_super(device: &Arc<dyn BlockDevice>) -> SuperBlock {
        let cache = scratch_cache(device, 1024).unwrap();
        DiskIo::new(&cache).read_pod(SUPERBLOCK_OFFSET).unwrap()
    }

    #[test]
    fn superblock_fields() {
        let device = disk(3 << 20);
        let config = FormatConfig { blocks_per_group: 1024, inodes_per_group: 128, ..FormatConfig::default() };
        format(&device, &config, 77).unwrap();
        let sb = read_super(&device);
        sb.validate().unwrap();
        assert_eq!({ sb.blocks_count }, 3072);
        assert_eq!(sb.group_count(), 3);
        assert_eq!({ sb.inodes_count }, 384);
        assert_eq!(sb.first_ino(), 11);
        assert_eq!(sb.error_policy(), ErrorPolicy::Panic);
        assert!(sb.has_filetype() && sb.sparse_super());
        assert_eq!({ sb.wtime }, 77);
        // Three groups of 2 + 2 + 16 metadata blocks, minus the sparse
        // group 2 superblock copy, plus the two directory blocks.
        assert_eq!({ sb.free_blocks_count }, 3071 - (20 + 20 + 18) - 2);
        assert_eq!({ sb.free_inodes_count }, 384 - 11);
    }

    #[test]
    fn backups_in_sparse_groups() {
        let device = disk(4 << 20);
        let config = FormatConfig { blocks_per_group: 1024, inodes_per_group: 64, ..FormatConfig::default() };
        format(&device, &config, 1).unwrap();
        let cache = scratch_cache(&device, 1024).unwrap();
        let io = DiskIo::new(&cache);
        let primary: SuperBlock = io.read_pod(SUPERBLOCK_OFFSET).unwrap();
        // Group 1 and 3 carry copies, group 2 does not.
        for (group, has_copy) in [(1u64, true), (2, false), (3, true)] {
            let at = (1 + group * 1024) * 1024;
            let copy: SuperBlock = io.read_pod(at).unwrap();
            assert_eq!({ copy.magic } == EXT2_MAGIC, has_copy, "group {}", group);
            if has_copy {
                assert_eq!({ copy.block_group_nr } as u64, group);
                assert_eq!({ copy.blocks_count }, { primary.blocks_count });
                let desc: GroupDesc = io.read_pod(at + 1024).unwrap();
                let first: GroupDesc = io.read_pod(2 * 1024).unwrap();
                assert_eq!({ desc.inode_table }, { first.inode_table });
            }
        }
    }

    #[test]
    fn revision_zero_without_features() {
        let device = disk(1 << 20);
        let config = FormatConfig { revision: 0, ..FormatConfig::default() };
        format(&device, &config, 5).unwrap();
        let sb = read_super(&device);
        assert_eq!(sb.inode_size(), 128);
        assert!(!sb.has_filetype());
        let fs = Ext2FileSystem::mount(device, MountConfig::default(), Arc::new(ManualClock::new(5))).unwrap();
        assert!(fs.fsck().unwrap().is_clean());
        assert_eq!(fs.lookup_path("/lost+found").unwrap(), 11);
    }

    #[test]
    fn larger_blocks_and_inodes() {
        let device = disk(8 << 20);
        let config = FormatConfig { block_size: 4096, inode_size: 256, ..FormatConfig::default() };
        format(&device, &config, 9).unwrap();
        let fs = Ext2FileSystem::mount(device, MountConfig::default(), Arc::new(ManualClock::new(9))).unwrap();
        assert_eq!(fs.geometry().block_size, 4096);
        assert_eq!(fs.geometry().first_data_block, 0);
        assert_eq!(fs.geometry().inode_size, 256);
        assert!(fs.fsck().unwrap().is_clean());
    }

    #[test]
    fn undersized_trailing_group_is_dropped() {
        // 1024 + 10 blocks: the second group could not hold its metadata.
        let device = disk((1 + 1024 + 10) * 1024);
        let config = FormatConfig { blocks_per_group: 1024, inodes_per_group: 128, ..FormatConfig::default() };
        format(&device, &config, 1).unwrap();
        let sb = read_super(&device);
        assert_eq!(sb.group_count(), 1);
        assert_eq!({ sb.blocks_count }, 1025);
    }

    #[test]
    fn rejects_bad_parameters() {
        let device = disk(1 << 20);
        let bad = [
            FormatConfig { block_size: 1536, ..FormatConfig::default() },
            FormatConfig { blocks_per_group: 100_000, ..FormatConfig::default() },
            FormatConfig { inodes_per_group: 4, ..FormatConfig::default() },
            FormatConfig { inode_size: 100, ..FormatConfig::default() },
        ];
        for config in bad {
            assert_eq!(format(&device, &config, 0), Err(FileSystemError::InvalidArgument));
        }
        assert_eq!(format(&disk(8 * 1024), &FormatConfig::default(), 0), Err(FileSystemError::NoSpace));
    }
}
