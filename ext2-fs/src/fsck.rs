//! Read-only consistency check of the allocation counters.
//!
//! Recounts every group's bitmaps and compares the result with the group
//! descriptors and the in-memory superblock. Nothing is repaired.

use alloc::vec::Vec;

use crate::bitmap::{count_clear, test_bit};
use crate::diskio::DiskIo;
use crate::error::FsResult;
use crate::ext2::Ext2FileSystem;
use crate::layout::{DiskInode, GroupDesc, S_IFDIR, S_IFMT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    GroupFreeBlocks { group: u32, recorded: u32, counted: u32 },
    GroupFreeInodes { group: u32, recorded: u32, counted: u32 },
    GroupDirectories { group: u32, recorded: u32, counted: u32 },
    /// A superblock copy, descriptor, bitmap or inode table block is
    /// marked free.
    MetadataNotInUse { group: u32, block: u32 },
    TotalFreeBlocks { recorded: u32, counted: u32 },
    TotalFreeInodes { recorded: u32, counted: u32 },
    /// A live directory with fewer than two links.
    DirectoryLinks { ino: u32, links: u16 },
}

#[derive(Debug, Clone, Default)]
pub struct FsckReport {
    pub mismatches: Vec<Mismatch>,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub directories: u32,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub fn check(fs: &Ext2FileSystem) -> FsResult<FsckReport> {
    let mut report = FsckReport::default();
    for group in 0..fs.geo.group_count {
        let (desc, allocated) = {
            let _guard = fs.group_locks[group as usize].lock();
            let desc = fs.group_desc(group)?;
            check_blocks(fs, group, &desc, &mut report)?;
            (desc, check_inodes(fs, group, &desc, &mut report)?)
        };
        // Inode slots rank above group locks.
        check_directories(fs, group, &desc, &allocated, &mut report)?;
    }

    let (free_blocks, free_inodes) = {
        let sb = fs.sb.lock();
        (sb.free_blocks_count, sb.free_inodes_count)
    };
    if free_blocks != report.free_blocks {
        report.mismatches.push(Mismatch::TotalFreeBlocks { recorded: free_blocks, counted: report.free_blocks });
    }
    if free_inodes != report.free_inodes {
        report.mismatches.push(Mismatch::TotalFreeInodes { recorded: free_inodes, counted: report.free_inodes });
    }
    if !report.is_clean() {
        log::warn!("ext2: fsck found {} mismatches", report.mismatches.len());
    }
    Ok(report)
}

fn check_blocks(fs: &Ext2FileSystem, group: u32, desc: &GroupDesc, report: &mut FsckReport) -> FsResult<()> {
    let first = fs.geo.group_first_block(group);
    let in_group = fs.geo.blocks_in_group(group);
    let bitmap = fs.disk.reference(desc.block_bitmap)?;

    let counted = bitmap.read(|bits| count_clear(bits, in_group as usize));
    let recorded = desc.free_blocks_count as u32;
    if counted != recorded {
        report.mismatches.push(Mismatch::GroupFreeBlocks { group, recorded, counted });
    }
    report.free_blocks += counted;

    let table = desc.inode_table;
    let metadata = (first..first + fs.geo.super_overhead(group))
        .chain([desc.block_bitmap, desc.inode_bitmap])
        .chain(table..table + fs.geo.inode_table_blocks);
    for block in metadata {
        if block < first || block >= first + in_group {
            continue;
        }
        if !bitmap.read(|bits| test_bit(bits, (block - first) as usize)) {
            report.mismatches.push(Mismatch::MetadataNotInUse { group, block });
        }
    }
    Ok(())
}

/// Returns the in-group indices of allocated inodes.
fn check_inodes(fs: &Ext2FileSystem, group: u32, desc: &GroupDesc, report: &mut FsckReport) -> FsResult<Vec<u32>> {
    let per_group = fs.geo.inodes_per_group;
    let bitmap = fs.disk.reference(desc.inode_bitmap)?;

    let counted = bitmap.read(|bits| count_clear(bits, per_group as usize));
    let recorded = desc.free_inodes_count as u32;
    if counted != recorded {
        report.mismatches.push(Mismatch::GroupFreeInodes { group, recorded, counted });
    }
    report.free_inodes += counted;
    Ok(bitmap.read(|bits| (0..per_group).filter(|&i| test_bit(bits, i as usize)).collect()))
}

fn check_directories(
    fs: &Ext2FileSystem,
    group: u32,
    desc: &GroupDesc,
    allocated: &[u32],
    report: &mut FsckReport,
) -> FsResult<()> {
    let mut dirs = 0;
    for &index in allocated {
        let ino = group * fs.geo.inodes_per_group + index + 1;
        let inode = read_inode(fs, desc, index, ino)?;
        if inode.mode & S_IFMT != S_IFDIR {
            continue;
        }
        dirs += 1;
        // Zero links is an unlinked directory still held open.
        if inode.links_count == 1 {
            report.mismatches.push(Mismatch::DirectoryLinks { ino, links: 1 });
        }
    }
    let recorded = desc.used_dirs_count as u32;
    if dirs != recorded {
        report.mismatches.push(Mismatch::GroupDirectories { group, recorded, counted: dirs });
    }
    report.directories += dirs;
    Ok(())
}

/// The cached copy wins over the inode table, which may be stale.
fn read_inode(fs: &Ext2FileSystem, desc: &GroupDesc, index: u32, ino: u32) -> FsResult<DiskInode> {
    if let Some(inode) = fs.inodes.soft_search(ino, |c| c.disk) {
        return Ok(inode);
    }
    let table = desc.inode_table as u64 * fs.geo.block_size as u64;
    DiskIo::new(&fs.disk).read_pod(table + index as u64 * fs.geo.inode_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext2::tests::{format_and_mount, small_config};
    use crate::vfs::FileSystemDriver;

    #[test]
    fn fresh_volume_is_clean() {
        let fs = format_and_mount(small_config());
        let report = check(&fs).unwrap();
        assert!(report.is_clean(), "{:?}", report.mismatches);
        // Root and lost+found.
        assert_eq!(report.directories, 2);
        assert_eq!(report.free_blocks, { fs.sb.lock().free_blocks_count });
        assert_eq!(report.free_inodes, { fs.sb.lock().free_inodes_count });
    }

    #[test]
    fn counts_directories_across_groups() {
        let fs = format_and_mount(small_config());
        fs.mkdir("/a", 0o755, 0, 0).unwrap();
        fs.mkdir("/a/b", 0o755, 0, 0).unwrap();
        let report = check(&fs).unwrap();
        assert!(report.is_clean(), "{:?}", report.mismatches);
        assert_eq!(report.directories, 4);
    }

    #[test]
    fn detects_descriptor_drift() {
        let fs = format_and_mount(small_config());
        fs.update_group_desc(1, |d| d.free_blocks_count -= 1).unwrap();
        let report = check(&fs).unwrap();
        assert!(report.mismatches.iter().any(|m| matches!(m, Mismatch::GroupFreeBlocks { group: 1, .. })));
        assert!(!report.mismatches.iter().any(|m| matches!(m, Mismatch::TotalFreeBlocks { .. })));
    }

    #[test]
    fn detects_superblock_drift_and_free_metadata() {
        let fs = format_and_mount(small_config());
        fs.sb.lock().free_inodes_count += 1;
        let desc = fs.group_desc(0).unwrap();
        fs.disk.reference(desc.block_bitmap).unwrap().modify(|bits| bits[0] &= !1);
        let report = check(&fs).unwrap();
        assert!(report.mismatches.contains(&Mismatch::TotalFreeInodes {
            recorded: report.free_inodes + 1,
            counted: report.free_inodes,
        }));
        assert!(report.mismatches.contains(&Mismatch::MetadataNotInUse { group: 0, block: 1 }));
    }
}
