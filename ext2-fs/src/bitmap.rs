//! Inode and block allocation over the per-group bitmaps.
//!
//! Every bitmap flip happens under the owning group's lock together with
//! the matching descriptor and superblock counter updates, so the counters
//! never drift from the bits.

use crate::error::{FileSystemError, FsResult};
use crate::ext2::Ext2FileSystem;

/// First run of `count` clear bits in `bits[start..limit]`. Fully
/// allocated bytes are skipped whole.
pub(crate) fn find_clear_run(bits: &[u8], start: usize, limit: usize, count: usize) -> Option<usize> {
    if count == 0 {
        return None;
    }
    let mut run_start = start;
    let mut run_len = 0;
    let mut i = start;
    while i < limit {
        if i % 8 == 0 && i + 8 <= limit && bits[i / 8] == 0xFF {
            run_len = 0;
            i += 8;
            continue;
        }
        if bits[i / 8] & (1 << (i % 8)) == 0 {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        } else {
            run_len = 0;
        }
        i += 1;
    }
    None
}

pub(crate) fn test_bit(bits: &[u8], bit: usize) -> bool {
    bits[bit / 8] & (1 << (bit % 8)) != 0
}

fn set_bit(bits: &mut [u8], bit: usize) {
    bits[bit / 8] |= 1 << (bit % 8);
}

fn clear_bit(bits: &mut [u8], bit: usize) {
    bits[bit / 8] &= !(1 << (bit % 8));
}

/// Clear bits among the first `limit`.
pub(crate) fn count_clear(bits: &[u8], limit: usize) -> u32 {
    (0..limit).filter(|&bit| !test_bit(bits, bit)).count() as u32
}

impl Ext2FileSystem {
    /// `hint` first, then every other group in index order.
    fn group_order(&self, hint: u32) -> impl Iterator<Item = u32> {
        let count = self.geo.group_count;
        let hint = if hint < count { hint } else { 0 };
        core::iter::once(hint).chain((0..count).filter(move |&g| g != hint))
    }

    /// Allocate an inode, preferring group `hint`.
    pub(crate) fn alloc_inode(&self, hint: u32, is_dir: bool) -> FsResult<u32> {
        self.check_writable()?;
        for group in self.group_order(hint) {
            if let Some(ino) = self.alloc_inode_in_group(group, is_dir)? {
                if group != hint {
                    log::debug!("ext2: inode {} allocated in group {} (hint {})", ino, group, hint);
                }
                return Ok(ino);
            }
        }
        log::warn!("ext2: out of inodes");
        Err(FileSystemError::NoInodes)
    }

    fn alloc_inode_in_group(&self, group: u32, is_dir: bool) -> FsResult<Option<u32>> {
        let _guard = self.group_locks[group as usize].lock();
        let desc = self.group_desc(group)?;
        if desc.free_inodes_count == 0 {
            return Ok(None);
        }
        let per_group = self.geo.inodes_per_group as usize;
        // Inodes below first_ino are reserved.
        let start = if group == 0 { self.geo.first_ino as usize - 1 } else { 0 };
        let bitmap = self.disk.reference(desc.inode_bitmap)?;
        let Some(bit) = bitmap.read(|bits| find_clear_run(bits, start, per_group, 1)) else {
            log::warn!("ext2: group {} claims {} free inodes but its bitmap is full", group, {
                desc.free_inodes_count
            });
            return Ok(None);
        };
        bitmap.modify(|bits| set_bit(bits, bit));
        self.update_group_desc(group, |d| {
            d.free_inodes_count -= 1;
            if is_dir {
                d.used_dirs_count += 1;
            }
        })?;
        self.sb.lock().free_inodes_count -= 1;
        Ok(Some(group * self.geo.inodes_per_group + bit as u32 + 1))
    }

    /// Release inode `ino`. Freeing a free inode is corruption.
    pub(crate) fn free_inode(&self, ino: u32, was_dir: bool) -> FsResult<()> {
        self.check_writable()?;
        if ino < self.geo.first_ino || ino > self.geo.inodes_count {
            return Err(self.corruption(format_args!("freeing reserved or invalid inode {}", ino)));
        }
        let (group, bit) = self.geo.inode_group(ino);
        let _guard = self.group_locks[group as usize].lock();
        let desc = self.group_desc(group)?;
        let bitmap = self.disk.reference(desc.inode_bitmap)?;
        if !bitmap.read(|bits| test_bit(bits, bit as usize)) {
            return Err(self.corruption(format_args!("double free of inode {}", ino)));
        }
        bitmap.modify(|bits| clear_bit(bits, bit as usize));
        self.update_group_desc(group, |d| {
            d.free_inodes_count += 1;
            if was_dir {
                d.used_dirs_count = d.used_dirs_count.saturating_sub(1);
            }
        })?;
        self.sb.lock().free_inodes_count += 1;
        Ok(())
    }

    /// Allocate one data block, preferring group `hint`.
    pub(crate) fn alloc_block(&self, hint: u32) -> FsResult<u32> {
        self.find_free_blocks(hint, 1)
    }

    /// Allocate `count` physically contiguous blocks, preferring group
    /// `hint`. Returns the first block of the run.
    pub(crate) fn find_free_blocks(&self, hint: u32, count: u32) -> FsResult<u32> {
        self.check_writable()?;
        if count == 0 || count > self.geo.blocks_per_group {
            return Err(FileSystemError::InvalidArgument);
        }
        for group in self.group_order(hint) {
            if let Some(block) = self.alloc_blocks_in_group(group, count)? {
                if group != hint {
                    log::debug!("ext2: {} blocks at {} from group {} (hint {})", count, block, group, hint);
                }
                return Ok(block);
            }
        }
        if count == 1 {
            log::warn!("ext2: out of blocks");
        }
        Err(FileSystemError::NoSpace)
    }

    fn alloc_blocks_in_group(&self, group: u32, count: u32) -> FsResult<Option<u32>> {
        let _guard = self.group_locks[group as usize].lock();
        let desc = self.group_desc(group)?;
        if (desc.free_blocks_count as u32) < count {
            return Ok(None);
        }
        let limit = self.geo.blocks_in_group(group) as usize;
        let bitmap = self.disk.reference(desc.block_bitmap)?;
        let Some(bit) = bitmap.read(|bits| find_clear_run(bits, 0, limit, count as usize)) else {
            return Ok(None);
        };
        let first = self.geo.group_first_block(group) + bit as u32;
        for block in first..first + count {
            if self.is_metadata_block(block)? {
                return Err(self.corruption(format_args!(
                    "block bitmap of group {} marks metadata block {} free",
                    group, block
                )));
            }
        }
        bitmap.modify(|bits| (bit..bit + count as usize).for_each(|b| set_bit(bits, b)));
        self.update_group_desc(group, |d| d.free_blocks_count -= count as u16)?;
        self.sb.lock().free_blocks_count -= count;
        Ok(Some(first))
    }

    /// Release `block`. Freeing metadata or a free block is corruption.
    pub(crate) fn free_block(&self, block: u32) -> FsResult<()> {
        self.check_writable()?;
        if self.is_metadata_block(block)? {
            return Err(self.corruption(format_args!("attempt to free metadata block {}", block)));
        }
        let (group, bit) = self.geo.block_group(block);
        let _guard = self.group_locks[group as usize].lock();
        let desc = self.group_desc(group)?;
        let bitmap = self.disk.reference(desc.block_bitmap)?;
        if !bitmap.read(|bits| test_bit(bits, bit as usize)) {
            return Err(self.corruption(format_args!("double free of block {}", block)));
        }
        bitmap.modify(|bits| clear_bit(bits, bit as usize));
        self.update_group_desc(group, |d| d.free_blocks_count += 1)?;
        self.sb.lock().free_blocks_count += 1;
        Ok(())
    }

    /// Boot area, superblock copies, descriptor tables, bitmaps and inode
    /// tables, plus anything outside the volume.
    pub(crate) fn is_metadata_block(&self, block: u32) -> FsResult<bool> {
        if block < self.geo.first_data_block || block >= self.geo.blocks_count {
            return Ok(true);
        }
        let (group, rel) = self.geo.block_group(block);
        if rel < self.geo.super_overhead(group) {
            return Ok(true);
        }
        let desc = self.group_desc(group)?;
        let table = desc.inode_table;
        Ok(block == desc.block_bitmap
            || block == desc.inode_bitmap
            || (table..table + self.geo.inode_table_blocks).contains(&block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext2::tests::{format_and_mount, small_config};
    use crate::fsck;
    use crate::vfs::FileSystemDriver;

    #[test]
    fn clear_run_skips_full_bytes() {
        let bits = [0xFF, 0xFF, 0b0000_0111, 0x00];
        assert_eq!(find_clear_run(&bits, 0, 32, 1), Some(19));
        assert_eq!(find_clear_run(&bits, 0, 32, 13), Some(19));
        assert_eq!(find_clear_run(&bits, 0, 32, 14), None);
        assert_eq!(find_clear_run(&bits, 0, 20, 2), None);
        assert_eq!(find_clear_run(&bits, 25, 32, 1), Some(25));
    }

    #[test]
    fn counters_follow_bitmaps() {
        let fs = format_and_mount(small_config());
        let before = fs.fsstat().unwrap().blocks_available;
        let mut blocks = alloc::vec::Vec::new();
        for _ in 0..40 {
            blocks.push(fs.alloc_block(0).unwrap());
        }
        for b in blocks.iter().step_by(3) {
            fs.free_block(*b).unwrap();
        }
        let run = fs.find_free_blocks(1, 16).unwrap();
        assert_eq!(fs.geo.block_group(run).0, 1);
        let after = fs.fsstat().unwrap().blocks_available;
        assert_eq!(before - after, 40 - 14 + 16);
        let report = fsck::check(&fs).unwrap();
        assert!(report.is_clean(), "{:?}", report.mismatches);
    }

    #[test]
    fn racing_allocations_in_one_group_stay_consistent() {
        let fs = format_and_mount(small_config());
        let free = fs.sb.lock().free_blocks_count;
        let kept: alloc::vec::Vec<u32> = std::thread::scope(|scope| {
            let workers: alloc::vec::Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut mine = alloc::vec::Vec::new();
                        for round in 0..50 {
                            let block = fs.alloc_block(0).unwrap();
                            if round % 2 == 0 {
                                fs.free_block(block).unwrap();
                            } else {
                                mine.push(block);
                            }
                        }
                        mine
                    })
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        let mut unique = kept.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), kept.len());
        assert!(kept.iter().all(|&b| fs.geo.block_group(b).0 == 0));
        assert_eq!({ fs.sb.lock().free_blocks_count }, free - kept.len() as u32);
        let report = fsck::check(&fs).unwrap();
        assert!(report.is_clean(), "{:?}", report.mismatches);
    }

    #[test]
    fn inode_falls_through_to_next_group() {
        let fs = format_and_mount(small_config());
        let per_group = fs.geo.inodes_per_group;
        let free0 = fs.group_desc(0).unwrap().free_inodes_count as u32;
        for _ in 0..free0 {
            let ino = fs.alloc_inode(0, false).unwrap();
            assert!(ino <= per_group);
        }
        assert_eq!({ fs.group_desc(0).unwrap().free_inodes_count }, 0);
        let ino = fs.alloc_inode(0, false).unwrap();
        assert_eq!(fs.geo.inode_group(ino).0, 1);
        assert!(fsck::check(&fs).unwrap().is_clean());
    }

    #[test]
    fn reserved_inodes_are_never_handed_out() {
        let fs = format_and_mount(small_config());
        let ino = fs.alloc_inode(0, false).unwrap();
        assert!(ino > fs.geo.first_ino);
    }

    #[test]
    fn directory_count_tracks_allocations() {
        let fs = format_and_mount(small_config());
        let dirs = fs.group_desc(0).unwrap().used_dirs_count;
        let ino = fs.alloc_inode(0, true).unwrap();
        assert_eq!({ fs.group_desc(0).unwrap().used_dirs_count }, dirs + 1);
        fs.free_inode(ino, true).unwrap();
        assert_eq!({ fs.group_desc(0).unwrap().used_dirs_count }, dirs);
    }

    #[test]
    fn exhausted_volume_reports_no_space() {
        let fs = format_and_mount(small_config());
        while fs.alloc_block(0).is_ok() {}
        assert_eq!(fs.alloc_block(0), Err(FileSystemError::NoSpace));
        assert_eq!(fs.fsstat().unwrap().blocks_available, 0);
    }

    #[test]
    #[should_panic(expected = "double free of block")]
    fn double_block_free_panics() {
        let fs = format_and_mount(small_config());
        let b = fs.alloc_block(0).unwrap();
        fs.free_block(b).unwrap();
        let _ = fs.free_block(b);
    }

    #[test]
    #[should_panic(expected = "double free of inode")]
    fn double_inode_free_panics() {
        let fs = format_and_mount(small_config());
        let ino = fs.alloc_inode(0, false).unwrap();
        fs.free_inode(ino, false).unwrap();
        let _ = fs.free_inode(ino, false);
    }

    #[test]
    #[should_panic(expected = "metadata block")]
    fn freeing_metadata_panics() {
        let fs = format_and_mount(small_config());
        let table = fs.group_desc(0).unwrap().inode_table;
        let _ = fs.free_block(table);
    }
}
