//! Inode cache and the logical-to-physical block map.

use alloc::string::String;
use alloc::sync::Arc;
use core::cmp;

use crate::block_cache::BlockCache;
use crate::cache::{Cache, CacheRef, CacheStrategy};
use crate::config::{DIRECT_BLOCKS, DOUBLE_INDIRECT_SLOT, INDIRECT_SLOT, TRIPLE_INDIRECT_SLOT};
use crate::diskio::{DiskIo, spans};
use crate::error::{FileSystemError, FsResult};
use crate::ext2::Ext2FileSystem;
use crate::layout::{DiskInode, GroupDesc, Geometry};

/// A parsed inode as held by the inode cache.
#[derive(Debug, Clone, Default)]
pub struct CachedInode {
    pub ino: u32,
    pub disk: DiskInode,
    /// Path it was opened by, used to find open inodes by name. The inode
    /// number stays authoritative.
    pub path: Option<String>,
}

/// Loads inodes out of the inode tables through the block cache.
pub struct InodeStrategy {
    disk: Arc<BlockCache>,
    geo: Geometry,
}

impl InodeStrategy {
    pub fn new(disk: Arc<BlockCache>, geo: Geometry) -> Self {
        Self { disk, geo }
    }

    /// (block, byte offset) of inode `ino` in its group's inode table.
    fn locate(&self, ino: u32) -> FsResult<(u32, usize)> {
        if ino == 0 || ino > self.geo.inodes_count {
            return Err(FileSystemError::InvalidArgument);
        }
        let (group, index) = self.geo.inode_group(ino);
        let (desc_block, desc_offset) = self.geo.desc_location(group);
        let table = self
            .disk
            .reference(desc_block)?
            .read_at(desc_offset, |d: &GroupDesc| d.inode_table);
        let byte = index as usize * self.geo.inode_size;
        Ok((table + (byte / self.geo.block_size) as u32, byte % self.geo.block_size))
    }
}

impl CacheStrategy for InodeStrategy {
    type Slab = CachedInode;
    type Query = str;

    fn new_slab(&self) -> CachedInode {
        CachedInode::default()
    }

    fn reset(&self, slab: &mut CachedInode) {
        *slab = CachedInode::default();
    }

    fn populate(&self, ino: u32, slab: &mut CachedInode) -> FsResult<()> {
        let (block, offset) = self.locate(ino)?;
        slab.disk = self.disk.reference(block)?.get(offset);
        slab.ino = ino;
        slab.path = None;
        Ok(())
    }

    fn sync(&self, ino: u32, slab: &CachedInode) -> FsResult<()> {
        let (block, offset) = self.locate(ino)?;
        // Only the classic 128 bytes; a larger on-disk inode keeps its tail.
        self.disk.reference(block)?.set(offset, slab.disk);
        Ok(())
    }

    fn query(&self, path: &str, _ino: u32, slab: &CachedInode) -> bool {
        slab.path.as_deref() == Some(path)
    }
}

pub type InodeCache = Cache<InodeStrategy>;
pub type InodeRef<'a> = CacheRef<'a, InodeStrategy>;

/// Where a logical block lives: the slot in `i_block` and the entry index at
/// each indirection level below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockPath {
    slot: usize,
    depth: usize,
    entries: [usize; 3],
}

impl Ext2FileSystem {
    fn block_path(&self, index: u32) -> FsResult<BlockPath> {
        let apb = self.geo.addrs_per_block() as u64;
        let mut rel = index as u64;
        if rel < DIRECT_BLOCKS as u64 {
            return Ok(BlockPath { slot: rel as usize, depth: 0, entries: [0; 3] });
        }
        rel -= DIRECT_BLOCKS as u64;
        if rel < apb {
            return Ok(BlockPath { slot: INDIRECT_SLOT, depth: 1, entries: [rel as usize, 0, 0] });
        }
        rel -= apb;
        if rel < apb * apb {
            return Ok(BlockPath {
                slot: DOUBLE_INDIRECT_SLOT,
                depth: 2,
                entries: [(rel / apb) as usize, (rel % apb) as usize, 0],
            });
        }
        rel -= apb * apb;
        if rel < apb * apb * apb {
            return Ok(BlockPath {
                slot: TRIPLE_INDIRECT_SLOT,
                depth: 3,
                entries: [(rel / (apb * apb)) as usize, (rel / apb % apb) as usize, (rel % apb) as usize],
            });
        }
        Err(FileSystemError::InvalidArgument)
    }

    /// Physical block backing logical block `index`, 0 for a hole.
    pub(crate) fn block_address(&self, inode: &DiskInode, index: u32) -> FsResult<u32> {
        let path = self.block_path(index)?;
        let mut block = inode.block[path.slot];
        for &entry in &path.entries[..path.depth] {
            if block == 0 {
                return Ok(0);
            }
            block = self.disk.reference(block)?.get::<u32>(entry * 4);
        }
        Ok(block)
    }

    /// Map logical block `index` to `value`, allocating (zeroed) indirection
    /// blocks near group `hint` as needed.
    pub(crate) fn set_block_address(&self, inode: &mut DiskInode, index: u32, value: u32, hint: u32) -> FsResult<()> {
        let path = self.block_path(index)?;
        if path.depth == 0 {
            inode.block[path.slot] = value;
            return Ok(());
        }
        let mut block = inode.block[path.slot];
        if block == 0 {
            if value == 0 {
                return Ok(());
            }
            block = self.alloc_indirect(inode, hint)?;
            inode.block[path.slot] = block;
        }
        for level in 0..path.depth {
            let at = path.entries[level] * 4;
            let table = self.disk.reference(block)?;
            if level + 1 == path.depth {
                table.set::<u32>(at, value);
                return Ok(());
            }
            let mut next = table.get::<u32>(at);
            if next == 0 {
                if value == 0 {
                    return Ok(());
                }
                drop(table);
                next = self.alloc_indirect(inode, hint)?;
                self.disk.reference(block)?.set::<u32>(at, next);
            }
            block = next;
        }
        Ok(())
    }

    fn alloc_indirect(&self, inode: &mut DiskInode, hint: u32) -> FsResult<u32> {
        let block = self.alloc_block(hint)?;
        self.disk.add_reference(block)?;
        inode.blocks += self.geo.sectors_per_block();
        Ok(block)
    }

    /// Unmap logical block `index` and free every indirection block that no
    /// longer maps anything. The data block itself is left to the caller.
    fn clear_block_address(&self, inode: &mut DiskInode, index: u32) -> FsResult<()> {
        let path = self.block_path(index)?;
        if path.depth == 0 {
            inode.block[path.slot] = 0;
            return Ok(());
        }
        let mut chain = [0u32; 3];
        chain[0] = inode.block[path.slot];
        for level in 0..path.depth {
            if chain[level] == 0 {
                return Ok(());
            }
            if level + 1 < path.depth {
                chain[level + 1] = self.disk.reference(chain[level])?.get::<u32>(path.entries[level] * 4);
            }
        }
        for level in (0..path.depth).rev() {
            let table = self.disk.reference(chain[level])?;
            table.set::<u32>(path.entries[level] * 4, 0);
            let empty = table.read(|data| data.iter().all(|&b| b == 0));
            drop(table);
            if !empty {
                return Ok(());
            }
            self.free_block(chain[level])?;
            inode.blocks -= self.geo.sectors_per_block();
            if level == 0 {
                inode.block[path.slot] = 0;
            }
        }
        Ok(())
    }

    /// Allocate a zeroed data block for logical block `index`.
    pub(crate) fn map_new_block(&self, inode: &mut DiskInode, index: u32, hint: u32) -> FsResult<u32> {
        let block = self.alloc_block(hint)?;
        if let Err(e) = self.set_block_address(inode, index, block, hint) {
            self.free_block(block)?;
            return Err(e);
        }
        self.disk.add_reference(block)?;
        inode.blocks += self.geo.sectors_per_block();
        Ok(block)
    }

    pub(crate) fn inode_group_hint(&self, ino: u32) -> u32 {
        self.geo.inode_group(ino).0
    }

    pub(crate) fn max_file_size(&self) -> u64 {
        self.geo.max_file_blocks() * self.geo.block_size as u64
    }

    /// Read from file bytes `[offset, offset + dst.len())`, clamped to the
    /// file size. Holes read as zeros.
    pub(crate) fn read_data(&self, inode: &DiskInode, dst: &mut [u8], offset: u64) -> FsResult<usize> {
        let size = inode.size();
        if offset >= size {
            return Ok(0);
        }
        let len = cmp::min(dst.len() as u64, size - offset) as usize;
        let io = DiskIo::new(&self.disk);
        for span in spans(offset, len, self.geo.block_size) {
            let block = self.block_address(inode, span.index as u32)?;
            let out = &mut dst[span.done..span.done + span.len];
            if block == 0 {
                out.fill(0);
            } else {
                io.read_in_block(block, span.in_block, out)?;
            }
        }
        Ok(len)
    }

    /// Write `src` at `offset`, growing the file as needed. Writes spanning
    /// at least `contiguous_write_threshold` blocks are first moved onto one
    /// freshly allocated contiguous run.
    pub(crate) fn write_data(&self, inode: &mut DiskInode, ino: u32, src: &[u8], offset: u64) -> FsResult<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(src.len() as u64)
            .filter(|&end| end <= self.max_file_size())
            .ok_or(FileSystemError::NoSpace)?;
        let bs = self.geo.block_size as u64;
        let hint = self.inode_group_hint(ino);
        let first = (offset / bs) as u32;
        let last = ((end - 1) / bs) as u32;
        let count = last - first + 1;

        let threshold = self.config.contiguous_write_threshold as u32;
        if threshold > 0 && count >= threshold {
            match self.relocate_to_run(inode, hint, first, count, offset, end) {
                Ok(()) => {}
                Err(FileSystemError::NoSpace) | Err(FileSystemError::InvalidArgument) => {
                    log::debug!("ext2: inode {}: no contiguous run of {} blocks", ino, count);
                }
                Err(e) => return Err(e),
            }
        }

        let io = DiskIo::new(&self.disk);
        for span in spans(offset, src.len(), self.geo.block_size) {
            let index = span.index as u32;
            let mut block = self.block_address(inode, index)?;
            if block == 0 {
                block = self.map_new_block(inode, index, hint)?;
            }
            io.write_in_block(block, span.in_block, &src[span.done..span.done + span.len])?;
        }
        if end > inode.size() {
            inode.set_size(end);
        }
        Ok(src.len())
    }

    /// Point logical blocks `first..first + count` at a new contiguous run.
    /// Old content that the write will not overwrite is carried over and the
    /// old blocks are freed.
    fn relocate_to_run(&self, inode: &mut DiskInode, hint: u32, first: u32, count: u32, offset: u64, end: u64) -> FsResult<()> {
        let bs = self.geo.block_size as u64;
        let run = self.find_free_blocks(hint, count)?;
        for i in 0..count {
            let index = first + i;
            let fresh = run + i;
            let old = self.block_address(inode, index)?;
            let block_start = index as u64 * bs;
            let partial = offset > block_start || end < block_start + bs;
            let target = self.disk.add_reference(fresh)?;
            if old != 0 && partial {
                let source = self.disk.reference(old)?;
                source.read(|from| target.modify(|to| to.copy_from_slice(from)));
            }
            drop(target);
            if let Err(e) = self.set_block_address(inode, index, fresh, hint) {
                // Hand back the part of the run that was never mapped.
                for unused in fresh..run + count {
                    self.free_block(unused)?;
                }
                return Err(e);
            }
            if old != 0 {
                self.free_block(old)?;
            } else {
                inode.blocks += self.geo.sectors_per_block();
            }
        }
        Ok(())
    }

    /// Shrink (or sparsely grow) the file to `new_size`. Blocks past the new
    /// end are freed from the back, then the size is updated.
    pub(crate) fn truncate_data(&self, inode: &mut DiskInode, new_size: u64) -> FsResult<()> {
        if new_size > self.max_file_size() {
            return Err(FileSystemError::NoSpace);
        }
        let bs = self.geo.block_size as u64;
        let old_size = inode.size();
        let keep = new_size.div_ceil(bs) as u32;
        let had = old_size.div_ceil(bs) as u32;
        for index in (keep..had).rev() {
            let block = self.block_address(inode, index)?;
            if block == 0 {
                continue;
            }
            self.clear_block_address(inode, index)?;
            self.free_block(block)?;
            inode.blocks -= self.geo.sectors_per_block();
        }
        // Zero the tail of the new last block so a later extension reads zeros.
        let tail = (new_size % bs) as usize;
        if tail != 0 && new_size < old_size {
            let block = self.block_address(inode, (new_size / bs) as u32)?;
            if block != 0 {
                self.disk.reference(block)?.modify(|data| data[tail..].fill(0));
            }
        }
        inode.set_size(new_size);
        Ok(())
    }

    /// Free every block of `inode`, data and indirection alike.
    pub(crate) fn release_all_blocks(&self, inode: &mut DiskInode) -> FsResult<()> {
        self.truncate_data(inode, 0)?;
        // Blocks beyond the recorded size (a corrupt or sparse tail) are
        // reclaimed too, walking the pointer tree directly.
        let ptrs = inode.block;
        for (slot, depth) in [(INDIRECT_SLOT, 1), (DOUBLE_INDIRECT_SLOT, 2), (TRIPLE_INDIRECT_SLOT, 3)] {
            if ptrs[slot] != 0 {
                self.free_tree(ptrs[slot], depth)?;
                inode.block[slot] = 0;
            }
        }
        for slot in 0..DIRECT_BLOCKS {
            if ptrs[slot] != 0 {
                self.free_block(ptrs[slot])?;
                inode.block[slot] = 0;
            }
        }
        inode.blocks = 0;
        Ok(())
    }

    fn free_tree(&self, block: u32, depth: usize) -> FsResult<()> {
        let entries = self.geo.addrs_per_block() as usize;
        for i in 0..entries {
            let child = self.disk.reference(block)?.get::<u32>(i * 4);
            if child == 0 {
                continue;
            }
            if depth > 1 {
                self.free_tree(child, depth - 1)?;
            } else {
                self.free_block(child)?;
            }
        }
        self.free_block(block)
    }
}
