//! The mounted volume: superblock mirror, caches and the driver operations.
//!
//! Locking, outermost first: the namespace lock (for operations that change
//! directory entries), one inode slot, a group lock, the superblock mirror.
//! Code running inside an inode slot's `read`/`modify` closure may use the
//! disk cache and the allocator but never the inode cache.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::block_cache::{self, BlockCache, bytes_of_mut, zeroed};
use crate::block_dev::BlockDevice;
use crate::cache::Cache;
use crate::config::{BLOCK_POINTERS, FAST_SYMLINK_MAX, MAX_NAME_LEN, MountConfig, ROOT_INO, SECTOR_SIZE, SUPERBLOCK_OFFSET};
use crate::diskio::DiskIo;
use crate::error::{FileSystemError, FsResult};
use crate::fsck::{self, FsckReport};
use crate::inode::{InodeCache, InodeRef, InodeStrategy};
use crate::layout::{
    DiskInode, ErrorPolicy, Geometry, GroupDesc, Permissions, STATE_ERROR, STATE_VALID, SuperBlock, mode_type,
};
use crate::time::TimeSource;
use crate::vfs::{self, DirEntry, FileStat, FileSystemDriver, FsStat, InodeHandle, InodeType};

pub struct Ext2FileSystem {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) disk: Arc<BlockCache>,
    pub(crate) inodes: InodeCache,
    pub(crate) geo: Geometry,
    /// In-memory superblock. Written back by `sync`.
    pub(crate) sb: Mutex<SuperBlock>,
    pub(crate) group_locks: Vec<Mutex<()>>,
    /// Serializes every operation that adds or removes directory entries.
    pub(crate) namespace: Mutex<()>,
    pub(crate) error_policy: ErrorPolicy,
    pub(crate) read_only: AtomicBool,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) config: MountConfig,
}

impl fmt::Debug for Ext2FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ext2FileSystem")
            .field("block_size", &self.geo.block_size)
            .field("groups", &self.geo.group_count)
            .field("read_only", &self.read_only.load(Ordering::Relaxed))
            .finish()
    }
}

impl Ext2FileSystem {
    /// Mount the volume on `device`.
    pub fn mount(device: Arc<dyn BlockDevice>, config: MountConfig, clock: Arc<dyn TimeSource>) -> FsResult<Arc<Self>> {
        if device.block_size() != SECTOR_SIZE {
            return Err(FileSystemError::InvalidFileSystem);
        }
        let mut sb: SuperBlock = zeroed();
        device.read_blocks((SUPERBLOCK_OFFSET / SECTOR_SIZE as u64) as u32, bytes_of_mut(&mut sb))?;
        sb.validate()?;

        let geo = Geometry::new(&sb);
        let device_bytes = device.num_blocks() as u64 * SECTOR_SIZE as u64;
        if (geo.blocks_count as u64) * (geo.block_size as u64) > device_bytes {
            log::warn!("ext2: volume is larger than its device ({} bytes)", device_bytes);
            return Err(FileSystemError::InvalidFileSystem);
        }

        let mut read_only = config.read_only;
        if !read_only && !sb.writable() {
            log::warn!("ext2: unsupported read-only features {:#x}, mounting read-only", { sb.feature_ro_compat });
            read_only = true;
        }
        if sb.state & STATE_VALID == 0 || sb.state & STATE_ERROR != 0 {
            log::warn!("ext2: volume was not cleanly unmounted or has errors, run fsck");
        }

        let disk = Arc::new(block_cache::block_cache(
            device.clone(),
            geo.block_size,
            config.disk_cache_slots,
        )?);
        let inodes = Cache::new(
            "inode",
            config.inode_cache_slots,
            InodeStrategy::new(disk.clone(), geo),
        )?;

        let fs = Arc::new(Self {
            device,
            disk,
            inodes,
            geo,
            error_policy: sb.error_policy(),
            sb: Mutex::new(sb),
            group_locks: (0..geo.group_count).map(|_| Mutex::new(())).collect(),
            namespace: Mutex::new(()),
            read_only: AtomicBool::new(read_only),
            clock,
            config,
        });

        if !read_only {
            let now = fs.now();
            {
                let mut sb = fs.sb.lock();
                sb.mnt_count = sb.mnt_count.wrapping_add(1);
                sb.mtime = now;
                // Cleared until a clean unmount sets it again.
                sb.state &= !STATE_VALID;
            }
            fs.write_super()?;
            fs.disk.sync_all()?;
        }

        let sb = *fs.sb.lock();
        log::info!(
            "ext2: mounted rev {} volume {:?}: {} blocks of {} bytes, {} inodes, {} groups{}",
            { sb.rev_level },
            String::from_utf8_lossy(sb.volume_name()),
            geo.blocks_count,
            geo.block_size,
            geo.inodes_count,
            geo.group_count,
            if read_only { " (read-only)" } else { "" }
        );
        log::debug!(
            "ext2: {} free blocks, {} free inodes, mount count {}",
            { sb.free_blocks_count },
            { sb.free_inodes_count },
            { sb.mnt_count }
        );
        Ok(fs)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Copy of the in-memory superblock.
    pub fn superblock(&self) -> SuperBlock {
        *self.sb.lock()
    }

    /// Run the consistency checker against the current state.
    pub fn fsck(&self) -> FsResult<FsckReport> {
        fsck::check(self)
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now()
    }

    pub(crate) fn check_writable(&self) -> FsResult<()> {
        if self.is_read_only() {
            Err(FileSystemError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub(crate) fn group_desc(&self, group: u32) -> FsResult<GroupDesc> {
        if group >= self.geo.group_count {
            return Err(FileSystemError::InvalidArgument);
        }
        let (block, offset) = self.geo.desc_location(group);
        Ok(self.disk.reference(block)?.get(offset))
    }

    pub(crate) fn update_group_desc(&self, group: u32, f: impl FnOnce(&mut GroupDesc)) -> FsResult<()> {
        if group >= self.geo.group_count {
            return Err(FileSystemError::InvalidArgument);
        }
        let (block, offset) = self.geo.desc_location(group);
        self.disk.reference(block)?.modify_at(offset, f);
        Ok(())
    }

    /// Report on-disk corruption and apply the volume's error policy. The
    /// returned error is what the caller should propagate.
    pub(crate) fn corruption(&self, what: fmt::Arguments) -> FileSystemError {
        log::error!("ext2: corruption detected: {}", what);
        self.sb.lock().state |= STATE_ERROR;
        match self.error_policy {
            ErrorPolicy::Panic => panic!("ext2 filesystem corrupt: {}", what),
            ErrorPolicy::RemountReadOnly => {
                if !self.read_only.swap(true, Ordering::AcqRel) {
                    // Record the error state before writes stop.
                    if let Err(e) = self.write_super().and_then(|_| self.disk.sync_all()) {
                        log::error!("ext2: could not record error state: {}", e);
                    }
                    log::warn!("ext2: remounted read-only");
                }
                FileSystemError::Corrupted
            }
            ErrorPolicy::Continue => FileSystemError::Corrupted,
        }
    }

    /// Copy the superblock mirror into its cached disk block.
    pub(crate) fn write_super(&self) -> FsResult<()> {
        let sb = *self.sb.lock();
        DiskIo::new(&self.disk).write_pod(&sb, SUPERBLOCK_OFFSET)
    }

    pub(crate) fn load_inode(&self, ino: u32) -> FsResult<DiskInode> {
        Ok(self.inodes.reference(ino)?.read(|c| c.disk))
    }

    fn handle_ref(&self, handle: &InodeHandle) -> FsResult<InodeRef<'_>> {
        self.inodes.reference_raw(handle.slot())
    }

    /// Parent directory reference and final component of `path`.
    fn parent_of(&self, path: &str) -> FsResult<(u32, InodeRef<'_>, String)> {
        let (parent, name) = vfs::split_path(path)?;
        if name.len() > MAX_NAME_LEN {
            return Err(FileSystemError::NameTooLong);
        }
        let ino = self.lookup_path(&parent)?;
        let dir = self.inodes.reference(ino)?;
        if !dir.read(|c| c.disk.is_dir()) {
            return Err(FileSystemError::NotDirectory);
        }
        Ok((ino, dir, name))
    }

    /// Allocate and link a new inode at `path`. `init` fills in the content
    /// of the new inode given its number and its parent's.
    fn make_node(
        &self,
        path: &str,
        kind: InodeType,
        mode: u32,
        uid: u32,
        gid: u32,
        init: impl FnOnce(&mut DiskInode, u32, u32) -> FsResult<()>,
    ) -> FsResult<u32> {
        self.check_writable()?;
        let (parent_ino, parent, name) = self.parent_of(path)?;
        if parent.read(|c| c.disk.links_count) == 0 {
            return Err(FileSystemError::NotFound);
        }
        if parent.read(|c| self.find_dirent(&c.disk, name.as_bytes()))?.is_some() {
            return Err(FileSystemError::AlreadyExists);
        }

        let is_dir = kind == InodeType::Directory;
        let ino = self.alloc_inode(self.inode_group_hint(parent_ino), is_dir)?;
        let now = self.now();
        let child = match self.inodes.add_reference(ino) {
            Ok(child) => child,
            Err(e) => {
                self.free_inode(ino, is_dir)?;
                return Err(e);
            }
        };
        let os = self.geo.creator_os;
        let built = child.modify(|c| {
            c.ino = ino;
            c.disk = DiskInode {
                mode: mode_type(kind) | (mode & 0o7777) as u16,
                links_count: if is_dir { 2 } else { 1 },
                atime: now,
                ctime: now,
                mtime: now,
                ..DiskInode::default()
            };
            c.disk.set_owner(os, uid, gid);
            init(&mut c.disk, ino, parent_ino)
        });
        let linked = built.and_then(|_| {
            parent.modify(|p| -> FsResult<()> {
                self.alloc_dirent(&mut p.disk, parent_ino, ino, name.as_bytes(), kind)?;
                if is_dir {
                    p.disk.links_count += 1;
                }
                p.disk.mtime = now;
                p.disk.ctime = now;
                Ok(())
            })
        });
        if let Err(e) = linked {
            log::debug!("ext2: creating {} failed: {}", path, e);
            self.reclaim(&child)?;
            return Err(e);
        }
        log::debug!("ext2: created {:?} {} as inode {}", kind, path, ino);
        Ok(ino)
    }

    /// Free the blocks and the inode behind `node`, whose link count is
    /// already zero. The slot is dropped from the cache on its last release.
    fn reclaim(&self, node: &InodeRef<'_>) -> FsResult<()> {
        let now = self.now();
        let (ino, was_dir) = node.modify(|c| -> FsResult<(u32, bool)> {
            if is_fast_symlink(&c.disk) {
                c.disk.block = [0; BLOCK_POINTERS];
                c.disk.set_size(0);
            } else {
                self.release_all_blocks(&mut c.disk)?;
            }
            c.disk.links_count = 0;
            c.disk.dtime = now;
            c.path = None;
            Ok((c.ino, c.disk.is_dir()))
        })?;
        self.free_inode(ino, was_dir)?;
        node.set_clobber();
        log::debug!("ext2: inode {} reclaimed", ino);
        Ok(())
    }

    /// Drop one link of `node`. At zero the inode is reclaimed now, or on
    /// its last close if it is still open.
    fn drop_link(&self, node: &InodeRef<'_>, links: u16) -> FsResult<()> {
        let now = self.now();
        let left = node.modify(|c| {
            c.disk.links_count = c.disk.links_count.saturating_sub(links);
            c.disk.ctime = now;
            if c.disk.links_count == 0 {
                c.path = None;
            }
            c.disk.links_count
        });
        if left > 0 {
            return Ok(());
        }
        // Our own reference is one of them.
        if node.count_refs() > 1 {
            log::debug!("ext2: inode {} orphaned until closed", node.id());
            return Ok(());
        }
        self.reclaim(node)
    }

    fn unlink_entry(&self, path: &str, want_dir: bool) -> FsResult<()> {
        self.check_writable()?;
        let (parent_ino, parent, name) = self.parent_of(path)?;
        let hit = parent
            .read(|c| self.find_dirent(&c.disk, name.as_bytes()))?
            .ok_or(FileSystemError::NotFound)?;
        if hit.ino == parent_ino {
            return Err(FileSystemError::InvalidArgument);
        }
        let child = self.inodes.reference(hit.ino)?;
        let is_dir = child.read(|c| c.disk.is_dir());
        match (want_dir, is_dir) {
            (false, true) => return Err(FileSystemError::IsDirectory),
            (true, false) => return Err(FileSystemError::NotDirectory),
            (true, true) => {
                if !child.read(|c| self.dir_is_empty(&c.disk))? {
                    return Err(FileSystemError::DirectoryNotEmpty);
                }
            }
            (false, false) => {}
        }

        let now = self.now();
        parent.modify(|p| -> FsResult<()> {
            self.free_dirent(&mut p.disk, name.as_bytes())?;
            if is_dir {
                p.disk.links_count = p.disk.links_count.saturating_sub(1);
            }
            p.disk.mtime = now;
            p.disk.ctime = now;
            Ok(())
        })?;
        // A directory loses its entry and its own `.`.
        self.drop_link(&child, if is_dir { 2 } else { 1 })?;
        log::debug!("ext2: removed {} (inode {})", path, hit.ino);
        Ok(())
    }

    fn rename_locked(&self, from: &str, to: &str) -> FsResult<()> {
        self.check_writable()?;
        let from = vfs::normalize_path(from);
        let to = vfs::normalize_path(to);
        if from == to {
            return Ok(());
        }
        let (src_parent_ino, src_parent, src_name) = self.parent_of(&from)?;
        let (dst_parent_ino, dst_parent, dst_name) = self.parent_of(&to)?;
        let src_hit = src_parent
            .read(|c| self.find_dirent(&c.disk, src_name.as_bytes()))?
            .ok_or(FileSystemError::NotFound)?;
        let moved = self.inodes.reference(src_hit.ino)?;
        let kind = moved.read(|c| c.disk.kind());
        let is_dir = kind == InodeType::Directory;
        if is_dir && self.is_ancestor(src_hit.ino, dst_parent_ino)? {
            // A directory cannot move below itself.
            return Err(FileSystemError::InvalidArgument);
        }
        let now = self.now();

        let replaced = dst_parent.read(|c| self.find_dirent(&c.disk, dst_name.as_bytes()))?;
        let victim = match replaced {
            Some(hit) if hit.ino == src_hit.ino => return Ok(()),
            Some(hit) => {
                let victim = self.inodes.reference(hit.ino)?;
                let victim_dir = victim.read(|c| c.disk.is_dir());
                match (is_dir, victim_dir) {
                    (true, false) => return Err(FileSystemError::NotDirectory),
                    (false, true) => return Err(FileSystemError::IsDirectory),
                    (true, true) => {
                        if !victim.read(|c| self.dir_is_empty(&c.disk))? {
                            return Err(FileSystemError::DirectoryNotEmpty);
                        }
                    }
                    (false, false) => {}
                }
                Some(victim)
            }
            None => None,
        };

        // New name first, then drop the old one.
        dst_parent.modify(|p| -> FsResult<()> {
            if victim.is_some() {
                self.set_dirent(&p.disk, dst_name.as_bytes(), src_hit.ino, kind)?;
            } else {
                self.alloc_dirent(&mut p.disk, dst_parent_ino, src_hit.ino, dst_name.as_bytes(), kind)?;
            }
            p.disk.mtime = now;
            p.disk.ctime = now;
            Ok(())
        })?;
        src_parent.modify(|p| -> FsResult<()> {
            self.free_dirent(&mut p.disk, src_name.as_bytes())?;
            p.disk.mtime = now;
            p.disk.ctime = now;
            Ok(())
        })?;

        if let Some(victim) = victim {
            let victim_dir = victim.read(|c| c.disk.is_dir());
            if victim_dir {
                dst_parent.modify(|p| p.disk.links_count = p.disk.links_count.saturating_sub(1));
            }
            self.drop_link(&victim, if victim_dir { 2 } else { 1 })?;
        }

        if is_dir && src_parent_ino != dst_parent_ino {
            moved.read(|c| self.set_dirent(&c.disk, b"..", dst_parent_ino, InodeType::Directory))?;
            src_parent.modify(|p| p.disk.links_count = p.disk.links_count.saturating_sub(1));
            dst_parent.modify(|p| p.disk.links_count += 1);
        }
        moved.modify(|c| c.disk.ctime = now);
        moved.modify_untracked(|c| {
            if c.path.is_some() {
                c.path = Some(to.clone());
            }
        });
        log::debug!("ext2: renamed {} to {}", from, to);
        Ok(())
    }

    /// Whether `dir` is `ino` or one of its ancestors, walking `..` up to
    /// the root.
    fn is_ancestor(&self, dir: u32, mut ino: u32) -> FsResult<bool> {
        loop {
            if ino == dir {
                return Ok(true);
            }
            if ino == ROOT_INO {
                return Ok(false);
            }
            let inode = self.load_inode(ino)?;
            ino = match self.find_dirent(&inode, b"..")? {
                Some(hit) => hit.ino,
                None => return Err(self.corruption(format_args!("directory {} has no parent entry", ino))),
            };
        }
    }

    fn flush(&self) -> FsResult<()> {
        self.inodes.sync_all()?;
        if !self.is_read_only() {
            self.sb.lock().wtime = self.now();
            self.write_super()?;
        }
        self.disk.sync_all()?;
        self.device.sync()?;
        Ok(())
    }
}

fn is_fast_symlink(inode: &DiskInode) -> bool {
    inode.kind() == InodeType::SymLink && inode.blocks == 0 && (inode.size() as usize) < FAST_SYMLINK_MAX
}

fn check_data_node(inode: &DiskInode) -> FsResult<()> {
    match inode.kind() {
        InodeType::Directory => Err(FileSystemError::IsDirectory),
        InodeType::SymLink => Err(FileSystemError::InvalidArgument),
        _ => Ok(()),
    }
}

impl FileSystemDriver for Ext2FileSystem {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn open(&self, path: &str) -> FsResult<InodeHandle> {
        let path = vfs::normalize_path(path);
        let _ns = self.namespace.lock();
        let ino = self.lookup_path(&path)?;
        let node = self.inodes.reference(ino)?;
        if node.read(|c| c.path.as_deref() != Some(path.as_str())) {
            node.modify_untracked(|c| c.path = Some(path.clone()));
        }
        Ok(InodeHandle::new(node.into_raw()))
    }

    fn close(&self, handle: InodeHandle) -> FsResult<()> {
        let slot = handle.into_slot();
        let unlinked = self.inodes.reference_raw(&slot)?.read(|c| c.disk.links_count == 0);
        if !unlinked {
            self.inodes.release_raw(slot)?;
            return Ok(());
        }
        let _ns = self.namespace.lock();
        let node = self.inodes.reference_raw(&slot)?;
        self.inodes.release_raw(slot)?;
        if node.count_refs() > 1 || self.is_read_only() {
            return Ok(());
        }
        self.reclaim(&node)
    }

    fn opened(&self, path: &str) -> Option<u32> {
        let path = vfs::normalize_path(path);
        let _ns = self.namespace.lock();
        let ino = self.inodes.query(path.as_str())?.id();
        // Renames above the inode leave its remembered path stale.
        match self.lookup_path(&path) {
            Ok(found) if found == ino => Some(ino),
            _ => None,
        }
    }

    fn stat(&self, handle: &InodeHandle) -> FsResult<FileStat> {
        let inode = self.handle_ref(handle)?.read(|c| c.disk);
        let (uid, gid) = inode.owner(self.geo.creator_os);
        Ok(FileStat {
            ino: handle.ino(),
            size: inode.size(),
            file_type: inode.kind(),
            mode: inode.permissions().bits() as u32,
            nlink: inode.links_count as u32,
            uid,
            gid,
            atime: inode.atime as u64,
            mtime: inode.mtime as u64,
            ctime: inode.ctime as u64,
            blocks: inode.blocks as u64,
            block_size: self.geo.block_size as u32,
        })
    }

    fn create(&self, path: &str, mode: u32, uid: u32, gid: u32) -> FsResult<()> {
        let _ns = self.namespace.lock();
        self.make_node(path, InodeType::File, mode, uid, gid, |_, _, _| Ok(()))
            .map(|_| ())
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        let _ns = self.namespace.lock();
        self.unlink_entry(path, false)
    }

    fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> FsResult<()> {
        let _ns = self.namespace.lock();
        self.make_node(path, InodeType::Directory, mode, uid, gid, |inode, ino, parent| {
            self.init_dir(inode, ino, parent)
        })
        .map(|_| ())
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        let _ns = self.namespace.lock();
        self.unlink_entry(path, true)
    }

    fn link(&self, existing: &str, new_path: &str) -> FsResult<()> {
        let _ns = self.namespace.lock();
        self.check_writable()?;
        let ino = self.lookup_path(&vfs::normalize_path(existing))?;
        let target = self.inodes.reference(ino)?;
        let (kind, links) = target.read(|c| (c.disk.kind(), c.disk.links_count));
        if kind == InodeType::Directory {
            return Err(FileSystemError::IsDirectory);
        }
        if links == u16::MAX {
            return Err(FileSystemError::InvalidArgument);
        }
        let (parent_ino, parent, name) = self.parent_of(new_path)?;
        if parent.read(|c| self.find_dirent(&c.disk, name.as_bytes()))?.is_some() {
            return Err(FileSystemError::AlreadyExists);
        }
        let now = self.now();
        parent.modify(|p| -> FsResult<()> {
            self.alloc_dirent(&mut p.disk, parent_ino, ino, name.as_bytes(), kind)?;
            p.disk.mtime = now;
            p.disk.ctime = now;
            Ok(())
        })?;
        target.modify(|c| {
            c.disk.links_count += 1;
            c.disk.ctime = now;
        });
        Ok(())
    }

    fn symlink(&self, target: &str, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        if target.is_empty() {
            return Err(FileSystemError::InvalidArgument);
        }
        if target.len() > self.geo.block_size {
            return Err(FileSystemError::NameTooLong);
        }
        let _ns = self.namespace.lock();
        self.make_node(path, InodeType::SymLink, 0o777, uid, gid, |inode, ino, _| {
            let bytes = target.as_bytes();
            if bytes.len() < FAST_SYMLINK_MAX {
                let mut raw = [0u8; FAST_SYMLINK_MAX];
                raw[..bytes.len()].copy_from_slice(bytes);
                for (i, word) in raw.chunks_exact(4).enumerate() {
                    inode.block[i] = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                }
                inode.set_size(bytes.len() as u64);
                Ok(())
            } else {
                self.write_data(inode, ino, bytes, 0).map(|_| ())
            }
        })
        .map(|_| ())
    }

    fn readlink(&self, handle: &InodeHandle) -> FsResult<String> {
        let inode = self.handle_ref(handle)?.read(|c| c.disk);
        if inode.kind() != InodeType::SymLink {
            return Err(FileSystemError::InvalidArgument);
        }
        let len = inode.size() as usize;
        let mut target = alloc::vec![0u8; len];
        if is_fast_symlink(&inode) {
            let words = { inode.block };
            let raw: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            target.copy_from_slice(&raw[..len]);
        } else {
            self.read_data(&inode, &mut target, 0)?;
        }
        Ok(String::from_utf8_lossy(&target).into_owned())
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let _ns = self.namespace.lock();
        self.rename_locked(from, to)
    }

    fn read(&self, handle: &InodeHandle, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let node = self.handle_ref(handle)?;
        let n = node.read(|c| -> FsResult<usize> {
            if c.disk.is_dir() {
                return Err(FileSystemError::IsDirectory);
            }
            self.read_data(&c.disk, buf, offset)
        })?;
        if n > 0 && !self.is_read_only() {
            let now = self.now();
            node.modify(|c| c.disk.atime = now);
        }
        Ok(n)
    }

    fn write(&self, handle: &InodeHandle, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.check_writable()?;
        let now = self.now();
        self.handle_ref(handle)?.modify(|c| -> FsResult<usize> {
            check_data_node(&c.disk)?;
            let n = self.write_data(&mut c.disk, c.ino, buf, offset)?;
            c.disk.mtime = now;
            c.disk.ctime = now;
            Ok(n)
        })
    }

    fn truncate(&self, handle: &InodeHandle, size: u64) -> FsResult<()> {
        self.check_writable()?;
        let now = self.now();
        self.handle_ref(handle)?.modify(|c| -> FsResult<()> {
            check_data_node(&c.disk)?;
            self.truncate_data(&mut c.disk, size)?;
            c.disk.mtime = now;
            c.disk.ctime = now;
            Ok(())
        })
    }

    fn chown(&self, handle: &InodeHandle, uid: u32, gid: u32) -> FsResult<()> {
        self.check_writable()?;
        let now = self.now();
        let os = self.geo.creator_os;
        self.handle_ref(handle)?.modify(|c| {
            c.disk.set_owner(os, uid, gid);
            c.disk.ctime = now;
        });
        Ok(())
    }

    fn chmod(&self, handle: &InodeHandle, mode: u32) -> FsResult<()> {
        self.check_writable()?;
        let now = self.now();
        self.handle_ref(handle)?.modify(|c| {
            c.disk.set_permissions(Permissions::from_bits_truncate(mode as u16));
            c.disk.ctime = now;
        });
        Ok(())
    }

    fn readdir(&self, handle: &InodeHandle, index: usize) -> FsResult<Option<DirEntry>> {
        self.handle_ref(handle)?.read(|c| {
            if !c.disk.is_dir() {
                return Err(FileSystemError::NotDirectory);
            }
            self.nth_dirent(&c.disk, index)
        })
    }

    fn getdents(&self, handle: &InodeHandle, pos: u64, count: usize) -> FsResult<(Vec<DirEntry>, u64)> {
        self.handle_ref(handle)?.read(|c| self.list_dir(&c.disk, pos, count))
    }

    fn fsstat(&self) -> FsResult<FsStat> {
        let sb = *self.sb.lock();
        let cache = self.disk.stats();
        Ok(FsStat {
            block_size: self.geo.block_size as u32,
            inodes_available: sb.free_inodes_count as u64,
            inodes_allocated: (sb.inodes_count - sb.free_inodes_count) as u64,
            blocks_available: sb.free_blocks_count as u64,
            blocks_allocated: (sb.blocks_count - sb.free_blocks_count) as u64,
            cache_allocated: cache.allocated as u64,
            cache_free: (cache.stale + cache.unused) as u64,
        })
    }

    fn sync(&self) -> FsResult<()> {
        self.flush()
    }

    fn fsync(&self, handle: &InodeHandle) -> FsResult<()> {
        self.handle_ref(handle)?.sync()?;
        self.disk.sync_all()?;
        self.device.sync()?;
        Ok(())
    }

    fn unmount(&self) -> FsResult<()> {
        let busy = self.inodes.stats().allocated;
        if busy > 0 {
            log::warn!("ext2: unmounting with {} inodes still open", busy);
        }
        if !self.is_read_only() {
            let mut sb = self.sb.lock();
            if sb.state & STATE_ERROR == 0 {
                sb.state |= STATE_VALID;
            }
        }
        self.flush()?;
        self.inodes.clean()?;
        self.disk.clean()?;
        self.disk.dump();
        log::info!("ext2: unmounted");
        Ok(())
    }
}
