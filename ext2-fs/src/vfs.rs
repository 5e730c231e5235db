use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::cache::RawSlot;
use crate::error::{FileSystemError, FsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    File,
    Directory,
    SymLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u32,
    pub size: u64,
    pub file_type: InodeType,
    /// Permission bits only.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Allocated space in 512-byte units.
    pub blocks: u64,
    pub block_size: u32,
}

/// Volume-wide usage figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStat {
    pub block_size: u32,
    pub inodes_available: u64,
    pub inodes_allocated: u64,
    pub blocks_available: u64,
    pub blocks_allocated: u64,
    /// Referenced slots in the disk block cache.
    pub cache_allocated: u64,
    pub cache_free: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u32,
    pub name: String,
    /// `None` when the volume does not record types in directory entries.
    pub file_type: Option<InodeType>,
}

/// An open inode. It keeps the inode cached until it is handed back to
/// [`FileSystemDriver::close`].
#[must_use = "an open inode must be closed"]
#[derive(Debug, PartialEq, Eq)]
pub struct InodeHandle {
    ino: u32,
    slot: RawSlot,
}

impl InodeHandle {
    pub(crate) fn new(slot: RawSlot) -> Self {
        Self { ino: slot.id(), slot }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub(crate) fn slot(&self) -> &RawSlot {
        &self.slot
    }

    pub(crate) fn into_slot(self) -> RawSlot {
        self.slot
    }
}

/// Operations a mounted filesystem offers to the process layer.
///
/// Paths are absolute within the filesystem. Ownership and permission bits
/// are stored, never enforced.
pub trait FileSystemDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, path: &str) -> FsResult<InodeHandle>;
    fn close(&self, handle: InodeHandle) -> FsResult<()>;
    /// Inode number of `path` if it is currently open.
    fn opened(&self, path: &str) -> Option<u32>;
    fn stat(&self, handle: &InodeHandle) -> FsResult<FileStat>;

    fn create(&self, path: &str, mode: u32, uid: u32, gid: u32) -> FsResult<()>;
    fn unlink(&self, path: &str) -> FsResult<()>;
    fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> FsResult<()>;
    fn rmdir(&self, path: &str) -> FsResult<()>;
    fn link(&self, existing: &str, new_path: &str) -> FsResult<()>;
    fn symlink(&self, target: &str, path: &str, uid: u32, gid: u32) -> FsResult<()>;
    fn readlink(&self, handle: &InodeHandle) -> FsResult<String>;
    fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    fn read(&self, handle: &InodeHandle, buf: &mut [u8], offset: u64) -> FsResult<usize>;
    fn write(&self, handle: &InodeHandle, buf: &[u8], offset: u64) -> FsResult<usize>;
    fn truncate(&self, handle: &InodeHandle, size: u64) -> FsResult<()>;
    fn chown(&self, handle: &InodeHandle, uid: u32, gid: u32) -> FsResult<()>;
    fn chmod(&self, handle: &InodeHandle, mode: u32) -> FsResult<()>;

    /// The `index`-th live entry of a directory.
    fn readdir(&self, handle: &InodeHandle, index: usize) -> FsResult<Option<DirEntry>>;
    /// Up to `count` entries starting at byte position `pos` of the
    /// directory stream, plus the position to continue from.
    fn getdents(&self, handle: &InodeHandle, pos: u64, count: usize) -> FsResult<(Vec<DirEntry>, u64)>;

    fn fsstat(&self) -> FsResult<FsStat>;
    fn sync(&self) -> FsResult<()>;
    fn fsync(&self, handle: &InodeHandle) -> FsResult<()>;
    fn unmount(&self) -> FsResult<()>;
}

/// Mounted filesystems by mount point.
pub struct MountTable {
    mounts: Mutex<BTreeMap<String, Arc<dyn FileSystemDriver>>>,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            mounts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn mount(&self, path: &str, fs: Arc<dyn FileSystemDriver>) -> FsResult<()> {
        let path = canonicalize_path(path);
        let mut mounts = self.mounts.lock();
        if mounts.contains_key(&path) {
            return Err(FileSystemError::AlreadyExists);
        }
        log::info!("vfs: {} mounted at {}", fs.name(), path);
        mounts.insert(path, fs);
        Ok(())
    }

    /// Detach and unmount the filesystem at `path`.
    pub fn unmount(&self, path: &str) -> FsResult<Arc<dyn FileSystemDriver>> {
        let path = canonicalize_path(path);
        let fs = self.mounts.lock().remove(&path).ok_or(FileSystemError::NotFound)?;
        fs.unmount()?;
        log::info!("vfs: unmounted {}", path);
        Ok(fs)
    }

    /// Find the filesystem owning `path` (longest mount point prefix) and
    /// the path inside it.
    pub fn resolve(&self, path: &str) -> FsResult<(Arc<dyn FileSystemDriver>, String)> {
        let path = canonicalize_path(path);
        let mounts = self.mounts.lock();
        let (point, fs) = mounts
            .iter()
            .filter(|(point, _)| is_under(&path, point))
            .max_by_key(|(point, _)| point.len())
            .ok_or(FileSystemError::NotFound)?;
        let inner = match &path[point.len()..] {
            "" => "/".to_string(),
            rest if rest.starts_with('/') => rest.to_string(),
            rest => format!("/{}", rest),
        };
        Ok((fs.clone(), inner))
    }

    pub fn mount_points(&self) -> Vec<String> {
        self.mounts.lock().keys().cloned().collect()
    }
}

fn is_under(path: &str, point: &str) -> bool {
    point == "/"
        || path == point
        || (path.starts_with(point) && path.as_bytes().get(point.len()) == Some(&b'/'))
}

/// Normalize an absolute path, resolving `.` and `..` lexically.
pub fn canonicalize_path(path: &str) -> String {
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            _ => components.push(component),
        }
    }
    if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", components.join("/"))
    }
}

/// Drop empty and `.` components. `..` is kept so that it is resolved
/// through the directory it names, which must exist and be a directory.
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = components(path).collect();
    format!("/{}", parts.join("/"))
}

/// Split into (parent directory, final component). A final `.` or `..`
/// names no new entry and is rejected.
pub fn split_path(path: &str) -> FsResult<(String, String)> {
    if matches!(path.rsplit('/').find(|c| !c.is_empty()), Some(".") | Some("..")) {
        return Err(FileSystemError::InvalidPath);
    }
    let path = normalize_path(path);
    let rest = &path[1..];
    if rest.is_empty() {
        return Err(FileSystemError::InvalidPath);
    }
    match rest.rfind('/') {
        Some(pos) => Ok((format!("/{}", &rest[..pos]), rest[pos + 1..].to_string())),
        None => Ok(("/".to_string(), rest.to_string())),
    }
}

/// Path components in order, skipping empty ones.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}
