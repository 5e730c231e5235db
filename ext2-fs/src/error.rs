use core::fmt;

/// 块设备错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    InvalidBlock,
    IoError,
    DeviceError,
    NotSupported,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BlockError::InvalidBlock => "block address out of range",
            BlockError::IoError => "device I/O error",
            BlockError::DeviceError => "device failure",
            BlockError::NotSupported => "operation not supported by device",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemError {
    NotFound,
    AlreadyExists,
    NotDirectory,
    IsDirectory,
    DirectoryNotEmpty,
    InvalidPath,
    NameTooLong,
    InvalidArgument,
    /// No free data block left anywhere on the volume.
    NoSpace,
    /// No free inode left anywhere on the volume.
    NoInodes,
    /// Every cache slot is referenced; nothing can be evicted.
    CacheExhausted,
    IoError,
    InvalidFileSystem,
    Corrupted,
    ReadOnly,
    Unsupported,
}

impl FileSystemError {
    /// Capacity errors are retryable once something is released, unlike
    /// device or structural errors.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            FileSystemError::NoSpace | FileSystemError::NoInodes | FileSystemError::CacheExhausted
        )
    }
}

impl From<BlockError> for FileSystemError {
    fn from(_: BlockError) -> Self {
        FileSystemError::IoError
    }
}

impl fmt::Display for FileSystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FileSystemError::NotFound => "no such file or directory",
            FileSystemError::AlreadyExists => "file exists",
            FileSystemError::NotDirectory => "not a directory",
            FileSystemError::IsDirectory => "is a directory",
            FileSystemError::DirectoryNotEmpty => "directory not empty",
            FileSystemError::InvalidPath => "invalid path",
            FileSystemError::NameTooLong => "file name too long",
            FileSystemError::InvalidArgument => "invalid argument",
            FileSystemError::NoSpace => "no space left on device",
            FileSystemError::NoInodes => "no free inodes",
            FileSystemError::CacheExhausted => "cache exhausted",
            FileSystemError::IoError => "I/O error",
            FileSystemError::InvalidFileSystem => "not an ext2 filesystem",
            FileSystemError::Corrupted => "filesystem corrupted",
            FileSystemError::ReadOnly => "read-only filesystem",
            FileSystemError::Unsupported => "operation not supported",
        };
        f.write_str(msg)
    }
}

pub type FsResult<T> = Result<T, FileSystemError>;
