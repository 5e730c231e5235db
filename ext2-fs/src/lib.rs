//! ext2 filesystem driver with a reference-counted block/inode cache.
//!
//! The crate is `no_std` + `alloc` so it can be linked into a kernel; the
//! embedding kernel provides a [`block_dev::BlockDevice`], a
//! [`time::TimeSource`] and, optionally, a [`logging::LogSink`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub mod block_dev;
pub mod cache;
pub mod block_cache;
pub mod diskio;

pub mod layout;
mod bitmap;
pub mod inode;
mod dir;
pub mod ext2;

pub mod vfs;
pub mod mkfs;
pub mod fsck;

pub use block_dev::{BlockDevice, RamDisk};
pub use config::{FormatConfig, MountConfig};
pub use error::{BlockError, FileSystemError, FsResult};
pub use ext2::Ext2FileSystem;
pub use time::{ManualClock, TimeSource};
pub use vfs::{DirEntry, FileStat, FileSystemDriver, FsStat, InodeHandle, InodeType, MountTable};
