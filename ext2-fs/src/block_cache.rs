use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr;

use crate::block_dev::BlockDevice;
use crate::cache::{Cache, CacheRef, CacheStrategy};
use crate::error::{FileSystemError, FsResult};

/// Plain on-disk data: any bit pattern is a valid value and the type has no
/// padding, so it can be copied in and out of a block buffer byte-wise.
///
/// # Safety
/// Implement only for `#[repr(C)]`/`#[repr(C, packed)]` types built from
/// integers and arrays of integers.
pub unsafe trait Pod: Copy + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

/// An all-zero `T`.
pub fn zeroed<T: Pod>() -> T {
    // SAFETY: zero is a valid bit pattern for every `Pod`.
    unsafe { core::mem::zeroed() }
}

pub fn bytes_of<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: `Pod` types have no padding.
    unsafe { core::slice::from_raw_parts(ptr::from_ref(value) as *const u8, size_of::<T>()) }
}

pub fn bytes_of_mut<T: Pod>(value: &mut T) -> &mut [u8] {
    // SAFETY: `Pod` types have no padding and accept any bit pattern, so
    // arbitrary byte writes leave a valid `T`.
    unsafe { core::slice::from_raw_parts_mut(ptr::from_mut(value) as *mut u8, size_of::<T>()) }
}

/// Caches filesystem blocks. A slab is one block, transferred through the
/// device's sector interface.
pub struct DiskStrategy {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    sectors_per_block: u32,
}

impl DiskStrategy {
    pub fn new(device: Arc<dyn BlockDevice>, block_size: usize) -> FsResult<Self> {
        let sector = device.block_size();
        if sector == 0 || block_size < sector || block_size % sector != 0 {
            return Err(FileSystemError::InvalidArgument);
        }
        Ok(Self {
            sectors_per_block: (block_size / sector) as u32,
            device,
            block_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn first_sector(&self, block: u32) -> FsResult<u32> {
        block
            .checked_mul(self.sectors_per_block)
            .ok_or(FileSystemError::IoError)
    }
}

impl CacheStrategy for DiskStrategy {
    type Slab = Vec<u8>;
    type Query = ();

    fn new_slab(&self) -> Vec<u8> {
        vec![0u8; self.block_size]
    }

    fn reset(&self, slab: &mut Vec<u8>) {
        slab.fill(0);
    }

    fn populate(&self, id: u32, slab: &mut Vec<u8>) -> FsResult<()> {
        let lba = self.first_sector(id)?;
        self.device.read_blocks(lba, slab).map_err(|e| {
            log::error!("block {}: read failed: {}", id, e);
            FileSystemError::from(e)
        })
    }

    fn sync(&self, id: u32, slab: &Vec<u8>) -> FsResult<()> {
        let lba = self.first_sector(id)?;
        self.device.write_blocks(lba, slab).map_err(|e| {
            log::error!("block {}: write failed: {}", id, e);
            FileSystemError::from(e)
        })
    }
}

pub type BlockCache = Cache<DiskStrategy>;
pub type BlockRef<'a> = CacheRef<'a, DiskStrategy>;

/// Build a block cache of `slots` blocks over `device`.
pub fn block_cache(device: Arc<dyn BlockDevice>, block_size: usize, slots: usize) -> FsResult<BlockCache> {
    Cache::new("disk", slots, DiskStrategy::new(device, block_size)?)
}

impl CacheRef<'_, DiskStrategy> {
    /// Run `f` on a copy of the `T` stored at `offset`.
    pub fn read_at<T: Pod, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        self.read(|block| {
            assert!(offset + size_of::<T>() <= block.len());
            // SAFETY: bounds checked above; `T: Pod` accepts any bytes.
            let value = unsafe { ptr::read_unaligned(block.as_ptr().add(offset) as *const T) };
            f(&value)
        })
    }

    /// Run `f` on the `T` stored at `offset` and write it back.
    pub fn modify_at<T: Pod, V>(&self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        self.modify(|block| {
            assert!(offset + size_of::<T>() <= block.len());
            let at = unsafe { block.as_mut_ptr().add(offset) as *mut T };
            // SAFETY: as in `read_at`.
            let mut value = unsafe { ptr::read_unaligned(at) };
            let ret = f(&mut value);
            unsafe { ptr::write_unaligned(at, value) };
            ret
        })
    }

    pub fn get<T: Pod>(&self, offset: usize) -> T {
        self.read_at(offset, |v: &T| *v)
    }

    pub fn set<T: Pod>(&self, offset: usize, value: T) {
        self.modify_at(offset, |v: &mut T| *v = value)
    }
}
