use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::SECTOR_SIZE;
use crate::error::BlockError;

/// 块设备特性：以扇区为单位读写
///
/// `buf` is always a whole number of sectors. Implementations use interior
/// mutability; the driver shares one device between its caches.
pub trait BlockDevice: Send + Sync {
    /// 读取一个扇区
    fn read_block(&self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError>;

    /// 写入一个扇区
    fn write_block(&self, lba: u32, buf: &[u8]) -> Result<(), BlockError>;

    /// 扇区数量
    fn num_blocks(&self) -> u32;

    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Read `buf.len() / block_size()` consecutive sectors. Devices with a
    /// vectored transfer override this.
    fn read_blocks(&self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        let sector = self.block_size();
        for (i, chunk) in buf.chunks_mut(sector).enumerate() {
            self.read_block(lba + i as u32, chunk)?;
        }
        Ok(())
    }

    fn write_blocks(&self, lba: u32, buf: &[u8]) -> Result<(), BlockError> {
        let sector = self.block_size();
        for (i, chunk) in buf.chunks(sector).enumerate() {
            self.write_block(lba + i as u32, chunk)?;
        }
        Ok(())
    }

    /// 同步所有挂起的写入操作
    fn sync(&self) -> Result<(), BlockError> {
        Ok(())
    }

    fn statistics(&self) -> BlockDeviceStats {
        BlockDeviceStats::default()
    }
}

/// 块设备统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDeviceStats {
    pub read_count: u64,
    pub write_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Memory-backed block device. Used by `mkfs` images built in memory and by
/// the tests, which can also make it fail writes on demand.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sectors: u32,
    reads: AtomicU64,
    writes: AtomicU64,
    /// Writes still allowed before every write fails; `usize::MAX` = never.
    write_budget: AtomicUsize,
}

impl RamDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn with_bytes(bytes: usize) -> Self {
        Self::new(bytes.div_ceil(SECTOR_SIZE) as u32)
    }

    /// Let `writes` more sector writes succeed, then fail all others.
    pub fn fail_writes_after(&self, writes: usize) {
        self.write_budget.store(writes, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.write_budget.store(usize::MAX, Ordering::SeqCst);
    }

    /// Copy of the raw image, for inspecting on-disk bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn check(&self, lba: u32, len: usize) -> Result<usize, BlockError> {
        if len != SECTOR_SIZE {
            return Err(BlockError::InvalidBlock);
        }
        if lba >= self.sectors {
            return Err(BlockError::InvalidBlock);
        }
        Ok(lba as usize * SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        let start = self.check(lba, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[start..start + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, lba: u32, buf: &[u8]) -> Result<(), BlockError> {
        let start = self.check(lba, buf.len())?;
        let budget = self.write_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(BlockError::DeviceError);
        }
        if budget != usize::MAX {
            self.write_budget.store(budget - 1, Ordering::SeqCst);
        }
        self.data.lock()[start..start + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn num_blocks(&self) -> u32 {
        self.sectors
    }

    fn statistics(&self) -> BlockDeviceStats {
        let reads = self.reads.load(Ordering::Relaxed);
        let writes = self.writes.load(Ordering::Relaxed);
        BlockDeviceStats {
            read_count: reads,
            write_count: writes,
            bytes_read: reads * SECTOR_SIZE as u64,
            bytes_written: writes * SECTOR_SIZE as u64,
        }
    }
}
