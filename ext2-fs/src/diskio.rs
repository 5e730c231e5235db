//! Byte-addressed reads and writes on top of the block cache.
//!
//! A range is split into a partial head block, whole middle blocks and a
//! partial tail block. A failure part way through leaves the blocks already
//! written modified; there is no rollback.

use core::cmp;

use crate::block_cache::{BlockCache, Pod, bytes_of, bytes_of_mut, zeroed};
use crate::error::FsResult;

/// One block's share of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Block index, counted from the start of whatever the offset is
    /// relative to (the volume, or a file).
    pub index: u64,
    pub in_block: usize,
    pub len: usize,
    /// Bytes of the range before this span.
    pub done: usize,
}

impl Span {
    pub fn is_whole(&self, block_size: usize) -> bool {
        self.len == block_size
    }
}

/// Cut `[offset, offset + len)` into per-block spans: a partial head, whole
/// middle blocks and a partial tail.
pub fn spans(offset: u64, len: usize, block_size: usize) -> impl Iterator<Item = Span> {
    let bs = block_size as u64;
    let mut done = 0usize;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let pos = offset + done as u64;
        let in_block = (pos % bs) as usize;
        let span = Span {
            index: pos / bs,
            in_block,
            len: cmp::min(block_size - in_block, len - done),
            done,
        };
        done += span.len;
        Some(span)
    })
}

pub struct DiskIo<'a> {
    cache: &'a BlockCache,
    block_size: usize,
}

impl<'a> DiskIo<'a> {
    pub fn new(cache: &'a BlockCache) -> Self {
        Self {
            block_size: cache.strategy().block_size(),
            cache,
        }
    }

    /// Copy `dst.len()` bytes out of `block` starting at `in_block`.
    pub fn read_in_block(&self, block: u32, in_block: usize, dst: &mut [u8]) -> FsResult<()> {
        self.cache
            .reference(block)?
            .read(|data| dst.copy_from_slice(&data[in_block..in_block + dst.len()]));
        Ok(())
    }

    /// Copy `src` into `block` at `in_block`. A whole-block copy does not
    /// read the old content first.
    pub fn write_in_block(&self, block: u32, in_block: usize, src: &[u8]) -> FsResult<()> {
        let cached = if src.len() == self.block_size {
            self.cache.add_reference(block)?
        } else {
            self.cache.reference(block)?
        };
        cached.modify(|data| data[in_block..in_block + src.len()].copy_from_slice(src));
        Ok(())
    }

    /// Fill `dst` from the volume starting at byte `offset`.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> FsResult<usize> {
        for span in spans(offset, dst.len(), self.block_size) {
            self.read_in_block(span.index as u32, span.in_block, &mut dst[span.done..span.done + span.len])?;
        }
        Ok(dst.len())
    }

    /// Copy `src` onto the volume at byte `offset`.
    pub fn write(&self, src: &[u8], offset: u64) -> FsResult<usize> {
        for span in spans(offset, src.len(), self.block_size) {
            self.write_in_block(span.index as u32, span.in_block, &src[span.done..span.done + span.len])?;
        }
        Ok(src.len())
    }

    /// Read a plain structure stored at byte `offset`; it may straddle
    /// blocks.
    pub fn read_pod<T: Pod>(&self, offset: u64) -> FsResult<T> {
        let mut value = zeroed::<T>();
        self.read(bytes_of_mut(&mut value), offset)?;
        Ok(value)
    }

    pub fn write_pod<T: Pod>(&self, value: &T, offset: u64) -> FsResult<()> {
        self.write(bytes_of(value), offset).map(|_| ())
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: u64, len: usize) -> FsResult<()> {
        for span in spans(offset, len, self.block_size) {
            let block = span.index as u32;
            if span.is_whole(self.block_size) {
                // add_reference already hands out a zeroed block.
                self.cache.add_reference(block)?;
            } else {
                self.cache
                    .reference(block)?
                    .modify(|data| data[span.in_block..span.in_block + span.len].fill(0));
            }
        }
        Ok(())
    }
}
