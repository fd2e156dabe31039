//! Write-through LRU cache of whole blocks.
//!
//! All writes go to the device before returning, and every write is a
//! full-block `erase` followed by a full-block `program`: nothing ever
//! programs a block that has not just been erased.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::{BlockDevice, Result};

const CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(64).unwrap();

pub(crate) struct BlockCache {
    cache: LruCache<u32, Box<[u8]>>,
    block_device: Box<dyn BlockDevice>,
    block_size: usize,
}

impl BlockCache {
    pub(crate) fn new(block_device: Box<dyn BlockDevice>, block_size: u32) -> Self {
        Self {
            cache: LruCache::new(CACHE_SIZE),
            block_device,
            block_size: block_size as usize,
        }
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn read(&mut self, block_no: u32) -> Result<&[u8]> {
        let block_size = self.block_size;
        let block = self.cache.try_get_or_insert(block_no, || {
            // Not found: read.
            let mut block = vec![0_u8; block_size].into_boxed_slice();
            self.block_device.read(block_no, 0, &mut block)?;
            Ok::<_, crate::FsError>(block)
        })?;
        Ok(&block[..])
    }

    /// Copy bytes out of a block. Misses go straight to the device
    /// and are not cached (file data).
    pub(crate) fn read_range(&mut self, block_no: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert!(offset + buf.len() <= self.block_size);
        if let Some(block) = self.cache.get(&block_no) {
            buf.copy_from_slice(&block[offset..(offset + buf.len())]);
            return Ok(());
        }

        self.block_device.read(block_no, offset as u32, buf)?;
        Ok(())
    }

    /// Replace the whole block.
    pub(crate) fn write(&mut self, block_no: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.block_size);

        // Whatever happens below, the cached copy is no longer what's on the device.
        let prev = self.cache.pop(&block_no);

        self.block_device.erase(block_no)?;
        if let Err(err) = self.block_device.program(block_no, 0, data) {
            if let Some(prev) = prev {
                self.restore(block_no, prev);
            }
            return Err(err.into());
        }

        let mut block = prev.unwrap_or_else(|| vec![0_u8; self.block_size].into_boxed_slice());
        block.copy_from_slice(data);
        self.cache.put(block_no, block);
        Ok(())
    }

    // The block is erased but not programmed: put the old contents back.
    fn restore(&mut self, block_no: u32, prev: Box<[u8]>) {
        let result = self
            .block_device
            .erase(block_no)
            .and_then(|_| self.block_device.program(block_no, 0, &prev));
        match result {
            Ok(()) => {
                log::warn!("emfs: block {block_no}: write failed, old contents restored");
                self.cache.put(block_no, prev);
            }
            Err(err) => log::error!("emfs: block {block_no}: write failed, restore failed: {err}"),
        }
    }

    /// Read-modify-write.
    pub(crate) fn update<F>(&mut self, block_no: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut data = self.read(block_no)?.to_vec();
        f(&mut data);
        self.write(block_no, &data)
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.block_device.sync()?;
        Ok(())
    }

    pub(crate) fn into_device(self) -> Box<dyn BlockDevice> {
        self.block_device
    }
}
