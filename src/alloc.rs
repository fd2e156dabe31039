//! Data block allocator: first fit over the block bitmap, which only covers
//! the data pool, so metadata blocks are never handed out.

use crate::{Filesystem, FsError, Result};

impl Filesystem {
    /// Allocate a data block. Its contents are whatever was there before.
    pub fn block_alloc(&mut self) -> Result<u32> {
        self.check()?;
        self.alloc_block()
    }

    /// Return a data block to the pool. Freeing a free block fails `DoubleFree`.
    pub fn block_free(&mut self, block_no: u32) -> Result<()> {
        self.check()?;
        self.free_block(block_no)
    }

    pub(crate) fn alloc_block(&mut self) -> Result<u32> {
        let bitmap = self.block_bitmap();
        let Some(bit) = bitmap.find_first_clear(&mut self.blockcache)? else {
            return Err(FsError::OutOfSpace);
        };
        bitmap.set(&mut self.blockcache, bit, true)?;
        self.free_blocks = self.free_blocks.saturating_sub(1);

        let block_no = self.layout.data_start + bit;
        log::trace!("emfs: alloc block {block_no}");
        Ok(block_no)
    }

    /// Allocate a block and write `data` into it. The bitmap bit is rolled
    /// back if the write fails.
    pub(crate) fn alloc_block_with(&mut self, data: &[u8]) -> Result<u32> {
        let block_no = self.alloc_block()?;
        if let Err(err) = self.blockcache.write(block_no, data) {
            self.rollback_block(block_no);
            return Err(err);
        }

        Ok(block_no)
    }

    pub(crate) fn alloc_zeroed_block(&mut self) -> Result<u32> {
        let zeroes = vec![0_u8; self.layout.block_size as usize];
        self.alloc_block_with(&zeroes)
    }

    pub(crate) fn free_block(&mut self, block_no: u32) -> Result<()> {
        if !self.layout.is_data_block(block_no) {
            return Err(FsError::InvalidArgument);
        }

        let bit = block_no - self.layout.data_start;
        let bitmap = self.block_bitmap();
        if !bitmap.set(&mut self.blockcache, bit, false)? {
            log::warn!("emfs: double free of block {block_no}");
            return Err(FsError::DoubleFree);
        }
        self.free_blocks += 1;

        log::trace!("emfs: free block {block_no}");
        Ok(())
    }

    /// Undo an allocation after a failed operation. If even that fails the
    /// bitmap no longer matches the inodes: poison the session.
    pub(crate) fn rollback_block(&mut self, block_no: u32) {
        log::warn!("emfs: rolling back block {block_no}");
        if let Err(err) = self.free_block(block_no) {
            log::error!("emfs: rollback of block {block_no} failed: {err}");
            self.make_error();
        }
    }
}
