//! File I/O over the direct block map.
//!
//! Bytes past `size` in the last block are never trusted: growing a file
//! zeroes them first, and new blocks are always zero-filled.

use crate::inode::InodeHandle;
use crate::layout::EntryKind;
use crate::{Filesystem, FsError, Result};

fn check_regular(file: &InodeHandle) -> Result<()> {
    match file.kind() {
        EntryKind::File => Ok(()),
        EntryKind::Directory => Err(FsError::IsADirectory),
        EntryKind::None => Err(FsError::InvalidArgument),
    }
}

impl Filesystem {
    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at or past EOF.
    pub fn read(&mut self, file: &InodeHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        self.check_handle(file)?;
        check_regular(file)?;

        let size = file.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);

        let block_size = self.layout.block_size as u64;
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let block_no = file.inode.blocks[(pos / block_size) as usize];
            let block_offset = (pos % block_size) as usize;
            let chunk = (len - done).min(block_size as usize - block_offset);

            self.blockcache
                .read_range(block_no, block_offset, &mut buf[done..(done + chunk)])?;
            done += chunk;
        }

        Ok(len)
    }

    /// Write `buf` at `offset`, allocating blocks as needed.
    ///
    /// Writing past the end first extends the file with zeros. If the device
    /// fails midway, the file keeps the part that was written and the error
    /// is returned.
    pub fn write(&mut self, file: &mut InodeHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        self.check()?;
        self.check_handle(file)?;
        check_regular(file)?;

        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(FsError::OutOfSpace)?;
        if end > self.max_file_size() {
            return Err(FsError::OutOfSpace);
        }
        let needed = self.layout.blocks_for(end as u32).saturating_sub(file.nblocks());
        if needed > self.free_blocks {
            return Err(FsError::OutOfSpace);
        }

        if offset > file.size() {
            self.set_size(file, offset as u32)?;
        }

        let block_size = self.layout.block_size as usize;
        let offset = offset as usize;
        let prev = file.inode;
        let mut fresh = Vec::new();
        let mut written = 0;
        let mut failure = None;

        while written < buf.len() {
            let pos = offset + written;
            let idx = pos / block_size;
            let block_offset = pos % block_size;
            let chunk = (buf.len() - written).min(block_size - block_offset);
            let data = &buf[written..(written + chunk)];

            let result = if idx < file.inode.nblocks as usize {
                // Whole blocks too: a failed program is undone from the cached copy.
                let block_no = file.inode.blocks[idx];
                self.blockcache.update(block_no, |block| {
                    block[block_offset..(block_offset + chunk)].copy_from_slice(data);
                })
            } else {
                debug_assert_eq!(idx, file.inode.nblocks as usize);
                let mut block = vec![0_u8; block_size];
                block[block_offset..(block_offset + chunk)].copy_from_slice(data);
                self.alloc_block_with(&block).map(|block_no| {
                    file.inode.blocks[idx] = block_no;
                    file.inode.nblocks += 1;
                    fresh.push(block_no);
                })
            };
            if let Err(err) = result {
                log::debug!("emfs: write to ino {} failed after {written} bytes", file.ino());
                failure = Some(err);
                break;
            }

            written += chunk;
            file.inode.size = file.inode.size.max((pos + chunk) as u32);
        }

        if file.inode != prev {
            if let Err(err) = self.store_inode(file) {
                file.inode = prev;
                for block_no in fresh {
                    self.rollback_block(block_no);
                }
                return Err(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Set the file size. Growing reads back as zeros.
    pub fn truncate(&mut self, file: &mut InodeHandle, new_size: u64) -> Result<()> {
        self.check()?;
        self.check_handle(file)?;
        check_regular(file)?;

        if new_size > self.max_file_size() {
            return Err(FsError::OutOfSpace);
        }
        self.set_size(file, new_size as u32)
    }

    // Also used to empty directories before they are freed.
    pub(crate) fn set_size(&mut self, file: &mut InodeHandle, new_size: u32) -> Result<()> {
        let old_size = file.inode.size;
        let old_nblocks = file.inode.nblocks as usize;
        let new_nblocks = self.layout.blocks_for(new_size) as usize;
        let prev = file.inode;

        if new_size <= old_size {
            // The inode stops referencing the blocks before they are freed.
            file.inode.size = new_size;
            file.inode.nblocks = new_nblocks as u32;
            let freed = file.inode.blocks[new_nblocks..old_nblocks].to_vec();
            file.inode.blocks[new_nblocks..].fill(0);
            if let Err(err) = self.store_inode(file) {
                file.inode = prev;
                return Err(err);
            }

            let mut result = Ok(());
            for block_no in freed {
                if let Err(err) = self.free_block(block_no) {
                    log::warn!("emfs: block {block_no} leaked: {err}");
                    result = result.and(Err(err));
                }
            }
            return result;
        }

        if (new_nblocks - old_nblocks) as u32 > self.free_blocks {
            return Err(FsError::OutOfSpace);
        }

        let block_size = self.layout.block_size;
        if old_size % block_size != 0 {
            let block_no = file.inode.blocks[old_nblocks - 1];
            let tail = (old_size % block_size) as usize;
            self.blockcache.update(block_no, |block| block[tail..].fill(0))?;
        }

        let mut fresh = Vec::new();
        for idx in old_nblocks..new_nblocks {
            match self.alloc_zeroed_block() {
                Ok(block_no) => {
                    file.inode.blocks[idx] = block_no;
                    fresh.push(block_no);
                }
                Err(err) => {
                    file.inode = prev;
                    for block_no in fresh {
                        self.rollback_block(block_no);
                    }
                    return Err(err);
                }
            }
        }

        file.inode.nblocks = new_nblocks as u32;
        file.inode.size = new_size;
        if let Err(err) = self.store_inode(file) {
            file.inode = prev;
            for block_no in fresh {
                self.rollback_block(block_no);
            }
            return Err(err);
        }

        log::trace!("emfs: ino {} resized {old_size} => {new_size}", file.ino());
        Ok(())
    }
}
