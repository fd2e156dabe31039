use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::BlockDevice;

const ERASED: u8 = 0xff;

/// A host file used as a block device.
///
/// Regular files can be overwritten in place, so `program` does not check
/// erase state; `erase` fills the block with `0xFF` like NOR flash would.
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    num_blocks: u32,
}

impl FileBlockDevice {
    pub fn open(path: &Path, block_size: u32) -> std::io::Result<Self> {
        if block_size == 0 {
            return Err(ErrorKind::InvalidInput.into());
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len % (block_size as u64) != 0 {
            return Err(ErrorKind::InvalidData.into());
        }
        let num_blocks =
            u32::try_from(len / block_size as u64).map_err(|_| ErrorKind::FileTooLarge)?;

        Ok(Self {
            file,
            block_size,
            num_blocks,
        })
    }

    /// Creates a new file of `num_blocks` erased blocks.
    pub fn create(path: &Path, block_size: u32, num_blocks: u32) -> std::io::Result<Self> {
        if block_size == 0 {
            return Err(ErrorKind::InvalidInput.into());
        }
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        let erased = vec![ERASED; block_size as usize];
        for _ in 0..num_blocks {
            file.write_all(&erased)?;
        }

        Ok(Self {
            file,
            block_size,
            num_blocks,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn seek_to(&mut self, block_no: u32, offset: u32, len: usize) -> std::io::Result<()> {
        if block_no >= self.num_blocks || (offset as usize) + len > self.block_size as usize {
            return Err(ErrorKind::InvalidInput.into());
        }

        let pos = (block_no as u64) * (self.block_size as u64) + offset as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&mut self, block_no: u32, offset: u32, buf: &mut [u8]) -> std::io::Result<()> {
        self.seek_to(block_no, offset, buf.len())?;
        self.file.read_exact(buf)
    }

    fn program(&mut self, block_no: u32, offset: u32, buf: &[u8]) -> std::io::Result<()> {
        self.seek_to(block_no, offset, buf.len())?;
        self.file.write_all(buf)
    }

    fn erase(&mut self, block_no: u32) -> std::io::Result<()> {
        self.seek_to(block_no, 0, self.block_size as usize)?;
        let erased = vec![ERASED; self.block_size as usize];
        self.file.write_all(&erased)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}
