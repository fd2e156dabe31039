//! Embedded Minimal File System (core library)
//!
//! A small filesystem for flash-like block storage: hierarchical names,
//! bitmap-allocated inodes and data blocks, and byte-range
//! read/write/truncate over a fixed direct-block map.
//!
//! The filesystem talks to storage only through [`BlockDevice`], which has
//! flash semantics: a block must be erased before its bits can be programmed
//! again. Every update rewrites a whole block (erase, then program).
//!
//! On-disk layout:
//!
//! * superblock (block 0)
//! * inode bitmap
//! * data block bitmap
//! * inode table
//! * data blocks
//!
//! There is no journal. Inode records carry a CRC32 so corruption is
//! detected on read, but it is never repaired.
//!
//! Usage: [`format`] a device, [`Filesystem::mount`] it, then go through
//! paths (`create`, `mkdir`, `open`, ...) and [`InodeHandle`]s
//! (`read`, `write`, `truncate`). See src/tests.rs for examples.

pub mod file_block_device;
pub mod ram_block_device;

mod alloc;
mod bitmap;
mod block_cache;
mod dir;
mod error;
mod file;
mod fs;
mod inode;
mod layout;
mod path;
mod superblock;


pub use error::*;
pub use file_block_device::FileBlockDevice;
pub use fs::*;
pub use inode::InodeHandle;
pub use layout::{DirEntry, EntryKind};
pub use ram_block_device::{DeviceStats, RamBlockDevice};

/// Max length of a file or directory name, in bytes.
pub const NAME_MAX: usize = 32;

/// The number of direct block numbers in an inode. There are no indirect
/// blocks, so this times the block size is the largest possible file.
pub const DIRECT_BLOCKS: usize = 8;

/// Max number of components in a path.
pub const MAX_PATH_DEPTH: usize = 64;

pub const MIN_BLOCK_SIZE: u32 = 128;
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Block device with flash semantics.
///
/// Programming can only clear bits; `erase` resets a block to its erased
/// state. Errors are passed up to the caller as [`FsError::IoError`] and
/// never retried.
pub trait BlockDevice {
    /// Read `buf.len()` bytes starting at `offset` within the block.
    fn read(&mut self, block_no: u32, offset: u32, buf: &mut [u8]) -> std::io::Result<()>;

    /// Program `buf` at `offset` within the block. The bytes must have been
    /// erased since they were last programmed.
    fn program(&mut self, block_no: u32, offset: u32, buf: &[u8]) -> std::io::Result<()>;

    /// Reset the whole block to its erased state.
    fn erase(&mut self, block_no: u32) -> std::io::Result<()>;

    /// Flush any device-side buffering.
    fn sync(&mut self) -> std::io::Result<()>;
}

/// Geometry of a filesystem to be created by [`format`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    pub block_size: u32,
    pub block_count: u32,
}

/// Initializes the block device so that it holds an empty filesystem with
/// a single, empty root directory.
///
/// Format is not crash-safe: on error the device is left partially formatted.
pub fn format(block_device: &mut dyn BlockDevice, options: FormatOptions) -> Result<()> {
    superblock::format(block_device, options)
}
