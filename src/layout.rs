//! Data structures as they are on the permanent storage.
//!
//! Nothing here relies on in-memory struct layout: every record has an
//! explicit little-endian encoding, and checksums are computed over the
//! encoded bytes.
//!
//! Partition:
//! - block 0: superblock;
//! - inode bitmap: one bit per inode slot; inode 0 is reserved so that a zero
//!   inode number can mark an empty directory slot;
//! - block bitmap: one bit per data block, bit 0 <=> `data_start`;
//! - inode table: `INODE_SIZE`-byte slots;
//! - data blocks: file contents and directory entry blocks.
//!
//! The geometry is a pure function of `(block_size, block_count)`, so only
//! those two numbers are stored in the superblock.

use crc::CRC_32_ISO_HDLC;

use crate::{DIRECT_BLOCKS, FsError, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NAME_MAX, Result};

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub(crate) fn crc32_hash(bytes: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(bytes);
    digest.finalize()
}

pub(crate) const MAGIC: u32 = 0x5346_4d45; // "EMFS" on disk.
pub(crate) const VERSION: u32 = 1;

// Low half of `features`: bits a reader must understand to mount.
// High half: optional bits, ignored when unknown.
pub(crate) const FEATURES_REQUIRED_MASK: u32 = 0x0000_ffff;
pub(crate) const FEATURES_SUPPORTED: u32 = 0;

pub(crate) const ROOT_INO: u32 = 1;
pub(crate) const RESERVED_INO: u32 = 0;

pub(crate) const INODE_SIZE: usize = 64;
const INODE_CRC_OFFSET: usize = 44;

pub(crate) const DIR_ENTRY_SIZE: usize = 40;
const DIR_ENTRY_INO_OFFSET: usize = NAME_MAX;
const DIR_ENTRY_KIND_OFFSET: usize = NAME_MAX + 4;
const DIR_ENTRY_NAME_LEN_OFFSET: usize = NAME_MAX + 5;

// One inode per INODE_RATIO blocks, but at least MIN_INODES.
const INODE_RATIO: u64 = 4;
const MIN_INODES: u64 = 16;

const _: () = assert!(DIR_ENTRY_NAME_LEN_OFFSET < DIR_ENTRY_SIZE);
const _: () = assert!(INODE_CRC_OFFSET == 12 + 4 * DIRECT_BLOCKS);
const _: () = assert!(INODE_CRC_OFFSET + 4 <= INODE_SIZE);
const _: () = assert!(INODE_SIZE <= MIN_BLOCK_SIZE as usize);
const _: () = assert!(DIR_ENTRY_SIZE <= MIN_BLOCK_SIZE as usize);
const _: () = assert!(NAME_MAX <= u8::MAX as usize);

#[inline]
pub(crate) fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
pub(crate) fn put_u32(bytes: &mut [u8], offset: usize, val: u32) {
    bytes[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

/// The type of an inode or a directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Free inode slot.
    #[default]
    None = 0,
    File = 1,
    Directory = 2,
}

impl EntryKind {
    pub(crate) fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(EntryKind::None),
            1 => Some(EntryKind::File),
            2 => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

// The first block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub root_ino: u32,
    pub version: u32,
    pub features: u32,
}

impl Superblock {
    pub const SIZE: usize = 24;

    pub fn new(block_size: u32, block_count: u32) -> Self {
        Self {
            magic: MAGIC,
            block_size,
            block_count,
            root_ino: ROOT_INO,
            version: VERSION,
            features: FEATURES_SUPPORTED,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0_u8; Self::SIZE];
        put_u32(&mut bytes, 0, self.magic);
        put_u32(&mut bytes, 4, self.block_size);
        put_u32(&mut bytes, 8, self.block_count);
        put_u32(&mut bytes, 12, self.root_ino);
        put_u32(&mut bytes, 16, self.version);
        put_u32(&mut bytes, 20, self.features);
        bytes
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: get_u32(bytes, 0),
            block_size: get_u32(bytes, 4),
            block_count: get_u32(bytes, 8),
            root_ino: get_u32(bytes, 12),
            version: get_u32(bytes, 16),
            features: get_u32(bytes, 20),
        }
    }

    /// Identity checks; geometry is checked by `Layout::new`.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            log::debug!("emfs: bad magic {:#x}", self.magic);
            return Err(FsError::InvalidSuperblock);
        }
        if self.version != VERSION {
            log::debug!("emfs: unsupported version {}", self.version);
            return Err(FsError::InvalidSuperblock);
        }
        let unknown = self.features & FEATURES_REQUIRED_MASK & !FEATURES_SUPPORTED;
        if unknown != 0 {
            log::debug!("emfs: unknown required features {unknown:#x}");
            return Err(FsError::InvalidSuperblock);
        }

        Ok(())
    }
}

/// Where everything lives on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub block_size: u32,
    pub block_count: u32,
    pub num_inodes: u32,
    pub inode_bitmap_start: u32,
    pub block_bitmap_start: u32,
    pub inode_table_start: u32,
    pub data_start: u32,
    pub data_blocks: u32,
}

impl Layout {
    pub fn new(block_size: u32, block_count: u32) -> Result<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(FsError::InvalidArgument);
        }

        let bs = block_size as u64;
        let bc = block_count as u64;
        let bits_per_block = bs * 8;

        let inodes_per_block = bs / INODE_SIZE as u64;
        let wanted_inodes = (bc / INODE_RATIO).max(MIN_INODES);
        let inode_table_blocks = wanted_inodes.div_ceil(inodes_per_block);
        let num_inodes = inode_table_blocks * inodes_per_block;
        let inode_bitmap_blocks = num_inodes.div_ceil(bits_per_block);
        let block_bitmap_blocks = bc.div_ceil(bits_per_block).max(1);

        let inode_bitmap_start = 1_u64;
        let block_bitmap_start = inode_bitmap_start + inode_bitmap_blocks;
        let inode_table_start = block_bitmap_start + block_bitmap_blocks;
        let data_start = inode_table_start + inode_table_blocks;
        if data_start >= bc || num_inodes > u32::MAX as u64 {
            // Need at least one data block (for the root directory).
            return Err(FsError::InvalidArgument);
        }

        Ok(Self {
            block_size,
            block_count,
            num_inodes: num_inodes as u32,
            inode_bitmap_start: inode_bitmap_start as u32,
            block_bitmap_start: block_bitmap_start as u32,
            inode_table_start: inode_table_start as u32,
            data_start: data_start as u32,
            data_blocks: (bc - data_start) as u32,
        })
    }

    /// Metadata blocks, all zeroed by format.
    pub fn metadata_blocks(&self) -> core::ops::Range<u32> {
        self.inode_bitmap_start..self.data_start
    }

    /// (block_no, offset in block) of an inode slot.
    pub fn inode_location(&self, ino: u32) -> (u32, usize) {
        let per_block = self.block_size / INODE_SIZE as u32;
        (
            self.inode_table_start + ino / per_block,
            (ino % per_block) as usize * INODE_SIZE,
        )
    }

    pub fn entries_per_block(&self) -> u32 {
        self.block_size / DIR_ENTRY_SIZE as u32
    }

    pub fn max_file_size(&self) -> u32 {
        self.block_size * DIRECT_BLOCKS as u32
    }

    /// The number of blocks needed to hold `size` bytes.
    pub fn blocks_for(&self, size: u32) -> u32 {
        size.div_ceil(self.block_size)
    }

    pub fn is_data_block(&self, block_no: u32) -> bool {
        block_no >= self.data_start && block_no < self.block_count
    }
}

/// An inode record as stored in its inode table slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DiskInode {
    pub kind: EntryKind,
    pub size: u32, // Bytes.
    pub nblocks: u32,
    pub blocks: [u32; DIRECT_BLOCKS],
}

impl DiskInode {
    /// Serializes into an `INODE_SIZE` slot, checksum included.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), INODE_SIZE);
        out.fill(0);
        out[0] = self.kind as u8;
        put_u32(out, 4, self.size);
        put_u32(out, 8, self.nblocks);
        for (idx, block_no) in self.blocks.iter().enumerate() {
            put_u32(out, 12 + idx * 4, *block_no);
        }
        let crc32 = crc32_hash(&out[..INODE_CRC_OFFSET]);
        put_u32(out, INODE_CRC_OFFSET, crc32);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        debug_assert_eq!(bytes.len(), INODE_SIZE);
        if crc32_hash(&bytes[..INODE_CRC_OFFSET]) != get_u32(bytes, INODE_CRC_OFFSET) {
            return Err(FsError::ChecksumMismatch);
        }

        let kind = EntryKind::from_u8(bytes[0]).ok_or(FsError::Corrupted)?;
        let mut blocks = [0_u32; DIRECT_BLOCKS];
        for (idx, block_no) in blocks.iter_mut().enumerate() {
            *block_no = get_u32(bytes, 12 + idx * 4);
        }

        Ok(Self {
            kind,
            size: get_u32(bytes, 4),
            nblocks: get_u32(bytes, 8),
            blocks,
        })
    }

    /// Structural checks beyond the checksum.
    pub fn validate(&self, layout: &Layout) -> Result<()> {
        let nblocks = self.nblocks as usize;
        if nblocks > DIRECT_BLOCKS {
            return Err(FsError::Corrupted);
        }
        if self.size > self.nblocks * layout.block_size {
            return Err(FsError::Corrupted);
        }
        if self.kind == EntryKind::File && layout.blocks_for(self.size) != self.nblocks {
            return Err(FsError::Corrupted);
        }
        if self.kind == EntryKind::None && (self.size != 0 || self.nblocks != 0) {
            return Err(FsError::Corrupted);
        }
        if !self.blocks[..nblocks]
            .iter()
            .all(|b| layout.is_data_block(*b))
        {
            return Err(FsError::Corrupted);
        }
        if self.blocks[nblocks..].iter().any(|b| *b != 0) {
            return Err(FsError::Corrupted);
        }

        Ok(())
    }
}

/// An entry in a directory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    name: [u8; NAME_MAX], // UTF-8.
    name_len: u8,
    ino: u32,
    kind: EntryKind,
}

impl core::fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirEntry")
            .field("name", &self.name())
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .finish()
    }
}

impl DirEntry {
    /// `name` must have passed `validate_filename`.
    pub(crate) fn new(name: &str, ino: u32, kind: EntryKind) -> Self {
        let bytes = name.as_bytes();
        debug_assert!(!bytes.is_empty() && bytes.len() <= NAME_MAX);

        let mut entry = Self {
            name: [0; NAME_MAX],
            name_len: bytes.len() as u8,
            ino,
            kind,
        };
        entry.name[..bytes.len()].copy_from_slice(bytes);
        entry
    }

    pub fn name(&self) -> &str {
        // Validated when decoded or constructed.
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or_default()
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub(crate) fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), DIR_ENTRY_SIZE);
        out.fill(0);
        out[..NAME_MAX].copy_from_slice(&self.name);
        put_u32(out, DIR_ENTRY_INO_OFFSET, self.ino);
        out[DIR_ENTRY_KIND_OFFSET] = self.kind as u8;
        out[DIR_ENTRY_NAME_LEN_OFFSET] = self.name_len;
    }

    /// Returns None for an empty (tombstoned) slot.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        debug_assert_eq!(bytes.len(), DIR_ENTRY_SIZE);
        let ino = get_u32(bytes, DIR_ENTRY_INO_OFFSET);
        if ino == 0 {
            return Ok(None);
        }

        let name_len = bytes[DIR_ENTRY_NAME_LEN_OFFSET];
        let kind = match EntryKind::from_u8(bytes[DIR_ENTRY_KIND_OFFSET]) {
            Some(EntryKind::File) => EntryKind::File,
            Some(EntryKind::Directory) => EntryKind::Directory,
            _ => return Err(FsError::Corrupted),
        };
        if name_len == 0 || name_len as usize > NAME_MAX {
            return Err(FsError::Corrupted);
        }
        let name = core::str::from_utf8(&bytes[..name_len as usize])
            .map_err(|_| FsError::Corrupted)?;
        validate_filename(name).map_err(|_| FsError::Corrupted)?;

        Ok(Some(Self::new(name, ino, kind)))
    }
}

pub(crate) fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }

    Ok(())
}
