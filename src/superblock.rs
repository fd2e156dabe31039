use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::block_cache::BlockCache;
use crate::layout::*;
use crate::{BlockDevice, DIRECT_BLOCKS, Filesystem, FormatOptions, FsError, Result};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn write_block(block_device: &mut dyn BlockDevice, block_no: u32, data: &[u8]) -> Result<()> {
    block_device.erase(block_no)?;
    block_device.program(block_no, 0, data)?;
    Ok(())
}

pub(crate) fn format(block_device: &mut dyn BlockDevice, options: FormatOptions) -> Result<()> {
    let layout = Layout::new(options.block_size, options.block_count)?;
    let mut block = vec![0_u8; layout.block_size as usize];

    // Kill the old superblock first so that a half-formatted device never mounts.
    block_device.erase(0)?;

    for block_no in layout.metadata_blocks() {
        write_block(block_device, block_no, &block)?;
    }

    // The root directory gets the first data block, empty.
    let root_block = layout.data_start;
    write_block(block_device, root_block, &block)?;

    block[0] = (1 << RESERVED_INO) | (1 << ROOT_INO);
    write_block(block_device, layout.inode_bitmap_start, &block)?;
    block[0] = 1; // root_block.
    write_block(block_device, layout.block_bitmap_start, &block)?;
    block[0] = 0;

    let mut blocks = [0; DIRECT_BLOCKS];
    blocks[0] = root_block;
    let root = DiskInode {
        kind: EntryKind::Directory,
        size: layout.block_size,
        nblocks: 1,
        blocks,
    };
    let (inode_block, offset) = layout.inode_location(ROOT_INO);
    root.encode(&mut block[offset..(offset + INODE_SIZE)]);
    write_block(block_device, inode_block, &block)?;

    block.fill(0);
    let superblock = Superblock::new(layout.block_size, layout.block_count);
    block[..Superblock::SIZE].copy_from_slice(&superblock.encode());
    write_block(block_device, 0, &block)?;

    block_device.sync()?;
    log::debug!("emfs: formatted {layout:?}");
    Ok(())
}

impl Filesystem {
    /// Validates the superblock and the root directory. Nothing is written.
    pub fn mount(mut block_device: Box<dyn BlockDevice>) -> Result<Self> {
        let mut raw = [0_u8; Superblock::SIZE];
        block_device.read(0, 0, &mut raw)?;
        let superblock = Superblock::decode(&raw);
        superblock.validate()?;

        let layout = Layout::new(superblock.block_size, superblock.block_count).map_err(|_| {
            log::debug!("emfs: bad geometry {superblock:?}");
            FsError::InvalidSuperblock
        })?;
        if superblock.root_ino == RESERVED_INO || superblock.root_ino >= layout.num_inodes {
            return Err(FsError::InvalidSuperblock);
        }

        let mut fs = Self {
            layout,
            superblock,
            blockcache: BlockCache::new(block_device, layout.block_size),
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            open_handles: BTreeMap::new(),
            free_blocks: 0,
            free_inodes: 0,
            mounted: true,
            error: Ok(()),
        };

        let root = fs.load_inode(superblock.root_ino)?;
        if root.kind() != EntryKind::Directory
            || !fs.inode_bitmap().get(&mut fs.blockcache, superblock.root_ino)?
        {
            log::error!("emfs: root inode {} is not a directory", superblock.root_ino);
            return Err(FsError::InvalidSuperblock);
        }

        let inode_bitmap = fs.inode_bitmap();
        let block_bitmap = fs.block_bitmap();
        fs.free_inodes = layout.num_inodes - inode_bitmap.count_set(&mut fs.blockcache)?;
        fs.free_blocks = layout.data_blocks - block_bitmap.count_set(&mut fs.blockcache)?;

        log::debug!(
            "emfs: mounted session {}: {} free blocks, {} free inodes",
            fs.session,
            fs.free_blocks,
            fs.free_inodes
        );
        Ok(fs)
    }

    /// Flush the device. Metadata is written through, so there is nothing
    /// buffered on this side.
    pub fn sync(&mut self) -> Result<()> {
        self.check()?;
        self.blockcache.sync()
    }

    /// Fails `Busy` while inode handles are outstanding, and `NotMounted`
    /// if already unmounted.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        let outstanding: usize = self.open_handles.values().sum();
        if outstanding > 0 {
            log::warn!("emfs: unmount with {outstanding} unreleased inode handles");
            return Err(FsError::Busy);
        }

        self.blockcache.sync()?;
        self.mounted = false;
        log::debug!("emfs: unmounted session {}", self.session);
        Ok(())
    }

    /// Give the block device back, e.g. to mount it again.
    pub fn into_device(self) -> Box<dyn BlockDevice> {
        if self.mounted {
            log::warn!("emfs: dropping session {} without unmount", self.session);
        }
        self.blockcache.into_device()
    }
}
