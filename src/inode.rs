//! Inode table: bitmap-backed pool of fixed-size, checksummed inode records.

use crate::layout::{DiskInode, EntryKind, INODE_SIZE, RESERVED_INO};
use crate::{DIRECT_BLOCKS, Filesystem, FsError, Result};

/// An inode loaded into memory.
///
/// Handles are issued by `open`, `create`, `resolve`, `inode_alloc` and
/// `inode_read`, and must be given back with [`Filesystem::release`]
/// (or consumed by [`Filesystem::inode_free`]). A handle is only valid with
/// the session that issued it. Two handles to the same inode do not see
/// each other's changes.
#[derive(Debug)]
pub struct InodeHandle {
    pub(crate) ino: u32,
    pub(crate) session: u64,
    pub(crate) inode: DiskInode,
}

impl InodeHandle {
    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn kind(&self) -> EntryKind {
        self.inode.kind
    }

    /// Size in bytes. For directories, the bytes of entry storage.
    pub fn size(&self) -> u64 {
        self.inode.size as u64
    }

    pub fn nblocks(&self) -> u32 {
        self.inode.nblocks
    }

    /// Direct block numbers in use.
    pub fn blocks(&self) -> &[u32] {
        &self.inode.blocks[..(self.inode.nblocks as usize)]
    }

    // The setters below only change the in-memory record; it is checked
    // and persisted by `Filesystem::inode_write`.

    pub fn set_kind(&mut self, kind: EntryKind) {
        self.inode.kind = kind;
    }

    pub fn set_size(&mut self, size: u32) {
        self.inode.size = size;
    }

    /// Replace the direct block map.
    pub fn set_blocks(&mut self, blocks: &[u32]) -> Result<()> {
        if blocks.len() > DIRECT_BLOCKS {
            return Err(FsError::InvalidArgument);
        }
        self.inode.blocks = [0; DIRECT_BLOCKS];
        self.inode.blocks[..blocks.len()].copy_from_slice(blocks);
        self.inode.nblocks = blocks.len() as u32;
        Ok(())
    }
}

impl Filesystem {
    /// Allocate an inode (type `None`, empty) and persist its record.
    pub fn inode_alloc(&mut self) -> Result<InodeHandle> {
        self.check()?;
        let inode = self.new_inode()?;
        self.track(&inode);
        Ok(inode)
    }

    /// Free an inode. Its data blocks must already be freed and its
    /// directory entry removed. Fails `Busy` if other handles to the inode
    /// are still outstanding; the given handle is released either way.
    pub fn inode_free(&mut self, inode: InodeHandle) -> Result<()> {
        self.check()?;
        self.check_handle(&inode)?;
        self.untrack(&inode);
        if self.is_open(inode.ino) {
            log::warn!("emfs: inode_free of ino {} with other open handles", inode.ino);
            return Err(FsError::Busy);
        }
        self.free_inode(&inode)
    }

    /// Load an inode by number, verifying its checksum.
    pub fn inode_read(&mut self, ino: u32) -> Result<InodeHandle> {
        self.check()?;
        let inode = self.load_inode(ino)?;
        self.track(&inode);
        Ok(inode)
    }

    /// Persist the handle's record in its inode table slot.
    ///
    /// The record must be consistent (see [`InodeHandle::set_blocks`]) and
    /// every block it lists must be allocated.
    pub fn inode_write(&mut self, inode: &InodeHandle) -> Result<()> {
        self.check()?;
        self.check_handle(inode)?;
        if !self.inode_bitmap().get(&mut self.blockcache, inode.ino)? {
            log::warn!("emfs: inode_write to free slot {}", inode.ino);
            return Err(FsError::InvalidArgument);
        }
        if inode.inode.validate(&self.layout).is_err() {
            return Err(FsError::InvalidArgument);
        }
        if inode.ino == self.superblock.root_ino && inode.kind() != EntryKind::Directory {
            return Err(FsError::InvalidArgument);
        }
        let block_bitmap = self.block_bitmap();
        for &block_no in inode.blocks() {
            let bit = block_no - self.layout.data_start;
            if !block_bitmap.get(&mut self.blockcache, bit)? {
                log::warn!("emfs: ino {} lists free block {block_no}", inode.ino);
                return Err(FsError::InvalidArgument);
            }
        }

        self.store_inode(inode)
    }

    /// Give a handle back.
    pub fn release(&mut self, inode: InodeHandle) -> Result<()> {
        self.check_handle(&inode)?;
        self.untrack(&inode);
        Ok(())
    }

    pub(crate) fn check_handle(&self, inode: &InodeHandle) -> Result<()> {
        if inode.session != self.session {
            log::warn!(
                "emfs: handle for ino {} from session {} used with session {}",
                inode.ino,
                inode.session,
                self.session
            );
            return Err(FsError::StaleHandle);
        }

        Ok(())
    }

    pub(crate) fn track(&mut self, inode: &InodeHandle) {
        *self.open_handles.entry(inode.ino).or_insert(0) += 1;
    }

    pub(crate) fn untrack(&mut self, inode: &InodeHandle) {
        match self.open_handles.get_mut(&inode.ino) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.open_handles.remove(&inode.ino);
            }
            None => log::warn!("emfs: release of untracked handle for ino {}", inode.ino),
        }
    }

    pub(crate) fn is_open(&self, ino: u32) -> bool {
        self.open_handles.contains_key(&ino)
    }

    fn check_ino(&self, ino: u32) -> Result<()> {
        if ino == RESERVED_INO || ino >= self.layout.num_inodes {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    /// Untracked handle.
    pub(crate) fn load_inode(&mut self, ino: u32) -> Result<InodeHandle> {
        self.check_ino(ino)?;
        let (block_no, offset) = self.layout.inode_location(ino);
        let block = self.blockcache.read(block_no)?;
        let inode = DiskInode::decode(&block[offset..(offset + INODE_SIZE)]).inspect_err(|err| {
            log::error!("emfs: inode {ino}: {err}");
        })?;
        inode.validate(&self.layout).inspect_err(|err| {
            log::error!("emfs: inode {ino}: {err}: {inode:?}");
        })?;

        Ok(InodeHandle {
            ino,
            session: self.session,
            inode,
        })
    }

    pub(crate) fn store_inode(&mut self, inode: &InodeHandle) -> Result<()> {
        debug_assert!(inode.inode.validate(&self.layout).is_ok());
        let (block_no, offset) = self.layout.inode_location(inode.ino);
        self.blockcache.update(block_no, |block| {
            inode.inode.encode(&mut block[offset..(offset + INODE_SIZE)]);
        })
    }

    /// Untracked handle to a fresh, persisted, empty inode.
    pub(crate) fn new_inode(&mut self) -> Result<InodeHandle> {
        let bitmap = self.inode_bitmap();
        let Some(ino) = bitmap.find_first_clear(&mut self.blockcache)? else {
            return Err(FsError::OutOfSpace);
        };
        debug_assert_ne!(ino, RESERVED_INO);
        bitmap.set(&mut self.blockcache, ino, true)?;
        self.free_inodes = self.free_inodes.saturating_sub(1);

        let inode = InodeHandle {
            ino,
            session: self.session,
            inode: DiskInode::default(),
        };
        if let Err(err) = self.store_inode(&inode) {
            self.rollback_inode(ino);
            return Err(err);
        }

        log::trace!("emfs: alloc inode {ino}");
        Ok(inode)
    }

    pub(crate) fn free_inode(&mut self, inode: &InodeHandle) -> Result<()> {
        if inode.ino == self.superblock.root_ino {
            return Err(FsError::InvalidArgument);
        }
        if inode.inode.nblocks != 0 {
            log::warn!("emfs: freeing inode {} that still owns blocks", inode.ino);
            return Err(FsError::InvalidArgument);
        }
        self.free_inode_slot(inode.ino)
    }

    fn free_inode_slot(&mut self, ino: u32) -> Result<()> {
        self.check_ino(ino)?;
        let (block_no, offset) = self.layout.inode_location(ino);
        self.blockcache.update(block_no, |block| {
            block[offset..(offset + INODE_SIZE)].fill(0);
        })?;

        let bitmap = self.inode_bitmap();
        if !bitmap.set(&mut self.blockcache, ino, false)? {
            log::warn!("emfs: double free of inode {ino}");
            return Err(FsError::DoubleFree);
        }
        self.free_inodes += 1;

        log::trace!("emfs: free inode {ino}");
        Ok(())
    }

    pub(crate) fn rollback_inode(&mut self, ino: u32) {
        log::warn!("emfs: rolling back inode {ino}");
        if let Err(err) = self.free_inode_slot(ino) {
            log::error!("emfs: rollback of inode {ino} failed: {err}");
            self.make_error();
        }
    }
}
