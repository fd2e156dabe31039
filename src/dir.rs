//! Directory engine.
//!
//! A directory is an array of `DIR_ENTRY_SIZE` slots packed into its data
//! blocks. A slot with a zero inode number is free (never used, or a
//! tombstone left by `remove_entry`). Slots are never compacted.

use crate::inode::InodeHandle;
use crate::layout::{DIR_ENTRY_SIZE, DirEntry, EntryKind, RESERVED_INO, validate_filename};
use crate::{DIRECT_BLOCKS, Filesystem, FsError, Result};

#[derive(Clone, Copy, Debug)]
struct Slot {
    block_no: u32,
    offset: usize,
}

impl Filesystem {
    // The handle may predate changes made through paths (a directory grows
    // when `create` adds an entry), so directory ops go by the stored record.
    fn reload(&mut self, dir: &InodeHandle) -> Result<InodeHandle> {
        self.check()?;
        self.check_handle(dir)?;
        self.load_inode(dir.ino)
    }

    /// Look up `name` in a directory.
    pub fn dir_lookup(&mut self, dir: &InodeHandle, name: &str) -> Result<Option<DirEntry>> {
        let dir = self.reload(dir)?;
        validate_filename(name)?;
        self.lookup(&dir, name)
    }

    /// Insert an entry; the first free slot is reused, otherwise a new block
    /// is appended (at most `DIRECT_BLOCKS` per directory). `dir` is
    /// refreshed from the inode table.
    pub fn dir_add_entry(
        &mut self,
        dir: &mut InodeHandle,
        name: &str,
        ino: u32,
        kind: EntryKind,
    ) -> Result<()> {
        dir.inode = self.reload(dir)?.inode;
        self.add_entry(dir, name, ino, kind)
    }

    /// Tombstone the entry for `name`.
    pub fn dir_remove_entry(&mut self, dir: &InodeHandle, name: &str) -> Result<()> {
        let dir = self.reload(dir)?;
        validate_filename(name)?;
        self.remove_entry(&dir, name)
    }

    // Visit slots in order until `f` returns true.
    fn find_slot<F>(&mut self, dir: &InodeHandle, mut f: F) -> Result<Option<(Slot, Option<DirEntry>)>>
    where
        F: FnMut(Slot, Option<&DirEntry>) -> bool,
    {
        if dir.kind() != EntryKind::Directory {
            return Err(FsError::NotADirectory);
        }

        let per_block = self.layout.entries_per_block() as usize;
        for &block_no in dir.blocks() {
            let block = self.blockcache.read(block_no)?;
            for idx in 0..per_block {
                let offset = idx * DIR_ENTRY_SIZE;
                let entry = DirEntry::decode(&block[offset..(offset + DIR_ENTRY_SIZE)])
                    .inspect_err(|_| {
                        log::error!(
                            "emfs: dir {}: bad entry in block {block_no} at {offset}",
                            dir.ino()
                        )
                    })?;
                let slot = Slot { block_no, offset };
                if f(slot, entry.as_ref()) {
                    return Ok(Some((slot, entry)));
                }
            }
        }

        Ok(None)
    }

    pub(crate) fn lookup(&mut self, dir: &InodeHandle, name: &str) -> Result<Option<DirEntry>> {
        let found = self.find_slot(dir, |_, entry| entry.is_some_and(|e| e.name() == name))?;
        Ok(found.and_then(|(_, entry)| entry))
    }

    pub(crate) fn list_entries(&mut self, dir: &InodeHandle) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        self.find_slot(dir, |_, entry| {
            if let Some(entry) = entry {
                entries.push(*entry);
            }
            false
        })?;
        Ok(entries)
    }

    pub(crate) fn add_entry(
        &mut self,
        dir: &mut InodeHandle,
        name: &str,
        ino: u32,
        kind: EntryKind,
    ) -> Result<()> {
        validate_filename(name)?;
        if ino == RESERVED_INO || ino >= self.layout.num_inodes || kind == EntryKind::None {
            return Err(FsError::InvalidArgument);
        }

        let mut free_slot = None;
        let existing = self.find_slot(dir, |slot, entry| match entry {
            Some(entry) => entry.name() == name,
            None => {
                if free_slot.is_none() {
                    free_slot = Some(slot);
                }
                false
            }
        })?;
        if existing.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let entry = DirEntry::new(name, ino, kind);
        if let Some(Slot { block_no, offset }) = free_slot {
            return self.blockcache.update(block_no, |block| {
                entry.encode(&mut block[offset..(offset + DIR_ENTRY_SIZE)]);
            });
        }

        // All slots are taken: add a block.
        let idx = dir.inode.nblocks as usize;
        if idx >= DIRECT_BLOCKS {
            log::debug!("emfs: dir {} is full", dir.ino());
            return Err(FsError::OutOfSpace);
        }

        let mut block = vec![0_u8; self.layout.block_size as usize];
        entry.encode(&mut block[..DIR_ENTRY_SIZE]);
        let block_no = self.alloc_block_with(&block)?;

        let prev = dir.inode;
        dir.inode.blocks[idx] = block_no;
        dir.inode.nblocks += 1;
        dir.inode.size += self.layout.block_size;
        if let Err(err) = self.store_inode(dir) {
            dir.inode = prev;
            self.rollback_block(block_no);
            return Err(err);
        }

        log::debug!("emfs: dir {} grew to {} blocks", dir.ino(), dir.nblocks());
        Ok(())
    }

    pub(crate) fn remove_entry(&mut self, dir: &InodeHandle, name: &str) -> Result<()> {
        let found = self.find_slot(dir, |_, entry| entry.is_some_and(|e| e.name() == name))?;
        let Some((Slot { block_no, offset }, _)) = found else {
            return Err(FsError::NotFound);
        };

        // Tombstone: the whole slot is zeroed, inode number included.
        self.blockcache.update(block_no, |block| {
            block[offset..(offset + DIR_ENTRY_SIZE)].fill(0);
        })
    }
}
