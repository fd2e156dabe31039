// Filesystem. There is a single mutable object representing the mounted
// filesystem; inode handles are plain values that do not borrow it, and
// every operation takes the filesystem plus the handle.

use std::collections::BTreeMap;

use crate::bitmap::Bitmap;
use crate::block_cache::BlockCache;
use crate::inode::InodeHandle;
use crate::layout::{DirEntry, DiskInode, EntryKind, Layout, Superblock};
use crate::{DIRECT_BLOCKS, FsError, Result};

/// A mounted filesystem.
pub struct Filesystem {
    pub(crate) layout: Layout,
    pub(crate) superblock: Superblock,
    pub(crate) blockcache: BlockCache,
    pub(crate) session: u64,
    pub(crate) open_handles: BTreeMap<u32, usize>, // ino => count.
    pub(crate) free_blocks: u32,
    pub(crate) free_inodes: u32,
    pub(crate) mounted: bool,
    pub(crate) error: Result<()>, // If set, the FS is in an unknown state and cannot be used.
}

/// What `stat` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attr {
    pub ino: u32,
    pub kind: EntryKind,
    pub size: u64,
    pub nblocks: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub block_count: u32,
    pub data_blocks: u32,
    pub free_blocks: u32,
    pub inodes: u32, // Usable inodes (the reserved one is not counted).
    pub free_inodes: u32,
}

impl Filesystem {
    pub(crate) fn check(&self) -> Result<()> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        self.error
    }

    pub(crate) fn make_error(&mut self) {
        if self.error.is_ok() {
            log::error!("emfs: filesystem state is inconsistent; refusing further operations");
            self.error = Err(FsError::Corrupted);
        }
    }

    pub(crate) fn inode_bitmap(&self) -> Bitmap {
        Bitmap::new(self.layout.inode_bitmap_start, self.layout.num_inodes)
    }

    pub(crate) fn block_bitmap(&self) -> Bitmap {
        Bitmap::new(self.layout.block_bitmap_start, self.layout.data_blocks)
    }

    pub fn block_size(&self) -> u32 {
        self.layout.block_size
    }

    /// The largest possible file: all direct blocks in use.
    pub fn max_file_size(&self) -> u64 {
        self.layout.max_file_size() as u64
    }

    pub fn root_ino(&self) -> u32 {
        self.superblock.root_ino
    }

    pub fn statfs(&self) -> Result<FsStats> {
        self.check()?;
        Ok(FsStats {
            block_size: self.layout.block_size,
            block_count: self.layout.block_count,
            data_blocks: self.layout.data_blocks,
            free_blocks: self.free_blocks,
            inodes: self.layout.num_inodes - 1,
            free_inodes: self.free_inodes,
        })
    }

    pub fn stat(&mut self, path: &str) -> Result<Attr> {
        self.check()?;
        let inode = self.lookup_path(path)?;
        Ok(Attr {
            ino: inode.ino(),
            kind: inode.kind(),
            size: inode.size(),
            nblocks: inode.nblocks(),
        })
    }

    /// Create a new directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let Some((mut parent, name)) = self.lookup_parent(path)? else {
            return Err(FsError::AlreadyExists); // "/".
        };
        if self.lookup(&parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mut dir = self.new_inode()?;
        let block_no = match self.alloc_zeroed_block() {
            Ok(block_no) => block_no,
            Err(err) => {
                self.rollback_inode(dir.ino);
                return Err(err);
            }
        };

        let mut blocks = [0; DIRECT_BLOCKS];
        blocks[0] = block_no;
        dir.inode = DiskInode {
            kind: EntryKind::Directory,
            size: self.layout.block_size,
            nblocks: 1,
            blocks,
        };

        let result = self
            .store_inode(&dir)
            .and_then(|_| self.add_entry(&mut parent, name, dir.ino, EntryKind::Directory));
        if let Err(err) = result {
            self.rollback_block(block_no);
            self.rollback_inode(dir.ino);
            return Err(err);
        }

        log::debug!("emfs: mkdir {path} => ino {}", dir.ino);
        Ok(())
    }

    /// Create a new empty file and return a handle to it.
    pub fn create(&mut self, path: &str) -> Result<InodeHandle> {
        self.check()?;
        let Some((mut parent, name)) = self.lookup_parent(path)? else {
            return Err(FsError::AlreadyExists); // "/".
        };
        if self.lookup(&parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mut file = self.new_inode()?;
        file.inode.kind = EntryKind::File;

        let result = self
            .store_inode(&file)
            .and_then(|_| self.add_entry(&mut parent, name, file.ino, EntryKind::File));
        if let Err(err) = result {
            self.rollback_inode(file.ino);
            return Err(err);
        }

        log::debug!("emfs: create {path} => ino {}", file.ino);
        self.track(&file);
        Ok(file)
    }

    /// Open an existing regular file.
    pub fn open(&mut self, path: &str) -> Result<InodeHandle> {
        self.check()?;
        let file = self.lookup_path(path)?;
        match file.kind() {
            EntryKind::File => {}
            EntryKind::Directory => return Err(FsError::IsADirectory),
            EntryKind::None => return Err(FsError::Corrupted),
        }

        self.track(&file);
        Ok(file)
    }

    /// Remove a regular file, freeing its blocks and inode.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let Some((parent, name)) = self.lookup_parent(path)? else {
            return Err(FsError::IsADirectory); // "/".
        };
        let Some(entry) = self.lookup(&parent, name)? else {
            return Err(FsError::NotFound);
        };

        let mut file = self.load_inode(entry.ino())?;
        match file.kind() {
            EntryKind::File => {}
            EntryKind::Directory => return Err(FsError::IsADirectory),
            EntryKind::None => return Err(FsError::Corrupted),
        }
        if self.is_open(file.ino) {
            log::warn!("emfs: unlink {path}: ino {} has open handles", file.ino);
            return Err(FsError::Busy);
        }

        // Each step leaves a consistent FS: an empty file, then an orphan
        // inode, then nothing.
        self.set_size(&mut file, 0)?;
        self.remove_entry(&parent, name)?;
        self.free_inode(&file)
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let Some((parent, name)) = self.lookup_parent(path)? else {
            return Err(FsError::InvalidArgument); // Cannot remove the root.
        };
        let Some(entry) = self.lookup(&parent, name)? else {
            return Err(FsError::NotFound);
        };

        let mut dir = self.load_inode(entry.ino())?;
        match dir.kind() {
            EntryKind::Directory => {}
            EntryKind::File => return Err(FsError::NotADirectory),
            EntryKind::None => return Err(FsError::Corrupted),
        }
        if self.is_open(dir.ino) {
            return Err(FsError::Busy);
        }
        if !self.list_entries(&dir)?.is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }

        self.set_size(&mut dir, 0)?;
        self.remove_entry(&parent, name)?;
        self.free_inode(&dir)
    }

    /// List a directory, in slot order.
    pub fn readdir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.check()?;
        let dir = self.lookup_path(path)?;
        if dir.kind() != EntryKind::Directory {
            return Err(FsError::NotADirectory);
        }

        self.list_entries(&dir)
    }
}
