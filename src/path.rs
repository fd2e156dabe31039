//! Path resolution, iterative from the root.

use crate::inode::InodeHandle;
use crate::layout::{EntryKind, validate_filename};
use crate::{Filesystem, FsError, MAX_PATH_DEPTH, Result};

/// Absolute paths only; empty components (`//`, trailing `/`) are skipped.
fn split_path(path: &str) -> Result<Vec<&str>> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(FsError::InvalidArgument);
    };

    let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty()).collect();
    if components.len() > MAX_PATH_DEPTH {
        return Err(FsError::InvalidArgument);
    }
    for name in &components {
        validate_filename(name)?;
    }

    Ok(components)
}

impl Filesystem {
    /// Resolve a path to a file or directory.
    pub fn resolve(&mut self, path: &str) -> Result<InodeHandle> {
        self.check()?;
        let inode = self.lookup_path(path)?;
        self.track(&inode);
        Ok(inode)
    }

    fn walk(&mut self, components: &[&str]) -> Result<InodeHandle> {
        let mut inode = self.load_inode(self.superblock.root_ino)?;
        for name in components {
            if inode.kind() != EntryKind::Directory {
                return Err(FsError::NotADirectory);
            }
            let Some(entry) = self.lookup(&inode, name)? else {
                return Err(FsError::NotFound);
            };

            let next = self.load_inode(entry.ino())?;
            if next.kind() != entry.kind() {
                log::error!(
                    "emfs: entry {name} in dir {} says {:?}, inode {} is {:?}",
                    inode.ino(),
                    entry.kind(),
                    next.ino(),
                    next.kind()
                );
                return Err(FsError::Corrupted);
            }
            inode = next;
        }

        Ok(inode)
    }

    /// Untracked handle.
    pub(crate) fn lookup_path(&mut self, path: &str) -> Result<InodeHandle> {
        let components = split_path(path)?;
        self.walk(&components)
    }

    /// The parent directory of the last component, and that component.
    /// `None` for the root. The last component need not exist.
    pub(crate) fn lookup_parent<'a>(
        &mut self,
        path: &'a str,
    ) -> Result<Option<(InodeHandle, &'a str)>> {
        let components = split_path(path)?;
        let Some((name, parents)) = components.split_last() else {
            return Ok(None);
        };

        let parent = self.walk(parents)?;
        if parent.kind() != EntryKind::Directory {
            return Err(FsError::NotADirectory);
        }

        Ok(Some((parent, *name)))
    }
}
