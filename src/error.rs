use core::fmt;

/// Errors returned by filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// A block device call failed.
    IoError,
    /// Block 0 does not hold a superblock this code can mount
    /// (bad magic, unsupported version, unknown required features, bad geometry).
    InvalidSuperblock,
    /// An inode record failed CRC verification.
    ChecksumMismatch,
    /// A record passed its checksum but violates a structural invariant.
    Corrupted,
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    /// Inode table, block pool, directory or file capacity exhausted.
    OutOfSpace,
    NameTooLong,
    InvalidArgument,
    /// Freeing a block or inode that is already free.
    DoubleFree,
    /// The inode (or the whole session) still has outstanding handles.
    Busy,
    /// The handle was issued by a different session.
    StaleHandle,
    NotMounted,
}

pub type Result<T> = core::result::Result<T, FsError>;

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::IoError => "block device I/O error",
            FsError::InvalidSuperblock => "invalid or unsupported superblock",
            FsError::ChecksumMismatch => "inode checksum mismatch",
            FsError::Corrupted => "filesystem structure corrupted",
            FsError::NotFound => "no such file or directory",
            FsError::AlreadyExists => "entry already exists",
            FsError::NotADirectory => "not a directory",
            FsError::IsADirectory => "is a directory",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::OutOfSpace => "out of space",
            FsError::NameTooLong => "name too long",
            FsError::InvalidArgument => "invalid argument",
            FsError::DoubleFree => "double free",
            FsError::Busy => "resource busy",
            FsError::StaleHandle => "stale inode handle",
            FsError::NotMounted => "filesystem not mounted",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        log::debug!("emfs: block device error: {err}");
        FsError::IoError
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        use std::io::Error;
        use std::io::ErrorKind;

        match err {
            FsError::IoError => Error::from(ErrorKind::BrokenPipe),
            FsError::InvalidSuperblock => Error::from(ErrorKind::Unsupported),
            FsError::ChecksumMismatch | FsError::Corrupted => Error::from(ErrorKind::InvalidData),
            FsError::NotFound => Error::from(ErrorKind::NotFound),
            FsError::AlreadyExists => Error::from(ErrorKind::AlreadyExists),
            FsError::NotADirectory => Error::from(ErrorKind::NotADirectory),
            FsError::IsADirectory => Error::from(ErrorKind::IsADirectory),
            FsError::DirectoryNotEmpty => Error::from(ErrorKind::DirectoryNotEmpty),
            FsError::OutOfSpace => Error::from(ErrorKind::StorageFull),
            FsError::NameTooLong => Error::from(ErrorKind::InvalidFilename),
            FsError::InvalidArgument | FsError::DoubleFree | FsError::StaleHandle => {
                Error::from(ErrorKind::InvalidInput)
            }
            FsError::Busy => Error::from(ErrorKind::ResourceBusy),
            FsError::NotMounted => Error::from(ErrorKind::NotConnected),
        }
    }
}
