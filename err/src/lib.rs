//! Structured error type shared by every crate in the `fatfs` workspace.
//!
//! Mirrors the error kinds a FAT driver core needs to report to a caller
//! without forcing that caller to parse strings: corruption, the usual
//! POSIX-flavored lookup failures, capacity exhaustion, and the backing
//! store's own I/O errors passed through unchanged.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad magic, impossible geometry, a looping cluster chain, a bad FAT
    /// entry, or an LFN/short-name checksum mismatch severe enough to abort
    /// the containing operation.
    #[error("corrupt filesystem structure: {0}")]
    Corrupt(&'static str),
    /// A path component does not exist.
    #[error("not found")]
    NotFound,
    /// Insert would collide with an existing sibling name.
    #[error("already exists")]
    AlreadyExists,
    /// Operation requires a file but the entry is a directory.
    #[error("is a directory")]
    IsDir,
    /// Operation requires a directory but the entry is a file.
    #[error("not a directory")]
    NotDir,
    /// `rmdir` on a directory that still has entries.
    #[error("directory not empty")]
    DirNotEmpty,
    /// The allocator could not satisfy a cluster or directory-slot request.
    #[error("no space left on device")]
    NoSpace,
    /// A file size would exceed the FAT ceiling of 4 GiB - 1 bytes.
    #[error("file too big")]
    TooBig,
    /// A write was attempted against a handle mounted read-only.
    #[error("filesystem is read-only")]
    ReadOnly,
    /// The backing store itself failed; propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An illegal name (`.`, `..`, empty, contains `/`) or option value.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;
