#![forbid(unsafe_code)]
//! Error types for RUFS.
//!
//! `FsError` is the single user-facing error type returned by the live
//! filesystem, the formatter, and the checker's I/O layer. The taxonomy
//! follows the design split:
//!
//! - parameter errors — reported immediately, no state touched;
//! - resource exhaustion — no side effects;
//! - structural inconsistencies — a field holds a value outside its small
//!   legal set; always propagated, never silently corrected;
//! - not-found / already-exists;
//! - plain I/O failures.
//!
//! Every variant maps to exactly one POSIX errno via [`FsError::to_errno`].
//! The mapping is exhaustive (no wildcard arm), so adding a variant is a
//! compile error until its errno is assigned.
//!
//! `rufs-error` must not depend on `rufs-types` or `rufs-ondisk`; parse
//! errors convert into `FsError` at the boundary of the crate that owns
//! the block number context.

use thiserror::Error;

/// Unified error type for all RUFS operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (bad magic, unsupported version, bad
    /// geometry) detected while opening an image.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Out-of-range index, null-equivalent argument, or illegal enum value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free inode or data cluster available.
    #[error("no space left on device")]
    NoSpace,

    /// An inode expected to be in use is free (or of illegal type).
    #[error("inode {inode} is not in use")]
    InodeNotInUse { inode: u32 },

    /// An inode expected to be free is in use.
    #[error("inode {inode} is not free")]
    InodeNotFree { inode: u32 },

    /// An inode expected to be free in the dirty state is not.
    #[error("inode {inode} is not free in the dirty state")]
    InodeNotDirty { inode: u32 },

    /// A cluster handed out by a free structure is not actually free,
    /// or a cluster being freed is already in a free structure.
    #[error("cluster {cluster} free-state mismatch: {detail}")]
    ClusterStateMismatch { cluster: u32, detail: &'static str },

    /// A cluster's `stat` field names a different owner than expected.
    #[error("cluster {cluster} owned by inode {found}, expected {expected}")]
    WrongOwner {
        cluster: u32,
        expected: u32,
        found: u32,
    },

    /// ALLOC on a file-cluster slot that is already occupied.
    #[error("file cluster index {index} is already referenced")]
    AlreadyReferenced { index: u32 },

    /// FREE / FREE_CLEAN / CLEAN on a file-cluster slot that is empty.
    #[error("file cluster index {index} is not referenced")]
    NotReferenced { index: u32 },

    /// A logical cluster number is not among an inode's references.
    #[error("cluster {cluster} is not referenced by inode {inode}")]
    ClusterNotInInode { inode: u32, cluster: u32 },

    /// Named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Directory entry name already exists.
    #[error("entry exists")]
    Exists,

    /// Path component or inode is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Directory still holds live entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Entry name exceeds the on-disk name field.
    #[error("name too long")]
    NameTooLong,

    /// `refcount` would overflow its on-disk ceiling.
    #[error("too many links")]
    TooManyLinks,

    /// The directory has grown to its maximum cluster count.
    #[error("file too big")]
    FileTooBig,

    /// Caller lacks the permission bits for the requested access.
    #[error("permission denied")]
    PermissionDenied,
}

impl FsError {
    /// Convert this error into a POSIX errno.
    ///
    /// Structural inconsistencies map to `EIO`: they indicate either a
    /// caller bug or on-disk corruption, and the shell-visible contract
    /// only distinguishes hard failure from misuse.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. }
            | Self::InodeNotInUse { .. }
            | Self::InodeNotFree { .. }
            | Self::InodeNotDirty { .. }
            | Self::ClusterStateMismatch { .. }
            | Self::WrongOwner { .. }
            | Self::AlreadyReferenced { .. }
            | Self::NotReferenced { .. }
            | Self::ClusterNotInInode { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::TooManyLinks => libc::EMLINK,
            Self::FileTooBig => libc::EFBIG,
            Self::PermissionDenied => libc::EACCES,
        }
    }
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;
