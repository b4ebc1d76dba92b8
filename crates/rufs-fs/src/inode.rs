//! Consistency-checked inode access.
//!
//! Every read and write states which inode population it expects — in
//! use, or free in the dirty state — and fails with a structural error
//! when the stored record disagrees. An in-use read touches the access
//! time and persists it; an in-use write stamps both times.

use crate::{now, Fs};
use rufs_block::ByteDevice;
use rufs_error::{FsError, Result};
use rufs_ondisk::Inode;
use rufs_types::{NULL_CLUSTER, N_DIRECT};
use tracing::debug;

/// Which population an inode access expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeState {
    /// In use with a legal file type.
    InUse,
    /// Free, still carrying content from its previous life.
    FreeDirty,
}

/// One requested access kind for permission evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// Permission bit in the "other" triplet.
    #[must_use]
    fn bit(self) -> u32 {
        match self {
            Self::Read => 0o4,
            Self::Write => 0o2,
            Self::Execute => 0o1,
        }
    }
}

impl<D: ByteDevice> Fs<D> {
    /// Read inode `n`, checking it against the expected state.
    ///
    /// An in-use read sets the time of last access and persists it.
    pub fn read_inode(&mut self, n: u32, state: InodeState) -> Result<Inode> {
        if n >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!("inode {n} out of range")));
        }
        let mut inode = self.read_inode_raw(n)?;
        match state {
            InodeState::InUse => {
                if !inode.is_in_use() {
                    return Err(FsError::InodeNotInUse { inode: n });
                }
                inode.set_atime(now());
                self.write_inode_raw(n, &inode)?;
            }
            InodeState::FreeDirty => {
                if !inode.is_free() {
                    return Err(FsError::InodeNotDirty { inode: n });
                }
            }
        }
        Ok(inode)
    }

    /// Write inode `n`, checking the record against the expected state.
    ///
    /// An in-use write stamps the access and modification times.
    pub fn write_inode(&mut self, n: u32, inode: &Inode, state: InodeState) -> Result<()> {
        if n >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!("inode {n} out of range")));
        }
        let mut inode = inode.clone();
        match state {
            InodeState::InUse => {
                if !inode.is_in_use() {
                    return Err(FsError::InodeNotInUse { inode: n });
                }
                let t = now();
                inode.set_atime(t);
                inode.set_mtime(t);
            }
            InodeState::FreeDirty => {
                if !inode.is_free() {
                    return Err(FsError::InodeNotDirty { inode: n });
                }
            }
        }
        self.write_inode_raw(n, &inode)
    }

    /// Purge a free-dirty inode's reference list.
    ///
    /// Dissociates every cluster the inode still references through the
    /// resolver's CLEAN walk — leaf clusters get their owner mark and
    /// content zeroed, emptied indirection clusters are freed and
    /// collapsed — then resets the sizes. The free-list links are a list
    /// concern and stay untouched. Inode 0 can never be cleaned.
    pub fn clean_inode(&mut self, n: u32) -> Result<()> {
        if n == 0 || n >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!(
                "inode {n} out of the cleanable range"
            )));
        }
        if !self.read_inode_raw(n)?.is_free() {
            return Err(FsError::InodeNotDirty { inode: n });
        }

        self.handle_file_clusters(n, 0, crate::ClusterOp::Clean)?;

        let mut inode = self.read_inode_raw(n)?;
        inode.refcount = 0;
        inode.size = 0;
        inode.clucount = 0;
        inode.direct = [NULL_CLUSTER; N_DIRECT as usize];
        inode.i1 = NULL_CLUSTER;
        inode.i2 = NULL_CLUSTER;
        self.write_inode_raw(n, &inode)?;

        debug!(inode = n, "cleaned inode");
        Ok(())
    }

    /// Replace the permission bits of an in-use inode.
    ///
    /// Freshly allocated inodes carry zero permissions; callers grant
    /// access explicitly once the object is wired into the tree.
    pub fn set_permissions(&mut self, n: u32, perms: u32) -> Result<()> {
        let mut inode = self.read_inode(n, InodeState::InUse)?;
        inode.mode = (inode.mode & !rufs_ondisk::MODE_PERM_MASK)
            | (perms & rufs_ondisk::MODE_PERM_MASK);
        self.write_inode(n, &inode, InodeState::InUse)
    }

    /// Check the caller's permissions on inode `n` for one access kind.
    ///
    /// Owner, then group, then other, conventional precedence. Root is
    /// granted read and write unconditionally, and execute whenever any
    /// execute bit is set.
    pub fn access_granted(&mut self, n: u32, access: Access) -> Result<()> {
        let inode = self.read_inode(n, InodeState::InUse)?;
        let mode = inode.mode;
        let creds = self.credentials();

        if creds.uid == 0 {
            let any_x = mode & 0o111 != 0;
            if access != Access::Execute || any_x {
                return Ok(());
            }
            return Err(FsError::PermissionDenied);
        }

        let triplet_shift = if creds.uid == inode.owner {
            6
        } else if creds.gid == inode.group {
            3
        } else {
            0
        };
        if mode >> triplet_shift & access.bit() != 0 {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }
}
