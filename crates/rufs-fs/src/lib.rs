#![forbid(unsafe_code)]
//! The live filesystem.
//!
//! `Fs` is the handle every operation goes through: the block device, the
//! single in-memory superblock instance, and the caller's credentials.
//! The superblock is loaded once at open, mutated in place, and written
//! back through explicit [`Fs::persist_superblock`] calls sitting exactly
//! where a structural mutation completes — persistence is never hidden in
//! a drop path, because "persist after every mutation" is a correctness
//! contract the checker and callers rely on.
//!
//! Layering, leaf to root: raw inode/cluster accessors (this module) →
//! allocators ([`mod@alloc`]) → consistency-checked inode wrappers
//! ([`mod@inode`]) → cluster-reference resolver ([`mod@cluster`]) →
//! directory layer ([`mod@dir`]). The formatter ([`mod@format`]) writes a
//! fresh image through the same block layer.

mod alloc;
mod cluster;
mod dir;
mod format;
mod inode;

pub use cluster::ClusterOp;
pub use dir::DirLookup;
pub use format::{format, FormatOptions};
pub use inode::{Access, InodeState};

use rufs_block::{BlockIo, ByteDevice};
use rufs_error::{FsError, Result};
use rufs_ondisk::{DataCluster, Inode, SuperBlock};
use rufs_types::{
    ParseError, BLOCKS_PER_CLUSTER, INODES_PER_BLOCK, INODE_SIZE, MAGIC_NUMBER,
    VERSION_NUMBER,
};

/// Identity the handle performs permission checks against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Credentials {
    fn default() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// An open filesystem: device, superblock, credentials.
#[derive(Debug)]
pub struct Fs<D: ByteDevice> {
    io: BlockIo<D>,
    sb: SuperBlock,
    creds: Credentials,
}

impl<D: ByteDevice> Fs<D> {
    /// Open an existing filesystem image.
    ///
    /// Loads and validates the superblock; geometry that disagrees with
    /// the device is rejected here rather than discovered mid-operation.
    pub fn open(dev: D, creds: Credentials) -> Result<Self> {
        let io = BlockIo::new(dev)?;
        let block = io.read_block(0)?;
        let sb = SuperBlock::from_bytes(&block).map_err(|e| parse_error(0, &e))?;
        if sb.magic != MAGIC_NUMBER {
            return Err(FsError::Format(format!(
                "bad magic number {:#x}, expected {MAGIC_NUMBER:#x}",
                sb.magic
            )));
        }
        if sb.version != VERSION_NUMBER {
            return Err(FsError::Format(format!(
                "unsupported version {}, expected {VERSION_NUMBER}",
                sb.version
            )));
        }
        if sb.ntotal != io.block_count() {
            return Err(FsError::Format(format!(
                "superblock says {} blocks, device has {}",
                sb.ntotal,
                io.block_count()
            )));
        }
        if sb.itable_start.checked_add(sb.itable_size) != Some(sb.dzone_start)
            || sb.itable_size.checked_mul(INODES_PER_BLOCK) != Some(sb.itotal)
        {
            return Err(FsError::Format("inconsistent table geometry".into()));
        }
        Ok(Self { io, sb, creds })
    }

    /// Assemble a handle from already-initialized parts (formatter only).
    pub(crate) fn from_parts(io: BlockIo<D>, sb: SuperBlock, creds: Credentials) -> Self {
        Self { io, sb, creds }
    }

    /// The in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub(crate) fn sb_mut(&mut self) -> &mut SuperBlock {
        &mut self.sb
    }

    /// The caller identity used for permission checks.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    /// Borrow the underlying block layer.
    #[must_use]
    pub fn block_io(&self) -> &BlockIo<D> {
        &self.io
    }

    /// Write the superblock back to block 0.
    pub fn persist_superblock(&mut self) -> Result<()> {
        self.io.write_block(0, &self.sb.to_bytes())
    }

    // ── Raw inode-table access ──────────────────────────────────────────

    /// (physical block, offset within block) of inode `n`.
    pub(crate) fn inode_location(&self, n: u32) -> (u32, usize) {
        let block = self.sb.itable_start + n / INODES_PER_BLOCK;
        let offset = (n % INODES_PER_BLOCK) as usize * INODE_SIZE;
        (block, offset)
    }

    /// Read inode `n` with no state checks.
    pub(crate) fn read_inode_raw(&self, n: u32) -> Result<Inode> {
        let (block, offset) = self.inode_location(n);
        let buf = self.io.read_block(block)?;
        Inode::from_bytes(&buf, offset).map_err(|e| parse_error(block, &e))
    }

    /// Write inode `n` with no state checks.
    pub(crate) fn write_inode_raw(&mut self, n: u32, inode: &Inode) -> Result<()> {
        let (block, offset) = self.inode_location(n);
        let mut buf = self.io.read_block(block)?;
        inode
            .to_bytes(&mut buf, offset)
            .map_err(|e| parse_error(block, &e))?;
        self.io.write_block(block, &buf)
    }

    // ── Raw data-zone access ────────────────────────────────────────────

    /// Physical block number of logical cluster `n`.
    pub(crate) fn cluster_block(&self, n: u32) -> u32 {
        self.sb.dzone_start + n * BLOCKS_PER_CLUSTER
    }

    /// Read logical cluster `n`.
    pub(crate) fn read_cluster(&self, n: u32) -> Result<DataCluster> {
        if n >= self.sb.dzone_total {
            return Err(FsError::InvalidArgument(format!(
                "cluster {n} out of range (zone has {})",
                self.sb.dzone_total
            )));
        }
        let block = self.cluster_block(n);
        let buf = self.io.read_cluster_at(block)?;
        DataCluster::from_bytes(&buf).map_err(|e| parse_error(block, &e))
    }

    /// Write logical cluster `n`.
    pub(crate) fn write_cluster(&mut self, n: u32, cluster: &DataCluster) -> Result<()> {
        if n >= self.sb.dzone_total {
            return Err(FsError::InvalidArgument(format!(
                "cluster {n} out of range (zone has {})",
                self.sb.dzone_total
            )));
        }
        self.io
            .write_cluster_at(self.cluster_block(n), &cluster.to_bytes())
    }
}

/// Seconds since the epoch, truncated to the on-disk field width.
#[must_use]
pub(crate) fn now() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// A byte-layout failure while reading live metadata is corruption.
pub(crate) fn parse_error(block: u32, err: &ParseError) -> FsError {
    FsError::Corruption {
        block: u64::from(block),
        detail: err.to_string(),
    }
}
