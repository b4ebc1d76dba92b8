#![forbid(unsafe_code)]
//! Standalone consistency checker.
//!
//! The checker never calls the live filesystem: it re-derives every
//! invariant the allocators, the resolver, and the directory layer are
//! supposed to maintain by reading the raw on-disk structures through
//! its own accessors. Validators run in a fixed order and the run stops
//! at the first violated invariant — the checker detects, it never
//! repairs.
//!
//! Two validators accumulate a full picture before failing: the
//! inode-to-cluster reference scan records every double reference, and
//! the directory walk tags every visited inode. Their per-inode and
//! per-cluster classification words stay on the [`Checker`] for a
//! postmortem dump.

mod clusters;
mod dirtree;
mod inodes;
mod refs;
mod superblock;

use rufs_block::{BlockIo, ByteDevice};
use rufs_error::FsError;
use rufs_ondisk::{DataCluster, Inode, SuperBlock};
use rufs_types::{BLOCKS_PER_CLUSTER, INODES_PER_BLOCK, INODE_SIZE};
use thiserror::Error;
use tracing::info;

// ── Per-record classification bits ──────────────────────────────────────────

/// Inode status word bits.
pub mod inode_bits {
    /// Marked free in the table.
    pub const FREE: u32 = 1 << 0;
    /// In use with a legal type.
    pub const IN_USE: u32 = 1 << 1;
    /// Seen on the free-inode list walk.
    pub const ON_LIST: u32 = 1 << 2;
    /// Visited by the directory-tree walk.
    pub const VISITED: u32 = 1 << 3;
    /// Named by a directory entry reachable from the root.
    pub const REACHABLE: u32 = 1 << 4;
    /// Participates in a directory loop.
    pub const LOOP: u32 = 1 << 5;
    /// Holds a reference that collides with another inode's.
    pub const DOUBLE_REF: u32 = 1 << 6;
    /// In-use directory the root walk never reached.
    pub const UNREACHABLE: u32 = 1 << 7;
}

/// Cluster status word bits.
pub mod cluster_bits {
    /// On the on-disk free-cluster list.
    pub const IN_LIST: u32 = 1 << 0;
    /// Detached, clean, and in no free structure.
    pub const FREE_CLEAN: u32 = 1 << 1;
    /// Referenced by one of the superblock front caches.
    pub const CACHED: u32 = 1 << 2;
    /// Referenced by exactly one inode so far.
    pub const REFERENCED: u32 = 1 << 3;
    /// Referenced by more than one inode slot.
    pub const DOUBLE_REF: u32 = 1 << 4;
    /// Carries an out-of-range list link.
    pub const BAD_LINK: u32 = 1 << 5;
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// One violated invariant, or the I/O failure that ended the run.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("I/O failure: {0}")]
    Io(#[from] FsError),

    #[error("superblock unreadable: {0}")]
    Unparseable(String),

    // Superblock header
    #[error("invalid magic number {found:#010x}")]
    BadMagic { found: u32 },
    #[error("invalid version number {found}")]
    BadVersion { found: u32 },
    #[error("volume name is not NUL-terminated within its field")]
    BadVolumeName,
    #[error("filesystem was not properly unmounted")]
    NotProperlyUnmounted,
    #[error("superblock records {recorded} blocks, device has {actual}")]
    BadBlockCount { recorded: u32, actual: u32 },

    // Inode-table metadata
    #[error("inode table starts at block {found}, expected block 1")]
    BadInodeTableStart { found: u32 },
    #[error("inode table size {size} blocks disagrees with {itotal} inodes")]
    BadInodeTableSize { size: u32, itotal: u32 },
    #[error("free-inode count {ifree} out of range for {itotal} inodes")]
    BadFreeInodeCount { ifree: u32, itotal: u32 },
    #[error("free-inode list head {head} out of range")]
    BadInodeHead { head: u32 },
    #[error("free-inode list tail {tail} out of range")]
    BadInodeTail { tail: u32 },

    // Data-zone metadata
    #[error("data zone starts at block {found}, expected {expected}")]
    BadDataZoneStart { found: u32, expected: u32 },
    #[error("data zone holds {found} clusters, device geometry allows {expected}")]
    BadDataZoneTotal { found: u32, expected: u32 },
    #[error("free-cluster count {free} out of range for {total} clusters")]
    BadFreeClusterCount { free: u32, total: u32 },

    // Inode table scan
    #[error("free inode {inode} carries out-of-range list link {link}")]
    BadInodeLink { inode: u32, link: u32 },
    #[error("inode free-list head mismatch: table shows {found}, superblock says {expected}")]
    InodeHeadMismatch { found: u32, expected: u32 },
    #[error("inode free-list tail mismatch: table shows {found}, superblock says {expected}")]
    InodeTailMismatch { found: u32, expected: u32 },
    #[error("counted {counted} free inodes, superblock records {recorded}")]
    FreeInodeMismatch { counted: u32, recorded: u32 },

    // Inode list walk
    #[error("free-inode list node {inode} is not marked free")]
    ListNodeNotFree { inode: u32 },
    #[error("free-inode list exceeds {bound} nodes; the list loops")]
    InodeListLoop { bound: u32 },
    #[error("free-inode list broken at {inode}: prev is {found}, expected {expected}")]
    InodeListBroken { inode: u32, found: u32, expected: u32 },

    // Cluster caches
    #[error("retrieval cache index {idx} out of range")]
    RetrievalIndexOutOfRange { idx: u32 },
    #[error("insertion cache index {idx} out of range")]
    InsertionIndexOutOfRange { idx: u32 },
    #[error("cache slot holds {value}, not a legal cluster number")]
    BadCacheReference { value: u32 },
    #[error("cluster {cluster} appears more than once across the front caches")]
    DuplicateCacheReference { cluster: u32 },
    #[error("cached cluster {cluster} still carries free-list links")]
    CachedClusterLinked { cluster: u32 },
    #[error("retrieval-cache cluster {cluster} is not clean")]
    CachedClusterDirty { cluster: u32 },

    // Data zone scan
    #[error("cluster free-list head mismatch: zone shows {found}, superblock says {expected}")]
    ClusterHeadMismatch { found: u32, expected: u32 },
    #[error("cluster free-list tail mismatch: zone shows {found}, superblock says {expected}")]
    ClusterTailMismatch { found: u32, expected: u32 },
    #[error("cluster {cluster} carries out-of-range link {link}")]
    BadClusterLink { cluster: u32, link: u32 },
    #[error("{count} free-clean clusters sit outside every free structure")]
    OrphanedFreeClusters { count: u32 },
    #[error(
        "free-cluster conservation failed: {recorded} recorded, \
         {derived} derived from cache and list state"
    )]
    FreeClusterMismatch { recorded: u32, derived: u32 },

    // Cluster list walk
    #[error("free-cluster list exceeds {bound} nodes; the list loops")]
    ClusterListLoop { bound: u32 },
    #[error("free-cluster list broken at {cluster}: prev is {found}, expected {expected}")]
    ClusterListBroken {
        cluster: u32,
        found: u32,
        expected: u32,
    },

    // Reference scan
    #[error("{count} clusters are referenced by more than one inode slot")]
    MultiplyReferenced { count: usize },
    #[error("inode {inode} references out-of-range cluster {cluster}")]
    BadClusterReference { inode: u32, cluster: u32 },

    // Directory tree walk
    #[error("directory entry names inode {inode}, which is not in use")]
    EntryNotInUse { inode: u32 },
    #[error("directory loop detected at inode {inode}")]
    DirectoryLoop { inode: u32 },
    #[error("directory {inode} first entry is not \".\" naming itself")]
    BadDotEntry { inode: u32 },
    #[error("directory {inode} second entry is not \"..\" naming its parent")]
    BadDotDotEntry { inode: u32 },
    #[error("{count} in-use directories are unreachable from the root")]
    UnreachableDirectories { count: u32 },
}

// ── Run plumbing ────────────────────────────────────────────────────────────

/// Names of the validators, in run order.
pub const STEP_NAMES: [&str; 10] = [
    "superblock header",
    "inode-table metadata",
    "data-zone metadata",
    "inode table",
    "inode free list",
    "cluster caches",
    "data zone",
    "cluster free list",
    "inode-to-cluster references",
    "directory tree",
];

/// Result of a full run: the steps that passed, and the first failure.
#[derive(Debug)]
pub struct CheckOutcome {
    pub passed: Vec<&'static str>,
    pub failure: Option<(&'static str, CheckError)>,
}

impl CheckOutcome {
    /// True when every validator passed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
    }
}

/// The checker: raw access plus accumulated classification state.
pub struct Checker<D: ByteDevice> {
    io: BlockIo<D>,
    sb: SuperBlock,
    /// One classification word per inode (sized after metadata checks).
    pub inode_status: Vec<u32>,
    /// One classification word per cluster.
    pub cluster_status: Vec<u32>,
    /// Clusters referenced from more than one inode slot:
    /// (cluster, offending inode).
    pub double_refs: Vec<(u32, u32)>,
    /// Out-of-range references: (inode, claimed cluster).
    pub bad_refs: Vec<(u32, u32)>,
}

impl<D: ByteDevice> Checker<D> {
    /// Load the superblock raw; its validation is the first step of the
    /// run, not a precondition for constructing the checker.
    pub fn open(dev: D) -> Result<Self, CheckError> {
        let io = BlockIo::new(dev).map_err(CheckError::Io)?;
        let block = io.read_block(0).map_err(CheckError::Io)?;
        let sb =
            SuperBlock::from_bytes(&block).map_err(|e| CheckError::Unparseable(e.to_string()))?;
        Ok(Self {
            io,
            sb,
            inode_status: Vec::new(),
            cluster_status: Vec::new(),
            double_refs: Vec::new(),
            bad_refs: Vec::new(),
        })
    }

    /// The superblock under examination.
    #[must_use]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Run every validator in order, stopping at the first violation.
    pub fn run(&mut self) -> CheckOutcome {
        let steps: [(&'static str, fn(&mut Self) -> Result<(), CheckError>); 10] = [
            (STEP_NAMES[0], Self::check_superblock_header),
            (STEP_NAMES[1], Self::check_inode_metadata),
            (STEP_NAMES[2], Self::check_dzone_metadata),
            (STEP_NAMES[3], Self::check_inode_table),
            (STEP_NAMES[4], Self::check_inode_list),
            (STEP_NAMES[5], Self::check_cluster_caches),
            (STEP_NAMES[6], Self::check_data_zone),
            (STEP_NAMES[7], Self::check_cluster_list),
            (STEP_NAMES[8], Self::check_inode_references),
            (STEP_NAMES[9], Self::check_directory_tree),
        ];
        let mut passed = Vec::new();
        for (name, step) in steps {
            match step(self) {
                Ok(()) => {
                    info!(step = name, "check passed");
                    passed.push(name);
                }
                Err(err) => {
                    return CheckOutcome {
                        passed,
                        failure: Some((name, err)),
                    }
                }
            }
        }
        CheckOutcome {
            passed,
            failure: None,
        }
    }

    /// Size the classification tables once the metadata is trusted.
    pub(crate) fn ensure_status_tables(&mut self) {
        if self.inode_status.len() != self.sb.itotal as usize {
            self.inode_status = vec![0; self.sb.itotal as usize];
        }
        if self.cluster_status.len() != self.sb.dzone_total as usize {
            self.cluster_status = vec![0; self.sb.dzone_total as usize];
        }
    }

    /// Postmortem dump: one classification word per inode and cluster.
    #[must_use]
    pub fn status_dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(out, "inode status words ({}):", self.inode_status.len());
        for (n, word) in self.inode_status.iter().enumerate() {
            let _ = writeln!(out, "  inode {n:>6}: {word:#010x}");
        }
        let _ = writeln!(out, "cluster status words ({}):", self.cluster_status.len());
        for (c, word) in self.cluster_status.iter().enumerate() {
            let _ = writeln!(out, "  cluster {c:>6}: {word:#010x}");
        }
        if !self.double_refs.is_empty() {
            let _ = writeln!(out, "double references (cluster <- inode):");
            for (cluster, inode) in &self.double_refs {
                let _ = writeln!(out, "  cluster {cluster} <- inode {inode}");
            }
        }
        if !self.bad_refs.is_empty() {
            let _ = writeln!(out, "out-of-range references (inode -> cluster):");
            for (inode, cluster) in &self.bad_refs {
                let _ = writeln!(out, "  inode {inode} -> cluster {cluster}");
            }
        }
        out
    }

    // ── Raw accessors (independent of the live filesystem) ──────────────

    pub(crate) fn read_inode(&self, n: u32) -> Result<Inode, CheckError> {
        let block = self.sb.itable_start + n / INODES_PER_BLOCK;
        let offset = (n % INODES_PER_BLOCK) as usize * INODE_SIZE;
        let buf = self.io.read_block(block).map_err(CheckError::Io)?;
        Inode::from_bytes(&buf, offset).map_err(|e| CheckError::Unparseable(e.to_string()))
    }

    pub(crate) fn read_cluster(&self, n: u32) -> Result<DataCluster, CheckError> {
        let block = self.sb.dzone_start + n * BLOCKS_PER_CLUSTER;
        let buf = self.io.read_cluster_at(block).map_err(CheckError::Io)?;
        DataCluster::from_bytes(&buf).map_err(|e| CheckError::Unparseable(e.to_string()))
    }

    pub(crate) fn block_count(&self) -> u32 {
        self.io.block_count()
    }
}
