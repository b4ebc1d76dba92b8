//! The cluster-reference resolver.
//!
//! Maps a file-relative cluster index onto the inode's reference
//! structure — direct slots, the single-indirect cluster, or the
//! double-indirect tree — and applies one of five operations to the
//! resolved slot. The zone is chosen purely by the numeric index; the
//! operation, not time, keys the state machine.
//!
//! `clucount` counts every cluster charged to the inode, indirection
//! clusters included: ALLOC increments it for each cluster it consumes
//! on the path, FREE_CLEAN and CLEAN decrement it for the target and for
//! every indirection cluster collapsed on the way back up. Emptiness of
//! an indirection cluster is always decided by a full linear scan of its
//! reference array.

use crate::{Fs, InodeState};
use rufs_block::ByteDevice;
use rufs_error::{FsError, Result};
use rufs_ondisk::Inode;
use rufs_types::{
    RefZone, CLUSTER_BODY_SIZE, DOUBLE_INDIRECT_BASE, MAX_FILE_CLUSTERS, NULL_CLUSTER,
    NULL_INODE, N_DIRECT, REFS_PER_CLUSTER,
};
use tracing::trace;

/// Operation applied to one resolved file-cluster slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
    /// Return the stored reference; never allocates, never errors on
    /// absence.
    Get,
    /// Allocate the target (and any missing indirection clusters on the
    /// path); the slot must be empty.
    Alloc,
    /// Return the target to the allocator, leaving the reference behind.
    Free,
    /// Free, then dissociate: clear the slot, collapse emptied
    /// indirection clusters, adjust `clucount`.
    FreeClean,
    /// Dissociate only — the target was already freed. Valid only on a
    /// free-dirty inode.
    Clean,
}

impl ClusterOp {
    /// The inode population this operation works on.
    fn state(self) -> InodeState {
        match self {
            Self::Clean => InodeState::FreeDirty,
            _ => InodeState::InUse,
        }
    }
}

impl<D: ByteDevice> Fs<D> {
    /// Apply `op` to the file-cluster slot `clust_ind` of `n_inode`.
    ///
    /// Returns the resolved logical cluster for GET (None when the slot
    /// or its indirection path does not exist) and ALLOC (always Some);
    /// the destructive operations return None.
    pub fn handle_file_cluster(
        &mut self,
        n_inode: u32,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<Option<u32>> {
        if n_inode >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!(
                "inode {n_inode} out of range"
            )));
        }
        let Some(zone) = RefZone::of(clust_ind) else {
            return Err(FsError::InvalidArgument(format!(
                "file cluster index {clust_ind} beyond the file limit"
            )));
        };
        trace!(inode = n_inode, index = clust_ind, ?op, "handle file cluster");

        let state = op.state();
        let mut inode = self.read_inode(n_inode, state)?;
        let out = match zone {
            RefZone::Direct => self.handle_direct(n_inode, &mut inode, clust_ind, op)?,
            RefZone::SingleIndirect => {
                self.handle_single_indirect(n_inode, &mut inode, clust_ind, op)?
            }
            RefZone::DoubleIndirect => {
                self.handle_double_indirect(n_inode, &mut inode, clust_ind, op)?
            }
        };
        self.write_inode(n_inode, &inode, state)?;
        Ok(out)
    }

    // ── Direct zone ─────────────────────────────────────────────────────

    fn handle_direct(
        &mut self,
        n_inode: u32,
        inode: &mut Inode,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<Option<u32>> {
        let slot = clust_ind as usize;
        match op {
            ClusterOp::Get => {
                let r = inode.direct[slot];
                Ok((r != NULL_CLUSTER).then_some(r))
            }
            ClusterOp::Alloc => {
                if inode.direct[slot] != NULL_CLUSTER {
                    return Err(FsError::AlreadyReferenced { index: clust_ind });
                }
                let c = self.alloc_data_cluster(n_inode)?;
                inode.direct[slot] = c;
                inode.clucount += 1;
                Ok(Some(c))
            }
            ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {
                let c = inode.direct[slot];
                if c == NULL_CLUSTER {
                    return Err(FsError::NotReferenced { index: clust_ind });
                }
                if op != ClusterOp::Clean {
                    self.free_data_cluster(c)?;
                }
                if op == ClusterOp::Free {
                    return Ok(None);
                }
                self.clean_leaf(n_inode, c)?;
                inode.direct[slot] = NULL_CLUSTER;
                inode.clucount -= 1;
                Ok(None)
            }
        }
    }

    // ── Single-indirect zone ────────────────────────────────────────────

    fn handle_single_indirect(
        &mut self,
        n_inode: u32,
        inode: &mut Inode,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<Option<u32>> {
        let rel = clust_ind - N_DIRECT;

        if inode.i1 == NULL_CLUSTER {
            return match op {
                ClusterOp::Get => Ok(None),
                ClusterOp::Alloc => {
                    // The indirection level does not exist yet: build it,
                    // then the leaf. Both count against the inode.
                    let i1 = self.alloc_data_cluster(n_inode)?;
                    inode.i1 = i1;
                    inode.clucount += 1;
                    let leaf = self.alloc_data_cluster(n_inode)?;
                    inode.clucount += 1;

                    let mut c1 = self.read_cluster(i1)?;
                    c1.fill_refs_null();
                    c1.set_ref(rel, leaf);
                    self.write_cluster(i1, &c1)?;
                    Ok(Some(leaf))
                }
                ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {
                    Err(FsError::NotReferenced { index: clust_ind })
                }
            };
        }

        let mut c1 = self.read_cluster(inode.i1)?;
        match op {
            ClusterOp::Get => {
                let r = c1.get_ref(rel);
                Ok((r != NULL_CLUSTER).then_some(r))
            }
            ClusterOp::Alloc => {
                if c1.get_ref(rel) != NULL_CLUSTER {
                    return Err(FsError::AlreadyReferenced { index: clust_ind });
                }
                let leaf = self.alloc_data_cluster(n_inode)?;
                inode.clucount += 1;
                c1.set_ref(rel, leaf);
                self.write_cluster(inode.i1, &c1)?;
                Ok(Some(leaf))
            }
            ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {
                let r = c1.get_ref(rel);
                if r == NULL_CLUSTER {
                    return Err(FsError::NotReferenced { index: clust_ind });
                }
                if op != ClusterOp::Clean {
                    self.free_data_cluster(r)?;
                }
                if op == ClusterOp::Free {
                    return Ok(None);
                }
                self.clean_leaf(n_inode, r)?;
                c1.set_ref(rel, NULL_CLUSTER);
                inode.clucount -= 1;

                if c1.refs_all_null() {
                    // Last reference gone: the indirection cluster
                    // collapses back into the free population.
                    c1.stat = NULL_INODE;
                    self.write_cluster(inode.i1, &c1)?;
                    self.free_data_cluster(inode.i1)?;
                    inode.i1 = NULL_CLUSTER;
                    inode.clucount -= 1;
                } else {
                    self.write_cluster(inode.i1, &c1)?;
                }
                Ok(None)
            }
        }
    }

    // ── Double-indirect zone ────────────────────────────────────────────

    fn handle_double_indirect(
        &mut self,
        n_inode: u32,
        inode: &mut Inode,
        clust_ind: u32,
        op: ClusterOp,
    ) -> Result<Option<u32>> {
        let rel = clust_ind - DOUBLE_INDIRECT_BASE;
        let ic = rel / REFS_PER_CLUSTER;
        let dc = rel % REFS_PER_CLUSTER;

        if inode.i2 == NULL_CLUSTER {
            return match op {
                ClusterOp::Get => Ok(None),
                ClusterOp::Alloc => {
                    let i2 = self.alloc_data_cluster(n_inode)?;
                    inode.i2 = i2;
                    inode.clucount += 1;
                    let l2 = self.alloc_data_cluster(n_inode)?;
                    inode.clucount += 1;

                    let mut c2 = self.read_cluster(i2)?;
                    c2.fill_refs_null();
                    c2.set_ref(ic, l2);
                    self.write_cluster(i2, &c2)?;

                    let leaf = self.alloc_data_cluster(n_inode)?;
                    inode.clucount += 1;
                    let mut cl2 = self.read_cluster(l2)?;
                    cl2.fill_refs_null();
                    cl2.set_ref(dc, leaf);
                    self.write_cluster(l2, &cl2)?;
                    Ok(Some(leaf))
                }
                ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {
                    Err(FsError::NotReferenced { index: clust_ind })
                }
            };
        }

        let mut c2 = self.read_cluster(inode.i2)?;
        match op {
            ClusterOp::Get => {
                let l2 = c2.get_ref(ic);
                if l2 == NULL_CLUSTER {
                    return Ok(None);
                }
                let r = self.read_cluster(l2)?.get_ref(dc);
                Ok((r != NULL_CLUSTER).then_some(r))
            }
            ClusterOp::Alloc => {
                let (l2, mut cl2) = match c2.get_ref(ic) {
                    NULL_CLUSTER => {
                        let l2 = self.alloc_data_cluster(n_inode)?;
                        inode.clucount += 1;
                        c2.set_ref(ic, l2);
                        self.write_cluster(inode.i2, &c2)?;
                        let mut cl2 = self.read_cluster(l2)?;
                        cl2.fill_refs_null();
                        self.write_cluster(l2, &cl2)?;
                        (l2, cl2)
                    }
                    l2 => (l2, self.read_cluster(l2)?),
                };
                if cl2.get_ref(dc) != NULL_CLUSTER {
                    return Err(FsError::AlreadyReferenced { index: clust_ind });
                }
                let leaf = self.alloc_data_cluster(n_inode)?;
                inode.clucount += 1;
                cl2.set_ref(dc, leaf);
                self.write_cluster(l2, &cl2)?;
                Ok(Some(leaf))
            }
            ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {
                let l2 = c2.get_ref(ic);
                if l2 == NULL_CLUSTER {
                    return Err(FsError::NotReferenced { index: clust_ind });
                }
                let mut cl2 = self.read_cluster(l2)?;
                let r = cl2.get_ref(dc);
                if r == NULL_CLUSTER {
                    return Err(FsError::NotReferenced { index: clust_ind });
                }
                if op != ClusterOp::Clean {
                    self.free_data_cluster(r)?;
                }
                if op == ClusterOp::Free {
                    return Ok(None);
                }
                self.clean_leaf(n_inode, r)?;
                cl2.set_ref(dc, NULL_CLUSTER);
                inode.clucount -= 1;

                if cl2.refs_all_null() {
                    cl2.stat = NULL_INODE;
                    self.write_cluster(l2, &cl2)?;
                    self.free_data_cluster(l2)?;
                    c2.set_ref(ic, NULL_CLUSTER);
                    inode.clucount -= 1;

                    if c2.refs_all_null() {
                        c2.stat = NULL_INODE;
                        self.write_cluster(inode.i2, &c2)?;
                        self.free_data_cluster(inode.i2)?;
                        inode.i2 = NULL_CLUSTER;
                        inode.clucount -= 1;
                    } else {
                        self.write_cluster(inode.i2, &c2)?;
                    }
                } else {
                    self.write_cluster(l2, &cl2)?;
                }
                Ok(None)
            }
        }
    }

    /// Reset a leaf cluster that is leaving an inode's reference list:
    /// the owner mark must match, the content is zeroed, and the cluster
    /// becomes clean.
    fn clean_leaf(&mut self, n_inode: u32, n: u32) -> Result<()> {
        let mut cluster = self.read_cluster(n)?;
        if cluster.stat != n_inode {
            return Err(FsError::WrongOwner {
                cluster: n,
                expected: n_inode,
                found: cluster.stat,
            });
        }
        cluster.zero_body();
        cluster.stat = NULL_INODE;
        self.write_cluster(n, &cluster)
    }

    // ── Bulk walk ───────────────────────────────────────────────────────

    /// Apply FREE / FREE_CLEAN / CLEAN to every populated slot at or
    /// after `start`.
    ///
    /// The double-indirect zone is processed first, then the single
    /// zone, then the direct slots; each inner walk skips unpopulated
    /// slots without invoking the single-slot handler, so nothing is
    /// ever allocated and absent slots raise no errors.
    pub fn handle_file_clusters(&mut self, n_inode: u32, start: u32, op: ClusterOp) -> Result<()> {
        if n_inode >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!(
                "inode {n_inode} out of range"
            )));
        }
        if start >= MAX_FILE_CLUSTERS {
            return Err(FsError::InvalidArgument(format!(
                "file cluster index {start} beyond the file limit"
            )));
        }
        match op {
            ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean => {}
            ClusterOp::Get | ClusterOp::Alloc => {
                return Err(FsError::InvalidArgument(
                    "bulk operation must be FREE, FREE_CLEAN, or CLEAN".into(),
                ));
            }
        }
        // State check up front; the per-slot handler re-checks on each hit.
        self.read_inode(n_inode, op.state())?;
        self.walk_range(n_inode, start, MAX_FILE_CLUSTERS, op)
    }

    /// Walk `[start, end)` applying `op` to each populated slot,
    /// re-reading the inode between slots so mid-walk collapses are
    /// observed instead of chased into freed clusters.
    fn walk_range(&mut self, n_inode: u32, start: u32, end: u32, op: ClusterOp) -> Result<()> {
        // Double-indirect zone first.
        let mut idx = start.max(DOUBLE_INDIRECT_BASE);
        while idx < end {
            let inode = self.read_inode_raw(n_inode)?;
            if inode.i2 == NULL_CLUSTER {
                break;
            }
            let rel = idx - DOUBLE_INDIRECT_BASE;
            let ic = rel / REFS_PER_CLUSTER;
            let dc = rel % REFS_PER_CLUSTER;
            let c2 = self.read_cluster(inode.i2)?;
            let l2 = c2.get_ref(ic);
            if l2 == NULL_CLUSTER {
                // Whole second-level cluster absent: skip its index span.
                idx = DOUBLE_INDIRECT_BASE + (ic + 1) * REFS_PER_CLUSTER;
                continue;
            }
            if self.read_cluster(l2)?.get_ref(dc) != NULL_CLUSTER {
                self.handle_file_cluster(n_inode, idx, op)?;
            }
            idx += 1;
        }

        // Single-indirect zone.
        if start < DOUBLE_INDIRECT_BASE {
            let mut idx = start.max(N_DIRECT);
            let zone_end = end.min(DOUBLE_INDIRECT_BASE);
            while idx < zone_end {
                let inode = self.read_inode_raw(n_inode)?;
                if inode.i1 == NULL_CLUSTER {
                    break;
                }
                let c1 = self.read_cluster(inode.i1)?;
                if c1.get_ref(idx - N_DIRECT) != NULL_CLUSTER {
                    self.handle_file_cluster(n_inode, idx, op)?;
                }
                idx += 1;
            }
        }

        // Direct zone.
        let mut idx = start;
        let zone_end = end.min(N_DIRECT);
        while idx < zone_end {
            let inode = self.read_inode_raw(n_inode)?;
            if inode.direct[idx as usize] != NULL_CLUSTER {
                self.handle_file_cluster(n_inode, idx, op)?;
            }
            idx += 1;
        }

        Ok(())
    }

    // ── Lazy cleaning entry point ───────────────────────────────────────

    /// Purge cluster `n_clust` from the reference list of the free-dirty
    /// inode `n_inode` before the allocator reuses it.
    ///
    /// In every state the allocator produces, a dirty cluster coming out
    /// of a free structure is a content cluster: it resolves to a leaf
    /// slot and is dissociated through the CLEAN operation. When
    /// `n_clust` turns out to be an indirection cluster, the cluster and
    /// everything in its dependency is cleaned in place; the cluster
    /// itself is mid-reallocation and must not re-enter the free
    /// population.
    pub fn clean_data_cluster(&mut self, n_inode: u32, n_clust: u32) -> Result<()> {
        if n_inode >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!(
                "inode {n_inode} out of range"
            )));
        }
        if n_clust >= self.superblock().dzone_total {
            return Err(FsError::InvalidArgument(format!(
                "cluster {n_clust} out of range"
            )));
        }
        let inode = self.read_inode(n_inode, InodeState::FreeDirty)?;

        for k in 0..N_DIRECT {
            if inode.direct[k as usize] == n_clust {
                self.handle_file_cluster(n_inode, k, ClusterOp::Clean)?;
                return Ok(());
            }
        }

        if inode.i1 == n_clust {
            return self.dissociate_single_level(n_inode, n_clust, |fs, ino| {
                let mut inode = fs.read_inode_raw(ino)?;
                inode.i1 = NULL_CLUSTER;
                fs.write_inode_raw(ino, &inode)
            });
        }
        if inode.i1 != NULL_CLUSTER {
            let c1 = self.read_cluster(inode.i1)?;
            for rel in 0..REFS_PER_CLUSTER {
                if c1.get_ref(rel) == n_clust {
                    self.handle_file_cluster(n_inode, N_DIRECT + rel, ClusterOp::Clean)?;
                    return Ok(());
                }
            }
        }

        if inode.i2 == n_clust {
            return self.dissociate_double_tree(n_inode, n_clust);
        }
        if inode.i2 != NULL_CLUSTER {
            let c2 = self.read_cluster(inode.i2)?;
            for ic in 0..REFS_PER_CLUSTER {
                let l2 = c2.get_ref(ic);
                if l2 == NULL_CLUSTER {
                    continue;
                }
                if l2 == n_clust {
                    let i2 = inode.i2;
                    return self.dissociate_single_level(n_inode, n_clust, move |fs, _ino| {
                        let mut c2 = fs.read_cluster(i2)?;
                        c2.set_ref(ic, NULL_CLUSTER);
                        fs.write_cluster(i2, &c2)?;
                        Ok(())
                    });
                }
                let cl2 = self.read_cluster(l2)?;
                for dc in 0..REFS_PER_CLUSTER {
                    if cl2.get_ref(dc) == n_clust {
                        let idx = DOUBLE_INDIRECT_BASE + ic * REFS_PER_CLUSTER + dc;
                        self.handle_file_cluster(n_inode, idx, ClusterOp::Clean)?;
                        return Ok(());
                    }
                }
            }
        }

        Err(FsError::ClusterNotInInode {
            inode: n_inode,
            cluster: n_clust,
        })
    }

    /// Clean every leaf referenced by the indirection cluster `n_clust`,
    /// zero the cluster itself, and unhook it via `unhook` — without
    /// freeing it (the caller is mid-reallocation of this cluster).
    fn dissociate_single_level<F>(&mut self, n_inode: u32, n_clust: u32, unhook: F) -> Result<()>
    where
        F: FnOnce(&mut Self, u32) -> Result<()>,
    {
        let mut dissociated = 0u32;
        let mut cx = self.read_cluster(n_clust)?;
        for rel in 0..REFS_PER_CLUSTER {
            let leaf = cx.get_ref(rel);
            if leaf != NULL_CLUSTER {
                self.clean_leaf(n_inode, leaf)?;
                dissociated += 1;
            }
        }
        cx.zero_body();
        cx.stat = NULL_INODE;
        self.write_cluster(n_clust, &cx)?;
        unhook(&mut *self, n_inode)?;

        let mut inode = self.read_inode_raw(n_inode)?;
        inode.clucount = inode.clucount.saturating_sub(dissociated + 1);
        self.write_inode_raw(n_inode, &inode)
    }

    /// Clean the whole double-indirect tree rooted at `n_clust` (the
    /// inode's `i2`), freeing second-level clusters — which are still
    /// allocated — but not the root, which is mid-reallocation.
    fn dissociate_double_tree(&mut self, n_inode: u32, n_clust: u32) -> Result<()> {
        let mut dissociated = 0u32;
        let mut c2 = self.read_cluster(n_clust)?;
        for ic in 0..REFS_PER_CLUSTER {
            let l2 = c2.get_ref(ic);
            if l2 == NULL_CLUSTER {
                continue;
            }
            let cl2 = self.read_cluster(l2)?;
            for dc in 0..REFS_PER_CLUSTER {
                let leaf = cl2.get_ref(dc);
                if leaf != NULL_CLUSTER {
                    self.clean_leaf(n_inode, leaf)?;
                    dissociated += 1;
                }
            }
            self.clean_leaf(n_inode, l2)?;
            self.free_data_cluster(l2)?;
            dissociated += 1;
            c2.set_ref(ic, NULL_CLUSTER);
        }
        c2.zero_body();
        c2.stat = NULL_INODE;
        self.write_cluster(n_clust, &c2)?;

        let mut inode = self.read_inode_raw(n_inode)?;
        inode.i2 = NULL_CLUSTER;
        inode.clucount = inode.clucount.saturating_sub(dissociated + 1);
        self.write_inode_raw(n_inode, &inode)
    }

    // ── File-cluster read/write wrappers ────────────────────────────────

    /// Read the body of file cluster `clust_ind`; an unallocated index
    /// reads back as zeroes.
    pub fn read_file_cluster(&mut self, n_inode: u32, clust_ind: u32) -> Result<Vec<u8>> {
        match self.handle_file_cluster(n_inode, clust_ind, ClusterOp::Get)? {
            None => Ok(vec![0u8; CLUSTER_BODY_SIZE]),
            Some(c) => Ok(self.read_cluster(c)?.body().to_vec()),
        }
    }

    /// Write the body of file cluster `clust_ind`, allocating it (and
    /// any missing indirection clusters) on demand.
    pub fn write_file_cluster(&mut self, n_inode: u32, clust_ind: u32, data: &[u8]) -> Result<()> {
        if data.len() != CLUSTER_BODY_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "file cluster write of {} bytes, expected {CLUSTER_BODY_SIZE}",
                data.len()
            )));
        }
        let c = match self.handle_file_cluster(n_inode, clust_ind, ClusterOp::Get)? {
            Some(c) => c,
            None => match self.handle_file_cluster(n_inode, clust_ind, ClusterOp::Alloc)? {
                Some(c) => c,
                None => {
                    return Err(FsError::Corruption {
                        block: 0,
                        detail: "allocation resolved to no cluster".into(),
                    })
                }
            },
        };
        let mut cluster = self.read_cluster(c)?;
        cluster
            .set_body(data)
            .map_err(|e| crate::parse_error(self.cluster_block(c), &e))?;
        self.write_cluster(c, &cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::small_fs;
    use rufs_ondisk::InodeType;

    #[test]
    fn get_on_absent_slots_returns_none_everywhere() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        for idx in [0, N_DIRECT, DOUBLE_INDIRECT_BASE, MAX_FILE_CLUSTERS - 1] {
            assert_eq!(fs.handle_file_cluster(n, idx, ClusterOp::Get).unwrap(), None);
        }
        assert!(fs
            .handle_file_cluster(n, MAX_FILE_CLUSTERS, ClusterOp::Get)
            .is_err());
    }

    #[test]
    fn direct_alloc_get_free_clean() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();

        let c = fs.handle_file_cluster(n, 2, ClusterOp::Alloc).unwrap().unwrap();
        assert_eq!(
            fs.handle_file_cluster(n, 2, ClusterOp::Get).unwrap(),
            Some(c)
        );
        assert_eq!(fs.read_inode_raw(n).unwrap().clucount, 1);
        assert!(matches!(
            fs.handle_file_cluster(n, 2, ClusterOp::Alloc),
            Err(FsError::AlreadyReferenced { index: 2 })
        ));

        fs.handle_file_cluster(n, 2, ClusterOp::FreeClean).unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_eq!(inode.direct[2], NULL_CLUSTER);
        assert_eq!(inode.clucount, 0);
        assert!(matches!(
            fs.handle_file_cluster(n, 2, ClusterOp::Free),
            Err(FsError::NotReferenced { index: 2 })
        ));
    }

    #[test]
    fn single_indirect_builds_and_collapses() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        let free_before = fs.superblock().dzone_free;

        let a = fs
            .handle_file_cluster(n, N_DIRECT, ClusterOp::Alloc)
            .unwrap()
            .unwrap();
        let b = fs
            .handle_file_cluster(n, N_DIRECT + 3, ClusterOp::Alloc)
            .unwrap()
            .unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_ne!(inode.i1, NULL_CLUSTER);
        // i1 + two leaves.
        assert_eq!(inode.clucount, 3);
        assert_eq!(fs.superblock().dzone_free, free_before - 3);

        // The indirection cluster records both leaves.
        let c1 = fs.read_cluster(inode.i1).unwrap();
        assert_eq!(c1.get_ref(0), a);
        assert_eq!(c1.get_ref(3), b);
        assert_eq!(c1.stat, n);

        fs.handle_file_cluster(n, N_DIRECT, ClusterOp::FreeClean)
            .unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_ne!(inode.i1, NULL_CLUSTER, "one leaf still referenced");
        assert_eq!(inode.clucount, 2);

        fs.handle_file_cluster(n, N_DIRECT + 3, ClusterOp::FreeClean)
            .unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_eq!(inode.i1, NULL_CLUSTER, "empty indirection collapses");
        assert_eq!(inode.clucount, 0);
        assert_eq!(fs.superblock().dzone_free, free_before);
    }

    #[test]
    fn double_indirect_builds_and_collapses() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        let free_before = fs.superblock().dzone_free;

        let idx = DOUBLE_INDIRECT_BASE + REFS_PER_CLUSTER + 5;
        let leaf = fs.handle_file_cluster(n, idx, ClusterOp::Alloc).unwrap().unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_ne!(inode.i2, NULL_CLUSTER);
        // i2 + one second-level + leaf.
        assert_eq!(inode.clucount, 3);
        assert_eq!(
            fs.handle_file_cluster(n, idx, ClusterOp::Get).unwrap(),
            Some(leaf)
        );
        // A sibling slot under a different second-level cluster.
        let idx2 = DOUBLE_INDIRECT_BASE + 1;
        fs.handle_file_cluster(n, idx2, ClusterOp::Alloc).unwrap();
        assert_eq!(fs.read_inode_raw(n).unwrap().clucount, 5);

        fs.handle_file_cluster(n, idx, ClusterOp::FreeClean).unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_ne!(inode.i2, NULL_CLUSTER, "other subtree keeps i2 alive");
        assert_eq!(inode.clucount, 3);

        fs.handle_file_cluster(n, idx2, ClusterOp::FreeClean).unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_eq!(inode.i2, NULL_CLUSTER);
        assert_eq!(inode.clucount, 0);
        assert_eq!(fs.superblock().dzone_free, free_before);
    }

    #[test]
    fn repeated_free_clean_is_collapse_idempotent() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        // Populate all three zones.
        for idx in [0, 1, N_DIRECT, N_DIRECT + 1, DOUBLE_INDIRECT_BASE] {
            fs.handle_file_cluster(n, idx, ClusterOp::Alloc).unwrap();
        }

        fs.handle_file_clusters(n, 0, ClusterOp::FreeClean).unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_eq!(inode.i1, NULL_CLUSTER);
        assert_eq!(inode.i2, NULL_CLUSTER);
        assert_eq!(inode.clucount, 0);
        assert!(inode.direct.iter().all(|&d| d == NULL_CLUSTER));

        // A second walk finds nothing to do and changes nothing.
        fs.handle_file_clusters(n, 0, ClusterOp::FreeClean).unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_eq!(inode.clucount, 0);
    }

    #[test]
    fn bulk_walk_respects_start_index() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        for idx in [0, 3, N_DIRECT + 2] {
            fs.handle_file_cluster(n, idx, ClusterOp::Alloc).unwrap();
        }

        // Truncating from the single zone leaves the direct slots alone.
        fs.handle_file_clusters(n, N_DIRECT, ClusterOp::FreeClean)
            .unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        assert_ne!(inode.direct[0], NULL_CLUSTER);
        assert_ne!(inode.direct[3], NULL_CLUSTER);
        assert_eq!(inode.i1, NULL_CLUSTER);
        assert_eq!(inode.clucount, 2);
    }

    #[test]
    fn bulk_walk_rejects_get_and_alloc() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        assert!(fs.handle_file_clusters(n, 0, ClusterOp::Get).is_err());
        assert!(fs.handle_file_clusters(n, 0, ClusterOp::Alloc).is_err());
    }

    #[test]
    fn file_cluster_read_write_round_trip() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();

        // Reading an unallocated index yields zeroes and allocates nothing.
        let body = fs.read_file_cluster(n, 4).unwrap();
        assert!(body.iter().all(|&b| b == 0));
        assert_eq!(fs.read_inode_raw(n).unwrap().clucount, 0);

        let mut data = vec![0u8; CLUSTER_BODY_SIZE];
        data[0] = 0xA5;
        data[CLUSTER_BODY_SIZE - 1] = 0x5A;
        fs.write_file_cluster(n, 4, &data).unwrap();
        assert_eq!(fs.read_file_cluster(n, 4).unwrap(), data);
        assert_eq!(fs.read_inode_raw(n).unwrap().clucount, 1);

        // Overwrite goes to the same cluster.
        let c = fs.handle_file_cluster(n, 4, ClusterOp::Get).unwrap();
        data[1] = 0xFF;
        fs.write_file_cluster(n, 4, &data).unwrap();
        assert_eq!(fs.handle_file_cluster(n, 4, ClusterOp::Get).unwrap(), c);
    }

    #[test]
    fn clean_requires_free_dirty_inode() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        fs.handle_file_cluster(n, 0, ClusterOp::Alloc).unwrap();
        assert!(matches!(
            fs.handle_file_cluster(n, 0, ClusterOp::Clean),
            Err(FsError::InodeNotDirty { .. })
        ));
    }

    #[test]
    fn clean_data_cluster_dissociates_a_leaf() {
        let mut fs = small_fs();
        let n = fs.alloc_inode(InodeType::File).unwrap();
        let c = fs
            .handle_file_cluster(n, N_DIRECT, ClusterOp::Alloc)
            .unwrap()
            .unwrap();
        fs.handle_file_cluster(n, N_DIRECT, ClusterOp::Free).unwrap();
        fs.free_inode(n).unwrap();

        fs.clean_data_cluster(n, c).unwrap();
        let inode = fs.read_inode_raw(n).unwrap();
        // Leaf and collapsed indirection cluster both dissociated.
        assert_eq!(inode.i1, NULL_CLUSTER);
        assert_eq!(inode.clucount, 0);
        assert_eq!(fs.read_cluster(c).unwrap().stat, NULL_INODE);

        // A cluster the inode never referenced is a structural error.
        let other = fs.alloc_inode(InodeType::File).unwrap();
        let foreign = fs.alloc_data_cluster(other).unwrap();
        assert!(matches!(
            fs.clean_data_cluster(n, foreign),
            Err(FsError::ClusterNotInInode { .. })
        ));
    }
}
