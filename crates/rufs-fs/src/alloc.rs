//! Inode and data-cluster allocation.
//!
//! Both free populations are doubly-linked lists threaded through the
//! storage records themselves: free inodes reuse their time fields as
//! next/prev links, free clusters carry links in their headers. The data
//! zone additionally keeps two fixed-capacity front caches inside the
//! superblock — the retrieval cache feeds allocations, the insertion
//! cache absorbs frees — refilled and drained lazily by `replenish` and
//! `deplete`.
//!
//! Conservation invariant, maintained across every transition:
//! `dzone_free == retrieval filled slots + on-disk list length +
//! insertion filled slots`.
//!
//! Freeing is lazy about content: a freed cluster keeps its `stat` owner
//! (the dirty state) and is only purged when the allocator hands it out
//! again; a freed inode keeps its references and is cleaned when popped.

use crate::{now, Fs};
use rufs_block::ByteDevice;
use rufs_error::{FsError, Result};
use rufs_ondisk::{InodeType, SuperBlock};
use rufs_types::{DZONE_CACHE_SIZE, NULL_CLUSTER, NULL_INODE};
use tracing::debug;

impl<D: ByteDevice> Fs<D> {
    // ── Inode allocation ────────────────────────────────────────────────

    /// Allocate a free inode of the given type.
    ///
    /// Pops the head of the free-inode list, cleans it if it still
    /// carries references from its previous life, and initializes it in
    /// use with zero permissions and zero sizes.
    pub fn alloc_inode(&mut self, itype: InodeType) -> Result<u32> {
        check_itable_metadata(self.superblock())?;
        if self.superblock().ifree == 0 {
            return Err(FsError::NoSpace);
        }

        let n = self.superblock().ihead;
        let head = self.read_inode_raw(n)?;
        if !head.is_free() {
            return Err(FsError::InodeNotFree { inode: n });
        }

        // Unlink the head; a one-element list empties both ends.
        if self.superblock().ifree == 1 {
            let sb = self.sb_mut();
            sb.ihead = NULL_INODE;
            sb.itail = NULL_INODE;
        } else {
            self.sb_mut().ihead = head.next();
        }
        let new_head = self.superblock().ihead;
        if new_head != NULL_INODE {
            let mut next = self.read_inode_raw(new_head)?;
            next.set_prev(NULL_INODE);
            self.write_inode_raw(new_head, &next)?;
        }
        self.sb_mut().ifree -= 1;
        self.persist_superblock()?;

        // Lazy cleaning: purge references left behind by the previous
        // owner before reuse.
        if !self.read_inode_raw(n)?.is_clean() {
            self.clean_inode(n)?;
        }

        let mut inode = self.read_inode_raw(n)?;
        inode.mode = itype.mode_bits();
        inode.refcount = 0;
        inode.owner = self.credentials().uid;
        inode.group = self.credentials().gid;
        inode.size = 0;
        inode.clucount = 0;
        inode.direct = [NULL_CLUSTER; rufs_types::N_DIRECT as usize];
        inode.i1 = NULL_CLUSTER;
        inode.i2 = NULL_CLUSTER;
        let t = now();
        inode.set_atime(t);
        inode.set_mtime(t);
        self.write_inode_raw(n, &inode)?;

        debug!(inode = n, ?itype, "allocated inode");
        Ok(n)
    }

    /// Return inode `n` to the free list, in the dirty state.
    ///
    /// The inode must be in use, of legal type, and unnamed by any
    /// directory (`refcount == 0`). Inode 0 (the root directory) can
    /// never be freed.
    pub fn free_inode(&mut self, n: u32) -> Result<()> {
        if n == 0 || n >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!(
                "inode {n} out of the freeable range"
            )));
        }
        check_itable_metadata(self.superblock())?;

        let mut inode = self.read_inode_raw(n)?;
        if !inode.is_in_use() {
            return Err(FsError::InodeNotInUse { inode: n });
        }
        if inode.refcount != 0 {
            let (block, _) = self.inode_location(n);
            return Err(FsError::Corruption {
                block: u64::from(block),
                detail: format!("inode {n} freed with refcount {}", inode.refcount),
            });
        }

        // Append at the tail; the time fields become list links.
        inode.mode |= rufs_ondisk::MODE_FREE;
        inode.set_next(NULL_INODE);
        let old_tail = self.superblock().itail;
        if old_tail == NULL_INODE {
            self.sb_mut().ihead = n;
            inode.set_prev(NULL_INODE);
        } else {
            inode.set_prev(old_tail);
        }
        self.write_inode_raw(n, &inode)?;

        if old_tail != NULL_INODE {
            let mut tail = self.read_inode_raw(old_tail)?;
            tail.set_next(n);
            self.write_inode_raw(old_tail, &tail)?;
        }

        let sb = self.sb_mut();
        sb.itail = n;
        sb.ifree += 1;
        self.persist_superblock()?;

        debug!(inode = n, "freed inode");
        Ok(())
    }

    // ── Data-cluster allocation ─────────────────────────────────────────

    /// Allocate a free data cluster and associate it to `n_inode`.
    ///
    /// Consumes the retrieval cache, replenishing it from the on-disk
    /// list when exhausted. A cluster found dirty (its `stat` still names
    /// the previous owner) is purged through the previous owner's
    /// reference list before reuse.
    pub fn alloc_data_cluster(&mut self, n_inode: u32) -> Result<u32> {
        if n_inode >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!(
                "inode {n_inode} out of range"
            )));
        }
        if self.superblock().dzone_free == 0 {
            return Err(FsError::NoSpace);
        }
        if !self.read_inode_raw(n_inode)?.is_in_use() {
            return Err(FsError::InodeNotInUse { inode: n_inode });
        }

        if self.superblock().retrieval.idx as usize == DZONE_CACHE_SIZE {
            self.replenish()?;
        }

        let slot = self.superblock().retrieval.idx as usize;
        let logical = self.superblock().retrieval.refs[slot];
        // The cache must hand out a plausible, detached cluster.
        if logical == NULL_CLUSTER || logical == 0 || logical >= self.superblock().dzone_total {
            return Err(FsError::ClusterStateMismatch {
                cluster: logical,
                detail: "retrieval cache slot holds an illegal reference",
            });
        }
        let mut cluster = self.read_cluster(logical)?;
        if !cluster.is_detached() {
            return Err(FsError::ClusterStateMismatch {
                cluster: logical,
                detail: "cached cluster still carries free-list links",
            });
        }

        {
            let sb = self.sb_mut();
            sb.dzone_free -= 1;
            sb.retrieval.idx += 1;
        }
        self.persist_superblock()?;

        // Lazy cleaning: a previous owner that never cleaned leaves its
        // inode number behind in `stat`.
        if cluster.stat != NULL_INODE {
            self.clean_data_cluster(cluster.stat, logical)?;
            cluster = self.read_cluster(logical)?;
        }

        cluster.stat = n_inode;
        cluster.prev = NULL_CLUSTER;
        cluster.next = NULL_CLUSTER;
        self.write_cluster(logical, &cluster)?;

        debug!(cluster = logical, inode = n_inode, "allocated data cluster");
        Ok(logical)
    }

    /// Return cluster `n` to the free population, in the dirty state.
    ///
    /// The header links are nulled but `stat` keeps the owner: cleaning
    /// is deferred to the next allocation of this cluster. Cluster 0
    /// (the root directory's) can never be freed.
    pub fn free_data_cluster(&mut self, n: u32) -> Result<()> {
        if n == 0 || n >= self.superblock().dzone_total {
            return Err(FsError::InvalidArgument(format!(
                "cluster {n} out of the freeable range"
            )));
        }
        if self.cluster_in_free_store(n)? {
            return Err(FsError::InvalidArgument(format!(
                "cluster {n} is already in a free structure"
            )));
        }

        if self.superblock().insertion.idx as usize == DZONE_CACHE_SIZE {
            self.deplete()?;
        }

        let mut cluster = self.read_cluster(n)?;
        cluster.prev = NULL_CLUSTER;
        cluster.next = NULL_CLUSTER;
        self.write_cluster(n, &cluster)?;

        let sb = self.sb_mut();
        let slot = sb.insertion.idx as usize;
        sb.insertion.refs[slot] = n;
        sb.insertion.idx += 1;
        sb.dzone_free += 1;
        self.persist_superblock()?;

        debug!(cluster = n, "freed data cluster");
        Ok(())
    }

    /// Whether cluster `n` currently sits in any free structure: one of
    /// the front caches, or the on-disk list (non-null links, or the
    /// single-node-list shape where head and tail coincide).
    pub(crate) fn cluster_in_free_store(&self, n: u32) -> Result<bool> {
        let sb = self.superblock();
        let r = &sb.retrieval;
        if r.refs[r.idx as usize..].contains(&n) {
            return Ok(true);
        }
        let i = &sb.insertion;
        if i.refs[..i.idx as usize].contains(&n) {
            return Ok(true);
        }
        if sb.dhead == n {
            return Ok(true);
        }
        let cluster = self.read_cluster(n)?;
        Ok(cluster.prev != NULL_CLUSTER || cluster.next != NULL_CLUSTER)
    }

    // ── Cache maintenance ───────────────────────────────────────────────

    /// Refill the retrieval cache from the head of the on-disk list.
    ///
    /// Pops nodes head-first, patching each new head's `prev`; when the
    /// list runs dry with slots still unfilled and the insertion cache
    /// holds entries, drains the insertion cache onto the list mid-loop
    /// and keeps popping. Staged numbers land back-to-front so the
    /// consumption order matches the list order.
    fn replenish(&mut self) -> Result<()> {
        if self.superblock().dzone_free == 0 {
            return Err(FsError::NoSpace);
        }
        if self.superblock().dhead == NULL_CLUSTER {
            self.deplete()?;
        }

        let empty_slots = self.superblock().retrieval.idx as usize;
        let mut staged: Vec<u32> = Vec::with_capacity(empty_slots);

        while staged.len() < empty_slots && self.superblock().dhead != NULL_CLUSTER {
            let head = self.superblock().dhead;
            let mut cur = self.read_cluster(head)?;

            if cur.next != NULL_CLUSTER {
                let mut next = self.read_cluster(cur.next)?;
                next.prev = NULL_CLUSTER;
                self.write_cluster(cur.next, &next)?;
            }

            staged.push(head);
            self.sb_mut().dhead = cur.next;
            cur.prev = NULL_CLUSTER;
            cur.next = NULL_CLUSTER;
            self.write_cluster(head, &cur)?;

            if self.superblock().dhead == NULL_CLUSTER {
                self.sb_mut().dtail = NULL_CLUSTER;
                if staged.len() < empty_slots && self.superblock().insertion.idx > 0 {
                    self.deplete()?;
                }
            }
        }

        if staged.is_empty() {
            return Err(FsError::Corruption {
                block: 0,
                detail: "free-cluster count disagrees with the free structures".into(),
            });
        }

        let mut idx = self.superblock().retrieval.idx as usize;
        for &c in staged.iter().rev() {
            idx -= 1;
            self.sb_mut().retrieval.refs[idx] = c;
        }
        self.sb_mut().retrieval.idx = idx as u32;
        self.persist_superblock()?;

        debug!(staged = staged.len(), "replenished retrieval cache");
        Ok(())
    }

    /// Drain the insertion cache onto the tail of the on-disk list.
    ///
    /// An empty cache is a no-op, not an error. An empty list is seeded
    /// with the first entry as both head and tail.
    fn deplete(&mut self) -> Result<()> {
        let filled = self.superblock().insertion.idx as usize;
        if filled == 0 {
            return Ok(());
        }

        let mut index = 0usize;
        if self.superblock().dhead == NULL_CLUSTER {
            let first = self.superblock().insertion.refs[0];
            let sb = self.sb_mut();
            sb.dhead = first;
            sb.dtail = first;
            index = 1;
        }

        while index < filled {
            let entry = self.superblock().insertion.refs[index];
            let tail = self.superblock().dtail;

            let mut tail_cluster = self.read_cluster(tail)?;
            tail_cluster.next = entry;
            self.write_cluster(tail, &tail_cluster)?;

            let mut entry_cluster = self.read_cluster(entry)?;
            entry_cluster.prev = tail;
            entry_cluster.next = NULL_CLUSTER;
            self.write_cluster(entry, &entry_cluster)?;

            self.sb_mut().dtail = entry;
            index += 1;
        }

        self.sb_mut().insertion.idx = 0;
        self.persist_superblock()?;

        debug!(drained = filled, "depleted insertion cache");
        Ok(())
    }
}

/// Quick sanity of the superblock's inode-table metadata before the
/// free-inode list is touched.
fn check_itable_metadata(sb: &SuperBlock) -> Result<()> {
    let bad = if sb.ifree > sb.itotal {
        true
    } else if sb.ifree == 0 {
        sb.ihead != NULL_INODE || sb.itail != NULL_INODE
    } else {
        sb.ihead >= sb.itotal || sb.itail >= sb.itotal
    };
    if bad {
        return Err(FsError::Corruption {
            block: 0,
            detail: format!(
                "inode-table metadata inconsistent: ifree={} ihead={} itail={} itotal={}",
                sb.ifree, sb.ihead, sb.itail, sb.itotal
            ),
        });
    }
    Ok(())
}
