//! Inode-to-cluster reference scan: exactly-one-owner.
//!
//! Walks every in-use inode's direct, single-indirect, and
//! double-indirect references — indirection clusters count as
//! references too — tagging each visited cluster. A cluster visited
//! twice is a double-reference corruption; the scan accumulates the
//! full error map per inode and per cluster before failing, because the
//! whole picture is what makes the postmortem useful.

use crate::{cluster_bits, inode_bits, CheckError, Checker};
use rufs_block::ByteDevice;
use rufs_types::{NULL_CLUSTER, REFS_PER_CLUSTER};

impl<D: ByteDevice> Checker<D> {
    /// Tag every cluster referenced by every in-use inode; report
    /// accumulated double references (or out-of-range references) after
    /// the full scan.
    pub fn check_inode_references(&mut self) -> Result<(), CheckError> {
        self.ensure_status_tables();
        self.double_refs.clear();
        self.bad_refs.clear();

        let itotal = self.superblock().itotal;
        for n in 0..itotal {
            let inode = self.read_inode(n)?;
            if !inode.is_in_use() {
                continue;
            }

            for &c in &inode.direct {
                self.visit_reference(n, c);
            }

            if inode.i1 != NULL_CLUSTER {
                self.visit_reference(n, inode.i1);
                if inode.i1 < self.superblock().dzone_total {
                    let c1 = self.read_cluster(inode.i1)?;
                    for slot in 0..REFS_PER_CLUSTER {
                        self.visit_reference(n, c1.get_ref(slot));
                    }
                }
            }

            if inode.i2 != NULL_CLUSTER {
                self.visit_reference(n, inode.i2);
                if inode.i2 < self.superblock().dzone_total {
                    let c2 = self.read_cluster(inode.i2)?;
                    for ic in 0..REFS_PER_CLUSTER {
                        let l2 = c2.get_ref(ic);
                        if l2 == NULL_CLUSTER {
                            continue;
                        }
                        self.visit_reference(n, l2);
                        if l2 < self.superblock().dzone_total {
                            let cl2 = self.read_cluster(l2)?;
                            for dc in 0..REFS_PER_CLUSTER {
                                self.visit_reference(n, cl2.get_ref(dc));
                            }
                        }
                    }
                }
            }
        }

        if !self.double_refs.is_empty() {
            let mut clusters: Vec<u32> = self.double_refs.iter().map(|&(c, _)| c).collect();
            clusters.sort_unstable();
            clusters.dedup();
            return Err(CheckError::MultiplyReferenced {
                count: clusters.len(),
            });
        }
        if let Some(&(inode, cluster)) = self.bad_refs.first() {
            return Err(CheckError::BadClusterReference { inode, cluster });
        }
        Ok(())
    }

    /// Record one reference from inode `n` to cluster `c`, classifying
    /// instead of failing so the scan sees everything.
    fn visit_reference(&mut self, n: u32, c: u32) {
        if c == NULL_CLUSTER {
            return;
        }
        if c >= self.superblock().dzone_total {
            self.bad_refs.push((n, c));
            return;
        }
        let word = &mut self.cluster_status[c as usize];
        if *word & cluster_bits::REFERENCED != 0 {
            *word |= cluster_bits::DOUBLE_REF;
            self.inode_status[n as usize] |= inode_bits::DOUBLE_REF;
            self.double_refs.push((c, n));
        } else {
            *word |= cluster_bits::REFERENCED;
        }
    }
}
