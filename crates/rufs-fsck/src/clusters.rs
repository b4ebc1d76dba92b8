//! Data-zone validators: front-cache integrity, a full zone scan that
//! classifies every cluster and re-derives the conservation invariant,
//! and an independent walk of the on-disk free-cluster list.
//!
//! The list-walk loop bound is the free-cluster count. (The historical
//! checker bounded this walk with the free-inode count — a copy-paste
//! slip; the cluster population is the one that limits this list.)

use crate::{cluster_bits, CheckError, Checker};
use rufs_block::ByteDevice;
use rufs_types::{DZONE_CACHE_SIZE, NULL_CLUSTER, NULL_INODE};
use std::collections::HashSet;

impl<D: ByteDevice> Checker<D> {
    /// Both front caches: indices in range, every filled slot naming a
    /// distinct, in-range, detached cluster; retrieval entries must
    /// additionally be clean, ready to hand out.
    pub fn check_cluster_caches(&mut self) -> Result<(), CheckError> {
        self.ensure_status_tables();
        let sb = self.superblock().clone();
        let cap = DZONE_CACHE_SIZE as u32;

        if sb.retrieval.idx > cap {
            return Err(CheckError::RetrievalIndexOutOfRange {
                idx: sb.retrieval.idx,
            });
        }
        if sb.insertion.idx > cap {
            return Err(CheckError::InsertionIndexOutOfRange {
                idx: sb.insertion.idx,
            });
        }

        let mut seen: HashSet<u32> = HashSet::new();
        let retrieval = &sb.retrieval.refs[sb.retrieval.idx as usize..];
        let insertion = &sb.insertion.refs[..sb.insertion.idx as usize];

        for (slots, must_be_clean) in [(retrieval, true), (insertion, false)] {
            for &value in slots {
                if value == NULL_CLUSTER || value == 0 || value >= sb.dzone_total {
                    return Err(CheckError::BadCacheReference { value });
                }
                if !seen.insert(value) {
                    return Err(CheckError::DuplicateCacheReference { cluster: value });
                }
                let cluster = self.read_cluster(value)?;
                if !cluster.is_detached() {
                    return Err(CheckError::CachedClusterLinked { cluster: value });
                }
                if must_be_clean && cluster.stat != NULL_INODE {
                    return Err(CheckError::CachedClusterDirty { cluster: value });
                }
                self.cluster_status[value as usize] |= cluster_bits::CACHED;
            }
        }
        Ok(())
    }

    /// Classify every cluster as in-list, free-clean, or other
    /// (free-dirty and allocated clusters are indistinguishable without
    /// the reference scan), verifying list head/tail markers and link
    /// ranges, then cross-check conservation:
    /// `dzone_free == retrieval filled + list length + insertion used`.
    ///
    /// A one-node list has both links null and is recognized through the
    /// superblock's coinciding head and tail.
    pub fn check_data_zone(&mut self) -> Result<(), CheckError> {
        self.ensure_status_tables();
        let sb = self.superblock().clone();
        let single_node = sb.dhead != NULL_CLUSTER && sb.dhead == sb.dtail;

        let mut list_count = 0u32;
        let mut orphans = 0u32;
        let mut head_found = NULL_CLUSTER;
        let mut tail_found = NULL_CLUSTER;

        for c in 0..sb.dzone_total {
            let cluster = self.read_cluster(c)?;
            let in_list = cluster.prev != NULL_CLUSTER
                || cluster.next != NULL_CLUSTER
                || (single_node && sb.dhead == c);

            if in_list {
                list_count += 1;
                self.cluster_status[c as usize] |= cluster_bits::IN_LIST;

                if cluster.prev == NULL_CLUSTER {
                    if head_found != NULL_CLUSTER || sb.dhead != c {
                        return Err(CheckError::ClusterHeadMismatch {
                            found: c,
                            expected: sb.dhead,
                        });
                    }
                    head_found = c;
                } else if cluster.prev >= sb.dzone_total {
                    self.cluster_status[c as usize] |= cluster_bits::BAD_LINK;
                    return Err(CheckError::BadClusterLink {
                        cluster: c,
                        link: cluster.prev,
                    });
                }

                if cluster.next == NULL_CLUSTER {
                    if tail_found != NULL_CLUSTER || sb.dtail != c {
                        return Err(CheckError::ClusterTailMismatch {
                            found: c,
                            expected: sb.dtail,
                        });
                    }
                    tail_found = c;
                } else if cluster.next >= sb.dzone_total {
                    self.cluster_status[c as usize] |= cluster_bits::BAD_LINK;
                    return Err(CheckError::BadClusterLink {
                        cluster: c,
                        link: cluster.next,
                    });
                }
            } else if cluster.stat == NULL_INODE {
                // Detached and clean: legal only inside a front cache.
                if self.cluster_status[c as usize] & cluster_bits::CACHED == 0 {
                    orphans += 1;
                }
                self.cluster_status[c as usize] |= cluster_bits::FREE_CLEAN;
            }
        }

        if sb.dhead != NULL_CLUSTER && head_found == NULL_CLUSTER {
            return Err(CheckError::ClusterHeadMismatch {
                found: NULL_CLUSTER,
                expected: sb.dhead,
            });
        }
        if sb.dtail != NULL_CLUSTER && tail_found == NULL_CLUSTER {
            return Err(CheckError::ClusterTailMismatch {
                found: NULL_CLUSTER,
                expected: sb.dtail,
            });
        }
        if orphans != 0 {
            return Err(CheckError::OrphanedFreeClusters { count: orphans });
        }

        let derived = (DZONE_CACHE_SIZE as u32 - sb.retrieval.idx)
            + list_count
            + sb.insertion.idx;
        if sb.dzone_free != derived {
            return Err(CheckError::FreeClusterMismatch {
                recorded: sb.dzone_free,
                derived,
            });
        }
        Ok(())
    }

    /// Follow `next` from the list head: `prev` continuity at each hop,
    /// termination within the free-cluster count, and the final node
    /// must be the recorded tail.
    pub fn check_cluster_list(&mut self) -> Result<(), CheckError> {
        self.ensure_status_tables();
        let sb = self.superblock().clone();
        if sb.dhead == NULL_CLUSTER {
            if sb.dtail != NULL_CLUSTER {
                return Err(CheckError::ClusterTailMismatch {
                    found: NULL_CLUSTER,
                    expected: sb.dtail,
                });
            }
            return Ok(());
        }

        let bound = sb.dzone_free;
        let mut prev = NULL_CLUSTER;
        let mut cur = sb.dhead;
        let mut walked = 0u32;

        while cur != NULL_CLUSTER {
            if cur >= sb.dzone_total {
                return Err(CheckError::BadClusterLink {
                    cluster: prev,
                    link: cur,
                });
            }
            let cluster = self.read_cluster(cur)?;
            walked += 1;
            if walked > bound {
                return Err(CheckError::ClusterListLoop { bound });
            }
            if cluster.prev != prev {
                return Err(CheckError::ClusterListBroken {
                    cluster: cur,
                    found: cluster.prev,
                    expected: prev,
                });
            }
            prev = cur;
            cur = cluster.next;
        }

        if prev != sb.dtail {
            return Err(CheckError::ClusterTailMismatch {
                found: prev,
                expected: sb.dtail,
            });
        }
        Ok(())
    }
}
