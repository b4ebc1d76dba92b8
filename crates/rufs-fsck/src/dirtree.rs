//! Directory-tree walk: reachability and loop detection.
//!
//! Depth-first traversal from the root inode over an explicit worklist
//! of (parent, child) pairs, with a visited set keyed by inode number
//! for O(1) loop detection. Directory content is resolved through the
//! checker's own raw reference reads, never the live resolver. Every
//! directory must open with "." naming itself and ".." naming its
//! parent; after the walk, every in-use directory inode must have been
//! visited exactly once.

use crate::{inode_bits, CheckError, Checker};
use rufs_block::ByteDevice;
use rufs_ondisk::{DataCluster, DirEntry, Inode, InodeType};
use rufs_types::{
    DIRENTS_PER_CLUSTER, DIRENT_SIZE, DOUBLE_INDIRECT_BASE, NULL_CLUSTER, NULL_INODE, N_DIRECT,
    REFS_PER_CLUSTER,
};
use std::collections::HashSet;

impl<D: ByteDevice> Checker<D> {
    /// Walk the tree from inode 0; loops, malformed "."/".." entries,
    /// entries naming dead inodes, and unreachable directories are all
    /// violations.
    pub fn check_directory_tree(&mut self) -> Result<(), CheckError> {
        self.ensure_status_tables();
        let itotal = self.superblock().itotal;

        let mut visited: HashSet<u32> = HashSet::new();
        let mut stack: Vec<(u32, u32)> = vec![(0, 0)];

        while let Some((parent, ino)) = stack.pop() {
            if ino >= itotal {
                return Err(CheckError::EntryNotInUse { inode: ino });
            }
            let inode = self.read_inode(ino)?;
            if !inode.is_in_use() {
                return Err(CheckError::EntryNotInUse { inode: ino });
            }
            self.inode_status[ino as usize] |= inode_bits::REACHABLE;
            if inode.itype() != Some(InodeType::Directory) {
                continue;
            }
            if !visited.insert(ino) {
                self.inode_status[ino as usize] |= inode_bits::LOOP;
                return Err(CheckError::DirectoryLoop { inode: ino });
            }
            self.inode_status[ino as usize] |= inode_bits::VISITED;

            let entry_clusters = inode.size / (DIRENTS_PER_CLUSTER * DIRENT_SIZE as u32);
            for k in 0..entry_clusters {
                let Some(cluster) = self.read_dir_cluster(ino, &inode, k)? else {
                    continue;
                };
                let first = if k == 0 {
                    let dot = cluster.dir_entry(0);
                    if dot.name_str() != "." || dot.n_inode != ino {
                        return Err(CheckError::BadDotEntry { inode: ino });
                    }
                    let dotdot = cluster.dir_entry(1);
                    if dotdot.name_str() != ".." || dotdot.n_inode != parent {
                        return Err(CheckError::BadDotDotEntry { inode: ino });
                    }
                    2
                } else {
                    0
                };
                for slot in first..DIRENTS_PER_CLUSTER {
                    let entry: DirEntry = cluster.dir_entry(slot);
                    if entry.n_inode == NULL_INODE || entry.name_str().is_empty() {
                        continue;
                    }
                    stack.push((ino, entry.n_inode));
                }
            }
        }

        let mut unreachable = 0u32;
        for n in 0..itotal {
            let inode = self.read_inode(n)?;
            if inode.is_in_use()
                && inode.itype() == Some(InodeType::Directory)
                && !visited.contains(&n)
            {
                self.inode_status[n as usize] |= inode_bits::UNREACHABLE;
                unreachable += 1;
            }
        }
        if unreachable != 0 {
            return Err(CheckError::UnreachableDirectories {
                count: unreachable,
            });
        }
        Ok(())
    }

    /// Resolve one entry cluster of a directory through raw reference
    /// reads. `None` when the index is unpopulated.
    fn read_dir_cluster(
        &self,
        ino: u32,
        inode: &Inode,
        index: u32,
    ) -> Result<Option<DataCluster>, CheckError> {
        let dzone_total = self.superblock().dzone_total;
        let logical = if index < N_DIRECT {
            inode.direct[index as usize]
        } else if index < DOUBLE_INDIRECT_BASE {
            if inode.i1 == NULL_CLUSTER {
                return Ok(None);
            }
            if inode.i1 >= dzone_total {
                return Err(CheckError::BadClusterReference {
                    inode: ino,
                    cluster: inode.i1,
                });
            }
            self.read_cluster(inode.i1)?.get_ref(index - N_DIRECT)
        } else {
            if inode.i2 == NULL_CLUSTER {
                return Ok(None);
            }
            if inode.i2 >= dzone_total {
                return Err(CheckError::BadClusterReference {
                    inode: ino,
                    cluster: inode.i2,
                });
            }
            let rel = index - DOUBLE_INDIRECT_BASE;
            let l2 = self
                .read_cluster(inode.i2)?
                .get_ref(rel / REFS_PER_CLUSTER);
            if l2 == NULL_CLUSTER {
                return Ok(None);
            }
            if l2 >= dzone_total {
                return Err(CheckError::BadClusterReference {
                    inode: ino,
                    cluster: l2,
                });
            }
            self.read_cluster(l2)?.get_ref(rel % REFS_PER_CLUSTER)
        };

        if logical == NULL_CLUSTER {
            return Ok(None);
        }
        if logical >= dzone_total {
            return Err(CheckError::BadClusterReference {
                inode: ino,
                cluster: logical,
            });
        }
        Ok(Some(self.read_cluster(logical)?))
    }
}
