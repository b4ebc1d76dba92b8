//! Inode-table validators: a full table scan re-deriving the free-list
//! endpoints and population, then an independent walk of the list
//! itself checking linkage and termination.

use crate::{inode_bits, CheckError, Checker};
use rufs_block::ByteDevice;
use rufs_types::NULL_INODE;

impl<D: ByteDevice> Checker<D> {
    /// Scan every inode: free inodes must carry representable list
    /// links, exactly one must look like the head and one like the tail
    /// (matching the superblock), and the free population must match
    /// `ifree`.
    pub fn check_inode_table(&mut self) -> Result<(), CheckError> {
        self.ensure_status_tables();
        let itotal = self.superblock().itotal;
        let ihead = self.superblock().ihead;
        let itail = self.superblock().itail;

        let mut counted = 0u32;
        let mut head_found = NULL_INODE;
        let mut tail_found = NULL_INODE;

        for n in 0..itotal {
            let inode = self.read_inode(n)?;
            if !inode.is_free() {
                self.inode_status[n as usize] |= inode_bits::IN_USE;
                continue;
            }
            self.inode_status[n as usize] |= inode_bits::FREE;
            counted += 1;

            if inode.prev() == NULL_INODE {
                if head_found != NULL_INODE || ihead != n {
                    return Err(CheckError::InodeHeadMismatch {
                        found: n,
                        expected: ihead,
                    });
                }
                head_found = n;
            } else if inode.prev() >= itotal {
                return Err(CheckError::BadInodeLink {
                    inode: n,
                    link: inode.prev(),
                });
            }

            if inode.next() == NULL_INODE {
                if tail_found != NULL_INODE || itail != n {
                    return Err(CheckError::InodeTailMismatch {
                        found: n,
                        expected: itail,
                    });
                }
                tail_found = n;
            } else if inode.next() >= itotal {
                return Err(CheckError::BadInodeLink {
                    inode: n,
                    link: inode.next(),
                });
            }
        }

        if counted != self.superblock().ifree {
            return Err(CheckError::FreeInodeMismatch {
                counted,
                recorded: self.superblock().ifree,
            });
        }
        if counted > 0 {
            if head_found == NULL_INODE {
                return Err(CheckError::InodeHeadMismatch {
                    found: NULL_INODE,
                    expected: ihead,
                });
            }
            if tail_found == NULL_INODE {
                return Err(CheckError::InodeTailMismatch {
                    found: NULL_INODE,
                    expected: itail,
                });
            }
        }
        Ok(())
    }

    /// Follow `next` from the head: every node must be free, `prev` must
    /// name the node just visited, and walking past `ifree` nodes means
    /// the list loops.
    pub fn check_inode_list(&mut self) -> Result<(), CheckError> {
        self.ensure_status_tables();
        let ifree = self.superblock().ifree;
        if ifree == 0 {
            return Ok(());
        }

        let mut prev = NULL_INODE;
        let mut cur = self.superblock().ihead;
        let mut walked = 0u32;

        while cur != NULL_INODE {
            let inode = self.read_inode(cur)?;
            if !inode.is_free() {
                return Err(CheckError::ListNodeNotFree { inode: cur });
            }
            walked += 1;
            if walked > ifree {
                return Err(CheckError::InodeListLoop { bound: ifree });
            }
            if inode.prev() != prev {
                return Err(CheckError::InodeListBroken {
                    inode: cur,
                    found: inode.prev(),
                    expected: prev,
                });
            }
            self.inode_status[cur as usize] |= inode_bits::ON_LIST;
            prev = cur;
            cur = inode.next();
        }

        if walked != ifree {
            return Err(CheckError::FreeInodeMismatch {
                counted: walked,
                recorded: ifree,
            });
        }
        if prev != self.superblock().itail {
            return Err(CheckError::InodeTailMismatch {
                found: prev,
                expected: self.superblock().itail,
            });
        }
        Ok(())
    }
}
