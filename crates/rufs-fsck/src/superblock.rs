//! Superblock validators: header identity, inode-table metadata, and
//! data-zone metadata cross-checked against the device geometry.

use crate::{CheckError, Checker};
use rufs_block::ByteDevice;
use rufs_types::{
    BLOCKS_PER_CLUSTER, INODES_PER_BLOCK, MAGIC_NUMBER, NULL_INODE, PROPERLY_UNMOUNTED,
    VERSION_NUMBER,
};

impl<D: ByteDevice> Checker<D> {
    /// Magic, version, NUL-terminated name, proper-unmount flag, and the
    /// recorded block count against the device itself.
    pub fn check_superblock_header(&mut self) -> Result<(), CheckError> {
        let sb = self.superblock();
        if sb.magic != MAGIC_NUMBER {
            return Err(CheckError::BadMagic { found: sb.magic });
        }
        if sb.version != VERSION_NUMBER {
            return Err(CheckError::BadVersion { found: sb.version });
        }
        if !sb.name.contains(&0) {
            return Err(CheckError::BadVolumeName);
        }
        if sb.mstat != PROPERLY_UNMOUNTED {
            return Err(CheckError::NotProperlyUnmounted);
        }
        let actual = self.block_count();
        if sb.ntotal != actual {
            return Err(CheckError::BadBlockCount {
                recorded: sb.ntotal,
                actual,
            });
        }
        Ok(())
    }

    /// The inode table starts right after the superblock, its block
    /// count matches the inode count, and the free-list endpoints are
    /// representable.
    pub fn check_inode_metadata(&mut self) -> Result<(), CheckError> {
        let sb = self.superblock();
        if sb.itable_start != 1 {
            return Err(CheckError::BadInodeTableStart {
                found: sb.itable_start,
            });
        }
        if sb.itable_size.checked_mul(INODES_PER_BLOCK) != Some(sb.itotal) {
            return Err(CheckError::BadInodeTableSize {
                size: sb.itable_size,
                itotal: sb.itotal,
            });
        }
        // Inode 0 is the root directory, permanently in use.
        if sb.itotal == 0 || sb.ifree > sb.itotal - 1 {
            return Err(CheckError::BadFreeInodeCount {
                ifree: sb.ifree,
                itotal: sb.itotal,
            });
        }
        if sb.ifree == 0 {
            if sb.ihead != NULL_INODE {
                return Err(CheckError::BadInodeHead { head: sb.ihead });
            }
            if sb.itail != NULL_INODE {
                return Err(CheckError::BadInodeTail { tail: sb.itail });
            }
        } else {
            if sb.ihead >= sb.itotal {
                return Err(CheckError::BadInodeHead { head: sb.ihead });
            }
            if sb.itail >= sb.itotal {
                return Err(CheckError::BadInodeTail { tail: sb.itail });
            }
        }
        Ok(())
    }

    /// Zone start and cluster total re-derived from the device size and
    /// the inode-table footprint; the free count is bounded by the
    /// permanently-allocated root cluster.
    pub fn check_dzone_metadata(&mut self) -> Result<(), CheckError> {
        let sb = self.superblock();
        let expected_start = sb.itable_start + sb.itable_size;
        if sb.dzone_start != expected_start {
            return Err(CheckError::BadDataZoneStart {
                found: sb.dzone_start,
                expected: expected_start,
            });
        }
        let expected_total = self
            .block_count()
            .checked_sub(1 + sb.itable_size)
            .map_or(0, |blocks| blocks / BLOCKS_PER_CLUSTER);
        if sb.dzone_total != expected_total {
            return Err(CheckError::BadDataZoneTotal {
                found: sb.dzone_total,
                expected: expected_total,
            });
        }
        if sb.dzone_total == 0 || sb.dzone_free > sb.dzone_total - 1 {
            return Err(CheckError::BadFreeClusterCount {
                free: sb.dzone_free,
                total: sb.dzone_total,
            });
        }
        Ok(())
    }
}
