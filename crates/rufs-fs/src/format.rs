//! The formatting core (mkfs).
//!
//! Lays down the superblock, the inode table, the root directory, and
//! the free-cluster structures on a raw device. The magic number is
//! staged to a provisional value first and set to the real one last, so
//! a crash mid-format leaves an image that can never be mounted.
//!
//! Layout produced: inode 0 in use as the root directory over cluster 0;
//! inodes 1.. chained as the free-inode list; the first free clusters
//! staged directly into the retrieval cache, the rest chained as the
//! on-disk free-cluster list, all clean.

use crate::{now, Credentials, Fs};
use rufs_block::{BlockIo, ByteDevice};
use rufs_error::{FsError, Result};
use rufs_ondisk::{DataCluster, DirEntry, Inode, InodeType, RefCache, SuperBlock, MODE_DIR};
use rufs_types::{
    write_le_u32, BLOCKS_PER_CLUSTER, BLOCK_SIZE, DIRENTS_PER_CLUSTER, DIRENT_SIZE,
    DZONE_CACHE_SIZE, INODES_PER_BLOCK, INODE_SIZE, MAGIC_NUMBER, MAGIC_PROVISIONAL,
    NULL_CLUSTER, NULL_INODE, PROPERLY_UNMOUNTED, VERSION_NUMBER, VOLUME_NAME_SIZE,
};
use tracing::info;

/// Formatting parameters.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Volume name, truncated to the on-disk field.
    pub name: String,
    /// Total inode count; defaults to one inode per eight blocks,
    /// rounded to whole inode-table blocks.
    pub itotal: Option<u32>,
    /// Zero-fill the bodies of all free clusters.
    pub zero: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            name: "rufs".to_owned(),
            itotal: None,
            zero: false,
        }
    }
}

/// Install a filesystem on `dev` and return a handle to it.
pub fn format<D: ByteDevice>(dev: D, opts: &FormatOptions) -> Result<Fs<D>> {
    let io = BlockIo::new(dev)?;
    let ntotal = io.block_count();

    // Geometry: block 0 is the superblock, then the inode table, then
    // whole clusters. The final adjustment grows the inode table to
    // absorb blocks that do not fit a whole cluster.
    let requested = opts.itotal.unwrap_or(ntotal >> 3).max(INODES_PER_BLOCK);
    let iblktotal = requested.div_ceil(INODES_PER_BLOCK);
    if ntotal < 1 + iblktotal + 2 * BLOCKS_PER_CLUSTER {
        return Err(FsError::Format(format!(
            "device of {ntotal} blocks is too small for {requested} inodes"
        )));
    }
    let nclusttotal = (ntotal - 1 - iblktotal) / BLOCKS_PER_CLUSTER;
    let iblktotal = ntotal - 1 - nclusttotal * BLOCKS_PER_CLUSTER;
    let itotal = iblktotal * INODES_PER_BLOCK;
    let dzone_start = 1 + iblktotal;
    let nfree_clusters = nclusttotal - 1;

    info!(
        ntotal,
        itotal, nclusttotal, "formatting device"
    );

    // Free clusters: the first batch is staged straight into the
    // retrieval cache, consumption order matching cluster order; the
    // rest form the on-disk list.
    let cached = (DZONE_CACHE_SIZE as u32).min(nfree_clusters);
    let mut retrieval = RefCache::empty_retrieval();
    for k in 0..cached {
        let slot = DZONE_CACHE_SIZE as u32 - cached + k;
        retrieval.refs[slot as usize] = 1 + k;
    }
    retrieval.idx = DZONE_CACHE_SIZE as u32 - cached;
    let (dhead, dtail) = if nfree_clusters > cached {
        (1 + cached, nclusttotal - 1)
    } else {
        (NULL_CLUSTER, NULL_CLUSTER)
    };

    let mut sb = SuperBlock {
        magic: MAGIC_PROVISIONAL,
        version: VERSION_NUMBER,
        name: [0u8; VOLUME_NAME_SIZE],
        ntotal,
        mstat: PROPERLY_UNMOUNTED,
        itable_start: 1,
        itable_size: iblktotal,
        itotal,
        ifree: itotal - 1,
        ihead: 1,
        itail: itotal - 1,
        dzone_start,
        dzone_total: nclusttotal,
        dzone_free: nfree_clusters,
        retrieval,
        insertion: RefCache::empty_insertion(),
        dhead,
        dtail,
    };
    sb.set_name(&opts.name);
    io.write_block(0, &sb.to_bytes())?;

    fill_inode_table(&io, &sb)?;
    fill_root_cluster(&io, &sb)?;
    fill_free_clusters(&io, &sb, cached, opts.zero)?;

    // Everything in place: the image becomes mountable.
    sb.magic = MAGIC_NUMBER;
    io.write_block(0, &sb.to_bytes())?;
    io.sync()?;

    let fs = Fs::from_parts(io, sb, Credentials::default());
    check_fresh_image(&fs)?;
    Ok(fs)
}

/// Inode 0 in use as the root directory; every other inode free, chained
/// in index order.
fn fill_inode_table<D: ByteDevice>(io: &BlockIo<D>, sb: &SuperBlock) -> Result<()> {
    let t = now();
    for block_index in 0..sb.itable_size {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for slot in 0..INODES_PER_BLOCK {
            let n = block_index * INODES_PER_BLOCK + slot;
            let inode = if n == 0 {
                let mut root = Inode::empty_free();
                root.mode = MODE_DIR | 0o777;
                root.refcount = 2;
                root.size = DIRENTS_PER_CLUSTER * DIRENT_SIZE as u32;
                root.clucount = 1;
                root.direct[0] = 0;
                root.set_atime(t);
                root.set_mtime(t);
                root
            } else {
                let mut free = Inode::empty_free();
                free.set_next(if n == sb.itotal - 1 { NULL_INODE } else { n + 1 });
                free.set_prev(if n == 1 { NULL_INODE } else { n - 1 });
                free
            };
            inode
                .to_bytes(&mut buf, slot as usize * INODE_SIZE)
                .map_err(|e| crate::parse_error(sb.itable_start + block_index, &e))?;
        }
        io.write_block(sb.itable_start + block_index, &buf)?;
    }
    Ok(())
}

/// Cluster 0: the root directory's single content cluster, holding "."
/// and "..", both naming inode 0.
fn fill_root_cluster<D: ByteDevice>(io: &BlockIo<D>, sb: &SuperBlock) -> Result<()> {
    let mut cluster = DataCluster::empty();
    cluster.stat = 0;
    cluster.fill_dir_empty();
    let dot = DirEntry::new(".", 0).map_err(|e| crate::parse_error(sb.dzone_start, &e))?;
    let dotdot = DirEntry::new("..", 0).map_err(|e| crate::parse_error(sb.dzone_start, &e))?;
    cluster.set_dir_entry(0, &dot);
    cluster.set_dir_entry(1, &dotdot);
    io.write_cluster_at(sb.dzone_start, &cluster.to_bytes())
}

/// Headers for every free cluster: the cached batch detached and clean,
/// the remainder chained into the doubly-linked list.
fn fill_free_clusters<D: ByteDevice>(
    io: &BlockIo<D>,
    sb: &SuperBlock,
    cached: u32,
    zero: bool,
) -> Result<()> {
    for c in 1..sb.dzone_total {
        let in_list = c > cached;
        let prev = if !in_list || c == cached + 1 {
            NULL_CLUSTER
        } else {
            c - 1
        };
        let next = if !in_list || c == sb.dzone_total - 1 {
            NULL_CLUSTER
        } else {
            c + 1
        };
        let phys = sb.dzone_start + c * BLOCKS_PER_CLUSTER;

        if zero {
            let mut cluster = DataCluster::empty();
            cluster.prev = prev;
            cluster.next = next;
            io.write_cluster_at(phys, &cluster.to_bytes())?;
        } else {
            // Header-only update keeps whatever bytes the device held.
            let mut head = io.read_block(phys)?;
            write_le_u32(&mut head, 0, prev).map_err(|e| crate::parse_error(phys, &e))?;
            write_le_u32(&mut head, 4, next).map_err(|e| crate::parse_error(phys, &e))?;
            write_le_u32(&mut head, 8, NULL_INODE).map_err(|e| crate::parse_error(phys, &e))?;
            io.write_block(phys, &head)?;
        }
    }
    Ok(())
}

/// Post-format sanity: the root inode and its directory content must
/// already pass the live consistency checks.
fn check_fresh_image<D: ByteDevice>(fs: &Fs<D>) -> Result<()> {
    let root = fs.read_inode_raw(0)?;
    if !root.is_in_use() || root.itype() != Some(InodeType::Directory) {
        return Err(FsError::Corruption {
            block: u64::from(fs.superblock().itable_start),
            detail: "freshly formatted root inode is not a directory in use".into(),
        });
    }
    let cluster = fs.read_cluster(0)?;
    if cluster.dir_entry(0).name_str() != "." || cluster.dir_entry(1).name_str() != ".." {
        return Err(FsError::Corruption {
            block: u64::from(fs.superblock().dzone_start),
            detail: "freshly formatted root directory lacks \".\"/\"..\"".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rufs_block::MemByteDevice;

    fn fmt(nblocks: u32, opts: &FormatOptions) -> Fs<MemByteDevice> {
        format(MemByteDevice::new(nblocks), opts).expect("format")
    }

    #[test]
    fn fresh_image_counters() {
        let fs = fmt(512, &FormatOptions::default());
        let sb = fs.superblock();
        assert_eq!(sb.ntotal, 512);
        assert_eq!(sb.itable_start, 1);
        assert_eq!(sb.dzone_start, sb.itable_start + sb.itable_size);
        assert_eq!(sb.itable_size * INODES_PER_BLOCK, sb.itotal);
        assert_eq!(sb.ifree, sb.itotal - 1);
        assert_eq!(sb.dzone_free, sb.dzone_total - 1);
        // Whole device accounted for.
        assert_eq!(
            1 + sb.itable_size + sb.dzone_total * BLOCKS_PER_CLUSTER,
            sb.ntotal
        );
    }

    #[test]
    fn retrieval_cache_is_pre_filled() {
        let fs = fmt(512, &FormatOptions::default());
        let sb = fs.superblock();
        assert_eq!(sb.retrieval.idx, 0);
        let refs: Vec<u32> = sb.retrieval.refs.to_vec();
        let expect: Vec<u32> = (1..=DZONE_CACHE_SIZE as u32).collect();
        assert_eq!(refs, expect);
        assert_eq!(sb.dhead, DZONE_CACHE_SIZE as u32 + 1);
        assert_eq!(sb.dtail, sb.dzone_total - 1);
        // Cached clusters are detached and clean.
        for c in 1..=DZONE_CACHE_SIZE as u32 {
            let cluster = fs.read_cluster(c).unwrap();
            assert!(cluster.is_detached());
            assert_eq!(cluster.stat, NULL_INODE);
        }
    }

    #[test]
    fn free_list_is_a_well_formed_chain() {
        let fs = fmt(512, &FormatOptions::default());
        let sb = fs.superblock();
        let mut walked = 0u32;
        let mut prev = NULL_CLUSTER;
        let mut cur = sb.dhead;
        while cur != NULL_CLUSTER {
            let cluster = fs.read_cluster(cur).unwrap();
            assert_eq!(cluster.prev, prev);
            assert_eq!(cluster.stat, NULL_INODE);
            walked += 1;
            assert!(walked <= sb.dzone_total);
            prev = cur;
            cur = cluster.next;
        }
        assert_eq!(prev, sb.dtail);
        assert_eq!(
            walked,
            sb.dzone_free - DZONE_CACHE_SIZE as u32,
            "list holds everything not staged in the cache"
        );
    }

    #[test]
    fn inode_list_links_are_in_index_order() {
        let fs = fmt(512, &FormatOptions::default());
        let sb = fs.superblock();
        assert_eq!(sb.ihead, 1);
        assert_eq!(sb.itail, sb.itotal - 1);
        let mut prev = NULL_INODE;
        let mut cur = sb.ihead;
        let mut walked = 0u32;
        while cur != NULL_INODE {
            let inode = fs.read_inode_raw(cur).unwrap();
            assert!(inode.is_free());
            assert_eq!(inode.prev(), prev);
            walked += 1;
            prev = cur;
            cur = inode.next();
        }
        assert_eq!(walked, sb.ifree);
    }

    #[test]
    fn tiny_device_puts_every_free_cluster_in_the_cache() {
        let fs = fmt(64, &FormatOptions::default());
        let sb = fs.superblock();
        assert!(sb.dzone_free <= DZONE_CACHE_SIZE as u32);
        assert_eq!(sb.dhead, NULL_CLUSTER);
        assert_eq!(sb.dtail, NULL_CLUSTER);
        assert_eq!(
            DZONE_CACHE_SIZE as u32 - sb.retrieval.idx,
            sb.dzone_free
        );
    }

    #[test]
    fn too_small_device_is_rejected() {
        let err = format(MemByteDevice::new(8), &FormatOptions::default()).unwrap_err();
        assert!(matches!(err, FsError::Format(_)));
    }

    #[test]
    fn zero_mode_clears_free_cluster_bodies() {
        let dev = MemByteDevice::new(512);
        // Dirty the device first so the zeroing is observable.
        let junk = vec![0xAAu8; 512 * BLOCK_SIZE];
        rufs_block::ByteDevice::write_all_at(&dev, 0, &junk).unwrap();

        let fs = format(
            dev,
            &FormatOptions {
                name: "z".into(),
                itotal: None,
                zero: true,
            },
        )
        .unwrap();
        for c in 1..fs.superblock().dzone_total {
            let cluster = fs.read_cluster(c).unwrap();
            assert!(cluster.body().iter().all(|&b| b == 0), "cluster {c} body");
        }
    }

    #[test]
    fn custom_inode_count_is_honored_in_blocks() {
        let fs = fmt(
            512,
            &FormatOptions {
                name: "i".into(),
                itotal: Some(16),
                zero: false,
            },
        );
        let sb = fs.superblock();
        // 16 inodes fit two table blocks; the final adjustment may grow
        // that to absorb non-cluster remainder blocks.
        assert!(sb.itotal >= 16);
        assert_eq!(sb.itotal % INODES_PER_BLOCK, 0);
    }
}
