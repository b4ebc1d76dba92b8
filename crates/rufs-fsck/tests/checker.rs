//! Checker behavior over real images: a fresh format must pass every
//! validator, a worked filesystem must still pass, and targeted
//! corruption of single fields must trip the matching validator.

use rufs_block::{ByteDevice, MemByteDevice};
use rufs_fs::{format, ClusterOp, FormatOptions, Fs};
use rufs_fsck::{CheckError, Checker, STEP_NAMES};
use rufs_ondisk::{DataCluster, Inode, InodeType, SuperBlock};
use rufs_types::{
    BLOCKS_PER_CLUSTER, BLOCK_SIZE, CLUSTER_SIZE, INODES_PER_BLOCK, INODE_SIZE, NULL_CLUSTER,
};

const NBLOCKS: u32 = 512;

fn fresh_image() -> Vec<u8> {
    let fs = format(
        MemByteDevice::new(NBLOCKS),
        &FormatOptions {
            name: "fscktest".into(),
            itotal: None,
            zero: false,
        },
    )
    .expect("format");
    fs.block_io().device().snapshot()
}

fn device_from(image: &[u8]) -> MemByteDevice {
    let dev = MemByteDevice::new(NBLOCKS);
    dev.write_all_at(0, image).unwrap();
    dev
}

fn fs_from(image: &[u8]) -> Fs<MemByteDevice> {
    Fs::open(device_from(image), rufs_fs::Credentials::default()).expect("open")
}

fn check(image: &[u8]) -> (Vec<&'static str>, Option<(&'static str, CheckError)>) {
    let mut checker = Checker::open(device_from(image)).expect("open checker");
    let outcome = checker.run();
    (outcome.passed, outcome.failure)
}

fn read_superblock(image: &[u8]) -> SuperBlock {
    SuperBlock::from_bytes(&image[..BLOCK_SIZE]).unwrap()
}

fn write_superblock(image: &mut [u8], sb: &SuperBlock) {
    image[..BLOCK_SIZE].copy_from_slice(&sb.to_bytes());
}

fn read_inode(image: &[u8], sb: &SuperBlock, n: u32) -> Inode {
    let block = (sb.itable_start + n / INODES_PER_BLOCK) as usize;
    let offset = block * BLOCK_SIZE + (n % INODES_PER_BLOCK) as usize * INODE_SIZE;
    Inode::from_bytes(&image[offset..offset + INODE_SIZE], 0).unwrap()
}

fn write_inode(image: &mut [u8], sb: &SuperBlock, n: u32, inode: &Inode) {
    let block = (sb.itable_start + n / INODES_PER_BLOCK) as usize;
    let offset = block * BLOCK_SIZE + (n % INODES_PER_BLOCK) as usize * INODE_SIZE;
    inode
        .to_bytes(&mut image[offset..offset + INODE_SIZE], 0)
        .unwrap();
}

fn cluster_offset(sb: &SuperBlock, c: u32) -> usize {
    (sb.dzone_start + c * BLOCKS_PER_CLUSTER) as usize * BLOCK_SIZE
}

fn read_data_cluster(image: &[u8], sb: &SuperBlock, c: u32) -> DataCluster {
    let off = cluster_offset(sb, c);
    DataCluster::from_bytes(&image[off..off + CLUSTER_SIZE]).unwrap()
}

fn write_data_cluster(image: &mut [u8], sb: &SuperBlock, c: u32, cluster: &DataCluster) {
    let off = cluster_offset(sb, c);
    image[off..off + CLUSTER_SIZE].copy_from_slice(&cluster.to_bytes());
}

// ── Clean images ────────────────────────────────────────────────────────────

#[test]
fn fresh_format_passes_every_check() {
    let image = fresh_image();
    let (passed, failure) = check(&image);
    assert!(failure.is_none(), "failure: {failure:?}");
    assert_eq!(passed, STEP_NAMES.to_vec());

    let sb = read_superblock(&image);
    assert_eq!(sb.dzone_free, sb.dzone_total - 1);
}

#[test]
fn worked_filesystem_still_passes() {
    let mut fs = format(
        MemByteDevice::new(NBLOCKS),
        &FormatOptions {
            name: "worked".into(),
            itotal: None,
            zero: false,
        },
    )
    .unwrap();

    // Build a small tree with real content, then delete part of it.
    let d = fs.alloc_inode(InodeType::Directory).unwrap();
    fs.add_dir_entry(0, "dir", d).unwrap();
    fs.set_permissions(d, 0o755).unwrap();
    let f1 = fs.alloc_inode(InodeType::File).unwrap();
    fs.add_dir_entry(d, "one", f1).unwrap();
    let f2 = fs.alloc_inode(InodeType::File).unwrap();
    fs.add_dir_entry(0, "two", f2).unwrap();

    let body = vec![3u8; rufs_types::CLUSTER_BODY_SIZE];
    for idx in 0..=rufs_types::N_DIRECT {
        fs.write_file_cluster(f1, idx, &body).unwrap();
    }
    fs.write_file_cluster(f2, 0, &body).unwrap();
    fs.handle_file_clusters(f1, 2, ClusterOp::FreeClean).unwrap();
    fs.remove_dir_entry(0, "two").unwrap();

    let image = fs.block_io().device().snapshot();
    let (_, failure) = check(&image);
    assert!(failure.is_none(), "failure: {failure:?}");
}

// ── Superblock corruption ───────────────────────────────────────────────────

#[test]
fn bad_magic_is_reported_first() {
    let mut image = fresh_image();
    let mut sb = read_superblock(&image);
    sb.magic = 0x1234;
    write_superblock(&mut image, &sb);

    let (passed, failure) = check(&image);
    assert!(passed.is_empty());
    let (step, err) = failure.unwrap();
    assert_eq!(step, "superblock header");
    assert!(matches!(err, CheckError::BadMagic { found: 0x1234 }));
}

#[test]
fn wrong_free_counts_are_reported() {
    let mut image = fresh_image();
    let mut sb = read_superblock(&image);
    sb.ifree -= 1;
    write_superblock(&mut image, &sb);
    let (_, failure) = check(&image);
    assert!(matches!(
        failure,
        Some(("inode table", CheckError::FreeInodeMismatch { .. }))
    ));

    let mut image = fresh_image();
    let mut sb = read_superblock(&image);
    sb.dzone_free -= 1;
    write_superblock(&mut image, &sb);
    let (_, failure) = check(&image);
    assert!(matches!(
        failure,
        Some(("data zone", CheckError::FreeClusterMismatch { .. }))
    ));
}

#[test]
fn wrong_zone_geometry_is_reported() {
    let mut image = fresh_image();
    let mut sb = read_superblock(&image);
    sb.dzone_total += 1;
    write_superblock(&mut image, &sb);
    let (_, failure) = check(&image);
    assert!(matches!(
        failure,
        Some(("data-zone metadata", CheckError::BadDataZoneTotal { .. }))
    ));
}

// ── Inode list corruption ───────────────────────────────────────────────────

#[test]
fn inode_list_cycle_is_detected() {
    let mut image = fresh_image();
    let sb = read_superblock(&image);
    // Point a mid-list inode's next back at an earlier node.
    let mut inode = read_inode(&image, &sb, 5);
    assert!(inode.is_free());
    inode.set_next(2);
    write_inode(&mut image, &sb, 5, &inode);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "inode free list");
    assert!(
        matches!(err, CheckError::InodeListBroken { .. } | CheckError::InodeListLoop { .. }),
        "got {err:?}"
    );
}

#[test]
fn in_use_inode_on_the_free_list_is_detected() {
    let mut image = fresh_image();
    let sb = read_superblock(&image);
    let mut inode = read_inode(&image, &sb, 3);
    // Strip the free flag but keep the list links intact.
    inode.mode = rufs_ondisk::MODE_FILE | 0o644;
    write_inode(&mut image, &sb, 3, &inode);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    // The table scan notices the free count first.
    assert!(
        matches!(
            err,
            CheckError::FreeInodeMismatch { .. } | CheckError::ListNodeNotFree { .. }
        ),
        "step {step}, got {err:?}"
    );
}

#[test]
fn broken_prev_link_is_detected() {
    let mut image = fresh_image();
    let sb = read_superblock(&image);
    let mut inode = read_inode(&image, &sb, 4);
    inode.set_prev(1); // should be 3
    write_inode(&mut image, &sb, 4, &inode);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "inode free list");
    assert!(matches!(err, CheckError::InodeListBroken { inode: 4, .. }));
}

// ── Cache and data-zone corruption ──────────────────────────────────────────

#[test]
fn dirty_retrieval_cache_entry_is_detected() {
    let mut image = fresh_image();
    let sb = read_superblock(&image);
    let cached = sb.retrieval.refs[sb.retrieval.idx as usize];
    let mut cluster = read_data_cluster(&image, &sb, cached);
    cluster.stat = 1; // pretend a previous owner never cleaned it
    write_data_cluster(&mut image, &sb, cached, &cluster);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "cluster caches");
    assert!(matches!(err, CheckError::CachedClusterDirty { .. }));
}

#[test]
fn duplicate_cache_entry_is_detected() {
    let mut image = fresh_image();
    let mut sb = read_superblock(&image);
    let idx = sb.retrieval.idx as usize;
    let dup = sb.retrieval.refs[idx];
    sb.retrieval.refs[idx + 1] = dup;
    write_superblock(&mut image, &sb);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "cluster caches");
    assert!(matches!(
        err,
        CheckError::DuplicateCacheReference { cluster } if cluster == dup
    ));
}

#[test]
fn cluster_list_cycle_is_detected() {
    let mut image = fresh_image();
    let sb = read_superblock(&image);
    // The list spans [cache+1, dzone_total); loop a later node back.
    let mid = sb.dhead + 5;
    let mut cluster = read_data_cluster(&image, &sb, mid);
    cluster.next = sb.dhead + 1;
    write_data_cluster(&mut image, &sb, mid, &cluster);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert!(
        matches!(
            err,
            CheckError::ClusterListBroken { .. }
                | CheckError::ClusterListLoop { .. }
                | CheckError::ClusterTailMismatch { .. }
        ),
        "step {step}, got {err:?}"
    );
}

#[test]
fn orphaned_free_clean_cluster_is_detected() {
    let mut fs = fs_from(&fresh_image());
    // Allocate a cluster, then scrub its owner mark by hand: detached,
    // clean, but in no free structure.
    let f = fs.alloc_inode(InodeType::File).unwrap();
    let c = fs.alloc_data_cluster(f).unwrap();
    let mut image = fs.block_io().device().snapshot();
    let sb = read_superblock(&image);
    let mut cluster = read_data_cluster(&image, &sb, c);
    cluster.stat = rufs_types::NULL_INODE;
    write_data_cluster(&mut image, &sb, c, &cluster);
    // Drop the inode's claim so the reference scan stays quiet.
    let mut inode = read_inode(&image, &sb, f);
    inode.direct = [NULL_CLUSTER; rufs_types::N_DIRECT as usize];
    inode.clucount = 0;
    write_inode(&mut image, &sb, f, &inode);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "data zone");
    assert!(matches!(err, CheckError::OrphanedFreeClusters { count: 1 }));
}

// ── Reference corruption ────────────────────────────────────────────────────

#[test]
fn double_reference_is_accumulated_and_reported() {
    let mut fs = fs_from(&fresh_image());
    let a = fs.alloc_inode(InodeType::File).unwrap();
    let b = fs.alloc_inode(InodeType::File).unwrap();
    let ca = fs.handle_file_cluster(a, 0, ClusterOp::Alloc).unwrap().unwrap();
    fs.handle_file_cluster(b, 0, ClusterOp::Alloc).unwrap();

    let mut image = fs.block_io().device().snapshot();
    let sb = read_superblock(&image);
    // Point b's second slot at a's cluster.
    let mut inode = read_inode(&image, &sb, b);
    inode.direct[1] = ca;
    inode.clucount += 1;
    write_inode(&mut image, &sb, b, &inode);

    let mut checker = Checker::open(device_from(&image)).unwrap();
    let outcome = checker.run();
    let (step, err) = outcome.failure.unwrap();
    assert_eq!(step, "inode-to-cluster references");
    assert!(matches!(err, CheckError::MultiplyReferenced { count: 1 }));
    // The accumulated map names the colliding cluster and inode.
    assert_eq!(checker.double_refs, vec![(ca, b)]);
    let dump = checker.status_dump();
    assert!(dump.contains("double references"));
}

#[test]
fn out_of_range_reference_is_reported() {
    let mut fs = fs_from(&fresh_image());
    let a = fs.alloc_inode(InodeType::File).unwrap();
    let mut image = fs.block_io().device().snapshot();
    let sb = read_superblock(&image);
    let mut inode = read_inode(&image, &sb, a);
    inode.direct[0] = sb.dzone_total + 7;
    write_inode(&mut image, &sb, a, &inode);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "inode-to-cluster references");
    assert!(matches!(err, CheckError::BadClusterReference { inode, .. } if inode == a));
}

// ── Directory tree corruption ───────────────────────────────────────────────

#[test]
fn directory_loop_is_detected() {
    let mut fs = fs_from(&fresh_image());
    let a = fs.alloc_inode(InodeType::Directory).unwrap();
    fs.add_dir_entry(0, "a", a).unwrap();
    fs.set_permissions(a, 0o755).unwrap();
    let b = fs.alloc_inode(InodeType::Directory).unwrap();
    fs.add_dir_entry(a, "b", b).unwrap();

    let mut image = fs.block_io().device().snapshot();
    let sb = read_superblock(&image);
    // Splice a back-edge entry b/back -> a directly into b's cluster.
    let b_inode = read_inode(&image, &sb, b);
    let content = b_inode.direct[0];
    let mut cluster = read_data_cluster(&image, &sb, content);
    cluster.set_dir_entry(2, &rufs_ondisk::DirEntry::new("back", a).unwrap());
    write_data_cluster(&mut image, &sb, content, &cluster);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "directory tree");
    assert!(matches!(err, CheckError::DirectoryLoop { inode } if inode == a));
}

#[test]
fn broken_dot_entries_are_detected() {
    let mut fs = fs_from(&fresh_image());
    let a = fs.alloc_inode(InodeType::Directory).unwrap();
    fs.add_dir_entry(0, "a", a).unwrap();

    let mut image = fs.block_io().device().snapshot();
    let sb = read_superblock(&image);
    let a_inode = read_inode(&image, &sb, a);
    let content = a_inode.direct[0];
    let mut cluster = read_data_cluster(&image, &sb, content);
    // ".." now names the wrong parent.
    cluster.set_dir_entry(1, &rufs_ondisk::DirEntry::new("..", a).unwrap());
    write_data_cluster(&mut image, &sb, content, &cluster);

    let (_, failure) = check(&image);
    let (_, err) = failure.unwrap();
    assert!(matches!(err, CheckError::BadDotDotEntry { inode } if inode == a));
}

#[test]
fn unreachable_directory_is_detected() {
    let mut fs = fs_from(&fresh_image());
    let a = fs.alloc_inode(InodeType::Directory).unwrap();
    fs.add_dir_entry(0, "a", a).unwrap();

    let mut image = fs.block_io().device().snapshot();
    let sb = read_superblock(&image);
    // Erase the naming entry from the root, leaving a in use.
    let root = read_inode(&image, &sb, 0);
    let content = root.direct[0];
    let mut cluster = read_data_cluster(&image, &sb, content);
    cluster.set_dir_entry(2, &rufs_ondisk::DirEntry::empty());
    write_data_cluster(&mut image, &sb, content, &cluster);

    let (_, failure) = check(&image);
    let (step, err) = failure.unwrap();
    assert_eq!(step, "directory tree");
    assert!(matches!(err, CheckError::UnreachableDirectories { count: 1 }));
}
