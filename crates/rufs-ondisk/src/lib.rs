#![forbid(unsafe_code)]
//! On-disk structure codecs.
//!
//! Each structure decodes from and encodes to its exact on-disk byte
//! layout through the little-endian field codec in `rufs-types`. No
//! `unsafe`, no transmutes: every field is read and written explicitly,
//! so a layout change is a visible diff here and nowhere else.
//!
//! The free-list links threaded through inodes and clusters reuse storage
//! slots that mean something else while the record is live (`vd1`/`vd2`
//! are atime/mtime in use, next/prev when free). The dual meaning is
//! expressed as named accessor pairs over the same slot instead of raw
//! field pokes, selected by the record's free/in-use state.

use rufs_types::{
    read_fixed, read_le_u32, trim_nul_padded, write_le_u32, ParseError, BLOCK_SIZE,
    CLUSTER_BODY_SIZE, CLUSTER_HEADER_SIZE, CLUSTER_SIZE, DIRENTS_PER_CLUSTER, DIRENT_SIZE,
    DZONE_CACHE_SIZE, MAX_NAME, NULL_CLUSTER, NULL_INODE, N_DIRECT, VOLUME_NAME_SIZE,
};

// ── Inode mode bits ─────────────────────────────────────────────────────────

/// Type mask within `mode` (POSIX `S_IFMT` analogue).
pub const MODE_TYPE_MASK: u32 = 0o170_000;

/// Regular file type bits.
pub const MODE_FILE: u32 = 0o100_000;

/// Directory type bits.
pub const MODE_DIR: u32 = 0o040_000;

/// Symbolic link type bits.
pub const MODE_SYMLINK: u32 = 0o120_000;

/// Free flag; outside the type mask so a freed inode keeps its last type.
pub const MODE_FREE: u32 = 0o1_000_000;

/// Permission bits mask (rwxrwxrwx).
pub const MODE_PERM_MASK: u32 = 0o777;

/// Legal file types an in-use inode may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    File,
    Directory,
    Symlink,
}

impl InodeType {
    /// The `mode` type bits for this type.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::File => MODE_FILE,
            Self::Directory => MODE_DIR,
            Self::Symlink => MODE_SYMLINK,
        }
    }

    /// Classify raw mode bits; `None` for illegal type values.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & MODE_TYPE_MASK {
            MODE_FILE => Some(Self::File),
            MODE_DIR => Some(Self::Directory),
            MODE_SYMLINK => Some(Self::Symlink),
            _ => None,
        }
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// One inode-table record.
///
/// `vd1`/`vd2` are raw storage; use the accessor pairs below according to
/// the record's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub mode: u32,
    pub refcount: u32,
    pub owner: u32,
    pub group: u32,
    pub size: u32,
    pub clucount: u32,
    vd1: u32,
    vd2: u32,
    pub direct: [u32; N_DIRECT as usize],
    pub i1: u32,
    pub i2: u32,
}

impl Inode {
    /// A fully reset free inode, not yet linked into the free list.
    #[must_use]
    pub fn empty_free() -> Self {
        Self {
            mode: MODE_FREE,
            refcount: 0,
            owner: 0,
            group: 0,
            size: 0,
            clucount: 0,
            vd1: NULL_INODE,
            vd2: NULL_INODE,
            direct: [NULL_CLUSTER; N_DIRECT as usize],
            i1: NULL_CLUSTER,
            i2: NULL_CLUSTER,
        }
    }

    /// Whether the free flag is set.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode & MODE_FREE != 0
    }

    /// In use with a legal file type.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        !self.is_free() && InodeType::from_mode(self.mode).is_some()
    }

    /// The file type, when the mode carries a legal one.
    #[must_use]
    pub fn itype(&self) -> Option<InodeType> {
        InodeType::from_mode(self.mode)
    }

    /// A free inode with no lingering references or sizes: safe to hand
    /// out without cleaning.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.size == 0
            && self.clucount == 0
            && self.i1 == NULL_CLUSTER
            && self.i2 == NULL_CLUSTER
            && self.direct.iter().all(|&d| d == NULL_CLUSTER)
    }

    /// Free-list successor (free inodes only).
    #[must_use]
    pub fn next(&self) -> u32 {
        self.vd1
    }

    pub fn set_next(&mut self, n: u32) {
        self.vd1 = n;
    }

    /// Free-list predecessor (free inodes only).
    #[must_use]
    pub fn prev(&self) -> u32 {
        self.vd2
    }

    pub fn set_prev(&mut self, n: u32) {
        self.vd2 = n;
    }

    /// Time of last access (in-use inodes only).
    #[must_use]
    pub fn atime(&self) -> u32 {
        self.vd1
    }

    pub fn set_atime(&mut self, t: u32) {
        self.vd1 = t;
    }

    /// Time of last modification (in-use inodes only).
    #[must_use]
    pub fn mtime(&self) -> u32 {
        self.vd2
    }

    pub fn set_mtime(&mut self, t: u32) {
        self.vd2 = t;
    }

    /// Decode one inode record at `offset`.
    pub fn from_bytes(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        let mut direct = [NULL_CLUSTER; N_DIRECT as usize];
        for (k, slot) in direct.iter_mut().enumerate() {
            *slot = read_le_u32(buf, offset + 32 + k * 4)?;
        }
        Ok(Self {
            mode: read_le_u32(buf, offset)?,
            refcount: read_le_u32(buf, offset + 4)?,
            owner: read_le_u32(buf, offset + 8)?,
            group: read_le_u32(buf, offset + 12)?,
            size: read_le_u32(buf, offset + 16)?,
            clucount: read_le_u32(buf, offset + 20)?,
            vd1: read_le_u32(buf, offset + 24)?,
            vd2: read_le_u32(buf, offset + 28)?,
            direct,
            i1: read_le_u32(buf, offset + 56)?,
            i2: read_le_u32(buf, offset + 60)?,
        })
    }

    /// Encode this record at `offset`.
    pub fn to_bytes(&self, buf: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u32(buf, offset, self.mode)?;
        write_le_u32(buf, offset + 4, self.refcount)?;
        write_le_u32(buf, offset + 8, self.owner)?;
        write_le_u32(buf, offset + 12, self.group)?;
        write_le_u32(buf, offset + 16, self.size)?;
        write_le_u32(buf, offset + 20, self.clucount)?;
        write_le_u32(buf, offset + 24, self.vd1)?;
        write_le_u32(buf, offset + 28, self.vd2)?;
        for (k, &d) in self.direct.iter().enumerate() {
            write_le_u32(buf, offset + 32 + k * 4, d)?;
        }
        write_le_u32(buf, offset + 56, self.i1)?;
        write_le_u32(buf, offset + 60, self.i2)?;
        Ok(())
    }
}

// ── Directory entry ─────────────────────────────────────────────────────────

/// One fixed-size directory entry: NUL-padded name plus inode number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: [u8; MAX_NAME + 1],
    pub n_inode: u32,
}

impl DirEntry {
    /// An empty slot.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            name: [0u8; MAX_NAME + 1],
            n_inode: NULL_INODE,
        }
    }

    /// Build an entry; the name must fit the on-disk field.
    pub fn new(name: &str, n_inode: u32) -> Result<Self, ParseError> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_NAME {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: format!("{} bytes exceeds the {MAX_NAME}-byte limit", bytes.len()),
            });
        }
        let mut entry = Self::empty();
        entry.name[..bytes.len()].copy_from_slice(bytes);
        entry.n_inode = n_inode;
        Ok(entry)
    }

    /// Decoded name, up to the first NUL.
    #[must_use]
    pub fn name_str(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// A slot is empty when it names no inode.
    #[must_use]
    pub fn is_empty_slot(&self) -> bool {
        self.n_inode == NULL_INODE
    }

    /// Decode entry `slot` from an entry-array buffer (a cluster body).
    pub fn decode(buf: &[u8], slot: u32) -> Result<Self, ParseError> {
        let offset = slot as usize * DIRENT_SIZE;
        Ok(Self {
            name: read_fixed::<{ MAX_NAME + 1 }>(buf, offset)?,
            n_inode: read_le_u32(buf, offset + MAX_NAME + 1)?,
        })
    }

    /// Encode this entry at `slot` of an entry-array buffer.
    pub fn encode(&self, buf: &mut [u8], slot: u32) -> Result<(), ParseError> {
        let offset = slot as usize * DIRENT_SIZE;
        let got = buf.len();
        let dst = buf
            .get_mut(offset..offset + MAX_NAME + 1)
            .ok_or(ParseError::InsufficientData {
                need: MAX_NAME + 1,
                offset,
                got,
            })?;
        dst.copy_from_slice(&self.name);
        write_le_u32(buf, offset + MAX_NAME + 1, self.n_inode)
    }
}

// ── Data cluster ────────────────────────────────────────────────────────────

/// One data cluster: free-list header plus an untyped body.
///
/// The body is raw file bytes, a directory-entry array, or a reference
/// array; the typed views below decode on demand.
#[derive(Clone, PartialEq, Eq)]
pub struct DataCluster {
    pub prev: u32,
    pub next: u32,
    pub stat: u32,
    body: Box<[u8; CLUSTER_BODY_SIZE]>,
}

impl std::fmt::Debug for DataCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCluster")
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("stat", &self.stat)
            .finish_non_exhaustive()
    }
}

impl DataCluster {
    /// A detached cluster (no list links, no owner, zero body).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            prev: NULL_CLUSTER,
            next: NULL_CLUSTER,
            stat: NULL_INODE,
            body: Box::new([0u8; CLUSTER_BODY_SIZE]),
        }
    }

    /// Raw body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body[..]
    }

    /// Mutable raw body bytes.
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.body[..]
    }

    /// Overwrite the body; `data` must be exactly the body size.
    pub fn set_body(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if data.len() != CLUSTER_BODY_SIZE {
            return Err(ParseError::InvalidField {
                field: "body",
                reason: format!("expected {CLUSTER_BODY_SIZE} bytes, got {}", data.len()),
            });
        }
        self.body.copy_from_slice(data);
        Ok(())
    }

    /// Zero the information content, leaving the header untouched.
    pub fn zero_body(&mut self) {
        self.body.fill(0);
    }

    /// Both list links null (the shape of a cluster in a front cache or
    /// allocated to a file).
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.prev == NULL_CLUSTER && self.next == NULL_CLUSTER
    }

    // ── Reference-array view ────────────────────────────────────────────

    /// Read reference slot `idx` (`idx < REFS_PER_CLUSTER`).
    #[must_use]
    pub fn get_ref(&self, idx: u32) -> u32 {
        let off = idx as usize * 4;
        u32::from_le_bytes([
            self.body[off],
            self.body[off + 1],
            self.body[off + 2],
            self.body[off + 3],
        ])
    }

    /// Write reference slot `idx`.
    pub fn set_ref(&mut self, idx: u32, value: u32) {
        let off = idx as usize * 4;
        self.body[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Fill every reference slot with `NULL_CLUSTER` (a fresh indirection
    /// cluster).
    pub fn fill_refs_null(&mut self) {
        for chunk in self.body.chunks_exact_mut(4) {
            chunk.copy_from_slice(&NULL_CLUSTER.to_le_bytes());
        }
    }

    /// Full linear occupancy scan: true when every reference slot is null.
    ///
    /// Shared by all three indirection levels; emptiness is only ever
    /// decided by scanning the whole array.
    #[must_use]
    pub fn refs_all_null(&self) -> bool {
        self.body
            .chunks_exact(4)
            .all(|c| c == NULL_CLUSTER.to_le_bytes())
    }

    // ── Directory-entry view ────────────────────────────────────────────

    /// Decode directory entry `idx` (`idx < DIRENTS_PER_CLUSTER`).
    #[must_use]
    pub fn dir_entry(&self, idx: u32) -> DirEntry {
        DirEntry::decode(&self.body[..], idx).expect("entry index within cluster body")
    }

    /// Encode directory entry `idx`.
    pub fn set_dir_entry(&mut self, idx: u32, entry: &DirEntry) {
        entry
            .encode(&mut self.body[..], idx)
            .expect("entry index within cluster body");
    }

    /// Fill the body with empty directory slots.
    pub fn fill_dir_empty(&mut self) {
        let empty = DirEntry::empty();
        for idx in 0..DIRENTS_PER_CLUSTER {
            self.set_dir_entry(idx, &empty);
        }
    }

    // ── Codec ───────────────────────────────────────────────────────────

    /// Decode a whole cluster.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() != CLUSTER_SIZE {
            return Err(ParseError::InsufficientData {
                need: CLUSTER_SIZE,
                offset: 0,
                got: buf.len(),
            });
        }
        let mut cluster = Self::empty();
        cluster.prev = read_le_u32(buf, 0)?;
        cluster.next = read_le_u32(buf, 4)?;
        cluster.stat = read_le_u32(buf, 8)?;
        cluster.body.copy_from_slice(&buf[CLUSTER_HEADER_SIZE..]);
        Ok(cluster)
    }

    /// Encode a whole cluster.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CLUSTER_SIZE];
        write_le_u32(&mut buf, 0, self.prev).expect("fixed buffer");
        write_le_u32(&mut buf, 4, self.next).expect("fixed buffer");
        write_le_u32(&mut buf, 8, self.stat).expect("fixed buffer");
        buf[CLUSTER_HEADER_SIZE..].copy_from_slice(&self.body[..]);
        buf
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Fixed-capacity front cache of free-cluster references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCache {
    /// Retrieval: index of the next slot to consume (capacity == empty).
    /// Insertion: count of filled slots (zero == empty).
    pub idx: u32,
    pub refs: [u32; DZONE_CACHE_SIZE],
}

impl RefCache {
    /// An empty retrieval cache.
    #[must_use]
    pub fn empty_retrieval() -> Self {
        Self {
            idx: DZONE_CACHE_SIZE as u32,
            refs: [NULL_CLUSTER; DZONE_CACHE_SIZE],
        }
    }

    /// An empty insertion cache.
    #[must_use]
    pub fn empty_insertion() -> Self {
        Self {
            idx: 0,
            refs: [NULL_CLUSTER; DZONE_CACHE_SIZE],
        }
    }
}

/// The filesystem superblock, block 0, padded to one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    // Header
    pub magic: u32,
    pub version: u32,
    pub name: [u8; VOLUME_NAME_SIZE],
    pub ntotal: u32,
    pub mstat: u32,

    // Inode table metadata
    pub itable_start: u32,
    pub itable_size: u32,
    pub itotal: u32,
    pub ifree: u32,
    pub ihead: u32,
    pub itail: u32,

    // Data zone metadata
    pub dzone_start: u32,
    pub dzone_total: u32,
    pub dzone_free: u32,
    pub retrieval: RefCache,
    pub insertion: RefCache,
    pub dhead: u32,
    pub dtail: u32,
}

const SB_RETRIEVAL_OFF: usize = 76;
const SB_INSERTION_OFF: usize = SB_RETRIEVAL_OFF + 4 + 4 * DZONE_CACHE_SIZE;
const SB_DHEAD_OFF: usize = SB_INSERTION_OFF + 4 + 4 * DZONE_CACHE_SIZE;

impl SuperBlock {
    /// Decoded volume name.
    #[must_use]
    pub fn name_str(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// Set the volume name, truncating to the on-disk field (one byte is
    /// always left for the NUL terminator).
    pub fn set_name(&mut self, name: &str) {
        self.name = [0u8; VOLUME_NAME_SIZE];
        let bytes = name.as_bytes();
        let len = bytes.len().min(VOLUME_NAME_SIZE - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    /// Decode the superblock from block 0 contents.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < BLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                need: BLOCK_SIZE,
                offset: 0,
                got: buf.len(),
            });
        }
        let read_cache = |base: usize| -> Result<RefCache, ParseError> {
            let idx = read_le_u32(buf, base)?;
            let mut refs = [NULL_CLUSTER; DZONE_CACHE_SIZE];
            for (k, slot) in refs.iter_mut().enumerate() {
                *slot = read_le_u32(buf, base + 4 + k * 4)?;
            }
            Ok(RefCache { idx, refs })
        };
        Ok(Self {
            magic: read_le_u32(buf, 0)?,
            version: read_le_u32(buf, 4)?,
            name: read_fixed::<VOLUME_NAME_SIZE>(buf, 8)?,
            ntotal: read_le_u32(buf, 32)?,
            mstat: read_le_u32(buf, 36)?,
            itable_start: read_le_u32(buf, 40)?,
            itable_size: read_le_u32(buf, 44)?,
            itotal: read_le_u32(buf, 48)?,
            ifree: read_le_u32(buf, 52)?,
            ihead: read_le_u32(buf, 56)?,
            itail: read_le_u32(buf, 60)?,
            dzone_start: read_le_u32(buf, 64)?,
            dzone_total: read_le_u32(buf, 68)?,
            dzone_free: read_le_u32(buf, 72)?,
            retrieval: read_cache(SB_RETRIEVAL_OFF)?,
            insertion: read_cache(SB_INSERTION_OFF)?,
            dhead: read_le_u32(buf, SB_DHEAD_OFF)?,
            dtail: read_le_u32(buf, SB_DHEAD_OFF + 4)?,
        })
    }

    /// Encode the superblock into one block, reserved area zeroed.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        write_le_u32(&mut buf, 0, self.magic).expect("fixed buffer");
        write_le_u32(&mut buf, 4, self.version).expect("fixed buffer");
        buf[8..8 + VOLUME_NAME_SIZE].copy_from_slice(&self.name);
        write_le_u32(&mut buf, 32, self.ntotal).expect("fixed buffer");
        write_le_u32(&mut buf, 36, self.mstat).expect("fixed buffer");
        write_le_u32(&mut buf, 40, self.itable_start).expect("fixed buffer");
        write_le_u32(&mut buf, 44, self.itable_size).expect("fixed buffer");
        write_le_u32(&mut buf, 48, self.itotal).expect("fixed buffer");
        write_le_u32(&mut buf, 52, self.ifree).expect("fixed buffer");
        write_le_u32(&mut buf, 56, self.ihead).expect("fixed buffer");
        write_le_u32(&mut buf, 60, self.itail).expect("fixed buffer");
        write_le_u32(&mut buf, 64, self.dzone_start).expect("fixed buffer");
        write_le_u32(&mut buf, 68, self.dzone_total).expect("fixed buffer");
        write_le_u32(&mut buf, 72, self.dzone_free).expect("fixed buffer");
        let write_cache = |buf: &mut [u8], base: usize, cache: &RefCache| {
            write_le_u32(buf, base, cache.idx).expect("fixed buffer");
            for (k, &r) in cache.refs.iter().enumerate() {
                write_le_u32(buf, base + 4 + k * 4, r).expect("fixed buffer");
            }
        };
        write_cache(&mut buf, SB_RETRIEVAL_OFF, &self.retrieval);
        write_cache(&mut buf, SB_INSERTION_OFF, &self.insertion);
        write_le_u32(&mut buf, SB_DHEAD_OFF, self.dhead).expect("fixed buffer");
        write_le_u32(&mut buf, SB_DHEAD_OFF + 4, self.dtail).expect("fixed buffer");
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rufs_types::{INODE_SIZE, MAGIC_NUMBER, PROPERLY_UNMOUNTED, VERSION_NUMBER};

    fn sample_superblock() -> SuperBlock {
        let mut sb = SuperBlock {
            magic: MAGIC_NUMBER,
            version: VERSION_NUMBER,
            name: [0u8; VOLUME_NAME_SIZE],
            ntotal: 512,
            mstat: PROPERLY_UNMOUNTED,
            itable_start: 1,
            itable_size: 11,
            itotal: 88,
            ifree: 87,
            ihead: 1,
            itail: 87,
            dzone_start: 12,
            dzone_total: 125,
            dzone_free: 124,
            retrieval: RefCache::empty_retrieval(),
            insertion: RefCache::empty_insertion(),
            dhead: 1,
            dtail: 124,
        };
        sb.set_name("testvol");
        sb
    }

    #[test]
    fn superblock_codec_round_trip() {
        let sb = sample_superblock();
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        let decoded = SuperBlock::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, sb);
        assert_eq!(decoded.name_str(), "testvol");
    }

    #[test]
    fn superblock_layout_fits_one_block() {
        // dtail ends the fixed region; the rest is reserved padding.
        assert!(SB_DHEAD_OFF + 8 <= BLOCK_SIZE);
    }

    #[test]
    fn volume_name_truncates_keeping_nul() {
        let mut sb = sample_superblock();
        sb.set_name("a-very-long-volume-name-beyond-the-field");
        assert_eq!(sb.name[VOLUME_NAME_SIZE - 1], 0);
        assert_eq!(sb.name_str().len(), VOLUME_NAME_SIZE - 1);
    }

    #[test]
    fn inode_codec_and_views() {
        let mut inode = Inode::empty_free();
        assert!(inode.is_free());
        assert!(inode.is_clean());
        assert!(!inode.is_in_use());

        inode.mode = MODE_DIR | 0o755;
        inode.refcount = 2;
        inode.size = 2016;
        inode.clucount = 1;
        inode.direct[0] = 0;
        inode.set_atime(1000);
        inode.set_mtime(1000);
        assert!(inode.is_in_use());
        assert_eq!(inode.itype(), Some(InodeType::Directory));
        assert!(!inode.is_clean());

        let mut block = vec![0u8; BLOCK_SIZE];
        inode.to_bytes(&mut block, 2 * INODE_SIZE).unwrap();
        let decoded = Inode::from_bytes(&block, 2 * INODE_SIZE).unwrap();
        assert_eq!(decoded, inode);
        assert_eq!(decoded.atime(), 1000);
    }

    #[test]
    fn free_inode_links_share_time_slots() {
        let mut inode = Inode::empty_free();
        inode.set_next(7);
        inode.set_prev(3);
        assert_eq!(inode.next(), 7);
        assert_eq!(inode.prev(), 3);
        // Same storage, different view.
        assert_eq!(inode.atime(), 7);
        assert_eq!(inode.mtime(), 3);
    }

    #[test]
    fn cluster_ref_view() {
        let mut cluster = DataCluster::empty();
        cluster.fill_refs_null();
        assert!(cluster.refs_all_null());
        cluster.set_ref(0, 42);
        cluster.set_ref(rufs_types::REFS_PER_CLUSTER - 1, 7);
        assert!(!cluster.refs_all_null());
        assert_eq!(cluster.get_ref(0), 42);
        assert_eq!(cluster.get_ref(rufs_types::REFS_PER_CLUSTER - 1), 7);

        let bytes = cluster.to_bytes();
        let decoded = DataCluster::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.get_ref(0), 42);
        assert!(decoded.is_detached());
    }

    #[test]
    fn cluster_dir_view() {
        let mut cluster = DataCluster::empty();
        cluster.fill_dir_empty();
        let dot = DirEntry::new(".", 0).unwrap();
        let dotdot = DirEntry::new("..", 0).unwrap();
        cluster.set_dir_entry(0, &dot);
        cluster.set_dir_entry(1, &dotdot);
        assert_eq!(cluster.dir_entry(0).name_str(), ".");
        assert_eq!(cluster.dir_entry(1).name_str(), "..");
        assert!(cluster.dir_entry(2).is_empty_slot());
    }

    #[test]
    fn dir_entry_name_limit() {
        assert!(DirEntry::new(&"x".repeat(MAX_NAME), 1).is_ok());
        assert!(DirEntry::new(&"x".repeat(MAX_NAME + 1), 1).is_err());
    }
}
