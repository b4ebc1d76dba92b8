#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` trait (pread/pwrite semantics), a file-backed
//! implementation, an in-memory implementation for tests and tooling, and
//! `BlockIo`, the block/cluster-granularity wrapper the filesystem and the
//! checker address storage through.
//!
//! The model is synchronous and write-through: one write is one write.
//! Callers persist metadata immediately after every structural mutation;
//! nothing here batches or delays.

use parking_lot::Mutex;
use rufs_error::{FsError, Result};
use rufs_types::{BLOCKS_PER_CLUSTER, BLOCK_SIZE, CLUSTER_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O.
pub trait ByteDevice {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` needs no shared seek position, so reads
/// and writes take `&self`.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Whether the device was opened writable.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FsError::PermissionDenied);
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device for tests and image construction.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
    len: u64,
}

impl MemByteDevice {
    /// A zero-filled device of `nblocks` blocks.
    #[must_use]
    pub fn new(nblocks: u32) -> Self {
        let len = nblocks as usize * BLOCK_SIZE;
        Self {
            bytes: Mutex::new(vec![0u8; len]),
            len: len as u64,
        }
    }

    /// Snapshot the full device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let bytes = self.bytes.lock();
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| FsError::InvalidArgument("I/O range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(FsError::InvalidArgument(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── Block/cluster wrapper ───────────────────────────────────────────────────

/// Block- and cluster-granularity addressing over a byte device.
///
/// Physical block numbers address `BLOCK_SIZE` units from the start of
/// the device; a cluster read/write spans `BLOCKS_PER_CLUSTER` blocks
/// starting at the given physical block number.
#[derive(Debug)]
pub struct BlockIo<D: ByteDevice> {
    dev: D,
    nblocks: u32,
}

impl<D: ByteDevice> BlockIo<D> {
    /// Wrap a device; its size must be a whole number of blocks.
    pub fn new(dev: D) -> Result<Self> {
        let len = dev.len_bytes();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(FsError::Format(format!(
                "device size {len} is not a multiple of the block size"
            )));
        }
        let nblocks = u32::try_from(len / BLOCK_SIZE as u64)
            .map_err(|_| FsError::Format("device exceeds the addressable block range".into()))?;
        Ok(Self { dev, nblocks })
    }

    /// Total number of physical blocks.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.nblocks
    }

    /// Borrow the underlying device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Read one physical block.
    pub fn read_block(&self, n: u32) -> Result<Vec<u8>> {
        if n >= self.nblocks {
            return Err(FsError::InvalidArgument(format!(
                "block {n} out of range (device has {} blocks)",
                self.nblocks
            )));
        }
        trace!(block = n, "read block");
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.dev
            .read_exact_at(u64::from(n) * BLOCK_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write one physical block.
    pub fn write_block(&self, n: u32, data: &[u8]) -> Result<()> {
        if n >= self.nblocks {
            return Err(FsError::InvalidArgument(format!(
                "block {n} out of range (device has {} blocks)",
                self.nblocks
            )));
        }
        if data.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "block write of {} bytes, expected {BLOCK_SIZE}",
                data.len()
            )));
        }
        trace!(block = n, "write block");
        self.dev.write_all_at(u64::from(n) * BLOCK_SIZE as u64, data)
    }

    /// Read one cluster starting at physical block `n`.
    pub fn read_cluster_at(&self, n: u32) -> Result<Vec<u8>> {
        if n.saturating_add(BLOCKS_PER_CLUSTER) > self.nblocks {
            return Err(FsError::InvalidArgument(format!(
                "cluster at block {n} out of range (device has {} blocks)",
                self.nblocks
            )));
        }
        let mut buf = vec![0u8; CLUSTER_SIZE];
        self.dev
            .read_exact_at(u64::from(n) * BLOCK_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write one cluster starting at physical block `n`.
    pub fn write_cluster_at(&self, n: u32, data: &[u8]) -> Result<()> {
        if n.saturating_add(BLOCKS_PER_CLUSTER) > self.nblocks {
            return Err(FsError::InvalidArgument(format!(
                "cluster at block {n} out of range (device has {} blocks)",
                self.nblocks
            )));
        }
        if data.len() != CLUSTER_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "cluster write of {} bytes, expected {CLUSTER_SIZE}",
                data.len()
            )));
        }
        self.dev.write_all_at(u64::from(n) * BLOCK_SIZE as u64, data)
    }

    /// Flush the underlying device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}
