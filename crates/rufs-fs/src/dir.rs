//! Directory-entry management.
//!
//! A directory is a file whose clusters hold a fixed-size array of
//! entries; entries 0 and 1 of the first cluster are always "." and
//! "..". An empty slot names no inode. All content access goes through
//! the file-cluster wrappers, so growth and truncation ride on the
//! resolver.

use crate::{Access, ClusterOp, Fs, InodeState};
use rufs_block::ByteDevice;
use rufs_error::{FsError, Result};
use rufs_ondisk::{DirEntry, Inode, InodeType};
use rufs_types::{DIRENTS_PER_CLUSTER, DIRENT_SIZE, MAX_FILE_CLUSTERS, MAX_HARD_LINKS, MAX_NAME};
use tracing::debug;

/// Entry slots per cluster body, in bytes of directory file size.
const CLUSTER_ENTRY_BYTES: u32 = DIRENTS_PER_CLUSTER * DIRENT_SIZE as u32;

/// Outcome of a full directory scan for one name.
#[derive(Debug, Clone, Copy)]
pub struct DirLookup {
    /// The matching entry's inode and entry index, when found.
    pub found: Option<(u32, u32)>,
    /// First empty slot seen, if any.
    pub free_slot: Option<u32>,
    /// Total entry slots the directory currently holds.
    pub end: u32,
}

impl<D: ByteDevice> Fs<D> {
    /// Find the entry named `name` in directory `n_dir`.
    ///
    /// The caller needs execute permission on the directory. Returns the
    /// entry's inode number and its index in the entry array.
    pub fn get_dir_entry_by_name(&mut self, n_dir: u32, name: &str) -> Result<(u32, u32)> {
        validate_entry_name(name)?;
        self.access_granted(n_dir, Access::Execute)?;
        let dir = self.read_dir_inode(n_dir)?;
        let lookup = self.scan_dir(n_dir, &dir, name)?;
        lookup
            .found
            .ok_or_else(|| FsError::NotFound(name.to_owned()))
    }

    /// Add the entry `name -> n_ent` to directory `n_dir`.
    ///
    /// Adding a directory initializes its "."/".." cluster and bumps
    /// both refcounts; growing into a fresh cluster extends the
    /// directory size by one cluster's worth of empty slots.
    pub fn add_dir_entry(&mut self, n_dir: u32, name: &str, n_ent: u32) -> Result<()> {
        validate_entry_name(name)?;
        if n_ent >= self.superblock().itotal {
            return Err(FsError::InvalidArgument(format!(
                "inode {n_ent} out of range"
            )));
        }
        let dir = self.read_dir_inode(n_dir)?;
        let lookup = self.scan_dir(n_dir, &dir, name)?;
        if lookup.found.is_some() {
            return Err(FsError::Exists);
        }
        let target = lookup.free_slot.unwrap_or(lookup.end);
        if target >= DIRENTS_PER_CLUSTER * MAX_FILE_CLUSTERS {
            return Err(FsError::FileTooBig);
        }
        self.access_granted(n_dir, Access::Execute)?;
        self.access_granted(n_dir, Access::Write)?;

        let ent = self.read_inode(n_ent, InodeState::InUse)?;
        if ent.refcount >= MAX_HARD_LINKS {
            return Err(FsError::TooManyLinks);
        }

        // A directory entry brings its own "."/".." cluster and links
        // back to the parent.
        if ent.itype() == Some(InodeType::Directory) {
            if dir.refcount >= MAX_HARD_LINKS {
                return Err(FsError::TooManyLinks);
            }
            let mut body = vec![0u8; CLUSTER_ENTRY_BYTES as usize];
            write_entry(&mut body, 0, &DirEntry::new(".", n_ent).map_err(name_error)?);
            write_entry(&mut body, 1, &DirEntry::new("..", n_dir).map_err(name_error)?);
            for slot in 2..DIRENTS_PER_CLUSTER {
                write_entry(&mut body, slot, &DirEntry::empty());
            }
            self.write_file_cluster(n_ent, 0, &body)?;

            let mut ent = self.read_inode(n_ent, InodeState::InUse)?;
            ent.size = CLUSTER_ENTRY_BYTES;
            ent.refcount += 1;
            self.write_inode(n_ent, &ent, InodeState::InUse)?;

            let mut dir = self.read_inode(n_dir, InodeState::InUse)?;
            dir.refcount += 1;
            self.write_inode(n_dir, &dir, InodeState::InUse)?;
        }

        let cluster_no = target / DIRENTS_PER_CLUSTER;
        let offset = target % DIRENTS_PER_CLUSTER;
        let entry = DirEntry::new(name, n_ent).map_err(name_error)?;

        if target == lookup.end {
            // Append position: the directory grows by one cluster of
            // slots, the new entry first, the rest empty.
            let mut body = vec![0u8; CLUSTER_ENTRY_BYTES as usize];
            write_entry(&mut body, 0, &entry);
            for slot in 1..DIRENTS_PER_CLUSTER {
                write_entry(&mut body, slot, &DirEntry::empty());
            }
            self.write_file_cluster(n_dir, cluster_no, &body)?;

            let mut dir = self.read_inode(n_dir, InodeState::InUse)?;
            dir.size += CLUSTER_ENTRY_BYTES;
            self.write_inode(n_dir, &dir, InodeState::InUse)?;
        } else {
            let mut body = self.read_file_cluster(n_dir, cluster_no)?;
            write_entry(&mut body, offset, &entry);
            self.write_file_cluster(n_dir, cluster_no, &body)?;
        }

        let mut ent = self.read_inode(n_ent, InodeState::InUse)?;
        ent.refcount += 1;
        self.write_inode(n_ent, &ent, InodeState::InUse)?;

        debug!(dir = n_dir, entry = n_ent, name, "added directory entry");
        Ok(())
    }

    /// Remove the entry named `name` from directory `n_dir`.
    ///
    /// A directory entry must be empty. When the entry inode's refcount
    /// reaches zero its clusters are freed and the inode returns to the
    /// free list in the dirty state.
    pub fn remove_dir_entry(&mut self, n_dir: u32, name: &str) -> Result<()> {
        validate_entry_name(name)?;
        let dir = self.read_dir_inode(n_dir)?;
        self.access_granted(n_dir, Access::Execute)?;
        self.access_granted(n_dir, Access::Write)?;

        let lookup = self.scan_dir(n_dir, &dir, name)?;
        let Some((n_ent, idx)) = lookup.found else {
            return Err(FsError::NotFound(name.to_owned()));
        };

        let ent = self.read_inode(n_ent, InodeState::InUse)?;
        let is_dir = ent.itype() == Some(InodeType::Directory);
        if is_dir {
            self.check_directory_emptiness(n_ent)?;
        }

        // Clear the slot.
        let cluster_no = idx / DIRENTS_PER_CLUSTER;
        let offset = idx % DIRENTS_PER_CLUSTER;
        let mut body = self.read_file_cluster(n_dir, cluster_no)?;
        write_entry(&mut body, offset, &DirEntry::empty());
        self.write_file_cluster(n_dir, cluster_no, &body)?;

        // Drop the naming reference; a directory also loses its ".".
        let mut ent = self.read_inode(n_ent, InodeState::InUse)?;
        ent.refcount -= if is_dir { 2 } else { 1 };
        let gone = ent.refcount == 0;
        self.write_inode(n_ent, &ent, InodeState::InUse)?;

        if gone {
            self.handle_file_clusters(n_ent, 0, ClusterOp::Free)?;
            self.free_inode(n_ent)?;
            if is_dir {
                let mut dir = self.read_inode(n_dir, InodeState::InUse)?;
                dir.refcount -= 1;
                self.write_inode(n_dir, &dir, InodeState::InUse)?;
            }
        }

        debug!(dir = n_dir, entry = n_ent, name, "removed directory entry");
        Ok(())
    }

    /// Rename the entry `old_name` to `new_name` within directory `n_dir`.
    pub fn rename_dir_entry(&mut self, n_dir: u32, old_name: &str, new_name: &str) -> Result<()> {
        validate_entry_name(old_name)?;
        validate_entry_name(new_name)?;
        let dir = self.read_dir_inode(n_dir)?;
        self.access_granted(n_dir, Access::Execute)?;
        self.access_granted(n_dir, Access::Write)?;

        let old = self.scan_dir(n_dir, &dir, old_name)?;
        let Some((n_ent, idx)) = old.found else {
            return Err(FsError::NotFound(old_name.to_owned()));
        };
        if self.scan_dir(n_dir, &dir, new_name)?.found.is_some() {
            return Err(FsError::Exists);
        }

        let cluster_no = idx / DIRENTS_PER_CLUSTER;
        let offset = idx % DIRENTS_PER_CLUSTER;
        let mut body = self.read_file_cluster(n_dir, cluster_no)?;
        write_entry(
            &mut body,
            offset,
            &DirEntry::new(new_name, n_ent).map_err(name_error)?,
        );
        self.write_file_cluster(n_dir, cluster_no, &body)?;
        Ok(())
    }

    /// Verify directory `n_dir` holds nothing beyond "." and "..".
    pub fn check_directory_emptiness(&mut self, n_dir: u32) -> Result<()> {
        let dir = self.read_dir_inode(n_dir)?;
        let nclusters = dir.size / CLUSTER_ENTRY_BYTES;
        for cluster_no in 0..nclusters {
            let body = self.read_file_cluster(n_dir, cluster_no)?;
            let first = if cluster_no == 0 {
                let dot = read_entry(&body, 0);
                let dotdot = read_entry(&body, 1);
                if dot.name_str() != "." || dotdot.name_str() != ".." {
                    return Err(FsError::Corruption {
                        block: u64::from(self.cluster_block(0)),
                        detail: format!("directory {n_dir} lacks its \".\"/\"..\" entries"),
                    });
                }
                2
            } else {
                0
            };
            for slot in first..DIRENTS_PER_CLUSTER {
                if !read_entry(&body, slot).is_empty_slot() {
                    return Err(FsError::NotEmpty);
                }
            }
        }
        Ok(())
    }

    /// Resolve an absolute path to (directory inode, entry inode).
    ///
    /// Every component but the last must be a directory the caller may
    /// search. "/" resolves to the root twice over.
    pub fn get_dir_entry_by_path(&mut self, path: &str) -> Result<(u32, u32)> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument(
                "path must be absolute".to_owned(),
            ));
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Ok((0, 0));
        }
        let mut dir = 0u32;
        for component in &components[..components.len() - 1] {
            let (next, _) = self.get_dir_entry_by_name(dir, component)?;
            dir = next;
        }
        let last = components[components.len() - 1];
        let (ent, _) = self.get_dir_entry_by_name(dir, last)?;
        Ok((dir, ent))
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Read `n_dir` as an in-use directory with a sane entry-array size.
    fn read_dir_inode(&mut self, n_dir: u32) -> Result<Inode> {
        let dir = self.read_inode(n_dir, InodeState::InUse)?;
        if dir.itype() != Some(InodeType::Directory) {
            return Err(FsError::NotDirectory);
        }
        if dir.size % CLUSTER_ENTRY_BYTES != 0 {
            let (block, _) = self.inode_location(n_dir);
            return Err(FsError::Corruption {
                block: u64::from(block),
                detail: format!(
                    "directory {n_dir} size {} is not a whole number of entry clusters",
                    dir.size
                ),
            });
        }
        Ok(dir)
    }

    /// Scan the whole entry array for `name`, recording the first free
    /// slot along the way.
    fn scan_dir(&mut self, n_dir: u32, dir: &Inode, name: &str) -> Result<DirLookup> {
        let nclusters = dir.size / CLUSTER_ENTRY_BYTES;
        let mut free_slot = None;
        let mut index = 0u32;
        for cluster_no in 0..nclusters {
            let body = self.read_file_cluster(n_dir, cluster_no)?;
            for slot in 0..DIRENTS_PER_CLUSTER {
                let entry = read_entry(&body, slot);
                if entry.is_empty_slot() {
                    if free_slot.is_none() && index >= 2 {
                        free_slot = Some(index);
                    }
                } else if entry.name_str() == name {
                    return Ok(DirLookup {
                        found: Some((entry.n_inode, index)),
                        free_slot,
                        end: nclusters * DIRENTS_PER_CLUSTER,
                    });
                }
                index += 1;
            }
        }
        Ok(DirLookup {
            found: None,
            free_slot,
            end: nclusters * DIRENTS_PER_CLUSTER,
        })
    }
}

/// A base name: nonempty, no '/', within the on-disk name field.
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(FsError::InvalidArgument(format!(
            "\"{name}\" is not a base name"
        )));
    }
    if name.len() > MAX_NAME {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

fn name_error(err: rufs_types::ParseError) -> FsError {
    FsError::InvalidArgument(err.to_string())
}

fn read_entry(body: &[u8], slot: u32) -> DirEntry {
    DirEntry::decode(body, slot).expect("slot within cluster body")
}

fn write_entry(body: &mut [u8], slot: u32, entry: &DirEntry) {
    entry.encode(body, slot).expect("slot within cluster body");
}
