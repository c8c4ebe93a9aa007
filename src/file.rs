//! File lifecycle: open, create, read, write, seek, close.
//!
//! A [`File`] is a plain value: mode, byte offset, size, the cluster cursor
//! and the locator of its directory slot. The volume is the receiver of
//! every operation, so handles never borrow it and any number may be held
//! (the caller serializes, and interleaving byte-level I/O on two handles
//! shares one cache between them).

use bitflags::bitflags;
use core::cmp::min;
use log::{debug, error, info};

use crate::dev::BlockDev;
use crate::dir::{DirIter, Lookup};
use crate::layout::{
    cluster_is_last, lfn_fragments, split_83, RawDirEntry, CLUST_EOFE, CLUST_FIRST,
};
use crate::volume::Volume;
use crate::FatError;

bitflags! {
    /// How a file is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access; required by [`Volume::write`] and for truncation.
        const WRITE = 1 << 1;
        /// Create the file when the lookup fails.
        const CREATE = 1 << 2;
        /// Drop the contents of an existing file at open.
        const TRUNCATE = 1 << 3;
        /// Position at the end of the file at open.
        const APPEND = 1 << 4;
        /// With `CREATE`: refuse a file that already exists.
        const EXCL = 1 << 5;
    }
}

impl OpenMode {
    /// Read/write shorthand.
    pub const RDWR: OpenMode = OpenMode::READ.union(OpenMode::WRITE);

    pub fn writable(self) -> bool {
        self.contains(OpenMode::WRITE)
    }
}

/// Where a seek is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

/// An open file.
#[derive(Debug, Clone)]
pub struct File {
    pub(crate) mode: OpenMode,
    pub(crate) offset: u32,
    pub(crate) size: u32,
    pub(crate) start_cluster: u32,
    /// Cluster cursor: `cluster` is link number `cluster_index` of the
    /// file's chain.
    pub(crate) cluster: u32,
    pub(crate) cluster_index: u32,
    /// Locator of the directory slot describing this file, for size
    /// updates on write and truncate.
    pub(crate) de_sector: u32,
    pub(crate) de_offset: u32,
}

impl File {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn position(&self) -> u32 {
        self.offset
    }
}

impl<D: BlockDev> Volume<D> {
    /// Open `path`, creating it when asked to.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<File, FatError> {
        debug!("open {path} {mode:?}");

        match self.resolve(path)? {
            Lookup::Found(found) => {
                if found.is_dir {
                    return Err(FatError::IsDir);
                }
                if mode.contains(OpenMode::CREATE | OpenMode::EXCL) {
                    return Err(FatError::Exists);
                }

                let mut file = File {
                    mode,
                    offset: 0,
                    size: found.entry.size(),
                    start_cluster: found.cluster,
                    cluster: found.cluster,
                    cluster_index: 0,
                    de_sector: found.sector,
                    de_offset: found.offset,
                };
                if mode.contains(OpenMode::TRUNCATE) && mode.writable() {
                    self.truncate(&mut file)?;
                }
                if mode.contains(OpenMode::APPEND) {
                    self.seek(&mut file, SeekFrom::End(0))?;
                }
                Ok(file)
            }
            Lookup::Missing { parent } => {
                if !mode.contains(OpenMode::CREATE) {
                    debug!("open: {path} not found");
                    return Err(FatError::NotFound);
                }
                let parent = parent.ok_or(FatError::NotFound)?;
                self.create(path, parent, mode)
            }
        }
    }

    /// Release a file handle. Writes have already been flushed as they were
    /// made, so this does no I/O beyond pushing the cache out.
    pub fn close(&mut self, file: File) -> Result<(), FatError> {
        let _ = file;
        self.flush()
    }

    /// Read from the current position, at most to the end of the file.
    /// Returns the bytes transferred; a chain ending early cuts the count
    /// short rather than erroring.
    pub fn read(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize, FatError> {
        let mut remaining = min(buf.len(), file.size.saturating_sub(file.offset) as usize);
        let mut done = 0;

        while remaining > 0 {
            if !self.seek_cursor(file, false)? {
                break;
            }

            let in_cluster = file.offset % self.bytes_per_cluster;
            let sector = self.sector_for_cluster(file.cluster) + in_cluster / self.bytes_per_sector;
            let offset = file.offset % self.bytes_per_sector;
            let n = min(remaining, (self.bytes_per_sector - offset) as usize);

            // Straight off the device: file data must not evict the FAT or
            // directory sector from the cache.
            let (start, end) = (done, done + n);
            self.dev_read(sector, offset, &mut buf[start..end])?;

            done += n;
            remaining -= n;
            file.offset += n as u32;
        }
        Ok(done)
    }

    /// Write at the current position, growing the chain cluster by cluster
    /// as the offset crosses each boundary. Returns the bytes transferred;
    /// a full volume cuts the count short rather than erroring.
    pub fn write(&mut self, file: &mut File, buf: &[u8]) -> Result<usize, FatError> {
        if !file.mode.writable() {
            return Err(FatError::InvalidMode);
        }

        if !buf.is_empty() && file.start_cluster < CLUST_FIRST {
            // Created elsewhere with no cluster allocated yet.
            self.assign_first_cluster(file)?;
        }

        let mut remaining = buf.len();
        let mut done = 0;

        while remaining > 0 {
            match self.seek_cursor(file, true) {
                Ok(true) => {}
                Ok(false) | Err(FatError::NoSpace) => break,
                Err(e) => return Err(e),
            }

            let in_cluster = file.offset % self.bytes_per_cluster;
            let sector = self.sector_for_cluster(file.cluster) + in_cluster / self.bytes_per_sector;
            let offset = file.offset % self.bytes_per_sector;
            let n = min(remaining, (self.bytes_per_sector - offset) as usize);

            self.dev_write(sector, offset, &buf[done..done + n])?;

            done += n;
            remaining -= n;
            file.offset += n as u32;
        }

        if file.offset > file.size {
            file.size = file.offset;
        }
        self.store_size(file)?;
        self.flush()?;

        debug!("write: {done} of {} bytes", buf.len());
        Ok(done)
    }

    /// Move the position, clamped into `[0, size]`, and resync the cluster
    /// cursor by walking the chain from the start. Returns the new
    /// position.
    pub fn seek(&mut self, file: &mut File, pos: SeekFrom) -> Result<u32, FatError> {
        let target = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => file.offset as i64 + off as i64,
            SeekFrom::End(off) => file.size as i64 + off as i64,
        };
        let target = target.clamp(0, file.size as i64) as u32;

        file.offset = target;
        file.cluster = file.start_cluster;
        file.cluster_index = 0;

        // Walk to the cluster holding the new position, stopping early if
        // the chain is shorter than the size claims.
        let steps = target / self.bytes_per_cluster;
        for _ in 0..steps {
            let next = self.fat_entry_checked(file.cluster)?;
            if cluster_is_last(next) {
                break;
            }
            file.cluster = next;
            file.cluster_index += 1;
        }
        Ok(target)
    }

    // ─── Internals ─────────────────────────────────────────────────────────────

    /// Bring the cluster cursor to the cluster containing `file.offset`.
    /// With `grow`, the chain is extended one cluster at a time as the walk
    /// runs off its end; otherwise hitting the end reports `false`.
    fn seek_cursor(&mut self, file: &mut File, grow: bool) -> Result<bool, FatError> {
        let target = file.offset / self.bytes_per_cluster;
        if target < file.cluster_index {
            // Cursor is past the position (the caller seeked backwards
            // without resync); restart from the head of the chain.
            file.cluster = file.start_cluster;
            file.cluster_index = 0;
        }
        while file.cluster_index < target {
            let next = self.fat_entry_checked(file.cluster)?;
            let next = if cluster_is_last(next) {
                if !grow {
                    return Ok(false);
                }
                self.allocate_clusters(file.cluster, 1)?
            } else {
                next
            };
            file.cluster = next;
            file.cluster_index += 1;
        }
        Ok(true)
    }

    /// Give a cluster to a zero-cluster file and point its directory slot
    /// at it.
    fn assign_first_cluster(&mut self, file: &mut File) -> Result<(), FatError> {
        let first = self.allocate_clusters(0, 1)?;
        file.start_cluster = first;
        file.cluster = first;
        file.cluster_index = 0;
        let mut entry = self.read_slot(file.de_sector, file.de_offset)?;
        entry.set_cluster(first);
        self.write_slot(file.de_sector, file.de_offset, &entry)
    }

    /// Drop an existing file's contents: free the tail of the chain, keep
    /// the head cluster as the file's one remaining cluster, persist size 0.
    fn truncate(&mut self, file: &mut File) -> Result<(), FatError> {
        if file.start_cluster >= CLUST_FIRST {
            let next = self.fat_entry(file.start_cluster)?;
            if !cluster_is_last(next) && next >= CLUST_FIRST {
                self.free_chain(next)?;
            }
            self.fat_entry_set(file.start_cluster, CLUST_EOFE)?;
        }
        file.size = 0;
        file.offset = 0;
        file.cluster = file.start_cluster;
        file.cluster_index = 0;
        self.store_size(file)?;
        self.flush()
    }

    /// Patch the file's size into its directory slot.
    fn store_size(&mut self, file: &File) -> Result<(), FatError> {
        let mut entry = self.read_slot(file.de_sector, file.de_offset)?;
        entry.set_size(file.size);
        self.write_slot(file.de_sector, file.de_offset, &entry)
    }

    /// Create `path` as an empty file in `parent` (located by the failed
    /// lookup) and open it.
    fn create(&mut self, path: &str, parent: u32, mode: OpenMode) -> Result<File, FatError> {
        let name = match path.trim_matches('/').rsplit('/').next() {
            Some(n) if !n.is_empty() => n,
            _ => return Err(FatError::NotFound),
        };
        info!("create {name}");

        if lfn_fragments(name) > 1 {
            // Long-filename writing is not implemented; the file exists
            // under its (truncated) short name only.
            error!("create: {name} needs a long filename entry, writing 8.3 only");
        }

        // Even an empty file owns one cluster.
        let start_cluster = self.allocate_clusters(0, 1)?;

        let (sector, offset) = match self.find_dir_slot(parent) {
            Ok(position) => position,
            Err(e) => {
                let _ = self.free_chain(start_cluster);
                return Err(e);
            }
        };

        let (name8, ext3) = split_83(name);
        let entry = RawDirEntry::new_short(&name8, &ext3, start_cluster, 0);
        self.write_slot(sector, offset, &entry)?;
        self.flush()?;

        Ok(File {
            mode,
            offset: 0,
            size: 0,
            start_cluster,
            cluster: start_cluster,
            cluster_index: 0,
            de_sector: sector,
            de_offset: offset,
        })
    }

    /// Find a slot for a new directory entry: the first deleted slot, or
    /// the terminator.
    fn find_dir_slot(&mut self, parent: u32) -> Result<(u32, u32), FatError> {
        let (mut iter, mut entry) = DirIter::first(self, parent)?;
        loop {
            if entry.is_deleted() {
                return Ok(iter.position());
            }
            if entry.is_end() {
                let position = iter.position();
                // Taking the terminator slot: the one after it must exist
                // and stay empty so the directory keeps its terminator.
                // Stepping may grow the chain (planting a fresh zeroed
                // terminator sector); running off the fixed FAT16 root
                // region is fine, its boundary ends every scan.
                let _ = iter.next(self)?;
                return Ok(position);
            }
            entry = match iter.next(self)? {
                Some(e) => e,
                None => return Err(FatError::NoSpace),
            };
        }
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
