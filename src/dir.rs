//! Directory machinery: the 32-byte slot iterator that walks a directory's
//! cluster chain (extending it when an insertion overruns), wildcard name
//! matching, long-filename reassembly, and path resolution.

use log::debug;

use crate::dev::BlockDev;
use crate::layout::{cluster_is_last, RawDirEntry, DIR_ENTRY_SIZE, NAME_MAX};
use crate::volume::Volume;
use crate::FatError;

// ─── Slot iterator ─────────────────────────────────────────────────────────────

/// Linear iteration over the 32-byte slots of one directory, following the
/// cluster chain underneath so callers see a flat sequence.
///
/// When iteration runs off the end of the chain, one fresh cluster is
/// allocated, chained on, and given a zeroed terminator sector; the
/// insertion path relies on the slot after the terminator always existing.
/// Exhausting the fixed FAT16 root region ends iteration instead.
pub(crate) struct DirIter {
    /// Current chunk's cluster; 0 is the FAT16 root region.
    cluster: u32,
    /// Absolute sector holding the current slot.
    sector: u32,
    sector_in_chunk: u32,
    chunk_sectors: u32,
    /// Byte offset of the current slot within the sector.
    offset: u32,
}

impl DirIter {
    /// Open `dir_cluster` and yield its first slot.
    pub fn first<D: BlockDev>(
        vol: &mut Volume<D>,
        dir_cluster: u32,
    ) -> Result<(DirIter, RawDirEntry), FatError> {
        let iter = DirIter {
            cluster: dir_cluster,
            sector: vol.sector_for_cluster(dir_cluster),
            sector_in_chunk: 0,
            chunk_sectors: vol.dir_chunk_sectors(dir_cluster),
            offset: 0,
        };
        let entry = vol.read_slot(iter.sector, 0)?;
        Ok((iter, entry))
    }

    /// Locator of the slot most recently yielded.
    pub fn position(&self) -> (u32, u32) {
        (self.sector, self.offset)
    }

    /// Advance to the next slot. `None` means the fixed FAT16 root region
    /// ran out; a chain directory never ends here because it grows instead.
    pub fn next<D: BlockDev>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<Option<RawDirEntry>, FatError> {
        self.offset += DIR_ENTRY_SIZE;
        if self.offset >= vol.bytes_per_sector {
            self.offset = 0;
            self.sector_in_chunk += 1;
            if self.sector_in_chunk < self.chunk_sectors {
                self.sector += 1;
            } else {
                if self.cluster == 0 {
                    return Ok(None);
                }
                let mut next = vol.fat_entry_checked(self.cluster)?;
                if cluster_is_last(next) {
                    // Normally the scan stops at the empty-slot terminator
                    // well before this; getting here means the caller wants
                    // the directory to grow.
                    next = vol.extend_dir(self.cluster)?;
                }
                self.cluster = next;
                self.sector = vol.sector_for_cluster(next);
                self.sector_in_chunk = 0;
                self.chunk_sectors = vol.dir_chunk_sectors(next);
            }
        }
        Ok(Some(vol.read_slot(self.sector, self.offset)?))
    }
}

// ─── Name matching ─────────────────────────────────────────────────────────────

/// Case-insensitive wildcard match of `pat` against `s`: `*` matches any
/// run including the empty one, `?` any single character except a dot.
pub(crate) fn wild_match(pat: &[u8], s: &[u8]) -> bool {
    let mut star = false;
    let mut pat_anchor = 0;
    let mut s_anchor = 0;
    'restart: loop {
        let mut p = pat_anchor;
        let mut i = s_anchor;
        while i < s.len() {
            match pat.get(p) {
                Some(&b'?') if s[i] != b'.' => {}
                Some(&b'*') => {
                    star = true;
                    s_anchor = i;
                    pat_anchor = p + 1;
                    if pat_anchor >= pat.len() {
                        return true;
                    }
                    continue 'restart;
                }
                Some(&c) if c.eq_ignore_ascii_case(&s[i]) => {}
                _ => {
                    // Mismatch: with a star pending, slide the match window.
                    if !star {
                        return false;
                    }
                    s_anchor += 1;
                    continue 'restart;
                }
            }
            i += 1;
            p += 1;
        }
        if pat.get(p) == Some(&b'*') {
            p += 1;
        }
        return p >= pat.len();
    }
}

// ─── Search and resolution ─────────────────────────────────────────────────────

/// A directory entry located by search: the slot's address, the entry
/// itself, and the chain it points at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Found {
    /// Directory the entry lives in; filled in by [`Volume::resolve`].
    pub parent: u32,
    pub cluster: u32,
    pub sector: u32,
    pub offset: u32,
    pub is_dir: bool,
    pub entry: RawDirEntry,
}

/// Outcome of resolving a path.
pub(crate) enum Lookup {
    Found(Found),
    /// The path names nothing. `parent` carries the directory a terminal
    /// component could be created in; a miss on a non-terminal component
    /// (or a malformed path) invalidates it.
    Missing { parent: Option<u32> },
}

impl<D: BlockDev> Volume<D> {
    /// Scan one directory for `name`, matching either the 8.3 rendering or
    /// the reassembled long filename of each entry.
    pub(crate) fn search_dir(
        &mut self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<Found>, FatError> {
        debug!("dir search for {name} in cluster {dir_cluster}");

        // Long-name fragments accumulate here until their short entry
        // arrives; latest fragment first on disk.
        let mut long_name = [0u8; NAME_MAX];
        let mut long_match = false;

        let (mut iter, mut entry) = DirIter::first(self, dir_cluster)?;
        loop {
            if entry.is_end() {
                return Ok(None);
            }
            if entry.is_deleted() {
                // fall through to advance
            } else if entry.is_long_name() {
                if entry.lfn_is_last() {
                    long_name.fill(0);
                }
                entry.lfn_copy_into(&mut long_name);
                if entry.lfn_seq() == 1 {
                    let len = long_name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
                    long_match = wild_match(name.as_bytes(), &long_name[..len]);
                }
            } else {
                let (short, short_len) = entry.short_name();
                let short_match = wild_match(name.as_bytes(), &short[..short_len]);

                // The `.` self-entry and volume labels never match.
                let self_entry = short_len == 1 && short[0] == b'.';
                if (short_match || long_match) && !self_entry && !entry.is_volume_label() {
                    let (sector, offset) = iter.position();
                    return Ok(Some(Found {
                        parent: dir_cluster,
                        cluster: entry.cluster(),
                        sector,
                        offset,
                        is_dir: entry.is_dir(),
                        entry,
                    }));
                }
                long_match = false;
            }

            entry = match iter.next(self)? {
                Some(e) => e,
                None => return Ok(None),
            };
        }
    }

    /// Walk a slash-separated absolute path from the root.
    pub(crate) fn resolve(&mut self, path: &str) -> Result<Lookup, FatError> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(Lookup::Missing { parent: None });
        }

        let mut parent = self.root_dir_cluster;
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            if component.is_empty() {
                // `a//b` is malformed
                return Ok(Lookup::Missing { parent: None });
            }
            let terminal = components.peek().is_none();
            match self.search_dir(parent, component)? {
                Some(mut found) => {
                    if terminal {
                        found.parent = parent;
                        return Ok(Lookup::Found(found));
                    }
                    if !found.is_dir {
                        debug!("resolve: {component} is not a directory");
                        return Ok(Lookup::Missing { parent: None });
                    }
                    parent = found.cluster;
                }
                None => {
                    debug!("resolve: {component} not found");
                    return Ok(Lookup::Missing {
                        parent: terminal.then_some(parent),
                    });
                }
            }
        }
        Ok(Lookup::Missing { parent: None })
    }

    /// Grow a directory whose chain ends at `last`: allocate one cluster,
    /// chain it on, and plant a zeroed terminator sector in it.
    pub(crate) fn extend_dir(&mut self, last: u32) -> Result<u32, FatError> {
        let new = self.allocate_clusters(last, 1)?;
        // The FAT updates and the fresh terminator sector share the cache
        // slot; push the former out before claiming it.
        self.flush()?;
        let sector = self.sector_for_cluster(new);
        self.cache.load_zeroed(sector);
        self.flush()?;
        Ok(new)
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
