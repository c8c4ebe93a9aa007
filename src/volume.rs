//! Volume mount and geometry.
//!
//! A [`Volume`] is one mounted FAT16/FAT32 filesystem: the layout constants
//! derived from the partition table and BPB, the owning block device, and
//! the single sector cache every FAT/directory access goes through.

use log::{error, info};

use crate::cache::SectorCache;
use crate::dev::BlockDev;
use crate::dir::{DirIter, Lookup};
use crate::layout::{
    cluster_is_free, has_boot_signature, Bpb, PartRecord, RawDirEntry, CLUST_FIRST,
    PART_TYPE_FAT16, PART_TYPE_FAT16_LBA, PART_TYPE_FAT32, PART_TYPE_FAT32_LBA, SECTOR_SIZE,
};
use crate::FatError;

/// Which FAT variant the partition carries, per its partition-record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

/// Cluster occupancy counts, gathered by scanning the FAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total: u32,
    pub free: u32,
    pub alloc: u32,
}

/// A single directory listing entry: 8.3 name plus metadata.
#[derive(Debug, Clone, Copy)]
pub struct DirItem {
    pub name: [u8; 12],
    pub name_len: usize,
    pub size: u32,
    pub is_dir: bool,
    pub cluster: u32,
}

#[derive(Debug)]
pub struct Volume<D> {
    pub(crate) dev: D,
    pub(crate) cache: SectorCache,
    pub(crate) variant: FatType,
    pub(crate) bytes_per_sector: u32,
    pub(crate) sectors_per_cluster: u32,
    pub(crate) bytes_per_cluster: u32,
    pub(crate) first_fat_sector: u32,
    pub(crate) num_fat_sectors: u32,
    pub(crate) num_fats: u32,
    pub(crate) first_data_sector: u32,
    /// Start of the fixed root directory region (FAT16 only).
    pub(crate) first_dir_sector: u32,
    pub(crate) root_dir_sectors: u32,
    /// Root directory cluster on FAT32; 0 on FAT16, where cluster 0 is the
    /// sentinel for the fixed root region.
    pub(crate) root_dir_cluster: u32,
    pub(crate) num_clusters: u32,
}

impl<D: BlockDev> Volume<D> {
    /// Mount the filesystem on `dev`: walk the partition table, parse the
    /// BPB, derive the layout.
    ///
    /// The medium must be partitioned; a bare volume (sector 0 starting with
    /// a boot jump) is refused, as is any partition type other than the four
    /// FAT16/FAT32 variants.
    pub fn mount(mut dev: D) -> Result<Volume<D>, FatError> {
        let mut sector = [0u8; SECTOR_SIZE];
        dev.read(0, &mut sector)?;

        if sector[0] == 0xE9 || sector[0] == 0xEB {
            error!("mount: boot sector without a partition table");
            return Err(FatError::BadVolume);
        }
        if !has_boot_signature(&sector) {
            error!("mount: missing 0x55AA signature");
            return Err(FatError::BadVolume);
        }

        let part = PartRecord::read(&sector, 0);
        let variant = match part.part_type {
            PART_TYPE_FAT16 | PART_TYPE_FAT16_LBA => FatType::Fat16,
            PART_TYPE_FAT32 | PART_TYPE_FAT32_LBA => FatType::Fat32,
            other => {
                // Most likely no filesystem has been created yet.
                error!("mount: unknown partition type {other:#04x}");
                return Err(FatError::BadVolume);
            }
        };
        let first_sector = part.start_lba;

        dev.read(first_sector as u64 * SECTOR_SIZE as u64, &mut sector)?;
        let bpb = Bpb::read(&sector);

        if bpb.bytes_per_sector != SECTOR_SIZE as u32 || bpb.sectors_per_cluster == 0 {
            error!(
                "mount: bad geometry, {}b sectors x{}",
                bpb.bytes_per_sector, bpb.sectors_per_cluster
            );
            return Err(FatError::BadVolume);
        }

        let num_fat_sectors = bpb.fat_sectors();
        let root_dir_sectors =
            (bpb.root_dir_entries * 32 + bpb.bytes_per_sector - 1) / bpb.bytes_per_sector;

        // Data area location, before partition compensation; the cluster
        // count comes from the uncompensated value.
        let first_data_sector =
            bpb.reserved_sectors + bpb.num_fats * num_fat_sectors + root_dir_sectors;
        let data_sectors = bpb.total_sectors() - first_data_sector;
        let num_clusters = data_sectors / bpb.sectors_per_cluster;

        let volume = Volume {
            dev,
            cache: SectorCache::new(),
            variant,
            bytes_per_sector: bpb.bytes_per_sector,
            sectors_per_cluster: bpb.sectors_per_cluster,
            bytes_per_cluster: bpb.sectors_per_cluster * bpb.bytes_per_sector,
            first_fat_sector: bpb.reserved_sectors + first_sector,
            num_fat_sectors,
            num_fats: bpb.num_fats,
            first_data_sector: first_data_sector + first_sector,
            first_dir_sector: bpb.reserved_sectors
                + bpb.num_fats * bpb.fat_sectors_16
                + first_sector,
            root_dir_sectors,
            root_dir_cluster: match variant {
                FatType::Fat32 => bpb.root_dir_cluster,
                FatType::Fat16 => 0,
            },
            num_clusters,
        };

        info!(
            "mount: {:?}, {} clusters of {} bytes, partition at {}",
            variant, volume.num_clusters, volume.bytes_per_cluster, first_sector
        );
        info!(
            "mount: fat at {} ({} sectors x{}), data at {}",
            volume.first_fat_sector, volume.num_fat_sectors, volume.num_fats,
            volume.first_data_sector
        );

        Ok(volume)
    }

    pub fn fat_type(&self) -> FatType {
        self.variant
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    pub fn num_clusters(&self) -> u32 {
        self.num_clusters
    }

    /// Flush pending state and hand the device back.
    pub fn into_device(mut self) -> D {
        if self.cache.flush(&mut self.dev).is_err() {
            error!("unmount: flush failed");
        }
        self.dev
    }

    // ─── Geometry ──────────────────────────────────────────────────────────────

    /// First sector of `cluster`. Cluster 0 denotes the FAT16 root region,
    /// not a data cluster.
    pub(crate) fn sector_for_cluster(&self, cluster: u32) -> u32 {
        if cluster == 0 {
            return self.first_dir_sector;
        }
        (cluster - CLUST_FIRST) * self.sectors_per_cluster + self.first_data_sector
    }

    /// Sectors in one directory chunk starting at `cluster`: the fixed root
    /// region on FAT16, one cluster otherwise.
    pub(crate) fn dir_chunk_sectors(&self, cluster: u32) -> u32 {
        if self.variant == FatType::Fat16 && cluster == self.root_dir_cluster {
            self.root_dir_sectors
        } else {
            self.sectors_per_cluster
        }
    }

    // ─── Device access ─────────────────────────────────────────────────────────

    /// Read bytes straight from the device, bypassing the cache. File data
    /// moves through here so it cannot evict the FAT or directory sector an
    /// iterator is holding.
    pub(crate) fn dev_read(
        &mut self,
        sector: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FatError> {
        let pos = sector as u64 * self.bytes_per_sector as u64 + offset as u64;
        self.dev.read(pos, buf).map_err(FatError::from)
    }

    /// Direct device write; see [`dev_read`](Self::dev_read).
    pub(crate) fn dev_write(
        &mut self,
        sector: u32,
        offset: u32,
        buf: &[u8],
    ) -> Result<(), FatError> {
        let pos = sector as u64 * self.bytes_per_sector as u64 + offset as u64;
        self.dev.write(pos, buf).map_err(FatError::from)
    }

    /// Copy one 32-byte directory slot out of the cached sector.
    pub(crate) fn read_slot(&mut self, sector: u32, offset: u32) -> Result<RawDirEntry, FatError> {
        let buf = self.cache.read(&mut self.dev, sector)?;
        Ok(RawDirEntry::from_slice(&buf[offset as usize..]))
    }

    /// Put a directory slot into the cached sector and mark it dirty.
    pub(crate) fn write_slot(
        &mut self,
        sector: u32,
        offset: u32,
        entry: &RawDirEntry,
    ) -> Result<(), FatError> {
        let buf = self.cache.read(&mut self.dev, sector)?;
        buf[offset as usize..offset as usize + 32].copy_from_slice(entry.as_bytes());
        self.cache.mark_dirty(sector);
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<(), FatError> {
        self.cache.flush(&mut self.dev).map_err(FatError::from)
    }

    // ─── Volume-level operations ───────────────────────────────────────────────

    /// Count total, free and allocated clusters by scanning the FAT.
    pub fn stats(&mut self) -> Result<Stats, FatError> {
        let mut alloc = 0;
        for cluster in CLUST_FIRST..self.num_clusters {
            if !cluster_is_free(self.fat_entry(cluster)?) {
                alloc += 1;
            }
        }
        Ok(Stats {
            total: self.num_clusters,
            free: self.num_clusters - alloc,
            alloc,
        })
    }

    /// List a directory into `out`, returning the number of entries written.
    /// Deleted slots, long-name fragments and volume labels are skipped;
    /// `"/"` (or the empty path) lists the root.
    pub fn read_dir(&mut self, path: &str, out: &mut [DirItem]) -> Result<usize, FatError> {
        let dir_cluster = if path.trim_matches('/').is_empty() {
            self.root_dir_cluster
        } else {
            match self.resolve(path)? {
                Lookup::Found(f) if f.is_dir => f.cluster,
                Lookup::Found(_) => return Err(FatError::NotDir),
                Lookup::Missing { .. } => return Err(FatError::NotFound),
            }
        };

        let mut count = 0;
        let (mut iter, mut entry) = DirIter::first(self, dir_cluster)?;
        loop {
            if entry.is_end() || count >= out.len() {
                break;
            }
            if !entry.is_deleted() && !entry.is_long_name() && !entry.is_volume_label() {
                let (name, name_len) = entry.short_name();
                out[count] = DirItem {
                    name,
                    name_len,
                    size: entry.size(),
                    is_dir: entry.is_dir(),
                    cluster: entry.cluster(),
                };
                count += 1;
            }
            entry = match iter.next(self)? {
                Some(e) => e,
                None => break,
            };
        }
        Ok(count)
    }

    /// Remove a file: free its cluster chain, then mark its directory slot
    /// and any preceding long-name slots deleted.
    pub fn unlink(&mut self, path: &str) -> Result<(), FatError> {
        info!("unlink {path}");

        let found = match self.resolve(path)? {
            Lookup::Found(f) => f,
            Lookup::Missing { .. } => return Err(FatError::NotFound),
        };
        if found.is_dir {
            return Err(FatError::IsDir);
        }

        self.free_chain(found.cluster)?;

        // Re-scan the parent for the recorded slot, remembering where the
        // long-name run in front of it started.
        let mut run: [(u32, u32); 20] = [(0, 0); 20];
        let mut run_len = 0;
        let (mut iter, mut entry) = DirIter::first(self, found.parent)?;
        loop {
            if entry.is_end() {
                break;
            }
            if iter.position() == (found.sector, found.offset) {
                for &(sector, offset) in &run[..run_len] {
                    let mut lfn = self.read_slot(sector, offset)?;
                    lfn.set_deleted();
                    self.write_slot(sector, offset, &lfn)?;
                }
                let mut short = self.read_slot(found.sector, found.offset)?;
                short.set_deleted();
                self.write_slot(found.sector, found.offset, &short)?;
                return self.flush();
            }

            if entry.is_long_name() && !entry.is_deleted() {
                if entry.lfn_is_last() {
                    run_len = 0;
                }
                if run_len < run.len() {
                    run[run_len] = iter.position();
                    run_len += 1;
                }
            } else {
                run_len = 0;
            }

            entry = match iter.next(self)? {
                Some(e) => e,
                None => break,
            };
        }

        error!("unlink: lost directory entry for {path}");
        Ok(())
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn mount_fat32() {
        let vol = Volume::mount(fat32_disk()).unwrap();
        assert_eq!(vol.fat_type(), FatType::Fat32);
        // FAT32 volumes carry at least 65525 data clusters by definition.
        assert!(vol.num_clusters() >= 65525);
        assert_ne!(vol.root_dir_cluster, 0);
    }

    #[test]
    fn mount_fat16() {
        let vol = Volume::mount(fat16_disk()).unwrap();
        assert_eq!(vol.fat_type(), FatType::Fat16);
        assert_eq!(vol.bytes_per_cluster(), 4096);
        assert_eq!(vol.root_dir_cluster, 0);
        assert!(vol.root_dir_sectors > 0);
    }

    #[test]
    fn mount_rejects_bare_volume() {
        // A filesystem formatted at sector 0: the jump byte sits where the
        // MBR should be.
        let mut img = vec![0u8; 16 * 1024 * 1024];
        {
            let mut cursor = std::io::Cursor::new(&mut img[..]);
            fatfs::format_volume(
                &mut cursor,
                fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat16),
            )
            .unwrap();
        }
        assert_eq!(img[0], 0xEB);
        assert_eq!(
            Volume::mount(MemDisk(img)).unwrap_err(),
            crate::FatError::BadVolume
        );
    }

    #[test]
    fn mount_rejects_blank_disk() {
        let disk = MemDisk(vec![0u8; 4 * 1024 * 1024]);
        assert_eq!(Volume::mount(disk).unwrap_err(), crate::FatError::BadVolume);
    }

    #[test]
    fn mount_rejects_unknown_partition_type() {
        let mut disk = fat32_disk();
        disk.0[0x1BE + 4] = 0x07; // NTFS
        assert_eq!(Volume::mount(disk).unwrap_err(), crate::FatError::BadVolume);
    }

    #[test]
    fn stats_counts_root_allocation() {
        let mut vol = Volume::mount(fat32_disk()).unwrap();
        let stats = vol.stats().unwrap();
        assert_eq!(stats.total, vol.num_clusters());
        assert_eq!(stats.free + stats.alloc, stats.total);
        // The FAT32 root directory owns at least its first cluster.
        assert!(stats.alloc >= 1);
    }

    #[test]
    fn read_dir_lists_root() {
        let mut disk = fat32_disk();
        oracle_write(&mut disk, "FILE1.TXT", b"one");
        oracle_write(&mut disk, "FILE2.TXT", b"two");
        oracle_mkdir(&mut disk, "SUB");

        let mut vol = Volume::mount(disk).unwrap();
        let mut out = [blank_item(); 16];
        let count = vol.read_dir("/", &mut out).unwrap();
        assert_eq!(count, 3);

        let names: Vec<&str> = out[..count]
            .iter()
            .map(|e| std::str::from_utf8(&e.name[..e.name_len]).unwrap())
            .collect();
        assert!(names.contains(&"FILE1.TXT"));
        assert!(names.contains(&"FILE2.TXT"));
        assert!(names.contains(&"SUB"));

        let sub = out[..count].iter().find(|e| e.is_dir).unwrap();
        assert_eq!(&sub.name[..sub.name_len], b"SUB");
    }

    #[test]
    fn read_dir_of_file_fails() {
        let mut disk = fat32_disk();
        oracle_write(&mut disk, "FILE.TXT", b"x");
        let mut vol = Volume::mount(disk).unwrap();
        let mut out = [blank_item(); 4];
        assert_eq!(
            vol.read_dir("/FILE.TXT", &mut out).unwrap_err(),
            crate::FatError::NotDir
        );
    }

    #[test]
    fn read_dir_fat16_root_region() {
        let mut disk = fat16_disk();
        oracle_write(&mut disk, "ROOT.BIN", b"fat16");
        let mut vol = Volume::mount(disk).unwrap();
        let mut out = [blank_item(); 8];
        let count = vol.read_dir("/", &mut out).unwrap();
        assert_eq!(count, 1);
        assert_eq!(&out[0].name[..out[0].name_len], b"ROOT.BIN");
        assert_eq!(out[0].size, 5);
    }
}
