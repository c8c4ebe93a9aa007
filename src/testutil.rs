//! Shared test fixtures: an in-memory block device and partitioned disk
//! images built and verified with the `fatfs` crate, so everything this
//! engine writes is cross-checked against an independent implementation.

use std::io::{Cursor, Read, Write};

use crate::dev::{BlockDev, DeviceError};
use crate::layout::{PART_TYPE_FAT16, PART_TYPE_FAT32_LBA};
use crate::volume::DirItem;

/// Where the partition starts, in sectors (1 MiB alignment).
pub const PART_START: u64 = 2048;

/// Mock block device backed by a `Vec<u8>`.
#[derive(Debug)]
pub struct MemDisk(pub Vec<u8>);

impl BlockDev for MemDisk {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let off = offset as usize;
        if off + buf.len() > self.0.len() {
            return Err(DeviceError);
        }
        buf.copy_from_slice(&self.0[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        let off = offset as usize;
        if off + buf.len() > self.0.len() {
            return Err(DeviceError);
        }
        self.0[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Format a FAT volume into the partition window of `img` and write the
/// matching MBR record. Mount refuses bare volumes, so every test image is
/// partitioned.
fn format_partition(img: &mut [u8], fat_type: fatfs::FatType, bytes_per_cluster: Option<u32>) {
    let start = PART_START as usize * 512;
    let size_sectors = ((img.len() - start) / 512) as u32;
    {
        let mut opts = fatfs::FormatVolumeOptions::new().fat_type(fat_type);
        if let Some(bpc) = bytes_per_cluster {
            opts = opts.bytes_per_cluster(bpc);
        }
        let mut cursor = Cursor::new(&mut img[start..]);
        fatfs::format_volume(&mut cursor, opts).expect("format_volume failed");
    }

    let part_type = match fat_type {
        fatfs::FatType::Fat32 => PART_TYPE_FAT32_LBA,
        _ => PART_TYPE_FAT16,
    };
    let p = 0x1BE;
    img[p + 4] = part_type;
    img[p + 8..p + 12].copy_from_slice(&(PART_START as u32).to_le_bytes());
    img[p + 12..p + 16].copy_from_slice(&size_sectors.to_le_bytes());
    img[510] = 0x55;
    img[511] = 0xAA;
}

/// A partitioned FAT32 image. 40 MB keeps `fatfs` above the 65525-cluster
/// FAT32 floor, at 512-byte clusters.
pub fn fat32_disk() -> MemDisk {
    let mut img = vec![0u8; (PART_START as usize + 80 * 1024) * 512];
    format_partition(&mut img, fatfs::FatType::Fat32, None);
    MemDisk(img)
}

/// A partitioned FAT16 image with 4 KB clusters (20 MB of volume).
pub fn fat16_disk() -> MemDisk {
    let mut img = vec![0u8; (PART_START as usize + 40 * 1024) * 512];
    format_partition(&mut img, fatfs::FatType::Fat16, Some(4096));
    MemDisk(img)
}

/// An unused directory listing slot.
pub fn blank_item() -> DirItem {
    DirItem {
        name: [0; 12],
        name_len: 0,
        size: 0,
        is_dir: false,
        cluster: 0,
    }
}

fn oracle<'a>(
    disk: &'a mut MemDisk,
) -> fatfs::FileSystem<Cursor<&'a mut [u8]>> {
    let start = PART_START as usize * 512;
    let cursor = Cursor::new(&mut disk.0[start..]);
    fatfs::FileSystem::new(cursor, fatfs::FsOptions::new()).expect("oracle mount failed")
}

/// Write a file into the image through `fatfs`.
pub fn oracle_write(disk: &mut MemDisk, path: &str, content: &[u8]) {
    let fs = oracle(disk);
    let mut file = fs.root_dir().create_file(path).expect("create_file failed");
    file.truncate().unwrap();
    file.write_all(content).unwrap();
}

/// Create a directory in the image through `fatfs`.
pub fn oracle_mkdir(disk: &mut MemDisk, path: &str) {
    let fs = oracle(disk);
    fs.root_dir().create_dir(path).expect("create_dir failed");
}

/// Read a file back out of the image through `fatfs`.
pub fn oracle_read(disk: &mut MemDisk, path: &str) -> Vec<u8> {
    let fs = oracle(disk);
    let mut file = fs.root_dir().open_file(path).expect("open_file failed");
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).unwrap();
    buf
}

/// Whether `fatfs` can still open the file.
pub fn oracle_exists(disk: &mut MemDisk, path: &str) -> bool {
    let fs = oracle(disk);
    let found = fs.root_dir().open_file(path).is_ok();
    found
}
