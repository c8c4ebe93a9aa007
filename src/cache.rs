//! Single-slot write-back sector cache.
//!
//! FAT workloads hammer the same FAT sector and the same directory sector
//! over and over; one slot soaks up most of that churn with fixed memory.
//! Switching to a different sector flushes first, so writes reach the device
//! in the order the logical operations were issued.

use crate::dev::{BlockDev, DeviceError};
use crate::layout::SECTOR_SIZE;

#[derive(Debug)]
pub(crate) struct SectorCache {
    sector: Option<u32>,
    dirty: bool,
    buf: [u8; SECTOR_SIZE],
}

impl SectorCache {
    pub fn new() -> SectorCache {
        SectorCache {
            sector: None,
            dirty: false,
            buf: [0; SECTOR_SIZE],
        }
    }

    /// Make `sector` current and return its bytes. A hit returns
    /// immediately; a miss flushes whatever is dirty, then loads.
    ///
    /// The returned borrow is only good until the next cache call; callers
    /// keeping slot data around must copy it out.
    pub fn read<D: BlockDev>(
        &mut self,
        dev: &mut D,
        sector: u32,
    ) -> Result<&mut [u8; SECTOR_SIZE], DeviceError> {
        if self.sector != Some(sector) {
            self.flush(dev)?;
            self.sector = None;
            dev.read(sector as u64 * SECTOR_SIZE as u64, &mut self.buf)?;
            self.sector = Some(sector);
        }
        Ok(&mut self.buf)
    }

    /// Tag the buffer as holding `sector` and mark it dirty. The caller has
    /// already edited the bytes in place; nothing reaches the device until
    /// [`flush`](Self::flush).
    pub fn mark_dirty(&mut self, sector: u32) {
        self.sector = Some(sector);
        self.dirty = true;
    }

    /// Replace the buffer with zeroes for `sector`, dirty. Used when a fresh
    /// directory cluster needs its terminator sector without reading the
    /// stale bytes underneath.
    pub fn load_zeroed(&mut self, sector: u32) {
        self.buf.fill(0);
        self.sector = Some(sector);
        self.dirty = true;
    }

    /// Push a dirty buffer to the device.
    pub fn flush<D: BlockDev>(&mut self, dev: &mut D) -> Result<(), DeviceError> {
        if self.dirty {
            if let Some(sector) = self.sector {
                dev.write(sector as u64 * SECTOR_SIZE as u64, &self.buf)?;
            }
            self.dirty = false;
        }
        Ok(())
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
