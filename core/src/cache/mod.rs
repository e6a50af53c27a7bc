//! Track-grained read-through/write-back cache for mass-storage devices
//!
//! Tracks hold 256 sectors (track number = LBA >> 8) and are loaded lazily.
//! The cache keeps a bounded number of tracks; on overflow the
//! least-recently-used clean track is dropped, then, if all tracks are
//! dirty, the least-recently-used dirty track is flushed and dropped. A
//! flush failure is reported to the caller of the triggering operation.

pub mod track;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cache::track::DiskTrack;

/// Number of tracks the cache holds at most
pub const CACHE_SLOTS: usize = 16;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Raw (CD-ROM) caches are read-only
    #[error("write to raw-mode cache")]
    RawWrite,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub cache_miss_read_count: u64,
    pub cache_miss_write_count: u64,
    pub read_error_count: u64,
    pub write_error_count: u64,
}

struct CacheSlot {
    serial: u64,
    track: DiskTrack,
}

pub struct DiskCache {
    file: File,
    path: PathBuf,

    /// log2 of the sector size
    shift: u32,
    blocks: u64,
    raw: bool,

    slots: Vec<CacheSlot>,
    serial: u64,

    pub stats: CacheStats,
}

impl DiskCache {
    pub fn new(
        path: &Path,
        block_size: u32,
        blocks: u64,
        raw: bool,
        writable: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(blocks > 0, "cache needs at least one block");

        let mut shift = 8;
        while 1u32 << shift != block_size {
            shift += 1;
            anyhow::ensure!(shift <= 12, "unsupported block size {}", block_size);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(writable && !raw)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            shift,
            blocks,
            raw,
            slots: Vec::new(),
            serial: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn block_size(&self) -> u32 {
        1 << self.shift
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Reads one sector; returns the byte count, 0 when the address lies
    /// beyond the medium.
    pub fn read_sector(&mut self, lba: u64, out: &mut [u8]) -> Result<usize, CacheError> {
        if lba >= self.blocks {
            return Ok(0);
        }

        let slot = self.assign_track((lba >> 8) as u32)?;
        Ok(self.slots[slot].track.read_sector((lba & 0xFF) as usize, out))
    }

    /// Writes one sector; returns the byte count, 0 when the address lies
    /// beyond the medium.
    pub fn write_sector(&mut self, lba: u64, data: &[u8]) -> Result<usize, CacheError> {
        if self.raw {
            return Err(CacheError::RawWrite);
        }
        if lba >= self.blocks {
            return Ok(0);
        }

        let slot = self.assign_track((lba >> 8) as u32)?;
        Ok(self
            .slots[slot]
            .track
            .write_sector((lba & 0xFF) as usize, data))
    }

    /// Writes back every dirty track
    pub fn flush(&mut self) -> Result<(), CacheError> {
        for slot in &mut self.slots {
            if !slot.track.is_modified() {
                continue;
            }

            self.stats.cache_miss_write_count += 1;
            if let Err(e) = slot.track.save(&mut self.file) {
                self.stats.write_error_count += 1;
                return Err(e.into());
            }
        }

        Ok(())
    }

    /// Returns the slot of the requested track, loading and evicting as
    /// needed
    fn assign_track(&mut self, track_no: u32) -> Result<usize, CacheError> {
        self.update_serial();

        if let Some(slot) = self
            .slots
            .iter()
            .position(|s| s.track.track() == track_no)
        {
            self.slots[slot].serial = self.serial;
            return Ok(slot);
        }

        // The last track of the image may hold less than 256 sectors
        let sectors = (self.blocks - (u64::from(track_no) << 8)).min(0x100) as usize;

        let mut track = DiskTrack::new(track_no, self.shift, sectors, self.raw);
        self.stats.cache_miss_read_count += 1;
        if let Err(e) = track.load(&mut self.file) {
            self.stats.read_error_count += 1;
            return Err(e.into());
        }

        if self.slots.len() < CACHE_SLOTS {
            self.slots.push(CacheSlot {
                serial: self.serial,
                track,
            });
            return Ok(self.slots.len() - 1);
        }

        // Prefer dropping the least-recently-used clean track; flush the
        // least-recently-used dirty track only if there is no clean one
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.track.is_modified())
            .min_by_key(|(_, s)| s.serial)
            .map(|(i, _)| i);

        let victim = match victim {
            Some(slot) => slot,
            None => {
                let slot = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.serial)
                    .map(|(i, _)| i)
                    .unwrap();

                self.stats.cache_miss_write_count += 1;
                if let Err(e) = self.slots[slot].track.save(&mut self.file) {
                    self.stats.write_error_count += 1;
                    return Err(e.into());
                }
                slot
            }
        };

        self.slots[victim] = CacheSlot {
            serial: self.serial,
            track,
        };
        Ok(victim)
    }

    fn update_serial(&mut self) {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == 0 {
            for slot in &mut self.slots {
                slot.serial = 0;
            }
        }
    }
}
