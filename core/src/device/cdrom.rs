//! SCSI CD-ROM drive
//!
//! Supports cooked images (plain 2048-byte sectors) and raw images built
//! from 0x930-byte frames, where each frame carries a 0x10-byte header that
//! is skipped on read. Raw images are detected by their size. CD-ROM media
//! are always write-protected.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::ensure;

use crate::cache::track::RAW_FRAME_SIZE;
use crate::cache::DiskCache;
use crate::device::modepage::ModePageOverrides;
use crate::device::storage::{FileRegistry, StorageState, StorageTarget};
use crate::device::target::ScsiTarget;
use crate::device::{Device, DeviceType, StatCategory, Statistic};
use crate::scsi::{
    be16, be24, be32, be64, put_be16, put_be32, Asc, CmdOutput, CmdResult, ScsiCommand, ScsiError,
    SenseKey, Status,
};

const SUPPORTED_BLOCK_SIZES: &[u32] = &[512, 2048];

const TRACK_LEADOUT: u8 = 0xAA;

pub struct CdRom {
    dev: Device,
    storage: StorageState,
    cache: Option<DiskCache>,
    raw: bool,
    overrides: Option<Arc<ModePageOverrides>>,
}

impl CdRom {
    pub fn new(lun: u8, registry: FileRegistry) -> Self {
        let mut dev = Device::new(DeviceType::CdRom, lun);
        dev.set_product("CD-ROM", false).unwrap();
        dev.read_only = true;
        dev.removable = true;
        dev.removed = true;
        dev.lockable = true;
        dev.stoppable = true;

        Self {
            dev,
            storage: StorageState::new(SUPPORTED_BLOCK_SIZES, 2048, registry),
            cache: None,
            raw: false,
            overrides: None,
        }
    }

    pub fn set_mode_page_overrides(&mut self, overrides: Arc<ModePageOverrides>) {
        self.overrides = Some(overrides);
    }

    fn read_cmd(&mut self, cdb: &[u8; 16], start: u64, count: u32) -> CmdResult {
        let _ = cdb;
        self.dev.check_ready()?;

        let capacity = self.storage.blocks;
        if capacity == 0 || start + u64::from(count) > capacity {
            return Err(ScsiError::with_info(
                SenseKey::IllegalRequest,
                Asc::LbaOutOfRange,
                start as u32,
            ));
        }
        if count == 0 {
            return Ok(CmdOutput::Status(Status::Good));
        }

        let block_size = self.storage.block_size as usize;
        let mut buf = vec![0u8; count as usize * block_size];

        let Some(cache) = self.cache.as_mut() else {
            return Err(ScsiError::new(SenseKey::NotReady, Asc::MediumNotPresent));
        };

        for i in 0..count as usize {
            let lba = start + i as u64;
            match cache.read_sector(lba, &mut buf[i * block_size..(i + 1) * block_size]) {
                Ok(n) if n == block_size => (),
                _ => {
                    return Err(ScsiError::with_info(
                        SenseKey::MediumError,
                        Asc::ReadFault,
                        lba as u32,
                    ));
                }
            }
        }

        self.storage.read_count += u64::from(count);
        Ok(CmdOutput::DataIn(buf))
    }

    fn read_capacity10(&mut self) -> CmdResult {
        self.dev.check_ready()?;

        if self.storage.blocks == 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::MediumNotPresent,
            ));
        }

        let mut buf = vec![0u8; 8];
        put_be32(&mut buf[0..4], (self.storage.blocks - 1) as u32);
        put_be32(&mut buf[4..8], self.storage.block_size);
        Ok(CmdOutput::DataIn(buf))
    }

    fn read_toc(&mut self, cdb: &[u8; 16]) -> CmdResult {
        self.dev.check_ready()?;

        let format = cdb[9] >> 6;
        let track = cdb[6];
        let allocation_length = be16(&cdb[7..9]) as usize;

        let mut result = match format {
            0 => match track {
                // Single data track plus lead-out
                0 | 1 => {
                    let mut buf = vec![0u8; 0x14];
                    buf[1] = 0x12;
                    buf[2] = 1;
                    buf[3] = 1;

                    // Track descriptor for track 1: digital data, start 0
                    buf[5] = 0x14;
                    buf[6] = 1;

                    // Track descriptor for the lead-out
                    buf[13] = 0x14;
                    buf[14] = TRACK_LEADOUT;
                    put_be32(&mut buf[16..20], self.storage.blocks as u32);
                    buf
                }
                TRACK_LEADOUT => {
                    let mut buf = vec![0u8; 12];
                    buf[1] = 0x0A;
                    buf[2] = 1;
                    buf[3] = 1;
                    buf[5] = 0x14;
                    buf[6] = TRACK_LEADOUT;
                    put_be32(&mut buf[8..12], self.storage.blocks as u32);
                    buf
                }
                _ => {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::InvalidFieldInCdb,
                    ));
                }
            },
            // Session TOC
            1 => {
                let mut buf = vec![0u8; 12];
                buf[1] = 0x0A;
                buf[2] = 1;
                buf[3] = 1;
                buf[5] = 0x14;
                buf[6] = 1;
                buf
            }
            _ => {
                log::error!("Unknown READ TOC format: {}", format);
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidFieldInCdb,
                ));
            }
        };

        result.truncate(allocation_length);
        Ok(CmdOutput::DataIn(result))
    }
}

impl StorageTarget for CdRom {
    fn storage(&self) -> &StorageState {
        &self.storage
    }

    fn storage_mut(&mut self) -> &mut StorageState {
        &mut self.storage
    }

    fn flush_medium(&mut self) {
        // Nothing to write back
    }

    fn drop_medium(&mut self) {
        self.cache = None;
        self.storage.blocks = 0;
    }

    fn rebind_medium(&mut self, path: &Path) -> anyhow::Result<()> {
        self.open(path)
    }
}

impl ScsiTarget for CdRom {
    fn device(&self) -> &Device {
        &self.dev
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    fn inquiry_flags(&self) -> u8 {
        0x10
    }

    fn supports_mode_pages(&self) -> bool {
        true
    }

    fn custom_mode_pages(&self) -> Option<&ModePageOverrides> {
        self.overrides.as_deref()
    }

    fn ms_media_type(&self) -> u8 {
        // 120mm CD-ROM data only
        0x01
    }

    fn block_descriptor(&self) -> Option<(u64, u32)> {
        Some((self.storage.blocks, self.storage.block_size))
    }

    fn setup_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        // Page 1 (read-write error recovery)
        if page == 0x01 || page == 0x3F {
            let mut buf = vec![0u8; 12];
            if !changeable {
                buf[3] = 1;
            }
            pages.insert(0x01, buf);
        }

        // Page 13 (CD-ROM device parameters)
        if page == 0x0D || page == 0x3F {
            let mut buf = vec![0u8; 8];
            if !changeable {
                // 60 seconds per MSF minute unit, 75 frames per second unit
                put_be16(&mut buf[4..6], 60);
                put_be16(&mut buf[6..8], 75);
            }
            pages.insert(0x0D, buf);
        }

        // Page 14 (CD-ROM audio control)
        if page == 0x0E || page == 0x3F {
            pages.insert(0x0E, vec![0u8; 16]);
        }

        // Page 48 (Apple vendor page)
        if page == 0x30 || page == 0x3F {
            let mut buf = vec![0u8; 24];
            if !changeable {
                buf[2..24].copy_from_slice(b"APPLE COMPUTER, INC   ");
            }
            pages.insert(0x30, buf);
        }
    }

    fn verify_block_size_change(&self, requested: u32, _temporary: bool) -> Result<u32, ScsiError> {
        if requested == self.storage.block_size {
            return Ok(requested);
        }

        // Raw images are tied to the 2048-byte frame payload
        if !self.raw && SUPPORTED_BLOCK_SIZES.contains(&requested) {
            return Ok(requested);
        }

        Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::InvalidFieldInParameterList,
        ))
    }

    fn change_block_size(&mut self, size: u32) -> Result<(), ScsiError> {
        let current = self.storage.block_size;
        if size == current {
            return Ok(());
        }

        let capacity = u64::from(current) * self.storage.blocks;
        self.storage.block_size = size;
        self.storage.blocks = capacity / u64::from(size);

        if self.cache.is_some() {
            let path = self
                .storage
                .filename()
                .map(Path::to_path_buf)
                .expect("cache without filename");
            self.cache =
                match DiskCache::new(&path, size, self.storage.blocks, false, false) {
                    Ok(cache) => Some(cache),
                    Err(e) => {
                        log::error!("Can't reinitialize cache: {:#}", e);
                        return Err(ScsiError::new(SenseKey::MediumError, Asc::ReadFault));
                    }
                };
        }

        Ok(())
    }

    fn supports_file(&self) -> bool {
        true
    }

    fn filename(&self) -> Option<&Path> {
        self.storage.filename()
    }

    fn open(&mut self, path: &Path) -> anyhow::Result<()> {
        let size = self.storage.bind_file(path, &mut self.dev)?;

        // CD-ROM media are never writable
        self.dev.read_only = true;
        self.dev.protectable = false;

        // Raw images consist of 0x930-byte frames; anything else is cooked
        let block_size = self.storage.effective_block_size();
        self.raw = size % RAW_FRAME_SIZE == 0 && size % u64::from(block_size) != 0;

        let (block_size, blocks) = if self.raw {
            (2048, size / RAW_FRAME_SIZE)
        } else {
            (block_size, size / u64::from(block_size))
        };
        ensure!(blocks > 0, "image file {} has 0 blocks", path.display());

        self.storage.block_size = block_size;
        self.storage.blocks = blocks;
        self.cache = Some(DiskCache::new(path, block_size, blocks, self.raw, false)?);

        Ok(())
    }

    fn reserve_file(&mut self) -> bool {
        let (id, lun) = (self.dev.id(), self.dev.lun());
        self.storage.reserve(id, lun)
    }

    fn eject(&mut self, force: bool) -> bool {
        self.eject_medium(force)
    }

    fn cleanup(&mut self) {
        self.storage.unreserve();
    }

    fn block_size(&self) -> Option<u32> {
        Some(self.storage.block_size)
    }

    fn block_count(&self) -> Option<u64> {
        Some(self.storage.blocks)
    }

    fn set_configured_block_size(&mut self, size: u32) -> bool {
        self.storage.set_configured_block_size(size, false)
    }

    fn statistics(&self) -> Vec<Statistic> {
        let (id, lun) = (self.dev.id(), self.dev.lun());
        let mut statistics = vec![Statistic {
            id,
            lun,
            category: StatCategory::Info,
            key: "block_read_count".to_string(),
            value: self.storage.read_count,
        }];

        if let Some(cache) = self.cache.as_ref() {
            statistics.push(Statistic {
                id,
                lun,
                category: StatCategory::Info,
                key: "cache_miss_read_count".to_string(),
                value: cache.stats.cache_miss_read_count,
            });
            statistics.push(Statistic {
                id,
                lun,
                category: StatCategory::Error,
                key: "read_error_count".to_string(),
                value: cache.stats.read_error_count,
            });
        }

        statistics
    }

    fn type_dispatch(&mut self, opcode: ScsiCommand, cdb: &[u8; 16], outdata: Option<&[u8]>)
        -> CmdResult {
        let _ = outdata;
        match opcode {
            ScsiCommand::Read6 => {
                let start = u64::from(be24(&cdb[1..4]) & 0x1F_FFFF);
                let count = match cdb[4] {
                    0 => 256,
                    n => u32::from(n),
                };
                self.read_cmd(cdb, start, count)
            }
            ScsiCommand::Read10 => {
                let start = u64::from(be32(&cdb[2..6]));
                let count = u32::from(be16(&cdb[7..9]));
                self.read_cmd(cdb, start, count)
            }
            ScsiCommand::Read16 => {
                let start = be64(&cdb[2..10]);
                let count = be32(&cdb[10..14]);
                self.read_cmd(cdb, start, count)
            }
            ScsiCommand::Seek6 | ScsiCommand::Seek10 => {
                self.dev.check_ready()?;
                Ok(CmdOutput::Status(Status::Good))
            }
            ScsiCommand::ReadCapacity10 => self.read_capacity10(),
            ScsiCommand::ReadToc => self.read_toc(cdb),
            ScsiCommand::StartStop => self.start_stop_unit(cdb),
            ScsiCommand::PreventAllowMediumRemoval => self.prevent_allow_removal(cdb),
            ScsiCommand::Write6
            | ScsiCommand::Write10
            | ScsiCommand::Write16
            | ScsiCommand::WriteLong10
            | ScsiCommand::WriteLong16
            | ScsiCommand::FormatUnit => {
                Err(ScsiError::new(SenseKey::DataProtect, Asc::WriteProtected))
            }
            _ => {
                log::trace!("Received unsupported command: ${:02x}", opcode as u8);
                Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidCommandOperationCode,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::track::RAW_HEADER_SIZE;
    use std::path::PathBuf;

    fn cdb(bytes: &[u8]) -> [u8; 16] {
        let mut c = [0u8; 16];
        c[..bytes.len()].copy_from_slice(bytes);
        c
    }

    fn cooked_image(name: &str, blocks: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!("drift-cd-{}-{}", std::process::id(), name));
        let mut content = vec![0u8; blocks * 2048];
        for (i, chunk) in content.chunks_mut(2048).enumerate() {
            chunk.fill((i % 250) as u8);
        }
        std::fs::write(&path, &content).unwrap();
        path
    }

    #[test]
    fn cooked_image_read() {
        let path = cooked_image("cooked", 16);
        let mut cd = CdRom::new(0, FileRegistry::default());
        cd.open(&path).unwrap();
        assert!(!cd.raw);
        assert_eq!(cd.block_count(), Some(16));

        let Ok(CmdOutput::DataIn(data)) =
            cd.dispatch(0, &cdb(&[0x28, 0, 0, 0, 0, 3, 0, 0, 1, 0]), None)
        else {
            panic!("READ failed");
        };
        assert_eq!(data.len(), 2048);
        assert!(data.iter().all(|&b| b == 3));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn raw_image_detected_and_read() {
        let frames = 8usize;
        let mut image = vec![0u8; frames * RAW_FRAME_SIZE as usize];
        for f in 0..frames {
            let base = f * RAW_FRAME_SIZE as usize;
            image[base..base + RAW_HEADER_SIZE as usize].fill(0xEE);
            image[base + RAW_HEADER_SIZE as usize..base + RAW_FRAME_SIZE as usize]
                .fill(f as u8 + 1);
        }
        let path = std::env::temp_dir().join(format!("drift-cd-{}-raw", std::process::id()));
        std::fs::write(&path, &image).unwrap();

        let mut cd = CdRom::new(0, FileRegistry::default());
        cd.open(&path).unwrap();
        assert!(cd.raw);
        assert_eq!(cd.block_count(), Some(8));
        assert_eq!(cd.block_size(), Some(2048));

        let Ok(CmdOutput::DataIn(data)) =
            cd.dispatch(0, &cdb(&[0x28, 0, 0, 0, 0, 2, 0, 0, 1, 0]), None)
        else {
            panic!("READ failed");
        };
        assert!(data.iter().all(|&b| b == 3));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn writes_rejected() {
        let path = cooked_image("nowrite", 4);
        let mut cd = CdRom::new(0, FileRegistry::default());
        cd.open(&path).unwrap();

        let e = cd
            .dispatch(0, &cdb(&[0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0]), None)
            .unwrap_err();
        assert_eq!(e, ScsiError::new(SenseKey::DataProtect, Asc::WriteProtected));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn toc_formats() {
        let path = cooked_image("toc", 4);
        let mut cd = CdRom::new(0, FileRegistry::default());
        cd.open(&path).unwrap();

        let Ok(CmdOutput::DataIn(toc)) =
            cd.dispatch(0, &cdb(&[0x43, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0]), None)
        else {
            panic!("READ TOC failed");
        };
        assert_eq!(toc[1], 0x12);
        assert_eq!(toc[6], 1);
        assert_eq!(toc[14], TRACK_LEADOUT);

        // Unknown format
        let e = cd
            .dispatch(0, &cdb(&[0x43, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0x80]), None)
            .unwrap_err();
        assert_eq!(e.asc, Asc::InvalidFieldInCdb);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn no_medium_reports_not_ready() {
        let mut cd = CdRom::new(0, FileRegistry::default());
        let e = cd
            .dispatch(0, &cdb(&[0x00, 0, 0, 0, 0, 0]), None)
            .unwrap_err();
        assert_eq!(e, ScsiError::new(SenseKey::NotReady, Asc::MediumNotPresent));
    }
}
