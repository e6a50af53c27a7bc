//! Block-oriented disk targets: fixed disk, removable disk, magneto-optical
//! and SASI disk
//!
//! All block commands are thin translators: extract LBA and transfer length
//! from the CDB, range-check against the block count, then go through the
//! track cache.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::ensure;

use crate::cache::{CacheError, DiskCache};
use crate::device::modepage::ModePageOverrides;
use crate::device::storage::{FileRegistry, StorageState, StorageTarget};
use crate::device::target::ScsiTarget;
use crate::device::{Device, DeviceType, ScsiLevel, StatCategory, Statistic};
use crate::scsi::{
    be16, be24, be32, be64, put_be16, put_be32, put_be64, Asc, CmdOutput, CmdResult, ScsiCommand,
    ScsiError, SenseKey, Status,
};

const SUPPORTED_BLOCK_SIZES: &[u32] = &[512, 1024, 2048, 4096];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Rw6,
    Rw10,
    Rw16,
    Seek6,
    Seek10,
}

pub struct Disk {
    dev: Device,
    storage: StorageState,
    cache: Option<DiskCache>,
    overrides: Option<Arc<ModePageOverrides>>,
}

impl Disk {
    /// Creates a disk-type target. `dev_type` selects fixed, removable,
    /// magneto-optical or SASI behavior.
    pub fn new(dev_type: DeviceType, lun: u8, registry: FileRegistry) -> Self {
        let mut dev = Device::new(dev_type, lun);
        dev.stoppable = true;
        dev.protectable = true;

        match dev_type {
            DeviceType::Hd => {
                dev.set_product("HARDDISK", false).unwrap();
            }
            DeviceType::SasiHd => {
                dev.set_product("SASI HD", false).unwrap();
                dev.set_scsi_level(ScsiLevel::Scsi1Ccs);
            }
            DeviceType::RemovableHd => {
                dev.set_product("REMOVABLE HD", false).unwrap();
                dev.removable = true;
                dev.lockable = true;
            }
            DeviceType::Optical => {
                dev.set_product("OPTICAL DISK", false).unwrap();
                dev.removable = true;
                dev.lockable = true;
            }
            _ => panic!("not a disk device type: {:?}", dev_type),
        }

        Self {
            dev,
            storage: StorageState::new(SUPPORTED_BLOCK_SIZES, 512, registry),
            cache: None,
            overrides: None,
        }
    }

    pub fn set_mode_page_overrides(&mut self, overrides: Arc<ModePageOverrides>) {
        self.overrides = Some(overrides);
    }

    /// Fixed disks accept any block size divisible by 4; the other disk
    /// types are limited to the supported set.
    fn any_block_size(&self) -> bool {
        matches!(self.dev.dev_type(), DeviceType::Hd | DeviceType::SasiHd)
    }

    fn cache_mut(&mut self) -> Result<&mut DiskCache, ScsiError> {
        self.cache
            .as_mut()
            .ok_or(ScsiError::new(SenseKey::NotReady, Asc::MediumNotPresent))
    }

    /// Extracts start sector and sector count from the CDB and checks them
    /// against the capacity. The bool is false for transfers of 0 sectors,
    /// which are not an error but transfer nothing.
    fn check_and_get_start_and_count(
        &self,
        cdb: &[u8; 16],
        mode: AccessMode,
    ) -> Result<(bool, u64, u32), ScsiError> {
        let (start, count) = match mode {
            AccessMode::Rw6 | AccessMode::Seek6 => {
                let start = u64::from(be24(&cdb[1..4]) & 0x1F_FFFF);
                let count = match cdb[4] {
                    0 => 256,
                    n => u32::from(n),
                };
                (start, count)
            }
            AccessMode::Rw10 => (u64::from(be32(&cdb[2..6])), u32::from(be16(&cdb[7..9]))),
            AccessMode::Seek10 => (u64::from(be32(&cdb[2..6])), 0),
            AccessMode::Rw16 => (be64(&cdb[2..10]), be32(&cdb[10..14])),
        };

        log::trace!(
            "READ/WRITE/VERIFY/SEEK, start sector: {}, sector count: {}",
            start,
            count
        );

        let capacity = self.storage.blocks;
        if capacity == 0 || start + u64::from(count) > capacity {
            log::trace!(
                "Capacity of {} sector(s) exceeded: Trying to access sector {}, sector count {}",
                capacity,
                start,
                count
            );
            return Err(ScsiError::with_info(
                SenseKey::IllegalRequest,
                Asc::LbaOutOfRange,
                start as u32,
            ));
        }

        Ok((
            count != 0 || matches!(mode, AccessMode::Seek6 | AccessMode::Seek10),
            start,
            count,
        ))
    }

    fn read_cmd(&mut self, cdb: &[u8; 16], mode: AccessMode) -> CmdResult {
        self.dev.check_ready()?;

        let (valid, start, count) = self.check_and_get_start_and_count(cdb, mode)?;
        if !valid {
            return Ok(CmdOutput::Status(Status::Good));
        }

        let block_size = self.storage.block_size as usize;
        let mut buf = vec![0u8; count as usize * block_size];

        let cache = self.cache_mut()?;
        for i in 0..count as usize {
            let lba = start + i as u64;
            match cache.read_sector(lba, &mut buf[i * block_size..(i + 1) * block_size]) {
                Ok(n) if n == block_size => (),
                Ok(_) => {
                    return Err(ScsiError::with_info(
                        SenseKey::IllegalRequest,
                        Asc::LbaOutOfRange,
                        lba as u32,
                    ));
                }
                Err(_) => {
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

    fn write_cmd(&mut self, cdb: &[u8; 16], mode: AccessMode, outdata: Option<&[u8]>) -> CmdResult {
        if self.dev.write_protected {
            return Err(ScsiError::new(SenseKey::DataProtect, Asc::WriteProtected));
        }

        self.dev.check_ready()?;

        let (valid, start, count) = self.check_and_get_start_and_count(cdb, mode)?;
        if !valid {
            return Ok(CmdOutput::Status(Status::Good));
        }

        let block_size = self.storage.block_size as usize;
        let Some(data) = outdata else {
            return Ok(CmdOutput::DataOut(count as usize * block_size));
        };

        let cache = self.cache_mut()?;
        for i in 0..count as usize {
            let lba = start + i as u64;
            match cache.write_sector(lba, &data[i * block_size..(i + 1) * block_size]) {
                Ok(n) if n == block_size => (),
                Ok(_) => {
                    return Err(ScsiError::with_info(
                        SenseKey::IllegalRequest,
                        Asc::LbaOutOfRange,
                        lba as u32,
                    ));
                }
                Err(CacheError::RawWrite) => {
                    return Err(ScsiError::new(SenseKey::DataProtect, Asc::WriteProtected));
                }
                Err(CacheError::Io(_)) => {
                    return Err(ScsiError::with_info(
                        SenseKey::MediumError,
                        Asc::WriteFault,
                        lba as u32,
                    ));
                }
            }
        }

        self.storage.write_count += u64::from(count);
        Ok(CmdOutput::Status(Status::Good))
    }

    /// VERIFY without BYTCHK transfers no data; the cache is flushed first
    /// so the verification covers what is on the medium.
    fn verify_cmd(&mut self, cdb: &[u8; 16], mode: AccessMode) -> CmdResult {
        self.dev.check_ready()?;
        self.flush_medium();

        self.check_and_get_start_and_count(cdb, mode)?;
        Ok(CmdOutput::Status(Status::Good))
    }

    fn seek_cmd(&mut self, cdb: &[u8; 16], mode: AccessMode) -> CmdResult {
        self.check_and_get_start_and_count(cdb, mode)?;
        self.dev.check_ready()?;
        Ok(CmdOutput::Status(Status::Good))
    }

    /// READ LONG and WRITE LONG act as plain reads/writes; only transfer
    /// lengths of 0 or the block size are supported.
    fn read_write_long(
        &mut self,
        cdb: &[u8; 16],
        mode16: bool,
        write: bool,
        outdata: Option<&[u8]>,
    ) -> CmdResult {
        // The RelAdr bit is only permitted with linked commands
        if !mode16 && cdb[1] & 0x01 != 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }

        let sector = if mode16 {
            be64(&cdb[2..10])
        } else {
            u64::from(be32(&cdb[2..6]))
        };
        if sector >= self.storage.blocks {
            return Err(ScsiError::with_info(
                SenseKey::IllegalRequest,
                Asc::LbaOutOfRange,
                sector as u32,
            ));
        }

        let length = if mode16 {
            be16(&cdb[12..14])
        } else {
            be16(&cdb[7..9])
        };
        if length == 0 {
            return Ok(CmdOutput::Status(Status::Good));
        }
        if u32::from(length) != self.storage.block_size {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }

        self.dev.check_ready()?;

        let block_size = self.storage.block_size as usize;
        if write {
            let Some(data) = outdata else {
                if self.dev.write_protected {
                    return Err(ScsiError::new(SenseKey::DataProtect, Asc::WriteProtected));
                }
                return Ok(CmdOutput::DataOut(block_size));
            };

            let cache = self.cache_mut()?;
            match cache.write_sector(sector, data) {
                Ok(n) if n == block_size => {
                    self.storage.write_count += 1;
                    Ok(CmdOutput::Status(Status::Good))
                }
                Err(CacheError::RawWrite) => {
                    Err(ScsiError::new(SenseKey::DataProtect, Asc::WriteProtected))
                }
                _ => Err(ScsiError::with_info(
                    SenseKey::MediumError,
                    Asc::WriteFault,
                    sector as u32,
                )),
            }
        } else {
            let mut buf = vec![0u8; block_size];
            let cache = self.cache_mut()?;
            match cache.read_sector(sector, &mut buf) {
                Ok(n) if n == block_size => {
                    self.storage.read_count += 1;
                    Ok(CmdOutput::DataIn(buf))
                }
                _ => Err(ScsiError::with_info(
                    SenseKey::MediumError,
                    Asc::ReadFault,
                    sector as u32,
                )),
            }
        }
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

        // If the capacity exceeds 32 bits the initiator has to use
        // READ CAPACITY(16)
        let capacity = self.storage.blocks - 1;
        put_be32(
            &mut buf[0..4],
            capacity.min(u64::from(u32::MAX)) as u32,
        );
        put_be32(&mut buf[4..8], self.storage.block_size);

        Ok(CmdOutput::DataIn(buf))
    }

    fn read_capacity16(&mut self, cdb: &[u8; 16]) -> CmdResult {
        self.dev.check_ready()?;

        if self.storage.blocks == 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::MediumNotPresent,
            ));
        }

        let mut buf = vec![0u8; 32];
        put_be64(&mut buf[0..8], self.storage.blocks - 1);
        put_be32(&mut buf[8..12], self.storage.block_size);

        let allocation_length = be32(&cdb[10..14]) as usize;
        buf.truncate(allocation_length.min(32));
        Ok(CmdOutput::DataIn(buf))
    }

    fn format_unit(&mut self, cdb: &[u8; 16]) -> CmdResult {
        self.dev.check_ready()?;

        // FMTDATA=1 is not supported, unless there is no defect list
        if cdb[1] & 0x10 != 0 && cdb[4] != 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }

        Ok(CmdOutput::Status(Status::Good))
    }

    fn synchronize_cache(&mut self) -> CmdResult {
        if let Some(cache) = self.cache.as_mut() {
            if cache.flush().is_err() {
                return Err(ScsiError::new(SenseKey::MediumError, Asc::WriteFault));
            }
        }
        Ok(CmdOutput::Status(Status::Good))
    }

    fn read_defect_data10(&mut self, cdb: &[u8; 16]) -> CmdResult {
        let allocation_length = (be16(&cdb[7..9]) as usize).min(4);

        // The defect list is empty
        Ok(CmdOutput::DataIn(vec![0u8; allocation_length]))
    }
}

impl StorageTarget for Disk {
    fn storage(&self) -> &StorageState {
        &self.storage
    }

    fn storage_mut(&mut self) -> &mut StorageState {
        &mut self.storage
    }

    fn flush_medium(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.flush() {
                log::error!("Flushing cache failed: {}", e);
            }
        }
    }

    fn drop_medium(&mut self) {
        self.cache = None;
        self.storage.blocks = 0;
    }

    fn rebind_medium(&mut self, path: &Path) -> anyhow::Result<()> {
        self.open(path)
    }
}

impl ScsiTarget for Disk {
    fn device(&self) -> &Device {
        &self.dev
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    fn inquiry_flags(&self) -> u8 {
        // Synchronous transfer support
        0x10
    }

    fn supports_mode_pages(&self) -> bool {
        true
    }

    fn custom_mode_pages(&self) -> Option<&ModePageOverrides> {
        self.overrides.as_deref()
    }

    fn block_descriptor(&self) -> Option<(u64, u32)> {
        Some((self.storage.blocks, self.storage.block_size))
    }

    fn setup_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        // Page 1 (read-write error recovery)
        if page == 0x01 || page == 0x3F {
            let mut buf = vec![0u8; 12];
            if !changeable {
                // TB, PER, DTE, retry count and recovery time limit of a
                // period-correct drive
                buf[2] = 0x26;
                buf[3] = 1;
                buf[8] = 1;
                buf[11] = 218;
            }
            pages.insert(0x01, buf);
        }

        // Page 2 (disconnect-reconnect)
        if page == 0x02 || page == 0x3F {
            pages.insert(0x02, vec![0u8; 16]);
        }

        // Page 3 (format device)
        if page == 0x03 || page == 0x3F {
            let mut buf = vec![0u8; 24];
            if changeable {
                // The block size is simulated to be changeable in
                // multiples of 4
                put_be16(&mut buf[12..14], 0xFFFF);
            } else {
                if self.dev.ready {
                    // Tracks per zone, sectors per track, the current
                    // block size, interleave and skew factors
                    buf[3] = 0x08;
                    put_be16(&mut buf[10..12], 25);
                    put_be16(&mut buf[12..14], self.storage.block_size as u16);
                    put_be16(&mut buf[14..16], 1);
                    put_be16(&mut buf[16..18], 11);
                    put_be16(&mut buf[18..20], 20);
                }
                buf[20] = if self.dev.removable { 0x20 } else { 0x00 };
                // Hard-sectored
                buf[20] |= 0x40;
            }
            pages.insert(0x03, buf);
        }

        // Page 4 (rigid disk drive geometry)
        if page == 0x04 || page == 0x3F {
            let mut buf = vec![0u8; 24];
            if !changeable && self.dev.ready {
                // Cylinder count for 25 sectors/track and 8 heads
                let cylinders = (self.storage.blocks >> 3) / 25;
                put_be32(&mut buf[1..5], cylinders as u32);
                buf[5] = 0x08;
                put_be16(&mut buf[20..22], 7200);
            }
            pages.insert(0x04, buf);
        }

        // Page 6 (optical memory)
        if self.dev.dev_type() == DeviceType::Optical && (page == 0x06 || page == 0x3F) {
            pages.insert(0x06, vec![0u8; 4]);
        }

        // Page 7 (verify error recovery)
        if page == 0x07 || page == 0x3F {
            let mut buf = vec![0u8; 12];
            if !changeable {
                // Verify retry count
                buf[3] = 1;
            }
            pages.insert(0x07, buf);
        }

        // Page 8 (caching)
        if page == 0x08 || page == 0x3F {
            let mut buf = vec![0u8; 12];
            if !changeable {
                // Only the read cache is valid; pre-fetch is disabled
                put_be16(&mut buf[4..6], 0xFFFF);
                put_be16(&mut buf[8..10], 0xFFFF);
                put_be16(&mut buf[10..12], 0xFFFF);
            }
            pages.insert(0x08, buf);
        }

        // Page 10 (control mode)
        if page == 0x0A || page == 0x3F {
            pages.insert(0x0A, vec![0u8; 8]);
        }

        // Page 48 (Apple vendor page), needed by older Apple setup tools
        if page == 0x30 || page == 0x3F {
            let mut buf = vec![0u8; 24];
            if !changeable {
                buf[2..24].copy_from_slice(b"APPLE COMPUTER, INC   ");
            }
            pages.insert(0x30, buf);
        }
    }

    fn verify_block_size_change(&self, requested: u32, temporary: bool) -> Result<u32, ScsiError> {
        if requested == self.storage.block_size {
            return Ok(requested);
        }

        if requested != 0 && requested % 4 == 0 {
            if temporary {
                return Ok(requested);
            }

            if self.storage.supported_block_sizes.contains(&requested) {
                log::warn!(
                    "Permanent block size change from {} to {} bytes requested",
                    self.storage.block_size,
                    requested
                );
                return Ok(requested);
            }
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

        // Rebuild the cache over the new geometry
        self.flush_medium();
        if self.cache.is_some() {
            let path = self
                .storage
                .filename()
                .map(Path::to_path_buf)
                .expect("cache without filename");
            let writable = !self.dev.read_only;
            self.cache = match DiskCache::new(&path, size, self.storage.blocks, false, writable) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    log::error!("Can't reinitialize cache: {:#}", e);
                    return Err(ScsiError::new(SenseKey::MediumError, Asc::WriteFault));
                }
            };
        }

        log::trace!("Changed block size from {} to {} bytes", current, size);
        Ok(())
    }

    fn supports_file(&self) -> bool {
        true
    }

    fn filename(&self) -> Option<&Path> {
        self.storage.filename()
    }

    fn open(&mut self, path: &Path) -> anyhow::Result<()> {
        self.storage.block_size = self.storage.effective_block_size();

        let size = self.storage.bind_file(path, &mut self.dev)?;

        let blocks = size / u64::from(self.storage.block_size);
        ensure!(blocks > 0, "image file {} has 0 blocks", path.display());
        self.storage.blocks = blocks;

        let writable = !self.dev.read_only;
        self.cache = Some(DiskCache::new(
            path,
            self.storage.block_size,
            blocks,
            false,
            writable,
        )?);

        Ok(())
    }

    fn reserve_file(&mut self) -> bool {
        let (id, lun) = (self.dev.id(), self.dev.lun());
        self.storage.reserve(id, lun)
    }

    fn eject(&mut self, force: bool) -> bool {
        self.eject_medium(force)
    }

    fn flush(&mut self) {
        self.flush_medium();
    }

    fn cleanup(&mut self) {
        self.flush_medium();
        self.storage.unreserve();
    }

    fn block_size(&self) -> Option<u32> {
        Some(self.storage.block_size)
    }

    fn block_count(&self) -> Option<u64> {
        Some(self.storage.blocks)
    }

    fn set_configured_block_size(&mut self, size: u32) -> bool {
        let any_size = self.any_block_size();
        self.storage.set_configured_block_size(size, any_size)
    }

    fn statistics(&self) -> Vec<Statistic> {
        let (id, lun) = (self.dev.id(), self.dev.lun());
        let mut statistics = vec![
            Statistic {
                id,
                lun,
                category: StatCategory::Info,
                key: "block_read_count".to_string(),
                value: self.storage.read_count,
            },
            Statistic {
                id,
                lun,
                category: StatCategory::Info,
                key: "block_write_count".to_string(),
                value: self.storage.write_count,
            },
        ];

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
                category: StatCategory::Info,
                key: "cache_miss_write_count".to_string(),
                value: cache.stats.cache_miss_write_count,
            });
            statistics.push(Statistic {
                id,
                lun,
                category: StatCategory::Error,
                key: "read_error_count".to_string(),
                value: cache.stats.read_error_count,
            });
            statistics.push(Statistic {
                id,
                lun,
                category: StatCategory::Error,
                key: "write_error_count".to_string(),
                value: cache.stats.write_error_count,
            });
        }

        statistics
    }

    fn type_dispatch(&mut self, opcode: ScsiCommand, cdb: &[u8; 16], outdata: Option<&[u8]>)
        -> CmdResult {
        match opcode {
            ScsiCommand::Rezero | ScsiCommand::ReassignBlocks => {
                self.dev.check_ready()?;
                Ok(CmdOutput::Status(Status::Good))
            }
            ScsiCommand::FormatUnit => self.format_unit(cdb),
            ScsiCommand::Read6 => self.read_cmd(cdb, AccessMode::Rw6),
            ScsiCommand::Read10 => self.read_cmd(cdb, AccessMode::Rw10),
            ScsiCommand::Read16 => self.read_cmd(cdb, AccessMode::Rw16),
            ScsiCommand::Write6 => self.write_cmd(cdb, AccessMode::Rw6, outdata),
            ScsiCommand::Write10 => self.write_cmd(cdb, AccessMode::Rw10, outdata),
            ScsiCommand::Write16 => self.write_cmd(cdb, AccessMode::Rw16, outdata),
            ScsiCommand::Seek6 => self.seek_cmd(cdb, AccessMode::Seek6),
            ScsiCommand::Seek10 => self.seek_cmd(cdb, AccessMode::Seek10),
            ScsiCommand::Verify10 => self.verify_cmd(cdb, AccessMode::Rw10),
            ScsiCommand::Verify16 => self.verify_cmd(cdb, AccessMode::Rw16),
            ScsiCommand::ReadCapacity10 => self.read_capacity10(),
            ScsiCommand::ReadCapacity16ReadLong16 => match cdb[1] & 0x1F {
                0x10 => self.read_capacity16(cdb),
                0x11 => self.read_write_long(cdb, true, false, outdata),
                _ => Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidFieldInCdb,
                )),
            },
            ScsiCommand::ReadLong10 => self.read_write_long(cdb, false, false, outdata),
            ScsiCommand::WriteLong10 => self.read_write_long(cdb, false, true, outdata),
            ScsiCommand::WriteLong16 => self.read_write_long(cdb, true, true, outdata),
            ScsiCommand::SynchronizeCache10 | ScsiCommand::SynchronizeCache16 => {
                self.synchronize_cache()
            }
            ScsiCommand::ReadDefectData10 => self.read_defect_data10(cdb),
            ScsiCommand::StartStop => self.start_stop_unit(cdb),
            ScsiCommand::PreventAllowMediumRemoval => self.prevent_allow_removal(cdb),
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
