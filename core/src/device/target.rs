//! SCSI target generic/shared code
//!
//! `ScsiTarget` is the abstraction every emulated unit implements. The
//! default methods provide the SCSI primary command set; targets add their
//! device-specific commands by overriding `type_dispatch()`. Commands do not
//! touch the bus: they return a `CmdOutput` which the controller translates
//! into the data/status phases.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::bail;

use crate::device::modepage::{self, ModePageOverrides};
use crate::device::{Device, InitiatorId, ScsiLevel, Statistic};
use crate::scsi::{be16, Asc, CmdOutput, CmdResult, ScsiCommand, ScsiError, SenseKey, Status};

pub trait ScsiTarget: Send {
    fn device(&self) -> &Device;
    fn device_mut(&mut self) -> &mut Device;

    /// INQUIRY byte 7 capability flags
    fn inquiry_flags(&self) -> u8 {
        0
    }

    /// The standard 36-byte INQUIRY data
    fn inquiry_data(&self) -> Vec<u8> {
        let dev = self.device();
        let mut buf = vec![0u8; 0x1F + 5];

        buf[0] = dev.dev_type().inquiry_type();
        buf[1] = if dev.removable { 0x80 } else { 0x00 };
        buf[2] = dev.scsi_level() as u8;
        // Response data format is SCSI-2 unless the device is older
        buf[3] = if dev.scsi_level() >= ScsiLevel::Scsi2 {
            2
        } else {
            1
        };
        buf[4] = 0x1F;
        buf[7] = self.inquiry_flags();
        buf[8..36].copy_from_slice(&dev.padded_name());

        buf
    }

    // Mode page support, provided by targets that answer MODE SENSE
    fn supports_mode_pages(&self) -> bool {
        false
    }

    fn supports_save_parameters(&self) -> bool {
        false
    }

    /// Contributes the pages for the requested page code (or all pages for
    /// `0x3F`) into the map
    fn setup_mode_pages(&self, _pages: &mut BTreeMap<u8, Vec<u8>>, _page: u8, _changeable: bool) {}

    fn custom_mode_pages(&self) -> Option<&ModePageOverrides> {
        None
    }

    /// Medium type byte of the mode parameter header
    fn ms_media_type(&self) -> u8 {
        0
    }

    /// Block count and block size for the mode parameter block descriptor;
    /// None suppresses the descriptor
    fn block_descriptor(&self) -> Option<(u64, u32)> {
        None
    }

    /// Validates a block size change requested through MODE SELECT
    fn verify_block_size_change(&self, _requested: u32, _temporary: bool) -> Result<u32, ScsiError> {
        Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::InvalidFieldInParameterList,
        ))
    }

    fn change_block_size(&mut self, _size: u32) -> Result<(), ScsiError> {
        Ok(())
    }

    // Backing file support, provided by mass-storage targets

    fn supports_file(&self) -> bool {
        false
    }

    fn filename(&self) -> Option<&Path> {
        None
    }

    /// Binds and validates a backing image file
    fn open(&mut self, _path: &Path) -> anyhow::Result<()> {
        bail!("device does not support image files");
    }

    /// Inserts `filename -> (id, lun)` into the image reservation registry
    fn reserve_file(&mut self) -> bool {
        false
    }

    fn eject(&mut self, _force: bool) -> bool {
        false
    }

    /// Writes back any dirty cached data
    fn flush(&mut self) {}

    /// Detach-time cleanup: flush and release the image reservation
    fn cleanup(&mut self) {
        self.flush();
    }

    fn block_size(&self) -> Option<u32> {
        None
    }

    fn block_count(&self) -> Option<u64> {
        None
    }

    fn set_configured_block_size(&mut self, _size: u32) -> bool {
        false
    }

    fn statistics(&self) -> Vec<Statistic> {
        Vec::new()
    }

    /// Device-specific initialization when the unit is attached
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Device-specific commands beyond the primary command set
    fn type_dispatch(&mut self, opcode: ScsiCommand, cdb: &[u8; 16], outdata: Option<&[u8]>)
        -> CmdResult {
        let _ = (cdb, outdata);
        log::trace!("Received unsupported command: ${:02x}", opcode as u8);
        Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::InvalidCommandOperationCode,
        ))
    }

    /// Executes one command. `outdata` is None on the first call; commands
    /// that answer with `CmdOutput::DataOut(n)` are called a second time
    /// with the n bytes received from the initiator.
    fn dispatch(&mut self, initiator: InitiatorId, cdb: &[u8; 16], outdata: Option<&[u8]>)
        -> CmdResult {
        let Some(opcode) = num_traits::FromPrimitive::from_u8(cdb[0]) else {
            log::trace!("Received unknown command: ${:02x}", cdb[0]);
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidCommandOperationCode,
            ));
        };

        // A medium change must be reported on the next access, not only on
        // TEST UNIT READY
        if self.device().medium_changed
            && !matches!(opcode, ScsiCommand::Inquiry | ScsiCommand::RequestSense)
        {
            self.device_mut().medium_changed = false;
            return Err(ScsiError::new(
                SenseKey::UnitAttention,
                Asc::NotReadyToReadyChange,
            ));
        }

        match opcode {
            ScsiCommand::TestUnitReady => {
                self.device_mut().check_ready()?;
                Ok(CmdOutput::Status(Status::Good))
            }
            ScsiCommand::Inquiry => self.do_inquiry(cdb),
            ScsiCommand::RequestSense => Ok(CmdOutput::DataIn(self.request_sense_data(cdb))),
            ScsiCommand::Reserve6 => {
                self.device_mut().reserve(initiator);
                Ok(CmdOutput::Status(Status::Good))
            }
            ScsiCommand::Release6 => {
                self.device_mut().discard_reservation();
                Ok(CmdOutput::Status(Status::Good))
            }
            ScsiCommand::SendDiagnostic => {
                // Parameter lists are not supported
                if cdb[3] != 0 || cdb[4] != 0 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::InvalidFieldInCdb,
                    ));
                }
                Ok(CmdOutput::Status(Status::Good))
            }
            ScsiCommand::ModeSense6 | ScsiCommand::ModeSense10
                if self.supports_mode_pages() =>
            {
                Ok(CmdOutput::DataIn(modepage::mode_sense(self, opcode, cdb)?))
            }
            ScsiCommand::ModeSelect6 | ScsiCommand::ModeSelect10
                if self.supports_mode_pages() =>
            {
                modepage::mode_select(self, opcode, cdb, outdata)
            }
            _ => self.type_dispatch(opcode, cdb, outdata),
        }
    }

    fn do_inquiry(&mut self, cdb: &[u8; 16]) -> CmdResult {
        // EVPD and page code are not supported
        if cdb[1] & 0x01 != 0 || cdb[2] != 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }

        let mut buf = self.inquiry_data();
        let allocation_length = be16(&cdb[3..5]) as usize;
        buf.truncate(allocation_length);

        Ok(CmdOutput::DataIn(buf))
    }

    /// Builds the REQUEST SENSE response and clears the latched sense
    /// state. REQUEST SENSE never fails; a device that is not ready with no
    /// pending sense reports the medium state instead.
    fn request_sense_data(&mut self, cdb: &[u8; 16]) -> Vec<u8> {
        let dev = self.device_mut();

        if dev.sense.key == SenseKey::NoSense && !dev.ready {
            dev.set_sense(SenseKey::NotReady, Asc::MediumNotPresent);
        }

        let sense = dev.sense;
        let mut buf = vec![0u8; if sense.valid { 18 } else { 14 }];

        // Current error, fixed format
        buf[0] = 0x70;
        buf[2] = (sense.key as u8)
            | if sense.filemark { 0x80 } else { 0 }
            | if sense.eom { 0x40 } else { 0 }
            | if sense.ili { 0x20 } else { 0 };
        buf[7] = buf.len() as u8 - 8;
        buf[12] = sense.asc as u8;
        buf[13] = sense.ascq;

        if sense.valid {
            buf[0] |= 0x80;
            crate::scsi::put_be32(&mut buf[3..7], sense.information);
        }

        log::trace!(
            "REQUEST SENSE: {:?}, ASC {:?}{}",
            sense.key,
            sense.asc,
            if sense.valid {
                format!(", information ${:08x}", sense.information)
            } else {
                String::new()
            }
        );

        // REQUEST SENSE is idempotent-clearing
        dev.sense = Default::default();

        let allocation_length = cdb[4] as usize;
        buf.truncate(allocation_length);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::scsi::ShutdownMode;

    /// Minimal target with nothing but the primary command set
    struct PlainTarget {
        dev: Device,
    }

    impl PlainTarget {
        fn new() -> Self {
            let mut dev = Device::new(DeviceType::Hd, 0);
            dev.set_product("TESTDISK", false).unwrap();
            dev.ready = true;
            Self { dev }
        }
    }

    impl ScsiTarget for PlainTarget {
        fn device(&self) -> &Device {
            &self.dev
        }

        fn device_mut(&mut self) -> &mut Device {
            &mut self.dev
        }
    }

    fn cdb(bytes: &[u8]) -> [u8; 16] {
        let mut c = [0u8; 16];
        c[..bytes.len()].copy_from_slice(bytes);
        c
    }

    #[test]
    fn inquiry_truncation() {
        let mut t = PlainTarget::new();
        let full = t.inquiry_data();

        for n in 0..=255usize {
            let c = cdb(&[0x12, 0, 0, (n >> 8) as u8, n as u8, 0]);
            let Ok(CmdOutput::DataIn(data)) = t.dispatch(0, &c, None) else {
                panic!("INQUIRY failed");
            };
            assert_eq!(data.len(), n.min(full.len()));
            let head = [0x00, 0x00, 0x02, 0x02, 0x1F];
            assert_eq!(&data[..5.min(n)], &head[..5.min(n)]);
        }
    }

    #[test]
    fn inquiry_evpd_rejected() {
        let mut t = PlainTarget::new();
        let e = t
            .dispatch(0, &cdb(&[0x12, 0x01, 0, 0, 0xFF, 0]), None)
            .unwrap_err();
        assert_eq!(e, ScsiError::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
    }

    #[test]
    fn sense_latch_cleared_by_request_sense() {
        let mut t = PlainTarget::new();
        t.dev
            .set_sense(SenseKey::IllegalRequest, Asc::LbaOutOfRange);

        let Ok(CmdOutput::DataIn(data)) =
            t.dispatch(0, &cdb(&[0x03, 0, 0, 0, 0xFF, 0]), None)
        else {
            panic!("REQUEST SENSE failed");
        };
        assert_eq!(data.len(), 14);
        assert_eq!(data[0], 0x70);
        assert_eq!(data[2] & 0x0F, SenseKey::IllegalRequest as u8);
        assert_eq!(data[12], Asc::LbaOutOfRange as u8);

        // Second REQUEST SENSE reports no sense
        let Ok(CmdOutput::DataIn(data)) =
            t.dispatch(0, &cdb(&[0x03, 0, 0, 0, 0xFF, 0]), None)
        else {
            panic!("REQUEST SENSE failed");
        };
        assert_eq!(data[2] & 0x0F, SenseKey::NoSense as u8);
        assert_eq!(data[12], 0);
    }

    #[test]
    fn request_sense_information_field() {
        let mut t = PlainTarget::new();
        t.dev
            .set_sense_with_lba(SenseKey::MediumError, Asc::ReadFault, 0x1234);

        let Ok(CmdOutput::DataIn(data)) =
            t.dispatch(0, &cdb(&[0x03, 0, 0, 0, 0xFF, 0]), None)
        else {
            panic!("REQUEST SENSE failed");
        };
        assert_eq!(data.len(), 18);
        assert_eq!(data[0], 0xF0);
        assert_eq!(crate::scsi::be32(&data[3..7]), 0x1234);
    }

    #[test]
    fn unknown_opcode_fails() {
        let mut t = PlainTarget::new();
        let e = t.dispatch(0, &cdb(&[0xFF, 0, 0, 0, 0, 0]), None).unwrap_err();
        assert_eq!(
            e,
            ScsiError::new(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode)
        );
    }

    #[test]
    fn medium_change_latch_fires_once() {
        let mut t = PlainTarget::new();
        t.dev.removable = true;
        t.dev.medium_changed = true;

        // INQUIRY and REQUEST SENSE pass through
        assert!(t.dispatch(0, &cdb(&[0x12, 0, 0, 0, 36, 0]), None).is_ok());
        assert!(t.dispatch(0, &cdb(&[0x03, 0, 0, 0, 14, 0]), None).is_ok());

        let e = t.dispatch(0, &cdb(&[0x00, 0, 0, 0, 0, 0]), None).unwrap_err();
        assert_eq!(
            e,
            ScsiError::new(SenseKey::UnitAttention, Asc::NotReadyToReadyChange)
        );

        // Latch is cleared
        assert!(t.dispatch(0, &cdb(&[0x00, 0, 0, 0, 0, 0]), None).is_ok());
    }

    #[test]
    fn reserve_release_cycle() {
        let mut t = PlainTarget::new();
        assert!(matches!(
            t.dispatch(1, &cdb(&[0x16, 0, 0, 0, 0, 0]), None),
            Ok(CmdOutput::Status(Status::Good))
        ));
        assert!(t.dev.is_reserved());

        assert!(matches!(
            t.dispatch(1, &cdb(&[0x17, 0, 0, 0, 0, 0]), None),
            Ok(CmdOutput::Status(Status::Good))
        ));
        assert!(!t.dev.is_reserved());
    }

    #[test]
    fn shutdown_mode_default() {
        assert_eq!(ShutdownMode::default(), ShutdownMode::None);
    }
}
