//! Host services unit
//!
//! Reports the host's realtime clock through mode page 0x20 and lets an
//! initiator stop or restart the daemon and the host via START STOP UNIT.
//! The shutdown itself is carried out by the daemon once the bus is free.

use std::collections::BTreeMap;

use chrono::{Datelike, Local, Timelike};

use crate::device::modepage::ModePageOverrides;
use crate::device::target::ScsiTarget;
use crate::device::{Device, DeviceType};
use crate::scsi::{
    Asc, CmdOutput, CmdResult, ScsiCommand, ScsiError, SenseKey, ShutdownMode, Status,
};

pub struct HostServices {
    dev: Device,
    overrides: Option<std::sync::Arc<ModePageOverrides>>,
}

impl HostServices {
    pub fn new(lun: u8) -> Self {
        let mut dev = Device::new(DeviceType::HostServices, lun);
        dev.set_product("Host Services", false).unwrap();
        dev.ready = true;

        Self {
            dev,
            overrides: None,
        }
    }

    pub fn set_mode_page_overrides(&mut self, overrides: std::sync::Arc<ModePageOverrides>) {
        self.overrides = Some(overrides);
    }
}

impl ScsiTarget for HostServices {
    fn device(&self) -> &Device {
        &self.dev
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    fn supports_mode_pages(&self) -> bool {
        true
    }

    fn custom_mode_pages(&self) -> Option<&ModePageOverrides> {
        self.overrides.as_deref()
    }

    fn setup_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        // Page 32 (realtime clock)
        if page == 0x20 || page == 0x3F {
            let mut buf = vec![0u8; 10];
            if !changeable {
                let now = Local::now();
                buf[2] = (now.year() - 1900) as u8;
                buf[3] = now.month() as u8;
                buf[4] = now.day() as u8;
                buf[5] = now.hour() as u8;
                buf[6] = now.minute() as u8;
                buf[7] = now.second() as u8;
            }
            pages.insert(0x20, buf);
        }
    }

    fn type_dispatch(&mut self, opcode: ScsiCommand, cdb: &[u8; 16], _outdata: Option<&[u8]>)
        -> CmdResult {
        match opcode {
            ScsiCommand::StartStop => {
                let start = cdb[4] & 0x01 != 0;
                let load = cdb[4] & 0x02 != 0;

                let mode = match (start, load) {
                    // Stop the daemon
                    (false, false) => ShutdownMode::StopDaemon,
                    // Stop or restart the host
                    (false, true) => ShutdownMode::StopHost,
                    (true, true) => ShutdownMode::RestartHost,
                    (true, false) => {
                        return Err(ScsiError::new(
                            SenseKey::IllegalRequest,
                            Asc::InvalidFieldInCdb,
                        ));
                    }
                };

                Ok(CmdOutput::Shutdown(mode))
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
    use crate::device::modepage;

    fn cdb(bytes: &[u8]) -> [u8; 16] {
        let mut c = [0u8; 16];
        c[..bytes.len()].copy_from_slice(bytes);
        c
    }

    #[test]
    fn realtime_clock_page() {
        let services = HostServices::new(0);
        let buf = modepage::mode_sense(
            &services,
            ScsiCommand::ModeSense6,
            &cdb(&[0x1A, 0x08, 0x20, 0, 0xFF, 0]),
        )
        .unwrap();

        assert_eq!(buf[4] & 0x3F, 0x20);
        // Sane month and day
        assert!((1..=12).contains(&buf[7]));
        assert!((1..=31).contains(&buf[8]));
    }

    #[test]
    fn start_stop_selects_shutdown_mode() {
        let mut services = HostServices::new(0);

        let r = services
            .dispatch(0, &cdb(&[0x1B, 0, 0, 0, 0x00, 0]), None)
            .unwrap();
        assert!(matches!(r, CmdOutput::Shutdown(ShutdownMode::StopDaemon)));

        let r = services
            .dispatch(0, &cdb(&[0x1B, 0, 0, 0, 0x02, 0]), None)
            .unwrap();
        assert!(matches!(r, CmdOutput::Shutdown(ShutdownMode::StopHost)));

        let r = services
            .dispatch(0, &cdb(&[0x1B, 0, 0, 0, 0x03, 0]), None)
            .unwrap();
        assert!(matches!(r, CmdOutput::Shutdown(ShutdownMode::RestartHost)));

        let e = services
            .dispatch(0, &cdb(&[0x1B, 0, 0, 0, 0x01, 0]), None)
            .unwrap_err();
        assert_eq!(e.asc, Asc::InvalidFieldInCdb);
    }

    #[test]
    fn unit_is_always_ready() {
        let mut services = HostServices::new(0);
        assert!(matches!(
            services.dispatch(0, &cdb(&[0x00, 0, 0, 0, 0, 0]), None),
            Ok(CmdOutput::Status(Status::Good))
        ));
    }
}
