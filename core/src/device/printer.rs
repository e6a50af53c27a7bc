//! SCSI printer
//!
//! PRINT data is collected into a spool file; SYNCHRONIZE BUFFER finishes
//! the job and leaves the spool file for the host side to pick up. Passing
//! the job to an actual print system is outside the emulation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::device::target::ScsiTarget;
use crate::device::{Device, DeviceType, StatCategory, Statistic};
use crate::scsi::{be24, Asc, CmdOutput, CmdResult, ScsiCommand, ScsiError, SenseKey, Status};

pub struct Printer {
    dev: Device,
    spool_dir: PathBuf,

    job: Option<(PathBuf, File)>,
    job_bytes: u64,

    print_count: u64,
    byte_count: u64,
    error_count: u64,
}

impl Printer {
    pub fn new(lun: u8) -> Self {
        let mut dev = Device::new(DeviceType::Printer, lun);
        dev.set_product("SCSI PRINTER", false).unwrap();
        dev.ready = true;

        Self {
            dev,
            spool_dir: std::env::temp_dir(),
            job: None,
            job_bytes: 0,
            print_count: 0,
            byte_count: 0,
            error_count: 0,
        }
    }

    fn spool_path(&self) -> PathBuf {
        self.spool_dir.join(format!(
            "drift-print-{}-{}",
            std::process::id(),
            self.print_count
        ))
    }

    /// PRINT: appends the received bytes to the current job
    fn print(&mut self, cdb: &[u8; 16], outdata: Option<&[u8]>) -> CmdResult {
        let length = be24(&cdb[2..5]) as usize;

        let Some(data) = outdata else {
            return Ok(CmdOutput::DataOut(length));
        };

        if self.job.is_none() {
            let path = self.spool_path();
            match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
                Ok(file) => {
                    self.job = Some((path, file));
                    self.job_bytes = 0;
                }
                Err(e) => {
                    log::error!("Can't create spool file: {}", e);
                    self.error_count += 1;
                    return Err(ScsiError::new(
                        SenseKey::AbortedCommand,
                        Asc::PrinterWriteFailed,
                    ));
                }
            }
        }

        let (_, file) = self.job.as_mut().unwrap();
        if let Err(e) = file.write_all(&data[..length.min(data.len())]) {
            log::error!("Can't write to spool file: {}", e);
            self.error_count += 1;
            return Err(ScsiError::new(
                SenseKey::AbortedCommand,
                Asc::PrinterWriteFailed,
            ));
        }

        self.job_bytes += length as u64;
        self.byte_count += length as u64;
        Ok(CmdOutput::Status(Status::Good))
    }

    /// SYNCHRONIZE BUFFER finishes the current job
    fn synchronize_buffer(&mut self) -> CmdResult {
        let Some((path, file)) = self.job.take() else {
            log::warn!("Nothing to print");
            self.error_count += 1;
            return Err(ScsiError::new(
                SenseKey::AbortedCommand,
                Asc::PrinterNothingToPrint,
            ));
        };

        drop(file);
        log::info!(
            "Printed {} byte(s) to '{}'",
            self.job_bytes,
            path.display()
        );

        self.print_count += 1;
        self.job_bytes = 0;
        Ok(CmdOutput::Status(Status::Good))
    }
}

impl ScsiTarget for Printer {
    fn device(&self) -> &Device {
        &self.dev
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    fn init(&mut self) -> anyhow::Result<()> {
        if let Some(dir) = self.dev.param("spool_dir") {
            let dir = PathBuf::from(dir);
            anyhow::ensure!(
                dir.is_dir(),
                "spool directory '{}' does not exist",
                dir.display()
            );
            self.spool_dir = dir;
        }
        Ok(())
    }

    fn statistics(&self) -> Vec<Statistic> {
        let (id, lun) = (self.dev.id(), self.dev.lun());
        vec![
            Statistic {
                id,
                lun,
                category: StatCategory::Info,
                key: "print_count".to_string(),
                value: self.print_count,
            },
            Statistic {
                id,
                lun,
                category: StatCategory::Info,
                key: "byte_count".to_string(),
                value: self.byte_count,
            },
            Statistic {
                id,
                lun,
                category: StatCategory::Error,
                key: "print_error_count".to_string(),
                value: self.error_count,
            },
        ]
    }

    fn type_dispatch(&mut self, opcode: ScsiCommand, cdb: &[u8; 16], outdata: Option<&[u8]>)
        -> CmdResult {
        match opcode {
            ScsiCommand::Write6 => self.print(cdb, outdata),
            ScsiCommand::SynchronizeBuffer => self.synchronize_buffer(),
            ScsiCommand::StartStop => {
                // STOP PRINT discards the current job
                if let Some((path, file)) = self.job.take() {
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                }
                self.job_bytes = 0;
                Ok(CmdOutput::Status(Status::Good))
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

    fn cdb(bytes: &[u8]) -> [u8; 16] {
        let mut c = [0u8; 16];
        c[..bytes.len()].copy_from_slice(bytes);
        c
    }

    #[test]
    fn print_and_synchronize() {
        let mut printer = Printer::new(0);

        let print = cdb(&[0x0A, 0, 0, 0, 5, 0]);
        let Ok(CmdOutput::DataOut(n)) = printer.dispatch(0, &print, None) else {
            panic!("PRINT announce failed");
        };
        assert_eq!(n, 5);
        assert!(matches!(
            printer.dispatch(0, &print, Some(b"hello")),
            Ok(CmdOutput::Status(Status::Good))
        ));

        let spool = printer.job.as_ref().unwrap().0.clone();
        assert!(matches!(
            printer.dispatch(0, &cdb(&[0x10, 0, 0, 0, 0, 0]), None),
            Ok(CmdOutput::Status(Status::Good))
        ));

        assert_eq!(std::fs::read(&spool).unwrap(), b"hello");
        std::fs::remove_file(&spool).unwrap();
    }

    #[test]
    fn synchronize_without_job_fails() {
        let mut printer = Printer::new(0);
        let e = printer
            .dispatch(0, &cdb(&[0x10, 0, 0, 0, 0, 0]), None)
            .unwrap_err();
        assert_eq!(
            e,
            ScsiError::new(SenseKey::AbortedCommand, Asc::PrinterNothingToPrint)
        );
    }

    #[test]
    fn stop_print_discards_job() {
        let mut printer = Printer::new(0);

        let print = cdb(&[0x0A, 0, 0, 0, 3, 0]);
        printer.dispatch(0, &print, None).unwrap();
        printer.dispatch(0, &print, Some(b"abc")).unwrap();
        let spool = printer.job.as_ref().unwrap().0.clone();

        printer
            .dispatch(0, &cdb(&[0x1B, 0, 0, 0, 0, 0]), None)
            .unwrap();
        assert!(printer.job.is_none());
        assert!(!spool.exists());
    }
}
