//! DaynaPort-compatible SCSI network adapter
//!
//! The adapter moves Ethernet frames over GET MESSAGE / SEND MESSAGE. The
//! actual network backend sits behind the `NetworkPort` trait; the built-in
//! loopback port keeps frames in-process, which is also what the tests use.
//! Enumerating host interfaces is the daemon's business, not this unit's.

use std::collections::VecDeque;

use crate::device::target::ScsiTarget;
use crate::device::{Device, DeviceType, ScsiLevel, StatCategory, Statistic};
use crate::scsi::{
    be16, be24, Asc, CmdOutput, CmdResult, ScsiCommand, ScsiError, SenseKey, Status,
};

/// Frame header the DaynaPort driver expects in front of every received
/// frame: 2 bytes length, 4 bytes flags
const READ_HEADER_SIZE: usize = 6;

/// The driver needs a settle delay after reading the frame header
const READ_DELAY_AFTER: usize = READ_HEADER_SIZE;

const MAX_FRAME_SIZE: usize = 1514;

/// Network backend of the adapter
pub trait NetworkPort: Send {
    fn mac_address(&self) -> [u8; 6];
    fn send_frame(&mut self, frame: &[u8]);
    fn receive_frame(&mut self) -> Option<Vec<u8>>;
}

/// In-process port: transmitted frames are queued back for reception
#[derive(Default)]
pub struct LoopbackPort {
    queue: VecDeque<Vec<u8>>,
}

impl NetworkPort for LoopbackPort {
    fn mac_address(&self) -> [u8; 6] {
        [0x00, 0x80, 0x19, 0x10, 0x98, 0xE3]
    }

    fn send_frame(&mut self, frame: &[u8]) {
        self.queue.push_back(frame.to_vec());
    }

    fn receive_frame(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }
}

pub struct DaynaPort {
    dev: Device,
    port: Box<dyn NetworkPort>,
    enabled: bool,

    frames_sent: u64,
    frames_received: u64,
}

impl DaynaPort {
    pub fn new(lun: u8, port: Box<dyn NetworkPort>) -> Self {
        let mut dev = Device::new(DeviceType::Ethernet, lun);
        dev.set_vendor("Dayna").unwrap();
        dev.set_product("SCSI/Link", false).unwrap();
        dev.set_revision("2.0f").unwrap();
        dev.set_scsi_level(ScsiLevel::Scsi2);
        dev.ready = true;
        dev.delay_after_bytes = READ_DELAY_AFTER;

        Self {
            dev,
            port,
            enabled: false,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    /// GET MESSAGE: delivers one queued frame with the length/flags header,
    /// or an all-zero header when no frame is pending
    fn get_message(&mut self, cdb: &[u8; 16]) -> CmdResult {
        let allocation_length = be16(&cdb[3..5]) as usize;
        if allocation_length < READ_HEADER_SIZE {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }

        if !self.enabled {
            return Err(ScsiError::new(SenseKey::NotReady, Asc::EthernetDisabled));
        }

        let mut buf = vec![0u8; READ_HEADER_SIZE];
        if let Some(frame) = self.port.receive_frame() {
            let len = frame.len().min(MAX_FRAME_SIZE);
            buf[0] = (len >> 8) as u8;
            buf[1] = len as u8;
            buf.extend_from_slice(&frame[..len]);
            self.frames_received += 1;
        }

        buf.truncate(allocation_length);
        Ok(CmdOutput::DataIn(buf))
    }

    /// SEND MESSAGE: transmits one frame
    fn send_message(&mut self, cdb: &[u8; 16], outdata: Option<&[u8]>) -> CmdResult {
        let length = be24(&cdb[2..5]) as usize & 0x07FF;
        if length == 0 || length > MAX_FRAME_SIZE {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }

        let Some(data) = outdata else {
            return Ok(CmdOutput::DataOut(length));
        };

        if !self.enabled {
            return Err(ScsiError::new(SenseKey::NotReady, Asc::EthernetDisabled));
        }

        self.port.send_frame(&data[..length.min(data.len())]);
        self.frames_sent += 1;
        Ok(CmdOutput::Status(Status::Good))
    }

    /// RETRIEVE STATS: MAC address plus three frame counters
    fn retrieve_stats(&mut self, cdb: &[u8; 16]) -> CmdResult {
        let mut buf = vec![0u8; 18];
        buf[0..6].copy_from_slice(&self.port.mac_address());
        crate::scsi::put_be32(&mut buf[6..10], self.frames_sent as u32);
        crate::scsi::put_be32(&mut buf[10..14], self.frames_received as u32);

        let allocation_length = cdb[4] as usize;
        buf.truncate(allocation_length);
        Ok(CmdOutput::DataIn(buf))
    }
}

impl ScsiTarget for DaynaPort {
    fn device(&self) -> &Device {
        &self.dev
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    fn inquiry_flags(&self) -> u8 {
        0x18
    }

    fn statistics(&self) -> Vec<Statistic> {
        let (id, lun) = (self.dev.id(), self.dev.lun());
        vec![
            Statistic {
                id,
                lun,
                category: StatCategory::Info,
                key: "frames_sent".to_string(),
                value: self.frames_sent,
            },
            Statistic {
                id,
                lun,
                category: StatCategory::Info,
                key: "frames_received".to_string(),
                value: self.frames_received,
            },
        ]
    }

    fn type_dispatch(&mut self, opcode: ScsiCommand, cdb: &[u8; 16], outdata: Option<&[u8]>)
        -> CmdResult {
        match opcode {
            ScsiCommand::Read6 => self.get_message(cdb),
            ScsiCommand::Write6 => self.send_message(cdb, outdata),
            ScsiCommand::RetrieveStats => self.retrieve_stats(cdb),
            ScsiCommand::SetIfaceMode | ScsiCommand::SetMcastAddr => {
                // Interface mode and multicast registration are accepted
                // without further processing
                match outdata {
                    None => Ok(CmdOutput::DataOut(cdb[4] as usize)),
                    Some(_) => Ok(CmdOutput::Status(Status::Good)),
                }
            }
            ScsiCommand::EnableInterface => {
                self.enabled = cdb[5] & 0x80 != 0;
                log::debug!(
                    "Network interface {}",
                    if self.enabled { "enabled" } else { "disabled" }
                );
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

    fn enabled_port() -> DaynaPort {
        let mut port = DaynaPort::new(0, Box::<LoopbackPort>::default());
        let enable = cdb(&[0x0E, 0, 0, 0, 0, 0x80]);
        port.dispatch(0, &enable, None).unwrap();
        port
    }

    #[test]
    fn frame_roundtrip_via_loopback() {
        let mut port = enabled_port();

        let frame = [0xABu8; 64];
        let send = cdb(&[0x0A, 0, 0, 0, 64, 0]);
        let Ok(CmdOutput::DataOut(n)) = port.dispatch(0, &send, None) else {
            panic!("SEND MESSAGE announce failed");
        };
        assert_eq!(n, 64);
        assert!(matches!(
            port.dispatch(0, &send, Some(&frame)),
            Ok(CmdOutput::Status(Status::Good))
        ));

        let recv = cdb(&[0x08, 0, 0, 0x05, 0xF6, 0]);
        let Ok(CmdOutput::DataIn(data)) = port.dispatch(0, &recv, None) else {
            panic!("GET MESSAGE failed");
        };
        assert_eq!(be16(&data[0..2]), 64);
        assert_eq!(&data[READ_HEADER_SIZE..], &frame[..]);
    }

    #[test]
    fn empty_queue_returns_header_only() {
        let mut port = enabled_port();

        let recv = cdb(&[0x08, 0, 0, 0x05, 0xF6, 0]);
        let Ok(CmdOutput::DataIn(data)) = port.dispatch(0, &recv, None) else {
            panic!("GET MESSAGE failed");
        };
        assert_eq!(data.len(), READ_HEADER_SIZE);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn disabled_interface_rejects_transfers() {
        let mut port = DaynaPort::new(0, Box::<LoopbackPort>::default());

        let recv = cdb(&[0x08, 0, 0, 0x05, 0xF6, 0]);
        let e = port.dispatch(0, &recv, None).unwrap_err();
        assert_eq!(e, ScsiError::new(SenseKey::NotReady, Asc::EthernetDisabled));
    }

    #[test]
    fn stats_carry_mac_and_counters() {
        let mut port = enabled_port();

        let stats = cdb(&[0x09, 0, 0, 0, 18, 0]);
        let Ok(CmdOutput::DataIn(data)) = port.dispatch(0, &stats, None) else {
            panic!("RETRIEVE STATS failed");
        };
        assert_eq!(data.len(), 18);
        assert_eq!(&data[0..3], &[0x00, 0x80, 0x19]);
    }
}
