//! Per-target SCSI controller
//!
//! One controller exists per occupied target ID and owns the up-to-32 LUN
//! table for that ID. `process_on_controller()` runs the target side of the
//! phase state machine for a single selection: message-out (IDENTIFY),
//! command, the data phase the command asks for, status and message-in,
//! ending at bus free. Command semantics live in the targets; the
//! controller translates their results into phases and their errors into
//! CHECK CONDITION with latched sense data.

pub mod factory;

use std::collections::BTreeMap;

use crate::bus::{ScsiBus, Signal};
use crate::device::target::ScsiTarget;
use crate::device::{InitiatorId, UNKNOWN_INITIATOR};
use crate::scsi::{
    be32, cdb_length, command_name, put_be32, Asc, BusPhase, CmdOutput, CmdResult, IdentifyMsg,
    ScsiError, SenseKey, ShutdownMode, Status, MSG_ABORT, MSG_BUS_DEVICE_RESET,
    MSG_COMMAND_COMPLETE, MSG_EXTENDED, MSG_REJECT,
};

pub const SCSI_LUN_MAX: u8 = 32;
pub const SASI_LUN_MAX: u8 = 2;

pub struct ScsiController {
    target_id: u8,
    max_luns: u8,

    luns: BTreeMap<u8, Box<dyn ScsiTarget>>,

    phase: BusPhase,
    cdb: [u8; 16],
    status: Status,
    message: u8,

    initiator_id: InitiatorId,

    /// LUN from the IDENTIFY message, if one was received
    identified_lun: Option<u8>,

    /// Parked for the daemon, consumed after the command completed
    shutdown: ShutdownMode,
}

impl ScsiController {
    pub fn new(target_id: u8, max_luns: u8) -> Self {
        Self {
            target_id,
            max_luns,
            luns: BTreeMap::new(),
            phase: BusPhase::Free,
            cdb: [0; 16],
            status: Status::Good,
            message: MSG_COMMAND_COMPLETE,
            initiator_id: UNKNOWN_INITIATOR,
            identified_lun: None,
            shutdown: ShutdownMode::None,
        }
    }

    pub fn target_id(&self) -> u8 {
        self.target_id
    }

    pub fn max_luns(&self) -> u8 {
        self.max_luns
    }

    pub fn lun_count(&self) -> usize {
        self.luns.len()
    }

    pub fn luns(&self) -> impl Iterator<Item = u8> + '_ {
        self.luns.keys().copied()
    }

    pub fn device_for_lun(&self, lun: u8) -> Option<&dyn ScsiTarget> {
        self.luns.get(&lun).map(|d| d.as_ref())
    }

    pub fn device_for_lun_mut(&mut self, lun: u8) -> Option<&mut (dyn ScsiTarget + 'static)> {
        self.luns.get_mut(&lun).map(|d| d.as_mut())
    }

    pub fn devices(&self) -> impl Iterator<Item = (u8, &dyn ScsiTarget)> + '_ {
        self.luns.iter().map(|(&lun, d)| (lun, d.as_ref()))
    }

    pub fn devices_mut(
        &mut self,
    ) -> impl Iterator<Item = (u8, &mut (dyn ScsiTarget + 'static))> + '_ {
        self.luns.iter_mut().map(|(&lun, d)| (lun, d.as_mut()))
    }

    /// Adds a device at the given LUN. The device learns its address here.
    pub fn add_device(&mut self, lun: u8, mut device: Box<dyn ScsiTarget>) -> bool {
        if lun >= self.max_luns || self.luns.contains_key(&lun) {
            return false;
        }

        device.device_mut().set_address(self.target_id, lun);
        self.luns.insert(lun, device);
        true
    }

    /// Removes and returns the device at the given LUN, after flushing it
    /// and releasing its image reservation
    pub fn remove_device(&mut self, lun: u8) -> Option<Box<dyn ScsiTarget>> {
        if let Some(device) = self.luns.get_mut(&lun) {
            device.cleanup();
        }
        self.luns.remove(&lun)
    }

    /// Bus reset: every device is reset and the target releases the bus
    pub fn reset(&mut self, bus: &mut dyn ScsiBus) {
        for device in self.luns.values_mut() {
            device.device_mut().reset();
        }

        self.release_bus(bus);
        self.phase = BusPhase::Free;
        self.status = Status::Good;
        self.message = MSG_COMMAND_COMPLETE;
        self.initiator_id = UNKNOWN_INITIATOR;
        self.identified_lun = None;
    }

    /// Runs the phase machine for one selection. `id_data` is the DAT
    /// snapshot taken at selection time; the initiator is the lowest ID bit
    /// besides our own. Returns the shutdown mode a command may have
    /// parked.
    pub fn process_on_controller(&mut self, bus: &mut dyn ScsiBus, id_data: u8) -> ShutdownMode {
        let ids_without_target = id_data & !(1 << self.target_id);
        self.initiator_id = if ids_without_target != 0 {
            ids_without_target.trailing_zeros() as InitiatorId
        } else {
            UNKNOWN_INITIATOR
        };
        log::trace!(
            "++++ Starting processing for initiator ID {}",
            self.initiator_id
        );

        self.selection(bus);

        std::mem::take(&mut self.shutdown)
    }

    fn selection(&mut self, bus: &mut dyn ScsiBus) {
        log::trace!("SELECTION phase");
        self.set_phase(BusPhase::Selection);
        bus.set_signal(Signal::Bsy, true);

        // The initiator releases SEL once it sees BSY
        if !bus.wait_signal(Signal::Sel, false) {
            log::warn!("Timeout waiting for SEL to be released");
            self.bus_free(bus);
            return;
        }

        bus.acquire();
        if bus.get_signal(Signal::Rst) {
            log::warn!("RESET signal received");
            self.reset(bus);
            return;
        }

        // Message out phase if ATN is asserted, otherwise command phase
        if bus.get_signal(Signal::Atn) && !self.msg_out(bus) {
            return;
        }

        self.command(bus);
    }

    /// Receives and processes message-out bytes while ATN keeps asserting.
    /// Returns false if the message ended the selection (abort, reset,
    /// transfer failure).
    fn msg_out(&mut self, bus: &mut dyn ScsiBus) -> bool {
        log::trace!("MESSAGE OUT phase");
        self.set_phase(BusPhase::MessageOut);
        bus.set_phase_signals(true, true, false);

        let mut msgs = Vec::new();
        loop {
            let mut byte = [0u8];
            if bus.receive_handshake(&mut byte) != 1 {
                log::warn!("MESSAGE OUT phase transfer failed");
                self.bus_free(bus);
                return false;
            }
            msgs.push(byte[0]);

            if msgs.len() >= 256 {
                break;
            }

            bus.acquire();
            if !bus.get_signal(Signal::Atn) {
                break;
            }
        }

        self.parse_messages(bus, &msgs)
    }

    fn parse_messages(&mut self, bus: &mut dyn ScsiBus, msgs: &[u8]) -> bool {
        for &msg in msgs {
            match msg {
                MSG_EXTENDED => {
                    log::trace!("Received EXTENDED MESSAGE, rejecting");
                    self.set_phase(BusPhase::MessageIn);
                    bus.set_phase_signals(true, true, true);
                    if bus.send_handshake(&[MSG_REJECT], 0) != 1 {
                        self.bus_free(bus);
                        return false;
                    }
                }
                MSG_ABORT => {
                    log::trace!("Received ABORT message");
                    self.bus_free(bus);
                    return false;
                }
                MSG_BUS_DEVICE_RESET => {
                    log::trace!("Received BUS DEVICE RESET message");
                    if let Some(lun) = self.identified_lun {
                        if let Some(device) = self.luns.get_mut(&lun) {
                            device.device_mut().discard_reservation();
                        }
                    }
                    self.bus_free(bus);
                    return false;
                }
                _ => {
                    let ident = IdentifyMsg(msg);
                    if ident.identify() {
                        self.identified_lun = Some(ident.lun());
                        log::trace!("Received IDENTIFY message for LUN {}", ident.lun());
                    }
                }
            }
        }

        true
    }

    fn command(&mut self, bus: &mut dyn ScsiBus) {
        log::trace!("COMMAND phase");
        self.set_phase(BusPhase::Command);
        bus.set_phase_signals(false, true, false);

        let mut cdb = [0u8; 16];
        let count = bus.command_handshake(&mut cdb);
        if count == 0 {
            log::trace!("Received unknown command: ${:02x}", cdb[0]);
            self.error(
                bus,
                ScsiError::new(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode),
                Status::CheckCondition,
            );
            return;
        }

        let expected = cdb_length(cdb[0]).unwrap_or(0);
        if count != expected {
            log::warn!(
                "Received {} byte(s) in COMMAND phase for command ${:02x}, {} required",
                count,
                cdb[0],
                expected
            );
            self.error(
                bus,
                ScsiError::new(SenseKey::AbortedCommand, Asc::CommandPhaseError),
                Status::CheckCondition,
            );
            return;
        }

        self.cdb = cdb;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "Controller is executing {}, CDB {}",
                command_name(cdb[0]).unwrap_or("(vendor-specific)"),
                cdb[..expected]
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(":")
            );
        }

        self.execute(bus);
    }

    /// LUN selection prefers the IDENTIFY message; without one (SASI) the
    /// LUN field in CDB byte 1 is used
    fn effective_lun(&self) -> u8 {
        self.identified_lun.unwrap_or((self.cdb[1] >> 5) & 0x07)
    }

    fn execute(&mut self, bus: &mut dyn ScsiBus) {
        let opcode = self.cdb[0];

        // REPORT LUNS is answered from the controller's own LUN table
        if opcode == 0xA0 {
            self.report_luns(bus);
            return;
        }

        let mut lun = self.effective_lun();
        let mut bad_lun = false;

        if !self.luns.contains_key(&lun) {
            // SCSI-2 8.2.5.1: INQUIRY must report "LUN not supported";
            // REQUEST SENSE signals the invalid LUN with GOOD status.
            // Everything else is an error. LUN 0 always exists on a live
            // controller.
            match opcode {
                0x12 => (),
                0x03 => {
                    self.luns
                        .get_mut(&0)
                        .expect("controller without LUN 0")
                        .device_mut()
                        .set_sense(SenseKey::IllegalRequest, Asc::InvalidLun);
                }
                _ => {
                    self.error(
                        bus,
                        ScsiError::new(SenseKey::IllegalRequest, Asc::InvalidLun),
                        Status::CheckCondition,
                    );
                    return;
                }
            }

            lun = 0;
            bad_lun = true;
        }

        // Discard pending sense data from the previous command unless the
        // current command is REQUEST SENSE
        if opcode != 0x03 {
            self.status = Status::Good;
            self.luns
                .get_mut(&lun)
                .unwrap()
                .device_mut()
                .set_sense(SenseKey::NoSense, Asc::NoAdditionalSenseInformation);
        }

        // A reservation conflict answers with its status byte directly,
        // without sense data and without a data phase
        let prevent_bit = self.cdb[4] & 0x01 != 0;
        let initiator = self.initiator_id;
        let device = self.luns.get_mut(&lun).unwrap();
        if !device.device().check_reservation(initiator, opcode, prevent_bit) {
            self.status = Status::ReservationConflict;
            self.status_phase(bus);
            return;
        }

        let result = device.dispatch(initiator, &self.cdb, None);
        self.finish_command(bus, lun, bad_lun, result);
    }

    fn finish_command(
        &mut self,
        bus: &mut dyn ScsiBus,
        lun: u8,
        bad_lun: bool,
        result: CmdResult,
    ) {
        match result {
            Ok(CmdOutput::Status(status)) => {
                self.status = status;
                self.status_phase(bus);
            }
            Ok(CmdOutput::DataIn(mut data)) => {
                if bad_lun && self.cdb[0] == 0x12 && !data.is_empty() {
                    // Peripheral qualifier: LUN not supported
                    data[0] = 0x7F;
                }
                self.status = Status::Good;
                self.data_in(bus, &data);
            }
            Ok(CmdOutput::DataOut(length)) => self.data_out(bus, lun, length),
            Ok(CmdOutput::Shutdown(mode)) => {
                self.shutdown = mode;
                self.status = Status::Good;
                self.status_phase(bus);
            }
            Err(e) => self.error(bus, e, Status::CheckCondition),
        }
    }

    fn data_in(&mut self, bus: &mut dyn ScsiBus, data: &[u8]) {
        if data.is_empty() {
            self.status_phase(bus);
            return;
        }

        log::trace!("DATA IN phase, sending {} byte(s)", data.len());
        self.set_phase(BusPhase::DataIn);
        bus.set_phase_signals(false, false, true);

        // The settle delay after the frame header is taken from LUN 0;
        // network drivers probe nonexistent LUNs with the same timing
        let delay_after = self
            .luns
            .get(&0)
            .map(|d| d.device().delay_after_bytes)
            .unwrap_or(0);

        let sent = bus.send_handshake(data, delay_after);
        if sent != data.len() {
            log::warn!(
                "Sent {} byte(s) in DATA IN phase, command requires {}",
                sent,
                data.len()
            );
            self.error(
                bus,
                ScsiError::new(SenseKey::AbortedCommand, Asc::DataPhaseError),
                Status::CheckCondition,
            );
            return;
        }

        self.status_phase(bus);
    }

    fn data_out(&mut self, bus: &mut dyn ScsiBus, lun: u8, length: usize) {
        // A zero-length transfer is legal; complete the command right away
        if length == 0 {
            let result =
                self.luns
                    .get_mut(&lun)
                    .unwrap()
                    .dispatch(self.initiator_id, &self.cdb, Some(&[]));
            self.finish_command(bus, lun, false, result);
            return;
        }

        log::trace!("DATA OUT phase, receiving {} byte(s)", length);
        self.set_phase(BusPhase::DataOut);
        bus.set_phase_signals(false, false, false);

        let mut buffer = vec![0u8; length];
        let received = bus.receive_handshake(&mut buffer);
        if received != length {
            log::warn!(
                "Received {} byte(s) in DATA OUT phase, command requires {}",
                received,
                length
            );
            self.error(
                bus,
                ScsiError::new(SenseKey::AbortedCommand, Asc::DataPhaseError),
                Status::CheckCondition,
            );
            return;
        }

        let result = self
            .luns
            .get_mut(&lun)
            .unwrap()
            .dispatch(self.initiator_id, &self.cdb, Some(&buffer));
        self.finish_command(bus, lun, false, result);
    }

    fn report_luns(&mut self, bus: &mut dyn ScsiBus) {
        // Only SELECT REPORT mode 0 is supported
        if self.cdb[2] != 0 {
            self.error(
                bus,
                ScsiError::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb),
                Status::CheckCondition,
            );
            return;
        }

        let allocation_length = be32(&self.cdb[6..10]) as usize;

        let mut buf = vec![0u8; 8 + 8 * self.luns.len()];
        put_be32(&mut buf[0..4], (8 * self.luns.len()) as u32);
        for (i, &lun) in self.luns.keys().enumerate() {
            buf[8 + 8 * i + 7] = lun;
        }

        buf.truncate(allocation_length);
        self.status = Status::Good;
        self.data_in(bus, &buf);
    }

    /// Sets the device's sense state and turns to the status phase with
    /// CHECK CONDITION (or the given status)
    fn error(&mut self, bus: &mut dyn ScsiBus, e: ScsiError, status: Status) {
        bus.acquire();
        if bus.get_signal(Signal::Rst)
            || matches!(self.phase, BusPhase::Status | BusPhase::MessageIn)
        {
            self.bus_free(bus);
            return;
        }

        // Fall back to LUN 0 when the addressed LUN does not exist
        let mut lun = self.effective_lun();
        if e.asc == Asc::InvalidLun || !self.luns.contains_key(&lun) {
            lun = 0;
        }

        if e.key != SenseKey::NoSense || e.asc != Asc::NoAdditionalSenseInformation {
            log::debug!("{}", e);

            if let Some(device) = self.luns.get_mut(&lun) {
                match e.info {
                    Some(info) => device.device_mut().set_sense_with_lba(e.key, e.asc, info),
                    None => device.device_mut().set_sense(e.key, e.asc),
                }
            }
        }

        self.status = status;
        self.message = MSG_COMMAND_COMPLETE;
        self.status_phase(bus);
    }

    fn status_phase(&mut self, bus: &mut dyn ScsiBus) {
        // A pending ATN is served before the status byte goes out
        bus.acquire();
        if bus.get_signal(Signal::Atn) && !self.msg_out(bus) {
            return;
        }

        log::trace!("STATUS phase, status is {:?}", self.status);
        self.set_phase(BusPhase::Status);
        bus.set_phase_signals(false, true, true);

        if bus.send_handshake(&[self.status as u8], 0) != 1 {
            log::warn!("STATUS phase transfer failed");
            self.bus_free(bus);
            return;
        }

        self.msg_in(bus);
    }

    fn msg_in(&mut self, bus: &mut dyn ScsiBus) {
        log::trace!("MESSAGE IN phase");
        self.set_phase(BusPhase::MessageIn);
        bus.set_phase_signals(true, true, true);

        if bus.send_handshake(&[self.message], 0) != 1 {
            log::warn!("MESSAGE IN phase transfer failed");
        }

        self.bus_free(bus);
    }

    fn bus_free(&mut self, bus: &mut dyn ScsiBus) {
        log::trace!("BUS FREE phase");
        self.set_phase(BusPhase::Free);
        self.release_bus(bus);

        self.status = Status::Good;
        self.message = MSG_COMMAND_COMPLETE;
        self.identified_lun = None;
        self.initiator_id = UNKNOWN_INITIATOR;
    }

    fn release_bus(&mut self, bus: &mut dyn ScsiBus) {
        bus.set_signal(Signal::Req, false);
        bus.set_signal(Signal::Msg, false);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, false);
        bus.set_signal(Signal::Bsy, false);
    }

    fn set_phase(&mut self, phase: BusPhase) {
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testbus::TestBus;
    use crate::device::services::HostServices;

    fn controller_with_services() -> ScsiController {
        let mut c = ScsiController::new(3, SCSI_LUN_MAX);
        assert!(c.add_device(0, Box::new(HostServices::new(0))));
        c
    }

    /// Selection data with target 3 and initiator 7 on the bus
    const ID_DATA: u8 = (1 << 3) | (1 << 7);

    #[test]
    fn test_unit_ready_good() {
        let mut c = controller_with_services();
        let mut bus = TestBus::new(&[0x00, 0, 0, 0, 0, 0]);

        c.process_on_controller(&mut bus, ID_DATA);

        assert_eq!(bus.status, vec![Status::Good as u8]);
        assert_eq!(bus.msg_in, vec![MSG_COMMAND_COMPLETE]);
    }

    #[test]
    fn inquiry_data_in() {
        let mut c = controller_with_services();
        let mut bus = TestBus::new(&[0x12, 0, 0, 0, 36, 0]);

        c.process_on_controller(&mut bus, ID_DATA);

        assert_eq!(bus.data_in.len(), 36);
        assert_eq!(bus.data_in[0], 0x03);
        assert_eq!(bus.last_status(), Some(Status::Good as u8));
    }

    #[test]
    fn inquiry_to_missing_lun_reports_qualifier() {
        let mut c = controller_with_services();
        let mut bus =
            TestBus::new(&[0x12, 0, 0, 0, 36, 0]).with_msg_out(&[0x80 | 5]);

        c.process_on_controller(&mut bus, ID_DATA);

        assert_eq!(bus.data_in[0], 0x7F);
        assert_eq!(bus.last_status(), Some(Status::Good as u8));
    }

    #[test]
    fn command_to_missing_lun_fails() {
        let mut c = controller_with_services();
        let mut bus = TestBus::new(&[0x00, 0, 0, 0, 0, 0]).with_msg_out(&[0x80 | 5]);

        c.process_on_controller(&mut bus, ID_DATA);
        assert_eq!(bus.last_status(), Some(Status::CheckCondition as u8));

        // The sense data lands on LUN 0
        let mut bus = TestBus::new(&[0x03, 0, 0, 0, 18, 0]);
        c.process_on_controller(&mut bus, ID_DATA);
        assert_eq!(bus.data_in[2] & 0x0F, SenseKey::IllegalRequest as u8);
        assert_eq!(bus.data_in[12], Asc::InvalidLun as u8);
    }

    #[test]
    fn request_sense_to_missing_lun_answers_good() {
        let mut c = controller_with_services();
        let mut bus = TestBus::new(&[0x03, 0, 0, 0, 18, 0]).with_msg_out(&[0x80 | 9]);

        c.process_on_controller(&mut bus, ID_DATA);

        assert_eq!(bus.last_status(), Some(Status::Good as u8));
        assert_eq!(bus.data_in[2] & 0x0F, SenseKey::IllegalRequest as u8);
        assert_eq!(bus.data_in[12], Asc::InvalidLun as u8);
    }

    #[test]
    fn sense_latch_and_clear() {
        let mut c = controller_with_services();

        // An unknown opcode arms the sense data
        let mut bus = TestBus::new(&[0x07, 0, 0, 0, 0, 0]);
        c.process_on_controller(&mut bus, ID_DATA);
        assert_eq!(bus.last_status(), Some(Status::CheckCondition as u8));

        // REQUEST SENSE reports and clears it
        let mut bus = TestBus::new(&[0x03, 0, 0, 0, 18, 0]);
        c.process_on_controller(&mut bus, ID_DATA);
        assert_eq!(bus.data_in[2] & 0x0F, SenseKey::IllegalRequest as u8);
        assert_eq!(
            bus.data_in[12],
            Asc::InvalidCommandOperationCode as u8
        );

        let mut bus = TestBus::new(&[0x03, 0, 0, 0, 18, 0]);
        c.process_on_controller(&mut bus, ID_DATA);
        assert_eq!(bus.data_in[2] & 0x0F, SenseKey::NoSense as u8);
        assert_eq!(bus.data_in[12], 0);
    }

    #[test]
    fn reservation_conflict_status() {
        let mut c = controller_with_services();

        // Initiator 1 reserves the unit
        let mut bus = TestBus::new(&[0x16, 0, 0, 0, 0, 0]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 1));
        assert_eq!(bus.last_status(), Some(Status::Good as u8));

        // Initiator 2 is rejected without sense data
        let mut bus = TestBus::new(&[0x00, 0, 0, 0, 0, 0]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 2));
        assert_eq!(bus.last_status(), Some(Status::ReservationConflict as u8));

        let mut bus = TestBus::new(&[0x03, 0, 0, 0, 18, 0]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 2));
        assert_eq!(bus.data_in[2] & 0x0F, SenseKey::NoSense as u8);

        // INQUIRY stays permitted for other initiators
        let mut bus = TestBus::new(&[0x12, 0, 0, 0, 36, 0]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 2));
        assert_eq!(bus.last_status(), Some(Status::Good as u8));

        // RELEASE from another initiator clears the reservation
        let mut bus = TestBus::new(&[0x17, 0, 0, 0, 0, 0]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 2));
        assert_eq!(bus.last_status(), Some(Status::Good as u8));

        let mut bus = TestBus::new(&[0x00, 0, 0, 0, 0, 0]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 2));
        assert_eq!(bus.last_status(), Some(Status::Good as u8));
    }

    #[test]
    fn report_luns_lists_lun_table() {
        let mut c = controller_with_services();
        c.add_device(2, Box::new(HostServices::new(2)));

        let mut bus = TestBus::new(&[0xA0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0, 0]);
        c.process_on_controller(&mut bus, ID_DATA);

        assert_eq!(be32(&bus.data_in[0..4]), 16);
        assert_eq!(bus.data_in[8 + 7], 0);
        assert_eq!(bus.data_in[16 + 7], 2);
    }

    #[test]
    fn abort_message_releases_bus() {
        let mut c = controller_with_services();
        let mut bus = TestBus::new(&[0x00, 0, 0, 0, 0, 0]).with_msg_out(&[MSG_ABORT]);

        c.process_on_controller(&mut bus, ID_DATA);

        // No command was executed
        assert!(bus.status.is_empty());
        assert!(bus.data_in.is_empty());
    }

    #[test]
    fn extended_message_rejected() {
        let mut c = controller_with_services();
        let mut bus =
            TestBus::new(&[0x00, 0, 0, 0, 0, 0]).with_msg_out(&[MSG_EXTENDED, 0x80]);

        c.process_on_controller(&mut bus, ID_DATA);

        assert_eq!(bus.msg_in[0], MSG_REJECT);
        // The command still ran afterwards
        assert_eq!(bus.last_status(), Some(Status::Good as u8));
    }

    #[test]
    fn shutdown_mode_parked_and_returned() {
        let mut c = controller_with_services();
        let mut bus = TestBus::new(&[0x1B, 0, 0, 0, 0, 0]);

        let mode = c.process_on_controller(&mut bus, ID_DATA);
        assert_eq!(mode, ShutdownMode::StopDaemon);
        assert_eq!(bus.last_status(), Some(Status::Good as u8));

        // Consumed
        let mut bus = TestBus::new(&[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(
            c.process_on_controller(&mut bus, ID_DATA),
            ShutdownMode::None
        );
    }

    #[test]
    fn bus_device_reset_clears_reservation() {
        let mut c = controller_with_services();

        let mut bus = TestBus::new(&[0x16, 0, 0, 0, 0, 0]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 1));
        assert!(c.device_for_lun(0).unwrap().device().is_reserved());

        let mut bus = TestBus::new(&[0x00, 0, 0, 0, 0, 0])
            .with_msg_out(&[0x80, MSG_BUS_DEVICE_RESET]);
        c.process_on_controller(&mut bus, (1 << 3) | (1 << 1));
        assert!(!c.device_for_lun(0).unwrap().device().is_reserved());
    }
}
