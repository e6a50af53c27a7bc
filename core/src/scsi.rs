//! SCSI protocol definitions shared by buses, controllers and targets
//!
//! ## Bus phases and transitions (target side)
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> Free
//!
//!     Free --> Selection : SEL asserted, target ID on DAT
//!     Selection --> MessageOut : SEL released, ATN asserted
//!     Selection --> Command : SEL released
//!     MessageOut --> Command : IDENTIFY received
//!     Command --> DataIn : command returns data
//!     Command --> DataOut : command expects data
//!     Command --> Status : no data transfer
//!     DataIn --> Status : last byte acknowledged
//!     DataOut --> Status : last byte acknowledged
//!     Status --> MessageIn : status byte acknowledged
//!     MessageIn --> Free : message byte acknowledged
//!
//!     StateChange --> Free : RST (release all signals)
//! ```

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SCSI bus phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum BusPhase {
    Free,
    Arbitration,
    Selection,
    Reselection,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MessageIn,
    MessageOut,
    Reserved,
}

/// SCSI status codes
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Status {
    Good = 0x00,
    CheckCondition = 0x02,
    ConditionMet = 0x04,
    Busy = 0x08,
    Intermediate = 0x10,
    IntermediateConditionMet = 0x14,
    ReservationConflict = 0x18,
    CommandTerminated = 0x22,
    QueueFull = 0x28,
}

/// SCSI sense keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    AbortedCommand = 0x0B,
    VolumeOverflow = 0x0D,
    Miscompare = 0x0E,
}

/// Additional sense codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum Asc {
    NoAdditionalSenseInformation = 0x00,
    WriteFault = 0x03,
    ReadFault = 0x11,
    ParameterListLengthError = 0x1A,
    InvalidCommandOperationCode = 0x20,
    LbaOutOfRange = 0x21,
    InvalidFieldInCdb = 0x24,
    InvalidLun = 0x25,
    InvalidFieldInParameterList = 0x26,
    WriteProtected = 0x27,
    NotReadyToReadyChange = 0x28,
    PowerOnOrReset = 0x29,
    MediumNotPresent = 0x3A,
    CommandPhaseError = 0x4A,
    DataPhaseError = 0x4B,
    LoadOrEjectFailed = 0x53,

    // Device-specific (vendor range)
    EthernetDisabled = 0xF1,
    PrinterNothingToPrint = 0xF4,
    PrinterWriteFailed = 0xF6,
}

/// A failed SCSI command, translated by the controller into CHECK CONDITION
/// with the carried sense data latched on the device.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("sense key {key:?}, ASC {asc:?}")]
pub struct ScsiError {
    pub key: SenseKey,
    pub asc: Asc,
    /// Sector address for media errors, reported in the sense information
    /// field
    pub info: Option<u32>,
}

impl ScsiError {
    pub const fn new(key: SenseKey, asc: Asc) -> Self {
        Self {
            key,
            asc,
            info: None,
        }
    }

    pub const fn with_info(key: SenseKey, asc: Asc, info: u32) -> Self {
        Self {
            key,
            asc,
            info: Some(info),
        }
    }
}

pub type CmdResult = Result<CmdOutput, ScsiError>;

/// Result of a successfully dispatched command
#[derive(Debug)]
pub enum CmdOutput {
    /// Immediately turn to the Status phase
    Status(Status),
    /// Returns data to the initiator, followed by GOOD status
    DataIn(Vec<u8>),
    /// Expects the given amount of data written to the target
    DataOut(usize),
    /// GOOD status; additionally parks a shutdown mode for the daemon to
    /// consume once the bus is free
    Shutdown(ShutdownMode),
}

/// Shutdown coordination between a host services unit, the controller and
/// the daemon loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    #[default]
    None,
    StopDaemon,
    StopHost,
    RestartHost,
}

/// SCSI command operation codes
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ScsiCommand {
    TestUnitReady = 0x00,
    Rezero = 0x01,
    RequestSense = 0x03,
    FormatUnit = 0x04,
    ReassignBlocks = 0x07,
    /// READ(6) / GET MESSAGE(6) on network adapters
    Read6 = 0x08,
    /// Network adapter specific
    RetrieveStats = 0x09,
    /// WRITE(6) / PRINT on printers / SEND MESSAGE(6) on network adapters
    Write6 = 0x0A,
    Seek6 = 0x0B,
    /// Network adapter specific
    SetIfaceMode = 0x0C,
    /// Network adapter specific
    SetMcastAddr = 0x0D,
    /// Network adapter specific
    EnableInterface = 0x0E,
    SynchronizeBuffer = 0x10,
    Inquiry = 0x12,
    ModeSelect6 = 0x15,
    Reserve6 = 0x16,
    Release6 = 0x17,
    ModeSense6 = 0x1A,
    /// START STOP UNIT / STOP PRINT on printers
    StartStop = 0x1B,
    SendDiagnostic = 0x1D,
    PreventAllowMediumRemoval = 0x1E,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Seek10 = 0x2B,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ReadDefectData10 = 0x37,
    ReadLong10 = 0x3E,
    WriteLong10 = 0x3F,
    ReadToc = 0x43,
    ModeSelect10 = 0x55,
    ModeSense10 = 0x5A,
    Read16 = 0x88,
    Write16 = 0x8A,
    Verify16 = 0x8F,
    SynchronizeCache16 = 0x91,
    /// Service action in CDB byte 1 selects the actual command
    ReadCapacity16ReadLong16 = 0x9E,
    WriteLong16 = 0x9F,
    ReportLuns = 0xA0,
}

/// SCSI message bytes
pub const MSG_COMMAND_COMPLETE: u8 = 0x00;
pub const MSG_EXTENDED: u8 = 0x01;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_REJECT: u8 = 0x07;
pub const MSG_BUS_DEVICE_RESET: u8 = 0x0C;
pub const MSG_IDENTIFY: u8 = 0x80;

proc_bitfield::bitfield! {
    /// IDENTIFY message byte sent by the initiator after selection with ATN
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IdentifyMsg(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub lun: u8 @ 0..=4,
        pub disconnect_priv: bool @ 6,
        /// Set for any IDENTIFY message; bits 0..4 carry a valid LUN
        pub identify: bool @ 7,
    }
}

/// Returns the CDB length for an operation code, derived from the opcode
/// group, or None for opcodes this target does not understand at all.
pub fn cdb_length(opcode: u8) -> Option<usize> {
    match opcode >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        // Vendor-specific range used by the host services device
        _ if (0xC0..=0xC1).contains(&opcode) => Some(10),
        _ => None,
    }
}

/// Human-readable command name for logging, where one is known
pub fn command_name(opcode: u8) -> Option<&'static str> {
    use ScsiCommand::*;
    let name = match num_traits::FromPrimitive::from_u8(opcode)? {
        TestUnitReady => "TEST UNIT READY",
        Rezero => "REZERO",
        RequestSense => "REQUEST SENSE",
        FormatUnit => "FORMAT UNIT",
        ReassignBlocks => "REASSIGN BLOCKS",
        Read6 => "READ(6)/GET MESSAGE(6)",
        RetrieveStats => "RETRIEVE STATS",
        Write6 => "WRITE(6)/PRINT/SEND MESSAGE(6)",
        Seek6 => "SEEK(6)",
        SetIfaceMode => "SET IFACE MODE",
        SetMcastAddr => "SET MCAST ADDR",
        EnableInterface => "ENABLE INTERFACE",
        SynchronizeBuffer => "SYNCHRONIZE BUFFER",
        Inquiry => "INQUIRY",
        ModeSelect6 => "MODE SELECT(6)",
        Reserve6 => "RESERVE(6)",
        Release6 => "RELEASE(6)",
        ModeSense6 => "MODE SENSE(6)",
        StartStop => "START STOP UNIT/STOP PRINT",
        SendDiagnostic => "SEND DIAGNOSTIC",
        PreventAllowMediumRemoval => "PREVENT ALLOW MEDIUM REMOVAL",
        ReadCapacity10 => "READ CAPACITY(10)",
        Read10 => "READ(10)",
        Write10 => "WRITE(10)",
        Seek10 => "SEEK(10)",
        Verify10 => "VERIFY(10)",
        SynchronizeCache10 => "SYNCHRONIZE CACHE(10)",
        ReadDefectData10 => "READ DEFECT DATA(10)",
        ReadLong10 => "READ LONG(10)",
        WriteLong10 => "WRITE LONG(10)",
        ReadToc => "READ TOC",
        ModeSelect10 => "MODE SELECT(10)",
        ModeSense10 => "MODE SENSE(10)",
        Read16 => "READ(16)",
        Write16 => "WRITE(16)",
        Verify16 => "VERIFY(16)",
        SynchronizeCache16 => "SYNCHRONIZE CACHE(16)",
        ReadCapacity16ReadLong16 => "READ CAPACITY(16)/READ LONG(16)",
        WriteLong16 => "WRITE LONG(16)",
        ReportLuns => "REPORT LUNS",
    };
    Some(name)
}

// Big-endian CDB field accessors
pub fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub fn be24(b: &[u8]) -> u32 {
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

pub fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub fn be64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

pub fn put_be16(b: &mut [u8], v: u16) {
    b[0..2].copy_from_slice(&v.to_be_bytes());
}

pub fn put_be32(b: &mut [u8], v: u32) {
    b[0..4].copy_from_slice(&v.to_be_bytes());
}

pub fn put_be64(b: &mut [u8], v: u64) {
    b[0..8].copy_from_slice(&v.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdb_length_by_group() {
        assert_eq!(cdb_length(0x00), Some(6));
        assert_eq!(cdb_length(0x1A), Some(6));
        assert_eq!(cdb_length(0x28), Some(10));
        assert_eq!(cdb_length(0x5A), Some(10));
        assert_eq!(cdb_length(0x88), Some(16));
        assert_eq!(cdb_length(0xA0), Some(12));
        assert_eq!(cdb_length(0xC0), Some(10));
        assert_eq!(cdb_length(0x60), None);
    }

    #[test]
    fn identify_msg_fields() {
        let msg = IdentifyMsg(0x85);
        assert!(msg.identify());
        assert_eq!(msg.lun(), 5);

        let msg = IdentifyMsg(0x05);
        assert!(!msg.identify());
    }

    #[test]
    fn be_accessors() {
        let b = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        assert_eq!(be16(&b), 0x1234);
        assert_eq!(be24(&b), 0x123456);
        assert_eq!(be32(&b), 0x12345678);
        assert_eq!(be64(&b), 0x123456789ABCDEF0);
    }
}
