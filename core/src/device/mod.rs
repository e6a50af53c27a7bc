//! Emulated SCSI devices and their common state

pub mod cdrom;
pub mod daynaport;
pub mod disk;
pub mod modepage;
pub mod printer;
pub mod services;
pub mod storage;
pub mod target;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::scsi::{Asc, ScsiError, SenseKey};

/// An initiator ID, or -1 when the initiator could not be identified
pub type InitiatorId = i8;

pub const UNKNOWN_INITIATOR: InitiatorId = -1;

/// Emulated peripheral device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Fixed hard disk
    Hd,
    /// Hard disk with removable medium
    RemovableHd,
    /// Magneto-optical drive
    Optical,
    CdRom,
    Tape,
    Printer,
    /// DaynaPort-compatible network adapter
    Ethernet,
    HostServices,
    /// SASI hard disk (IDENTIFY-less selection, 2 LUNs)
    SasiHd,
    /// SCSI-to-host passthrough
    Generic,
}

impl DeviceType {
    /// INQUIRY peripheral device type code
    pub fn inquiry_type(self) -> u8 {
        match self {
            Self::Hd | Self::RemovableHd | Self::SasiHd | Self::Generic => 0x00,
            Self::Printer => 0x02,
            Self::HostServices => 0x03,
            Self::CdRom => 0x05,
            Self::Optical => 0x07,
            Self::Ethernet => 0x09,
            Self::Tape => 0x01,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hd => "hd",
            Self::RemovableHd => "removable_hd",
            Self::Optical => "optical",
            Self::CdRom => "cdrom",
            Self::Tape => "tape",
            Self::Printer => "printer",
            Self::Ethernet => "ethernet",
            Self::HostServices => "host_services",
            Self::SasiHd => "sasi_hd",
            Self::Generic => "generic",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "hd" => Self::Hd,
            "removable_hd" => Self::RemovableHd,
            "optical" => Self::Optical,
            "cdrom" => Self::CdRom,
            "tape" => Self::Tape,
            "printer" => Self::Printer,
            "ethernet" => Self::Ethernet,
            "host_services" => Self::HostServices,
            "sasi_hd" => Self::SasiHd,
            "generic" => Self::Generic,
            _ => return None,
        })
    }
}

/// SCSI standard conformance levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScsiLevel {
    Scsi1Ccs = 1,
    Scsi2 = 2,
    Spc = 3,
    Spc2 = 4,
    Spc3 = 5,
    Spc4 = 6,
    Spc5 = 7,
    Spc6 = 8,
}

impl ScsiLevel {
    pub fn from_u32(level: u32) -> Option<Self> {
        Some(match level {
            1 => Self::Scsi1Ccs,
            2 => Self::Scsi2,
            3 => Self::Spc,
            4 => Self::Spc2,
            5 => Self::Spc3,
            6 => Self::Spc4,
            7 => Self::Spc5,
            8 => Self::Spc6,
            _ => return None,
        })
    }
}

/// Latched sense state, reported and cleared by REQUEST SENSE
#[derive(Debug, Clone, Copy)]
pub struct SenseData {
    pub key: SenseKey,
    pub asc: Asc,
    pub ascq: u8,
    /// The information field carries a valid sector address
    pub valid: bool,
    pub information: u32,
    pub filemark: bool,
    pub eom: bool,
    pub ili: bool,
}

impl Default for SenseData {
    fn default() -> Self {
        Self {
            key: SenseKey::NoSense,
            asc: Asc::NoAdditionalSenseInformation,
            ascq: 0,
            valid: false,
            information: 0,
            filemark: false,
            eom: false,
            ili: false,
        }
    }
}

/// State common to every emulated device: identity, flags, parameters,
/// sense and reservation state. Each target embeds one of these.
#[derive(Debug)]
pub struct Device {
    dev_type: DeviceType,
    scsi_level: ScsiLevel,

    id: u8,
    lun: u8,

    vendor: String,
    product: String,
    revision: String,

    pub ready: bool,
    pub read_only: bool,
    pub protectable: bool,
    pub write_protected: bool,
    pub stoppable: bool,
    pub stopped: bool,
    pub removable: bool,
    pub removed: bool,
    pub lockable: bool,
    pub locked: bool,
    pub attn: bool,
    pub reset: bool,

    /// Armed on insert/eject; raises a unit attention on the next command
    /// that is not INQUIRY or REQUEST SENSE
    pub medium_changed: bool,

    /// Inserts a settle delay after this many bytes in DATA IN sends
    pub delay_after_bytes: usize,

    params: HashMap<String, String>,

    pub sense: SenseData,

    /// -1 = unreserved, 0..7 = reserving initiator
    reserving_initiator: InitiatorId,
}

impl Device {
    pub fn new(dev_type: DeviceType, lun: u8) -> Self {
        let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
        let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);

        Self {
            dev_type,
            scsi_level: ScsiLevel::Scsi2,
            id: 0,
            lun,
            vendor: "DRIFT".to_string(),
            product: String::new(),
            revision: format!("{:02}{:02}", major, minor),
            ready: false,
            read_only: false,
            protectable: false,
            write_protected: false,
            stoppable: false,
            stopped: false,
            removable: false,
            removed: false,
            lockable: false,
            locked: false,
            attn: false,
            reset: false,
            medium_changed: false,
            delay_after_bytes: 0,
            params: HashMap::new(),
            sense: SenseData::default(),
            reserving_initiator: UNKNOWN_INITIATOR,
        }
    }

    pub fn dev_type(&self) -> DeviceType {
        self.dev_type
    }

    pub fn scsi_level(&self) -> ScsiLevel {
        self.scsi_level
    }

    pub fn set_scsi_level(&mut self, level: ScsiLevel) {
        self.scsi_level = level;
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// Called once by the controller when the device is attached
    pub fn set_address(&mut self, id: u8, lun: u8) {
        self.id = id;
        self.lun = lun;
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn set_vendor(&mut self, vendor: &str) -> anyhow::Result<()> {
        if vendor.is_empty() || vendor.len() > 8 {
            anyhow::bail!("Vendor '{}' must have between 1 and 8 characters", vendor);
        }
        self.vendor = vendor.to_string();
        Ok(())
    }

    /// Changing vital product data after the first assignment is not SCSI
    /// compliant and is ignored unless `force` is set.
    pub fn set_product(&mut self, product: &str, force: bool) -> anyhow::Result<()> {
        if product.is_empty() || product.len() > 16 {
            anyhow::bail!(
                "Product '{}' must have between 1 and 16 characters",
                product
            );
        }
        if self.product.is_empty() || force {
            self.product = product.to_string();
        }
        Ok(())
    }

    pub fn set_revision(&mut self, revision: &str) -> anyhow::Result<()> {
        if revision.is_empty() || revision.len() > 4 {
            anyhow::bail!(
                "Revision '{}' must have between 1 and 4 characters",
                revision
            );
        }
        self.revision = revision.to_string();
        Ok(())
    }

    /// Vendor, product and revision space-padded to 8/16/4 bytes
    pub fn padded_name(&self) -> [u8; 28] {
        let mut name = [b' '; 28];
        name[..self.vendor.len().min(8)].copy_from_slice(&self.vendor.as_bytes()[..self.vendor.len().min(8)]);
        let p = self.product.as_bytes();
        name[8..8 + p.len().min(16)].copy_from_slice(&p[..p.len().min(16)]);
        let r = self.revision.as_bytes();
        name[24..24 + r.len().min(4)].copy_from_slice(&r[..r.len().min(4)]);
        name
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set_params(&mut self, params: &HashMap<String, String>) {
        self.params = params.clone();
    }

    pub fn set_protected(&mut self, protect: bool) {
        if self.protectable && !self.read_only {
            self.write_protected = protect;
        }
    }

    pub fn start(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        self.stopped = false;
        true
    }

    pub fn stop(&mut self) {
        self.ready = false;
        self.attn = false;
        self.stopped = true;
    }

    /// Transitions the device to the ejected state. A no-op unless the
    /// device is ready and removable; rejected while locked unless forced.
    pub fn eject_flags(&mut self, force: bool) -> bool {
        if !self.ready || !self.removable {
            return false;
        }
        if !force && self.locked {
            return false;
        }

        self.ready = false;
        self.attn = false;
        self.removed = true;
        self.write_protected = false;
        self.locked = false;
        self.stopped = true;
        true
    }

    pub fn reset(&mut self) {
        self.locked = false;
        self.attn = false;
        self.reset = false;
        self.discard_reservation();
        self.set_sense(SenseKey::NoSense, Asc::NoAdditionalSenseInformation);
    }

    pub fn set_sense(&mut self, key: SenseKey, asc: Asc) {
        self.sense = SenseData {
            key,
            asc,
            ..SenseData::default()
        };
    }

    pub fn set_sense_with_lba(&mut self, key: SenseKey, asc: Asc, lba: u32) {
        self.sense = SenseData {
            key,
            asc,
            valid: true,
            information: lba,
            ..SenseData::default()
        };
    }

    /// Raises unit attention for reset/attn conditions and reports the
    /// medium state, in that order of precedence.
    pub fn check_ready(&mut self) -> Result<(), ScsiError> {
        if self.reset {
            self.reset = false;
            return Err(ScsiError::new(SenseKey::UnitAttention, Asc::PowerOnOrReset));
        }

        if self.attn {
            self.attn = false;
            return Err(ScsiError::new(
                SenseKey::UnitAttention,
                Asc::NotReadyToReadyChange,
            ));
        }

        if !self.ready {
            return Err(ScsiError::new(SenseKey::NotReady, Asc::MediumNotPresent));
        }

        Ok(())
    }

    pub fn reserve(&mut self, initiator: InitiatorId) {
        self.reserving_initiator = initiator;
    }

    pub fn discard_reservation(&mut self) {
        self.reserving_initiator = UNKNOWN_INITIATOR;
    }

    pub fn is_reserved(&self) -> bool {
        self.reserving_initiator != UNKNOWN_INITIATOR
    }

    /// True if the given initiator may execute the command at all.
    /// A reservation held by another initiator permits only INQUIRY,
    /// REQUEST SENSE, RELEASE, and PREVENT ALLOW MEDIUM REMOVAL with the
    /// prevent bit clear.
    pub fn check_reservation(&self, initiator: InitiatorId, opcode: u8, prevent_bit: bool) -> bool {
        use crate::scsi::ScsiCommand;

        if self.reserving_initiator == UNKNOWN_INITIATOR || self.reserving_initiator == initiator {
            return true;
        }

        match num_traits::FromPrimitive::from_u8(opcode) {
            Some(ScsiCommand::Inquiry | ScsiCommand::RequestSense | ScsiCommand::Release6) => true,
            Some(ScsiCommand::PreventAllowMediumRemoval) => !prevent_bit,
            _ => {
                if initiator != UNKNOWN_INITIATOR {
                    log::trace!("Initiator {} tries to access reserved device", initiator);
                } else {
                    log::trace!("Unknown initiator tries to access reserved device");
                }
                false
            }
        }
    }
}

/// Statistics categories reported through the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatCategory {
    Info,
    Error,
}

/// A single statistics entry for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistic {
    pub id: u8,
    pub lun: u8,
    pub category: StatCategory,
    pub key: String,
    pub value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_name_layout() {
        let mut dev = Device::new(DeviceType::Hd, 0);
        dev.set_vendor("ACME").unwrap();
        dev.set_product("TURBODISK", false).unwrap();
        dev.set_revision("1.0").unwrap();

        let name = dev.padded_name();
        assert_eq!(&name[0..8], b"ACME    ");
        assert_eq!(&name[8..24], b"TURBODISK       ");
        assert_eq!(&name[24..28], b"1.0 ");
    }

    #[test]
    fn product_immutable_without_force() {
        let mut dev = Device::new(DeviceType::Hd, 0);
        dev.set_product("FIRST", false).unwrap();
        dev.set_product("SECOND", false).unwrap();
        assert_eq!(dev.product(), "FIRST");
        dev.set_product("SECOND", true).unwrap();
        assert_eq!(dev.product(), "SECOND");
    }

    #[test]
    fn protect_requires_protectable() {
        let mut dev = Device::new(DeviceType::Hd, 0);
        dev.set_protected(true);
        assert!(!dev.write_protected);

        dev.protectable = true;
        dev.set_protected(true);
        assert!(dev.write_protected);

        dev.read_only = true;
        dev.set_protected(false);
        assert!(dev.write_protected);
    }

    #[test]
    fn eject_honors_lock() {
        let mut dev = Device::new(DeviceType::RemovableHd, 0);
        dev.ready = true;
        dev.removable = true;
        dev.locked = true;

        assert!(!dev.eject_flags(false));
        assert!(dev.ready);

        assert!(dev.eject_flags(true));
        assert!(dev.removed);
        assert!(!dev.locked);
    }

    #[test]
    fn reservation_exemptions() {
        let mut dev = Device::new(DeviceType::Hd, 0);
        dev.reserve(1);

        // Holder may do anything
        assert!(dev.check_reservation(1, 0x00, false));
        // Others only the exempt commands
        assert!(dev.check_reservation(2, 0x12, false));
        assert!(dev.check_reservation(2, 0x03, false));
        assert!(dev.check_reservation(2, 0x17, false));
        assert!(dev.check_reservation(2, 0x1E, false));
        assert!(!dev.check_reservation(2, 0x1E, true));
        assert!(!dev.check_reservation(2, 0x00, false));
        assert!(!dev.check_reservation(UNKNOWN_INITIATOR, 0x00, false));
    }

    #[test]
    fn check_ready_precedence() {
        let mut dev = Device::new(DeviceType::Hd, 0);
        dev.reset = true;
        dev.attn = true;

        let e = dev.check_ready().unwrap_err();
        assert_eq!(e.asc, Asc::PowerOnOrReset);

        let e = dev.check_ready().unwrap_err();
        assert_eq!(e.asc, Asc::NotReadyToReadyChange);

        let e = dev.check_ready().unwrap_err();
        assert_eq!(e.asc, Asc::MediumNotPresent);

        dev.ready = true;
        assert!(dev.check_ready().is_ok());
    }
}
