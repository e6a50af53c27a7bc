//! Device creation and type resolution
//!
//! Maps filenames to device types (special names for the non-storage units,
//! extensions for disk images) and constructs the targets with the shared
//! context objects (reservation registry, mode page overrides) wired in.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::bail;

use crate::device::cdrom::CdRom;
use crate::device::daynaport::{DaynaPort, LoopbackPort};
use crate::device::disk::Disk;
use crate::device::modepage::ModePageOverrides;
use crate::device::printer::Printer;
use crate::device::services::HostServices;
use crate::device::storage::FileRegistry;
use crate::device::target::ScsiTarget;
use crate::device::DeviceType;

pub struct DeviceFactory {
    extension_map: BTreeMap<String, DeviceType>,
    registry: FileRegistry,
    overrides: Arc<ModePageOverrides>,
}

impl DeviceFactory {
    pub fn new(registry: FileRegistry, overrides: Arc<ModePageOverrides>) -> Self {
        let mut extension_map = BTreeMap::new();
        for ext in ["hds", "hda", "hdn", "hdi", "nhd", "hdr"] {
            extension_map.insert(ext.to_string(), DeviceType::Hd);
        }
        extension_map.insert("mos".to_string(), DeviceType::Optical);
        extension_map.insert("iso".to_string(), DeviceType::CdRom);
        extension_map.insert("is1".to_string(), DeviceType::CdRom);

        Self {
            extension_map,
            registry,
            overrides,
        }
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn extension_map(&self) -> &BTreeMap<String, DeviceType> {
        &self.extension_map
    }

    pub fn add_extension_mapping(&mut self, extension: &str, device_type: DeviceType) {
        self.extension_map
            .insert(extension.to_ascii_lowercase(), device_type);
    }

    /// Resolves the device type from a filename: special names for the
    /// non-storage units, the extension map for disk images
    pub fn device_type_for(&self, filename: &str) -> Option<DeviceType> {
        match filename {
            "daynaport" => return Some(DeviceType::Ethernet),
            "printer" => return Some(DeviceType::Printer),
            "services" => return Some(DeviceType::HostServices),
            _ => (),
        }

        let extension = Path::new(filename)
            .extension()?
            .to_str()?
            .to_ascii_lowercase();
        self.extension_map.get(&extension).copied()
    }

    /// Device types that may exist at most once per daemon
    pub fn is_unique_type(device_type: DeviceType) -> bool {
        matches!(
            device_type,
            DeviceType::Printer | DeviceType::Ethernet | DeviceType::HostServices
        )
    }

    pub fn supports_file(device_type: DeviceType) -> bool {
        matches!(
            device_type,
            DeviceType::Hd
                | DeviceType::RemovableHd
                | DeviceType::Optical
                | DeviceType::CdRom
                | DeviceType::SasiHd
        )
    }

    pub fn is_removable(device_type: DeviceType) -> bool {
        matches!(
            device_type,
            DeviceType::RemovableHd | DeviceType::Optical | DeviceType::CdRom
        )
    }

    pub fn create(&self, device_type: DeviceType, lun: u8) -> anyhow::Result<Box<dyn ScsiTarget>> {
        Ok(match device_type {
            DeviceType::Hd | DeviceType::RemovableHd | DeviceType::Optical | DeviceType::SasiHd => {
                let mut disk = Disk::new(device_type, lun, self.registry.clone());
                disk.set_mode_page_overrides(Arc::clone(&self.overrides));
                Box::new(disk)
            }
            DeviceType::CdRom => {
                let mut cd = CdRom::new(lun, self.registry.clone());
                cd.set_mode_page_overrides(Arc::clone(&self.overrides));
                Box::new(cd)
            }
            DeviceType::Ethernet => {
                Box::new(DaynaPort::new(lun, Box::<LoopbackPort>::default()))
            }
            DeviceType::Printer => Box::new(Printer::new(lun)),
            DeviceType::HostServices => {
                let mut services = HostServices::new(lun);
                services.set_mode_page_overrides(Arc::clone(&self.overrides));
                Box::new(services)
            }
            DeviceType::Tape | DeviceType::Generic => {
                bail!(
                    "device type {} is not supported by this build",
                    device_type.name()
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> DeviceFactory {
        DeviceFactory::new(FileRegistry::default(), Arc::default())
    }

    #[test]
    fn type_resolution() {
        let f = factory();
        assert_eq!(f.device_type_for("image.hds"), Some(DeviceType::Hd));
        assert_eq!(f.device_type_for("IMAGE.HDS"), Some(DeviceType::Hd));
        assert_eq!(f.device_type_for("cd.iso"), Some(DeviceType::CdRom));
        assert_eq!(f.device_type_for("disk.mos"), Some(DeviceType::Optical));
        assert_eq!(f.device_type_for("daynaport"), Some(DeviceType::Ethernet));
        assert_eq!(f.device_type_for("printer"), Some(DeviceType::Printer));
        assert_eq!(f.device_type_for("services"), Some(DeviceType::HostServices));
        assert_eq!(f.device_type_for("file.bin"), None);
        assert_eq!(f.device_type_for("noextension"), None);
    }

    #[test]
    fn extension_mapping_is_mutable() {
        let mut f = factory();
        f.add_extension_mapping("IMG", DeviceType::RemovableHd);
        assert_eq!(f.device_type_for("x.img"), Some(DeviceType::RemovableHd));
    }

    #[test]
    fn unsupported_types_rejected() {
        let f = factory();
        assert!(f.create(DeviceType::Tape, 0).is_err());
        assert!(f.create(DeviceType::Generic, 0).is_err());
        assert!(f.create(DeviceType::Hd, 0).is_ok());
    }
}
