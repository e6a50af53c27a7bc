//! Mapping from SCSI target ID to controller
//!
//! A controller is created implicitly when the first LUN on its ID is
//! attached (which must be LUN 0) and deleted when its last LUN is
//! detached. The factory also routes a selection to the controller whose ID
//! bit is asserted on the data lines.

use std::collections::BTreeMap;

use crate::bus::ScsiBus;
use crate::controller::{ScsiController, SASI_LUN_MAX, SCSI_LUN_MAX};
use crate::device::target::ScsiTarget;
use crate::device::DeviceType;
use crate::scsi::ShutdownMode;

pub const ID_MAX: u8 = 8;

#[derive(Default)]
pub struct ControllerFactory {
    controllers: BTreeMap<u8, ScsiController>,
}

impl ControllerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a device, creating the controller when this is the first
    /// LUN on the ID. Only LUN 0 may create a controller.
    pub fn attach(&mut self, id: u8, lun: u8, device: Box<dyn ScsiTarget>) -> bool {
        if id >= ID_MAX {
            return false;
        }

        if let Some(controller) = self.controllers.get_mut(&id) {
            return controller.add_device(lun, device);
        }

        if lun != 0 {
            return false;
        }

        let max_luns = if device.device().dev_type() == DeviceType::SasiHd {
            SASI_LUN_MAX
        } else {
            SCSI_LUN_MAX
        };

        let mut controller = ScsiController::new(id, max_luns);
        if !controller.add_device(lun, device) {
            return false;
        }

        self.controllers.insert(id, controller);
        true
    }

    /// Detaches one LUN; the controller goes away with its last LUN
    pub fn detach(&mut self, id: u8, lun: u8) -> Option<Box<dyn ScsiTarget>> {
        let controller = self.controllers.get_mut(&id)?;
        let device = controller.remove_device(lun)?;

        if controller.lun_count() == 0 {
            self.controllers.remove(&id);
        }

        Some(device)
    }

    /// Detaches everything; returns true if there was anything to detach
    pub fn detach_all(&mut self) -> bool {
        let had_controllers = !self.controllers.is_empty();

        for controller in self.controllers.values_mut() {
            for (_, device) in controller.devices_mut() {
                device.cleanup();
            }
        }
        self.controllers.clear();

        had_controllers
    }

    pub fn has_controller(&self, id: u8) -> bool {
        self.controllers.contains_key(&id)
    }

    pub fn controller(&self, id: u8) -> Option<&ScsiController> {
        self.controllers.get(&id)
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ScsiController> + '_ {
        self.controllers.values()
    }

    pub fn device_for(&self, id: u8, lun: u8) -> Option<&dyn ScsiTarget> {
        self.controllers.get(&id)?.device_for_lun(lun)
    }

    pub fn device_for_mut(&mut self, id: u8, lun: u8) -> Option<&mut (dyn ScsiTarget + 'static)> {
        self.controllers.get_mut(&id)?.device_for_lun_mut(lun)
    }

    pub fn has_device_for(&self, id: u8, lun: u8) -> bool {
        self.device_for(id, lun).is_some()
    }

    /// All attached devices as `(id, lun, device)`
    pub fn all_devices(&self) -> impl Iterator<Item = (u8, u8, &dyn ScsiTarget)> + '_ {
        self.controllers
            .iter()
            .flat_map(|(&id, c)| c.devices().map(move |(lun, d)| (id, lun, d)))
    }

    /// Hands a selection to the controller whose ID bit is set in the DAT
    /// snapshot
    pub fn process_on_controller(&mut self, bus: &mut dyn ScsiBus, id_data: u8) -> ShutdownMode {
        let Some(controller) = self
            .controllers
            .values_mut()
            .find(|c| id_data & (1 << c.target_id()) != 0)
        else {
            return ShutdownMode::None;
        };

        controller.process_on_controller(bus, id_data)
    }

    /// Resets every controller and its devices (bus RST)
    pub fn reset_all(&mut self, bus: &mut dyn ScsiBus) {
        for controller in self.controllers.values_mut() {
            controller.reset(bus);
        }
    }

    /// Writes back all dirty caches
    pub fn flush_all(&mut self) {
        for controller in self.controllers.values_mut() {
            for (_, device) in controller.devices_mut() {
                device.flush();
            }
        }
    }
}
