//! Remote-command orchestration
//!
//! Every device-specific command runs in two passes: a dry run that
//! validates all devices of the command, then the real pass. The image
//! reservation registry and the published properties are snapshotted
//! around the dry run so it cannot leak state. Between the passes the
//! LUN-0 invariant is checked: every target ID in the resulting device set
//! must have a device at LUN 0.
//!
//! Error messages lead with a stable `ERROR_*` key; the human-readable
//! rendering is the front-ends' business.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use crate::control::types::{
    ControlCommand, ControlResult, DeviceDefinition, DeviceInfo, DeviceTypeInfo, ImageFilesInfo,
    LogLevelInfo, Operation, ServerInfo, VersionInfo,
};
use crate::controller::factory::ControllerFactory;
use crate::controller::{SASI_LUN_MAX, SCSI_LUN_MAX};
use crate::device::storage::FileRegistry;
use crate::device::target::ScsiTarget;
use crate::device::DeviceType;
use crate::devinfo::DeviceFactory;
use crate::images::ImageSupport;
use crate::props::{join_params, PropertyStore};
use crate::scsi::ShutdownMode;

pub struct CommandExecutor {
    factory: ControllerFactory,
    device_factory: DeviceFactory,
    images: ImageSupport,
    registry: FileRegistry,
    properties: PropertyStore,
    reserved_ids: BTreeSet<u8>,

    /// Set by SHUT_DOWN, consumed by the daemon loop
    pending_shutdown: ShutdownMode,
}

impl CommandExecutor {
    pub fn new(
        device_factory: DeviceFactory,
        images: ImageSupport,
        properties: PropertyStore,
    ) -> Self {
        let registry = device_factory.registry().clone();
        Self {
            factory: ControllerFactory::new(),
            device_factory,
            images,
            registry,
            properties,
            reserved_ids: BTreeSet::new(),
            pending_shutdown: ShutdownMode::None,
        }
    }

    pub fn factory(&self) -> &ControllerFactory {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut ControllerFactory {
        &mut self.factory
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn take_shutdown(&mut self) -> ShutdownMode {
        std::mem::take(&mut self.pending_shutdown)
    }

    pub fn process_command(&mut self, command: &ControlCommand) -> ControlResult {
        match command.operation {
            Operation::DetachAll => {
                if self.factory.detach_all() {
                    self.properties.remove_prefix("device.");
                    log::info!("Detached all devices");
                }
                ControlResult::success()
            }

            Operation::ReserveIds => self.reserve_ids(command),

            Operation::CheckAuthentication | Operation::NoOperation => {
                log::trace!("Received {} command", command.operation.name());
                ControlResult::success()
            }

            Operation::VersionInfo => ControlResult {
                version_info: Some(version_info()),
                ..ControlResult::success()
            },

            Operation::ServerInfo => ControlResult {
                server_info: Some(ServerInfo {
                    version: version_info(),
                    log_level: log_level_info(),
                    default_folder: self.images.default_folder().to_path_buf(),
                    reserved_ids: self.reserved_ids.iter().copied().collect(),
                    devices: self.devices_info(),
                }),
                ..ControlResult::success()
            },

            Operation::DevicesInfo => ControlResult {
                devices_info: Some(self.devices_info()),
                ..ControlResult::success()
            },

            Operation::DeviceTypesInfo => ControlResult {
                device_types_info: Some(device_types_info()),
                ..ControlResult::success()
            },

            Operation::DefaultImageFilesInfo => ControlResult {
                image_files_info: Some(ImageFilesInfo {
                    default_folder: self.images.default_folder().to_path_buf(),
                    files: self.images.list_images(),
                }),
                ..ControlResult::success()
            },

            Operation::ImageFileInfo => {
                let Some(filename) = command.param("file") else {
                    return ControlResult::error("ERROR_MISSING_FILENAME");
                };
                match self.images.file_info(filename) {
                    Ok(info) => ControlResult {
                        image_file_info: Some(info),
                        ..ControlResult::success()
                    },
                    Err(e) => ControlResult::error(format!("ERROR_IMAGE_FILE_INFO: {:#}", e)),
                }
            }

            Operation::LogLevelInfo => ControlResult {
                log_level_info: Some(log_level_info()),
                ..ControlResult::success()
            },

            Operation::LogLevel => {
                let Some(level) = command.param("level") else {
                    return ControlResult::error("ERROR_MISSING_LOG_LEVEL");
                };
                match log::LevelFilter::from_str(level) {
                    Ok(filter) => {
                        log::set_max_level(filter);
                        log::info!("Set log level to '{}'", level);
                        ControlResult::success()
                    }
                    Err(_) => {
                        ControlResult::error(format!("ERROR_LOG_LEVEL: invalid level '{}'", level))
                    }
                }
            }

            // Interface enumeration belongs to the host integration, which
            // is not part of this daemon
            Operation::NetworkInterfacesInfo => ControlResult {
                network_interfaces_info: Some(Vec::new()),
                ..ControlResult::success()
            },

            Operation::MappingInfo => ControlResult {
                mapping_info: Some(
                    self.device_factory
                        .extension_map()
                        .iter()
                        .map(|(ext, &t)| (ext.clone(), t))
                        .collect(),
                ),
                ..ControlResult::success()
            },

            Operation::StatisticsInfo => ControlResult {
                statistics_info: Some(
                    self.factory
                        .all_devices()
                        .flat_map(|(_, _, d)| d.statistics())
                        .collect(),
                ),
                ..ControlResult::success()
            },

            Operation::PropertiesInfo => ControlResult {
                properties_info: Some(self.properties.properties().clone()),
                ..ControlResult::success()
            },

            Operation::ReservedIdsInfo => ControlResult {
                reserved_ids_info: Some(self.reserved_ids.iter().copied().collect()),
                ..ControlResult::success()
            },

            Operation::OperationInfo => ControlResult {
                operation_info: Some(
                    Operation::ALL.iter().map(|op| op.name().to_string()).collect(),
                ),
                ..ControlResult::success()
            },

            Operation::DefaultFolder => {
                let Some(folder) = command.param("folder") else {
                    return ControlResult::error("ERROR_MISSING_FOLDER");
                };
                match self.images.set_default_folder(std::path::Path::new(folder)) {
                    Ok(()) => {
                        log::info!("Default image folder set to '{}'", folder);
                        ControlResult::success()
                    }
                    Err(e) => ControlResult::error(format!("ERROR_DEFAULT_FOLDER: {:#}", e)),
                }
            }

            Operation::ShutDown => self.shut_down(command),

            Operation::CreateImage => {
                let (Some(file), Some(size)) = (command.param("file"), command.param("size"))
                else {
                    return ControlResult::error("ERROR_MISSING_IMAGE_PARAMETERS");
                };
                let Ok(size) = size.parse() else {
                    return ControlResult::error(format!("ERROR_IMAGE_SIZE: '{}'", size));
                };
                self.image_op(self.images.create_image(file, size).map(|_| ()))
            }

            Operation::DeleteImage => match command.param("file") {
                Some(file) => self.image_op(self.images.delete_image(file)),
                None => ControlResult::error("ERROR_MISSING_FILENAME"),
            },

            Operation::RenameImage | Operation::CopyImage => {
                let (Some(from), Some(to)) = (command.param("from"), command.param("to")) else {
                    return ControlResult::error("ERROR_MISSING_IMAGE_PARAMETERS");
                };
                let result = if command.operation == Operation::RenameImage {
                    self.images.rename_image(from, to)
                } else {
                    self.images.copy_image(from, to)
                };
                self.image_op(result)
            }

            Operation::ProtectImage | Operation::UnprotectImage => {
                match command.param("file") {
                    Some(file) => self.image_op(
                        self.images
                            .protect_image(file, command.operation == Operation::ProtectImage),
                    ),
                    None => ControlResult::error("ERROR_MISSING_FILENAME"),
                }
            }

            Operation::Attach
            | Operation::Detach
            | Operation::Insert
            | Operation::Eject
            | Operation::Start
            | Operation::Stop
            | Operation::Protect
            | Operation::Unprotect => self.process_device_commands(command),
        }
    }

    fn image_op(&self, result: anyhow::Result<()>) -> ControlResult {
        match result {
            Ok(()) => ControlResult::success(),
            Err(e) => ControlResult::error(format!("ERROR_IMAGE_OPERATION: {:#}", e)),
        }
    }

    /// Dry-run pass over every device, then the real pass. The registry and
    /// the published properties are restored after the dry run.
    fn process_device_commands(&mut self, command: &ControlCommand) -> ControlResult {
        if command.devices.is_empty() {
            return ControlResult::error("ERROR_MISSING_DEVICE: command carries no device");
        }

        let registry_snapshot = self.registry.snapshot();
        let properties_snapshot = self.properties.snapshot();

        let mut dry_run_error = None;
        for device in &command.devices {
            if let Err(e) = self.process_device_cmd(command, device, true) {
                dry_run_error = Some(e);
                break;
            }
        }

        self.registry.restore(registry_snapshot);
        self.properties.restore(properties_snapshot);

        if let Some(e) = dry_run_error {
            return ControlResult::error(e);
        }

        if let Err(e) = self.ensure_lun0(command) {
            return ControlResult::error(e);
        }

        for device in &command.devices {
            if let Err(e) = self.process_device_cmd(command, device, false) {
                return ControlResult::error(e);
            }
        }

        let mut result = ControlResult::success();
        if matches!(command.operation, Operation::Attach | Operation::Detach) {
            // ATTACH and DETACH return the resulting device list
            result.devices_info = Some(self.devices_info());
        }
        result
    }

    /// For each target ID in the resulting device set, LUN 0 must be
    /// occupied
    fn ensure_lun0(&self, command: &ControlCommand) -> Result<(), String> {
        let mut luns: HashMap<u8, u32> = HashMap::new();

        for device in &command.devices {
            *luns.entry(device.id).or_default() |= 1 << device.unit;
        }
        for (id, lun, _) in self.factory.all_devices() {
            *luns.entry(id).or_default() |= 1 << lun;
        }

        match luns.iter().find(|(_, &bits)| bits & 0x01 == 0) {
            Some((&id, _)) => Err(format!(
                "ERROR_MISSING_LUN0: LUN 0 is missing for ID {}",
                id
            )),
            None => Ok(()),
        }
    }

    fn process_device_cmd(
        &mut self,
        command: &ControlCommand,
        device: &DeviceDefinition,
        dry_run: bool,
    ) -> Result<(), String> {
        if dry_run {
            log::trace!(
                "Validating: operation={}, device={}:{}",
                command.operation.name(),
                device.id,
                device.unit
            );
        } else {
            log::info!(
                "Executing: operation={}, device={}:{}",
                command.operation.name(),
                device.id,
                device.unit
            );
        }

        self.validate_device(command, device)?;

        match command.operation {
            Operation::Attach => self.attach(device, dry_run),
            Operation::Detach => self.detach(device, dry_run),
            Operation::Insert => self.insert(device, dry_run),
            Operation::Eject => self.simple_device_op(command.operation, device, dry_run),
            Operation::Start | Operation::Stop => {
                self.simple_device_op(command.operation, device, dry_run)
            }
            Operation::Protect | Operation::Unprotect => {
                self.simple_device_op(command.operation, device, dry_run)
            }
            _ => Err(format!(
                "ERROR_OPERATION: {} is not a device operation",
                command.operation.name()
            )),
        }
    }

    fn validate_device(
        &self,
        command: &ControlCommand,
        device: &DeviceDefinition,
    ) -> Result<(), String> {
        if device.id >= 8 {
            return Err(format!("ERROR_INVALID_ID: {}", device.id));
        }

        let lun_max = if device.device_type == Some(DeviceType::SasiHd) {
            SASI_LUN_MAX
        } else {
            SCSI_LUN_MAX
        };
        if device.unit >= lun_max {
            return Err(format!(
                "ERROR_INVALID_LUN: {} (0..{})",
                device.unit,
                lun_max - 1
            ));
        }

        // For all commands except ATTACH the device must exist
        if command.operation == Operation::Attach {
            return Ok(());
        }

        if !self.factory.has_controller(device.id) {
            return Err(format!(
                "ERROR_NON_EXISTING_DEVICE: no device for ID {}",
                device.id
            ));
        }
        let Some(target) = self.factory.device_for(device.id, device.unit) else {
            return Err(format!(
                "ERROR_NON_EXISTING_UNIT: no device for {}:{}",
                device.id, device.unit
            ));
        };

        self.validate_operation(command.operation, target)
    }

    fn validate_operation(
        &self,
        operation: Operation,
        target: &dyn ScsiTarget,
    ) -> Result<(), String> {
        let dev = target.device();
        let type_name = dev.dev_type().name();

        match operation {
            Operation::Start | Operation::Stop if !dev.stoppable => Err(format!(
                "ERROR_OPERATION_DENIED_STOPPABLE: {} for {}",
                operation.name(),
                type_name
            )),
            Operation::Insert | Operation::Eject if !dev.removable => Err(format!(
                "ERROR_OPERATION_DENIED_REMOVABLE: {} for {}",
                operation.name(),
                type_name
            )),
            Operation::Protect | Operation::Unprotect if !dev.protectable => Err(format!(
                "ERROR_OPERATION_DENIED_PROTECTABLE: {} for {}",
                operation.name(),
                type_name
            )),
            Operation::Protect | Operation::Unprotect if !dev.ready => Err(format!(
                "ERROR_OPERATION_DENIED_READY: {} for {}",
                operation.name(),
                type_name
            )),
            _ => Ok(()),
        }
    }

    fn attach(&mut self, definition: &DeviceDefinition, dry_run: bool) -> Result<(), String> {
        let (id, lun) = (definition.id, definition.unit);
        let filename = definition
            .params
            .get("file")
            .cloned()
            .unwrap_or_default();

        let Some(device_type) = definition
            .device_type
            .or_else(|| self.device_factory.device_type_for(&filename))
        else {
            return Err(format!(
                "ERROR_MISSING_DEVICE_TYPE: device type for '{}' could not be derived",
                filename
            ));
        };

        if self.factory.has_device_for(id, lun) {
            return Err(format!("ERROR_DUPLICATE_ID: {}:{}", id, lun));
        }

        if self.reserved_ids.contains(&id) {
            return Err(format!("ERROR_RESERVED_ID: {}", id));
        }

        if DeviceFactory::is_unique_type(device_type)
            && self
                .factory
                .all_devices()
                .any(|(_, _, d)| d.device().dev_type() == device_type)
        {
            return Err(format!(
                "ERROR_UNIQUE_DEVICE_TYPE: there can only be one {} device",
                device_type.name()
            ));
        }

        let mut device = self
            .device_factory
            .create(device_type, lun)
            .map_err(|e| format!("ERROR_UNKNOWN_DEVICE_TYPE: {:#}", e))?;

        // Identity, SCSI level and block size apply before the file is
        // opened
        self.apply_product_data(device.as_mut(), definition, true)?;

        if definition.scsi_level != 0 {
            let Some(level) = crate::device::ScsiLevel::from_u32(definition.scsi_level) else {
                return Err(format!("ERROR_SCSI_LEVEL: {}", definition.scsi_level));
            };
            device.device_mut().set_scsi_level(level);
        }

        if definition.block_size != 0
            && !device.set_configured_block_size(definition.block_size)
        {
            return Err(format!("ERROR_BLOCK_SIZE: {}", definition.block_size));
        }

        if device.supports_file() {
            // Without a filename the medium is considered not inserted,
            // which only removable drives allow
            device.device_mut().removed = filename.is_empty();

            if filename.is_empty() && !device.device().removable {
                return Err(format!(
                    "ERROR_DEVICE_MISSING_FILENAME: {} {}:{}",
                    device_type.name(),
                    id,
                    lun
                ));
            }

            if !filename.is_empty() {
                let path = self.images.resolve_existing(&filename);

                if let Some((other_id, other_lun)) = self.registry.ids_for(&path) {
                    return Err(format!(
                        "ERROR_IMAGE_IN_USE: '{}' is already being used by {}:{}",
                        filename, other_id, other_lun
                    ));
                }

                device
                    .open(&path)
                    .map_err(|e| format!("ERROR_FILE_OPEN: {:#}", e))?;
            }
        }

        // Only non read-only devices support protect; this must happen
        // after the file was opened, which may force read-only
        if device.device().protectable && !device.device().read_only {
            device.device_mut().set_protected(definition.protected);
        }

        if dry_run {
            // Keep the reservation so a later device in the same command
            // sees the conflict; the registry is restored afterwards
            if device.supports_file() && !filename.is_empty() {
                device.device_mut().set_address(id, lun);
                device.reserve_file();
            }
            return Ok(());
        }

        device.device_mut().set_params(&definition.params);
        device
            .init()
            .map_err(|e| format!("ERROR_INITIALIZATION: {:#}", e))?;

        if !self.factory.attach(id, lun, device) {
            return Err(format!("ERROR_CONTROLLER: can't attach device {}:{}", id, lun));
        }

        let device = self.factory.device_for_mut(id, lun).unwrap();
        if device.supports_file() && !device.device().removed {
            device.reserve_file();
        }

        // Publish the device settings
        let dev = device.device();
        let type_name = dev.dev_type().name().to_string();
        let name = format!("{}:{}:{}", dev.vendor(), dev.product(), dev.revision());
        let read_only = dev.read_only;
        let protected = dev.write_protected;
        let block_size = device.block_size();
        let params = match device.filename() {
            Some(path) => path.display().to_string(),
            None => {
                let params: HashMap<String, String> = definition
                    .params
                    .iter()
                    .filter(|(k, _)| k.as_str() != "file")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                join_params(&params)
            }
        };
        self.properties
            .publish_device(id, lun, &type_name, &name, block_size, &params);

        log::info!(
            "Attached {}{} {}:{}",
            if read_only {
                "read-only "
            } else if protected {
                "protected "
            } else {
                ""
            },
            type_name,
            id,
            lun
        );

        Ok(())
    }

    fn apply_product_data(
        &self,
        device: &mut dyn ScsiTarget,
        definition: &DeviceDefinition,
        force: bool,
    ) -> Result<(), String> {
        let dev = device.device_mut();
        if !definition.vendor.is_empty() {
            dev.set_vendor(&definition.vendor)
                .map_err(|e| format!("ERROR_PRODUCT_DATA: {:#}", e))?;
        }
        if !definition.product.is_empty() {
            dev.set_product(&definition.product, force)
                .map_err(|e| format!("ERROR_PRODUCT_DATA: {:#}", e))?;
        }
        if !definition.revision.is_empty() {
            dev.set_revision(&definition.revision)
                .map_err(|e| format!("ERROR_PRODUCT_DATA: {:#}", e))?;
        }
        Ok(())
    }

    fn detach(&mut self, definition: &DeviceDefinition, dry_run: bool) -> Result<(), String> {
        let controller = self.factory.controller(definition.id).unwrap();

        // LUN 0 can only be detached if no other LUN is left
        if definition.unit == 0 && controller.lun_count() > 1 {
            return Err(format!(
                "ERROR_LUN0: LUN 0 of ID {} cannot be detached while other LUNs exist",
                definition.id
            ));
        }

        if dry_run {
            return Ok(());
        }

        if self.factory.detach(definition.id, definition.unit).is_none() {
            return Err("ERROR_DETACH".to_string());
        }

        self.properties
            .unpublish_device(definition.id, definition.unit);

        log::info!("Detached device {}:{}", definition.id, definition.unit);
        Ok(())
    }

    fn insert(&mut self, definition: &DeviceDefinition, dry_run: bool) -> Result<(), String> {
        let (id, lun) = (definition.id, definition.unit);

        let device = self.factory.device_for(id, lun).unwrap();
        if !device.supports_file() {
            return Err(format!(
                "ERROR_OPERATION_DENIED_REMOVABLE: INSERT for {}",
                device.device().dev_type().name()
            ));
        }
        if !device.device().removed {
            return Err("ERROR_EJECT_REQUIRED: there is still a medium inserted".to_string());
        }

        // Identity updates are not permitted on insert
        if !definition.vendor.is_empty()
            || !definition.product.is_empty()
            || !definition.revision.is_empty()
        {
            return Err("ERROR_DEVICE_NAME_UPDATE".to_string());
        }

        let Some(filename) = definition.params.get("file").filter(|f| !f.is_empty()) else {
            return Err(format!(
                "ERROR_DEVICE_MISSING_FILENAME: {}:{}",
                id, lun
            ));
        };

        // The dry run stops before the device is modified
        if dry_run {
            return Ok(());
        }

        log::info!(
            "Insert {}file '{}' requested into {}:{}",
            if definition.protected { "protected " } else { "" },
            filename,
            id,
            lun
        );

        let path = self.images.resolve_existing(filename);
        if let Some((other_id, other_lun)) = self.registry.ids_for(&path) {
            return Err(format!(
                "ERROR_IMAGE_IN_USE: '{}' is already being used by {}:{}",
                filename, other_id, other_lun
            ));
        }

        let device = self.factory.device_for_mut(id, lun).unwrap();
        if definition.block_size != 0
            && !device.set_configured_block_size(definition.block_size)
        {
            return Err(format!("ERROR_BLOCK_SIZE: {}", definition.block_size));
        }

        device
            .open(&path)
            .map_err(|e| format!("ERROR_FILE_OPEN: {:#}", e))?;

        if !device.reserve_file() {
            return Err(format!(
                "ERROR_IMAGE_IN_USE: '{}' could not be reserved",
                filename
            ));
        }

        device.device_mut().medium_changed = true;
        device.device_mut().set_protected(definition.protected);

        let dev = device.device();
        let type_name = dev.dev_type().name().to_string();
        let name = format!("{}:{}:{}", dev.vendor(), dev.product(), dev.revision());
        let block_size = device.block_size();
        let file = path.display().to_string();
        self.properties
            .publish_device(id, lun, &type_name, &name, block_size, &file);

        Ok(())
    }

    fn simple_device_op(
        &mut self,
        operation: Operation,
        definition: &DeviceDefinition,
        dry_run: bool,
    ) -> Result<(), String> {
        if dry_run {
            return Ok(());
        }

        let (id, lun) = (definition.id, definition.unit);
        let device = self.factory.device_for_mut(id, lun).unwrap();

        match operation {
            Operation::Eject => {
                log::info!("Eject requested for {}:{}", id, lun);
                if !device.eject(true) {
                    log::warn!("Ejecting {}:{} failed", id, lun);
                    return Ok(());
                }
                self.properties
                    .remove_prefix(&format!("device.{}:{}.params", id, lun));
                if lun == 0 {
                    self.properties
                        .remove_prefix(&format!("device.{}.params", id));
                }
            }
            Operation::Start => {
                log::info!("Start requested for {}:{}", id, lun);
                if !device.device_mut().start() {
                    log::warn!("Starting {}:{} failed", id, lun);
                }
            }
            Operation::Stop => {
                log::info!("Stop requested for {}:{}", id, lun);
                device.flush();
                device.device_mut().stop();
                device.device_mut().set_sense(
                    crate::scsi::SenseKey::NoSense,
                    crate::scsi::Asc::NoAdditionalSenseInformation,
                );
            }
            Operation::Protect | Operation::Unprotect => {
                log::info!(
                    "Write {}protection requested for {}:{}",
                    if operation == Operation::Unprotect { "un" } else { "" },
                    id,
                    lun
                );
                device
                    .device_mut()
                    .set_protected(operation == Operation::Protect);
            }
            _ => unreachable!(),
        }

        Ok(())
    }

    /// RESERVE_IDS accepts a comma-separated ID list; an empty list clears
    /// the reservations
    fn reserve_ids(&mut self, command: &ControlCommand) -> ControlResult {
        let ids = command.param("ids").unwrap_or_default();

        let mut reserved = BTreeSet::new();
        for id in ids.split(',').filter(|s| !s.is_empty()) {
            let Ok(id) = id.trim().parse::<u8>() else {
                return ControlResult::error(format!("ERROR_INVALID_ID: '{}'", id));
            };
            if id >= 8 {
                return ControlResult::error(format!("ERROR_INVALID_ID: {}", id));
            }
            if self.factory.has_controller(id) {
                return ControlResult::error(format!(
                    "ERROR_RESERVED_ID: ID {} is currently in use",
                    id
                ));
            }
            reserved.insert(id);
        }

        self.reserved_ids = reserved;

        let list = self
            .reserved_ids
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.properties.set("reserved_ids", &list);

        if self.reserved_ids.is_empty() {
            log::info!("Cleared reserved ID(s)");
        } else {
            log::info!("Reserved ID(s) set to {}", list);
        }

        ControlResult::success()
    }

    fn shut_down(&mut self, command: &ControlCommand) -> ControlResult {
        let mode = match command.param("mode") {
            Some("daemon") | None => ShutdownMode::StopDaemon,
            Some("system") => ShutdownMode::StopHost,
            Some("reboot") => ShutdownMode::RestartHost,
            Some(other) => {
                return ControlResult::error(format!("ERROR_SHUTDOWN_MODE: '{}'", other));
            }
        };

        log::info!("Shutdown requested ({:?})", mode);
        self.pending_shutdown = mode;
        ControlResult::success()
    }

    pub fn devices_info(&self) -> Vec<DeviceInfo> {
        self.factory
            .all_devices()
            .map(|(id, lun, target)| {
                let dev = target.device();
                DeviceInfo {
                    id,
                    unit: lun,
                    device_type: dev.dev_type(),
                    vendor: dev.vendor().to_string(),
                    product: dev.product().to_string(),
                    revision: dev.revision().to_string(),
                    scsi_level: dev.scsi_level() as u32,
                    block_size: target.block_size(),
                    block_count: target.block_count(),
                    file: target.filename().map(|p| p.to_path_buf()),
                    ready: dev.ready,
                    read_only: dev.read_only,
                    protectable: dev.protectable,
                    protected: dev.write_protected,
                    removable: dev.removable,
                    removed: dev.removed,
                    lockable: dev.lockable,
                    locked: dev.locked,
                    stoppable: dev.stoppable,
                    stopped: dev.stopped,
                }
            })
            .collect()
    }
}

fn version_info() -> VersionInfo {
    VersionInfo {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    }
}

fn log_level_info() -> LogLevelInfo {
    LogLevelInfo {
        current: log::max_level().to_string().to_lowercase(),
        levels: ["off", "error", "warn", "info", "debug", "trace"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

fn device_types_info() -> Vec<DeviceTypeInfo> {
    [
        DeviceType::Hd,
        DeviceType::RemovableHd,
        DeviceType::Optical,
        DeviceType::CdRom,
        DeviceType::Printer,
        DeviceType::Ethernet,
        DeviceType::HostServices,
        DeviceType::SasiHd,
    ]
    .iter()
    .map(|&device_type| DeviceTypeInfo {
        device_type,
        supports_file: DeviceFactory::supports_file(device_type),
        removable: DeviceFactory::is_removable(device_type),
        block_sizes: if DeviceFactory::supports_file(device_type) {
            match device_type {
                DeviceType::CdRom => vec![512, 2048],
                _ => vec![512, 1024, 2048, 4096],
            }
        } else {
            Vec::new()
        },
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::modepage::ModePageOverrides;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn scratch_folder(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("drift-exec-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn executor(folder: &PathBuf) -> CommandExecutor {
        let registry = FileRegistry::default();
        let overrides = Arc::new(ModePageOverrides::default());
        CommandExecutor::new(
            DeviceFactory::new(registry, overrides),
            ImageSupport::new(folder.clone()),
            PropertyStore::default(),
        )
    }

    fn attach_cmd(id: u8, unit: u8, file: Option<&str>) -> ControlCommand {
        let mut cmd = ControlCommand::new(Operation::Attach);
        let mut def = DeviceDefinition {
            id,
            unit,
            ..Default::default()
        };
        if let Some(file) = file {
            def.params.insert("file".to_string(), file.to_string());
        }
        cmd.devices.push(def);
        cmd
    }

    fn make_image(folder: &PathBuf, name: &str, blocks: usize) {
        std::fs::write(folder.join(name), vec![0u8; blocks * 512]).unwrap();
    }

    #[test]
    fn attach_and_detach_disk() {
        let folder = scratch_folder("ad");
        make_image(&folder, "disk.hds", 1024);
        let mut exec = executor(&folder);

        let result = exec.process_command(&attach_cmd(3, 0, Some("disk.hds")));
        assert!(result.status, "{}", result.msg);

        let devices = result.devices_info.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, 3);
        assert_eq!(devices[0].device_type, DeviceType::Hd);
        assert_eq!(devices[0].block_count, Some(1024));
        assert!(devices[0].ready);

        let mut cmd = ControlCommand::new(Operation::Detach);
        cmd.devices.push(DeviceDefinition {
            id: 3,
            unit: 0,
            ..Default::default()
        });
        let result = exec.process_command(&cmd);
        assert!(result.status, "{}", result.msg);
        assert!(result.devices_info.unwrap().is_empty());
        assert!(!exec.factory().has_controller(3));

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn shared_image_file_rejected() {
        let folder = scratch_folder("share");
        make_image(&folder, "img.hds", 64);
        let mut exec = executor(&folder);

        assert!(exec.process_command(&attach_cmd(1, 0, Some("img.hds"))).status);

        let result = exec.process_command(&attach_cmd(2, 0, Some("img.hds")));
        assert!(!result.status);
        assert!(result.msg.contains("ERROR_IMAGE_IN_USE"), "{}", result.msg);

        // Controller table and registry are unchanged
        assert_eq!(exec.factory().all_devices().count(), 1);
        assert!(!exec.factory().has_controller(2));

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn lun0_invariant_enforced() {
        let folder = scratch_folder("lun0");
        make_image(&folder, "disk.hds", 64);
        let mut exec = executor(&folder);

        let result = exec.process_command(&attach_cmd(3, 1, Some("disk.hds")));
        assert!(!result.status);
        assert!(result.msg.contains("ERROR_MISSING_LUN0"), "{}", result.msg);
        assert!(result.msg.contains('3'));
        assert_eq!(exec.factory().all_devices().count(), 0);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn lun0_detached_last() {
        let folder = scratch_folder("lun0last");
        make_image(&folder, "a.hds", 64);
        make_image(&folder, "b.hds", 64);
        let mut exec = executor(&folder);

        assert!(exec.process_command(&attach_cmd(3, 0, Some("a.hds"))).status);
        assert!(exec.process_command(&attach_cmd(3, 1, Some("b.hds"))).status);

        let mut cmd = ControlCommand::new(Operation::Detach);
        cmd.devices.push(DeviceDefinition {
            id: 3,
            unit: 0,
            ..Default::default()
        });
        let result = exec.process_command(&cmd);
        assert!(!result.status);
        assert!(result.msg.contains("ERROR_LUN0"), "{}", result.msg);

        cmd.devices[0].unit = 1;
        assert!(exec.process_command(&cmd).status);
        cmd.devices[0].unit = 0;
        assert!(exec.process_command(&cmd).status);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn reserved_ids_block_attach() {
        let folder = scratch_folder("resid");
        make_image(&folder, "disk.hds", 64);
        let mut exec = executor(&folder);

        let mut cmd = ControlCommand::new(Operation::ReserveIds);
        cmd.params.insert("ids".to_string(), "3,5".to_string());
        assert!(exec.process_command(&cmd).status);

        let result = exec.process_command(&attach_cmd(3, 0, Some("disk.hds")));
        assert!(!result.status);
        assert!(result.msg.contains("ERROR_RESERVED_ID"), "{}", result.msg);

        // Invalid entries are rejected
        cmd.params.insert("ids".to_string(), "8".to_string());
        assert!(!exec.process_command(&cmd).status);
        cmd.params.insert("ids".to_string(), "x".to_string());
        assert!(!exec.process_command(&cmd).status);

        // Clearing works
        cmd.params.insert("ids".to_string(), String::new());
        assert!(exec.process_command(&cmd).status);
        assert!(exec.process_command(&attach_cmd(3, 0, Some("disk.hds"))).status);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn reserve_ids_rejects_used_id() {
        let folder = scratch_folder("residuse");
        make_image(&folder, "disk.hds", 64);
        let mut exec = executor(&folder);

        assert!(exec.process_command(&attach_cmd(3, 0, Some("disk.hds"))).status);

        let mut cmd = ControlCommand::new(Operation::ReserveIds);
        cmd.params.insert("ids".to_string(), "3".to_string());
        let result = exec.process_command(&cmd);
        assert!(!result.status);
        assert!(result.msg.contains("in use"), "{}", result.msg);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn nonremovable_needs_filename() {
        let folder = scratch_folder("nofile");
        let mut exec = executor(&folder);

        let mut cmd = ControlCommand::new(Operation::Attach);
        cmd.devices.push(DeviceDefinition {
            id: 1,
            unit: 0,
            device_type: Some(DeviceType::Hd),
            ..Default::default()
        });
        let result = exec.process_command(&cmd);
        assert!(!result.status);
        assert!(
            result.msg.contains("ERROR_DEVICE_MISSING_FILENAME"),
            "{}",
            result.msg
        );

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn removable_attach_insert_eject() {
        let folder = scratch_folder("insert");
        make_image(&folder, "cart.hds", 64);
        let mut exec = executor(&folder);

        // Attach without a medium
        let mut cmd = ControlCommand::new(Operation::Attach);
        cmd.devices.push(DeviceDefinition {
            id: 2,
            unit: 0,
            device_type: Some(DeviceType::RemovableHd),
            ..Default::default()
        });
        assert!(exec.process_command(&cmd).status);
        let device = exec.factory().device_for(2, 0).unwrap();
        assert!(device.device().removed);
        assert!(!device.device().ready);

        // Insert the cartridge
        let mut cmd = ControlCommand::new(Operation::Insert);
        let mut def = DeviceDefinition {
            id: 2,
            unit: 0,
            ..Default::default()
        };
        def.params
            .insert("file".to_string(), "cart.hds".to_string());
        cmd.devices.push(def);
        let result = exec.process_command(&cmd);
        assert!(result.status, "{}", result.msg);

        let device = exec.factory().device_for(2, 0).unwrap();
        assert!(device.device().ready);
        assert!(device.device().medium_changed);

        // A second insert requires an eject first
        let result = exec.process_command(&cmd);
        assert!(!result.status);
        assert!(result.msg.contains("ERROR_EJECT_REQUIRED"), "{}", result.msg);

        // Eject
        let mut cmd = ControlCommand::new(Operation::Eject);
        cmd.devices.push(DeviceDefinition {
            id: 2,
            unit: 0,
            ..Default::default()
        });
        assert!(exec.process_command(&cmd).status);
        assert!(exec.factory().device_for(2, 0).unwrap().device().removed);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn unique_device_types() {
        let folder = scratch_folder("unique");
        let mut exec = executor(&folder);

        let mut cmd = ControlCommand::new(Operation::Attach);
        cmd.devices.push(DeviceDefinition {
            id: 6,
            unit: 0,
            device_type: Some(DeviceType::HostServices),
            ..Default::default()
        });
        assert!(exec.process_command(&cmd).status);

        cmd.devices[0].id = 7;
        let result = exec.process_command(&cmd);
        assert!(!result.status);
        assert!(
            result.msg.contains("ERROR_UNIQUE_DEVICE_TYPE"),
            "{}",
            result.msg
        );

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn dry_run_failure_leaves_no_state() {
        let folder = scratch_folder("dry");
        make_image(&folder, "a.hds", 64);
        let mut exec = executor(&folder);

        // One command attaching a valid device and one with a missing file;
        // the dry run fails and nothing is attached
        let mut cmd = ControlCommand::new(Operation::Attach);
        let mut good = DeviceDefinition {
            id: 1,
            unit: 0,
            ..Default::default()
        };
        good.params.insert("file".to_string(), "a.hds".to_string());
        let mut bad = DeviceDefinition {
            id: 2,
            unit: 0,
            ..Default::default()
        };
        bad.params
            .insert("file".to_string(), "missing.hds".to_string());
        cmd.devices.push(good);
        cmd.devices.push(bad);

        let result = exec.process_command(&cmd);
        assert!(!result.status);
        assert_eq!(exec.factory().all_devices().count(), 0);
        assert!(exec.properties().properties().is_empty());

        // The file from the failed dry run can be attached afterwards
        assert!(exec.process_command(&attach_cmd(1, 0, Some("a.hds"))).status);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn intra_command_file_conflict() {
        let folder = scratch_folder("intra");
        make_image(&folder, "a.hds", 64);
        let mut exec = executor(&folder);

        let mut cmd = ControlCommand::new(Operation::Attach);
        for id in [1, 2] {
            let mut def = DeviceDefinition {
                id,
                unit: 0,
                ..Default::default()
            };
            def.params.insert("file".to_string(), "a.hds".to_string());
            cmd.devices.push(def);
        }

        let result = exec.process_command(&cmd);
        assert!(!result.status);
        assert_eq!(exec.factory().all_devices().count(), 0);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn shutdown_modes() {
        let folder = scratch_folder("shutdown");
        let mut exec = executor(&folder);

        let mut cmd = ControlCommand::new(Operation::ShutDown);
        cmd.params.insert("mode".to_string(), "daemon".to_string());
        assert!(exec.process_command(&cmd).status);
        assert_eq!(exec.take_shutdown(), ShutdownMode::StopDaemon);
        assert_eq!(exec.take_shutdown(), ShutdownMode::None);

        cmd.params.insert("mode".to_string(), "bogus".to_string());
        assert!(!exec.process_command(&cmd).status);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn info_operations() {
        let folder = scratch_folder("info");
        let mut exec = executor(&folder);

        let result = exec.process_command(&ControlCommand::new(Operation::VersionInfo));
        assert!(result.status);
        assert!(result.version_info.is_some());

        let result = exec.process_command(&ControlCommand::new(Operation::DeviceTypesInfo));
        assert!(result.device_types_info.unwrap().len() >= 8);

        let result = exec.process_command(&ControlCommand::new(Operation::OperationInfo));
        let ops = result.operation_info.unwrap();
        assert!(ops.contains(&"ATTACH".to_string()));
        assert!(ops.contains(&"DETACH_ALL".to_string()));

        let result = exec.process_command(&ControlCommand::new(Operation::MappingInfo));
        let mapping = result.mapping_info.unwrap();
        assert_eq!(mapping.get("hds"), Some(&DeviceType::Hd));
        assert_eq!(mapping.get("iso"), Some(&DeviceType::CdRom));

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn statistics_collected() {
        let folder = scratch_folder("stats");
        make_image(&folder, "disk.hds", 64);
        let mut exec = executor(&folder);
        assert!(exec.process_command(&attach_cmd(4, 0, Some("disk.hds"))).status);

        let result = exec.process_command(&ControlCommand::new(Operation::StatisticsInfo));
        let stats = result.statistics_info.unwrap();
        assert!(stats.iter().any(|s| s.key == "block_read_count"));
        assert!(stats.iter().all(|s| s.id == 4));

        std::fs::remove_dir_all(&folder).unwrap();
    }
}
