//! Control-channel command and result records
//!
//! Commands carry an operation, an optional device list and a key-value
//! parameter map. Results carry a status flag, an optional message and
//! optional payloads, depending on the operation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceType, Statistic};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Attach,
    Detach,
    DetachAll,
    Insert,
    Eject,
    Start,
    Stop,
    Protect,
    Unprotect,
    ServerInfo,
    VersionInfo,
    DevicesInfo,
    DeviceTypesInfo,
    DefaultImageFilesInfo,
    ImageFileInfo,
    LogLevelInfo,
    NetworkInterfacesInfo,
    MappingInfo,
    StatisticsInfo,
    PropertiesInfo,
    ReservedIdsInfo,
    OperationInfo,
    DefaultFolder,
    LogLevel,
    ReserveIds,
    ShutDown,
    CreateImage,
    DeleteImage,
    RenameImage,
    CopyImage,
    ProtectImage,
    UnprotectImage,
    CheckAuthentication,
    NoOperation,
}

impl Operation {
    pub const ALL: [Operation; 34] = [
        Operation::Attach,
        Operation::Detach,
        Operation::DetachAll,
        Operation::Insert,
        Operation::Eject,
        Operation::Start,
        Operation::Stop,
        Operation::Protect,
        Operation::Unprotect,
        Operation::ServerInfo,
        Operation::VersionInfo,
        Operation::DevicesInfo,
        Operation::DeviceTypesInfo,
        Operation::DefaultImageFilesInfo,
        Operation::ImageFileInfo,
        Operation::LogLevelInfo,
        Operation::NetworkInterfacesInfo,
        Operation::MappingInfo,
        Operation::StatisticsInfo,
        Operation::PropertiesInfo,
        Operation::ReservedIdsInfo,
        Operation::OperationInfo,
        Operation::DefaultFolder,
        Operation::LogLevel,
        Operation::ReserveIds,
        Operation::ShutDown,
        Operation::CreateImage,
        Operation::DeleteImage,
        Operation::RenameImage,
        Operation::CopyImage,
        Operation::ProtectImage,
        Operation::UnprotectImage,
        Operation::CheckAuthentication,
        Operation::NoOperation,
    ];

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// One device a command refers to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDefinition {
    #[serde(default)]
    pub id: u8,
    #[serde(default)]
    pub unit: u8,
    #[serde(default, rename = "type")]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub block_size: u32,
    #[serde(default)]
    pub scsi_level: u32,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub operation: Operation,
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl ControlCommand {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            devices: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

// Result payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u8,
    pub unit: u8,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub scsi_level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub ready: bool,
    pub read_only: bool,
    pub protectable: bool,
    pub protected: bool,
    pub removable: bool,
    pub removed: bool,
    pub lockable: bool,
    pub locked: bool,
    pub stoppable: bool,
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTypeInfo {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub supports_file: bool,
    pub removable: bool,
    pub block_sizes: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFileInfo {
    pub name: String,
    pub size: u64,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFilesInfo {
    pub default_folder: PathBuf,
    pub files: Vec<ImageFileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLevelInfo {
    pub current: String,
    pub levels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: VersionInfo,
    pub log_level: LogLevelInfo,
    pub default_folder: PathBuf,
    pub reserved_ids: Vec<u8>,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ControlResult {
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices_info: Option<Vec<DeviceInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_info: Option<VersionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_types_info: Option<Vec<DeviceTypeInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_files_info: Option<ImageFilesInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_file_info: Option<ImageFileInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level_info: Option<LogLevelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interfaces_info: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_info: Option<BTreeMap<String, DeviceType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics_info: Option<Vec<Statistic>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties_info: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_ids_info: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_info: Option<Vec<String>>,
}

impl ControlResult {
    pub fn success() -> Self {
        Self {
            status: true,
            ..Default::default()
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: false,
            msg: msg.into(),
            ..Default::default()
        }
    }
}
