//! Properties: persisted daemon configuration
//!
//! Key=value lines, `#` starts a comment. Holds the reserved IDs, the
//! published per-device settings (`device.<id>:<lun>.*`) and the custom
//! mode page definitions (`mode_page.<code>.<vendor>:<product>`). Parse
//! failures abort the daemon before the bus thread starts.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Context};

use crate::control::types::DeviceDefinition;
use crate::device::modepage::ModePageOverrides;

#[derive(Debug, Default, Clone)]
pub struct PropertyStore {
    properties: BTreeMap<String, String>,
}

impl PropertyStore {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Can't read properties file '{}'", path.display()))?;

        let mut store = Self::default();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                bail!(
                    "Invalid property in '{}', line {}: '{}'",
                    path.display(),
                    number + 1,
                    line
                );
            };

            store
                .properties
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(store)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    /// Removes every property whose key starts with the given prefix
    pub fn remove_prefix(&mut self, prefix: &str) {
        self.properties.retain(|key, _| !key.starts_with(prefix));
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Snapshot/restore around the executor's dry-run pass
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.properties.clone()
    }

    pub fn restore(&mut self, snapshot: BTreeMap<String, String>) {
        self.properties = snapshot;
    }

    /// Comma-separated reserved ID list
    pub fn reserved_ids(&self) -> Option<&str> {
        self.get("reserved_ids")
    }

    /// Parses the custom mode page table. Keys are
    /// `mode_page.<code>.<vendor>:<product>`, values are colon-separated
    /// hex bytes; an empty value suppresses the page. A `-` vendor or
    /// product matches any device.
    pub fn custom_mode_pages(&self) -> anyhow::Result<ModePageOverrides> {
        let mut overrides = ModePageOverrides::default();

        for (key, value) in &self.properties {
            let Some(spec) = key.strip_prefix("mode_page.") else {
                continue;
            };

            let Some((code, device)) = spec.split_once('.') else {
                bail!("Invalid mode page property '{}'", key);
            };
            let code: u8 = code
                .parse()
                .with_context(|| format!("Invalid mode page code in '{}'", key))?;
            if code > 0x3E {
                bail!("Mode page code {} in '{}' out of range", code, key);
            }

            let Some((vendor, product)) = device.split_once(':') else {
                bail!("Invalid mode page device in '{}'", key);
            };
            let vendor = (vendor != "-").then_some(vendor);
            let product = (product != "-").then_some(product);

            let mut data = Vec::new();
            if !value.is_empty() {
                for byte in value.split(':') {
                    data.push(
                        u8::from_str_radix(byte, 16)
                            .with_context(|| format!("Invalid hex byte '{}' in '{}'", byte, key))?,
                    );
                }

                // The page data must cover the page header
                if data.len() < 2 {
                    bail!("Mode page data in '{}' too short", key);
                }
            }

            overrides.add(vendor, product, code, data);
        }

        Ok(overrides)
    }

    /// Publishes the settings of an attached device
    pub fn publish_device(
        &mut self,
        id: u8,
        lun: u8,
        type_name: &str,
        name: &str,
        block_size: Option<u32>,
        params: &str,
    ) {
        let prefix = format!("device.{}:{}.", id, lun);
        self.set(&format!("{}type", prefix), type_name);
        self.set(&format!("{}name", prefix), name);
        if let Some(block_size) = block_size {
            self.set(&format!("{}block_size", prefix), &block_size.to_string());
        }
        if !params.is_empty() {
            self.set(&format!("{}params", prefix), params);
        }
    }

    /// Removes the published settings of a detached device. Both the
    /// id:lun notation and the plain id shorthand of LUN 0 are covered.
    pub fn unpublish_device(&mut self, id: u8, lun: u8) {
        self.remove_prefix(&format!("device.{}:{}.", id, lun));
        if lun == 0 {
            self.remove_prefix(&format!("device.{}.", id));
        }
    }

    /// Initial device definitions for the daemon startup. Keys are
    /// `device.<id>:<lun>.<setting>` (or `device.<id>.<setting>` for
    /// LUN 0); the `params` value is either a plain filename or a
    /// colon-separated `key=value` list.
    pub fn device_definitions(&self) -> anyhow::Result<Vec<DeviceDefinition>> {
        let mut definitions: BTreeMap<(u8, u8), DeviceDefinition> = BTreeMap::new();

        for (key, value) in &self.properties {
            let Some(spec) = key.strip_prefix("device.") else {
                continue;
            };
            let Some((address, setting)) = spec.split_once('.') else {
                bail!("Invalid device property '{}'", key);
            };

            let (id, lun) = match address.split_once(':') {
                Some((id, lun)) => (
                    id.parse().with_context(|| format!("Invalid ID in '{}'", key))?,
                    lun.parse().with_context(|| format!("Invalid LUN in '{}'", key))?,
                ),
                None => (
                    address
                        .parse()
                        .with_context(|| format!("Invalid ID in '{}'", key))?,
                    0,
                ),
            };

            let definition = definitions.entry((id, lun)).or_insert_with(|| {
                let mut d = DeviceDefinition::default();
                d.id = id;
                d.unit = lun;
                d
            });

            match setting {
                "type" => {
                    definition.device_type = crate::device::DeviceType::from_name(value);
                    if definition.device_type.is_none() {
                        bail!("Unknown device type '{}' in '{}'", value, key);
                    }
                }
                "name" | "product" => {
                    // Either a plain product name or a
                    // vendor:product:revision triple
                    let mut parts = value.splitn(3, ':');
                    match (parts.next(), parts.next(), parts.next()) {
                        (Some(vendor), Some(product), revision) => {
                            definition.vendor = vendor.to_string();
                            definition.product = product.to_string();
                            if let Some(revision) = revision {
                                definition.revision = revision.to_string();
                            }
                        }
                        _ => definition.product = value.clone(),
                    }
                }
                "block_size" => {
                    definition.block_size = value
                        .parse()
                        .with_context(|| format!("Invalid block size in '{}'", key))?;
                }
                "params" => {
                    if value.contains('=') {
                        for pair in value.split(':') {
                            let Some((k, v)) = pair.split_once('=') else {
                                bail!("Invalid device parameter '{}' in '{}'", pair, key);
                            };
                            definition.params.insert(k.to_string(), v.to_string());
                        }
                    } else {
                        definition
                            .params
                            .insert("file".to_string(), value.clone());
                    }
                }
                _ => bail!("Unknown device setting '{}' in '{}'", setting, key),
            }
        }

        Ok(definitions.into_values().collect())
    }

    /// Serializes the store back into properties file syntax
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.properties {
            let _ = writeln!(out, "{}={}", key, value);
        }
        out
    }
}

/// Joins device parameters into the published `params` value
pub fn join_params(params: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    pairs.sort();
    pairs.join(":")
}
