//! Mass-storage shared state: image file binding, the process-wide image
//! reservation registry, and the removable-medium command set

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Context};
use fs2::FileExt;

use crate::device::target::ScsiTarget;
use crate::scsi::{Asc, CmdOutput, CmdResult, ScsiError, SenseKey, Status};

/// Image files larger than 2 TiB are not supported
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024 * 1024;

/// Process-wide mapping from image pathname to the `(id, lun)` of the
/// device using it. Prevents two devices from binding the same file.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    inner: Arc<Mutex<HashMap<PathBuf, (u8, u8)>>>,
}

impl FileRegistry {
    pub fn reserve(&self, path: &Path, id: u8, lun: u8) -> bool {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(path) {
            return false;
        }
        map.insert(path.to_path_buf(), (id, lun));
        true
    }

    pub fn unreserve(&self, path: &Path) {
        self.inner.lock().unwrap().remove(path);
    }

    pub fn ids_for(&self, path: &Path) -> Option<(u8, u8)> {
        self.inner.lock().unwrap().get(path).copied()
    }

    /// Snapshot/restore around the executor's dry-run pass
    pub fn snapshot(&self) -> HashMap<PathBuf, (u8, u8)> {
        self.inner.lock().unwrap().clone()
    }

    pub fn restore(&self, snapshot: HashMap<PathBuf, (u8, u8)>) {
        *self.inner.lock().unwrap() = snapshot;
    }
}

/// Backing-file state embedded by every mass-storage target
#[derive(Debug)]
pub struct StorageState {
    pub registry: FileRegistry,

    filename: Option<PathBuf>,
    last_filename: Option<PathBuf>,

    /// Keeps the exclusive file lock while the medium is bound
    lock: Option<File>,

    pub block_size: u32,
    pub configured_block_size: Option<u32>,
    pub supported_block_sizes: &'static [u32],
    pub blocks: u64,

    pub read_count: u64,
    pub write_count: u64,
}

impl StorageState {
    pub fn new(
        supported_block_sizes: &'static [u32],
        block_size: u32,
        registry: FileRegistry,
    ) -> Self {
        Self {
            registry,
            filename: None,
            last_filename: None,
            lock: None,
            block_size,
            configured_block_size: None,
            supported_block_sizes,
            blocks: 0,
            read_count: 0,
            write_count: 0,
        }
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn last_filename(&self) -> Option<&Path> {
        self.last_filename.as_deref()
    }

    pub fn set_last_filename(&mut self, path: Option<PathBuf>) {
        self.last_filename = path;
    }

    /// Opens and locks the image file and applies the writability policy to
    /// the device flags. Returns the file size.
    pub fn bind_file(
        &mut self,
        path: &Path,
        dev: &mut crate::device::Device,
    ) -> anyhow::Result<u64> {
        let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => (f, true),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                let f = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                (f, false)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()));
            }
        };

        file.try_lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;

        let size = file.metadata()?.len();
        ensure!(size > 0, "image file {} is empty", path.display());
        ensure!(
            size <= MAX_FILE_SIZE,
            "image files > 2 TiB are not supported"
        );

        if !writable {
            // Permanently write-protected
            dev.read_only = true;
            dev.protectable = false;
            dev.write_protected = false;
        }

        dev.ready = true;
        dev.stopped = false;
        dev.removed = false;
        dev.locked = false;

        self.filename = Some(path.to_path_buf());
        self.lock = Some(file);

        Ok(size)
    }

    /// Inserts `filename -> (id, lun)` into the reservation registry
    pub fn reserve(&self, id: u8, lun: u8) -> bool {
        let Some(filename) = &self.filename else {
            return false;
        };
        self.registry.reserve(filename, id, lun)
    }

    /// Removes the registry entry, releases the file lock and forgets the
    /// filename
    pub fn unreserve(&mut self) {
        if let Some(filename) = self.filename.take() {
            self.registry.unreserve(&filename);
        }
        self.lock = None;
    }

    /// Applies the configured block size, if any
    pub fn effective_block_size(&self) -> u32 {
        self.configured_block_size.unwrap_or(self.block_size)
    }

    /// Validates a permanent block size configuration request: non-zero,
    /// divisible by 4, and in the supported set unless the device type
    /// allows arbitrary sizes.
    pub fn set_configured_block_size(&mut self, size: u32, any_size: bool) -> bool {
        if size == 0 || size % 4 != 0 {
            return false;
        }
        if !any_size && !self.supported_block_sizes.contains(&size) {
            return false;
        }

        self.configured_block_size = Some(size);
        true
    }
}

/// Removable-medium command behaviors shared by disk-like targets
pub trait StorageTarget: ScsiTarget {
    fn storage(&self) -> &StorageState;
    fn storage_mut(&mut self) -> &mut StorageState;

    /// Writes back any dirty cached data
    fn flush_medium(&mut self);

    /// Releases the cache when the medium goes away
    fn drop_medium(&mut self);

    /// Rebinds a previously ejected medium (START with the load bit)
    fn rebind_medium(&mut self, path: &Path) -> anyhow::Result<()>;

    /// START STOP UNIT. The start/load bits select start/stop, eject, and
    /// the reload of a remembered medium.
    fn start_stop_unit(&mut self, cdb: &[u8; 16]) -> CmdResult
    where
        Self: Sized,
    {
        let start = cdb[4] & 0x01 != 0;
        let load = cdb[4] & 0x02 != 0;

        if load {
            log::trace!("{}", if start { "Loading medium" } else { "Ejecting medium" });
        } else {
            log::trace!("{}", if start { "Starting unit" } else { "Stopping unit" });
            self.device_mut().stopped = !start;
        }

        if !start {
            if load {
                if self.device().locked {
                    // Cannot be ejected because it is locked
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::LoadOrEjectFailed,
                    ));
                }

                if !self.eject(false) {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::LoadOrEjectFailed,
                    ));
                }
            } else {
                self.flush_medium();
            }
        } else if !load {
            // Rebind a remembered medium, announcing the change
            if let Some(last) = self.storage().last_filename().map(Path::to_path_buf) {
                if self.rebind_medium(&last).is_err() {
                    self.storage_mut().set_last_filename(None);
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::LoadOrEjectFailed,
                    ));
                }

                let (id, lun) = (self.device().id(), self.device().lun());
                if !self.storage().reserve(id, lun) {
                    self.storage_mut().set_last_filename(None);
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::LoadOrEjectFailed,
                    ));
                }

                self.storage_mut().set_last_filename(None);
                self.device_mut().medium_changed = true;
            }
        }

        Ok(CmdOutput::Status(Status::Good))
    }

    /// PREVENT ALLOW MEDIUM REMOVAL toggles the locked flag
    fn prevent_allow_removal(&mut self, cdb: &[u8; 16]) -> CmdResult
    where
        Self: Sized,
    {
        self.device_mut().check_ready()?;

        let lock = cdb[4] & 0x01 != 0;
        log::trace!("{}", if lock { "Locking medium" } else { "Unlocking medium" });
        self.device_mut().locked = lock;

        Ok(CmdOutput::Status(Status::Good))
    }

    /// Shared eject path: flags, cache flush and release, registry cleanup.
    /// Arms the medium-change latch.
    fn eject_medium(&mut self, force: bool) -> bool
    where
        Self: Sized,
    {
        if !self.device_mut().eject_flags(force) {
            return false;
        }

        self.flush_medium();
        self.drop_medium();

        let filename = self.storage().filename().map(Path::to_path_buf);
        self.storage_mut().set_last_filename(filename);
        self.storage_mut().unreserve();

        self.storage_mut().read_count = 0;
        self.storage_mut().write_count = 0;

        self.device_mut().medium_changed = true;

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_double_use() {
        let registry = FileRegistry::default();
        let path = Path::new("/tmp/image.hds");

        assert!(registry.reserve(path, 1, 0));
        assert!(!registry.reserve(path, 2, 0));
        assert_eq!(registry.ids_for(path), Some((1, 0)));

        registry.unreserve(path);
        assert_eq!(registry.ids_for(path), None);
        assert!(registry.reserve(path, 2, 0));
    }

    #[test]
    fn registry_snapshot_restore() {
        let registry = FileRegistry::default();
        registry.reserve(Path::new("/a"), 0, 0);

        let snapshot = registry.snapshot();
        registry.reserve(Path::new("/b"), 1, 0);
        registry.restore(snapshot);

        assert!(registry.ids_for(Path::new("/a")).is_some());
        assert!(registry.ids_for(Path::new("/b")).is_none());
    }

    #[test]
    fn configured_block_size_validation() {
        let mut state = StorageState::new(&[512, 1024, 2048, 4096], 512, FileRegistry::default());

        assert!(!state.set_configured_block_size(0, false));
        assert!(!state.set_configured_block_size(510, false));
        assert!(!state.set_configured_block_size(1000, false));
        assert!(state.set_configured_block_size(1000, true));
        assert!(state.set_configured_block_size(2048, false));
        assert_eq!(state.effective_block_size(), 2048);
    }
}
