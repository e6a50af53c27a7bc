//! Image file management in the default image folder
//!
//! Backs the CREATE/DELETE/RENAME/COPY/PROTECT/UNPROTECT_IMAGE operations
//! and the folder listings of the control channel. Filenames are always
//! relative to the default folder; path traversal is rejected.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context};

use crate::control::types::ImageFileInfo;

pub struct ImageSupport {
    default_folder: PathBuf,
}

impl ImageSupport {
    pub fn new(default_folder: PathBuf) -> Self {
        Self { default_folder }
    }

    pub fn default_folder(&self) -> &Path {
        &self.default_folder
    }

    pub fn set_default_folder(&mut self, folder: &Path) -> anyhow::Result<()> {
        ensure!(
            folder.is_dir(),
            "'{}' is not a folder",
            folder.display()
        );
        self.default_folder = folder.to_path_buf();
        Ok(())
    }

    /// Resolves a filename for an ATTACH/INSERT: an existing path is taken
    /// as-is, anything else is looked up in the default folder
    pub fn resolve_existing(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.exists() {
            return path.to_path_buf();
        }
        self.default_folder.join(filename)
    }

    /// Validates a filename for the image management operations
    fn resolve(&self, filename: &str) -> anyhow::Result<PathBuf> {
        ensure!(!filename.is_empty(), "missing filename");
        ensure!(
            !filename.contains("..") && !filename.starts_with('/'),
            "invalid filename '{}'",
            filename
        );
        Ok(self.default_folder.join(filename))
    }

    pub fn create_image(&self, filename: &str, size: u64) -> anyhow::Result<PathBuf> {
        ensure!(
            size >= 512 && size % 512 == 0,
            "invalid image file size {} (not a multiple of 512)",
            size
        );

        let path = self.resolve(filename)?;
        if path.exists() {
            bail!("image file '{}' already exists", filename);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(&path)
            .with_context(|| format!("Can't create image file '{}'", path.display()))?;
        file.set_len(size)?;

        log::info!("Created image file '{}' with {} byte(s)", path.display(), size);
        Ok(path)
    }

    pub fn delete_image(&self, filename: &str) -> anyhow::Result<()> {
        let path = self.resolve(filename)?;
        fs::remove_file(&path)
            .with_context(|| format!("Can't delete image file '{}'", path.display()))?;

        log::info!("Deleted image file '{}'", path.display());
        Ok(())
    }

    pub fn rename_image(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        ensure!(!to.exists(), "image file '{}' already exists", to.display());

        fs::rename(&from, &to)
            .with_context(|| format!("Can't rename image file '{}'", from.display()))?;

        log::info!("Renamed image file '{}' to '{}'", from.display(), to.display());
        Ok(())
    }

    pub fn copy_image(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        ensure!(!to.exists(), "image file '{}' already exists", to.display());

        fs::copy(&from, &to)
            .with_context(|| format!("Can't copy image file '{}'", from.display()))?;

        log::info!("Copied image file '{}' to '{}'", from.display(), to.display());
        Ok(())
    }

    pub fn protect_image(&self, filename: &str, protect: bool) -> anyhow::Result<()> {
        let path = self.resolve(filename)?;
        let mut permissions = fs::metadata(&path)
            .with_context(|| format!("Can't access image file '{}'", path.display()))?
            .permissions();
        permissions.set_readonly(protect);
        fs::set_permissions(&path, permissions)?;

        log::info!(
            "{} image file '{}'",
            if protect { "Protected" } else { "Unprotected" },
            path.display()
        );
        Ok(())
    }

    pub fn file_info(&self, filename: &str) -> anyhow::Result<ImageFileInfo> {
        let path = self.resolve(filename)?;
        let metadata = fs::metadata(&path)
            .with_context(|| format!("Can't access image file '{}'", path.display()))?;

        Ok(ImageFileInfo {
            name: filename.to_string(),
            size: metadata.len(),
            read_only: metadata.permissions().readonly(),
        })
    }

    /// All regular files in the default folder
    pub fn list_images(&self) -> Vec<ImageFileInfo> {
        let Ok(entries) = fs::read_dir(&self.default_folder) else {
            return Vec::new();
        };

        let mut files: Vec<ImageFileInfo> = entries
            .flatten()
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                if !metadata.is_file() {
                    return None;
                }
                Some(ImageFileInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    read_only: metadata.permissions().readonly(),
                })
            })
            .collect();

        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_folder(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("drift-images-{}-{}", std::process::id(), name));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn create_list_delete() {
        let folder = scratch_folder("cld");
        let images = ImageSupport::new(folder.clone());

        images.create_image("test.hds", 4096).unwrap();
        let files = images.list_images();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "test.hds");
        assert_eq!(files[0].size, 4096);

        // Duplicate creation fails
        assert!(images.create_image("test.hds", 4096).is_err());

        images.delete_image("test.hds").unwrap();
        assert!(images.list_images().is_empty());

        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn size_must_be_sector_aligned() {
        let folder = scratch_folder("align");
        let images = ImageSupport::new(folder.clone());

        assert!(images.create_image("odd.hds", 1000).is_err());
        assert!(images.create_image("zero.hds", 0).is_err());

        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn traversal_rejected() {
        let folder = scratch_folder("trav");
        let images = ImageSupport::new(folder.clone());

        assert!(images.create_image("../evil.hds", 512).is_err());
        assert!(images.delete_image("/etc/passwd").is_err());

        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn rename_and_copy() {
        let folder = scratch_folder("rc");
        let images = ImageSupport::new(folder.clone());

        images.create_image("a.hds", 512).unwrap();
        images.rename_image("a.hds", "b.hds").unwrap();
        assert!(images.file_info("a.hds").is_err());
        assert!(images.file_info("b.hds").is_ok());

        images.copy_image("b.hds", "c.hds").unwrap();
        assert!(images.file_info("b.hds").is_ok());
        assert!(images.file_info("c.hds").is_ok());

        // Copy onto an existing file fails
        assert!(images.copy_image("b.hds", "c.hds").is_err());

        fs::remove_dir_all(&folder).unwrap();
    }
}
