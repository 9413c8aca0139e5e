//! Content-addressable layer store
//!
//! A repository holds layers, mounts and tags under one base directory:
//!
//! ```text
//! basedir/
//!   layers/<id>/{rootfs | layer.tar, parent, config.json, lockfile}
//!   mount/<id>/
//!   tmp/
//!   tags/<name>
//!   repository.lock
//! ```
//!
//! Layers form a child-to-parent chain. Virtual repositories store each
//! layer as a tar file and cannot be mounted.

pub mod archive;
pub mod asset;
pub mod digest;
pub mod edit;
pub mod image;
pub mod image_config;
pub mod layer;
pub(crate) mod lock;
pub mod mount;
pub mod repository;
pub mod tags;

pub use asset::Asset;
pub use digest::Digest;
pub use edit::edit_chain;
pub use image::Image;
pub use image_config::ImageConfig;
pub use layer::Layer;
pub use mount::Mount;
pub use repository::Repository;

use crate::error::{KilnError, KilnResult};
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

pub(crate) const LAYER_BASE: &str = "layers";
pub(crate) const MOUNT_BASE: &str = "mount";
pub(crate) const TMPDIR_BASE: &str = "tmp";
pub(crate) const TAGS_BASE: &str = "tags";

/// Create a private directory and any missing parents
pub(crate) fn mkdir_all(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

/// Ensure `path` is a real directory, creating it when missing
///
/// Symlinks are refused outright so crafted archives cannot redirect
/// writes elsewhere.
pub(crate) fn check_dir(path: &Path, wrap: fn(String) -> KilnError) -> KilnResult<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => mkdir_all(path)
            .map_err(|e| wrap(format!("unable to mkdir {}: {}", path.display(), e))),
        Err(e) => Err(KilnError::io(format!("inspecting {}", path.display()), e)),
        Ok(meta) if meta.file_type().is_symlink() => Err(wrap(format!(
            "cannot operate on a symlink: {}",
            path.display()
        ))),
        Ok(meta) if !meta.is_dir() => {
            Err(wrap(format!("not a directory: {}", path.display())))
        }
        Ok(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn check_dir_creates_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b");
        check_dir(&path, KilnError::InvalidLayer).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn check_dir_rejects_file_and_symlink() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            check_dir(&file, KilnError::InvalidLayer),
            Err(KilnError::InvalidLayer(_))
        ));

        let link = temp.path().join("link");
        std::os::unix::fs::symlink(temp.path(), &link).unwrap();
        assert!(matches!(
            check_dir(&link, KilnError::InvalidAsset),
            Err(KilnError::InvalidAsset(_))
        ));
    }
}
