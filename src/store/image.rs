//! Mountable images
//!
//! An image is a top layer plus its parents. Mounting stacks the parents
//! read-only beneath the top layer's content directory.

use super::layer::Layer;
use super::mount::{force_unmount, Mount};
use super::repository::Repository;
use crate::error::{KilnError, KilnResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct Image {
    repository: Repository,
    layer: Layer,
    mount: Option<Mount>,
}

impl Image {
    pub fn new(repository: &Repository, top: Layer) -> Self {
        Self {
            repository: repository.clone(),
            layer: top,
            mount: None,
        }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn mount_handle(&self) -> Option<&Mount> {
        self.mount.as_ref()
    }

    /// Lower dir string for the overlay, nearest parent first
    fn lower_dirs(&self) -> KilnResult<String> {
        let mut lower = Vec::new();
        for layer in self.layer.ancestors().skip(1) {
            let path = layer.path();
            self.repository.mkdir_check_rel(&path)?;
            lower.push(path.display().to_string());
        }
        Ok(lower.join(":"))
    }

    /// Mount the image at the top layer's mount path
    pub fn mount(&mut self) -> KilnResult<()> {
        if self.repository.is_virtual() {
            return Err(KilnError::MountCannotProceed(
                "cannot mount in virtual repository".to_string(),
            ));
        }

        let upper = self.layer.path();
        let target = self.layer.mount_path();

        if target.is_dir() {
            return Err(KilnError::MountCannotProceed(format!(
                "mount exists: {}",
                target.display()
            )));
        }

        if self.layer.parent().is_none() {
            return Err(KilnError::MountCannotProceed(
                "must have at least two layers".to_string(),
            ));
        }

        let lower = self.lower_dirs()?;

        for path in [&target, &upper] {
            self.repository
                .mkdir_check_rel(path)
                .map_err(|e| KilnError::MountCannotProceed(e.to_string()))?;
        }

        match self.open_mount(&target, lower, upper) {
            Ok(mount) => {
                info!("Mounted image {} at {}", self.layer.id(), mount.target().display());
                self.mount = Some(mount);
                Ok(())
            }
            Err(e) => {
                // a target left behind would make every later mount fail closed
                if let Err(cleanup) = fs::remove_dir(&target) {
                    debug!("Could not remove mount point {}: {}", target.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    fn open_mount(&self, target: &Path, lower: String, upper: PathBuf) -> KilnResult<Mount> {
        let mut mount = self.repository.new_mount(target.to_path_buf(), lower, upper)?;
        if let Err(e) = mount.open() {
            mount.discard();
            self.repository.remove_mount(&mount)?;
            return Err(e);
        }
        Ok(mount)
    }

    /// Unmount; without a live handle, unmount by path and remove the target
    pub fn unmount(&mut self) -> KilnResult<()> {
        match self.mount.take() {
            Some(mut mount) => {
                if let Err(e) = mount.close() {
                    self.mount = Some(mount);
                    return Err(e);
                }
                self.repository.remove_mount(&mount)
            }
            None => force_unmount(&self.layer.mount_path())
                .map_err(|e| KilnError::MountCannotProceed(e.to_string())),
        }
    }

    /// Persist every parent link along the chain
    pub fn commit(&self) -> KilnResult<()> {
        for layer in self.layer.ancestors() {
            layer.save_parent()?;
        }
        Ok(())
    }
}
