//! Repository: the layer index, mount list and scratch space
//!
//! Index and mount mutations run under `repository.lock` plus an in-process
//! mutex, so one base directory is safe to share between threads and
//! processes.

use super::archive::{ExportStream, Exporter, Importer};
use super::digest::HashingReader;
use super::layer::Layer;
use super::mount::Mount;
use super::{check_dir, lock, mkdir_all, TMPDIR_BASE};
use crate::error::{KilnError, KilnResult};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

const LOCK_FILE: &str = "repository.lock";

#[derive(Default)]
pub(crate) struct RepoState {
    layers: HashMap<String, Layer>,
    mounts: Vec<Mount>,
}

pub(crate) struct RepoInner {
    base_dir: PathBuf,
    is_virtual: bool,
    state: Mutex<RepoState>,
}

/// A collection of layers, mounts and tags rooted at one directory
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("base_dir", &self.inner.base_dir)
            .field("virtual", &self.inner.is_virtual)
            .finish()
    }
}

impl Repository {
    /// Open (and create) a repository at `base_dir`
    ///
    /// Virtual repositories keep layers as tar files and refuse mounts.
    pub fn new(base_dir: impl Into<PathBuf>, is_virtual: bool) -> KilnResult<Self> {
        let base_dir = base_dir.into();
        mkdir_all(&base_dir)
            .map_err(|e| KilnError::io(format!("creating repository {}", base_dir.display()), e))?;

        Ok(Self {
            inner: Arc::new(RepoInner {
                base_dir,
                is_virtual,
                state: Mutex::new(RepoState::default()),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<RepoInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RepoInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn is_virtual(&self) -> bool {
        self.inner.is_virtual
    }

    fn edit<T>(&self, f: impl FnOnce(&mut RepoState) -> KilnResult<T>) -> KilnResult<T> {
        lock::edit(&self.inner.base_dir.join(LOCK_FILE), &self.inner.state, f)
    }

    /// Run `f` holding the repository lock
    pub(crate) fn locked<T>(&self, f: impl FnOnce() -> KilnResult<T>) -> KilnResult<T> {
        self.edit(|_| f())
    }

    fn tmp_base(&self) -> KilnResult<PathBuf> {
        let base = self.inner.base_dir.join(TMPDIR_BASE);
        mkdir_all(&base).map_err(|e| KilnError::io(format!("creating {}", base.display()), e))?;
        Ok(base)
    }

    /// A fresh directory under `tmp/`; the caller removes it
    pub fn temp_dir(&self) -> KilnResult<PathBuf> {
        let path = self.tmp_base()?.join(uuid::Uuid::new_v4().simple().to_string());
        mkdir_all(&path).map_err(|e| KilnError::io(format!("creating {}", path.display()), e))?;
        Ok(path)
    }

    /// A fresh file under `tmp/`; the caller removes it
    pub fn temp_file(&self) -> KilnResult<(File, PathBuf)> {
        let path = self.tmp_base()?.join(uuid::Uuid::new_v4().simple().to_string());
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| KilnError::io(format!("creating {}", path.display()), e))?;
        Ok((file, path))
    }

    /// Register a layer and prepare its directory
    pub fn create_layer(&self, id: &str, parent: Option<Layer>) -> KilnResult<Layer> {
        let layer = Layer::new(self, id, parent);
        if !layer.exists() {
            layer.create()?;
        }
        self.add_layer(&layer, true)?;
        Ok(layer)
    }

    /// The indexed layer for `id`, or a new unbound handle
    ///
    /// No filesystem checks are made; the layer may not exist yet.
    pub fn new_layer(&self, id: &str, parent: Option<Layer>) -> KilnResult<Layer> {
        if let Some(layer) = self.layer(id) {
            return Ok(layer);
        }

        let layer = Layer::new(self, id, parent);
        self.add_layer(&layer, false)?;
        Ok(layer)
    }

    /// Look up an indexed layer
    pub fn layer(&self, id: &str) -> Option<Layer> {
        lock::with(&self.inner.state, |state| state.layers.get(id).cloned())
    }

    pub fn add_layer(&self, layer: &Layer, overwrite: bool) -> KilnResult<()> {
        self.edit(|state| {
            if state.layers.contains_key(layer.id()) && !overwrite {
                return Err(KilnError::LayerExists(layer.id().to_string()));
            }
            state.layers.insert(layer.id().to_string(), layer.clone());
            Ok(())
        })
    }

    pub fn remove_layer(&self, id: &str) -> KilnResult<()> {
        self.edit(|state| {
            state.layers.remove(id);
            Ok(())
        })
    }

    /// Unpack a stream into a new layer named by its content digest
    pub fn create_layer_from_asset<R: Read>(
        &self,
        reader: R,
        parent: Option<Layer>,
        overwrite: bool,
    ) -> KilnResult<Layer> {
        let scratch = self.temp_dir()?;
        let result = self.stage_asset(reader, &scratch, parent, overwrite);
        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn stage_asset<R: Read>(
        &self,
        reader: R,
        scratch: &Path,
        parent: Option<Layer>,
        overwrite: bool,
    ) -> KilnResult<Layer> {
        let staged = scratch.join("content");
        let mut hashing = HashingReader::new(reader);

        if self.is_virtual() {
            let mut file = File::create(&staged)
                .map_err(|e| KilnError::io(format!("creating {}", staged.display()), e))?;
            io::copy(&mut hashing, &mut file)
                .map_err(|e| KilnError::io(format!("writing {}", staged.display()), e))?;
        } else {
            check_dir(&staged, KilnError::InvalidAsset)?;
            let mut archive = tar::Archive::new(&mut hashing);
            archive.set_preserve_permissions(true);
            archive
                .unpack(&staged)
                .map_err(|e| KilnError::io(format!("unpacking into {}", staged.display()), e))?;
        }

        let digest = hashing
            .finish()
            .map_err(|e| KilnError::io("draining layer stream", e))?;
        let id = digest.hex().to_string();

        if let Some(existing) = self.layer(&id) {
            if existing.exists() && !overwrite {
                return Err(KilnError::LayerExists(id));
            }
        }

        let layer = Layer::new(self, &id, parent);
        layer.create()?;
        let target = layer.path();
        if target.exists() {
            let removed = if target.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            removed.map_err(|e| KilnError::io(format!("replacing {}", target.display()), e))?;
        }
        fs::rename(&staged, &target)
            .map_err(|e| KilnError::io(format!("moving layer into {}", target.display()), e))?;

        layer.digest()?;
        self.add_layer(&layer, true)?;
        debug!("Stored layer {}", id);
        Ok(layer)
    }

    /// Create a directory that must live under the base directory
    pub(crate) fn mkdir_check_rel(&self, path: &Path) -> KilnResult<()> {
        let escapes = !path.starts_with(&self.inner.base_dir)
            || path.components().any(|c| c == Component::ParentDir);
        if escapes {
            return Err(KilnError::MountCannotProceed(format!(
                "relative path falls below basedir root: {}",
                path.display()
            )));
        }

        mkdir_all(path).map_err(|e| KilnError::io(format!("creating {}", path.display()), e))
    }

    /// Build a mount record with a fresh work directory and register it
    pub fn new_mount(&self, target: PathBuf, lower: String, upper: PathBuf) -> KilnResult<Mount> {
        let work = self
            .temp_dir()
            .map_err(|e| KilnError::MountCannotProceed(e.to_string()))?;
        let mount = Mount::new(target, lower, upper, work);
        self.add_mount(&mount)?;
        Ok(mount)
    }

    pub fn add_mount(&self, mount: &Mount) -> KilnResult<()> {
        self.edit(|state| {
            if state.mounts.iter().any(|m| m == mount) {
                return Err(KilnError::MountExists(mount.target().display().to_string()));
            }
            state.mounts.push(mount.clone());
            Ok(())
        })
    }

    pub fn remove_mount(&self, mount: &Mount) -> KilnResult<()> {
        self.edit(|state| {
            state.mounts.retain(|m| m != mount);
            Ok(())
        })
    }

    pub fn mounts(&self) -> Vec<Mount> {
        lock::with(&self.inner.state, |state| state.mounts.clone())
    }

    /// Import an archive stream; returns the top layer of each image found
    pub fn import(
        &self,
        importer: &dyn Importer,
        reader: Box<dyn Read + Send>,
    ) -> KilnResult<Vec<Layer>> {
        importer.import(self, reader)
    }

    /// Export the chain ending at `layer` as an archive stream.
    /// Must be called from within a tokio runtime.
    pub fn export(
        &self,
        exporter: &dyn Exporter,
        layer: &Layer,
        tags: &[String],
    ) -> KilnResult<ExportStream> {
        exporter.export(self, layer, tags)
    }
}
