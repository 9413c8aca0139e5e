//! Layers
//!
//! A layer is a node in a child-to-parent chain. Handles are cheap to clone
//! and share the asset state, so every handle for the same id observes the
//! same last digest. A handle's parent is fixed when the handle is built;
//! relinking produces a new handle rather than mutating an existing chain.

use super::asset::Asset;
use super::digest::Digest;
use super::image_config::ImageConfig;
use super::repository::{RepoInner, Repository};
use super::{check_dir, lock, LAYER_BASE, MOUNT_BASE};
use crate::error::{KilnError, KilnResult};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

const ROOTFS_PATH: &str = "rootfs";
const VIRTUAL_LAYER_PATH: &str = "layer.tar";
const PARENT_PATH: &str = "parent";
const CONFIG_PATH: &str = "config.json";
const LOCKFILE_PATH: &str = "lockfile";

/// Handle to a layer in a repository
#[derive(Clone)]
pub struct Layer {
    id: String,
    parent: Option<Arc<Layer>>,
    base_dir: PathBuf,
    is_virtual: bool,
    repository: Weak<RepoInner>,
    asset: Arc<Mutex<Asset>>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id.as_str()))
            .finish()
    }
}

impl Layer {
    pub(crate) fn new(repo: &Repository, id: &str, parent: Option<Layer>) -> Self {
        let base_dir = repo.base_dir().to_path_buf();
        let path = layer_path(&base_dir, id, repo.is_virtual());
        Self {
            id: id.to_string(),
            parent: parent.map(Arc::new),
            base_dir,
            is_virtual: repo.is_virtual(),
            repository: repo.downgrade(),
            asset: Arc::new(Mutex::new(Asset::new(path, repo.is_virtual()))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&Layer> {
        self.parent.as_deref()
    }

    /// This layer followed by each ancestor up to the root
    pub fn ancestors(&self) -> impl Iterator<Item = &Layer> {
        std::iter::successors(Some(self), |layer| layer.parent())
    }

    /// A handle for the same layer linked to a different parent
    ///
    /// Refuses links that would make the chain cyclic.
    pub fn with_parent(&self, parent: Option<Layer>) -> KilnResult<Layer> {
        if let Some(ref p) = parent {
            if p.ancestors().any(|ancestor| ancestor.id == self.id) {
                return Err(KilnError::InvalidLayer(format!(
                    "linking {} under {} would create a cycle",
                    self.id, p.id
                )));
            }
        }

        Ok(Layer {
            parent: parent.map(Arc::new),
            ..self.clone()
        })
    }

    fn repository(&self) -> KilnResult<Repository> {
        self.repository
            .upgrade()
            .map(Repository::from_inner)
            .ok_or_else(|| KilnError::InvalidLayer(format!("repository for {} is gone", self.id)))
    }

    pub(crate) fn layer_base(&self) -> PathBuf {
        self.base_dir.join(LAYER_BASE).join(&self.id)
    }

    /// Content path: a rootfs directory, or `layer.tar` in virtual repositories
    pub fn path(&self) -> PathBuf {
        layer_path(&self.base_dir, &self.id, self.is_virtual)
    }

    /// Where this layer's image is mounted
    pub fn mount_path(&self) -> PathBuf {
        self.base_dir.join(MOUNT_BASE).join(&self.id)
    }

    fn parent_path(&self) -> PathBuf {
        self.layer_base().join(PARENT_PATH)
    }

    fn config_path(&self) -> PathBuf {
        self.layer_base().join(CONFIG_PATH)
    }

    pub fn exists(&self) -> bool {
        self.layer_base().is_dir()
    }

    /// Prepare the layer directory
    pub fn create(&self) -> KilnResult<()> {
        check_dir(&self.layer_base(), KilnError::InvalidLayer)
    }

    fn edit<T>(&self, f: impl FnOnce(&mut Asset) -> KilnResult<T>) -> KilnResult<T> {
        lock::edit(&self.layer_base().join(LOCKFILE_PATH), &self.asset, f)
    }

    /// Digest of the last pack or unpack
    pub fn last_digest(&self) -> Digest {
        lock::with(&self.asset, |asset| asset.digest().clone())
    }

    /// Recompute the content digest from disk
    pub fn digest(&self) -> KilnResult<Digest> {
        lock::with(&self.asset, |asset| asset.load_digest())
    }

    /// Stored image configuration, if one was saved
    pub fn config(&self) -> KilnResult<Option<ImageConfig>> {
        match fs::read(self.config_path()) {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KilnError::io(
                format!("reading config for layer {}", self.id),
                e,
            )),
        }
    }

    pub fn save_config(&self, config: &ImageConfig) -> KilnResult<()> {
        let content = serde_json::to_vec(config)?;
        self.edit(|_| {
            fs::write(self.config_path(), &content).map_err(|e| {
                KilnError::io(format!("writing config for layer {}", self.id), e)
            })
        })
    }

    /// Persist the parent link if none is recorded yet
    pub fn save_parent(&self) -> KilnResult<()> {
        let Some(parent) = self.parent() else {
            return Ok(());
        };

        self.edit(|_| match fs::symlink_metadata(self.parent_path()) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::write(self.parent_path(), parent.id()).map_err(|e| {
                    KilnError::io(format!("writing parent for layer {}", self.id), e)
                })
            }
            Err(e) => Err(KilnError::io(
                format!("inspecting parent for layer {}", self.id),
                e,
            )),
            Ok(meta) if !meta.is_file() => Err(KilnError::InvalidLayer(format!(
                "parent configuration is invalid for {}",
                self.id
            ))),
            Ok(_) => Ok(()),
        })
    }

    /// The recorded parent, without its own ancestry
    pub fn load_parent(&self) -> KilnResult<Option<Layer>> {
        let id = match fs::read_to_string(self.parent_path()) {
            Ok(id) => id,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading parent for layer {}", self.id),
                    e,
                ))
            }
        };

        if id.is_empty() {
            return Ok(None);
        }

        let parent = self.repository()?.new_layer(&id, None)?;
        if !parent.exists() {
            return Err(KilnError::InvalidLayer(
                parent.layer_base().display().to_string(),
            ));
        }

        Ok(Some(parent))
    }

    /// Rebuild the whole parent chain from the recorded links
    pub fn restore_parent(&self) -> KilnResult<Layer> {
        let mut chain = vec![self.clone()];
        while let Some(parent) = chain[chain.len() - 1].load_parent()? {
            if chain.iter().any(|layer| layer.id == parent.id) {
                return Err(KilnError::InvalidLayer(format!(
                    "parent links of {} form a cycle",
                    self.id
                )));
            }
            chain.push(parent);
        }

        let mut restored: Option<Layer> = None;
        for layer in chain.into_iter().rev() {
            restored = Some(layer.with_parent(restored)?);
        }

        let restored = restored.ok_or_else(|| KilnError::Internal("empty chain".into()))?;
        self.repository()?.add_layer(&restored, true)?;
        Ok(restored)
    }

    /// Unpack a tar stream into the layer; returns the computed digest
    pub fn unpack<R: Read>(&self, reader: R) -> KilnResult<Digest> {
        self.edit(|asset| asset.unpack(reader))
    }

    /// Pack the layer into `writer`; returns the computed digest
    pub fn pack<W: Write>(&self, writer: W) -> KilnResult<Digest> {
        self.edit(|asset| asset.pack(writer))
    }

    /// Remove the layer from disk and from the repository index
    pub fn remove(&self) -> KilnResult<()> {
        let repo = self.repository()?;
        self.edit(|_| {
            repo.remove_layer(&self.id)?;
            Ok(())
        })?;
        fs::remove_dir_all(self.layer_base())
            .map_err(|e| KilnError::io(format!("removing layer {}", self.id), e))
    }
}

fn layer_path(base_dir: &Path, id: &str, is_virtual: bool) -> PathBuf {
    let base = base_dir.join(LAYER_BASE).join(id);
    if is_virtual {
        base.join(VIRTUAL_LAYER_PATH)
    } else {
        base.join(ROOTFS_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo(temp: &TempDir, is_virtual: bool) -> Repository {
        Repository::new(temp.path().join("repo"), is_virtual).unwrap()
    }

    #[test]
    fn create_layer_prepares_directory() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, false);
        let layer = repo.create_layer("one", None).unwrap();
        assert!(layer.exists());
        assert!(layer.path().ends_with("layers/one/rootfs"));
    }

    #[test]
    fn virtual_layer_path_is_tar() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, true);
        let layer = repo.create_layer("one", None).unwrap();
        assert!(layer.path().ends_with("layers/one/layer.tar"));
    }

    #[test]
    fn parent_round_trip() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, false);
        let root = repo.create_layer("root", None).unwrap();
        let mid = repo.create_layer("mid", Some(root)).unwrap();
        let top = repo.create_layer("top", Some(mid.clone())).unwrap();
        top.save_parent().unwrap();
        mid.save_parent().unwrap();

        let bare = top.with_parent(None).unwrap();
        let restored = bare.restore_parent().unwrap();
        let ids: Vec<_> = restored.ancestors().map(|l| l.id().to_string()).collect();
        assert_eq!(ids, vec!["top", "mid", "root"]);
    }

    #[test]
    fn save_parent_does_not_overwrite() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, false);
        let a = repo.create_layer("a", None).unwrap();
        let b = repo.create_layer("b", None).unwrap();
        let top = repo.create_layer("top", Some(a)).unwrap();
        top.save_parent().unwrap();
        top.with_parent(Some(b)).unwrap().save_parent().unwrap();

        assert_eq!(top.load_parent().unwrap().unwrap().id(), "a");
    }

    #[test]
    fn with_parent_rejects_cycles() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, false);
        let root = repo.create_layer("root", None).unwrap();
        let top = repo.create_layer("top", Some(root.clone())).unwrap();
        assert!(root.with_parent(Some(top)).is_err());
    }

    #[test]
    fn config_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, false);
        let layer = repo.create_layer("one", None).unwrap();
        assert!(layer.config().unwrap().is_none());

        let config = ImageConfig {
            user: "root".into(),
            ..Default::default()
        };
        layer.save_config(&config).unwrap();
        assert_eq!(layer.config().unwrap().unwrap().user, "root");
    }

    #[test]
    fn remove_deletes_layer() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, false);
        let layer = repo.create_layer("gone", None).unwrap();
        layer.remove().unwrap();
        assert!(!layer.exists());
        assert!(repo.layer("gone").is_none());
    }

    #[test]
    fn unpack_records_digest() {
        let temp = TempDir::new().unwrap();
        let repo = repo(&temp, true);
        let layer = repo.create_layer("v", None).unwrap();
        let digest = layer.unpack(&b"bytes"[..]).unwrap();
        assert_eq!(digest, Digest::from_bytes(b"bytes"));
        assert_eq!(layer.last_digest(), digest);
        assert_eq!(layer.digest().unwrap(), digest);
    }
}
