//! In-process container engine
//!
//! Images are file maps with one tar per layer. Commands are not executed:
//! a run records a marker file derived from the parent image and the
//! command line, so identical steps produce identical layers. Image ids are
//! content-derived, which keeps repeated builds reproducible.
//!
//! Saving and loading go through the layer store's docker archive format.

use super::{ContainerEngine, ContainerSpec, ImageInfo};
use crate::error::{KilnError, KilnResult};
use crate::store::archive::{write_to_file, DockerArchive};
use crate::store::lock::with;
use crate::store::{Digest, ImageConfig, Repository};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

type Files = BTreeMap<String, Vec<u8>>;

const RUNS_DIR: &str = "/kiln/runs";

#[derive(Debug, Clone)]
struct StoredImage {
    info: ImageInfo,
    files: Files,
    /// Layer tars, root first, matching `info.layers`
    tars: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Container {
    spec: ContainerSpec,
    files: Files,
}

#[derive(Debug, Default)]
struct State {
    images: Vec<StoredImage>,
    containers: HashMap<String, Container>,
    names: HashMap<String, String>,
    /// Base images that `pull` can fetch, by name
    registry: HashMap<String, Files>,
}

impl State {
    fn image(&self, id_or_name: &str) -> KilnResult<&StoredImage> {
        let id = self
            .names
            .get(id_or_name)
            .map(String::as_str)
            .unwrap_or(id_or_name);
        self.images
            .iter()
            .find(|img| img.info.id == id)
            .ok_or_else(|| KilnError::ImageNotFound(id_or_name.to_string()))
    }

    fn container_mut(&mut self, id: &str) -> KilnResult<&mut Container> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| KilnError::ContainerNotFound(id.to_string()))
    }

    /// Store an image unless one with the same id exists
    fn insert(&mut self, image: StoredImage) -> String {
        let id = image.info.id.clone();
        if !self.images.iter().any(|img| img.info.id == id) {
            self.images.push(image);
        }
        id
    }
}

/// Container engine that keeps everything in memory
pub struct MemoryEngine {
    state: Mutex<State>,
    fail_on: Vec<String>,
    pull_delay: Option<Duration>,
    container_delay: Option<Duration>,
    runs: AtomicUsize,
    pulls: AtomicUsize,
}

fn default_base() -> Files {
    let mut files = Files::new();
    files.insert(
        "/etc/passwd".to_string(),
        b"root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534:nobody:/nonexistent:/bin/false\n"
            .to_vec(),
    );
    files.insert(
        "/etc/group".to_string(),
        b"root:x:0:\nnogroup:x:65534:\n".to_vec(),
    );
    files
}

/// Deterministic tar of a file map
fn files_tar(files: &Files) -> KilnResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, path.trim_start_matches('/'), &body[..])
            .map_err(|e| KilnError::io(format!("archiving {}", path), e))?;
    }
    builder
        .into_inner()
        .map_err(|e| KilnError::io("finishing archive", e))
}

/// Regular files of a tar, keyed by absolute path
fn read_tar<R: Read>(reader: R) -> KilnResult<Files> {
    let mut files = Files::new();
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| KilnError::io("reading archive", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| KilnError::io("reading archive entry", e))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| KilnError::io("reading archive entry name", e))?
            .to_string_lossy()
            .trim_start_matches("./")
            .trim_start_matches('/')
            .to_string();
        let mut body = Vec::new();
        entry
            .read_to_end(&mut body)
            .map_err(|e| KilnError::io(format!("reading {}", name), e))?;
        files.insert(format!("/{}", name), body);
    }
    Ok(files)
}

fn derive_id(parts: &[&str]) -> String {
    Digest::from_bytes(parts.join(":").as_bytes())
        .hex()
        .to_string()
}

fn config_fingerprint(config: &ImageConfig) -> KilnResult<String> {
    Ok(serde_json::to_string(config)?)
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_on: Vec::new(),
            pull_delay: None,
            container_delay: None,
            runs: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
        }
    }

    /// Make a base image with the given files available to `pull`
    pub fn with_image(self, name: &str, files: &[(&str, &str)]) -> Self {
        let mut content = default_base();
        for (path, body) in files {
            content.insert(path.to_string(), body.as_bytes().to_vec());
        }
        with(&self.state, |state| {
            state.registry.insert(name.to_string(), content);
        });
        self
    }

    /// Fail any command or pull whose text contains `pattern`
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.fail_on.push(pattern.to_string());
        self
    }

    /// Slow pulls down so concurrent requests overlap
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = Some(delay);
        self
    }

    /// Hold every start and copy into a container for `delay`
    pub fn with_container_delay(mut self, delay: Duration) -> Self {
        self.container_delay = Some(delay);
        self
    }

    async fn container_pause(&self) {
        if let Some(delay) = self.container_delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Number of containers started so far
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of registry fetches so far
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Containers that have been created and not removed
    pub fn live_containers(&self) -> usize {
        with(&self.state, |state| state.containers.len())
    }

    /// Files of an image, for inspection in tests
    pub fn image_files(&self, id: &str) -> KilnResult<BTreeMap<String, Vec<u8>>> {
        with(&self.state, |state| Ok(state.image(id)?.files.clone()))
    }

    fn exit_code(&self, command: &str) -> i32 {
        if self.fail_on.iter().any(|p| command.contains(p.as_str())) {
            return 1;
        }
        let last = command.split(';').next_back().unwrap_or_default().trim();
        if last == "false" {
            return 1;
        }
        last.strip_prefix("exit ")
            .and_then(|code| code.trim().parse().ok())
            .unwrap_or(0)
    }

    fn store_image(
        &self,
        parent: &str,
        comment: &str,
        config: &ImageConfig,
        files: Files,
        tars: Vec<Vec<u8>>,
    ) -> KilnResult<String> {
        let layers: Vec<Digest> = tars.iter().map(|t| Digest::from_bytes(t)).collect();
        let layer_list = layers
            .iter()
            .map(|d| d.hex().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let id = derive_id(&[parent, comment, &config_fingerprint(config)?, &layer_list]);

        let mut config = config.clone();
        config.comment = comment.to_string();

        let image = StoredImage {
            info: ImageInfo {
                id: id.clone(),
                parent: parent.to_string(),
                comment: comment.to_string(),
                config,
                layers,
                created: None,
            },
            files,
            tars,
        };
        Ok(with(&self.state, |state| state.insert(image)))
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn is_available(&self) -> KilnResult<bool> {
        Ok(true)
    }

    async fn inspect_image(&self, id: &str) -> KilnResult<ImageInfo> {
        with(&self.state, |state| Ok(state.image(id)?.info.clone()))
    }

    async fn list_images(&self) -> KilnResult<Vec<ImageInfo>> {
        Ok(with(&self.state, |state| {
            state.images.iter().map(|img| img.info.clone()).collect()
        }))
    }

    async fn pull(&self, name: &str) -> KilnResult<String> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.pull_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on.iter().any(|p| name.contains(p.as_str())) {
            return Err(KilnError::ImagePull {
                image: name.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }

        let files = with(&self.state, |state| state.registry.get(name).cloned())
            .unwrap_or_else(default_base);
        let tar = files_tar(&files)?;
        let config = ImageConfig {
            cmd: vec!["/bin/sh".to_string()],
            ..Default::default()
        };
        let id = self.store_image("", "", &config, files, vec![tar])?;

        with(&self.state, |state| {
            state.names.insert(name.to_string(), id.clone());
        });
        debug!("Pulled {} as {}", name, id);
        Ok(id)
    }

    async fn lookup(&self, name: &str) -> KilnResult<String> {
        with(&self.state, |state| Ok(state.image(name)?.info.id.clone()))
    }

    async fn create(&self, spec: &ContainerSpec) -> KilnResult<String> {
        with(&self.state, |state| {
            let files = if spec.image.is_empty() {
                Files::new()
            } else {
                state.image(&spec.image)?.files.clone()
            };
            let id = uuid::Uuid::new_v4().simple().to_string();
            state.containers.insert(
                id.clone(),
                Container {
                    spec: spec.clone(),
                    files,
                },
            );
            Ok(id)
        })
    }

    async fn start(&self, id: &str, _show_output: bool, _stdin: bool) -> KilnResult<i32> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.container_pause().await;

        with(&self.state, |state| {
            let container = state.container_mut(id)?;
            let command = container.spec.cmd.last().cloned().unwrap_or_default();
            let code = self.exit_code(&command);
            if code == 0 {
                let marker = Digest::from_bytes(
                    format!("{}\n{}", container.spec.image, container.spec.command_line().join(" "))
                        .as_bytes(),
                );
                container.files.insert(
                    format!("{}/{}", RUNS_DIR, marker.hex()),
                    format!("{}\n", command).into_bytes(),
                );
            }
            Ok(code)
        })
    }

    async fn commit(&self, id: &str, config: &ImageConfig, comment: &str) -> KilnResult<String> {
        let (parent, files, mut tars, changed) = with(&self.state, |state| {
            let container = state
                .containers
                .get(id)
                .cloned()
                .ok_or_else(|| KilnError::ContainerNotFound(id.to_string()))?;
            let (base_files, base_tars) = if container.spec.image.is_empty() {
                (Files::new(), Vec::new())
            } else {
                let base = state.image(&container.spec.image)?;
                (base.files.clone(), base.tars.clone())
            };
            let changed: Files = container
                .files
                .iter()
                .filter(|(path, body)| base_files.get(*path) != Some(*body))
                .map(|(path, body)| (path.clone(), body.clone()))
                .collect();
            Ok::<_, KilnError>((container.spec.image, container.files, base_tars, changed))
        })?;

        if !changed.is_empty() {
            tars.push(files_tar(&changed)?);
        }
        self.store_image(&parent, comment, config, files, tars)
    }

    async fn remove_container(&self, id: &str) -> KilnResult<()> {
        with(&self.state, |state| {
            state.containers.remove(id);
        });
        Ok(())
    }

    async fn copy_to(&self, id: &str, archive: &Path) -> KilnResult<()> {
        self.container_pause().await;
        let file = File::open(archive)
            .map_err(|e| KilnError::io(format!("opening {}", archive.display()), e))?;
        let incoming = read_tar(file)?;

        with(&self.state, |state| {
            state.container_mut(id)?.files.extend(incoming);
            Ok(())
        })
    }

    async fn copy_from(&self, id: &str, path: &str, dest: &Path) -> KilnResult<()> {
        let files = with(&self.state, |state| {
            let container = state.container_mut(id)?;
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let base = Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string());

            let selected: Files = container
                .files
                .iter()
                .filter(|(name, _)| path == "/" || *name == path || name.starts_with(&prefix))
                .map(|(name, body)| {
                    let rel = Path::new(name)
                        .strip_prefix(&base)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| PathBuf::from(name));
                    (rel.to_string_lossy().into_owned(), body.clone())
                })
                .collect();
            if selected.is_empty() {
                return Err(KilnError::PathNotFound(PathBuf::from(path)));
            }
            Ok(selected)
        })?;

        std::fs::write(dest, files_tar(&files)?)
            .map_err(|e| KilnError::io(format!("writing {}", dest.display()), e))
    }

    async fn tag(&self, image: &str, name: &str) -> KilnResult<()> {
        with(&self.state, |state| {
            let id = state.image(image)?.info.id.clone();
            state.names.insert(name.to_string(), id);
            Ok(())
        })
    }

    async fn save(&self, image: &str, dest: &Path) -> KilnResult<()> {
        let stored = with(&self.state, |state| state.image(image).cloned())?;

        let scratch = tempfile::TempDir::new()
            .map_err(|e| KilnError::io("creating scratch repository", e))?;
        let repo = Repository::new(scratch.path(), true)?;

        let mut parent = None;
        for tar in &stored.tars {
            let layer = repo.create_layer_from_asset(&tar[..], parent.take(), true)?;
            layer.save_parent()?;
            parent = Some(layer);
        }
        let top = parent.ok_or_else(|| {
            KilnError::ImageCannotBeComposed(format!("image {} has no layers", image))
        })?;
        top.save_config(&stored.info.config)?;

        write_to_file(repo.export(&DockerArchive, &top, &[])?, dest).await?;
        Ok(())
    }

    async fn load(&self, archive: &Path) -> KilnResult<String> {
        let scratch = tempfile::TempDir::new()
            .map_err(|e| KilnError::io("creating scratch repository", e))?;
        let repo = Repository::new(scratch.path(), true)?;
        let file = File::open(archive)
            .map_err(|e| KilnError::io(format!("opening {}", archive.display()), e))?;

        let top = repo
            .import(&DockerArchive, Box::new(file))?
            .into_iter()
            .next()
            .ok_or(KilnError::TopLayerMissing)?;
        let config = top.config()?.unwrap_or_default();

        let mut chain: Vec<_> = top.ancestors().cloned().collect();
        chain.reverse();

        let mut files = Files::new();
        let mut tars = Vec::with_capacity(chain.len());
        for layer in &chain {
            let mut tar = Vec::new();
            layer.pack(&mut tar)?;
            files.extend(read_tar(&tar[..])?);
            tars.push(tar);
        }

        let comment = config.comment.clone();
        self.store_image("", &comment, &config, files, tars)
    }

    async fn import(&self, archive: &Path, config: &ImageConfig) -> KilnResult<String> {
        let file = File::open(archive)
            .map_err(|e| KilnError::io(format!("opening {}", archive.display()), e))?;
        let files = read_tar(file)?;
        let tar = files_tar(&files)?;
        self.store_image("", "", config, files, vec![tar])
    }
}
