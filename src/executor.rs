//! Build executor
//!
//! Implements the operations the interpreter needs on top of a container
//! engine: ephemeral containers, commits annotated with cache keys, cache
//! lookups, and rebuilding the final image without skipped layers.
//!
//! Every engine call races the build's cancellation token. A container
//! created for a step is removed on every exit path: explicitly after the
//! commit, or by `ContainerGuard` when the step future is dropped.

use crate::build::{Configuration, Globals, LayerLedger};
use crate::engine::{ContainerEngine, ImageInfo};
use crate::error::{KilnError, KilnResult};
use crate::pull::{self, PullCoordinator, PullTicket};
use crate::signal::CancellationRegistry;
use crate::store::archive::{write_to_file, ArchiveFormat, DockerArchive, ExportStream};
use crate::store::{edit_chain, Digest, ImageConfig, Repository};
use crate::ui::{self, TaskSpinner, UiContext};
use std::fs::File;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tag under which the empty base image is kept
pub const SCRATCH_TAG: &str = "kiln-scratch";

/// Work done inside a container before it is committed
#[derive(Debug, Clone)]
pub enum Hook {
    /// Start the container with its configured command
    Run,
    /// Extract a prepared archive at the container root
    CopyArchive(PathBuf),
}

/// Removes a container when dropped while still armed
struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn ContainerEngine>, id: &str) -> Self {
        Self {
            engine,
            id: Some(id.to_string()),
        }
    }

    fn disarm(&mut self) -> Option<String> {
        self.id.take()
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = engine.remove_container(&id).await {
                        warn!("Could not remove container {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("Container {} left behind: no runtime to remove it", id),
        }
    }
}

/// Per-build executor
pub struct Executor {
    engine: Arc<dyn ContainerEngine>,
    pulls: Arc<PullCoordinator>,
    signals: Arc<CancellationRegistry>,
    config: Configuration,
    ledger: LayerLedger,
    use_cache: bool,
    tty: bool,
    stdin: bool,
    show_run: bool,
    cancel: CancellationToken,
    ui: UiContext,
}

impl Executor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        pulls: Arc<PullCoordinator>,
        signals: Arc<CancellationRegistry>,
        globals: &Globals,
        ui: UiContext,
    ) -> Self {
        Self {
            engine,
            pulls,
            signals,
            config: Configuration::new(),
            ledger: LayerLedger::new(),
            use_cache: globals.cache,
            tty: globals.tty,
            stdin: false,
            show_run: globals.show_run,
            cancel: globals.cancel.clone(),
            ui,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Configuration {
        &mut self.config
    }

    /// Adopt an image's recorded configuration
    pub fn load_config(&mut self, id: &str, config: &ImageConfig) {
        self.config.load_image(id, config);
    }

    /// Current image id; empty before `from`
    pub fn image_id(&self) -> &str {
        &self.config.image
    }

    pub fn ledger(&self) -> &LayerLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut LayerLedger {
        &mut self.ledger
    }

    pub fn ui(&self) -> &UiContext {
        &self.ui
    }

    pub fn signals(&self) -> &Arc<CancellationRegistry> {
        &self.signals
    }

    pub fn use_cache(&mut self, on: bool) {
        self.use_cache = on;
    }

    pub fn use_tty(&mut self, on: bool) {
        self.tty = on;
    }

    pub fn tty(&self) -> bool {
        self.tty
    }

    pub fn set_stdin(&mut self, on: bool) {
        self.stdin = on;
    }

    pub fn show_run(&self) -> bool {
        self.show_run
    }

    pub fn set_show_run(&mut self, on: bool) {
        self.show_run = on;
    }

    /// Run an engine call unless the build is cancelled first
    async fn guarded<T>(&self, fut: impl Future<Output = KilnResult<T>>) -> KilnResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(KilnError::Cancelled),
            result = fut => result,
        }
    }

    /// Create an ephemeral container from the effective configuration
    pub async fn create(&self) -> KilnResult<String> {
        let spec = self.config.container_spec(self.tty, self.stdin);
        self.guarded(self.engine.create(&spec)).await
    }

    /// Remove a container; runs even when the build is cancelled
    pub async fn destroy(&self, id: &str) -> KilnResult<()> {
        self.engine.remove_container(id).await
    }

    /// Start the container and wait; a non-zero exit is an error
    pub async fn run_hook(&self, id: &str) -> KilnResult<String> {
        let code = self
            .guarded(self.engine.start(id, self.show_run, self.stdin))
            .await?;
        if code != 0 {
            let command = self.config.container_spec(self.tty, self.stdin).command_line();
            return Err(KilnError::RunFailed {
                command: command.join(" "),
                code,
            });
        }
        Ok(String::new())
    }

    /// Extract an archive into a container
    pub async fn copy_to_container(&self, id: &str, archive: &Path) -> KilnResult<()> {
        self.guarded(self.engine.copy_to(id, archive)).await
    }

    /// Fetch `path` from a container as a tar file
    pub async fn copy_from_container(&self, id: &str, path: &str) -> KilnResult<tempfile::NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix("kiln-copy.")
            .tempfile()
            .map_err(|e| KilnError::io("creating copy target", e))?;
        let _tracked = self.signals.track_file(file.path());
        self.guarded(self.engine.copy_from(id, path, file.path()))
            .await?;
        Ok(file)
    }

    /// Content of one file in the current image
    pub async fn copy_one_file_from_container(&self, path: &str) -> KilnResult<Vec<u8>> {
        let id = self.create().await?;
        let mut guard = ContainerGuard::new(Arc::clone(&self.engine), &id);

        let result = async {
            let archive = self.copy_from_container(&id, path).await?;
            first_file(archive.reopen().map_err(|e| KilnError::io("reopening copy", e))?)
                .and_then(|body| body.ok_or_else(|| KilnError::PathNotFound(PathBuf::from(path))))
        }
        .await;

        guard.disarm();
        let removed = self.destroy(&id).await;
        let body = result?;
        removed?;
        Ok(body)
    }

    async fn run(&self, id: &str, hook: Option<Hook>) -> KilnResult<String> {
        match hook {
            None => Ok(String::new()),
            Some(Hook::Run) => self.run_hook(id).await,
            Some(Hook::CopyArchive(archive)) => {
                self.copy_to_container(id, &archive).await?;
                Ok(String::new())
            }
        }
    }

    /// Create a container, run the hook and commit the result
    ///
    /// A non-empty hook result replaces the cache key. The container is
    /// removed whether or not the commit succeeds; on failure the current
    /// image is left unchanged.
    pub async fn commit(&mut self, cache_key: &str, hook: Option<Hook>) -> KilnResult<()> {
        let id = self.create().await?;
        let mut guard = ContainerGuard::new(Arc::clone(&self.engine), &id);

        let committed = async {
            let output = self.run(&id, hook).await?;
            let key = if output.is_empty() {
                cache_key
            } else {
                output.as_str()
            };
            let config = self.config.image_config();
            self.guarded(self.engine.commit(&id, &config, key)).await
        }
        .await;

        guard.disarm();
        let removed = self.destroy(&id).await;
        let image = committed?;
        removed.map_err(|e| {
            KilnError::command_exec("remove", format!("could not remove intermediate container {}: {}", id, e))
        })?;

        self.add_image(&image).await
    }

    /// Make `id` the current image and record its layers
    async fn add_image(&mut self, id: &str) -> KilnResult<()> {
        let info = self.guarded(self.engine.inspect_image(id)).await?;
        self.config.image = info.id.clone();
        self.ledger.add_image(&info.layers);
        debug!("Current image is now {}", info.id);
        Ok(())
    }

    fn adopt(&mut self, info: &ImageInfo) {
        self.load_config(&info.id, &info.config);
        self.ledger.add_image(&info.layers);
    }

    /// Look for an image whose parent is the current image and whose
    /// annotation is `key`; adopt the first one found
    pub async fn check_cache(&mut self, key: &str) -> KilnResult<bool> {
        if !self.use_cache || key.is_empty() {
            return Ok(false);
        }

        let images = self.guarded(self.engine.list_images()).await?;
        let hit = images
            .into_iter()
            .find(|img| img.parent == self.config.image && img.comment == key);

        match hit {
            Some(info) => {
                info!("Cache hit: {}", info.id);
                ui::cache_hit(&self.ui, &info.id);
                self.adopt(&info);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resolve a base image, sharing the fetch with concurrent builds
    pub async fn fetch(&mut self, name: &str) -> KilnResult<String> {
        let id = match self.pulls.begin(name) {
            PullTicket::Leader(leader) => {
                let mut spinner = TaskSpinner::new(&self.ui);
                spinner.start(&format!("Pulling {}...", name));
                let pulled = self.guarded(self.engine.pull(name)).await;
                drop(leader);
                match pulled {
                    Ok(id) => {
                        spinner.stop(&format!("Pulled {}", name));
                        id
                    }
                    Err(e) => {
                        spinner.stop_error(&format!("Pull of {} failed", name));
                        return Err(e);
                    }
                }
            }
            PullTicket::Waiter(rx) => {
                debug!("Waiting for concurrent pull of {}", name);
                self.guarded(async {
                    pull::wait(rx).await;
                    Ok(())
                })
                .await?;
                self.guarded(self.engine.lookup(name)).await?
            }
        };

        let info = self.guarded(self.engine.inspect_image(&id)).await?;
        self.adopt(&info);
        Ok(info.id)
    }

    /// Start from an empty filesystem
    ///
    /// The empty image is imported once and tagged, so later builds find the
    /// same parent and their cache entries stay valid.
    pub async fn from_scratch(&mut self) -> KilnResult<String> {
        let id = match self.guarded(self.engine.lookup(SCRATCH_TAG)).await {
            Ok(id) => id,
            Err(KilnError::Cancelled) => return Err(KilnError::Cancelled),
            Err(_) => {
                let empty = tempfile::Builder::new()
                    .prefix("kiln-scratch.")
                    .tempfile()
                    .map_err(|e| KilnError::io("creating scratch archive", e))?;
                tar::Builder::new(empty.as_file())
                    .finish()
                    .map_err(|e| KilnError::io("writing scratch archive", e))?;
                let id = self
                    .guarded(self.engine.import(empty.path(), &ImageConfig::default()))
                    .await?;
                self.guarded(self.engine.tag(&id, SCRATCH_TAG)).await?;
                id
            }
        };

        let info = self.guarded(self.engine.inspect_image(&id)).await?;
        self.config = Configuration::new();
        self.adopt(&info);
        Ok(info.id)
    }

    /// Tag the current image
    pub async fn tag(&self, name: &str) -> KilnResult<()> {
        self.guarded(self.engine.tag(&self.config.image, name)).await
    }

    /// Squash the current image's filesystem into a single layer
    pub async fn flatten(&mut self) -> KilnResult<()> {
        let id = self.create().await?;
        let mut guard = ContainerGuard::new(Arc::clone(&self.engine), &id);

        let flattened = async {
            let mut spinner = TaskSpinner::new(&self.ui);
            spinner.start("Downloading image contents to host...");
            let archive = self.copy_from_container(&id, "/").await?;
            let _tracked = self.signals.track_file(archive.path());
            let config = self.config.image_config();
            let image = self
                .guarded(self.engine.import(archive.path(), &config))
                .await?;
            spinner.stop("Flattened image");
            Ok::<_, KilnError>(image)
        }
        .await;

        guard.disarm();
        let removed = self.destroy(&id).await;
        let image = flattened?;
        removed?;

        let info = self.guarded(self.engine.inspect_image(&image)).await?;
        self.config.image = info.id.clone();
        self.ledger.reset(&info.layers);
        Ok(())
    }

    /// Produce the final image, rebuilt without skipped layers if any
    pub async fn make_image(&mut self) -> KilnResult<String> {
        if !self.ledger.needs_rebuild() {
            return Ok(self.config.image.clone());
        }

        let skipped = self.ledger.skipped().len();
        let scratch = tempfile::Builder::new()
            .prefix("kiln-make-image.")
            .tempdir()
            .map_err(|e| KilnError::io("creating scratch directory", e))?;
        let saved = scratch.path().join("saved.tar");
        let rebuilt = scratch.path().join("rebuilt.tar");
        let _saved_tracked = self.signals.track_file(&saved);
        let _rebuilt_tracked = self.signals.track_file(&rebuilt);

        let mut spinner = TaskSpinner::new(&self.ui);
        spinner.start(&format!("Removing {} skipped layers...", skipped));

        self.guarded(self.engine.save(&self.config.image, &saved))
            .await?;

        let retained = self.ledger.layers().to_vec();
        let config = self.config.image_config();
        let store = scratch.path().join("store");
        let (saved_path, rebuilt_path) = (saved.clone(), rebuilt.clone());
        self.guarded(async move {
            let stream = tokio::task::spawn_blocking(move || {
                rebuild_archive(&store, &saved_path, &retained, &config)
            })
            .await
            .map_err(|e| KilnError::Internal(format!("image rebuild task failed: {}", e)))??;
            write_to_file(stream, &rebuilt_path).await
        })
        .await?;

        let id = self.guarded(self.engine.load(&rebuilt)).await?;
        let info = self.guarded(self.engine.inspect_image(&id)).await?;
        spinner.stop(&format!("Removed {} skipped layers", skipped));

        self.config.image = info.id.clone();
        self.ledger.reset(&info.layers);
        Ok(info.id)
    }

    /// Export the current image to `file`
    pub async fn save(&self, file: &Path, format: ArchiveFormat, tags: &[String]) -> KilnResult<()> {
        let scratch = tempfile::Builder::new()
            .prefix("kiln-save.")
            .tempdir()
            .map_err(|e| KilnError::io("creating scratch directory", e))?;
        let saved = scratch.path().join("saved.tar");
        let _tracked = self.signals.track_file(&saved);
        let _out_tracked = self.signals.track_file(file);

        let mut spinner = TaskSpinner::new(&self.ui);
        spinner.start(&format!("Saving image to {}...", file.display()));

        self.guarded(self.engine.save(&self.config.image, &saved))
            .await?;

        let store = scratch.path().join("store");
        let out = file.to_path_buf();
        let tags = tags.to_vec();
        let written = self
            .guarded(async move {
                let stream =
                    tokio::task::spawn_blocking(move || convert_archive(&store, &saved, format, &tags))
                        .await
                        .map_err(|e| KilnError::Internal(format!("image export task failed: {}", e)))??;
                write_to_file(stream, &out).await
            })
            .await?;

        spinner.stop(&format!("Saved {} bytes to {}", written, file.display()));
        Ok(())
    }
}

/// First regular file in a tar stream
fn first_file<R: Read>(reader: R) -> KilnResult<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| KilnError::io("reading copied archive", e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| KilnError::io("reading copied archive", e))?;
        if entry.header().entry_type().is_file() {
            let mut body = Vec::new();
            entry
                .read_to_end(&mut body)
                .map_err(|e| KilnError::io("reading copied file", e))?;
            return Ok(Some(body));
        }
    }
    Ok(None)
}

/// Rewrite a saved image keeping only `retained` layers
fn rebuild_archive(
    store: &Path,
    saved: &Path,
    retained: &[Digest],
    config: &ImageConfig,
) -> KilnResult<ExportStream> {
    let repo = Repository::new(store, true)?;
    let reader = File::open(saved).map_err(|e| KilnError::io(format!("opening {}", saved.display()), e))?;
    let top = repo
        .import(&DockerArchive, Box::new(reader))?
        .into_iter()
        .next()
        .ok_or(KilnError::TopLayerMissing)?
        .restore_parent()?;

    let edited = edit_chain(&top, retained)?;
    let tip = edited.first().ok_or(KilnError::EmptyLayerEdit)?;
    tip.save_config(config)?;

    repo.export(&DockerArchive, tip, &[])
}

/// Re-export a saved image in the requested format
fn convert_archive(
    store: &Path,
    saved: &Path,
    format: ArchiveFormat,
    tags: &[String],
) -> KilnResult<ExportStream> {
    let repo = Repository::new(store, true)?;
    let reader = File::open(saved).map_err(|e| KilnError::io(format!("opening {}", saved.display()), e))?;
    let top = repo
        .import(&DockerArchive, Box::new(reader))?
        .into_iter()
        .next()
        .ok_or(KilnError::TopLayerMissing)?;
    repo.export(format.exporter().as_ref(), &top, tags)
}
