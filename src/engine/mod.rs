//! Container engine abstraction
//!
//! The build pipeline talks to a container engine only through the
//! `ContainerEngine` trait. `PodmanEngine` drives the podman CLI;
//! `MemoryEngine` is an in-process stand-in used for dry runs and tests.

mod memory;
mod podman;

pub use memory::MemoryEngine;
pub use podman::PodmanEngine;

use crate::error::{KilnError, KilnResult};
use crate::store::{Digest, ImageConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// What the engine knows about one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    /// Parent image id; empty for base images
    pub parent: String,
    /// Commit annotation
    pub comment: String,
    pub config: ImageConfig,
    /// Layer diff ids, root first
    pub layers: Vec<Digest>,
    pub created: Option<DateTime<Utc>>,
}

/// Everything needed to create an ephemeral build container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub user: String,
    pub workdir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
}

impl ContainerSpec {
    /// The command line the container runs, entrypoint first
    pub fn command_line(&self) -> Vec<String> {
        self.entrypoint.iter().chain(&self.cmd).cloned().collect()
    }
}

/// Raw container engine operations
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Human-readable engine name
    fn name(&self) -> &'static str;

    /// Check whether the engine can be used on this system
    async fn is_available(&self) -> KilnResult<bool>;

    async fn inspect_image(&self, id: &str) -> KilnResult<ImageInfo>;

    /// Every image the engine knows, in the engine's listing order
    async fn list_images(&self) -> KilnResult<Vec<ImageInfo>>;

    /// Fetch an image from its registry and return its id
    async fn pull(&self, name: &str) -> KilnResult<String>;

    /// Resolve a name to an image id without fetching
    async fn lookup(&self, name: &str) -> KilnResult<String>;

    /// Create a stopped container and return its id
    async fn create(&self, spec: &ContainerSpec) -> KilnResult<String>;

    /// Start a created container, wait for it and return its exit code
    async fn start(&self, id: &str, show_output: bool, stdin: bool) -> KilnResult<i32>;

    /// Snapshot a container into a new image annotated with `comment`
    async fn commit(&self, id: &str, config: &ImageConfig, comment: &str) -> KilnResult<String>;

    async fn remove_container(&self, id: &str) -> KilnResult<()>;

    /// Extract a tar archive into the container's root
    async fn copy_to(&self, id: &str, archive: &Path) -> KilnResult<()>;

    /// Write `path` from the container as a tar archive to `dest`
    async fn copy_from(&self, id: &str, path: &str, dest: &Path) -> KilnResult<()>;

    async fn tag(&self, image: &str, name: &str) -> KilnResult<()>;

    /// Write an image with its full history as a docker archive
    async fn save(&self, image: &str, dest: &Path) -> KilnResult<()>;

    /// Load a docker archive and return the id of the image it holds
    async fn load(&self, archive: &Path) -> KilnResult<String>;

    /// Create a single-layer image from a filesystem tar
    async fn import(&self, archive: &Path, config: &ImageConfig) -> KilnResult<String>;
}

/// Available engine backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Podman,
    Memory,
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Podman => "podman",
            Self::Memory => "memory",
        }
    }
}

impl FromStr for EngineKind {
    type Err = KilnError;

    fn from_str(s: &str) -> KilnResult<Self> {
        match s {
            "podman" => Ok(Self::Podman),
            "memory" => Ok(Self::Memory),
            other => Err(KilnError::UnknownEngine(other.to_string())),
        }
    }
}

/// Create the engine selected by configuration
pub fn create_engine(kind: EngineKind) -> Arc<dyn ContainerEngine> {
    match kind {
        EngineKind::Podman => Arc::new(PodmanEngine::new()),
        EngineKind::Memory => Arc::new(MemoryEngine::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_kind_parse() {
        assert_eq!("podman".parse::<EngineKind>().unwrap(), EngineKind::Podman);
        assert_eq!("memory".parse::<EngineKind>().unwrap(), EngineKind::Memory);
        assert!(matches!(
            "docker".parse::<EngineKind>(),
            Err(KilnError::UnknownEngine(_))
        ));
    }

    #[test]
    fn command_line_puts_entrypoint_first() {
        let spec = ContainerSpec {
            entrypoint: vec!["/bin/sh".into(), "-c".into()],
            cmd: vec!["make".into()],
            ..Default::default()
        };
        assert_eq!(spec.command_line(), vec!["/bin/sh", "-c", "make"]);
    }

    #[test]
    fn create_engine_names() {
        assert_eq!(create_engine(EngineKind::Memory).name(), "memory");
        assert_eq!(create_engine(EngineKind::Podman).name(), "podman");
    }
}
