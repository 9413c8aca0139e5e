//! Portable image configuration
//!
//! `ImageConfig` is the flat form kept next to each layer. Archive formats
//! nest the runtime fields under a `config` object with docker-style
//! capitalized keys; `RuntimeConfig` is that nested form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat image configuration stored as `config.json` on a layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent: String,
    /// Commit annotation; the build cache key lives here
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "stopsignal", skip_serializing_if = "String::is_empty")]
    pub stop_signal: String,
}

/// Runtime portion of an archive image config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stop_signal: String,
}

/// The `rootfs` stanza of an archive image config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

impl RootFs {
    pub fn layers(diff_ids: Vec<String>) -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids,
        }
    }
}

/// Image config as found in archives: metadata at the top, runtime nested
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveImageConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub os: String,
    pub config: RuntimeConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<RootFs>,
}

impl From<&ArchiveImageConfig> for ImageConfig {
    fn from(img: &ArchiveImageConfig) -> Self {
        let rt = &img.config;
        Self {
            id: img.id.clone(),
            parent: img.parent.clone(),
            comment: img.comment.clone(),
            created: img.created,
            container: img.container.clone(),
            container_config: img.container_config.clone(),
            docker_version: img.docker_version.clone(),
            author: img.author.clone(),
            architecture: img.architecture.clone(),
            os: img.os.clone(),
            user: rt.user.clone(),
            exposed_ports: rt.exposed_ports.clone(),
            env: rt.env.clone(),
            entrypoint: rt.entrypoint.clone(),
            cmd: rt.cmd.clone(),
            volumes: rt.volumes.clone(),
            working_dir: rt.working_dir.clone(),
            labels: rt.labels.clone(),
            stop_signal: rt.stop_signal.clone(),
        }
    }
}

impl ImageConfig {
    /// Nest into the archive layout, attaching the given diff ids
    pub fn to_archive(&self, diff_ids: Vec<String>) -> ArchiveImageConfig {
        ArchiveImageConfig {
            id: self.id.clone(),
            parent: self.parent.clone(),
            comment: self.comment.clone(),
            created: self.created,
            container: self.container.clone(),
            container_config: self.container_config.clone(),
            docker_version: self.docker_version.clone(),
            author: self.author.clone(),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config: RuntimeConfig {
                user: self.user.clone(),
                exposed_ports: self.exposed_ports.clone(),
                env: self.env.clone(),
                entrypoint: self.entrypoint.clone(),
                cmd: self.cmd.clone(),
                volumes: self.volumes.clone(),
                working_dir: self.working_dir.clone(),
                labels: self.labels.clone(),
                stop_signal: self.stop_signal.clone(),
            },
            rootfs: Some(RootFs::layers(diff_ids)),
        }
    }
}
