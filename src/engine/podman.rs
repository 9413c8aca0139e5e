//! Podman engine
//!
//! Drives the `podman` CLI directly. Every call is a separate process; ids
//! are normalized to bare hex.

use super::{ContainerEngine, ContainerSpec, ImageInfo};
use crate::error::{KilnError, KilnResult};
use crate::store::{Digest, ImageConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

/// Engine backed by the podman CLI
pub struct PodmanEngine;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct InspectConfig {
    user: String,
    env: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    working_dir: String,
    labels: Option<BTreeMap<String, String>>,
    stop_signal: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct InspectRootFs {
    layers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InspectImage {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Parent")]
    parent: String,
    #[serde(rename = "Comment")]
    comment: String,
    #[serde(rename = "Created")]
    created: Option<DateTime<Utc>>,
    #[serde(rename = "Architecture")]
    architecture: String,
    #[serde(rename = "Os")]
    os: String,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "RootFS")]
    rootfs: InspectRootFs,
}

impl From<InspectImage> for ImageInfo {
    fn from(img: InspectImage) -> Self {
        let cfg = img.config;
        let config = ImageConfig {
            comment: img.comment.clone(),
            created: img.created,
            architecture: img.architecture,
            os: img.os,
            user: cfg.user,
            env: cfg.env.unwrap_or_default(),
            entrypoint: cfg.entrypoint.unwrap_or_default(),
            cmd: cfg.cmd.unwrap_or_default(),
            working_dir: cfg.working_dir,
            labels: cfg.labels.unwrap_or_default(),
            stop_signal: cfg.stop_signal,
            ..Default::default()
        };

        Self {
            id: bare_id(&img.id).to_string(),
            parent: bare_id(&img.parent).to_string(),
            comment: img.comment,
            config,
            layers: img
                .rootfs
                .layers
                .iter()
                .filter_map(|l| Digest::parse(l).ok())
                .collect(),
            created: img.created,
        }
    }
}

fn bare_id(id: &str) -> &str {
    id.trim().trim_start_matches("sha256:")
}

fn json_list(values: &[String]) -> KilnResult<String> {
    Ok(serde_json::to_string(values)?)
}

/// `--change` instructions recording a configuration on commit or import
fn change_args(config: &ImageConfig) -> KilnResult<Vec<String>> {
    let mut changes = Vec::new();
    if !config.user.is_empty() {
        changes.push(format!("USER {}", config.user));
    }
    if !config.working_dir.is_empty() {
        changes.push(format!("WORKDIR {}", config.working_dir));
    }
    changes.push(format!("CMD {}", json_list(&config.cmd)?));
    changes.push(format!("ENTRYPOINT {}", json_list(&config.entrypoint)?));
    for entry in &config.env {
        if let Some((key, value)) = entry.split_once('=') {
            changes.push(format!("ENV {}={}", key, value));
        }
    }
    for (key, value) in &config.labels {
        changes.push(format!("LABEL {}={}", key, value));
    }

    Ok(changes
        .into_iter()
        .flat_map(|change| ["--change".to_string(), change])
        .collect())
}

/// Last non-empty line of a command's stdout
fn last_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

impl PodmanEngine {
    pub fn new() -> Self {
        Self
    }

    /// Execute a podman command and capture its output
    async fn exec(&self, args: &[&str]) -> KilnResult<Output> {
        debug!("Executing: podman {:?}", args);

        Command::new("podman")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KilnError::command_failed(format!("podman {:?}", args), e))
    }

    /// Execute a podman command, failing on a non-zero exit
    async fn exec_ok(&self, what: &str, args: &[&str]) -> KilnResult<Output> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(KilnError::command_exec(format!("podman {}", what), stderr))
        }
    }

    async fn inspect_many(&self, ids: &[String]) -> KilnResult<Vec<ImageInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["image", "inspect"];
        args.extend(ids.iter().map(String::as_str));

        let output = self.exec_ok("image inspect", &args).await?;
        let images: Vec<InspectImage> = serde_json::from_slice(&output.stdout)?;
        Ok(images.into_iter().map(ImageInfo::from).collect())
    }
}

impl Default for PodmanEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for PodmanEngine {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn is_available(&self) -> KilnResult<bool> {
        Ok(Command::new("podman")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false))
    }

    async fn inspect_image(&self, id: &str) -> KilnResult<ImageInfo> {
        self.inspect_many(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KilnError::ImageNotFound(id.to_string()))
    }

    async fn list_images(&self) -> KilnResult<Vec<ImageInfo>> {
        let output = self
            .exec_ok("images", &["images", "-a", "-q", "--no-trunc"])
            .await?;

        let mut seen = HashSet::new();
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| bare_id(l).to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        self.inspect_many(&ids).await
    }

    async fn pull(&self, name: &str) -> KilnResult<String> {
        info!("Pulling image: {}", name);

        let output = self.exec(&["pull", "-q", name]).await?;
        if !output.status.success() {
            return Err(KilnError::ImagePull {
                image: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(bare_id(&last_line(&output)).to_string())
    }

    async fn lookup(&self, name: &str) -> KilnResult<String> {
        let output = self
            .exec(&["image", "inspect", "--format", "{{.Id}}", name])
            .await?;
        if !output.status.success() {
            return Err(KilnError::ImageNotFound(name.to_string()));
        }
        Ok(bare_id(&last_line(&output)).to_string())
    }

    async fn create(&self, spec: &ContainerSpec) -> KilnResult<String> {
        let mut args = vec!["create".to_string()];

        if spec.tty {
            args.push("-t".to_string());
        }
        if spec.stdin {
            args.push("-i".to_string());
        }
        if !spec.user.is_empty() {
            args.push("-u".to_string());
            args.push(spec.user.clone());
        }
        if !spec.workdir.is_empty() {
            args.push("-w".to_string());
            args.push(spec.workdir.clone());
        }
        for entry in &spec.env {
            args.push("-e".to_string());
            args.push(entry.clone());
        }

        args.push("--entrypoint".to_string());
        if spec.entrypoint.is_empty() {
            args.push(String::new());
        } else {
            args.push(json_list(&spec.entrypoint)?);
        }

        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec_ok("create", &args_refs).await?;
        let id = last_line(&output);
        debug!("Created container {}", &id[..12.min(id.len())]);
        Ok(id)
    }

    async fn start(&self, id: &str, show_output: bool, stdin: bool) -> KilnResult<i32> {
        let mut cmd = Command::new("podman");
        cmd.args(["start", "-a"]);
        if stdin {
            cmd.arg("-i");
        }
        cmd.arg(id);

        let output = || {
            if show_output {
                Stdio::inherit()
            } else {
                Stdio::null()
            }
        };
        cmd.stdin(if stdin { Stdio::inherit() } else { Stdio::null() })
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true);

        debug!("Starting container {}", id);
        let status = cmd
            .status()
            .await
            .map_err(|e| KilnError::command_failed(format!("podman start {}", id), e))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn commit(&self, id: &str, config: &ImageConfig, comment: &str) -> KilnResult<String> {
        let mut args = vec![
            "commit".to_string(),
            "-q".to_string(),
            "--format".to_string(),
            "docker".to_string(),
            "-m".to_string(),
            comment.to_string(),
        ];
        args.extend(change_args(config)?);
        args.push(id.to_string());

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec_ok("commit", &args_refs).await?;
        Ok(bare_id(&last_line(&output)).to_string())
    }

    async fn remove_container(&self, id: &str) -> KilnResult<()> {
        debug!("Removing container: {}", id);

        let output = self.exec(&["rm", "-f", id]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no such container") {
            Ok(())
        } else {
            Err(KilnError::command_exec("podman rm", stderr))
        }
    }

    async fn copy_to(&self, id: &str, archive: &Path) -> KilnResult<()> {
        let file = File::open(archive)
            .map_err(|e| KilnError::io(format!("opening {}", archive.display()), e))?;
        let target = format!("{}:/", id);

        let output = Command::new("podman")
            .args(["cp", "-", &target])
            .stdin(Stdio::from(file))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KilnError::command_failed("podman cp", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(KilnError::command_exec(
                "podman cp",
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn copy_from(&self, id: &str, path: &str, dest: &Path) -> KilnResult<()> {
        let file = File::create(dest)
            .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;
        let source = format!("{}:{}", id, path);

        let output = Command::new("podman")
            .args(["cp", &source, "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KilnError::command_failed("podman cp", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(KilnError::command_exec(
                "podman cp",
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn tag(&self, image: &str, name: &str) -> KilnResult<()> {
        self.exec_ok("tag", &["tag", image, name]).await?;
        Ok(())
    }

    async fn save(&self, image: &str, dest: &Path) -> KilnResult<()> {
        let dest = dest.to_string_lossy();
        self.exec_ok(
            "save",
            &["save", "--format", "docker-archive", "-o", &dest, image],
        )
        .await?;
        Ok(())
    }

    async fn load(&self, archive: &Path) -> KilnResult<String> {
        let path = archive.to_string_lossy();
        let output = self.exec_ok("load", &["load", "-i", &path]).await?;

        let loaded = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| l.starts_with("Loaded image"))
            .filter_map(|l| l.rsplit_once(": ").map(|(_, name)| name.trim().to_string()))
            .last()
            .ok_or_else(|| KilnError::command_exec("podman load", "no image reported"))?;

        self.lookup(&loaded).await
    }

    async fn import(&self, archive: &Path, config: &ImageConfig) -> KilnResult<String> {
        let mut args = vec!["import".to_string(), "-q".to_string()];
        args.extend(change_args(config)?);
        args.push(archive.to_string_lossy().into_owned());

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec_ok("import", &args_refs).await?;
        Ok(bare_id(&last_line(&output)).to_string())
    }
}
