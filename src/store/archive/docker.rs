//! The classic `docker save` archive
//!
//! Export layout:
//!
//! ```text
//! <chain>/layer.tar   one directory per layer, named by chain id
//! <chain>/json        {"id", "parent", "config"}
//! <top chain>.json    image config with rootfs diff ids
//! manifest.json       [{"Config", "RepoTags", "Layers"}]
//! repositories        {}
//! ```
//!
//! Import also accepts archives whose layers are plain `<hex>.tar` files
//! ordered only by the manifest, as podman writes them.

use super::{
    append_bytes, append_dir, append_packed, run_chain, stream_archive, ExportStream, Exporter,
    Importer,
};
use crate::error::{KilnError, KilnResult};
use crate::store::digest::Digest;
use crate::store::image_config::{ArchiveImageConfig, ImageConfig};
use crate::store::layer::Layer;
use crate::store::repository::Repository;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path};
use tracing::debug;

const MANIFEST_FILE: &str = "manifest.json";
const REPOSITORIES_FILE: &str = "repositories";
const LEGACY_LAYER_FILE: &str = "layer.tar";
const LEGACY_JSON_FILE: &str = "json";

#[derive(Debug, Clone, Copy, Default)]
pub struct DockerArchive;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ManifestEntry {
    config: String,
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LegacyLayerJson {
    id: String,
    #[serde(default)]
    parent: String,
    #[serde(default)]
    config: serde_json::Value,
}

impl Exporter for DockerArchive {
    fn export(
        &self,
        repo: &Repository,
        layer: &Layer,
        tags: &[String],
    ) -> KilnResult<ExportStream> {
        let config = layer.config()?.ok_or_else(|| {
            KilnError::ImageCannotBeComposed("missing image configuration".to_string())
        })?;

        let repo = repo.clone();
        let top = layer.clone();
        let tags = tags.to_vec();
        Ok(stream_archive("docker", move |builder| {
            write_archive(&repo, &top, &config, &tags, builder)
        }))
    }
}

fn write_archive<W: std::io::Write>(
    repo: &Repository,
    top: &Layer,
    config: &ImageConfig,
    tags: &[String],
    builder: &mut tar::Builder<W>,
) -> KilnResult<()> {
    let walk = run_chain(repo, top, |parent, layer, packed| {
        let hex = packed.chain_id.hex().to_string();
        debug!("Exporting layer {} as {}", layer.id(), hex);

        append_dir(builder, &hex)?;
        append_packed(builder, &format!("{}/{}", hex, LEGACY_LAYER_FILE), packed)?;

        let json = serde_json::to_vec(&LegacyLayerJson {
            id: hex.clone(),
            parent: parent.map(|p| p.hex().to_string()).unwrap_or_default(),
            config: serde_json::json!({}),
        })?;
        append_bytes(builder, &format!("{}/{}", hex, LEGACY_JSON_FILE), &json)
    })?;

    let top_chain = walk
        .chain_ids
        .last()
        .ok_or_else(|| KilnError::ImageCannotBeComposed("empty layer chain".to_string()))?;

    append_bytes(builder, REPOSITORIES_FILE, b"{}")?;

    let diff_ids = walk.diff_ids.iter().map(|d| d.to_string()).collect();
    let config_name = format!("{}.json", top_chain.hex());
    append_bytes(
        builder,
        &config_name,
        &serde_json::to_vec(&config.to_archive(diff_ids))?,
    )?;

    let manifest = vec![ManifestEntry {
        config: config_name,
        repo_tags: Some(tags.to_vec()),
        layers: walk
            .chain_ids
            .iter()
            .map(|c| format!("{}/{}", c.hex(), LEGACY_LAYER_FILE))
            .collect(),
    }];
    append_bytes(builder, MANIFEST_FILE, &serde_json::to_vec(&manifest)?)
}

impl Importer for DockerArchive {
    fn import(&self, repo: &Repository, reader: Box<dyn Read + Send>) -> KilnResult<Vec<Layer>> {
        let tempdir = repo.temp_dir()?;
        let result = import_from(repo, reader, &tempdir);
        let _ = fs::remove_dir_all(&tempdir);
        result
    }
}

/// Layers and images found in an unpacked archive, keyed by archive path
#[derive(Default)]
struct Unpacked {
    layers: HashMap<String, Layer>,
    parents: HashMap<String, String>,
    images: Vec<ArchiveImageConfig>,
    tags: HashMap<String, Vec<String>>,
}

fn import_from(
    repo: &Repository,
    reader: Box<dyn Read + Send>,
    tempdir: &Path,
) -> KilnResult<Vec<Layer>> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(tempdir)
        .map_err(|e| KilnError::io("unpacking image archive", e))?;

    let manifest = read_manifest(tempdir)?;
    let mut up = Unpacked::default();
    unpack_legacy_layers(repo, tempdir, &mut up)?;
    unpack_manifest_layers(repo, tempdir, &manifest, &mut up)?;
    read_images(tempdir, &manifest, &mut up)?;
    construct_images(repo, up)
}

fn read_manifest(tempdir: &Path) -> KilnResult<Vec<ManifestEntry>> {
    match fs::read(tempdir.join(MANIFEST_FILE)) {
        Ok(content) => Ok(serde_json::from_slice(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(KilnError::io("reading archive manifest", e)),
    }
}

fn sorted_entries(dir: &Path) -> KilnResult<Vec<std::path::PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| KilnError::io(format!("listing {}", dir.display()), e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KilnError::io(format!("listing {}", dir.display()), e))?;
    entries.sort();
    Ok(entries)
}

fn import_layer_file(repo: &Repository, path: &Path) -> KilnResult<Layer> {
    let file =
        File::open(path).map_err(|e| KilnError::io(format!("opening {}", path.display()), e))?;
    repo.create_layer_from_asset(file, None, true)
}

/// `<id>/layer.tar` directories with a sibling `json`
fn unpack_legacy_layers(repo: &Repository, tempdir: &Path, up: &mut Unpacked) -> KilnResult<()> {
    let mut ids: HashMap<String, String> = HashMap::new();
    let mut legacy_parents: Vec<(String, String)> = Vec::new();

    for dir in sorted_entries(tempdir)? {
        let layer_file = dir.join(LEGACY_LAYER_FILE);
        if !dir.is_dir() || !layer_file.is_file() {
            continue;
        }

        let json_path = dir.join(LEGACY_JSON_FILE);
        let content = fs::read(&json_path)
            .map_err(|e| KilnError::io(format!("reading {}", json_path.display()), e))?;
        let meta: LegacyLayerJson = serde_json::from_slice(&content)?;
        let id = Digest::parse(&meta.id)?.hex().to_string();

        let key = archive_key(tempdir, &layer_file);
        if !meta.parent.is_empty() {
            let parent = Digest::parse(&meta.parent)?.hex().to_string();
            legacy_parents.push((key.clone(), parent));
        }

        let layer = import_layer_file(repo, &layer_file)?;
        debug!("Imported archive layer {} as {}", id, layer.id());
        ids.insert(id, key.clone());
        up.layers.insert(key, layer);
    }

    for (child, parent_id) in legacy_parents {
        if let Some(parent) = ids.get(&parent_id) {
            up.parents.insert(child, parent.clone());
        }
    }
    Ok(())
}

/// Layers named only in the manifest, parented by their order
fn unpack_manifest_layers(
    repo: &Repository,
    tempdir: &Path,
    manifest: &[ManifestEntry],
    up: &mut Unpacked,
) -> KilnResult<()> {
    for entry in manifest {
        for (i, key) in entry.layers.iter().enumerate() {
            if !up.layers.contains_key(key) {
                let path = contained(tempdir, key)?;
                let layer = import_layer_file(repo, &path)?;
                up.layers.insert(key.clone(), layer);
            }
            if i > 0 && !up.parents.contains_key(key) {
                up.parents.insert(key.clone(), entry.layers[i - 1].clone());
            }
        }

        if let (Some(top), Some(tags)) = (entry.layers.last(), &entry.repo_tags) {
            if let Some(layer) = up.layers.get(top) {
                up.tags
                    .entry(layer.id().to_string())
                    .or_default()
                    .extend(tags.iter().cloned());
            }
        }
    }
    Ok(())
}

/// Image configs: from the manifest when present, else every top-level json
fn read_images(tempdir: &Path, manifest: &[ManifestEntry], up: &mut Unpacked) -> KilnResult<()> {
    let paths = if manifest.is_empty() {
        sorted_entries(tempdir)?
            .into_iter()
            .filter(|p| {
                p.is_file()
                    && p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name().is_some_and(|n| n != MANIFEST_FILE)
            })
            .collect()
    } else {
        manifest
            .iter()
            .filter(|entry| !entry.config.is_empty())
            .map(|entry| contained(tempdir, &entry.config))
            .collect::<KilnResult<Vec<_>>>()?
    };

    for path in paths {
        let content = fs::read(&path)
            .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
        up.images.push(serde_json::from_slice(&content)?);
    }
    Ok(())
}

fn construct_images(repo: &Repository, up: Unpacked) -> KilnResult<Vec<Layer>> {
    let mut linked: HashMap<String, Layer> = HashMap::new();
    let mut keys: Vec<&String> = up.layers.keys().collect();
    keys.sort();
    for key in keys {
        link(repo, key, &up, &mut linked, &mut Vec::new())?;
    }

    let by_id: HashMap<String, Layer> = linked
        .into_values()
        .map(|layer| (layer.id().to_string(), layer))
        .collect();

    let mut tops = Vec::new();
    for img in &up.images {
        let top_diff = img
            .rootfs
            .as_ref()
            .and_then(|rootfs| rootfs.diff_ids.last())
            .ok_or(KilnError::TopLayerMissing)?;
        let top_id = Digest::parse(top_diff)?.hex().to_string();
        let top = by_id.get(&top_id).ok_or(KilnError::TopLayerMissing)?;

        let config = ImageConfig::from(img);
        top.save_config(&config)?;
        for ancestor in top.ancestors().skip(1) {
            if ancestor.config()?.is_some() {
                break;
            }
            ancestor.save_config(&config)?;
        }

        if let Some(tags) = up.tags.get(&top_id) {
            for tag in tags {
                repo.add_tag(tag, top)?;
            }
        }

        tops.push(top.clone());
    }

    Ok(tops)
}

/// Link `key` under its archive parent, linking the parent first
fn link(
    repo: &Repository,
    key: &str,
    up: &Unpacked,
    linked: &mut HashMap<String, Layer>,
    visiting: &mut Vec<String>,
) -> KilnResult<Layer> {
    if let Some(layer) = linked.get(key) {
        return Ok(layer.clone());
    }
    if visiting.iter().any(|k| k == key) {
        return Err(KilnError::InvalidLayer(format!(
            "archive parent links form a cycle at {}",
            key
        )));
    }

    let layer = up
        .layers
        .get(key)
        .ok_or_else(|| KilnError::InvalidLayer(format!("{} is not in the archive", key)))?;

    visiting.push(key.to_string());
    let parent = match up.parents.get(key) {
        Some(parent_key) => Some(link(repo, parent_key, up, linked, visiting)?),
        None => None,
    };
    visiting.pop();

    if parent.as_ref().is_some_and(|p| p.ancestors().any(|a| a.id() == layer.id())) {
        return Err(KilnError::DuplicateLayerDigest(layer.id().to_string()));
    }

    let layer = layer.with_parent(parent)?;
    layer.save_parent()?;
    repo.add_layer(&layer, true)?;
    linked.insert(key.to_string(), layer.clone());
    Ok(layer)
}

fn archive_key(tempdir: &Path, path: &Path) -> String {
    path.strip_prefix(tempdir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Resolve an archive-relative path, refusing anything that leaves the archive
fn contained(tempdir: &Path, rel: &str) -> KilnResult<std::path::PathBuf> {
    let rel_path = Path::new(rel);
    let escapes = rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(KilnError::ImageCannotBeComposed(format!(
            "archive path {:?} escapes the archive",
            rel
        )));
    }
    Ok(tempdir.join(rel_path))
}
