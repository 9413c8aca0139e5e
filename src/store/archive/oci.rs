//! OCI image layout export
//!
//! Blobs (layers, config, manifest) land under `blobs/sha256/<hex>`. Each
//! ref under `refs/` holds the manifest descriptor; one ref is written for
//! the top layer id and one per tag.

use super::{
    append_bytes, append_dir, append_packed, run_chain, stream_archive, ExportStream, Exporter,
};
use crate::error::{KilnError, KilnResult};
use crate::store::digest::Digest;
use crate::store::image_config::ImageConfig;
use crate::store::layer::Layer;
use crate::store::repository::Repository;
use serde::{Deserialize, Serialize};
use std::io::Write;

const SCHEMA_VERSION: u32 = 2;
const BLOBS_DIR: &str = "blobs/sha256";
const REFS_DIR: &str = "refs";
const LAYOUT_VERSION: &str = "1.0.0";

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Clone, Copy, Default)]
pub struct OciArchive;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Serialize)]
struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    version: &'static str,
}

impl Exporter for OciArchive {
    fn export(
        &self,
        repo: &Repository,
        layer: &Layer,
        tags: &[String],
    ) -> KilnResult<ExportStream> {
        if !layer.exists() {
            return Err(KilnError::InvalidLayer(format!(
                "layer {} does not exist",
                layer.id()
            )));
        }
        let config = layer.config()?.ok_or_else(|| {
            KilnError::ImageCannotBeComposed("missing image configuration".to_string())
        })?;

        let repo = repo.clone();
        let top = layer.clone();
        let tags = tags.to_vec();
        Ok(stream_archive("oci", move |builder| {
            write_layout(&repo, &top, &config, &tags, builder)
        }))
    }
}

fn write_json_blob<W: Write, T: Serialize>(
    builder: &mut tar::Builder<W>,
    value: &T,
) -> KilnResult<(Digest, u64)> {
    let content = serde_json::to_vec(value)?;
    let digest = Digest::from_bytes(&content);
    append_bytes(builder, &format!("{}/{}", BLOBS_DIR, digest.hex()), &content)?;
    Ok((digest, content.len() as u64))
}

fn write_layout<W: Write>(
    repo: &Repository,
    top: &Layer,
    config: &ImageConfig,
    tags: &[String],
    builder: &mut tar::Builder<W>,
) -> KilnResult<()> {
    append_dir(builder, "blobs")?;
    append_dir(builder, BLOBS_DIR)?;
    append_bytes(
        builder,
        "oci-layout",
        &serde_json::to_vec(&ImageLayout {
            version: LAYOUT_VERSION,
        })?,
    )?;

    let walk = run_chain(repo, top, |_, _, packed| {
        let name = format!("{}/{}", BLOBS_DIR, packed.diff_id.hex());
        append_packed(builder, &name, packed)
    })?;

    let layers = walk
        .diff_ids
        .iter()
        .zip(&walk.sizes)
        .map(|(diff, size)| Descriptor {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            digest: diff.clone(),
            size: *size,
        })
        .collect();

    let mut image = config.to_archive(walk.diff_ids.iter().map(|d| d.to_string()).collect());
    image.id.clear();
    image.parent.clear();
    image.container.clear();
    image.container_config = None;
    image.docker_version.clear();
    let (config_digest, config_size) = write_json_blob(builder, &image)?;

    let manifest = Manifest {
        schema_version: SCHEMA_VERSION,
        config: Descriptor {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest,
            size: config_size,
        },
        layers,
    };
    let (manifest_digest, manifest_size) = write_json_blob(builder, &manifest)?;

    let descriptor = serde_json::to_vec(&Descriptor {
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        digest: manifest_digest,
        size: manifest_size,
    })?;

    append_dir(builder, REFS_DIR)?;
    for reference in std::iter::once(top.id()).chain(tags.iter().map(String::as_str)) {
        append_bytes(builder, &format!("{}/{}", REFS_DIR, reference), &descriptor)?;
    }
    Ok(())
}
