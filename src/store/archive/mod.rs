//! Image archive import and export
//!
//! Exporters walk a layer chain root first, packing each layer and carrying
//! the chain id forward. They stream: the tar writer runs on the blocking
//! pool and feeds an in-memory duplex pipe, so readers see bytes before the
//! chain is finished.

pub mod docker;
pub mod oci;

pub use docker::DockerArchive;
pub use oci::OciArchive;

use super::digest::{chain_id, Digest};
use super::layer::Layer;
use super::repository::Repository;
use crate::error::{KilnError, KilnResult};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::warn;

/// Bytes buffered between the archive writer and its reader
const PIPE_CAPACITY: usize = 256 * 1024;

/// Converts an archive stream into repository layers
pub trait Importer: Send + Sync {
    /// Returns the top layer of every image found in the archive
    fn import(&self, repo: &Repository, reader: Box<dyn Read + Send>) -> KilnResult<Vec<Layer>>;
}

/// Produces an archive stream from a layer chain
pub trait Exporter: Send + Sync {
    fn export(
        &self,
        repo: &Repository,
        layer: &Layer,
        tags: &[String],
    ) -> KilnResult<ExportStream>;
}

/// The read end of an archive that is still being written
///
/// Must be created inside a tokio runtime. A failure of the writer is
/// reported by [`ExportStream::copy_to`] instead of a silently short archive.
pub struct ExportStream {
    reader: DuplexStream,
    producer: JoinHandle<KilnResult<()>>,
}

impl ExportStream {
    /// Copy the whole archive into `writer`; returns the byte count
    pub async fn copy_to<W: AsyncWrite + Unpin>(self, writer: &mut W) -> KilnResult<u64> {
        let Self { mut reader, producer } = self;
        let copied = tokio::io::copy(&mut reader, writer).await;
        // unblocks a writer still waiting on a full pipe
        drop(reader);

        let produced = producer
            .await
            .map_err(|e| KilnError::Internal(format!("archive writer failed: {}", e)))?;
        let bytes = copied.map_err(|e| KilnError::io("copying archive stream", e))?;
        produced?;
        Ok(bytes)
    }

    pub async fn into_bytes(self) -> KilnResult<Vec<u8>> {
        let mut out = Vec::new();
        self.copy_to(&mut out).await?;
        Ok(out)
    }
}

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    #[default]
    Docker,
    Oci,
}

impl ArchiveFormat {
    pub fn exporter(&self) -> Box<dyn Exporter> {
        match self {
            Self::Docker => Box::new(DockerArchive),
            Self::Oci => Box::new(OciArchive),
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = KilnError;

    fn from_str(s: &str) -> KilnResult<Self> {
        match s {
            "" | "docker" => Ok(Self::Docker),
            "oci" => Ok(Self::Oci),
            other => Err(KilnError::script(
                "save",
                format!("unknown image kind {:?}; use docker or oci", other),
            )),
        }
    }
}

/// One layer after packing
pub(crate) struct PackedLayer {
    pub chain_id: Digest,
    pub diff_id: Digest,
    pub file: File,
    pub size: u64,
    path: PathBuf,
}

impl Drop for PackedLayer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Pack a layer into a scratch file and derive its chain id
pub(crate) fn calc_layer(
    repo: &Repository,
    parent: Option<&Digest>,
    layer: &Layer,
) -> KilnResult<PackedLayer> {
    let (mut file, path) = repo.temp_file()?;
    let packed = (|| {
        let diff_id = layer.pack(&mut file)?;
        let size = file
            .seek(SeekFrom::End(0))
            .and_then(|size| file.seek(SeekFrom::Start(0)).map(|_| size))
            .map_err(|e| KilnError::io(format!("rewinding pack of {}", layer.id()), e))?;
        Ok((diff_id, size))
    })();

    let (diff_id, size) = match packed {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
    };

    Ok(PackedLayer {
        chain_id: chain_id(parent, &diff_id),
        diff_id,
        file,
        size,
        path,
    })
}

/// Layers of the chain ending at `top`, root first
pub(crate) fn chain_root_first(top: &Layer) -> Vec<Layer> {
    let mut layers: Vec<Layer> = top.ancestors().cloned().collect();
    layers.reverse();
    layers
}

/// Result of walking a chain
pub(crate) struct ChainWalk {
    pub chain_ids: Vec<Digest>,
    pub diff_ids: Vec<Digest>,
    pub sizes: Vec<u64>,
}

/// Walk `top`'s chain root first, packing each layer and handing it to `emit`
pub(crate) fn run_chain(
    repo: &Repository,
    top: &Layer,
    mut emit: impl FnMut(Option<&Digest>, &Layer, &mut PackedLayer) -> KilnResult<()>,
) -> KilnResult<ChainWalk> {
    let mut walk = ChainWalk {
        chain_ids: Vec::new(),
        diff_ids: Vec::new(),
        sizes: Vec::new(),
    };

    let mut parent: Option<Digest> = None;
    for layer in chain_root_first(top) {
        let mut packed = calc_layer(repo, parent.as_ref(), &layer)?;
        emit(parent.as_ref(), &layer, &mut packed)?;
        walk.chain_ids.push(packed.chain_id.clone());
        walk.diff_ids.push(packed.diff_id.clone());
        walk.sizes.push(packed.size);
        parent = Some(packed.chain_id.clone());
    }

    Ok(walk)
}

/// Chain ids for a layer chain, root first, without writing an archive
pub fn chain_ids(repo: &Repository, top: &Layer) -> KilnResult<Vec<Digest>> {
    Ok(run_chain(repo, top, |_, _, _| Ok(()))?.chain_ids)
}

/// Run an archive writer on the blocking pool and return the read end
pub(crate) fn stream_archive(
    name: &'static str,
    produce: impl FnOnce(&mut tar::Builder<&mut SyncIoBridge<DuplexStream>>) -> KilnResult<()>
        + Send
        + 'static,
) -> ExportStream {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let mut writer = SyncIoBridge::new(writer);

    let producer = tokio::task::spawn_blocking(move || {
        let result = {
            let mut builder = tar::Builder::new(&mut writer);
            produce(&mut builder).and_then(|_| {
                builder
                    .finish()
                    .map_err(|e| KilnError::io("finishing archive", e))
            })
        };
        let result = result.and_then(|_| {
            writer
                .flush()
                .map_err(|e| KilnError::io("flushing archive", e))
        });
        if let Err(e) = &result {
            warn!("{} export failed: {}", name, e);
        }
        result
    });

    ExportStream { reader, producer }
}

/// Append an in-memory file to an archive
pub(crate) fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    content: &[u8],
) -> KilnResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o600);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder
        .append_data(&mut header, name, content)
        .map_err(|e| KilnError::ImageCannotBeComposed(format!("cannot add {}: {}", name, e)))
}

/// Append a directory entry to an archive
pub(crate) fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> KilnResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o700);
    header.set_entry_type(tar::EntryType::Directory);
    header.set_cksum();
    builder
        .append_data(&mut header, name, std::io::empty())
        .map_err(|e| KilnError::ImageCannotBeComposed(format!("cannot add directory {}: {}", name, e)))
}

/// Append a packed layer file to an archive
pub(crate) fn append_packed<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    packed: &mut PackedLayer,
) -> KilnResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(packed.size);
    header.set_mode(0o600);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder
        .append_data(&mut header, name, &mut packed.file)
        .map_err(|e| KilnError::ImageCannotBeComposed(format!("cannot add {}: {}", name, e)))
}

/// Write a whole export stream into a file
pub async fn write_to_file(stream: ExportStream, path: &Path) -> KilnResult<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| KilnError::io(format!("creating {}", path.display()), e))?;
    let written = stream.copy_to(&mut file).await?;
    file.flush()
        .await
        .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;
    Ok(written)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::store::image_config::ImageConfig;

    /// A tiny single-file tar
    pub fn layer_tar(name: &str, body: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, body.as_bytes())
            .unwrap();
        builder.into_inner().unwrap()
    }

    /// A chain of virtual layers, root first, with a config on the top
    pub fn chain(repo: &Repository, bodies: &[&str]) -> Layer {
        let mut parent = None;
        for (i, body) in bodies.iter().enumerate() {
            let tar = layer_tar(&format!("file{}", i), body);
            let layer = repo
                .create_layer_from_asset(&tar[..], parent.clone(), true)
                .unwrap();
            layer.save_parent().unwrap();
            parent = Some(layer);
        }
        let top = parent.unwrap();
        top.save_config(&ImageConfig {
            user: "root".into(),
            cmd: vec!["/bin/sh".into()],
            working_dir: "/".into(),
            ..Default::default()
        })
        .unwrap();
        top
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn chain_ids_are_root_first_and_cumulative() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), true).unwrap();
        let top = testutil::chain(&repo, &["a", "b", "c"]);

        let ids = chain_ids(&repo, &top).unwrap();
        assert_eq!(ids.len(), 3);

        let layers = chain_root_first(&top);
        let root_diff = layers[0].digest().unwrap();
        assert_eq!(ids[0], root_diff);
        let second_diff = layers[1].digest().unwrap();
        assert_eq!(ids[1], chain_id(Some(&ids[0]), &second_diff));
    }

    #[tokio::test]
    async fn stream_larger_than_pipe_arrives_whole() {
        let body = vec![7u8; PIPE_CAPACITY * 3];
        let expected = body.clone();
        let stream = stream_archive("test", move |builder| {
            append_dir(builder, "data")?;
            append_bytes(builder, "data/big", &body)
        });

        let bytes = stream.into_bytes().await.unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
            if entry.header().entry_type().is_file() {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                assert_eq!(content, expected);
            }
        }
        assert_eq!(names.len(), 2);
        assert_eq!(names[1], "data/big");
    }

    #[tokio::test]
    async fn writer_failure_is_reported_to_reader() {
        let stream = stream_archive("test", |builder| {
            append_bytes(builder, "first", b"ok")?;
            Err(KilnError::TopLayerMissing)
        });
        let err = stream.into_bytes().await.unwrap_err();
        assert!(matches!(err, KilnError::TopLayerMissing));
    }

    #[tokio::test]
    async fn file_export_counts_bytes() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path().join("store"), true).unwrap();
        let top = testutil::chain(&repo, &["a", "b"]);
        let out = temp.path().join("out.tar");

        let stream = repo.export(&DockerArchive, &top, &[]).unwrap();
        let written = write_to_file(stream, &out).await.unwrap();
        assert!(written > 0);
        assert_eq!(fs::metadata(&out).unwrap().len(), written);
    }

    #[test]
    fn format_parsing() {
        assert_eq!("".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Docker);
        assert_eq!("oci".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Oci);
        assert!("zip".parse::<ArchiveFormat>().is_err());
    }
}
