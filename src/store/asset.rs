//! On-disk assets
//!
//! An asset binds a path to the digest of the last pack or unpack. Virtual
//! assets are single tar files hashed over their raw bytes; regular assets
//! are directories hashed over their tar serialization.

use super::check_dir;
use super::digest::{Digest, HashingReader, HashingWriter};
use crate::error::{KilnError, KilnResult};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// A path plus the digest of the bytes last moved through it
#[derive(Debug, Clone)]
pub struct Asset {
    path: PathBuf,
    digest: Digest,
    is_virtual: bool,
}

impl Asset {
    pub fn new(path: impl Into<PathBuf>, is_virtual: bool) -> Self {
        Self {
            path: path.into(),
            digest: Digest::empty(),
            is_virtual,
        }
    }

    /// Digest of the last pack or unpack
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    fn reset_digest(&mut self) {
        self.digest = Digest::empty();
    }

    fn check_virtual_file(&self) -> KilnResult<()> {
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_symlink() => Err(KilnError::InvalidAsset(format!(
                "cannot read from symlink {}",
                self.path.display()
            ))),
            Ok(meta) if meta.is_dir() => Err(KilnError::InvalidAsset(format!(
                "cannot read from dir {}",
                self.path.display()
            ))),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KilnError::io(format!("inspecting {}", self.path.display()), e)),
        }
    }

    /// Recompute the digest from what is currently on disk
    pub fn load_digest(&mut self) -> KilnResult<Digest> {
        self.pack(io::sink())
    }

    /// Materialize a tar stream at the asset path
    pub fn unpack<R: Read>(&mut self, reader: R) -> KilnResult<Digest> {
        self.reset_digest();
        let mut reader = HashingReader::new(reader);

        if self.is_virtual {
            self.check_virtual_file()?;
            let mut file = File::create(&self.path)
                .map_err(|e| KilnError::io(format!("creating {}", self.path.display()), e))?;
            io::copy(&mut reader, &mut file)
                .map_err(|e| KilnError::io(format!("writing {}", self.path.display()), e))?;
        } else {
            check_dir(&self.path, KilnError::InvalidAsset)?;
            let mut archive = tar::Archive::new(&mut reader);
            archive.set_preserve_permissions(true);
            archive.set_overwrite(true);
            archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());
            archive
                .unpack(&self.path)
                .map_err(|e| KilnError::io(format!("unpacking into {}", self.path.display()), e))?;
        }

        self.digest = reader
            .finish()
            .map_err(|e| KilnError::io("draining layer stream", e))?;
        Ok(self.digest.clone())
    }

    /// Serialize the asset into `writer`
    pub fn pack<W: Write>(&mut self, writer: W) -> KilnResult<Digest> {
        self.reset_digest();
        let mut writer = HashingWriter::new(writer);

        if self.is_virtual {
            self.check_virtual_file()?;
            let mut file = File::open(&self.path)
                .map_err(|e| KilnError::io(format!("opening {}", self.path.display()), e))?;
            io::copy(&mut file, &mut writer)
                .map_err(|e| KilnError::io(format!("reading {}", self.path.display()), e))?;
        } else {
            check_dir(&self.path, KilnError::InvalidAsset)?;
            let mut builder = tar::Builder::new(&mut writer);
            builder.follow_symlinks(false);
            append_tree(&mut builder, &self.path, Path::new(""))
                .map_err(|e| KilnError::io(format!("archiving {}", self.path.display()), e))?;
            builder
                .finish()
                .map_err(|e| KilnError::io(format!("archiving {}", self.path.display()), e))?;
        }

        let (_, digest) = writer
            .finish()
            .map_err(|e| KilnError::io("flushing layer stream", e))?;
        self.digest = digest;
        Ok(self.digest.clone())
    }
}

/// Append a directory tree in name order so equal trees give equal tars
fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
) -> io::Result<()> {
    let mut entries = fs::read_dir(root.join(rel))?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = rel.join(entry.file_name());
        builder.append_path_with_name(entry.path(), &name)?;
        if entry.file_type()?.is_dir() {
            append_tree(builder, root, &name)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tree(dir: &Path) {
        fs::create_dir_all(dir.join("etc")).unwrap();
        fs::write(dir.join("etc/hostname"), "kiln\n").unwrap();
        fs::write(dir.join("README"), "hello").unwrap();
    }

    #[test]
    fn pack_then_unpack_keeps_digest() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        write_tree(&src);

        let mut source = Asset::new(&src, false);
        let mut tarball = Vec::new();
        let packed = source.pack(&mut tarball).unwrap();
        assert_eq!(packed, Digest::from_bytes(&tarball));

        let mut dest = Asset::new(temp.path().join("dest"), false);
        let unpacked = dest.unpack(&tarball[..]).unwrap();
        assert_eq!(packed, unpacked);
        assert_eq!(
            fs::read_to_string(temp.path().join("dest/etc/hostname")).unwrap(),
            "kiln\n"
        );
    }

    #[test]
    fn identical_trees_pack_identically() {
        let temp = TempDir::new().unwrap();
        write_tree(&temp.path().join("a"));
        let mut a = Asset::new(temp.path().join("a"), false);
        let first = a.load_digest().unwrap();
        let second = a.load_digest().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn virtual_asset_digest_is_raw_bytes() {
        let temp = TempDir::new().unwrap();
        let mut asset = Asset::new(temp.path().join("layer.tar"), true);
        let digest = asset.unpack(&b"not really a tar"[..]).unwrap();
        assert_eq!(digest, Digest::from_bytes(b"not really a tar"));
        assert_eq!(asset.load_digest().unwrap(), digest);
    }

    #[test]
    fn virtual_asset_rejects_symlink() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("real");
        fs::write(&target, "x").unwrap();
        let link = temp.path().join("layer.tar");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut asset = Asset::new(&link, true);
        assert!(matches!(
            asset.pack(io::sink()),
            Err(KilnError::InvalidAsset(_))
        ));
    }

    #[test]
    fn directory_asset_rejects_symlinked_dir() {
        let temp = TempDir::new().unwrap();
        let real = temp.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = temp.path().join("rootfs");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut asset = Asset::new(&link, false);
        assert!(matches!(
            asset.unpack(&[0u8; 1024][..]),
            Err(KilnError::InvalidAsset(_))
        ));
    }
}
