//! Overlay mounts

use crate::error::{KilnError, KilnResult};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One overlay mount: a writable upper dir over read-only lower dirs
#[derive(Debug, Clone)]
pub struct Mount {
    target: PathBuf,
    upper: PathBuf,
    /// Colon-separated, nearest parent first
    lower: String,
    work: PathBuf,
    mounted: bool,
}

impl PartialEq for Mount {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
            && self.upper == other.upper
            && self.lower == other.lower
            && self.work == other.work
    }
}

#[cfg(target_os = "linux")]
fn overlay(target: &Path, options: &str) -> io::Result<()> {
    use nix::mount::{mount, MsFlags};
    mount(Some("overlay"), target, Some("overlay"), MsFlags::empty(), Some(options))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> io::Result<()> {
    use nix::mount::{umount2, MntFlags};
    umount2(target, MntFlags::empty())?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn overlay(_target: &Path, _options: &str) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "overlay mounts need Linux"))
}

#[cfg(not(target_os = "linux"))]
fn unmount(_target: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "overlay mounts need Linux"))
}

/// A directory on a different device than its parent is a mount point
fn is_mount_point(path: &Path) -> io::Result<bool> {
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    Ok(fs::metadata(path)?.dev() != fs::metadata(parent)?.dev())
}

/// Unmount by path if something is mounted there, then remove the mount point
///
/// Used when the in-memory mount handle was lost, e.g. after a crash or a
/// mount that failed halfway.
pub fn force_unmount(target: &Path) -> KilnResult<()> {
    let mounted = match is_mount_point(target) {
        Ok(mounted) => mounted,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(KilnError::io(format!("inspecting {}", target.display()), e)),
    };
    if mounted {
        unmount(target).map_err(|e| KilnError::UnmountFailed(format!("{}: {}", target.display(), e)))?;
    }
    fs::remove_dir_all(target)
        .map_err(|e| KilnError::io(format!("removing mount point {}", target.display()), e))
}

impl Mount {
    pub(crate) fn new(target: PathBuf, lower: String, upper: PathBuf, work: PathBuf) -> Self {
        Self {
            target,
            upper,
            lower,
            work,
            mounted: false,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn upper(&self) -> &Path {
        &self.upper
    }

    pub fn lower(&self) -> &str {
        &self.lower
    }

    pub fn work(&self) -> &Path {
        &self.work
    }

    pub fn mounted(&self) -> bool {
        self.mounted
    }

    /// Overlay option string for mount(2)
    pub fn options(&self) -> KilnResult<String> {
        if self.lower.is_empty() {
            return Err(KilnError::MountCannotProceed(
                "no lower dir specified (only one layer?)".to_string(),
            ));
        }

        Ok(format!(
            "upperdir={},lowerdir={},workdir={}",
            self.upper.display(),
            self.lower,
            self.work.display()
        ))
    }

    /// Mount the overlay at the target
    pub fn open(&mut self) -> KilnResult<()> {
        let options = self.options()?;
        debug!("Mounting overlay at {}", self.target.display());
        overlay(&self.target, &options)
            .map_err(|e| KilnError::MountFailed(format!("{}: {}", self.target.display(), e)))?;
        self.mounted = true;
        Ok(())
    }

    /// Drop the work directory of a mount that never opened
    pub(crate) fn discard(&self) {
        if let Err(e) = fs::remove_dir_all(&self.work) {
            debug!("Could not remove work dir {}: {}", self.work.display(), e);
        }
    }

    /// Unmount and remove the work directory; layer content is untouched
    pub fn close(&mut self) -> KilnResult<()> {
        unmount(&self.target)
            .map_err(|e| KilnError::UnmountFailed(format!("{}: {}", self.target.display(), e)))?;
        fs::remove_dir_all(&self.work)
            .map_err(|e| KilnError::io(format!("removing work dir {}", self.work.display()), e))?;
        self.mounted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(lower: &str) -> Mount {
        Mount::new(
            PathBuf::from("/r/mount/top"),
            lower.to_string(),
            PathBuf::from("/r/layers/top/rootfs"),
            PathBuf::from("/r/tmp/w"),
        )
    }

    #[test]
    fn options_format() {
        let m = mount("/r/layers/mid/rootfs:/r/layers/root/rootfs");
        assert_eq!(
            m.options().unwrap(),
            "upperdir=/r/layers/top/rootfs,lowerdir=/r/layers/mid/rootfs:/r/layers/root/rootfs,workdir=/r/tmp/w"
        );
    }

    #[test]
    fn options_require_lower() {
        assert!(matches!(
            mount("").options(),
            Err(KilnError::MountCannotProceed(_))
        ));
    }

    #[test]
    fn force_unmount_removes_stale_mount_point() {
        let temp = tempfile::TempDir::new().unwrap();
        let target = temp.path().join("mount/top");
        fs::create_dir_all(target.join("leftover")).unwrap();

        force_unmount(&target).unwrap();
        assert!(!target.exists());
        // nothing left to clean up is fine too
        force_unmount(&target).unwrap();
    }

    #[test]
    fn equality_ignores_mounted_flag() {
        let mut a = mount("x");
        let b = mount("x");
        a.mounted = true;
        assert_eq!(a, b);
        assert_ne!(a, mount("y"));
    }
}
