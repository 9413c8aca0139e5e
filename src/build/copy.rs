//! Copy archives
//!
//! A copy packs host files into a tar whose entry names are already the
//! destination paths inside the image, so the container side only has to
//! extract at `/`. The archive's sha256 is the copy's cache key.

use crate::error::{KilnError, KilnResult};
use crate::store::digest::HashingWriter;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const DOCKERIGNORE: &str = ".dockerignore";

/// A finished copy archive; the file is removed on drop
pub struct CopyArchive {
    pub file: NamedTempFile,
    /// Hex sha256 of the archive bytes
    pub sum: String,
    pub entries: usize,
}

impl CopyArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Lexically normalize a path, dropping `.` and folding `..`
///
/// Leading `..` components on a relative path are kept.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Read ignore patterns, one per line; blanks and `#` comments are skipped
pub fn read_ignore_file(path: &Path) -> KilnResult<Vec<String>> {
    let content = fs::read_to_string(path)
        .map_err(|e| KilnError::io(format!("reading ignore file {}", path.display()), e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// `.dockerignore` in the build directory, or nothing
pub fn dockerignore(build_dir: &Path) -> KilnResult<Vec<String>> {
    let path = build_dir.join(DOCKERIGNORE);
    match fs::metadata(&path) {
        Ok(_) => read_ignore_file(&path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(KilnError::io(format!("inspecting {}", path.display()), e)),
    }
}

/// Ignore patterns in order; a `!pattern` line re-includes what an earlier
/// line excluded, and the last matching line wins
pub struct IgnoreRules {
    rules: Vec<(glob::Pattern, bool)>,
}

impl IgnoreRules {
    pub fn parse(lines: &[String]) -> KilnResult<Self> {
        let rules = lines
            .iter()
            .map(|line| {
                let (line, exception) = match line.strip_prefix('!') {
                    Some(rest) => (rest.trim(), true),
                    None => (line.as_str(), false),
                };
                let pattern = glob::Pattern::new(line.trim_start_matches('/').trim_end_matches('/'))?;
                Ok((pattern, exception))
            })
            .collect::<KilnResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    fn has_exceptions(&self) -> bool {
        self.rules.iter().any(|(_, exception)| *exception)
    }

    fn is_ignored(&self, rel: &Path) -> bool {
        let mut ignored = false;
        for (pattern, exception) in &self.rules {
            let hit = rel
                .ancestors()
                .filter(|p| !p.as_os_str().is_empty())
                .any(|p| pattern.matches_path(p));
            if hit {
                ignored = !exception;
            }
        }
        ignored
    }
}

fn is_glob(source: &str) -> bool {
    source.contains(['*', '?', '['])
}

/// `path` relative to the build directory, or an error when it leaves it
fn below_build_dir(build_dir: &Path, path: &Path) -> KilnResult<PathBuf> {
    let base = clean_path(build_dir);
    let abs = clean_path(path);
    let rel = if base == Path::new(".") {
        Some(abs.clone()).filter(|p| p.is_relative())
    } else {
        abs.strip_prefix(&base).ok().map(Path::to_path_buf)
    };

    match rel.filter(|rel| !rel.starts_with("..")) {
        Some(rel) if rel == Path::new(".") => Ok(PathBuf::new()),
        Some(rel) => Ok(rel),
        None => Err(KilnError::script(
            "copy",
            format!(
                "cannot use relative path {} because it may fall below the root build directory",
                abs.display()
            ),
        )),
    }
}

fn glob_matches(build_dir: &Path, source: &str) -> KilnResult<Vec<PathBuf>> {
    let pattern = build_dir.join(source);
    let Some(pattern) = pattern.to_str() else {
        return Ok(Vec::new());
    };
    Ok(glob::glob(pattern)?.filter_map(Result::ok).collect())
}

/// Resolve the copy source relative to the build directory and the target
/// against the effective workdir
///
/// A glob source always copies as a tree rooted at the pattern's directory,
/// however many files it matches.
pub fn resolve_paths(
    build_dir: &Path,
    source: &str,
    target: &str,
    workdir: &str,
) -> KilnResult<(String, String)> {
    let rel = below_build_dir(build_dir, &build_dir.join(source))?;
    let glob = is_glob(source);
    if glob {
        for path in glob_matches(build_dir, source)? {
            below_build_dir(build_dir, &path)?;
        }
    }

    let joined = if target == "." && !glob {
        Path::new(workdir).join(&rel)
    } else if !target.starts_with('/') {
        Path::new(workdir).join(target)
    } else {
        PathBuf::from(target)
    };

    let mut target_out = clean_path(&joined).to_string_lossy().into_owned();
    if target.ends_with('/') && !target_out.ends_with('/') {
        target_out.push('/');
    }

    let rel = if rel.as_os_str().is_empty() {
        ".".to_string()
    } else {
        rel.to_string_lossy().into_owned()
    };
    Ok((rel, target_out))
}

struct Entry {
    abs: PathBuf,
    rel: PathBuf,
}

fn walk(root: &Path, rel: &Path, rules: &IgnoreRules, out: &mut Vec<Entry>) -> io::Result<()> {
    let mut children = fs::read_dir(root.join(rel))?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let child_rel = rel.join(child.file_name());
        let is_dir = child.file_type()?.is_dir();
        if rules.is_ignored(&child_rel) {
            // an exception may still pick something out of an ignored directory
            if is_dir && rules.has_exceptions() {
                walk(root, &child_rel, rules, out)?;
            }
            continue;
        }
        out.push(Entry {
            abs: child.path(),
            rel: child_rel.clone(),
        });
        if is_dir {
            walk(root, &child_rel, rules, out)?;
        }
    }
    Ok(())
}

/// Gather the entries to copy; returns the copy root and whether the source
/// acts as a directory
fn collect(build_dir: &Path, source: &str, rules: &IgnoreRules) -> KilnResult<(PathBuf, bool, Vec<Entry>)> {
    let source_rel = below_build_dir(build_dir, &build_dir.join(source))?;
    let mut entries = Vec::new();

    if is_glob(source) {
        let root_rel = source_rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let root = build_dir.join(&root_rel);
        let matches = glob_matches(build_dir, source)?;
        if matches.is_empty() {
            return Err(KilnError::PathNotFound(build_dir.join(source)));
        }

        for path in matches {
            let rel = below_build_dir(build_dir, &path)?
                .strip_prefix(&root_rel)
                .map(Path::to_path_buf)
                .map_err(|_| {
                    KilnError::script(
                        "copy",
                        format!("path for file {} falls below copy root", path.display()),
                    )
                })?;
            if rules.is_ignored(&rel) {
                continue;
            }
            let is_dir = path.is_dir();
            entries.push(Entry { abs: path, rel: rel.clone() });
            if is_dir {
                walk(&root, &rel, rules, &mut entries)
                    .map_err(|e| KilnError::io(format!("reading {}", root.display()), e))?;
            }
        }
        return Ok((root, true, entries));
    }

    let root = build_dir.join(&source_rel);
    let meta = fs::symlink_metadata(&root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => KilnError::PathNotFound(root.clone()),
        _ => KilnError::io(format!("inspecting {}", root.display()), e),
    })?;

    if meta.is_dir() {
        walk(&root, Path::new(""), rules, &mut entries)
            .map_err(|e| KilnError::io(format!("reading {}", root.display()), e))?;
        Ok((root, true, entries))
    } else {
        let name = root
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| KilnError::PathInvalid {
                path: root.clone(),
                reason: "copy source has no file name".to_string(),
            })?;
        entries.push(Entry {
            abs: root.clone(),
            rel: name,
        });
        Ok((root, false, entries))
    }
}

/// Refuse relative symlinks that point outside the copy root
fn check_symlink(entry: &Entry) -> KilnResult<()> {
    let Ok(link) = fs::read_link(&entry.abs) else {
        return Ok(());
    };
    if link.is_absolute() {
        return Ok(());
    }

    let parent = entry.rel.parent().unwrap_or(Path::new(""));
    let resolved = clean_path(&parent.join(&link));
    if resolved.starts_with("..") {
        return Err(KilnError::PathInvalid {
            path: entry.abs.clone(),
            reason: format!("symlink to {} falls below copy root", link.display()),
        });
    }
    Ok(())
}

/// Pack `source` (relative to `build_dir`) so it lands at `target`
pub fn archive(
    build_dir: &Path,
    source: &str,
    target: &str,
    ignore: &[String],
) -> KilnResult<CopyArchive> {
    let rules = IgnoreRules::parse(ignore)?;
    let (root, is_dir, entries) = collect(build_dir, source, &rules)?;
    let target_rel = PathBuf::from(target.trim_start_matches('/'));
    let as_tree = is_dir || target.ends_with('/');

    let mut file = tempfile::Builder::new()
        .prefix("kiln-archive.")
        .tempfile()
        .map_err(|e| KilnError::io("creating copy archive", e))?;

    let count = entries.len();
    let digest = {
        let writer = HashingWriter::new(&mut file);
        let mut builder = tar::Builder::new(writer);
        builder.mode(tar::HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        let written = (|| -> KilnResult<()> {
            if is_dir && !target_rel.as_os_str().is_empty() {
                builder
                    .append_path_with_name(&root, &target_rel)
                    .map_err(|e| KilnError::io(format!("archiving {}", root.display()), e))?;
            }
            for entry in &entries {
                check_symlink(entry)?;
                let name = if as_tree {
                    target_rel.join(&entry.rel)
                } else {
                    target_rel.clone()
                };
                builder
                    .append_path_with_name(&entry.abs, &name)
                    .map_err(|e| KilnError::io(format!("archiving {}", entry.abs.display()), e))?;
            }
            Ok(())
        })();
        written?;

        let writer = builder
            .into_inner()
            .map_err(|e| KilnError::io("finishing copy archive", e))?;
        let (_, digest) = writer
            .finish()
            .map_err(|e| KilnError::io("flushing copy archive", e))?;
        digest
    };

    debug!("Archived {} entries from {} for {}", count, source, target);
    Ok(CopyArchive {
        file,
        sum: digest.hex().to_string(),
        entries: count,
    })
}
