//! Name to layer tags, one file per tag under `tags/`

use super::layer::Layer;
use super::repository::Repository;
use super::{mkdir_all, TAGS_BASE};
use crate::error::{KilnError, KilnResult};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

/// Tags may contain '/' (registry paths), so file names are escaped
fn encode_tag(name: &str) -> String {
    name.replace('%', "%25").replace('/', "%2F")
}

fn decode_tag(file_name: &str) -> String {
    file_name.replace("%2F", "/").replace("%25", "%")
}

impl Repository {
    fn tag_file_for(&self, name: &str) -> KilnResult<PathBuf> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(KilnError::PathInvalid {
                path: PathBuf::from(name),
                reason: "not a valid tag name".to_string(),
            });
        }
        Ok(self.base_dir().join(TAGS_BASE).join(encode_tag(name)))
    }

    /// Point `name` at `layer`, replacing any previous binding atomically
    pub fn add_tag(&self, name: &str, layer: &Layer) -> KilnResult<()> {
        let tag_file = self.tag_file_for(name)?;
        let (mut file, tmp_path) = self.temp_file()?;
        let written = file
            .write_all(layer.id().as_bytes())
            .and_then(|_| file.sync_all());
        drop(file);

        let result = written
            .map_err(|e| KilnError::io(format!("writing tag {}", name), e))
            .and_then(|_| {
                let tags_dir = self.base_dir().join(TAGS_BASE);
                mkdir_all(&tags_dir)
                    .map_err(|e| KilnError::io(format!("creating {}", tags_dir.display()), e))?;
                self.locked(|| {
                    fs::rename(&tmp_path, &tag_file)
                        .map_err(|e| KilnError::io(format!("saving tag {}", name), e))
                })
            });

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    pub fn remove_tag(&self, name: &str) -> KilnResult<()> {
        let tag_file = self.tag_file_for(name)?;
        self.locked(|| match fs::remove_file(&tag_file) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(KilnError::TagDoesNotExist(format!("cannot remove {}", name)))
            }
            other => other.map_err(|e| KilnError::io(format!("removing tag {}", name), e)),
        })
    }

    /// Layer bound to `name`; its parent chain is not restored
    pub fn get_tag(&self, name: &str) -> KilnResult<Layer> {
        let id = match fs::read_to_string(self.tag_file_for(name)?) {
            Ok(id) => id,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KilnError::TagDoesNotExist(format!("{}: file not found", name)))
            }
            Err(e) => return Err(KilnError::io(format!("reading tag {}", name), e)),
        };

        let layer = self.new_layer(&id, None)?;
        if !layer.exists() {
            return Err(KilnError::TagDoesNotExist(format!(
                "{}: referenced layer does not exist",
                name
            )));
        }
        Ok(layer)
    }

    /// All tag names, sorted
    pub fn tags(&self) -> KilnResult<Vec<String>> {
        let dir = self.base_dir().join(TAGS_BASE);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KilnError::io(format!("listing {}", dir.display()), e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| KilnError::io(format!("listing {}", dir.display()), e))?;
            names.push(decode_tag(&entry.file_name().to_string_lossy()));
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tag_round_trip() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), false).unwrap();
        let layer = repo.create_layer("abc", None).unwrap();

        repo.add_tag("latest", &layer).unwrap();
        assert_eq!(repo.get_tag("latest").unwrap().id(), "abc");
        assert_eq!(repo.tags().unwrap(), vec!["latest"]);

        repo.remove_tag("latest").unwrap();
        assert!(matches!(
            repo.get_tag("latest"),
            Err(KilnError::TagDoesNotExist(_))
        ));
    }

    #[test]
    fn remove_missing_tag() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), false).unwrap();
        assert!(matches!(
            repo.remove_tag("nope"),
            Err(KilnError::TagDoesNotExist(_))
        ));
    }

    #[test]
    fn tag_to_removed_layer_errors() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), false).unwrap();
        let layer = repo.create_layer("abc", None).unwrap();
        repo.add_tag("t", &layer).unwrap();
        layer.remove().unwrap();
        assert!(matches!(repo.get_tag("t"), Err(KilnError::TagDoesNotExist(_))));
    }

    #[test]
    fn retag_replaces_binding() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), false).unwrap();
        let a = repo.create_layer("a", None).unwrap();
        let b = repo.create_layer("b", None).unwrap();
        repo.add_tag("t", &a).unwrap();
        repo.add_tag("t", &b).unwrap();
        assert_eq!(repo.get_tag("t").unwrap().id(), "b");
    }

    #[test]
    fn registry_paths_stay_inside_tags_dir() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), false).unwrap();
        let a = repo.create_layer("a", None).unwrap();
        repo.add_tag("docker.io/library/alpine:3", &a).unwrap();
        repo.add_tag("../escape", &a).unwrap();

        assert_eq!(
            repo.tags().unwrap(),
            vec!["../escape", "docker.io/library/alpine:3"]
        );
        assert!(!temp.path().join("escape").exists());
        assert!(repo.add_tag("..", &a).is_err());
    }
}
