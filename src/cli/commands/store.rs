//! Store command - export, import and list tagged images

use super::Context;
use crate::cli::args::{StoreAction, StoreArgs};
use crate::error::{KilnError, KilnResult};
use crate::store::archive::{write_to_file, ArchiveFormat, DockerArchive};
use crate::store::Repository;
use crate::ui::{self, TaskSpinner};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Execute the store command
pub async fn execute(args: StoreArgs, ctx: &Context) -> KilnResult<()> {
    let base = ctx.config.store_dir();

    match args.action {
        StoreAction::Export { tag, out, format } => {
            let mut spinner = TaskSpinner::new(&ctx.ui);
            spinner.start(&format!("Exporting {}...", tag));
            let written = export(base, tag, &out, format.into()).await;
            match written {
                Ok(bytes) => spinner.stop(&format!("Wrote {} bytes", bytes)),
                Err(e) => {
                    spinner.stop_error("Export failed");
                    return Err(e);
                }
            }
        }
        StoreAction::Import { file, tag } => {
            let ids = blocking(move || import(&base, &file, tag.as_deref())).await?;
            for id in ids {
                println!("{}", id);
            }
        }
        StoreAction::Tags => {
            let tags = blocking(move || open(&base)?.tags()).await?;
            if tags.is_empty() {
                ui::remark(&ctx.ui, "No tags in store");
            }
            for tag in tags {
                println!("{}", tag);
            }
        }
    }
    Ok(())
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> KilnResult<T> + Send + 'static) -> KilnResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::Internal(format!("store task failed: {}", e)))?
}

/// Layers are kept as tars; the CLI never mounts
fn open(base: &Path) -> KilnResult<Repository> {
    Repository::new(base, true)
}

async fn export(base: PathBuf, tag: String, out: &Path, format: ArchiveFormat) -> KilnResult<u64> {
    let stream = blocking(move || {
        let repo = open(&base)?;
        let top = repo.get_tag(&tag)?.restore_parent()?;
        repo.export(format.exporter().as_ref(), &top, &[tag])
    })
    .await?;
    write_to_file(stream, out).await
}

fn import(base: &Path, file: &Path, tag: Option<&str>) -> KilnResult<Vec<String>> {
    let repo = open(base)?;
    let reader = File::open(file).map_err(|e| KilnError::io(format!("opening {}", file.display()), e))?;
    let tops = repo.import(&DockerArchive, Box::new(reader))?;

    if let Some(tag) = tag {
        let top = tops
            .first()
            .ok_or_else(|| KilnError::InvalidAsset(format!("{} holds no images", file.display())))?;
        repo.add_tag(tag, top)?;
    }
    Ok(tops.iter().map(|layer| layer.id().to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::archive::testutil::chain;
    use tempfile::TempDir;

    #[tokio::test]
    async fn export_then_import_into_another_store() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let repo = open(&source).unwrap();
        let top = chain(&repo, &["base", "app"]);
        repo.add_tag("web", &top).unwrap();

        let archive = temp.path().join("web.tar");
        let written = export(source.clone(), "web".to_string(), &archive, ArchiveFormat::Docker)
            .await
            .unwrap();
        assert!(written > 0);

        let target = temp.path().join("target");
        let ids = import(&target, &archive, Some("copy")).unwrap();
        assert_eq!(ids.len(), 1);
        // the archive's own tag comes along with the requested one
        assert_eq!(open(&target).unwrap().tags().unwrap(), ["copy", "web"]);
    }

    #[tokio::test]
    async fn export_of_missing_tag_fails() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("x.tar");
        let err = export(temp.path().to_path_buf(), "nope".to_string(), &out, ArchiveFormat::Oci)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::TagDoesNotExist(_)));
    }
}
