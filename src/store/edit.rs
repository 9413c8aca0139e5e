//! Selective chain reconstruction for flatten and skip

use super::digest::Digest;
use super::layer::Layer;
use crate::error::{KilnError, KilnResult};
use std::collections::HashSet;

/// Rebuild the chain ending at `top` keeping only layers listed in `retained`
///
/// Order is preserved and parents are relinked over the dropped layers.
/// Returns the edited chain tip first; the last entry is the new root.
pub fn edit_chain(top: &Layer, retained: &[Digest]) -> KilnResult<Vec<Layer>> {
    let keep: HashSet<&str> = retained.iter().map(Digest::hex).collect();
    let mut seen = HashSet::new();
    let mut kept = Vec::new();

    for layer in top.ancestors() {
        if !seen.insert(layer.id()) {
            return Err(KilnError::DuplicateLayerDigest(layer.id().to_string()));
        }
        if keep.contains(layer.id()) {
            kept.push(layer.clone());
        }
    }

    if kept.is_empty() {
        return Err(KilnError::EmptyLayerEdit);
    }

    let mut parent: Option<Layer> = None;
    let mut edited = Vec::with_capacity(kept.len());
    for layer in kept.into_iter().rev() {
        let relinked = layer.with_parent(parent)?;
        edited.push(relinked.clone());
        parent = Some(relinked);
    }
    edited.reverse();
    Ok(edited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::archive::testutil::chain;
    use crate::store::Repository;
    use tempfile::TempDir;

    fn digests(top: &Layer) -> Vec<Digest> {
        top.ancestors()
            .map(|l| Digest::parse(l.id()).unwrap())
            .collect()
    }

    #[test]
    fn drops_skipped_layers_in_order() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), true).unwrap();
        let top = chain(&repo, &["1", "2", "3", "4", "5"]);
        let all = digests(&top);

        // keep tip, middle and root; skip the other two
        let retained = vec![all[0].clone(), all[2].clone(), all[4].clone()];
        let edited = edit_chain(&top, &retained).unwrap();

        assert_eq!(edited.len(), 3);
        let ids: Vec<&str> = edited[0].ancestors().map(|l| l.id()).collect();
        assert_eq!(ids, vec![all[0].hex(), all[2].hex(), all[4].hex()]);
        assert!(edited[2].parent().is_none());
    }

    #[test]
    fn skipping_everything_is_an_error() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), true).unwrap();
        let top = chain(&repo, &["1", "2"]);
        assert!(matches!(
            edit_chain(&top, &[]),
            Err(KilnError::EmptyLayerEdit)
        ));
    }

    #[test]
    fn duplicate_digest_is_flagged() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new(temp.path(), true).unwrap();
        let root = repo.create_layer("aa", None).unwrap();
        let mid = repo.create_layer("bb", Some(root.clone())).unwrap();
        // build a chain that names "aa" twice without going through with_parent
        let top = Layer::new(&repo, "aa", Some(mid));
        let err = edit_chain(&top, &[]).unwrap_err();
        assert!(matches!(err, KilnError::DuplicateLayerDigest(_)));
    }
}
