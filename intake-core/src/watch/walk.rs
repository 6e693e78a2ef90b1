use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::DiscoveryError;
use crate::recovery::MARKER_SUFFIX;
use crate::sidecar::SIDECAR_SUFFIX;

/// One item produced by a depth-first walk of a watched tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeItem {
    Directory(PathBuf),
    File(PathBuf),
}

/// Lazily walk `root` depth-first, yielding each directory before its
/// contents. Symlinks are not followed and anything that is neither a
/// directory nor a regular file is skipped.
///
/// The iterator is restartable per subtree: walking a child directory again
/// yields exactly that subtree.
pub fn walk_tree(root: &Path) -> impl Iterator<Item = Result<TreeItem, DiscoveryError>> + use<> {
    let root = root.to_path_buf();
    WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_map(move |item| match item {
            Ok(dent) => {
                let file_type = dent.file_type();
                if file_type.is_dir() {
                    Some(Ok(TreeItem::Directory(dent.into_path())))
                } else if file_type.is_file() {
                    Some(Ok(TreeItem::File(dent.into_path())))
                } else {
                    None
                }
            }
            Err(source) => {
                let path = source
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.clone());
                Some(Err(DiscoveryError::Walk { path, source }))
            }
        })
}

/// Whether a regular file should become a registry entry. Diagnostic
/// sidecars and recovery markers are bookkeeping, never input.
pub fn is_candidate_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        // Non UTF-8 names cannot carry our suffixes.
        return path.file_name().is_some();
    };
    !name.ends_with(SIDECAR_SUFFIX) && !name.ends_with(MARKER_SUFFIX)
}
