//! Source tree snapshot: scanning and classification.

use std::path::{Path, PathBuf};

use kiln_common::path::{has_extension, normalize};
use walkdir::WalkDir;

use crate::error::BuildError;

/// Files discovered in one build, relative to the source directory.
///
/// Rebuilt every build and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
    /// Files carrying the module extension, sorted.
    pub modules: Vec<PathBuf>,
    /// Every other file, sorted. Copied to the destination unchanged.
    pub passthrough: Vec<PathBuf>,
}

impl SourceTree {
    /// Enumerates `root` once and partitions its files by extension.
    ///
    /// Symbolic links are followed. Directories listed in `exclude` (for
    /// example a cache directory nested inside the source tree) are skipped.
    /// Relative paths in either argument are taken from the working
    /// directory, so a relative exclusion matches however `root` is spelled.
    pub fn scan(root: &Path, extension: &str, exclude: &[PathBuf]) -> Result<Self, BuildError> {
        let base = absolute(root).map_err(|source| BuildError::Scan {
            path: root.to_path_buf(),
            source,
        })?;
        let root = base.as_path();
        let exclude: Vec<PathBuf> = exclude.iter().filter_map(|p| absolute(p).ok()).collect();
        let mut tree = SourceTree::default();

        let walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !exclude.iter().any(|x| e.path() == x));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(path) = dangling_link(&err) {
                        tree.add_dangling(root, &path, extension);
                        continue;
                    }
                    return Err(BuildError::Scan {
                        path: err.path().unwrap_or(root).to_path_buf(),
                        source: err.into(),
                    });
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            if has_extension(relative, extension) {
                tree.modules.push(relative.to_path_buf());
            } else {
                tree.passthrough.push(relative.to_path_buf());
            }
        }

        tree.modules.sort();
        tree.passthrough.sort();
        tracing::debug!(
            root = %root.display(),
            modules = tree.modules.len(),
            passthrough = tree.passthrough.len(),
            "scanned source tree"
        );
        Ok(tree)
    }

    /// A link whose target is gone. As a module it is kept, so that it
    /// fails on its own when hashed; as anything else there are no bytes to
    /// pass through.
    fn add_dangling(&mut self, root: &Path, path: &Path, extension: &str) {
        let Ok(relative) = path.strip_prefix(root) else {
            return;
        };
        if has_extension(relative, extension) {
            self.modules.push(relative.to_path_buf());
        } else {
            tracing::warn!(path = %path.display(), "skipping dangling link");
        }
    }
}

/// Resolves `path` against the working directory and folds `.` and `..`.
pub(crate) fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    std::path::absolute(path).map(|p| normalize(&p))
}

/// Returns the path of the entry if `err` was raised for a broken link.
fn dangling_link(err: &walkdir::Error) -> Option<PathBuf> {
    let path = err.path()?;
    let is_link = std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink());
    (is_link && !path.exists()).then(|| path.to_path_buf())
}
