//! Source file hashing and change detection.
//!
//! Computes content hashes for module files, aggregates them into a single
//! bundle identity, and compares them against the manifest to report which
//! modules are new, modified, deleted, or unchanged since the last build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::path::to_slash;
use kiln_common::ContentHash;

use crate::error::{BuildError, CacheError};
use crate::manifest::CacheManifest;

/// Result of comparing current module hashes against the cache manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Modules that have no entry in the manifest.
    pub new_files: Vec<PathBuf>,

    /// Modules whose content hash differs from their entry.
    pub modified_files: Vec<PathBuf>,

    /// Modules with an entry but absent from the current tree.
    pub deleted_files: Vec<PathBuf>,

    /// Modules whose content hash matches their entry.
    pub unchanged_files: Vec<PathBuf>,
}

impl ChangeSet {
    /// Returns `true` if there are no changes (no new, modified, or deleted files).
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.modified_files.is_empty() && self.deleted_files.is_empty()
    }

    /// Returns the total number of files that need reprocessing (new + modified).
    pub fn dirty_count(&self) -> usize {
        self.new_files.len() + self.modified_files.len()
    }
}

/// Module hashes for one build, keyed by source-relative path.
#[derive(Debug, Default)]
pub struct TreeHashes {
    /// Successfully hashed modules.
    pub hashes: BTreeMap<PathBuf, ContentHash>,
    /// Modules that could not be read, with the reason.
    pub failures: Vec<(PathBuf, CacheError)>,
}

/// The members of a bundle with their hashes, and the bundle's identity.
#[derive(Debug, Clone)]
pub struct BundleHashes {
    /// Hash of each member, keyed by source-relative path.
    pub members: BTreeMap<PathBuf, ContentHash>,
    /// Aggregate over every member, see [`SourceHasher::aggregate`].
    pub aggregate: ContentHash,
}

/// Utility for computing content hashes of source files and detecting changes.
pub struct SourceHasher;

impl SourceHasher {
    /// Computes the content hash of a single file.
    ///
    /// Symbolic links are followed, so a link to unchanged bytes hashes the
    /// same as the file it replaced.
    pub fn hash_file(path: &Path) -> Result<ContentHash, CacheError> {
        let content = std::fs::read(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(ContentHash::from_bytes(&content))
    }

    /// Hashes every module in `relative_paths` under `root`.
    ///
    /// Unreadable files are collected as failures instead of aborting, so
    /// independent modules can still be processed.
    pub fn hash_tree(root: &Path, relative_paths: &[PathBuf]) -> TreeHashes {
        let mut out = TreeHashes::default();
        for rel in relative_paths {
            match Self::hash_file(&root.join(rel)) {
                Ok(hash) => {
                    out.hashes.insert(rel.clone(), hash);
                }
                Err(err) => out.failures.push((rel.clone(), err)),
            }
        }
        out
    }

    /// Computes the aggregate identity of a set of modules.
    ///
    /// Paths are visited in sorted order; each contributes the hash of its
    /// relative path followed by the hash of its content, so renaming a
    /// module changes the aggregate as well as editing one.
    pub fn aggregate(hashes: &BTreeMap<PathBuf, ContentHash>) -> ContentHash {
        let mut parts = Vec::with_capacity(hashes.len() * 2);
        for (rel, hash) in hashes {
            parts.push(ContentHash::from_bytes(to_slash(rel).as_bytes()));
            parts.push(*hash);
        }
        ContentHash::combine(&parts)
    }

    /// Hashes every module under `root` and combines the results.
    ///
    /// Any unreadable module fails the whole aggregate; the error names the
    /// first one.
    pub fn bundle_hash(
        root: &Path,
        relative_paths: &[PathBuf],
    ) -> Result<BundleHashes, BuildError> {
        let tree = Self::hash_tree(root, relative_paths);
        if let Some((path, source)) = tree.failures.into_iter().next() {
            return Err(BuildError::Hash { path, source });
        }
        Ok(BundleHashes {
            aggregate: Self::aggregate(&tree.hashes),
            members: tree.hashes,
        })
    }

    /// Compares current module hashes against the module entries of the
    /// manifest.
    pub fn detect_changes(
        current_hashes: &BTreeMap<PathBuf, ContentHash>,
        manifest: &CacheManifest,
    ) -> ChangeSet {
        let known: BTreeMap<PathBuf, ContentHash> = manifest
            .module_entries()
            .map(|(path, entry)| (path, entry.content_hash))
            .collect();

        let mut changes = ChangeSet::default();
        for (path, hash) in current_hashes {
            match known.get(path) {
                Some(cached) if cached == hash => changes.unchanged_files.push(path.clone()),
                Some(_) => changes.modified_files.push(path.clone()),
                None => changes.new_files.push(path.clone()),
            }
        }

        changes.deleted_files = known
            .keys()
            .filter(|p| !current_hashes.contains_key(*p))
            .cloned()
            .collect();

        changes
    }
}
