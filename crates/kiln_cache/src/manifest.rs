//! Cache manifest: the persisted index of cache entries.
//!
//! The manifest is stored as `manifest.json` in the cache directory. It maps
//! each cache key to the entry describing the last successful compile of
//! that unit: the hash of its inputs, the scratch region holding its output
//! bytes, and the key of its metadata snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use kiln_common::path::to_slash;
use kiln_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Name of the manifest file within the cache directory.
const MANIFEST_FILE: &str = "manifest.json";

const MODULE_PREFIX: &str = "module:";
const BUNDLE_PREFIX: &str = "bundle:";

/// Identity of one cacheable unit.
///
/// Module entries (one per source module) and bundle entries (one per
/// bundle output) live in separate namespaces so both invalidation
/// granularities can share a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a module, from its path relative to the source directory.
    pub fn module(relative: &Path) -> Self {
        Self(format!("{MODULE_PREFIX}{}", to_slash(relative)))
    }

    /// Key for a bundle, from the bundle path relative to the destination.
    pub fn bundle(name: &str) -> Self {
        Self(format!("{BUNDLE_PREFIX}{name}"))
    }

    /// Returns the source-relative path if this is a module key.
    pub fn module_path(&self) -> Option<PathBuf> {
        self.0.strip_prefix(MODULE_PREFIX).map(PathBuf::from)
    }

    /// Returns `true` if this key names a bundle.
    pub fn is_bundle(&self) -> bool {
        self.0.starts_with(BUNDLE_PREFIX)
    }

    /// Returns the key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one scratch region, a directory under `<cache>/scratch/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScratchLocation(pub u64);

impl ScratchLocation {
    /// Directory name of this region inside the scratch root.
    pub fn dir_name(&self) -> String {
        self.0.to_string()
    }
}

/// The last-known-good compiled state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The unit this entry describes.
    pub key: CacheKey,
    /// Hash of the inputs that produced this entry.
    pub content_hash: ContentHash,
    /// Key of the metadata snapshot in the artifact store, if one was recorded.
    pub metadata_key: Option<String>,
    /// Output files, relative to the scratch region (and to the destination root).
    pub output_artifacts: Vec<PathBuf>,
    /// Scratch region holding the bytes of `output_artifacts`.
    pub scratch: ScratchLocation,
}

/// Top-level cache manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Kiln version that produced this cache. Invalidate on version change.
    pub kiln_version: String,
    /// Fingerprint of the build options the cached outputs depend on.
    pub fingerprint: String,
    /// Next scratch region id to hand out.
    pub next_region: u64,
    /// Entries keyed by unit.
    pub entries: BTreeMap<CacheKey, CacheEntry>,
    /// Files the last build placed, keyed by absolute destination directory.
    /// Paths are relative to that directory.
    #[serde(default)]
    pub placed: BTreeMap<String, BTreeSet<PathBuf>>,
}

impl CacheManifest {
    /// Creates a new, empty cache manifest.
    pub fn new(kiln_version: &str, fingerprint: &str) -> Self {
        Self {
            kiln_version: kiln_version.to_string(),
            fingerprint: fingerprint.to_string(),
            next_region: 0,
            entries: BTreeMap::new(),
            placed: BTreeMap::new(),
        }
    }

    /// Loads the manifest from the cache directory, returning `None` if
    /// the file doesn't exist or can't be parsed.
    ///
    /// This is fail-safe: any error results in `None` (cache miss),
    /// triggering a full rebuild.
    pub fn load(cache_dir: &Path) -> Option<Self> {
        Self::try_load(cache_dir).ok()
    }

    /// Loads the manifest, reporting why it could not be used.
    pub fn try_load(cache_dir: &Path) -> Result<Self, CacheError> {
        let path = cache_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| CacheError::Io {
            path: path.clone(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| CacheError::ManifestParse {
            reason: e.to_string(),
        })
    }

    /// Saves the manifest to the cache directory.
    ///
    /// Creates the cache directory if it doesn't exist.
    pub fn save(&self, cache_dir: &Path) -> Result<(), CacheError> {
        std::fs::create_dir_all(cache_dir).map_err(|e| CacheError::Io {
            path: cache_dir.to_path_buf(),
            source: e,
        })?;
        let path = cache_dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| CacheError::Io { path, source: e })
    }

    /// Returns `true` if this manifest was produced by the same Kiln version
    /// with the same build options.
    pub fn is_compatible(&self, kiln_version: &str, fingerprint: &str) -> bool {
        self.kiln_version == kiln_version && self.fingerprint == fingerprint
    }

    /// Iterates over module entries with their source-relative paths.
    pub fn module_entries(&self) -> impl Iterator<Item = (PathBuf, &CacheEntry)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| key.module_path().map(|p| (p, entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: CacheKey) -> CacheEntry {
        CacheEntry {
            key,
            content_hash: ContentHash::from_bytes(b"content"),
            metadata_key: Some("abc".to_string()),
            output_artifacts: vec![PathBuf::from("lib/a.js")],
            scratch: ScratchLocation(3),
        }
    }

    #[test]
    fn key_namespaces() {
        let m = CacheKey::module(Path::new("lib/a.js"));
        let b = CacheKey::bundle("app.js");
        assert_eq!(m.as_str(), "module:lib/a.js");
        assert_eq!(m.module_path(), Some(PathBuf::from("lib/a.js")));
        assert!(!m.is_bundle());
        assert_eq!(b.as_str(), "bundle:app.js");
        assert!(b.is_bundle());
        assert!(b.module_path().is_none());
    }

    #[test]
    fn module_and_bundle_keys_never_collide() {
        assert_ne!(CacheKey::module(Path::new("app.js")), CacheKey::bundle("app.js"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = CacheManifest::new("0.1.0", "fp");
        let key = CacheKey::module(Path::new("a.js"));
        manifest.entries.insert(key.clone(), entry(key.clone()));
        manifest.next_region = 4;
        manifest.save(dir.path()).unwrap();

        let loaded = CacheManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.next_region, 4);
        assert_eq!(loaded.entries.get(&key), Some(&entry(key)));
    }

    #[test]
    fn placed_paths_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = CacheManifest::new("0.1.0", "fp");
        let files: BTreeSet<PathBuf> = [PathBuf::from("lib/a.js"), PathBuf::from("README")].into();
        manifest.placed.insert("/out".to_string(), files.clone());
        manifest.save(dir.path()).unwrap();

        let loaded = CacheManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.placed.get("/out"), Some(&files));
    }

    #[test]
    fn manifest_without_placed_paths_loads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"kiln_version":"0.1.0","fingerprint":"fp","next_region":2,"entries":{}}"#,
        )
        .unwrap();
        let loaded = CacheManifest::try_load(dir.path()).unwrap();
        assert_eq!(loaded.next_region, 2);
        assert!(loaded.placed.is_empty());
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CacheManifest::load(dir.path()).is_none());
    }

    #[test]
    fn load_corrupt_is_manifest_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();
        let err = CacheManifest::try_load(dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::ManifestParse { .. }));
    }

    #[test]
    fn compatibility_checks_version_and_fingerprint() {
        let manifest = CacheManifest::new("0.1.0", "fp");
        assert!(manifest.is_compatible("0.1.0", "fp"));
        assert!(!manifest.is_compatible("0.2.0", "fp"));
        assert!(!manifest.is_compatible("0.1.0", "other"));
    }

    #[test]
    fn module_entries_skip_bundles() {
        let mut manifest = CacheManifest::new("0.1.0", "fp");
        let m = CacheKey::module(Path::new("a.js"));
        let b = CacheKey::bundle("app.js");
        manifest.entries.insert(m.clone(), entry(m));
        manifest.entries.insert(b.clone(), entry(b));
        let modules: Vec<_> = manifest.module_entries().map(|(p, _)| p).collect();
        assert_eq!(modules, vec![PathBuf::from("a.js")]);
    }
}
