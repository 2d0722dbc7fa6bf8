//! The cache store: entries, scratch regions and metadata snapshots.
//!
//! `CacheStore` ties together the manifest, the scratch area holding output
//! bytes, and the artifact store holding metadata snapshots. It is owned by
//! exactly one build pipeline; every mutation goes through `&mut self`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use kiln_common::ContentHash;

use crate::artifact::ArtifactStore;
use crate::error::CacheError;
use crate::manifest::{CacheEntry, CacheKey, CacheManifest, ScratchLocation};
use crate::module::ModuleMetadata;

/// Version recorded in manifests and artifact headers.
pub const KILN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subdirectory holding scratch regions.
const SCRATCH_SUBDIR: &str = "scratch";

/// Subdirectory and extension for metadata snapshots.
const META_SUBDIR: &str = "meta";
const META_EXT: &str = "meta";

/// Where the cache lives on disk.
enum CacheRoot {
    /// A directory that outlives the process.
    Persistent(PathBuf),
    /// A temporary directory removed when the store is dropped.
    Temporary(tempfile::TempDir),
}

impl CacheRoot {
    fn path(&self) -> &Path {
        match self {
            CacheRoot::Persistent(path) => path,
            CacheRoot::Temporary(dir) => dir.path(),
        }
    }
}

/// A freshly allocated, empty scratch region for one compile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchRegion {
    /// Region id recorded in entries produced by this pass.
    pub location: ScratchLocation,
    /// Absolute path of the region directory.
    pub path: PathBuf,
}

/// Outcome of checking a cache entry against the current inputs.
#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    /// The entry is valid and every artifact is present.
    Hit(&'a CacheEntry),
    /// No entry exists for the key.
    Missing,
    /// The entry was produced from different inputs.
    Stale,
    /// The entry matches but records no artifacts.
    Incomplete,
    /// The entry matches but an artifact is gone from the scratch area.
    Inconsistent {
        /// The first missing artifact.
        missing: PathBuf,
    },
}

impl<'a> Lookup<'a> {
    /// Returns the entry if this lookup is a hit.
    pub fn hit(&self) -> Option<&'a CacheEntry> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            _ => None,
        }
    }
}

/// Counts of files reclaimed by [`CacheStore::gc`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Scratch regions no longer referenced by any entry.
    pub regions_removed: usize,
    /// Metadata snapshots no longer referenced by any entry.
    pub metadata_removed: usize,
}

/// Cache store for incremental builds.
///
/// All reads are fail-safe: corruption or version mismatches result in
/// cache misses rather than errors.
pub struct CacheStore {
    root: CacheRoot,
    manifest: CacheManifest,
    artifacts: ArtifactStore,
    kiln_version: String,
}

impl CacheStore {
    /// Loads an existing persistent cache or creates a fresh one.
    ///
    /// A manifest from a different Kiln version or with a different options
    /// fingerprint is discarded. This never fails: any problem with the
    /// existing cache results in starting fresh.
    pub fn load_or_create(cache_dir: &Path, fingerprint: &str) -> Self {
        Self::with_version(cache_dir, KILN_VERSION, fingerprint)
    }

    /// Like [`CacheStore::load_or_create`] with an explicit version string.
    pub fn with_version(cache_dir: &Path, kiln_version: &str, fingerprint: &str) -> Self {
        let manifest = match CacheManifest::try_load(cache_dir) {
            Ok(m) if m.is_compatible(kiln_version, fingerprint) => m,
            Ok(old) => {
                tracing::info!(
                    cache_dir = %cache_dir.display(),
                    "cache was produced with different options, starting fresh"
                );
                // Destination records describe files on disk, not cached
                // outputs, and stay valid across option changes.
                let mut fresh = CacheManifest::new(kiln_version, fingerprint);
                fresh.placed = old.placed;
                fresh
            }
            Err(CacheError::Io { .. }) => CacheManifest::new(kiln_version, fingerprint),
            Err(err) => {
                tracing::warn!(%err, "ignoring unreadable cache manifest");
                CacheManifest::new(kiln_version, fingerprint)
            }
        };

        Self {
            root: CacheRoot::Persistent(cache_dir.to_path_buf()),
            artifacts: ArtifactStore::new(cache_dir),
            manifest,
            kiln_version: kiln_version.to_string(),
        }
    }

    /// Creates an empty store in a temporary directory.
    ///
    /// The directory and everything in it are removed when the store is
    /// dropped or closed.
    pub fn temporary(fingerprint: &str) -> Result<Self, CacheError> {
        let dir = tempfile::Builder::new()
            .prefix("kiln-cache-")
            .tempdir()
            .map_err(|e| CacheError::Io {
                path: std::env::temp_dir(),
                source: e,
            })?;
        let artifacts = ArtifactStore::new(dir.path());
        Ok(Self {
            root: CacheRoot::Temporary(dir),
            artifacts,
            manifest: CacheManifest::new(KILN_VERSION, fingerprint),
            kiln_version: KILN_VERSION.to_string(),
        })
    }

    /// Returns `true` if the store is removed on teardown.
    pub fn is_temporary(&self) -> bool {
        matches!(self.root, CacheRoot::Temporary(_))
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Directory holding all scratch regions.
    pub fn scratch_root(&self) -> PathBuf {
        self.root().join(SCRATCH_SUBDIR)
    }

    /// Directory of one scratch region.
    pub fn region_path(&self, location: ScratchLocation) -> PathBuf {
        self.scratch_root().join(location.dir_name())
    }

    /// Location of one of an entry's artifacts in the scratch area.
    pub fn artifact_path(&self, entry: &CacheEntry, artifact: &Path) -> PathBuf {
        self.region_path(entry.scratch).join(artifact)
    }

    /// Returns the entry stored under `key`, without any validity check.
    pub fn lookup(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.manifest.entries.get(key)
    }

    /// Checks whether the entry under `key` may be reused for inputs hashing
    /// to `current`.
    ///
    /// This is the only way reuse decisions are made. With
    /// `require_artifacts`, an entry must also record at least one artifact
    /// and every artifact must still exist in the scratch area.
    pub fn validate(
        &self,
        key: &CacheKey,
        current: ContentHash,
        require_artifacts: bool,
    ) -> Lookup<'_> {
        let Some(entry) = self.lookup(key) else {
            return Lookup::Missing;
        };
        if entry.content_hash != current {
            return Lookup::Stale;
        }
        if require_artifacts {
            if entry.output_artifacts.is_empty() {
                return Lookup::Incomplete;
            }
            if let Some(missing) = entry
                .output_artifacts
                .iter()
                .find(|a| !self.artifact_path(entry, a).is_file())
            {
                return Lookup::Inconsistent {
                    missing: missing.clone(),
                };
            }
        }
        Lookup::Hit(entry)
    }

    /// Inserts or overwrites the entry under its key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.manifest.entries.insert(entry.key.clone(), entry);
    }

    /// Records fresh metadata for a unit without producing artifacts.
    ///
    /// If the existing entry was produced from the same inputs its artifacts
    /// are kept; otherwise the entry is replaced by one with no artifacts,
    /// which is never reusable as output.
    pub fn refresh_metadata(
        &mut self,
        key: CacheKey,
        content_hash: ContentHash,
        metadata_key: Option<String>,
        region: ScratchLocation,
    ) {
        match self.manifest.entries.get_mut(&key) {
            Some(entry) if entry.content_hash == content_hash => {
                if metadata_key.is_some() {
                    entry.metadata_key = metadata_key;
                }
            }
            _ => self.put(CacheEntry {
                key,
                content_hash,
                metadata_key,
                output_artifacts: Vec::new(),
                scratch: region,
            }),
        }
    }

    /// Allocates an empty scratch region isolated from every other pass.
    pub fn allocate_scratch_region(&mut self) -> Result<ScratchRegion, CacheError> {
        let location = ScratchLocation(self.manifest.next_region);
        self.manifest.next_region += 1;

        let path = self.region_path(location);
        if path.exists() {
            // Left behind by a pass whose manifest was never saved.
            std::fs::remove_dir_all(&path).map_err(|e| CacheError::Io {
                path: path.clone(),
                source: e,
            })?;
        }
        std::fs::create_dir_all(&path).map_err(|e| CacheError::Io {
            path: path.clone(),
            source: e,
        })?;

        tracing::debug!(region = location.0, path = %path.display(), "allocated scratch region");
        Ok(ScratchRegion { location, path })
    }

    /// Persists a metadata snapshot and returns its key.
    pub fn store_metadata(&self, metadata: &ModuleMetadata) -> Result<String, CacheError> {
        let bytes = bincode::serde::encode_to_vec(metadata, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        self.artifacts
            .write_artifact(META_SUBDIR, META_EXT, &bytes, &self.kiln_version)
    }

    /// Loads the metadata snapshot recorded in `entry`.
    ///
    /// Returns `None` if none was recorded or the snapshot is unreadable.
    pub fn load_metadata(&self, entry: &CacheEntry) -> Option<ModuleMetadata> {
        let key = entry.metadata_key.as_deref()?;
        let bytes = self.artifacts.read_artifact(META_SUBDIR, key, META_EXT)?;
        match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((metadata, _)) => Some(metadata),
            Err(err) => {
                tracing::warn!(%err, key = %entry.key, "discarding undecodable metadata snapshot");
                None
            }
        }
    }

    /// Files the last build placed into `dest`, relative to it.
    pub fn placed(&self, dest: &Path) -> BTreeSet<PathBuf> {
        self.manifest
            .placed
            .get(&*dest.to_string_lossy())
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the record of files placed into `dest`.
    pub fn record_placed(&mut self, dest: &Path, files: BTreeSet<PathBuf>) {
        let dest = dest.to_string_lossy().into_owned();
        if files.is_empty() {
            self.manifest.placed.remove(&dest);
        } else {
            self.manifest.placed.insert(dest, files);
        }
    }

    /// Returns a reference to the current cache manifest.
    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }

    /// Persists the current manifest to disk.
    pub fn save(&self) -> Result<(), CacheError> {
        self.manifest.save(self.root())
    }

    /// Removes scratch regions and metadata snapshots that no entry refers to.
    pub fn gc(&self) -> Result<GcStats, CacheError> {
        let live_regions: BTreeSet<String> = self
            .manifest
            .entries
            .values()
            .map(|e| e.scratch.dir_name())
            .collect();
        let live_meta: Vec<&str> = self
            .manifest
            .entries
            .values()
            .filter_map(|e| e.metadata_key.as_deref())
            .collect();

        let mut stats = GcStats {
            metadata_removed: self.artifacts.gc(META_SUBDIR, META_EXT, &live_meta)?,
            ..GcStats::default()
        };

        let scratch = self.scratch_root();
        if !scratch.exists() {
            return Ok(stats);
        }
        for dir_entry in std::fs::read_dir(&scratch).map_err(io_error(&scratch))? {
            let dir_entry = dir_entry.map_err(io_error(&scratch))?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.parse::<u64>().is_ok() && !live_regions.contains(&name) {
                let path = dir_entry.path();
                std::fs::remove_dir_all(&path).map_err(io_error(&path))?;
                stats.regions_removed += 1;
            }
        }

        Ok(stats)
    }

    /// Tears the store down at the end of a pipeline.
    ///
    /// A persistent store saves its manifest and reclaims unreferenced
    /// scratch space; a temporary store is removed entirely.
    pub fn close(self) -> Result<GcStats, CacheError> {
        if self.is_temporary() {
            return Ok(GcStats::default());
        }
        self.save()?;
        let stats = self.gc()?;
        tracing::debug!(
            regions = stats.regions_removed,
            metadata = stats.metadata_removed,
            "reclaimed unreferenced cache files"
        );
        Ok(stats)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError {
    let path = path.to_path_buf();
    move |source| CacheError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::with_version(dir.path(), "0.1.0", "fp");
        (dir, store)
    }

    fn write_artifact(store: &CacheStore, region: &ScratchRegion, rel: &str, bytes: &[u8]) {
        let path = region.path.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
        assert!(store.region_path(region.location).join(rel).is_file());
    }

    fn entry(
        key: CacheKey,
        hash: ContentHash,
        region: &ScratchRegion,
        artifacts: &[&str],
    ) -> CacheEntry {
        CacheEntry {
            key,
            content_hash: hash,
            metadata_key: None,
            output_artifacts: artifacts.iter().map(PathBuf::from).collect(),
            scratch: region.location,
        }
    }

    #[test]
    fn fresh_store_is_empty() {
        let (_dir, store) = make_store();
        assert!(store.manifest().entries.is_empty());
        assert_eq!(store.manifest().kiln_version, "0.1.0");
    }

    #[test]
    fn regions_are_distinct_and_monotonic() {
        let (_dir, mut store) = make_store();
        let a = store.allocate_scratch_region().unwrap();
        let b = store.allocate_scratch_region().unwrap();
        assert!(b.location > a.location);
        assert_ne!(a.path, b.path);
        assert!(a.path.is_dir() && b.path.is_dir());
    }

    #[test]
    fn validate_hit_stale_missing() {
        let (_dir, mut store) = make_store();
        let region = store.allocate_scratch_region().unwrap();
        write_artifact(&store, &region, "a.out", b"out");
        let key = CacheKey::module(Path::new("a.mod"));
        let hash = ContentHash::from_bytes(b"a");
        store.put(entry(key.clone(), hash, &region, &["a.out"]));

        assert!(store.validate(&key, hash, true).hit().is_some());
        assert_eq!(
            store.validate(&key, ContentHash::from_bytes(b"changed"), true),
            Lookup::Stale
        );
        assert_eq!(
            store.validate(&CacheKey::module(Path::new("b.mod")), hash, true),
            Lookup::Missing
        );
    }

    #[test]
    fn validate_detects_missing_artifact() {
        let (_dir, mut store) = make_store();
        let region = store.allocate_scratch_region().unwrap();
        let key = CacheKey::module(Path::new("a.mod"));
        let hash = ContentHash::from_bytes(b"a");
        store.put(entry(key.clone(), hash, &region, &["a.out"]));

        assert_eq!(
            store.validate(&key, hash, true),
            Lookup::Inconsistent {
                missing: PathBuf::from("a.out")
            }
        );
        // Metadata-only reuse does not need artifacts.
        assert!(store.validate(&key, hash, false).hit().is_some());
    }

    #[test]
    fn validate_requires_some_artifact() {
        let (_dir, mut store) = make_store();
        let region = store.allocate_scratch_region().unwrap();
        let key = CacheKey::module(Path::new("a.mod"));
        let hash = ContentHash::from_bytes(b"a");
        store.put(entry(key.clone(), hash, &region, &[]));
        assert_eq!(store.validate(&key, hash, true), Lookup::Incomplete);
    }

    #[test]
    fn refresh_metadata_keeps_artifacts_for_same_hash() {
        let (_dir, mut store) = make_store();
        let region = store.allocate_scratch_region().unwrap();
        let key = CacheKey::module(Path::new("a.mod"));
        let hash = ContentHash::from_bytes(b"a");
        store.put(entry(key.clone(), hash, &region, &["a.out"]));

        let later = store.allocate_scratch_region().unwrap();
        store.refresh_metadata(key.clone(), hash, Some("m".to_string()), later.location);
        let e = store.lookup(&key).unwrap();
        assert_eq!(e.output_artifacts, vec![PathBuf::from("a.out")]);
        assert_eq!(e.scratch, region.location);
        assert_eq!(e.metadata_key.as_deref(), Some("m"));

        let new_hash = ContentHash::from_bytes(b"a2");
        store.refresh_metadata(key.clone(), new_hash, None, later.location);
        let e = store.lookup(&key).unwrap();
        assert!(e.output_artifacts.is_empty());
        assert_eq!(e.content_hash, new_hash);
    }

    #[test]
    fn metadata_roundtrip() {
        let (_dir, mut store) = make_store();
        let meta = ModuleMetadata {
            imports: vec!["./b".to_string()],
            exports: vec!["a".to_string()],
            parsed: b"ast".to_vec(),
        };
        let meta_key = store.store_metadata(&meta).unwrap();
        let region = store.allocate_scratch_region().unwrap();
        let key = CacheKey::module(Path::new("a.mod"));
        let mut e = entry(key, ContentHash::from_bytes(b"a"), &region, &[]);
        e.metadata_key = Some(meta_key);
        assert_eq!(store.load_metadata(&e), Some(meta));
    }

    #[test]
    fn load_metadata_without_key_is_none() {
        let (_dir, mut store) = make_store();
        let region = store.allocate_scratch_region().unwrap();
        let e = entry(
            CacheKey::module(Path::new("a.mod")),
            ContentHash::from_bytes(b"a"),
            &region,
            &[],
        );
        assert!(store.load_metadata(&e).is_none());
    }

    #[test]
    fn persisted_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::bundle("app.js");
        {
            let mut store = CacheStore::with_version(dir.path(), "0.1.0", "fp");
            let region = store.allocate_scratch_region().unwrap();
            store.put(entry(key.clone(), ContentHash::from_bytes(b"x"), &region, &["app.js"]));
            store.save().unwrap();
        }
        let store = CacheStore::with_version(dir.path(), "0.1.0", "fp");
        assert!(store.lookup(&key).is_some());
        assert_eq!(store.manifest().next_region, 1);
    }

    #[test]
    fn fingerprint_change_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = CacheStore::with_version(dir.path(), "0.1.0", "fp");
            let region = store.allocate_scratch_region().unwrap();
            store.put(entry(
                CacheKey::bundle("app.js"),
                ContentHash::from_bytes(b"x"),
                &region,
                &[],
            ));
            store.save().unwrap();
        }
        let store = CacheStore::with_version(dir.path(), "0.1.0", "other");
        assert!(store.manifest().entries.is_empty());
        assert_eq!(store.manifest().fingerprint, "other");
    }

    #[test]
    fn placed_records_survive_option_changes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Path::new("/site");
        let files: BTreeSet<PathBuf> = [PathBuf::from("lib/a.js")].into();
        {
            let mut store = CacheStore::with_version(dir.path(), "0.1.0", "fp");
            store.record_placed(dest, files.clone());
            store.save().unwrap();
        }
        let mut store = CacheStore::with_version(dir.path(), "0.1.0", "other");
        assert_eq!(store.placed(dest), files);
        assert!(store.placed(Path::new("/elsewhere")).is_empty());

        store.record_placed(dest, BTreeSet::new());
        assert!(store.manifest().placed.is_empty());
    }

    #[test]
    fn gc_reclaims_unreferenced_regions() {
        let (_dir, mut store) = make_store();
        let old = store.allocate_scratch_region().unwrap();
        let live = store.allocate_scratch_region().unwrap();
        let key = CacheKey::module(Path::new("a.mod"));
        store.put(entry(key, ContentHash::from_bytes(b"a"), &live, &[]));
        store.store_metadata(&ModuleMetadata::default()).unwrap();

        let stats = store.gc().unwrap();
        assert_eq!(stats.regions_removed, 1);
        assert_eq!(stats.metadata_removed, 1);
        assert!(!old.path.exists());
        assert!(live.path.exists());
    }

    #[test]
    fn temporary_store_is_removed_on_close() {
        let mut store = CacheStore::temporary("fp").unwrap();
        assert!(store.is_temporary());
        let root = store.root().to_path_buf();
        store.allocate_scratch_region().unwrap();
        assert!(root.exists());
        store.close().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn close_saves_persistent_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CacheStore::with_version(dir.path(), "0.1.0", "fp");
        store.allocate_scratch_region().unwrap();
        store.close().unwrap();
        assert!(dir.path().join("manifest.json").is_file());
    }
}
