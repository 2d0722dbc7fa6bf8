//! Module resolution: turning import paths into loaded modules.
//!
//! Every lookup goes through a [`ResolverChain`]. The chain always asks the
//! [`CacheShim`] first, which hands back cached parse results for modules
//! whose source is unchanged, and only then the configured resolvers (by
//! default the [`FileResolver`], which reads source text from disk).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use kiln_common::path::{append_extension, normalize};

use crate::error::ResolveError;
use crate::hasher::SourceHasher;
use crate::manifest::CacheKey;
use crate::module::{Module, ModuleBody};
use crate::store::CacheStore;

/// A request to load one module, with its location already worked out.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// The import path as written by the importer.
    pub import_path: &'a str,
    /// Absolute path of the importing module, if any.
    pub from: Option<&'a Path>,
    /// Absolute, normalized path of the requested module file.
    pub path: &'a Path,
    /// `path` relative to the source directory, if it lies inside it.
    pub relative: Option<&'a Path>,
}

/// Something that can load a module for a resolved request.
///
/// Returning `Ok(None)` passes the request on to the next resolver.
pub trait Resolver {
    /// Name used in configuration and diagnostics.
    fn name(&self) -> &str;

    /// Attempts to load the requested module.
    fn resolve(&mut self, request: &ResolveRequest<'_>) -> Result<Option<Module>, ResolveError>;
}

/// Computes the absolute module path an import refers to.
///
/// Imports starting with `./` or `../` are relative to the importing
/// module's directory when there is one; everything else is relative to the
/// source directory. The module extension is appended when absent.
pub fn locate(
    import_path: &str,
    from: Option<&Path>,
    source_dir: &Path,
    extension: &str,
) -> PathBuf {
    let is_relative = import_path.starts_with("./") || import_path.starts_with("../");
    let base = match from.and_then(Path::parent) {
        Some(dir) if is_relative => dir,
        _ => source_dir,
    };
    let joined = base.join(import_path.trim_start_matches('/'));
    append_extension(&normalize(&joined), extension)
}

/// Substitutes cached parse results for unchanged modules.
///
/// A module is served from the cache only if its entry's hash equals a
/// fresh hash of the file and the metadata snapshot is still readable.
pub struct CacheShim<'a> {
    store: &'a CacheStore,
    bypass: BTreeSet<PathBuf>,
    hits: usize,
}

impl<'a> CacheShim<'a> {
    /// Creates a shim reading from `store`.
    pub fn new(store: &'a CacheStore) -> Self {
        Self {
            store,
            bypass: BTreeSet::new(),
            hits: 0,
        }
    }

    /// Never serves the modules at these source-relative paths, so the
    /// next resolver loads them from source.
    pub fn bypass(mut self, modules: BTreeSet<PathBuf>) -> Self {
        self.bypass = modules;
        self
    }

    /// Number of modules served from the cache so far.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

impl Resolver for CacheShim<'_> {
    fn name(&self) -> &str {
        "cache"
    }

    fn resolve(&mut self, request: &ResolveRequest<'_>) -> Result<Option<Module>, ResolveError> {
        let Some(relative) = request.relative else {
            return Ok(None);
        };
        if self.bypass.contains(relative) {
            tracing::trace!(path = %relative.display(), "cache bypassed");
            return Ok(None);
        }
        // An unreadable file is not the shim's failure to report; the next
        // resolver will surface it.
        let Ok(hash) = SourceHasher::hash_file(request.path) else {
            return Ok(None);
        };
        let key = CacheKey::module(relative);
        let Some(entry) = self.store.validate(&key, hash, false).hit() else {
            return Ok(None);
        };
        let Some(metadata) = self.store.load_metadata(entry) else {
            tracing::debug!(%key, "cache entry has no usable metadata, reparsing");
            return Ok(None);
        };

        self.hits += 1;
        tracing::trace!(%key, "resolved from cache");
        Ok(Some(Module {
            path: request.path.to_path_buf(),
            relative: Some(relative.to_path_buf()),
            import_path: request.import_path.to_string(),
            hash,
            body: ModuleBody::Cached(metadata),
        }))
    }
}

/// Reads module source text from disk.
#[derive(Debug, Default)]
pub struct FileResolver {
    reads: usize,
}

impl FileResolver {
    /// Creates a file resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of module files read so far.
    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl Resolver for FileResolver {
    fn name(&self) -> &str {
        "file"
    }

    fn resolve(&mut self, request: &ResolveRequest<'_>) -> Result<Option<Module>, ResolveError> {
        let bytes = match std::fs::read(request.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ResolveError::Read {
                    path: request.path.to_path_buf(),
                    source: e,
                })
            }
        };
        let hash = kiln_common::ContentHash::from_bytes(&bytes);
        let text = String::from_utf8(bytes).map_err(|e| ResolveError::Read {
            path: request.path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        self.reads += 1;
        Ok(Some(Module {
            path: request.path.to_path_buf(),
            relative: request.relative.map(Path::to_path_buf),
            import_path: request.import_path.to_string(),
            hash,
            body: ModuleBody::Source(text),
        }))
    }
}

/// Counts of where modules were loaded from during one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionStats {
    /// Modules served by the cache shim.
    pub from_cache: usize,
    /// Modules served by any other resolver.
    pub from_resolvers: usize,
}

/// The ordered resolvers consulted for one compile pass.
///
/// The cache shim is always consulted first.
pub struct ResolverChain<'a> {
    shim: CacheShim<'a>,
    resolvers: Vec<&'a mut dyn Resolver>,
    source_dir: &'a Path,
    extension: &'a str,
    from_resolvers: usize,
}

impl<'a> ResolverChain<'a> {
    /// Builds a chain with the shim in front of `resolvers`.
    pub fn new(
        store: &'a CacheStore,
        resolvers: Vec<&'a mut dyn Resolver>,
        source_dir: &'a Path,
        extension: &'a str,
    ) -> Self {
        Self {
            shim: CacheShim::new(store),
            resolvers,
            source_dir,
            extension,
            from_resolvers: 0,
        }
    }

    /// Loads the modules at these source-relative paths from source even
    /// when the cache holds their parse results.
    pub fn bypass_cache(mut self, modules: BTreeSet<PathBuf>) -> Self {
        self.shim = self.shim.bypass(modules);
        self
    }

    /// Absolute module path for an import, see [`locate`].
    pub fn locate(&self, import_path: &str, from: Option<&Path>) -> PathBuf {
        locate(import_path, from, self.source_dir, self.extension)
    }

    /// Loads the module an import refers to.
    ///
    /// Fails with [`ResolveError::NotFound`] if no resolver, cached or
    /// otherwise, produces it.
    pub fn resolve(
        &mut self,
        import_path: &str,
        from: Option<&Path>,
    ) -> Result<Module, ResolveError> {
        let path = self.locate(import_path, from);
        self.load(import_path, from, &path)
    }

    /// Loads the module at an already located `path`.
    pub fn load(
        &mut self,
        import_path: &str,
        from: Option<&Path>,
        path: &Path,
    ) -> Result<Module, ResolveError> {
        let relative = path.strip_prefix(self.source_dir).ok();
        let request = ResolveRequest {
            import_path,
            from,
            path,
            relative,
        };

        if let Some(module) = self.shim.resolve(&request)? {
            return Ok(module);
        }
        for resolver in self.resolvers.iter_mut() {
            if let Some(module) = resolver.resolve(&request)? {
                tracing::trace!(resolver = resolver.name(), path = %path.display(), "resolved");
                self.from_resolvers += 1;
                return Ok(module);
            }
        }
        Err(ResolveError::NotFound {
            import_path: import_path.to_string(),
            path: path.to_path_buf(),
        })
    }

    /// Where modules have been loaded from so far.
    pub fn stats(&self) -> ResolutionStats {
        ResolutionStats {
            from_cache: self.shim.hits(),
            from_resolvers: self.from_resolvers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{CacheEntry, ScratchLocation};
    use crate::module::ModuleMetadata;
    use kiln_common::ContentHash;

    struct Fixture {
        _cache: tempfile::TempDir,
        src: tempfile::TempDir,
        store: CacheStore,
    }

    fn fixture() -> Fixture {
        let cache = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let store = CacheStore::with_version(cache.path(), "0.1.0", "fp");
        Fixture {
            _cache: cache,
            src,
            store,
        }
    }

    fn file_chain<'a>(f: &'a Fixture, files: &'a mut FileResolver) -> ResolverChain<'a> {
        ResolverChain::new(&f.store, vec![files as &mut dyn Resolver], f.src.path(), "js")
    }

    fn cache_module(store: &mut CacheStore, rel: &str, content: &[u8], meta: &ModuleMetadata) {
        let key = CacheKey::module(Path::new(rel));
        let metadata_key = store.store_metadata(meta).unwrap();
        store.put(CacheEntry {
            key,
            content_hash: ContentHash::from_bytes(content),
            metadata_key: Some(metadata_key),
            output_artifacts: vec![],
            scratch: ScratchLocation(0),
        });
    }

    #[test]
    fn locate_relative_to_importer() {
        let p = locate("./b", Some(Path::new("/src/lib/a.js")), Path::new("/src"), "js");
        assert_eq!(p, PathBuf::from("/src/lib/b.js"));
        let p = locate("../c", Some(Path::new("/src/lib/a.js")), Path::new("/src"), "js");
        assert_eq!(p, PathBuf::from("/src/c.js"));
    }

    #[test]
    fn locate_bare_imports_against_source_dir() {
        let p = locate("lib/b", Some(Path::new("/src/lib/a.js")), Path::new("/src"), "js");
        assert_eq!(p, PathBuf::from("/src/lib/b.js"));
        let p = locate("./b", None, Path::new("/src"), "js");
        assert_eq!(p, PathBuf::from("/src/b.js"));
        let p = locate("/lib/b.js", None, Path::new("/src"), "js");
        assert_eq!(p, PathBuf::from("/src/lib/b.js"));
    }

    #[test]
    fn file_resolver_reads_source() {
        let f = fixture();
        std::fs::write(f.src.path().join("a.js"), "export a").unwrap();
        let mut files = FileResolver::new();
        let mut chain = file_chain(&f, &mut files);

        let module = chain.resolve("a", None).unwrap();
        assert_eq!(module.source_text(), Some("export a"));
        assert_eq!(module.relative, Some(PathBuf::from("a.js")));
        assert_eq!(chain.stats().from_resolvers, 1);
        drop(chain);
        assert_eq!(files.reads(), 1);
    }

    #[test]
    fn shim_serves_unchanged_module() {
        let mut f = fixture();
        std::fs::write(f.src.path().join("y.js"), "export y").unwrap();
        let meta = ModuleMetadata {
            imports: vec![],
            exports: vec!["y".to_string()],
            parsed: vec![],
        };
        cache_module(&mut f.store, "y.js", b"export y", &meta);

        let mut files = FileResolver::new();
        let mut chain = file_chain(&f, &mut files);
        let module = chain.resolve("./y", Some(&f.src.path().join("x.js"))).unwrap();
        assert_eq!(module.metadata(), Some(&meta));
        assert_eq!(chain.stats().from_cache, 1);
        drop(chain);
        assert_eq!(files.reads(), 0);
    }

    #[test]
    fn shim_skips_changed_module() {
        let mut f = fixture();
        std::fs::write(f.src.path().join("y.js"), "export y2").unwrap();
        cache_module(&mut f.store, "y.js", b"export y", &ModuleMetadata::default());

        let mut files = FileResolver::new();
        let mut chain = file_chain(&f, &mut files);
        let module = chain.resolve("y", None).unwrap();
        assert!(!module.is_cached());
        assert_eq!(chain.stats().from_cache, 0);
    }

    #[test]
    fn bypassed_module_is_read_from_source() {
        let mut f = fixture();
        std::fs::write(f.src.path().join("y.js"), "export y").unwrap();
        std::fs::write(f.src.path().join("z.js"), "export z").unwrap();
        cache_module(&mut f.store, "y.js", b"export y", &ModuleMetadata::default());
        cache_module(&mut f.store, "z.js", b"export z", &ModuleMetadata::default());

        let mut files = FileResolver::new();
        let mut chain = file_chain(&f, &mut files).bypass_cache([PathBuf::from("y.js")].into());
        assert_eq!(chain.resolve("y", None).unwrap().source_text(), Some("export y"));
        assert!(chain.resolve("z", None).unwrap().is_cached());
        assert_eq!(chain.stats().from_cache, 1);
        assert_eq!(chain.stats().from_resolvers, 1);
    }

    #[test]
    fn shim_skips_entry_with_missing_metadata() {
        let mut f = fixture();
        std::fs::write(f.src.path().join("y.js"), "export y").unwrap();
        f.store.put(CacheEntry {
            key: CacheKey::module(Path::new("y.js")),
            content_hash: ContentHash::from_bytes(b"export y"),
            metadata_key: Some("0000".to_string()),
            output_artifacts: vec![],
            scratch: ScratchLocation(0),
        });

        let mut files = FileResolver::new();
        let mut chain = file_chain(&f, &mut files);
        assert!(!chain.resolve("y", None).unwrap().is_cached());
    }

    #[test]
    fn unresolvable_import_is_not_found() {
        let f = fixture();
        let mut files = FileResolver::new();
        let mut chain = file_chain(&f, &mut files);
        let err = chain.resolve("missing", None).unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }

    #[test]
    fn later_resolvers_are_consulted_in_order() {
        struct Fixed;
        impl Resolver for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            fn resolve(
                &mut self,
                request: &ResolveRequest<'_>,
            ) -> Result<Option<Module>, ResolveError> {
                Ok(Some(Module {
                    path: request.path.to_path_buf(),
                    relative: None,
                    import_path: request.import_path.to_string(),
                    hash: ContentHash::from_bytes(b"virtual"),
                    body: ModuleBody::Source("virtual".to_string()),
                }))
            }
        }

        let f = fixture();
        let mut files = FileResolver::new();
        let mut fixed = Fixed;
        let resolvers: Vec<&mut dyn Resolver> = vec![&mut files, &mut fixed];
        let mut chain = ResolverChain::new(&f.store, resolvers, f.src.path(), "js");
        let module = chain.resolve("virtual", None).unwrap();
        assert_eq!(module.source_text(), Some("virtual"));
    }
}
