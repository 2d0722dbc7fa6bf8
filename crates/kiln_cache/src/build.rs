//! The build orchestrator.
//!
//! One build runs the pipeline
//! `scan -> classify -> {directory | bundle} -> compile(subset) -> materialize`:
//!
//! 1. Enumerate the source tree once and split it into module and
//!    passthrough files.
//! 2. Hash modules and validate cache entries, per module in directory mode
//!    or as one aggregate in bundle mode.
//! 3. Invoke the transformer at most once, over the modules that could not
//!    be reused, with the cache shim in front of the resolver chain.
//! 4. Record entries for what the pass produced, then copy (or link) every
//!    needed artifact and passthrough file into the destination.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::path::to_slash;
use kiln_common::ContentHash;
use kiln_config::{OutputKind, OutputKindOrigin, ResolvedBuild};

use crate::error::{BuildError, CacheError, TransformError};
use crate::hasher::{ChangeSet, SourceHasher};
use crate::manifest::{CacheEntry, CacheKey, ScratchLocation};
use crate::materialize::Materializer;
use crate::resolver::{FileResolver, Resolver, ResolverChain};
use crate::store::{CacheStore, GcStats, Lookup};
use crate::transformer::{
    CompileContext, CompileOutcome, Formatter, FormatterRegistry, OutputFormat, OutputTarget,
    TransformOptions, Transformer, VisitedModule,
};
use crate::tree::{absolute, SourceTree};

/// What one build did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Output kind the build ran in.
    pub mode: OutputKind,
    /// Modules the transformer compiled, relative to the source directory.
    pub compiled: Vec<PathBuf>,
    /// Modules whose cached output was reused.
    pub reused: Vec<PathBuf>,
    /// Passthrough files copied because the destination was out of date.
    pub passthrough: usize,
    /// Files an earlier build placed that no current unit or passthrough
    /// file accounts for, removed from the destination.
    pub removed: usize,
    /// Artifact files written into the destination.
    pub artifacts_placed: usize,
    /// Modules the cache shim served during compilation.
    pub resolved_from_cache: usize,
    /// Modules read by the configured resolvers during compilation.
    pub resolved_from_disk: usize,
    /// Number of times the transformer was invoked (zero or one).
    pub transformer_invocations: usize,
    /// Module changes relative to the cache before this build.
    pub changes: ChangeSet,
}

impl BuildReport {
    fn new(mode: OutputKind) -> Self {
        Self {
            mode,
            compiled: Vec::new(),
            reused: Vec::new(),
            passthrough: 0,
            removed: 0,
            artifacts_placed: 0,
            resolved_from_cache: 0,
            resolved_from_disk: 0,
            transformer_invocations: 0,
            changes: ChangeSet::default(),
        }
    }
}

/// Configures an [`IncrementalBuild`] before its store is opened.
pub struct IncrementalBuildBuilder {
    config: ResolvedBuild,
    formatters: FormatterRegistry,
    custom_resolvers: Vec<Box<dyn Resolver>>,
}

impl IncrementalBuildBuilder {
    /// Starts configuring a build of `config`.
    pub fn new(config: ResolvedBuild) -> Self {
        Self {
            config,
            formatters: FormatterRegistry::new(),
            custom_resolvers: Vec::new(),
        }
    }

    /// Makes a custom output format selectable by name.
    pub fn formatter(mut self, format: Arc<dyn OutputFormat>) -> Self {
        self.formatters.register(format);
        self
    }

    /// Makes a custom resolver selectable by its [`Resolver::name`].
    pub fn resolver(mut self, resolver: Box<dyn Resolver>) -> Self {
        self.custom_resolvers.push(resolver);
        self
    }

    /// Resolves the configured formatter and resolvers, and opens the store.
    ///
    /// A configured cache directory opens a persistent store; otherwise the
    /// build uses a temporary one removed when the build is dropped.
    pub fn build<T: Transformer>(
        mut self,
        transformer: T,
    ) -> Result<IncrementalBuild<T>, BuildError> {
        let formatter = self.formatters.resolve(&self.config.formatter)?;

        let mut resolvers: Vec<Box<dyn Resolver>> = Vec::with_capacity(self.config.resolvers.len());
        for name in &self.config.resolvers {
            if let Some(pos) = self.custom_resolvers.iter().position(|r| r.name() == name) {
                resolvers.push(self.custom_resolvers.swap_remove(pos));
            } else if name == "file" {
                resolvers.push(Box::new(FileResolver::new()));
            } else {
                return Err(BuildError::UnknownResolver(name.clone()));
            }
        }

        let fingerprint = options_fingerprint(&self.config, &formatter);
        let store = match &self.config.cache_dir {
            Some(dir) => CacheStore::load_or_create(dir, &fingerprint),
            None => CacheStore::temporary(&fingerprint)?,
        };
        tracing::debug!(
            cache = %store.root().display(),
            temporary = store.is_temporary(),
            formatter = formatter.name(),
            "opened build cache"
        );

        let options = TransformOptions {
            formatter,
            base_path: self.config.base_path.clone(),
            source_root: self.config.source_root.clone(),
            extension: self.config.extension.clone(),
        };
        Ok(IncrementalBuild {
            materializer: Materializer::new(self.config.materialize),
            config: self.config,
            options,
            resolvers,
            store,
            transformer,
        })
    }
}

/// Runs incremental builds of one project with one transformer.
///
/// The build owns its cache store; repeated calls to [`IncrementalBuild::build`]
/// reuse everything the store still holds.
pub struct IncrementalBuild<T> {
    config: ResolvedBuild,
    options: TransformOptions,
    resolvers: Vec<Box<dyn Resolver>>,
    store: CacheStore,
    transformer: T,
    materializer: Materializer,
}

/// One compile pass, detached from the transformer.
struct Pass {
    region: ScratchLocation,
    outcome: CompileOutcome,
    failure: Option<TransformError>,
}

impl<T: Transformer> IncrementalBuild<T> {
    /// Loads `kiln.toml` from `project_dir` and sets up a build with the
    /// built-in formatters and resolvers.
    pub fn from_project_dir(project_dir: &Path, transformer: T) -> Result<Self, BuildError> {
        let config = kiln_config::load_config(project_dir)?;
        let resolved = kiln_config::resolve_build(&config, project_dir);
        IncrementalBuildBuilder::new(resolved).build(transformer)
    }

    /// The cache store.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// The build configuration.
    pub fn config(&self) -> &ResolvedBuild {
        &self.config
    }

    /// The wrapped transformer.
    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    /// The wrapped transformer, mutably.
    pub fn transformer_mut(&mut self) -> &mut T {
        &mut self.transformer
    }

    /// Builds the project into `dest`.
    ///
    /// Modules that cannot be hashed fail on their own in directory mode:
    /// every other module is still built and placed, and the failures are
    /// reported together as [`BuildError::UnitsFailed`].
    ///
    /// Files a previous build placed into `dest` that the current build no
    /// longer produces (deleted modules, deleted passthrough files, a bundle
    /// with no modules left) are removed before anything is placed.
    pub fn build(&mut self, dest: &Path) -> Result<BuildReport, BuildError> {
        let dest_dir = absolute(dest).map_err(|source| BuildError::Materialize {
            path: dest.to_path_buf(),
            source,
        })?;
        let dest = dest_dir.as_path();
        let mode = self.config.output_kind;
        if self.config.ambiguous_output {
            tracing::warn!(
                output = %self.config.output.display(),
                "output is configured as a directory but its name ends in .{}",
                self.config.extension
            );
        }
        if self.config.output_kind_origin == OutputKindOrigin::Inferred {
            tracing::debug!(
                ?mode,
                output = %self.config.output.display(),
                "output kind inferred from path"
            );
        }

        let exclude = self.scan_exclusions(dest);
        let tree = SourceTree::scan(&self.config.source_dir, &self.config.extension, &exclude)?;
        let mut report = BuildReport::new(mode);

        let (placements, failures) = match mode {
            OutputKind::Directory => self.build_modules(&tree, &mut report)?,
            OutputKind::File => (self.build_bundle(&tree, &mut report)?, Vec::new()),
        };

        let entries: Vec<CacheEntry> = placements
            .iter()
            .filter_map(|key| self.store.lookup(key).cloned())
            .collect();
        let mut placed: BTreeSet<PathBuf> = entries
            .iter()
            .flat_map(|entry| entry.output_artifacts.iter().cloned())
            .collect();
        placed.extend(tree.passthrough.iter().cloned());
        for stale in self.store.placed(dest).difference(&placed) {
            if self.materializer.remove_stale(dest, stale)? {
                report.removed += 1;
            }
        }

        for entry in &entries {
            report.artifacts_placed += self.materializer.place(&self.store, entry, dest)?;
        }
        for rel in &tree.passthrough {
            if self.materializer.copy_passthrough(&self.config.source_dir, rel, dest)? {
                report.passthrough += 1;
            }
        }
        self.store.record_placed(dest, placed);
        self.store.save()?;

        tracing::info!(
            compiled = report.compiled.len(),
            reused = report.reused.len(),
            placed = report.artifacts_placed,
            passthrough = report.passthrough,
            removed = report.removed,
            "build finished"
        );
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(BuildError::UnitsFailed { failures })
        }
    }

    /// Saves the manifest and reclaims cache space no entry refers to.
    pub fn close(self) -> Result<GcStats, BuildError> {
        self.store.close().map_err(BuildError::from)
    }

    /// Directories the scan must not descend into: the destination, and
    /// the cache when it persists inside the project.
    fn scan_exclusions(&self, dest: &Path) -> Vec<PathBuf> {
        let mut exclude = vec![dest.to_path_buf()];
        if !self.store.is_temporary() {
            exclude.push(self.store.root().to_path_buf());
        }
        exclude
    }

    /// `true` if every artifact of `entry` lies under the output target.
    fn under_output(&self, entry: &CacheEntry) -> bool {
        entry
            .output_artifacts
            .iter()
            .all(|a| a.starts_with(&self.config.output))
    }

    /// Directory mode: one entry per module.
    fn build_modules(
        &mut self,
        tree: &SourceTree,
        report: &mut BuildReport,
    ) -> Result<(Vec<CacheKey>, Vec<(PathBuf, CacheError)>), BuildError> {
        let hashed = SourceHasher::hash_tree(&self.config.source_dir, &tree.modules);
        for (path, err) in &hashed.failures {
            tracing::warn!(path = %path.display(), %err, "cannot hash module, skipping it");
        }
        report.changes = SourceHasher::detect_changes(&hashed.hashes, self.store.manifest());

        let mut placements = Vec::new();
        let mut queue = Vec::new();
        let mut reparse = BTreeSet::new();
        for (rel, hash) in &hashed.hashes {
            let key = CacheKey::module(rel);
            match self.store.validate(&key, *hash, true) {
                Lookup::Hit(entry) if self.under_output(entry) => {
                    report.reused.push(rel.clone());
                    placements.push(key);
                }
                Lookup::Hit(_) => {
                    tracing::debug!(%key, "cached output targets another location, recompiling");
                    queue.push(rel.clone());
                }
                Lookup::Inconsistent { missing } => {
                    tracing::warn!(
                        %key,
                        missing = %missing.display(),
                        "cached output is gone, recompiling"
                    );
                    reparse.insert(rel.clone());
                    queue.push(rel.clone());
                }
                _ => queue.push(rel.clone()),
            }
        }

        if queue.is_empty() {
            tracing::debug!("every module is up to date");
            return Ok((placements, hashed.failures));
        }

        let entry_points = queue.iter().map(|rel| to_slash(rel)).collect();
        let pass = self.run_pass(entry_points, reparse, report)?;
        let queued: BTreeSet<&PathBuf> = queue.iter().collect();

        for visited in pass.outcome.visited.values() {
            let Some(rel) = &visited.module.relative else {
                continue;
            };
            let key = CacheKey::module(rel);
            let metadata_key = self.metadata_key(&key, visited)?;
            if queued.contains(rel) && !visited.artifacts.is_empty() {
                self.store.put(CacheEntry {
                    key: key.clone(),
                    content_hash: visited.module.hash,
                    metadata_key,
                    output_artifacts: visited.artifacts.clone(),
                    scratch: pass.region,
                });
                report.compiled.push(rel.clone());
                placements.push(key);
            } else {
                self.store.refresh_metadata(key, visited.module.hash, metadata_key, pass.region);
            }
        }
        if !pass.outcome.unowned_artifacts.is_empty() {
            tracing::warn!(
                count = pass.outcome.unowned_artifacts.len(),
                "artifacts not attributed to a module are not cached in directory mode"
            );
        }

        if let Some(err) = pass.failure {
            self.store.save()?;
            return Err(err.into());
        }
        if let Some(rel) = queue.iter().find(|rel| !report.compiled.contains(*rel)) {
            self.store.save()?;
            return Err(BuildError::MissingOutput { unit: rel.clone() });
        }
        Ok((placements, hashed.failures))
    }

    /// Bundle mode: one entry for the aggregate of every module.
    fn build_bundle(
        &mut self,
        tree: &SourceTree,
        report: &mut BuildReport,
    ) -> Result<Vec<CacheKey>, BuildError> {
        let bundle = SourceHasher::bundle_hash(&self.config.source_dir, &tree.modules)?;
        report.changes = SourceHasher::detect_changes(&bundle.members, self.store.manifest());

        let aggregate = bundle.aggregate;
        let key = CacheKey::bundle(&to_slash(&self.config.output));
        let mut reparse = BTreeSet::new();
        match self.store.validate(&key, aggregate, true) {
            Lookup::Hit(_) => {
                tracing::debug!(%key, "bundle is up to date");
                report.reused = tree.modules.clone();
                return Ok(vec![key]);
            }
            Lookup::Inconsistent { missing } => {
                tracing::warn!(
                    %key,
                    missing = %missing.display(),
                    "cached bundle is gone, rebuilding"
                );
                reparse = tree.modules.iter().cloned().collect();
            }
            _ => {}
        }

        if tree.modules.is_empty() {
            tracing::info!("no modules to bundle");
            return Ok(Vec::new());
        }

        let entry_points = tree.modules.iter().map(|rel| to_slash(rel)).collect();
        let pass = self.run_pass(entry_points, reparse, report)?;

        for visited in pass.outcome.visited.values() {
            let Some(rel) = &visited.module.relative else {
                continue;
            };
            let key = CacheKey::module(rel);
            let metadata_key = self.metadata_key(&key, visited)?;
            self.store.refresh_metadata(key, visited.module.hash, metadata_key, pass.region);
        }

        if let Some(err) = pass.failure {
            self.store.save()?;
            return Err(err.into());
        }
        let artifacts = pass.outcome.all_artifacts();
        if artifacts.is_empty() {
            return Err(BuildError::MissingOutput {
                unit: self.config.output.clone(),
            });
        }
        self.store.put(CacheEntry {
            key: key.clone(),
            content_hash: aggregate,
            metadata_key: None,
            output_artifacts: artifacts,
            scratch: pass.region,
        });
        report.compiled = tree.modules.clone();
        Ok(vec![key])
    }

    /// Invokes the transformer once over `entry_points` in a fresh region.
    ///
    /// Modules in `reparse` are loaded from source even if the cache holds
    /// their parse results.
    fn run_pass(
        &mut self,
        entry_points: Vec<String>,
        reparse: BTreeSet<PathBuf>,
        report: &mut BuildReport,
    ) -> Result<Pass, BuildError> {
        let region = self.store.allocate_scratch_region()?;
        tracing::info!(modules = entry_points.len(), region = region.location.0, "compiling");

        let Self {
            config,
            options,
            resolvers,
            store,
            transformer,
            ..
        } = self;
        let chain = ResolverChain::new(
            store,
            resolvers
                .iter_mut()
                .map(|r| r.as_mut() as &mut dyn Resolver)
                .collect(),
            &config.source_dir,
            &config.extension,
        )
        .bypass_cache(reparse);
        let target = OutputTarget {
            kind: config.output_kind,
            root: region.path.clone(),
            relative: config.output.clone(),
        };
        let mut ctx = CompileContext::new(entry_points, chain, options, target);
        let result = transformer.compile(&mut ctx);
        let outcome = ctx.finish();

        report.transformer_invocations += 1;
        report.resolved_from_cache += outcome.resolution.from_cache;
        report.resolved_from_disk += outcome.resolution.from_resolvers;
        if let Err(err) = &result {
            tracing::warn!(%err, "transformer failed");
        }
        Ok(Pass {
            region: region.location,
            outcome,
            failure: result.err(),
        })
    }

    /// Metadata key to record for a visited module: the existing snapshot
    /// for a cached module, a new snapshot for one the transformer parsed.
    fn metadata_key(
        &self,
        key: &CacheKey,
        visited: &VisitedModule,
    ) -> Result<Option<String>, BuildError> {
        if visited.module.is_cached() {
            return Ok(self.store.lookup(key).and_then(|e| e.metadata_key.clone()));
        }
        match &visited.completed {
            Some(metadata) => Ok(Some(self.store.store_metadata(metadata)?)),
            None => Ok(None),
        }
    }
}

/// Identity of the options that shape parse results and generated code.
///
/// The output target and kind are left out so that directory and bundle
/// builds of the same sources can share one store: their entries live under
/// different keys, and directory reuse checks artifact locations itself.
fn options_fingerprint(config: &ResolvedBuild, formatter: &Formatter) -> String {
    let base_path = config.base_path.to_string_lossy();
    let resolvers = config.resolvers.join(",");
    let parts = [
        config.extension.as_str(),
        formatter.name(),
        &base_path,
        config.source_root.as_str(),
        &resolvers,
    ];
    ContentHash::from_bytes(parts.join("\0").as_bytes()).to_string()
}
