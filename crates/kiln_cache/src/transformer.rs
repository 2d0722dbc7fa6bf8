//! The interface between the cache and the module transformer it wraps.
//!
//! The transformer is opaque: the cache hands it a [`CompileContext`]
//! describing which modules to compile and where to write, and the
//! transformer reports back, through the same context, what it parsed and
//! which files it produced.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_config::{FormatterSelection, OutputKind};

use crate::error::{BuildError, ResolveError, TransformError};
use crate::module::{Module, ModuleMetadata};
use crate::resolver::{ResolutionStats, ResolverChain};

/// A module-to-module source transformer.
pub trait Transformer {
    /// Compiles the context's entry points, writing output under
    /// [`CompileContext::output`].
    ///
    /// Implementations load every module through [`CompileContext::resolve`],
    /// report parse results for freshly read modules with
    /// [`CompileContext::complete`], and report every file they write with
    /// [`CompileContext::write_artifact`] (or the `emit` methods).
    fn compile(&mut self, ctx: &mut CompileContext<'_>) -> Result<(), TransformError>;
}

/// A custom output format, passed through to the transformer.
pub trait OutputFormat: fmt::Debug + Send + Sync {
    /// Name the format is registered under.
    fn name(&self) -> &str;
}

/// The output format the transformer should generate.
#[derive(Debug, Clone)]
pub enum Formatter {
    /// Single-file bundle.
    Bundle,
    /// One CommonJS-style module per source module.
    CommonJs,
    /// A registered custom format.
    Custom(Arc<dyn OutputFormat>),
}

impl Formatter {
    /// Name of the format.
    pub fn name(&self) -> &str {
        match self {
            Formatter::Bundle => "bundle",
            Formatter::CommonJs => "commonjs",
            Formatter::Custom(format) => format.name(),
        }
    }
}

/// Custom formats available to configuration by name.
#[derive(Debug, Default, Clone)]
pub struct FormatterRegistry {
    custom: HashMap<String, Arc<dyn OutputFormat>>,
}

impl FormatterRegistry {
    /// Creates a registry with only the built-in formats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom format under its own name.
    pub fn register(&mut self, format: Arc<dyn OutputFormat>) {
        self.custom.insert(format.name().to_string(), format);
    }

    /// Resolves a configured formatter once, at configuration time.
    pub fn resolve(&self, selection: &FormatterSelection) -> Result<Formatter, BuildError> {
        match selection {
            FormatterSelection::Bundle => Ok(Formatter::Bundle),
            FormatterSelection::CommonJs => Ok(Formatter::CommonJs),
            FormatterSelection::Custom(name) => self
                .custom
                .get(name)
                .cloned()
                .map(Formatter::Custom)
                .ok_or_else(|| BuildError::UnknownFormatter(name.clone())),
        }
    }
}

/// Options passed through to the transformer unchanged.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Output format.
    pub formatter: Formatter,
    /// Base path for relative source identifiers in embedded metadata.
    pub base_path: PathBuf,
    /// Source-root label for embedded provenance metadata.
    pub source_root: String,
    /// Module file extension.
    pub extension: String,
}

/// Where the transformer writes during one pass.
///
/// `root` is an isolated scratch region that mirrors the destination tree;
/// `relative` is the configured output target inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    /// Bundle file or per-module directory.
    pub kind: OutputKind,
    /// Scratch region directory for this pass.
    pub root: PathBuf,
    /// Output target relative to `root` (and to the destination root).
    pub relative: PathBuf,
}

impl OutputTarget {
    /// Absolute path of the output target inside the scratch region.
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.relative)
    }
}

/// One module the pass loaded, and what the transformer reported about it.
#[derive(Debug, Clone)]
pub struct VisitedModule {
    /// The module as it was loaded.
    pub module: Module,
    /// Parse results reported for a freshly read module.
    pub completed: Option<ModuleMetadata>,
    /// Artifacts attributed to this module, relative to the region root.
    pub artifacts: Vec<PathBuf>,
}

impl VisitedModule {
    /// Metadata to record for this module: its cached snapshot, or what
    /// the transformer reported after parsing it.
    pub fn metadata(&self) -> Option<&ModuleMetadata> {
        self.module.metadata().or(self.completed.as_ref())
    }
}

/// What one compile pass produced, detached from the resolver chain.
#[derive(Debug, Default)]
pub struct CompileOutcome {
    /// Every module loaded in the pass, keyed by absolute path.
    pub visited: BTreeMap<PathBuf, VisitedModule>,
    /// Artifacts not attributed to any module, relative to the region root.
    pub unowned_artifacts: Vec<PathBuf>,
    /// Where modules were loaded from.
    pub resolution: ResolutionStats,
}

impl CompileOutcome {
    /// Every artifact of the pass, attributed or not, in emission order per
    /// module and sorted by module path.
    pub fn all_artifacts(&self) -> Vec<PathBuf> {
        let mut all: Vec<PathBuf> = self
            .visited
            .values()
            .flat_map(|v| v.artifacts.iter().cloned())
            .collect();
        all.extend(self.unowned_artifacts.iter().cloned());
        all
    }
}

/// State of one compile pass, shared between the cache and the transformer.
pub struct CompileContext<'a> {
    entry_points: Vec<String>,
    chain: ResolverChain<'a>,
    options: &'a TransformOptions,
    output: OutputTarget,
    outcome: CompileOutcome,
}

impl<'a> CompileContext<'a> {
    /// Creates the context for one pass.
    pub fn new(
        entry_points: Vec<String>,
        chain: ResolverChain<'a>,
        options: &'a TransformOptions,
        output: OutputTarget,
    ) -> Self {
        Self {
            entry_points,
            chain,
            options,
            output,
            outcome: CompileOutcome::default(),
        }
    }

    /// Import paths of the modules that must be compiled in this pass.
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    /// Options passed through from configuration.
    pub fn options(&self) -> &TransformOptions {
        self.options
    }

    /// The selected output format.
    pub fn formatter(&self) -> &Formatter {
        &self.options.formatter
    }

    /// Where output must be written.
    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    /// Loads a module, consulting this pass's registry first and the
    /// resolver chain (cache shim first) otherwise.
    pub fn resolve(
        &mut self,
        import_path: &str,
        from: Option<&Module>,
    ) -> Result<Module, ResolveError> {
        let from_path = from.map(|m| m.path.as_path());
        let path = self.chain.locate(import_path, from_path);
        if let Some(visited) = self.outcome.visited.get(&path) {
            return Ok(visited.module.clone());
        }
        let module = self.chain.load(import_path, from_path, &path)?;
        self.outcome.visited.insert(
            path,
            VisitedModule {
                module: module.clone(),
                completed: None,
                artifacts: Vec::new(),
            },
        );
        Ok(module)
    }

    /// Records the parse results of a freshly read module.
    ///
    /// Cached modules already carry their metadata; completing one is a no-op.
    pub fn complete(&mut self, module: &Module, metadata: ModuleMetadata) {
        if module.is_cached() {
            return;
        }
        if let Some(visited) = self.outcome.visited.get_mut(&module.path) {
            visited.completed = Some(metadata);
        }
    }

    /// Records an artifact written under the region root on behalf of `module`.
    pub fn emit_for(&mut self, module: &Module, artifact: impl Into<PathBuf>) {
        let artifact = artifact.into();
        match self.outcome.visited.get_mut(&module.path) {
            Some(visited) => visited.artifacts.push(artifact),
            None => self.outcome.unowned_artifacts.push(artifact),
        }
    }

    /// Records an artifact written under the region root that belongs to
    /// the pass as a whole (a bundle or its source map).
    pub fn emit(&mut self, artifact: impl Into<PathBuf>) {
        self.outcome.unowned_artifacts.push(artifact.into());
    }

    /// Writes `bytes` to `relative` under the region root, creating parent
    /// directories, and records the artifact.
    pub fn write_artifact(
        &mut self,
        module: Option<&Module>,
        relative: &Path,
        bytes: &[u8],
    ) -> Result<(), TransformError> {
        let path = self.output.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TransformError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(&path, bytes).map_err(|e| TransformError::Write { path, source: e })?;
        match module {
            Some(module) => self.emit_for(module, relative),
            None => self.emit(relative),
        }
        Ok(())
    }

    /// Ends the pass, releasing the resolver chain.
    pub fn finish(mut self) -> CompileOutcome {
        self.outcome.resolution = self.chain.stats();
        self.outcome
    }
}
