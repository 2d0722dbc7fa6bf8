//! Build resolution: turning a parsed `kiln.toml` into absolute paths and
//! a decided output kind.

use crate::types::{FormatterSelection, KilnConfig, MaterializeMode, OutputKind};
use kiln_common::path::{has_extension, normalize};
use std::path::{Path, PathBuf};

/// How the output kind of a build was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKindOrigin {
    /// Set by `build.output_kind`.
    Explicit,
    /// Inferred from the extension of `build.output`.
    Inferred,
}

/// A fully resolved build configuration with defaults applied and every
/// path made absolute against the project directory.
#[derive(Debug, Clone)]
pub struct ResolvedBuild {
    /// Absolute source directory.
    pub source_dir: PathBuf,
    /// Output target, relative to the destination root.
    pub output: PathBuf,
    /// Whether the output is one bundle file or a directory.
    pub output_kind: OutputKind,
    /// How `output_kind` was decided.
    pub output_kind_origin: OutputKindOrigin,
    /// Set when an explicit directory target's name ends in the module
    /// extension. The configured kind is kept; callers should report it.
    pub ambiguous_output: bool,
    /// Module file extension, without the leading dot.
    pub extension: String,
    /// Formatter selection.
    pub formatter: FormatterSelection,
    /// Ordered resolver names queried after the cache shim.
    pub resolvers: Vec<String>,
    /// Provenance label for embedded source metadata.
    pub source_root: String,
    /// Absolute base path for relative source identifiers.
    pub base_path: PathBuf,
    /// Absolute persistent cache directory, if any.
    pub cache_dir: Option<PathBuf>,
    /// How artifacts are placed into the destination.
    pub materialize: MaterializeMode,
}

/// Resolves a parsed configuration against the project directory.
pub fn resolve_build(config: &KilnConfig, project_dir: &Path) -> ResolvedBuild {
    let build = &config.build;
    let source_dir = normalize(&project_dir.join(&build.source));
    let output = normalize(Path::new(&build.output));
    let (output_kind, output_kind_origin, ambiguous_output) =
        decide_output_kind(&output, build.output_kind, &build.extension);

    let base_path = build
        .base_path
        .as_ref()
        .map(|p| normalize(&project_dir.join(p)))
        .unwrap_or_else(|| source_dir.clone());

    ResolvedBuild {
        source_dir,
        output,
        output_kind,
        output_kind_origin,
        ambiguous_output,
        extension: build.extension.clone(),
        formatter: build.formatter.clone(),
        resolvers: build.resolvers.clone(),
        source_root: build.source_root.clone(),
        base_path,
        cache_dir: config
            .cache
            .dir
            .as_ref()
            .map(|d| normalize(&project_dir.join(d))),
        materialize: config.cache.materialize,
    }
}

/// Decides the output kind from the explicit flag, falling back to the
/// extension of the output path.
///
/// Returns the kind, how it was decided, and whether the explicit choice
/// conflicts with the path's appearance.
pub fn decide_output_kind(
    output: &Path,
    explicit: Option<OutputKind>,
    extension: &str,
) -> (OutputKind, OutputKindOrigin, bool) {
    let looks_like_file = has_extension(output, extension);
    match explicit {
        Some(OutputKind::Directory) => (
            OutputKind::Directory,
            OutputKindOrigin::Explicit,
            looks_like_file,
        ),
        Some(OutputKind::File) => (OutputKind::File, OutputKindOrigin::Explicit, false),
        None if looks_like_file => (OutputKind::File, OutputKindOrigin::Inferred, false),
        None => (OutputKind::Directory, OutputKindOrigin::Inferred, false),
    }
}
