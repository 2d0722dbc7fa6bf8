//! Error types for cache and build operations.

use std::path::PathBuf;

/// Errors that can occur during cache operations.
///
/// Most cache operations are fail-safe: errors result in cache misses
/// rather than hard failures. This enum is used for internal error
/// propagation within the cache subsystem.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The cache manifest could not be parsed as valid JSON.
    #[error("failed to parse cache manifest: {reason}")]
    ManifestParse {
        /// Description of the parse failure.
        reason: String,
    },

    /// An artifact file has an invalid or missing header.
    #[error("invalid artifact header in {path}: {reason}")]
    InvalidHeader {
        /// The artifact file path.
        path: PathBuf,
        /// Description of the header problem.
        reason: String,
    },

    /// The stored checksum does not match the computed checksum of the payload.
    #[error("checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The artifact file path.
        path: PathBuf,
        /// The expected checksum from the header.
        expected: String,
        /// The actual checksum computed from the payload.
        actual: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

/// Errors raised while turning an import path into a loaded module.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No resolver in the chain produced a module, cached or on disk.
    #[error("cannot resolve '{import_path}' (looked for {path})")]
    NotFound {
        /// The import path as written by the importer.
        import_path: String,
        /// The resolved absolute path that was looked up.
        path: PathBuf,
    },

    /// The module file exists but could not be read.
    #[error("failed to read module {path}: {source}")]
    Read {
        /// The module file path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A custom resolver reported a failure.
    #[error("resolver '{resolver}' failed for '{import_path}': {message}")]
    Resolver {
        /// Name the resolver was registered under.
        resolver: String,
        /// The import path being resolved.
        import_path: String,
        /// Description of the failure.
        message: String,
    },
}

/// Errors raised by a [`Transformer`](crate::transformer::Transformer).
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// An import could not be resolved during compilation.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A module could not be transformed.
    #[error("failed to transform {module}: {message}")]
    Module {
        /// The module that failed.
        module: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// An output artifact could not be written.
    #[error("failed to write output {path}: {source}")]
    Write {
        /// The artifact path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Any other transformer failure.
    #[error("{0}")]
    Other(String),
}

/// Errors that abort (or partially fail) a build invocation.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// An imported module could not be resolved.
    #[error("resolution failed: {0}")]
    Resolution(ResolveError),

    /// A unit's inputs could not be hashed.
    #[error("failed to hash {path}: {source}")]
    Hash {
        /// The input that could not be hashed.
        path: PathBuf,
        /// The underlying cache error.
        source: CacheError,
    },

    /// Some independent units failed to hash; every other unit was built
    /// and placed.
    #[error("{} module(s) could not be built: {}", .failures.len(), summarize(.failures))]
    UnitsFailed {
        /// Each failed module with its error.
        failures: Vec<(PathBuf, CacheError)>,
    },

    /// The transformer failed; nothing was materialized.
    #[error("transformer failed: {0}")]
    Transformer(TransformError),

    /// A unit was compiled but the transformer recorded no artifact for it.
    #[error("{unit} was compiled but produced no output artifacts")]
    MissingOutput {
        /// The module or bundle that produced nothing.
        unit: PathBuf,
    },

    /// The configured formatter name is neither built in nor registered.
    #[error("unknown formatter '{0}'")]
    UnknownFormatter(String),

    /// The configured resolver name is neither built in nor registered.
    #[error("unknown resolver '{0}'")]
    UnknownResolver(String),

    /// The source tree could not be enumerated.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// The path being scanned.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A file could not be placed into the destination tree.
    #[error("failed to place {path}: {source}")]
    Materialize {
        /// The destination path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] kiln_config::ConfigError),

    /// A cache write failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<TransformError> for BuildError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Resolve(inner) => BuildError::Resolution(inner),
            other => BuildError::Transformer(other),
        }
    }
}

impl From<ResolveError> for BuildError {
    fn from(err: ResolveError) -> Self {
        BuildError::Resolution(err)
    }
}

fn summarize(failures: &[(PathBuf, CacheError)]) -> String {
    failures
        .iter()
        .map(|(path, _)| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
