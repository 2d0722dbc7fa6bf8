//! Loaded modules as seen by the transformer.
//!
//! A module reaches the transformer in one of two shapes: freshly read from
//! disk (source text still to be parsed) or hydrated from the cache (parse
//! results already known). The transformer treats both uniformly through
//! [`Module::metadata`] and [`Module::source_text`].

use std::path::PathBuf;

use kiln_common::ContentHash;
use serde::{Deserialize, Serialize};

/// Parse results for one module, opaque to the cache.
///
/// The transformer decides what goes into `parsed`; the cache only stores
/// and returns it. Once written to the cache a snapshot is never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Import paths declared by the module, as written.
    pub imports: Vec<String>,
    /// Names exported by the module.
    pub exports: Vec<String>,
    /// Transformer-specific parsed representation.
    pub parsed: Vec<u8>,
}

/// The contents of a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleBody {
    /// Source text read from disk; the transformer must parse it.
    Source(String),
    /// Parse results restored from a still-valid cache entry.
    Cached(ModuleMetadata),
}

/// A module loaded during one compile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Absolute, lexically normalized path of the module file.
    pub path: PathBuf,
    /// Path relative to the source directory, when the module lives inside it.
    pub relative: Option<PathBuf>,
    /// The import path under which the module was requested.
    pub import_path: String,
    /// Hash of the bytes this module was produced from.
    pub hash: ContentHash,
    /// Source text or cached parse results.
    pub body: ModuleBody,
}

impl Module {
    /// Returns `true` if this module was hydrated from the cache.
    pub fn is_cached(&self) -> bool {
        matches!(self.body, ModuleBody::Cached(_))
    }

    /// Returns the cached parse results, if this module came from the cache.
    pub fn metadata(&self) -> Option<&ModuleMetadata> {
        match &self.body {
            ModuleBody::Cached(meta) => Some(meta),
            ModuleBody::Source(_) => None,
        }
    }

    /// Returns the source text, if this module was read from disk.
    pub fn source_text(&self) -> Option<&str> {
        match &self.body {
            ModuleBody::Source(text) => Some(text),
            ModuleBody::Cached(_) => None,
        }
    }
}
