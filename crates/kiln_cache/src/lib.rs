//! Incremental build cache for module transformers.
//!
//! This crate sits in front of an opaque [`Transformer`] and decides, on
//! every build, which modules can be reused from the cache and which must be
//! recompiled. Unchanged modules that still have to be visited (because a
//! changed module imports them) are served from cached parse results through
//! the resolution shim instead of being parsed again.

#![warn(missing_docs)]

pub mod artifact;
pub mod build;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod materialize;
pub mod module;
pub mod resolver;
pub mod store;
pub mod transformer;
pub mod tree;

pub use build::{BuildReport, IncrementalBuild, IncrementalBuildBuilder};
pub use error::{BuildError, CacheError, ResolveError, TransformError};
pub use hasher::{BundleHashes, ChangeSet, SourceHasher};
pub use manifest::{CacheEntry, CacheKey, CacheManifest, ScratchLocation};
pub use materialize::Materializer;
pub use module::{Module, ModuleBody, ModuleMetadata};
pub use resolver::{CacheShim, FileResolver, ResolveRequest, Resolver, ResolverChain};
pub use store::{CacheStore, GcStats, Lookup, ScratchRegion};
pub use transformer::{
    CompileContext, CompileOutcome, Formatter, FormatterRegistry, OutputFormat, OutputTarget,
    TransformOptions, Transformer,
};
pub use tree::SourceTree;
