//! Configuration types deserialized from `kiln.toml`.

use serde::Deserialize;

/// The top-level configuration parsed from `kiln.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct KilnConfig {
    /// What to build and how the output is laid out.
    pub build: BuildSection,
    /// Where cached state lives and how it is placed into the destination.
    #[serde(default)]
    pub cache: CacheSection,
}

/// The `[build]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSection {
    /// Source directory, relative to the project directory.
    pub source: String,
    /// Output target, relative to the destination root. Either a single
    /// bundle file or a directory receiving one artifact per module.
    pub output: String,
    /// Explicit output kind. When absent the kind is inferred from the
    /// extension of `output`.
    #[serde(default)]
    pub output_kind: Option<OutputKind>,
    /// Module file extension, without the leading dot.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Output formatter selection, passed through to the transformer.
    #[serde(default)]
    pub formatter: FormatterSelection,
    /// Ordered resolver names. The cache's resolution shim is always queried
    /// before any of these.
    #[serde(default = "default_resolvers")]
    pub resolvers: Vec<String>,
    /// Label recorded as the source root in embedded provenance metadata.
    #[serde(default = "default_source_root")]
    pub source_root: String,
    /// Base path used to compute relative source identifiers. Defaults to
    /// the source directory.
    #[serde(default)]
    pub base_path: Option<String>,
}

fn default_extension() -> String {
    "js".to_string()
}

fn default_resolvers() -> Vec<String> {
    vec!["file".to_string()]
}

fn default_source_root() -> String {
    "/".to_string()
}

/// Whether the output target is a single bundle file or a directory.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// One fused output file, invalidated as a whole.
    File,
    /// One output artifact per module, invalidated per module.
    Directory,
}

/// Formatter selection by name.
///
/// Built-in names map to their own variants; any other name refers to a
/// formatter registered programmatically and is looked up once when the
/// build is configured.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "String")]
pub enum FormatterSelection {
    /// Single-file bundle format.
    #[default]
    Bundle,
    /// One CommonJS-style module per source module.
    CommonJs,
    /// A formatter registered under this name.
    Custom(String),
}

impl From<String> for FormatterSelection {
    fn from(name: String) -> Self {
        match name.as_str() {
            "bundle" => FormatterSelection::Bundle,
            "commonjs" => FormatterSelection::CommonJs,
            _ => FormatterSelection::Custom(name),
        }
    }
}

impl FormatterSelection {
    /// Returns the configured name of this formatter.
    pub fn name(&self) -> &str {
        match self {
            FormatterSelection::Bundle => "bundle",
            FormatterSelection::CommonJs => "commonjs",
            FormatterSelection::Custom(name) => name,
        }
    }
}

/// The `[cache]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSection {
    /// Persistent cache directory, relative to the project directory. When
    /// absent the cache lives in a temporary directory removed on teardown.
    #[serde(default)]
    pub dir: Option<String>,
    /// How artifacts are placed into the destination tree.
    #[serde(default)]
    pub materialize: MaterializeMode,
}

/// How cached artifacts are placed into the destination tree.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaterializeMode {
    /// Copy the bytes.
    #[default]
    Copy,
    /// Symlink to the scratch area (falls back to copying off unix).
    Symlink,
}
