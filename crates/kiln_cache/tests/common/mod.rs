//! Shared fixtures for the incremental build tests.
//!
//! `ToyTransformer` understands a tiny module language: lines of the form
//! `import <path>` and `export <name>` declare edges and exports, a line
//! reading `fail` makes the module fail to compile, and every other line is
//! opaque body text. It counts how often it is invoked and how often each
//! module is parsed, so tests can observe what the cache saved.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_cache::{CompileContext, Module, ModuleMetadata, TransformError, Transformer};
use kiln_config::{load_config_from_str, resolve_build, OutputKind, ResolvedBuild};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fake transformer
// ---------------------------------------------------------------------------

/// A module's parse results plus the exports of the modules it imports.
#[derive(Clone)]
struct Loaded {
    meta: ModuleMetadata,
    imported: Vec<String>,
}

/// Instrumented transformer over the toy module language.
#[derive(Debug, Default)]
pub struct ToyTransformer {
    /// Number of `compile` calls.
    pub invocations: usize,
    /// Parse count per source-relative module path.
    pub parses: BTreeMap<PathBuf, usize>,
}

impl ToyTransformer {
    /// How many times the module at `rel` was parsed.
    pub fn parse_count(&self, rel: &str) -> usize {
        self.parses.get(Path::new(rel)).copied().unwrap_or(0)
    }

    /// Total parses across all modules.
    pub fn total_parses(&self) -> usize {
        self.parses.values().sum()
    }

    fn load(
        &mut self,
        ctx: &mut CompileContext<'_>,
        import_path: &str,
        from: Option<&Module>,
        seen: &mut BTreeMap<PathBuf, Loaded>,
    ) -> Result<(Module, Loaded), TransformError> {
        let module = ctx.resolve(import_path, from)?;
        if let Some(loaded) = seen.get(&module.path) {
            return Ok((module, loaded.clone()));
        }

        let meta = match module.metadata() {
            Some(meta) => meta.clone(),
            None => {
                let text = module.source_text().unwrap_or_default();
                if text.lines().any(|line| line.trim() == "fail") {
                    return Err(TransformError::Module {
                        module: module.path.clone(),
                        message: "syntax error".to_string(),
                    });
                }
                let meta = parse(text);
                if let Some(rel) = &module.relative {
                    *self.parses.entry(rel.clone()).or_default() += 1;
                }
                ctx.complete(&module, meta.clone());
                meta
            }
        };

        // Placeholder first so import cycles terminate.
        seen.insert(
            module.path.clone(),
            Loaded {
                meta: meta.clone(),
                imported: Vec::new(),
            },
        );
        let mut imported = Vec::new();
        for dep in &meta.imports {
            let (_, dep_loaded) = self.load(ctx, dep, Some(&module), seen)?;
            imported.extend(dep_loaded.meta.exports);
        }
        let loaded = Loaded { meta, imported };
        seen.insert(module.path.clone(), loaded.clone());
        Ok((module, loaded))
    }
}

impl Transformer for ToyTransformer {
    fn compile(&mut self, ctx: &mut CompileContext<'_>) -> Result<(), TransformError> {
        self.invocations += 1;
        let target = ctx.output().relative.clone();
        let kind = ctx.output().kind;
        let mut seen = BTreeMap::new();
        let mut bundle = String::new();

        for entry in ctx.entry_points().to_vec() {
            let (module, loaded) = self.load(ctx, &entry, None, &mut seen)?;
            let text = render(&module, &loaded);
            match kind {
                OutputKind::Directory => {
                    let rel = module
                        .relative
                        .clone()
                        .unwrap_or_else(|| PathBuf::from(&entry));
                    ctx.write_artifact(Some(&module), &target.join(rel), text.as_bytes())?;
                }
                OutputKind::File => bundle.push_str(&text),
            }
        }

        if kind == OutputKind::File {
            ctx.write_artifact(None, &target, bundle.as_bytes())?;
        }
        Ok(())
    }
}

fn parse(text: &str) -> ModuleMetadata {
    let mut meta = ModuleMetadata::default();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("import ") {
            meta.imports.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("export ") {
            meta.exports.push(rest.trim().to_string());
        }
    }
    meta.parsed = text.as_bytes().to_vec();
    meta
}

fn render(module: &Module, loaded: &Loaded) -> String {
    let name = module
        .relative
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| module.import_path.clone());
    format!(
        "// module {name}\n{}// uses: {}\n",
        String::from_utf8_lossy(&loaded.meta.parsed),
        loaded.imported.join(",")
    )
}

// ---------------------------------------------------------------------------
// On-disk project fixture
// ---------------------------------------------------------------------------

/// A temporary project: `src/` sources, `.kiln-cache/`, and a separate
/// destination directory.
pub struct Project {
    root: TempDir,
    dest: TempDir,
}

impl Project {
    /// Creates an empty project.
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("src")).unwrap();
        Self {
            root,
            dest: tempfile::tempdir().unwrap(),
        }
    }

    /// Project directory.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Source directory.
    pub fn src(&self) -> PathBuf {
        self.root.path().join("src")
    }

    /// Destination directory.
    pub fn dest(&self) -> &Path {
        self.dest.path()
    }

    /// Writes a source file, creating parent directories.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.src().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Reads a file from the destination tree.
    pub fn output(&self, rel: &str) -> String {
        fs::read_to_string(self.dest().join(rel)).unwrap()
    }

    /// Resolves a build from `[build]` lines, with a persistent cache in
    /// `.kiln-cache`.
    pub fn config(&self, build_lines: &str) -> ResolvedBuild {
        let toml = format!(
            "[build]\nsource = \"src\"\n{build_lines}\n\n[cache]\ndir = \".kiln-cache\"\n"
        );
        let config = load_config_from_str(&toml).unwrap();
        resolve_build(&config, self.root())
    }
}

/// `path` (absolute) spelled relative to the working directory.
pub fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut rel = PathBuf::new();
    for _ in cwd.components().skip(1) {
        rel.push("..");
    }
    rel.join(path.strip_prefix("/").unwrap())
}

/// Every file under `dir` with its bytes, following links.
pub fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}
