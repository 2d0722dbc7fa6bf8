//! Placing cached artifacts and passthrough files into the destination tree.

use std::io;
use std::path::{Path, PathBuf};

use kiln_config::MaterializeMode;

use crate::error::BuildError;
use crate::hasher::SourceHasher;
use crate::manifest::CacheEntry;
use crate::store::CacheStore;

/// Writes build results into a destination directory.
///
/// Placement is idempotent: a destination file whose bytes already match
/// the source is left untouched.
#[derive(Debug, Clone, Copy)]
pub struct Materializer {
    mode: MaterializeMode,
}

impl Materializer {
    /// Creates a materializer placing files by `mode`.
    pub fn new(mode: MaterializeMode) -> Self {
        Self { mode }
    }

    /// Places every artifact of `entry` at the same relative path under
    /// `dest`. Returns the number of files written.
    pub fn place(
        &self,
        store: &CacheStore,
        entry: &CacheEntry,
        dest: &Path,
    ) -> Result<usize, BuildError> {
        let mut written = 0;
        for artifact in &entry.output_artifacts {
            let from = store.artifact_path(entry, artifact);
            if self.place_file(&from, &dest.join(artifact))? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Copies a passthrough file from the source tree to the same relative
    /// path under `dest`. Returns `false` if the destination was already
    /// up to date.
    pub fn copy_passthrough(
        &self,
        source_dir: &Path,
        relative: &Path,
        dest: &Path,
    ) -> Result<bool, BuildError> {
        let from = source_dir.join(relative);
        let to = dest.join(relative);
        if is_same_content(&from, &to) {
            return Ok(false);
        }
        prepare_target(&to)?;
        std::fs::copy(&from, &to).map_err(materialize_error(&to))?;
        Ok(true)
    }

    /// Removes a file an earlier build placed at `relative` under `dest`,
    /// then any parent directories left empty, up to `dest` itself.
    /// Returns `false` if there was nothing to remove.
    ///
    /// A directory now occupying the path is left alone.
    pub fn remove_stale(&self, dest: &Path, relative: &Path) -> Result<bool, BuildError> {
        let path = dest.join(relative);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => return Ok(false),
            Ok(_) => std::fs::remove_file(&path).map_err(materialize_error(&path))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(materialize_error(&path)(e)),
        }
        tracing::debug!(path = %path.display(), "removed stale output");

        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == dest || !current.starts_with(dest) {
                break;
            }
            // Fails on a non-empty directory, which ends the walk.
            if std::fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(true)
    }

    fn place_file(&self, from: &Path, to: &Path) -> Result<bool, BuildError> {
        match self.mode {
            MaterializeMode::Copy => {
                if is_same_content(from, to) {
                    return Ok(false);
                }
                prepare_target(to)?;
                std::fs::copy(from, to).map_err(materialize_error(to))?;
            }
            MaterializeMode::Symlink => {
                if std::fs::read_link(to).is_ok_and(|target| target == from) {
                    return Ok(false);
                }
                prepare_target(to)?;
                if let Err(err) = symlink(from, to) {
                    tracing::debug!(%err, path = %to.display(), "symlink failed, copying");
                    std::fs::copy(from, to).map_err(materialize_error(to))?;
                }
            }
        }
        tracing::trace!(path = %to.display(), "placed");
        Ok(true)
    }
}

/// `true` if `to` is a regular file with the same bytes as `from`.
fn is_same_content(from: &Path, to: &Path) -> bool {
    let Ok(meta) = std::fs::symlink_metadata(to) else {
        return false;
    };
    if !meta.file_type().is_file() {
        return false;
    }
    match (SourceHasher::hash_file(from), SourceHasher::hash_file(to)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Creates parent directories and clears whatever occupies `to`.
///
/// Removing first means a copy never writes through a symlink left by a
/// previous symlink-mode build into the cache.
fn prepare_target(to: &Path) -> Result<(), BuildError> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(materialize_error(parent))?;
    }
    match std::fs::symlink_metadata(to) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(to).map_err(materialize_error(to)),
        Ok(_) => std::fs::remove_file(to).map_err(materialize_error(to)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(materialize_error(to)(e)),
    }
}

#[cfg(unix)]
fn symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(from, to)
}

#[cfg(not(unix))]
fn symlink(_from: &Path, _to: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks unavailable"))
}

fn materialize_error(path: &Path) -> impl FnOnce(io::Error) -> BuildError {
    let path: PathBuf = path.to_path_buf();
    move |source| BuildError::Materialize { path, source }
}
