//! Lexical path helpers shared by configuration and the cache.
//!
//! None of these functions touch the filesystem. Module identities are derived
//! from lexically normalized paths so that a symlinked directory or a missing
//! file never changes how a module is named.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Lexically normalizes a path, folding `.` and `..` components.
///
/// A `..` that would climb above the root (or above the start of a relative
/// path) is kept, so `../a` stays `../a`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Returns `true` if the final segment of `path` ends in `.<ext>`.
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

/// Appends `.<ext>` to `path` unless it already carries that extension.
///
/// Unlike [`Path::with_extension`], an existing unrelated extension is kept:
/// `lib/jquery.min` becomes `lib/jquery.min.js`.
pub fn append_extension(path: &Path, ext: &str) -> PathBuf {
    if has_extension(path, ext) {
        return path.to_path_buf();
    }
    let mut raw = OsString::from(path.as_os_str());
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

/// Renders a relative path with `/` separators, used for cache keys and
/// import paths so that keys are stable across platforms.
pub fn to_slash(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect();
    parts.join("/")
}
