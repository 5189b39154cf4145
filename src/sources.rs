//! Built-in producers for source discovery
//!
//! Glob providers return absolute, sorted paths so recipes can run from any
//! working directory.

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{MasonError, Result};
use crate::value::Value;

const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

/// Producer listing the files that match `pattern` under `root`
pub fn glob(
    name: &str,
    root: &Path,
    pattern: &str,
    exclude: &[String],
) -> Result<impl Fn() -> Result<Value> + Send + Sync + 'static> {
    let name = name.to_string();
    let root = root.to_path_buf();
    let base = base_dir(&absolute(&root, pattern));
    let excludes = build_excludes(&name, exclude)?;

    // The root may itself contain glob metacharacters
    let pattern = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        Path::new(&::glob::Pattern::escape(&root.to_string_lossy()))
            .join(pattern)
            .to_string_lossy()
            .into_owned()
    };

    // Fail at registration on a malformed pattern, not at first use
    ::glob::Pattern::new(&pattern).map_err(|e| MasonError::InvalidProvider {
        provider: name.clone(),
        reason: format!("invalid glob '{}': {}", pattern, e),
    })?;

    Ok(move || {
        if !base.is_dir() {
            return Err(MasonError::Resolution {
                provider: name.clone(),
                reason: format!("directory {} does not exist", base.display()),
            });
        }

        let entries = ::glob::glob(&pattern).map_err(|e| MasonError::Resolution {
            provider: name.clone(),
            reason: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| MasonError::Resolution {
                provider: name.clone(),
                reason: e.to_string(),
            })?;
            let excluded = excludes.is_match(&path)
                || path
                    .strip_prefix(&root)
                    .map_or(false, |relative| excludes.is_match(relative));
            if path.is_file() && !excluded {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(Value::from(paths))
    })
}

/// Producer returning a fixed list of files, resolved against `root`
pub fn files(root: &Path, list: &[String]) -> impl Fn() -> Result<Value> + Send + Sync + 'static {
    let paths: Vec<PathBuf> = list.iter().map(|f| absolute(root, f)).collect();
    move || Ok(Value::from(paths.clone()))
}

/// Exclusions match either the absolute path or the path relative to the root
fn build_excludes(name: &str, patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| MasonError::InvalidProvider {
            provider: name.to_string(),
            reason: format!("invalid exclude pattern '{}': {}", pattern, e),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| MasonError::InvalidProvider {
        provider: name.to_string(),
        reason: format!("failed to build exclude set: {}", e),
    })
}

fn absolute(root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Longest leading directory of a pattern without glob characters
fn base_dir(pattern: &Path) -> PathBuf {
    let mut base = PathBuf::new();
    for component in pattern.components() {
        if let Component::Normal(part) = component {
            if part.to_string_lossy().contains(GLOB_CHARS) {
                break;
            }
        }
        base.push(component);
    }
    // The last literal component is a file name unless the pattern stops at a directory
    if base == pattern {
        base.pop();
    }
    base
}
