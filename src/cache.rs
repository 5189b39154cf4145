//! Timestamp-based freshness cache for recipe outputs
//!
//! A recipe is skipped when its output exists and is at least as new as every
//! input and `requires` file. Anything that cannot be checked counts as stale,
//! so an ambiguous answer re-executes instead of reusing a stale artifact.
//!
//! There is no cache directory: the artifacts and their modification times are
//! the whole persisted state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::recipe::Recipe;

/// Outcome of a freshness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Output exists and is not older than any input
    Fresh,
    /// The recipe declares no output, so it always runs
    NoOutput,
    /// The output does not exist (or its timestamp cannot be read)
    Missing,
    /// An input is newer than the output
    Stale { newer: PathBuf },
    /// An input cannot be inspected
    Unknown { path: PathBuf, reason: String },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::Fresh => write!(f, "up to date"),
            Freshness::NoOutput => write!(f, "no output declared"),
            Freshness::Missing => write!(f, "output missing"),
            Freshness::Stale { newer } => write!(f, "{} is newer than the output", newer.display()),
            Freshness::Unknown { path, reason } => write!(f, "cannot inspect {}: {}", path.display(), reason),
        }
    }
}

/// Compare an output's modification time against its inputs
pub fn check<'a>(output: &Path, inputs: impl IntoIterator<Item = &'a Path>) -> Freshness {
    let output_time = match modified(output) {
        Ok(time) => time,
        Err(_) => return Freshness::Missing,
    };

    for input in inputs {
        match modified(input) {
            Ok(time) if time <= output_time => {}
            Ok(_) => {
                return Freshness::Stale {
                    newer: input.to_path_buf(),
                }
            }
            Err(e) => {
                return Freshness::Unknown {
                    path: input.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        }
    }

    Freshness::Fresh
}

/// Freshness of a recipe, honouring its `keep` flag
pub fn check_recipe(recipe: &Recipe) -> Freshness {
    let Some(output) = recipe.output.as_deref() else {
        return Freshness::NoOutput;
    };

    if !recipe.keep {
        return Freshness::Missing;
    }

    let freshness = check(output, recipe.freshness_inputs());
    debug!(recipe = %recipe.label, %freshness, "freshness check");
    freshness
}

fn modified(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(path: &Path, offset: i64) {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        let now = SystemTime::now();
        let time = if offset >= 0 {
            now + Duration::from_secs(offset as u64)
        } else {
            now - Duration::from_secs((-offset) as u64)
        };
        file.set_modified(time).unwrap();
    }

    #[test]
    fn test_fresh_when_output_newer() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("a.cpp");
        let out = temp.path().join("a");
        touch(&src, -10);
        touch(&out, 0);

        assert_eq!(check(&out, [src.as_path()]), Freshness::Fresh);
    }

    #[test]
    fn test_stale_when_input_touched() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("a.cpp");
        let header = temp.path().join("a.h");
        let out = temp.path().join("a");
        touch(&src, -10);
        touch(&out, 0);
        touch(&header, 10);

        let freshness = check(&out, [src.as_path(), header.as_path()]);
        assert_eq!(freshness, Freshness::Stale { newer: header });
    }

    #[test]
    fn test_missing_output() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("a.cpp");
        touch(&src, 0);

        assert_eq!(check(&temp.path().join("a"), [src.as_path()]), Freshness::Missing);
    }

    #[test]
    fn test_missing_input_is_not_fresh() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("b");
        touch(&out, 0);

        let freshness = check(&out, [temp.path().join("b.cpp").as_path()]);
        assert!(matches!(freshness, Freshness::Unknown { .. }));
    }

    #[test]
    fn test_recipe_without_keep_always_runs() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("a");
        touch(&out, 0);

        let recipe = Recipe::new("a", "true").output(&out);
        assert!(check_recipe(&recipe).is_fresh());
        assert_eq!(check_recipe(&recipe.keep(false)), Freshness::Missing);
    }
}
