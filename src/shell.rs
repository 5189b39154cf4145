//! Shell executor: runs one recipe as an external process
//!
//! Outputs are staged: `{output}` is bound to a temporary path next to the
//! artifact and renamed into place only after the command succeeds. A failed,
//! timed out or cancelled run leaves nothing at the final path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{self, Freshness};
use crate::error::{MasonError, Result};
use crate::recipe::Recipe;

/// What happened to a recipe
#[derive(Debug, Clone)]
pub struct RecipeOutcome {
    pub label: String,
    /// Final artifact path, if the recipe declares one
    pub output: Option<PathBuf>,
    pub cached: bool,
    pub stdout: String,
}

/// Runs recipes as child processes
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Working directory for recipes that do not set their own
    cwd: PathBuf,
    /// Variables applied on top of the inherited process environment
    env: HashMap<String, String>,
    force: bool,
}

impl ShellExecutor {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: HashMap::new(),
            force: false,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Ignore the freshness cache
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Working directory a recipe will run in
    pub fn working_dir(&self, recipe: &Recipe) -> PathBuf {
        match &recipe.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.cwd.join(dir),
            None => self.cwd.clone(),
        }
    }

    /// Run a recipe unless its output is fresh
    pub async fn run(&self, recipe: &Recipe) -> Result<RecipeOutcome> {
        if !self.force {
            if let Freshness::Fresh = cache::check_recipe(recipe) {
                debug!(recipe = %recipe.label, "cache hit");
                return Ok(RecipeOutcome {
                    label: recipe.label.clone(),
                    output: recipe.output.clone(),
                    cached: true,
                    stdout: String::new(),
                });
            }
        }

        let staged = match &recipe.output {
            Some(output) => Some(StagedOutput::new(output)?),
            None => None,
        };

        let argv = recipe.argv_with(staged.as_ref().map(StagedOutput::path))?;
        let stdout = self.spawn(recipe, &argv).await?;

        if let Some(staged) = staged {
            staged.persist(&recipe.label)?;
        }

        Ok(RecipeOutcome {
            label: recipe.label.clone(),
            output: recipe.output.clone(),
            cached: false,
            stdout,
        })
    }

    async fn spawn(&self, recipe: &Recipe, argv: &[String]) -> Result<String> {
        let program = &argv[0];
        let cwd = self.working_dir(recipe);

        // Bare names go through PATH, anything with a separator is used as-is
        if !program.contains(std::path::MAIN_SEPARATOR) && which::which(program).is_err() {
            return Err(MasonError::CommandNotFound {
                command: program.clone(),
            });
        }

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .current_dir(&cwd)
            .envs(&self.env)
            .envs(&recipe.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(recipe = %recipe.label, cwd = %cwd.display(), "running {}", recipe.command_line());

        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MasonError::CommandNotFound {
                command: program.clone(),
            },
            _ => MasonError::Io(e),
        })?;

        let output = match recipe.timeout {
            Some(limit) => timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| MasonError::RecipeTimeout {
                    recipe: recipe.label.clone(),
                    seconds: limit.as_secs(),
                })??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            return Err(MasonError::RecipeExecution {
                recipe: recipe.label.clone(),
                command: recipe.command_line(),
                code: output.status.code(),
                stderr: (!stderr.is_empty()).then_some(stderr),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Temporary artifact path, removed on drop unless persisted
#[derive(Debug)]
pub struct StagedOutput {
    staged: PathBuf,
    target: PathBuf,
    persisted: bool,
}

static STAGE_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl StagedOutput {
    pub fn new(target: &Path) -> Result<Self> {
        let dir = target.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)?;
        }

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let staged_name = format!(
            ".{}.mason-{}-{}.tmp",
            name,
            std::process::id(),
            STAGE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let staged = match dir {
            Some(dir) => dir.join(staged_name),
            None => PathBuf::from(staged_name),
        };

        Ok(Self {
            staged,
            target: target.to_path_buf(),
            persisted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.staged
    }

    /// Move the staged artifact to its final path
    pub fn persist(mut self, recipe: &str) -> Result<PathBuf> {
        if !self.staged.exists() {
            return Err(MasonError::MissingOutput {
                recipe: recipe.to_string(),
                path: self.target.clone(),
            });
        }

        std::fs::rename(&self.staged, &self.target)?;
        self.persisted = true;
        Ok(self.target.clone())
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if self.persisted || !self.staged.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.staged) {
            warn!(path = %self.staged.display(), "failed to remove staged output: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Recipe {
        Recipe::new("script", "sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_runs_and_captures_stdout() {
        let temp = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(temp.path());

        let outcome = executor.run(&shell("echo hello")).await.unwrap();
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(!outcome.cached);
    }

    #[tokio::test]
    async fn test_failure_carries_code_and_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(temp.path());

        let err = executor
            .run(&shell("echo broken >&2; exit 3"))
            .await
            .unwrap_err();

        match err {
            MasonError::RecipeExecution { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.as_deref(), Some("broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_is_staged_then_renamed() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("a.cpp");
        std::fs::write(&src, "int main() {}").unwrap();
        let out = temp.path().join("a");

        let recipe = Recipe::new("a", "cp")
            .arg(src.as_path())
            .output_arg()
            .input(&src)
            .output(&out);
        let executor = ShellExecutor::new(temp.path());

        let first = executor.run(&recipe).await.unwrap();
        assert!(!first.cached);
        assert!(out.exists());

        let mtime = std::fs::metadata(&out).unwrap().modified().unwrap();
        let second = executor.run(&recipe).await.unwrap();
        assert!(second.cached);
        assert_eq!(std::fs::metadata(&out).unwrap().modified().unwrap(), mtime);

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_leaves_no_artifact() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("broken");

        // Writes a partial file to the staged path, then fails
        let recipe = Recipe::new("broken", "sh")
            .arg("-c")
            .arg("echo partial > \"$0\"; exit 1")
            .output_arg()
            .output(&out);

        let executor = ShellExecutor::new(temp.path());
        assert!(executor.run(&recipe).await.is_err());
        assert!(!out.exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_success_without_output_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let recipe = Recipe::new("lazy", "true").output(temp.path().join("never"));

        let err = ShellExecutor::new(temp.path()).run(&recipe).await.unwrap_err();
        assert!(matches!(err, MasonError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn test_unknown_program() {
        let temp = tempfile::tempdir().unwrap();
        let recipe = Recipe::new("ghost", "definitely-not-a-real-program-mason");

        let err = ShellExecutor::new(temp.path()).run(&recipe).await.unwrap_err();
        assert!(matches!(err, MasonError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let temp = tempfile::tempdir().unwrap();
        let recipe = Recipe::new("slow", "sleep")
            .arg("5")
            .timeout(std::time::Duration::from_millis(100));

        let err = ShellExecutor::new(temp.path()).run(&recipe).await.unwrap_err();
        assert!(matches!(err, MasonError::RecipeTimeout { .. }));
    }

    #[test]
    fn test_staged_paths_differ_for_same_target() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("a");

        let first = StagedOutput::new(&target).unwrap();
        let second = StagedOutput::new(&target).unwrap();

        assert_ne!(first.path(), second.path());
        assert_eq!(first.path().parent(), Some(temp.path()));
    }
}
