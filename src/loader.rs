//! Turns a parsed manifest into a [`Registry`]
//!
//! Providers become glob or file-list producers rooted at the manifest
//! directory. Tasks become bodies that materialize their command template into
//! recipes, one per item for `each` tasks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{BuildEnv, Config, ProviderConfig, TaskConfig, INPUT_PLACEHOLDER};
use crate::error::{MasonError, Result};
use crate::recipe::{output_for, CommandTemplate, Recipe};
use crate::registry::{Provider, Registry, Step, Task};
use crate::sources;
use crate::value::Args;

/// A loaded manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    pub config: Config,
    pub path: PathBuf,
    /// Directory every relative path is resolved against
    pub root: PathBuf,
    pub env: Arc<BuildEnv>,
}

impl Manifest {
    /// Load from the given path, or search upward for mason.toml
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config, path) = Config::load(path)?;
        Ok(Self::new(config, path))
    }

    pub fn new(config: Config, path: PathBuf) -> Self {
        let path = absolute(&path);
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let env = Arc::new(BuildEnv::from_config(&config.env));

        Self {
            config,
            path,
            root,
            env,
        }
    }

    /// Register every provider and task of the manifest
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();

        for (name, provider) in &self.config.providers {
            registry.register_provider(self.provider(name, provider)?)?;
        }

        for (name, task) in &self.config.tasks {
            registry.register_task(self.task(name, task)?)?;
        }

        debug!(
            manifest = %self.path.display(),
            providers = self.config.providers.len(),
            tasks = self.config.tasks.len(),
            "loaded manifest"
        );

        Ok(registry)
    }

    fn provider(&self, name: &str, config: &ProviderConfig) -> Result<Provider> {
        let invalid = |reason: String| MasonError::InvalidProvider {
            provider: name.to_string(),
            reason,
        };

        let provider = match &config.glob {
            Some(pattern) => {
                let pattern = expand(pattern).map_err(invalid)?;
                Provider::new(name, sources::glob(name, &self.root, &pattern, &config.exclude)?)
            }
            None => {
                let files = config
                    .files
                    .iter()
                    .map(|f| expand(f))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(invalid)?;
                Provider::new(name, sources::files(&self.root, &files))
            }
        };

        let provider = if config.cache { provider } else { provider.uncached() };
        Ok(match &config.desc {
            Some(desc) => provider.desc(desc.clone()),
            None => provider,
        })
    }

    fn task(&self, name: &str, config: &TaskConfig) -> Result<Task> {
        let plan = Arc::new(TaskPlan::new(name, config, &self.root, Arc::clone(&self.env))?);

        let mut task = Task::new(name, config.depends.clone(), move |args: &Args| plan.step(args))
            .keep(config.keep);
        if config.default {
            task = task.default();
        }
        if let Some(desc) = &config.desc {
            task = task.desc(desc.clone());
        }
        Ok(task)
    }
}

enum Action {
    /// Value is the list of the dependencies' values
    Group,
    Run(CommandTemplate),
    Each { over: String, template: CommandTemplate },
}

/// Everything a manifest task body needs, prepared once at load
struct TaskPlan {
    name: String,
    action: Action,
    depends: Vec<String>,
    discover: Vec<String>,
    requires: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    build_env: Arc<BuildEnv>,
    root: PathBuf,
}

impl TaskPlan {
    fn new(name: &str, config: &TaskConfig, root: &Path, build_env: Arc<BuildEnv>) -> Result<Self> {
        let action = match (&config.run, &config.each, &config.command) {
            (Some(run), _, _) => Action::Run(CommandTemplate::parse(run)?),
            (None, Some(over), Some(command)) => Action::Each {
                over: over.clone(),
                template: CommandTemplate::parse(command)?,
            },
            _ => Action::Group,
        };

        let cwd = match &config.cwd {
            Some(dir) => {
                let dir = expand(&dir.to_string_lossy()).map_err(|reason| MasonError::InvalidTask {
                    task: name.to_string(),
                    reason,
                })?;
                Some(root.join(dir))
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            action,
            depends: config.depends.clone(),
            discover: config.discover.clone(),
            requires: config.requires.clone(),
            cwd,
            env: config.env.clone(),
            timeout: config.timeout.map(Duration::from_secs),
            build_env,
            root: root.to_path_buf(),
        })
    }

    fn step(&self, args: &Args) -> Result<Step> {
        let missing: Vec<String> = self
            .discover
            .iter()
            .filter(|name| !args.contains(name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(Step::Resolve(missing));
        }

        match &self.action {
            Action::Group => Ok(Step::Value(
                self.depends
                    .iter()
                    .map(|dep| args.get(dep).cloned().unwrap_or_default())
                    .collect(),
            )),
            Action::Run(template) => {
                let argv = template.materialize(&self.bindings(args))?;
                let recipe = self.configure(Recipe::from_argv(&self.name, argv)?, args)?;
                Ok(Step::Recipes(vec![recipe]))
            }
            Action::Each { over, template } => {
                let mut recipes = Vec::new();
                for item in args.paths(over)? {
                    recipes.push(self.each_recipe(template, &item, args)?);
                }
                Ok(Step::Recipes(recipes))
            }
        }
    }

    fn each_recipe(&self, template: &CommandTemplate, item: &Path, args: &Args) -> Result<Recipe> {
        let mut bindings = self.bindings(args);
        bindings.bind(INPUT_PLACEHOLDER, vec![item.to_string_lossy().into_owned()]);

        let label = item.strip_prefix(&self.root).unwrap_or(item).display().to_string();
        let recipe = Recipe::from_argv(label, template.materialize(&bindings)?)?.input(item);

        let recipe = if template.mentions_output() {
            let output = output_for(item);
            if output == item {
                return Err(MasonError::task(
                    &self.name,
                    format!("cannot derive an output path from {}", item.display()),
                ));
            }
            recipe.output(output)
        } else {
            recipe
        };

        self.configure(recipe, args)
    }

    fn configure(&self, mut recipe: Recipe, args: &Args) -> Result<Recipe> {
        for name in &self.requires {
            recipe = recipe.requires(args.paths(name)?);
        }
        if let Some(cwd) = &self.cwd {
            recipe = recipe.cwd(cwd);
        }
        if let Some(timeout) = self.timeout {
            recipe = recipe.timeout(timeout);
        }
        Ok(recipe.envs(self.env.clone()))
    }

    /// `[env]` entries, overridden by dependency values of the same name
    fn bindings(&self, args: &Args) -> crate::recipe::Bindings {
        let mut bindings = self.build_env.bindings();
        for (name, value) in args.iter() {
            bindings.bind_value(name, value);
        }
        bindings
    }
}

fn expand(input: &str) -> std::result::Result<String, String> {
    shellexpand::full(input)
        .map(|s| s.into_owned())
        .map_err(|e| format!("cannot expand '{}': {}", input, e))
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Arg;
    use crate::registry::ProviderCache;
    use crate::value::Value;
    use std::fs;

    fn manifest(root: &Path, toml: &str) -> Manifest {
        let path = root.join("mason.toml");
        let config = Config::parse(toml, &path).unwrap();
        Manifest::new(config, path)
    }

    fn literal(arg: &Arg) -> &str {
        match arg {
            Arg::Literal(s) => s,
            Arg::Output => "{output}",
        }
    }

    #[test]
    fn test_each_task_materializes_one_recipe_per_source() {
        let temp = tempfile::tempdir().unwrap();
        let toml = r#"
            [env]
            CC = "clang++"
            CFLAGS = ["-g", "-Iinclude"]

            [providers.test_sources]
            files = ["test/a.cpp", "test/b.cpp"]

            [providers.headers]
            files = ["include/t.h"]

            [tasks.tests]
            depends = ["test_sources", "headers"]
            each = "test_sources"
            command = "{CC} {CFLAGS} {input} -o {output}"
            requires = ["headers"]
        "#;
        let manifest = manifest(temp.path(), toml);
        let registry = manifest.registry().unwrap();
        let cache = ProviderCache::new();

        let mut args = Args::new("tests");
        args.insert("test_sources", registry.resolve("test_sources", &cache).unwrap());
        args.insert("headers", registry.resolve("headers", &cache).unwrap());

        let Step::Recipes(recipes) = registry.task("tests").unwrap().invoke(&args).unwrap() else {
            panic!("expected recipes");
        };

        assert_eq!(recipes.len(), 2);
        let first = &recipes[0];
        assert_eq!(first.label, "test/a.cpp");
        assert_eq!(first.output.as_deref(), Some(temp.path().join("test/a").as_path()));
        assert_eq!(first.requires, vec![temp.path().join("include/t.h")]);

        let argv: Vec<&str> = first.argv.iter().map(literal).collect();
        let source = temp.path().join("test/a.cpp");
        assert_eq!(
            argv,
            vec!["clang++", "-g", "-Iinclude", source.to_str().unwrap(), "-o", "{output}"]
        );
    }

    #[test]
    fn test_discover_requests_resolution_first() {
        let temp = tempfile::tempdir().unwrap();
        let toml = r#"
            [providers.lab_sources]
            glob = "lab/*.cpp"

            [tasks.labs]
            discover = ["lab_sources"]
            each = "lab_sources"
            command = "cp {input} {output}"
        "#;
        let registry = manifest(temp.path(), toml).registry().unwrap();
        let task = registry.task("labs").unwrap();

        match task.invoke(&Args::new("labs")).unwrap() {
            Step::Resolve(names) => assert_eq!(names, vec!["lab_sources"]),
            other => panic!("unexpected step: {other:?}"),
        }

        let mut args = Args::new("labs");
        args.insert("lab_sources", Value::from(vec![temp.path().join("lab/lex.cpp")]));
        assert!(matches!(task.invoke(&args).unwrap(), Step::Recipes(r) if r.len() == 1));
    }

    #[test]
    fn test_group_collects_dependency_values() {
        let temp = tempfile::tempdir().unwrap();
        let toml = r#"
            [providers.b]
            files = ["b.cpp"]

            [providers.a]
            files = ["a.cpp"]

            [tasks.all]
            depends = ["b", "a"]
            default = true
        "#;
        let registry = manifest(temp.path(), toml).registry().unwrap();
        assert_eq!(registry.default_target(), Some("all"));

        let mut args = Args::new("all");
        args.insert("a", Value::from("x"));
        args.insert("b", Value::from("y"));

        match registry.task("all").unwrap().invoke(&args).unwrap() {
            Step::Value(value) => assert_eq!(value, Value::from(vec!["y", "x"])),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_run_task_settings() {
        let temp = tempfile::tempdir().unwrap();
        let toml = r#"
            [tasks.submodules]
            run = "git submodule update --init --recursive"
            cwd = "vendor"
            timeout = 30
            keep = false
            env = { GIT_TERMINAL_PROMPT = "0" }
        "#;
        let registry = manifest(temp.path(), toml).registry().unwrap();
        let task = registry.task("submodules").unwrap();
        assert!(!task.keep);

        let Step::Recipes(recipes) = task.invoke(&Args::new("submodules")).unwrap() else {
            panic!("expected recipes");
        };
        let recipe = &recipes[0];
        assert_eq!(recipe.label, "submodules");
        assert_eq!(recipe.program(), "git");
        assert_eq!(recipe.cwd.as_deref(), Some(temp.path().join("vendor").as_path()));
        assert_eq!(recipe.timeout, Some(Duration::from_secs(30)));
        assert_eq!(recipe.env["GIT_TERMINAL_PROMPT"], "0");
        assert!(recipe.output.is_none());
    }

    #[test]
    fn test_source_without_extension_has_no_output() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("Makefile"), "").unwrap();
        let toml = r#"
            [providers.src]
            files = ["Makefile"]

            [tasks.copy]
            depends = ["src"]
            each = "src"
            command = "cp {input} {output}"
        "#;
        let registry = manifest(temp.path(), toml).registry().unwrap();

        let mut args = Args::new("copy");
        args.insert("src", Value::from(vec![temp.path().join("Makefile")]));
        assert!(matches!(
            registry.task("copy").unwrap().invoke(&args),
            Err(MasonError::TaskFailed { .. })
        ));
    }

    #[test]
    fn test_uncached_provider_flag() {
        let temp = tempfile::tempdir().unwrap();
        let toml = r#"
            [providers.listing]
            glob = "*.txt"
            cache = false
            desc = "Text files"
        "#;
        let registry = manifest(temp.path(), toml).registry().unwrap();
        let provider = registry.provider("listing").unwrap();
        assert!(!provider.caching);
        assert_eq!(provider.desc.as_deref(), Some("Text files"));
    }
}
