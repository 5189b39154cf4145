//! Configuration parsing for mason.toml
//!
//! Handles loading and validating the build manifest, and freezing the
//! `[env]` table into an immutable [`BuildEnv`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{MasonError, Result};
use crate::recipe::{Bindings, CommandTemplate, OUTPUT_PLACEHOLDER};

/// Default config file names to search for
pub const CONFIG_FILES: &[&str] = &["mason.toml", "Mason.toml"];

/// Process environment variables that override `[env]` entries
pub const ENV_OVERRIDES: &[&str] = &["CC", "CFLAGS", "LDFLAGS"];

/// Placeholder bound to the current item of an `each` task
pub const INPUT_PLACEHOLDER: &str = "input";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Build configuration, available as placeholders and recipe environment
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Provider definitions
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Task definitions
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
}

/// An `[env]` value: a single word or a list of words
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EnvValue {
    One(String),
    Many(Vec<String>),
}

impl EnvValue {
    pub fn words(&self) -> Vec<String> {
        match self {
            EnvValue::One(s) => vec![s.clone()],
            EnvValue::Many(words) => words.clone(),
        }
    }
}

/// Global settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Default parallelism level (0 = number of CPUs)
    #[serde(default)]
    pub parallelism: usize,

    /// Where `--compile-db` writes when no path is given
    #[serde(default)]
    pub compile_db: Option<PathBuf>,
}

/// Configuration for a single provider
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Human-readable description
    #[serde(default)]
    pub desc: Option<String>,

    /// Files matching a glob pattern
    #[serde(default)]
    pub glob: Option<String>,

    /// A fixed list of files
    #[serde(default)]
    pub files: Vec<String>,

    /// Patterns removed from the glob's matches
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Memoize the value for the whole invocation
    #[serde(default = "default_true")]
    pub cache: bool,
}

fn default_true() -> bool {
    true
}

/// Configuration for a single task
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Human-readable description
    #[serde(default)]
    pub desc: Option<String>,

    /// Dependencies resolved before the task starts
    #[serde(default)]
    pub depends: Vec<String>,

    /// Dependencies resolved only after `depends` have completed
    #[serde(default)]
    pub discover: Vec<String>,

    /// A single command
    #[serde(default)]
    pub run: Option<String>,

    /// Dependency whose items each get one `command` recipe
    #[serde(default)]
    pub each: Option<String>,

    /// Command template for `each`
    #[serde(default)]
    pub command: Option<String>,

    /// Dependencies whose files invalidate every recipe of this task
    #[serde(default)]
    pub requires: Vec<String>,

    /// Working directory, relative to the manifest
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Task-specific environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Reuse fresh outputs (false = always rebuild)
    #[serde(default = "default_true")]
    pub keep: bool,

    /// Timeout in seconds, per recipe
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Run this task when no target is named
    #[serde(default)]
    pub default: bool,
}

impl TaskConfig {
    /// Every dependency name, static ones first
    pub fn dependency_names(&self) -> impl Iterator<Item = &String> {
        self.depends.iter().chain(self.discover.iter())
    }

    /// The command template of this task, if it runs anything
    pub fn template(&self) -> Option<&str> {
        self.run.as_deref().or(self.command.as_deref())
    }
}

impl Config {
    /// Load configuration from the specified path or search for it
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let config_path = match path {
            Some(p) => {
                if p.exists() {
                    p.to_path_buf()
                } else {
                    return Err(MasonError::ConfigNotFound {
                        searched: vec![p.to_path_buf()],
                    });
                }
            }
            None => Self::find_config(&std::env::current_dir()?)?,
        };

        let content = std::fs::read_to_string(&config_path)?;
        let config = Self::parse(&content, &config_path)?;

        Ok((config, config_path))
    }

    /// Parse and validate manifest text
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| MasonError::ConfigParse {
            source: e,
            path: path.to_path_buf(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Search for config file starting from `start` and walking up
    pub fn find_config(start: &Path) -> Result<PathBuf> {
        let mut current = start.to_path_buf();
        let mut searched = Vec::new();

        loop {
            for name in CONFIG_FILES {
                let candidate = current.join(name);
                searched.push(candidate.clone());
                if candidate.exists() {
                    return Ok(candidate);
                }
            }

            if !current.pop() {
                break;
            }
        }

        Err(MasonError::ConfigNotFound { searched })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        for name in self.providers.keys() {
            if self.tasks.contains_key(name) {
                return Err(MasonError::DuplicateName { name: name.clone() });
            }
        }

        for (name, provider) in &self.providers {
            self.validate_provider(name, provider)?;
        }

        for (name, task) in &self.tasks {
            self.validate_task(name, task)?;
        }

        Ok(())
    }

    fn validate_provider(&self, name: &str, provider: &ProviderConfig) -> Result<()> {
        let invalid = |reason: &str| MasonError::InvalidProvider {
            provider: name.to_string(),
            reason: reason.to_string(),
        };

        match (&provider.glob, provider.files.is_empty()) {
            (Some(_), false) => Err(invalid("Provider cannot have both 'glob' and 'files'")),
            (None, true) => Err(invalid("Provider must have a 'glob' pattern or 'files'")),
            (None, false) if !provider.exclude.is_empty() => {
                Err(invalid("'exclude' only applies to 'glob' providers"))
            }
            _ => Ok(()),
        }
    }

    fn validate_task(&self, name: &str, task: &TaskConfig) -> Result<()> {
        let invalid = |reason: String| MasonError::InvalidTask {
            task: name.to_string(),
            reason,
        };

        if task.dependency_names().any(|dep| dep == name) {
            return Err(invalid("Task cannot depend on itself".to_string()));
        }

        // `discover` names never reach the graph builder before the run
        for dep in &task.discover {
            if !self.providers.contains_key(dep) && !self.tasks.contains_key(dep) {
                return Err(MasonError::UnknownDependency {
                    task: name.to_string(),
                    name: dep.clone(),
                });
            }
        }

        let deps: BTreeSet<&str> = task.dependency_names().map(String::as_str).collect();

        match (&task.run, &task.each, &task.command) {
            (Some(_), None, None) | (None, Some(_), Some(_)) => {}
            (None, None, None) => {
                if !task.discover.is_empty() {
                    return Err(invalid("'discover' requires 'run' or 'each'".to_string()));
                }
            }
            (Some(_), _, _) => {
                return Err(invalid("Task cannot have both 'run' and 'each'/'command'".to_string()))
            }
            (None, Some(_), None) => return Err(invalid("'each' requires a 'command'".to_string())),
            (None, None, Some(_)) => return Err(invalid("'command' requires 'each'".to_string())),
        }

        if let Some(each) = &task.each {
            if !deps.contains(each.as_str()) {
                return Err(invalid(format!(
                    "'each' names '{}', which is not in 'depends' or 'discover'",
                    each
                )));
            }
        }

        for required in &task.requires {
            if !deps.contains(required.as_str()) {
                return Err(invalid(format!(
                    "'requires' names '{}', which is not in 'depends' or 'discover'",
                    required
                )));
            }
        }

        if let Some(template) = task.template() {
            let template = CommandTemplate::parse(template)?;
            for placeholder in template.placeholders() {
                let known = deps.contains(placeholder)
                    || self.env.contains_key(placeholder)
                    || ENV_OVERRIDES.contains(&placeholder)
                    || (task.each.is_some()
                        && (placeholder == OUTPUT_PLACEHOLDER || placeholder == INPUT_PLACEHOLDER));
                if !known {
                    return Err(invalid(format!(
                        "unknown placeholder {{{}}} in '{}'",
                        placeholder,
                        template.as_str()
                    )));
                }
            }
        }

        if task.timeout == Some(0) {
            return Err(invalid("'timeout' must be at least one second".to_string()));
        }

        Ok(())
    }
}

/// Build configuration frozen at load time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnv {
    vars: BTreeMap<String, Vec<String>>,
}

impl BuildEnv {
    /// Freeze `[env]`, applying overrides from the process environment
    pub fn from_config(env: &BTreeMap<String, EnvValue>) -> Self {
        Self::with_overrides(env, |key| std::env::var(key).ok())
    }

    pub fn with_overrides(
        env: &BTreeMap<String, EnvValue>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut vars: BTreeMap<String, Vec<String>> = env
            .iter()
            .map(|(key, value)| (key.clone(), value.words()))
            .collect();

        for key in ENV_OVERRIDES {
            if let Some(value) = lookup(key) {
                vars.insert(
                    key.to_string(),
                    value.split_whitespace().map(str::to_string).collect(),
                );
            }
        }

        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.vars.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Variables for recipe subprocesses, lists joined with spaces
    pub fn process_env(&self) -> HashMap<String, String> {
        self.vars
            .iter()
            .map(|(key, words)| (key.clone(), words.join(" ")))
            .collect()
    }

    /// Every entry as a template binding
    pub fn bindings(&self) -> Bindings {
        let mut bindings = Bindings::new();
        for (key, words) in &self.vars {
            bindings.bind(key.clone(), words.clone());
        }
        bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<Config> {
        Config::parse(toml, Path::new("mason.toml"))
    }

    #[test]
    fn test_parse_build_manifest() {
        let toml = r#"
            [env]
            CC = "clang++"
            CFLAGS = ["-g", "-I./include", "--std=c++2a"]

            [settings]
            parallelism = 4

            [providers.test_sources]
            glob = "test/*.cpp"

            [providers.headers]
            glob = "include/timefilter/*.h"
            cache = false

            [tasks.tests]
            depends = ["test_sources", "headers"]
            each = "test_sources"
            command = "{CC} {CFLAGS} {input} -o {output}"
            requires = ["headers"]

            [tasks.all]
            depends = ["tests"]
            default = true
        "#;

        let config = parse(toml).unwrap();
        assert_eq!(config.env["CC"], EnvValue::One("clang++".to_string()));
        assert_eq!(config.env["CFLAGS"].words().len(), 3);
        assert_eq!(config.settings.parallelism, 4);
        assert!(config.providers["test_sources"].cache);
        assert!(!config.providers["headers"].cache);
        assert!(config.tasks["all"].default);
        assert!(config.tasks["tests"].keep);
        assert_eq!(config.tasks.keys().collect::<Vec<_>>(), vec!["all", "tests"]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse("[tasks.a]\nrun = \"true\"\nparallel = true\n").unwrap_err();
        assert!(matches!(err, MasonError::ConfigParse { .. }));
    }

    #[test]
    fn test_run_and_each_conflict() {
        let toml = r#"
            [providers.src]
            files = ["a.cpp"]

            [tasks.bad]
            depends = ["src"]
            run = "true"
            each = "src"
            command = "cp {input} {output}"
        "#;
        assert!(matches!(parse(toml), Err(MasonError::InvalidTask { .. })));
    }

    #[test]
    fn test_each_must_be_a_dependency() {
        let toml = r#"
            [providers.src]
            files = ["a.cpp"]

            [tasks.bad]
            each = "src"
            command = "cp {input} {output}"
        "#;
        match parse(toml) {
            Err(MasonError::InvalidTask { task, reason }) => {
                assert_eq!(task, "bad");
                assert!(reason.contains("'src'"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let toml = r#"
            [tasks.bad]
            run = "{CXX} main.cpp"
        "#;
        match parse(toml) {
            Err(MasonError::InvalidTask { reason, .. }) => assert!(reason.contains("{CXX}")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_output_only_for_each_tasks() {
        assert!(parse("[tasks.bad]\nrun = \"touch {output}\"\n").is_err());
    }

    #[test]
    fn test_provider_needs_one_source() {
        assert!(matches!(
            parse("[providers.empty]\n"),
            Err(MasonError::InvalidProvider { .. })
        ));
        assert!(matches!(
            parse("[providers.both]\nglob = \"*.cpp\"\nfiles = [\"a.cpp\"]\n"),
            Err(MasonError::InvalidProvider { .. })
        ));
    }

    #[test]
    fn test_provider_and_task_share_name() {
        let toml = r#"
            [providers.tests]
            files = ["a.cpp"]

            [tasks.tests]
            run = "true"
        "#;
        assert!(matches!(parse(toml), Err(MasonError::DuplicateName { .. })));
    }

    #[test]
    fn test_unknown_discover_name() {
        let toml = r#"
            [tasks.labs]
            discover = ["lab_sources"]
            each = "lab_sources"
            command = "cp {input} {output}"
        "#;
        assert!(matches!(
            parse(toml),
            Err(MasonError::UnknownDependency { task, name }) if task == "labs" && name == "lab_sources"
        ));
    }

    #[test]
    fn test_self_dependency() {
        assert!(matches!(
            parse("[tasks.loop]\ndepends = [\"loop\"]\n"),
            Err(MasonError::InvalidTask { .. })
        ));
    }

    #[test]
    fn test_find_config_walks_up() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("mason.toml"), "").unwrap();
        let nested = temp.path().join("test/unit");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(Config::find_config(&nested).unwrap(), temp.path().join("mason.toml"));
    }

    #[test]
    fn test_build_env_overrides() {
        let mut env = BTreeMap::new();
        env.insert("CC".to_string(), EnvValue::One("clang++".to_string()));
        env.insert(
            "CFLAGS".to_string(),
            EnvValue::Many(vec!["-g".to_string(), "-O0".to_string()]),
        );

        let build_env = BuildEnv::with_overrides(&env, |key| match key {
            "CFLAGS" => Some("-O2  -Wall".to_string()),
            _ => None,
        });

        assert_eq!(build_env.get("CC").unwrap(), ["clang++"]);
        assert_eq!(build_env.get("CFLAGS").unwrap(), ["-O2", "-Wall"]);
        assert_eq!(build_env.process_env()["CFLAGS"], "-O2 -Wall");
        assert!(!build_env.contains("LDFLAGS"));
    }
}
