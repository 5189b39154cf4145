//! Error types for mason
//!
//! Uses `miette` for pretty error reporting with help text. Structural errors
//! (names, defaults, cycles) are raised before anything runs; execution errors
//! are recorded per task in the invocation report.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mason operations
#[derive(Error, Diagnostic, Debug)]
pub enum MasonError {
    #[error("Manifest file not found")]
    #[diagnostic(
        code(mason::config::not_found),
        help("Create a mason.toml in your project root, or specify one with --manifest")
    )]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse manifest {}", .path.display())]
    #[diagnostic(code(mason::config::parse))]
    ConfigParse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("Invalid task '{task}': {reason}")]
    #[diagnostic(code(mason::config::invalid_task))]
    InvalidTask { task: String, reason: String },

    #[error("Invalid provider '{provider}': {reason}")]
    #[diagnostic(code(mason::config::invalid_provider))]
    InvalidProvider { provider: String, reason: String },

    #[error("Name '{name}' is already registered")]
    #[diagnostic(
        code(mason::registry::duplicate),
        help("Providers and tasks share a single namespace")
    )]
    DuplicateName { name: String },

    #[error("Task '{name}' cannot be the default target, '{existing}' already is")]
    #[diagnostic(code(mason::registry::multiple_defaults))]
    MultipleDefaults { existing: String, name: String },

    #[error("No default target")]
    #[diagnostic(
        code(mason::target::no_default),
        help("Name a target on the command line or mark one task with `default = true`")
    )]
    NoDefaultTarget { available: Vec<String> },

    #[error("Task '{name}' not found")]
    #[diagnostic(
        code(mason::target::not_found),
        help("Run `mason --list` to see available tasks")
    )]
    TaskNotFound { name: String, available: Vec<String> },

    #[error("'{task}' depends on '{name}', which is neither a provider nor a task")]
    #[diagnostic(code(mason::graph::unknown_dependency))]
    UnknownDependency { task: String, name: String },

    #[error("Circular dependency detected: {cycle}")]
    #[diagnostic(
        code(mason::graph::cycle),
        help("Check the 'depends' and 'discover' lists of the tasks in the cycle")
    )]
    CyclicDependency { cycle: String },

    #[error("Provider '{provider}' failed: {reason}")]
    #[diagnostic(code(mason::provider::resolution))]
    Resolution { provider: String, reason: String },

    #[error("Task '{task}' skipped: dependency '{dependency}' failed (root cause: '{root}')")]
    #[diagnostic(code(mason::exec::skipped))]
    SkippedDueToDependencyFailure {
        task: String,
        dependency: String,
        root: String,
    },

    #[error("Recipe '{recipe}' failed with {}: {command}", exit_status(.code))]
    #[diagnostic(code(mason::exec::failed))]
    RecipeExecution {
        recipe: String,
        command: String,
        code: Option<i32>,
        #[help]
        stderr: Option<String>,
    },

    #[error("{} recipes of task '{task}' failed", .failures.len())]
    #[diagnostic(code(mason::exec::failed_many))]
    RecipesFailed {
        task: String,
        #[related]
        failures: Vec<MasonError>,
    },

    #[error("Recipe '{recipe}' timed out after {seconds}s")]
    #[diagnostic(code(mason::exec::timeout))]
    RecipeTimeout { recipe: String, seconds: u64 },

    #[error("Recipe '{recipe}' succeeded but did not produce {}", .path.display())]
    #[diagnostic(
        code(mason::exec::missing_output),
        help("The command must write its artifact to the path bound to {{output}}")
    )]
    MissingOutput { recipe: String, path: PathBuf },

    #[error("Command not found: {command}")]
    #[diagnostic(
        code(mason::exec::command_not_found),
        help("Ensure the command is installed and in your PATH")
    )]
    CommandNotFound { command: String },

    #[error("Invalid command template '{template}': {reason}")]
    #[diagnostic(code(mason::recipe::template))]
    InvalidTemplate { template: String, reason: String },

    #[error("Task '{task}' failed: {reason}")]
    #[diagnostic(code(mason::task::failed))]
    TaskFailed { task: String, reason: String },

    #[error("Interrupted")]
    #[diagnostic(code(mason::interrupted))]
    Interrupted,

    #[error("I/O error")]
    #[diagnostic(code(mason::io))]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize {what}")]
    #[diagnostic(code(mason::serialize))]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MasonError {
    /// Shorthand for a failure raised from inside a task body
    pub fn task(task: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TaskFailed {
            task: task.into(),
            reason: reason.to_string(),
        }
    }

    /// Structural errors abort an invocation before anything runs
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. }
                | Self::MultipleDefaults { .. }
                | Self::CyclicDependency { .. }
                | Self::UnknownDependency { .. }
                | Self::TaskNotFound { .. }
                | Self::NoDefaultTarget { .. }
        )
    }
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Result type alias for mason operations
pub type Result<T> = std::result::Result<T, MasonError>;
