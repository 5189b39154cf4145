//! mason - a dependency-injected recipe graph executor
//!
//! Builds are described as named providers (zero-argument value sources) and
//! tasks whose parameters name the providers and tasks they depend on. A
//! target's dependency graph is resolved up front, run concurrently, and every
//! task may hand back recipes: external commands bound to an output artifact
//! that is rebuilt only when one of its inputs is newer.
//!
//! # Example
//!
//! ```toml
//! # mason.toml
//!
//! [env]
//! CC = "clang++"
//! CFLAGS = ["-g", "-I./include"]
//!
//! [providers.test_sources]
//! glob = "test/*.cpp"
//!
//! [tasks.tests]
//! depends = ["test_sources"]
//! each = "test_sources"
//! command = "{CC} {CFLAGS} {input} -o {output}"
//! default = true
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mason::{Args, Executor, ExecutorConfig, Recipe, Registry, Step, Task, Value};
//!
//! #[tokio::main]
//! async fn main() -> mason::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.provide("sources", || Ok(Value::from(vec!["main.cpp"])))?;
//!     registry.register_task(
//!         Task::new("binary", ["sources"], |args: &Args| {
//!             let src = args.paths("sources")?.remove(0);
//!             Ok(Step::Recipes(vec![Recipe::new("main", "clang++")
//!                 .arg(src.as_path())
//!                 .arg("-o")
//!                 .output_arg()
//!                 .input(&src)
//!                 .output(mason::recipe::output_for(&src))]))
//!         })
//!         .default(),
//!     )?;
//!
//!     let executor = Executor::new(Arc::new(registry), ExecutorConfig::default());
//!     let report = executor.run(None).await?;
//!     assert!(report.success());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod compdb;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod loader;
pub mod recipe;
pub mod registry;
pub mod shell;
pub mod sources;
pub mod value;

// Re-export main types
pub use config::{BuildEnv, Config};
pub use error::{MasonError, Result};
pub use executor::{Executor, ExecutorConfig, InvocationReport, NodeOutcome, NodeStatus};
pub use graph::DependencyGraph;
pub use loader::Manifest;
pub use recipe::Recipe;
pub use registry::{Provider, ProviderCache, Registry, Step, Task};
pub use value::{Args, Value};
