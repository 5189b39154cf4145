//! CLI argument definitions
//!
//! Uses `clap` derive API for argument parsing.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// mason - run a target of a dependency-injected recipe graph
#[derive(Parser, Debug)]
#[command(name = "mason")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Task to run (the default target when omitted)
    pub target: Option<String>,

    /// List providers and tasks without executing anything
    #[arg(short, long)]
    pub list: bool,

    /// Output format for --list
    #[arg(long, value_name = "FMT", default_value = "table")]
    pub format: ListFormat,

    /// Print the dependency graph of the target
    #[arg(
        long,
        value_name = "FMT",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "text"
    )]
    pub graph: Option<GraphFormat>,

    /// Write a compilation database for the target's recipes without running them
    #[arg(long, value_name = "PATH", num_args = 0..=1, require_equals = true)]
    pub compile_db: Option<Option<PathBuf>>,

    /// Validate the manifest: names, default target and cycles
    #[arg(long)]
    pub check: bool,

    /// Show what would run without running it
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Run recipes even if their outputs are fresh
    #[arg(short, long)]
    pub force: bool,

    /// Maximum concurrent recipes (0 = number of CPUs)
    #[arg(short = 'j', long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Path to mason.toml (searched upward from the working directory otherwise)
    #[arg(short, long, value_name = "PATH", env = "MASON_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Working directory
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress progress and result lines
    #[arg(short, long)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListFormat {
    #[default]
    Table,
    Json,
    Plain,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GraphFormat {
    #[default]
    Text,
    Dot,
    Json,
}

/// What an invocation does, in order of precedence
#[derive(Debug, PartialEq, Eq)]
pub enum Mode<'a> {
    List(ListFormat),
    Check,
    Graph(GraphFormat),
    CompileDb(Option<&'a PathBuf>),
    Run,
}

impl Cli {
    pub fn mode(&self) -> Mode<'_> {
        if self.list {
            Mode::List(self.format)
        } else if self.check {
            Mode::Check
        } else if let Some(format) = self.graph {
            Mode::Graph(format)
        } else if let Some(path) = &self.compile_db {
            Mode::CompileDb(path.as_ref())
        } else {
            Mode::Run
        }
    }
}
