//! mason - a dependency-injected recipe graph executor
//!
//! Loads `mason.toml`, builds the provider/task registry and runs the
//! requested target:
//! - parallel execution of independent tasks and recipes
//! - timestamp-based caching of recipe outputs
//! - dependencies discovered while the build runs
//! - compilation database output

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use console::style;
use miette::{Diagnostic, GraphicalReportHandler, GraphicalTheme};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, GraphFormat, ListFormat, Mode};
use mason::compdb::CompileDatabase;
use mason::executor::InvocationReport;
use mason::graph::{DependencyGraph, NodeKind};
use mason::{Executor, ExecutorConfig, Manifest, MasonError, Registry, Result};

const DEFAULT_COMPILE_DB: &str = "compile_commands.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Set up panic handler for nice error messages
    miette::set_panic_hook();

    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose { "mason=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    // Handle --no-color
    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // Change working directory if specified
    if let Some(cwd) = &cli.cwd {
        std::env::set_current_dir(cwd)?;
    }

    let manifest = Manifest::load(cli.manifest.as_deref())?;
    let registry = Arc::new(manifest.registry()?);

    match cli.mode() {
        Mode::List(format) => {
            print_list(&registry, format)?;
            Ok(ExitCode::SUCCESS)
        }

        Mode::Check => {
            registry.check()?;
            let target = registry
                .default_target()
                .map(|t| format!(", default target '{}'", t))
                .unwrap_or_default();

            println!(
                "{} {} is valid ({} providers, {} tasks{})",
                style("✓").green(),
                manifest.path.display(),
                registry.providers().count(),
                registry.tasks().count(),
                target
            );
            Ok(ExitCode::SUCCESS)
        }

        Mode::Graph(format) => {
            let target = registry.select_target(cli.target.as_deref())?;
            let graph = DependencyGraph::build(&registry, target)?;
            print_graph(&graph, format)?;
            Ok(ExitCode::SUCCESS)
        }

        Mode::CompileDb(path) => {
            let path = path
                .cloned()
                .or_else(|| manifest.config.settings.compile_db.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_COMPILE_DB));
            let path = manifest.root.join(path);

            let exec_config = ExecutorConfig {
                dry_run: true,
                quiet: true,
                ..executor_config(&cli, &manifest)
            };
            let executor = Executor::new(Arc::clone(&registry), exec_config);
            let report = interruptible(executor.run(cli.target.as_deref())).await?;

            let db = CompileDatabase::from_recipes(&report.recipes, &manifest.root)?;
            db.write(&path)?;

            if !cli.quiet {
                println!(
                    "{} wrote {} ({} entries)",
                    style("✓").green(),
                    path.display(),
                    db.len()
                );
            }
            Ok(finish(&report))
        }

        Mode::Run => {
            let executor = Executor::new(Arc::clone(&registry), executor_config(&cli, &manifest));
            let report = interruptible(executor.run(cli.target.as_deref())).await?;
            Ok(finish(&report))
        }
    }
}

fn executor_config(cli: &Cli, manifest: &Manifest) -> ExecutorConfig {
    ExecutorConfig {
        parallelism: cli.parallel.unwrap_or(manifest.config.settings.parallelism),
        dry_run: cli.dry_run,
        force: cli.force,
        cwd: manifest.root.clone(),
        env: manifest.env.process_env(),
        verbose: cli.verbose,
        quiet: cli.quiet,
    }
}

/// Abort the invocation on Ctrl-C. Dropping the future kills running
/// children and removes their staged outputs.
async fn interruptible<T>(work: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => Err(MasonError::Interrupted),
    }
}

/// Exit status of a finished invocation; the first failure is rendered last
fn finish(report: &InvocationReport) -> ExitCode {
    if report.success() {
        return ExitCode::SUCCESS;
    }

    if let Some(error) = report.first_error() {
        eprintln!();
        report_error(error);
    }
    ExitCode::FAILURE
}

fn report_error(error: &dyn Diagnostic) {
    let theme = if console::colors_enabled_stderr() {
        GraphicalTheme::unicode()
    } else {
        GraphicalTheme::unicode_nocolor()
    };

    let mut rendered = String::new();
    match GraphicalReportHandler::new_themed(theme).render_report(&mut rendered, error) {
        Ok(()) => eprint!("{}", rendered),
        Err(_) => eprintln!("{}: {}", style("error").red().bold(), error),
    }
}

fn print_list(registry: &Registry, format: ListFormat) -> Result<()> {
    match format {
        ListFormat::Table => {
            let width = registry
                .providers()
                .map(|p| p.name.len())
                .chain(registry.tasks().map(|t| t.name.len()))
                .max()
                .unwrap_or(0);

            println!("{}", style("Providers:").bold());
            for provider in registry.providers() {
                let cache = if provider.caching { "" } else { " [uncached]" };
                println!(
                    "  {}{}  {}{}",
                    style(&provider.name).magenta(),
                    " ".repeat(width - provider.name.len()),
                    style(provider.desc.as_deref().unwrap_or("")).dim(),
                    style(cache).yellow().dim()
                );
            }

            println!();
            println!("{}", style("Tasks:").bold());
            for task in registry.tasks() {
                print!(
                    "  {}{}  {}",
                    style(&task.name).cyan().bold(),
                    " ".repeat(width - task.name.len()),
                    style(task.desc.as_deref().unwrap_or("")).dim()
                );
                if !task.params.is_empty() {
                    print!(
                        " {}",
                        style(format!("[deps: {}]", task.params.join(", "))).yellow().dim()
                    );
                }
                if task.default {
                    print!(" {}", style("(default)").green());
                }
                println!();
            }
        }

        ListFormat::Json => {
            let mut providers = serde_json::Map::new();
            for provider in registry.providers() {
                providers.insert(
                    provider.name.clone(),
                    serde_json::json!({
                        "description": provider.desc,
                        "cache": provider.caching,
                    }),
                );
            }

            let mut tasks = serde_json::Map::new();
            for task in registry.tasks() {
                tasks.insert(
                    task.name.clone(),
                    serde_json::json!({
                        "description": task.desc,
                        "depends": task.params,
                        "default": task.default,
                    }),
                );
            }

            let output = serde_json::json!({
                "providers": providers,
                "tasks": tasks,
            });
            println!("{}", to_json(&output)?);
        }

        ListFormat::Plain => {
            for name in registry.task_names() {
                println!("{}", name);
            }
        }
    }

    Ok(())
}

fn print_graph(graph: &DependencyGraph, format: GraphFormat) -> Result<()> {
    let nodes = graph.execution_order();

    match format {
        GraphFormat::Text => {
            println!(
                "{} {}",
                style("Dependency graph of").bold(),
                style(graph.target()).cyan().bold()
            );
            println!();

            for node in &nodes {
                let name = match node.kind {
                    NodeKind::Provider => style(node.name.as_str()).magenta(),
                    NodeKind::Task => style(node.name.as_str()).cyan().bold(),
                };
                let deps = graph.dependencies(&node.name).unwrap_or_default();

                if deps.is_empty() {
                    println!("  {}", name);
                } else {
                    println!("  {} {} {}", name, style("←").dim(), deps.join(", "));
                }
            }
        }

        GraphFormat::Dot => {
            println!("digraph mason {{");
            println!("  rankdir=LR;");
            println!("  node [shape=box];");

            for node in &nodes {
                if node.kind == NodeKind::Provider {
                    println!("  \"{}\" [shape=ellipse];", node.name);
                }
                for dep in graph.dependencies(&node.name).unwrap_or_default() {
                    println!("  \"{}\" -> \"{}\";", dep, node.name);
                }
            }

            println!("}}");
        }

        GraphFormat::Json => {
            let mut json_nodes = Vec::new();
            let mut edges = Vec::new();

            for node in &nodes {
                json_nodes.push(serde_json::json!({
                    "id": node.name,
                    "kind": node.kind.as_str(),
                }));

                for dep in graph.dependencies(&node.name).unwrap_or_default() {
                    edges.push(serde_json::json!({
                        "from": dep,
                        "to": node.name,
                    }));
                }
            }

            let output = serde_json::json!({
                "target": graph.target(),
                "nodes": json_nodes,
                "edges": edges,
            });
            println!("{}", to_json(&output)?);
        }
    }

    Ok(())
}

fn to_json(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| MasonError::Serialize {
        what: "listing".to_string(),
        source: e,
    })
}
