//! Task scheduler
//!
//! Walks a [`DependencyGraph`] with a tokio `JoinSet`: every node whose
//! dependencies are complete is spawned at once, and eligibility is
//! re-evaluated each time any job finishes. Task bodies get their
//! dependencies' values injected by name, recipes they return are executed
//! concurrently under a semaphore, and failures skip only the nodes that
//! depend on them.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use console::style;
use futures::future::join_all;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use petgraph::graph::NodeIndex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{MasonError, Result};
use crate::graph::{DependencyGraph, NodeKind};
use crate::recipe::Recipe;
use crate::registry::{ProviderCache, Registry, Step, Task};
use crate::shell::{RecipeOutcome, ShellExecutor};
use crate::value::{Args, Value};

/// How a node ended
#[derive(Debug, Clone)]
pub enum NodeStatus {
    Succeeded(Value),
    Failed(Arc<MasonError>),
    Skipped(Arc<MasonError>),
}

/// Result of executing a single provider or task
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub name: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub duration: Duration,
    /// Recipes that spawned a process
    pub executed: usize,
    /// Recipes skipped as fresh
    pub cached: usize,
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, NodeStatus::Succeeded(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.status {
            NodeStatus::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&MasonError> {
        match &self.status {
            NodeStatus::Failed(e) | NodeStatus::Skipped(e) => Some(e),
            NodeStatus::Succeeded(_) => None,
        }
    }
}

/// Everything one invocation produced
#[derive(Debug)]
pub struct InvocationReport {
    pub target: String,
    /// Outcomes in completion order
    pub outcomes: Vec<NodeOutcome>,
    /// Recipes recorded instead of executed (dry run)
    pub recipes: Vec<Recipe>,
    pub duration: Duration,
}

impl InvocationReport {
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(NodeOutcome::is_success)
    }

    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.outcome(name).and_then(NodeOutcome::value)
    }

    /// Nodes that failed on their own, not because of a dependency
    pub fn failures(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, NodeStatus::Failed(_)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, NodeStatus::Skipped(_)))
    }

    /// The first root-cause failure
    pub fn first_error(&self) -> Option<&MasonError> {
        self.failures().next().and_then(NodeOutcome::error)
    }

    pub fn executed(&self) -> usize {
        self.outcomes.iter().map(|o| o.executed).sum()
    }

    pub fn cached(&self) -> usize {
        self.outcomes.iter().map(|o| o.cached).sum()
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent recipes (0 = number of CPUs)
    pub parallelism: usize,
    /// Record recipes instead of running them
    pub dry_run: bool,
    /// Run recipes even if their output is fresh
    pub force: bool,
    /// Working directory for recipes
    pub cwd: PathBuf,
    /// Variables added to every recipe's environment
    pub env: HashMap<String, String>,
    /// Verbose output
    pub verbose: bool,
    /// No progress or result lines
    pub quiet: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            dry_run: false,
            force: false,
            cwd: std::env::current_dir().unwrap_or_default(),
            env: HashMap::new(),
            verbose: false,
            quiet: false,
        }
    }
}

/// State shared by every job of one invocation
struct Shared {
    registry: Arc<Registry>,
    cache: ProviderCache,
    shell: ShellExecutor,
    semaphore: Semaphore,
    progress: MultiProgress,
    planned: Mutex<Vec<Recipe>>,
    dry_run: bool,
    verbose: bool,
    quiet: bool,
}

/// Work handed to a spawned job
struct Job {
    name: String,
    kind: NodeKind,
    args: Args,
    /// Non-caching providers to re-resolve right before the body runs
    fresh: Vec<String>,
}

enum JobResult {
    Done {
        value: Value,
        executed: usize,
        cached: usize,
    },
    Failed(MasonError),
    NeedsMore(Vec<String>),
}

/// Task scheduler
pub struct Executor {
    registry: Arc<Registry>,
    exec_config: ExecutorConfig,
}

impl Executor {
    /// Create a new executor
    pub fn new(registry: Arc<Registry>, exec_config: ExecutorConfig) -> Self {
        Self {
            registry,
            exec_config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Select the target (the default when `None`), build its graph and run it
    pub async fn run(&self, target: Option<&str>) -> Result<InvocationReport> {
        let target = self.registry.select_target(target)?;
        let graph = DependencyGraph::build(&self.registry, target)?;
        self.execute(graph).await
    }

    /// Execute a graph. Only scheduler faults are returned as `Err`; task and
    /// recipe failures are recorded in the report.
    pub async fn execute(&self, graph: DependencyGraph) -> Result<InvocationReport> {
        let start = Instant::now();
        let target = graph.target().to_string();
        let shared = Arc::new(self.shared());

        let mut state = RunState::new(graph);
        let mut jobs: JoinSet<(NodeIndex, Duration, JobResult)> = JoinSet::new();
        let mut ready: VecDeque<NodeIndex> = state.initially_ready().into();

        debug!(target = %target, nodes = state.graph.len(), "starting invocation");

        loop {
            while let Some(idx) = ready.pop_front() {
                if let Some(skip) = state.failed_dependency(idx) {
                    let outcome = state.outcome(idx, NodeStatus::Skipped(Arc::new(skip)), 0, 0);
                    self.print_outcome(&shared, &outcome);
                    ready.extend(state.complete(idx, outcome));
                    continue;
                }

                let job = state.prepare(idx, &self.registry);
                let shared = Arc::clone(&shared);
                jobs.spawn(async move {
                    let started = Instant::now();
                    let result = run_job(&shared, job).await;
                    (idx, started.elapsed(), result)
                });
            }

            let Some(joined) = jobs.join_next().await else {
                break;
            };
            let (idx, elapsed, result) = joined.map_err(|e| {
                MasonError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            state.add_elapsed(idx, elapsed);

            let (status, executed, cached) = match result {
                JobResult::NeedsMore(names) => match state.suspend(idx, &names, &self.registry) {
                    Ok(newly_ready) => {
                        ready.extend(newly_ready);
                        continue;
                    }
                    Err(e) => (NodeStatus::Failed(Arc::new(e)), 0, 0),
                },
                JobResult::Done {
                    value,
                    executed,
                    cached,
                } => (NodeStatus::Succeeded(value), executed, cached),
                JobResult::Failed(e) => (NodeStatus::Failed(Arc::new(e)), 0, 0),
            };

            let outcome = state.outcome(idx, status, executed, cached);
            self.print_outcome(&shared, &outcome);
            ready.extend(state.complete(idx, outcome));
        }

        let recipes = std::mem::take(
            &mut *shared
                .planned
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        let report = InvocationReport {
            target,
            outcomes: state.into_outcomes(),
            recipes,
            duration: start.elapsed(),
        };

        if !self.exec_config.quiet {
            if self.exec_config.dry_run {
                self.print_dry_run(&report);
            }
            self.print_summary(&report);
        }

        Ok(report)
    }

    fn shared(&self) -> Shared {
        let parallelism = if self.exec_config.parallelism == 0 {
            num_cpus::get()
        } else {
            self.exec_config.parallelism
        };

        let progress = if self.exec_config.quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };

        Shared {
            registry: Arc::clone(&self.registry),
            cache: ProviderCache::new(),
            shell: ShellExecutor::new(self.exec_config.cwd.clone())
                .with_env(self.exec_config.env.clone())
                .force(self.exec_config.force),
            semaphore: Semaphore::new(parallelism),
            progress,
            planned: Mutex::new(Vec::new()),
            dry_run: self.exec_config.dry_run,
            verbose: self.exec_config.verbose,
            quiet: self.exec_config.quiet,
        }
    }

    /// Print result of a single node
    fn print_outcome(&self, shared: &Shared, outcome: &NodeOutcome) {
        if shared.quiet || (outcome.kind == NodeKind::Provider && outcome.is_success() && !shared.verbose) {
            return;
        }

        let status = match &outcome.status {
            NodeStatus::Succeeded(_) if outcome.cached > 0 && outcome.executed == 0 => {
                style("✓ cached").green()
            }
            NodeStatus::Succeeded(_) => style("✓").green(),
            NodeStatus::Failed(_) => style("✗").red(),
            NodeStatus::Skipped(_) => style("- skipped").yellow(),
        };

        let mut detail = format!("{:.2}s", outcome.duration.as_secs_f64());
        if outcome.executed + outcome.cached > 0 {
            detail.push_str(&format!(", {} run, {} cached", outcome.executed, outcome.cached));
        }

        shared.progress.suspend(|| {
            println!(
                "{} {} {}",
                status,
                style(&outcome.name).bold(),
                style(detail).dim()
            );

            if let NodeStatus::Failed(e) = &outcome.status {
                eprintln!("  {}", style(e).red());
                for related in related_errors(e) {
                    eprintln!("    {}", style(related).red());
                }
            }
        });
    }

    /// Print the recipes a dry run would execute
    fn print_dry_run(&self, report: &InvocationReport) {
        println!();
        println!("{}", style("Execution plan (dry run):").bold().cyan());

        for recipe in &report.recipes {
            let freshness = crate::cache::check_recipe(recipe);
            if freshness.is_fresh() && !self.exec_config.force {
                println!("  {} {}", style(&recipe.label).bold(), style("(fresh)").dim());
            } else {
                println!("  {} {}", style(&recipe.label).bold(), style(freshness).dim());
            }
            println!("    {} {}", style("→").dim(), recipe.command_line());
        }
    }

    /// Print execution summary
    fn print_summary(&self, report: &InvocationReport) {
        println!();

        let failed = report.failures().count();
        let skipped = report.skipped().count();
        let succeeded = report.outcomes.len() - failed - skipped;

        if failed == 0 && skipped == 0 {
            println!(
                "{} {} completed in {:.2}s ({} recipes run, {} cached)",
                style("✓").green().bold(),
                style(&report.target).bold(),
                report.duration.as_secs_f64(),
                report.executed(),
                report.cached()
            );
        } else {
            println!(
                "{} {} succeeded, {} failed, {} skipped in {:.2}s",
                style("✗").red().bold(),
                succeeded,
                failed,
                skipped,
                report.duration.as_secs_f64()
            );
        }
    }
}

fn related_errors(error: &MasonError) -> &[MasonError] {
    match error {
        MasonError::RecipesFailed { failures, .. } => failures,
        _ => &[],
    }
}

/// Scheduling bookkeeping for one invocation
struct RunState {
    graph: DependencyGraph,
    /// Dependencies each pending node is still waiting for
    unmet: HashMap<NodeIndex, usize>,
    outcomes: HashMap<NodeIndex, NodeOutcome>,
    completed: Vec<NodeIndex>,
    elapsed: HashMap<NodeIndex, Duration>,
}

impl RunState {
    fn new(graph: DependencyGraph) -> Self {
        let unmet = graph
            .indices()
            .map(|idx| (idx, graph.incoming(idx).count()))
            .collect();

        Self {
            graph,
            unmet,
            outcomes: HashMap::new(),
            completed: Vec::new(),
            elapsed: HashMap::new(),
        }
    }

    fn initially_ready(&self) -> Vec<NodeIndex> {
        let mut ready: Vec<_> = self
            .unmet
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&idx, _)| idx)
            .collect();
        ready.sort_unstable();
        ready
    }

    fn add_elapsed(&mut self, idx: NodeIndex, elapsed: Duration) {
        *self.elapsed.entry(idx).or_default() += elapsed;
    }

    fn outcome(&self, idx: NodeIndex, status: NodeStatus, executed: usize, cached: usize) -> NodeOutcome {
        let node = self.graph.node(idx);
        NodeOutcome {
            name: node.name.clone(),
            kind: node.kind,
            status,
            duration: self.elapsed.get(&idx).copied().unwrap_or_default(),
            executed,
            cached,
        }
    }

    /// Record an outcome and return the consumers that became eligible
    fn complete(&mut self, idx: NodeIndex, outcome: NodeOutcome) -> Vec<NodeIndex> {
        debug!(node = %outcome.name, success = outcome.is_success(), "node complete");
        self.outcomes.insert(idx, outcome);
        self.completed.push(idx);

        let mut ready = Vec::new();
        for consumer in self.graph.outgoing(idx).collect::<Vec<_>>() {
            if self.outcomes.contains_key(&consumer) {
                continue;
            }
            if let Some(count) = self.unmet.get_mut(&consumer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push(consumer);
                }
            }
        }
        ready
    }

    /// The first dependency that did not succeed, as a skip error
    fn failed_dependency(&self, idx: NodeIndex) -> Option<MasonError> {
        let mut deps: Vec<_> = self.graph.incoming(idx).collect();
        deps.sort_unstable();

        deps.into_iter().find_map(|dep| {
            let outcome = self.outcomes.get(&dep)?;
            let root = match &outcome.status {
                NodeStatus::Succeeded(_) => return None,
                NodeStatus::Failed(_) => outcome.name.clone(),
                NodeStatus::Skipped(e) => match e.as_ref() {
                    MasonError::SkippedDueToDependencyFailure { root, .. } => root.clone(),
                    _ => outcome.name.clone(),
                },
            };
            Some(MasonError::SkippedDueToDependencyFailure {
                task: self.graph.node(idx).name.clone(),
                dependency: outcome.name.clone(),
                root,
            })
        })
    }

    /// Collect the injected arguments for a node whose dependencies succeeded
    fn prepare(&self, idx: NodeIndex, registry: &Registry) -> Job {
        let node = self.graph.node(idx);
        let mut args = Args::new(node.name.clone());
        let mut fresh = Vec::new();

        for dep in self.graph.incoming(idx) {
            let dep_node = self.graph.node(dep);
            let uncached = dep_node.kind == NodeKind::Provider
                && registry
                    .provider(&dep_node.name)
                    .is_some_and(|p| !p.caching);

            if uncached {
                fresh.push(dep_node.name.clone());
            } else if let Some(value) = self.outcomes.get(&dep).and_then(NodeOutcome::value) {
                args.insert(dep_node.name.clone(), value.clone());
            }
        }

        Job {
            name: node.name.clone(),
            kind: node.kind,
            args,
            fresh,
        }
    }

    /// Attach dependencies a running task asked for. Returns nodes that can
    /// start now; the task itself is among them if nothing is left to wait for.
    fn suspend(&mut self, idx: NodeIndex, names: &[String], registry: &Registry) -> Result<Vec<NodeIndex>> {
        let task = self.graph.node(idx).name.clone();
        let snapshot = self.graph.clone();

        let attached = match self.attach(idx, &task, names, registry) {
            Ok(attached) => attached,
            Err(e) => {
                self.graph = snapshot;
                return Err(e);
            }
        };

        debug!(task = %task, dependencies = ?names, "suspended for dynamic dependencies");

        let mut ready = Vec::new();
        let new_nodes: Vec<_> = self
            .graph
            .indices()
            .filter(|n| !self.unmet.contains_key(n))
            .collect();
        for node in new_nodes {
            let count = self.pending_dependencies(node);
            self.unmet.insert(node, count);
            if count == 0 {
                ready.push(node);
            }
        }

        let waiting = attached
            .iter()
            .filter(|dep| !self.outcomes.contains_key(dep))
            .count();
        self.unmet.insert(idx, waiting);
        if waiting == 0 {
            ready.push(idx);
        }

        Ok(ready)
    }

    fn attach(&mut self, idx: NodeIndex, task: &str, names: &[String], registry: &Registry) -> Result<Vec<NodeIndex>> {
        let mut attached = Vec::new();

        for name in names {
            if !registry.contains(name) {
                return Err(MasonError::UnknownDependency {
                    task: task.to_string(),
                    name: name.clone(),
                });
            }

            let dep = self.graph.extend(registry, name)?;
            if self.graph.incoming(idx).any(|existing| existing == dep) {
                continue;
            }
            self.graph.add_dynamic_edge(dep, idx)?;
            attached.push(dep);
        }

        if attached.is_empty() {
            return Err(MasonError::task(
                task,
                format!("requested dependencies that are already resolved: {}", names.join(", ")),
            ));
        }

        Ok(attached)
    }

    fn pending_dependencies(&self, idx: NodeIndex) -> usize {
        self.graph
            .incoming(idx)
            .filter(|dep| !self.outcomes.contains_key(dep))
            .count()
    }

    fn into_outcomes(mut self) -> Vec<NodeOutcome> {
        self.completed
            .iter()
            .filter_map(|idx| self.outcomes.remove(idx))
            .collect()
    }
}

async fn run_job(shared: &Arc<Shared>, job: Job) -> JobResult {
    match job.kind {
        NodeKind::Provider => match resolve_provider(shared, &job.name).await {
            Ok(value) => JobResult::Done {
                value,
                executed: 0,
                cached: 0,
            },
            Err(e) => JobResult::Failed(e),
        },
        NodeKind::Task => run_task(shared, job).await.unwrap_or_else(JobResult::Failed),
    }
}

/// Producers may touch the filesystem, so they run off the async workers
async fn resolve_provider(shared: &Arc<Shared>, name: &str) -> Result<Value> {
    let shared = Arc::clone(shared);
    let name = name.to_string();
    let provider = name.clone();
    tokio::task::spawn_blocking(move || shared.registry.resolve(&name, &shared.cache))
        .await
        .map_err(|e| MasonError::Resolution {
            provider,
            reason: e.to_string(),
        })?
}

async fn run_task(shared: &Arc<Shared>, job: Job) -> Result<JobResult> {
    let Job {
        name, mut args, fresh, ..
    } = job;

    for provider in fresh {
        let value = resolve_provider(shared, &provider).await?;
        args.insert(provider, value);
    }

    let task = shared
        .registry
        .task(&name)
        .ok_or_else(|| MasonError::TaskNotFound {
            name: name.clone(),
            available: shared.registry.task_names(),
        })?;

    debug!(task = %name, args = args.len(), "invoking task body");

    let step = panic::catch_unwind(AssertUnwindSafe(|| task.invoke(&args)))
        .map_err(|payload| MasonError::task(&name, format!("panicked: {}", panic_message(&*payload))))??;

    match step {
        Step::Value(value) => Ok(JobResult::Done {
            value,
            executed: 0,
            cached: 0,
        }),
        Step::Resolve(names) => Ok(JobResult::NeedsMore(names)),
        Step::Recipes(recipes) => run_recipes(shared, task, recipes).await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn run_recipes(shared: &Arc<Shared>, task: &Task, recipes: Vec<Recipe>) -> Result<JobResult> {
    let recipes: Vec<Recipe> = recipes
        .into_iter()
        .map(|recipe| if task.keep { recipe } else { recipe.keep(false) })
        .collect();

    if shared.dry_run {
        let value = recipes
            .iter()
            .map(|r| r.output.clone().map(Value::Path).unwrap_or_default())
            .collect();
        shared
            .planned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(recipes);
        return Ok(JobResult::Done {
            value,
            executed: 0,
            cached: 0,
        });
    }

    let results = join_all(recipes.iter().map(|recipe| run_recipe(shared, recipe))).await;

    let mut values = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    let (mut executed, mut cached) = (0, 0);

    for result in results {
        match result {
            Ok(outcome) => {
                if outcome.cached {
                    cached += 1;
                } else {
                    executed += 1;
                }
                values.push(match outcome.output {
                    Some(path) => Value::Path(path),
                    None => Value::Str(outcome.stdout.trim_end().to_string()),
                });
            }
            Err(e) => {
                debug!(task = %task.name, "{}", e);
                failures.push(e);
            }
        }
    }

    match failures.len() {
        0 => Ok(JobResult::Done {
            value: Value::List(values),
            executed,
            cached,
        }),
        1 => Ok(JobResult::Failed(failures.remove(0))),
        _ => Ok(JobResult::Failed(MasonError::RecipesFailed {
            task: task.name.clone(),
            failures,
        })),
    }
}

async fn run_recipe(shared: &Arc<Shared>, recipe: &Recipe) -> Result<RecipeOutcome> {
    let _permit = shared
        .semaphore
        .acquire()
        .await
        .map_err(|_| MasonError::Interrupted)?;

    let pb = shared.progress.add(ProgressBar::new_spinner());
    if let Ok(spinner) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(spinner);
    }
    pb.set_message(format!("Running {}", recipe.label));
    pb.enable_steady_tick(Duration::from_millis(100));

    let result = shared.shell.run(recipe).await;
    pb.finish_and_clear();

    if let Ok(outcome) = &result {
        let show = !outcome.cached && (shared.verbose || recipe.output.is_none());
        if show && !shared.quiet && !outcome.stdout.is_empty() {
            shared.progress.suspend(|| print!("{}", outcome.stdout));
        }
    }

    result
}

mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
