//! Provider and task registration
//!
//! The registry maps names to zero-argument providers and to tasks whose
//! dependencies are their declared parameter names. It is filled once at
//! startup and shared read-only by every invocation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{MasonError, Result};
use crate::graph::DependencyGraph;
use crate::recipe::Recipe;
use crate::value::{Args, Value};

/// Zero-argument value source
pub type Producer = Arc<dyn Fn() -> Result<Value> + Send + Sync>;

/// Task body, invoked with the values of its dependencies
pub type TaskBody = Arc<dyn Fn(&Args) -> Result<Step> + Send + Sync>;

/// What a task body hands back to the scheduler
#[derive(Debug, Clone)]
pub enum Step {
    /// The task's final value
    Value(Value),
    /// Recipes to execute; the task's value becomes one entry per recipe
    Recipes(Vec<Recipe>),
    /// Further dependencies to resolve before the body is invoked again
    Resolve(Vec<String>),
}

impl From<Value> for Step {
    fn from(value: Value) -> Self {
        Step::Value(value)
    }
}

/// A named, zero-argument value source
#[derive(Clone)]
pub struct Provider {
    pub name: String,
    pub desc: Option<String>,
    /// When false the producer runs at every resolution
    pub caching: bool,
    producer: Producer,
}

impl Provider {
    pub fn new<F>(name: impl Into<String>, producer: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            desc: None,
            caching: true,
            producer: Arc::new(producer),
        }
    }

    /// Re-run the producer every time the value is requested
    pub fn uncached(mut self) -> Self {
        self.caching = false;
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub(crate) fn produce(&self) -> Result<Value> {
        (self.producer)().map_err(|e| match e {
            e @ MasonError::Resolution { .. } => e,
            e => MasonError::Resolution {
                provider: self.name.clone(),
                reason: e.to_string(),
            },
        })
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("caching", &self.caching)
            .finish_non_exhaustive()
    }
}

/// A named unit of work whose dependencies are its parameter names
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub params: Vec<String>,
    pub desc: Option<String>,
    pub default: bool,
    /// When false the task's recipes bypass the freshness cache
    pub keep: bool,
    body: TaskBody,
}

impl Task {
    pub fn new<I, S, F>(name: impl Into<String>, params: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Args) -> Result<Step> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
            desc: None,
            default: false,
            keep: true,
            body: Arc::new(body),
        }
    }

    /// Mark as the target run when none is named
    pub fn default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub(crate) fn invoke(&self, args: &Args) -> Result<Step> {
        (self.body)(args)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("default", &self.default)
            .field("keep", &self.keep)
            .finish_non_exhaustive()
    }
}

/// A registered name, looked up by the resolver
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    Provider(&'a Provider),
    Task(&'a Task),
}

/// Memoized provider values for one invocation
#[derive(Debug, Default)]
pub struct ProviderCache {
    values: Mutex<HashMap<String, Value>>,
}

impl ProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().get(name).cloned()
    }

    fn insert(&self, name: &str, value: Value) -> Value {
        self.lock().entry(name.to_string()).or_insert(value).clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // A panicking producer cannot leave the map half-written
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// All providers and tasks known to a build
#[derive(Debug, Default)]
pub struct Registry {
    providers: BTreeMap<String, Provider>,
    tasks: BTreeMap<String, Task>,
    default: Option<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caching provider from a closure
    pub fn provide<F>(&mut self, name: impl Into<String>, producer: F) -> Result<()>
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        self.register_provider(Provider::new(name, producer))
    }

    pub fn register_provider(&mut self, provider: Provider) -> Result<()> {
        self.ensure_unique(&provider.name)?;
        debug!(provider = %provider.name, caching = provider.caching, "registered provider");
        self.providers.insert(provider.name.clone(), provider);
        Ok(())
    }

    pub fn register_task(&mut self, task: Task) -> Result<()> {
        self.ensure_unique(&task.name)?;

        if task.default {
            if let Some(existing) = &self.default {
                return Err(MasonError::MultipleDefaults {
                    existing: existing.clone(),
                    name: task.name.clone(),
                });
            }
            self.default = Some(task.name.clone());
        }

        debug!(task = %task.name, params = ?task.params, "registered task");
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            return Err(MasonError::DuplicateName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name) || self.tasks.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Entry<'_>> {
        self.providers
            .get(name)
            .map(Entry::Provider)
            .or_else(|| self.tasks.get(name).map(Entry::Task))
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.values()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn default_target(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Resolve a provider's value, memoized unless the provider is non-caching
    pub fn resolve(&self, name: &str, cache: &ProviderCache) -> Result<Value> {
        let provider = self.providers.get(name).ok_or_else(|| MasonError::Resolution {
            provider: name.to_string(),
            reason: "no such provider".to_string(),
        })?;

        if provider.caching {
            if let Some(value) = cache.get(name) {
                return Ok(value);
            }
        }

        debug!(provider = name, "invoking producer");
        let value = provider.produce()?;

        Ok(if provider.caching {
            cache.insert(name, value)
        } else {
            value
        })
    }

    /// Pick the task to run: the named one, or the default
    pub fn select_target<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str> {
        match requested {
            Some(name) if self.tasks.contains_key(name) => Ok(name),
            Some(name) => Err(MasonError::TaskNotFound {
                name: name.to_string(),
                available: self.task_names(),
            }),
            None => self.default.as_deref().ok_or_else(|| MasonError::NoDefaultTarget {
                available: self.task_names(),
            }),
        }
    }

    /// Build the graph of every task, surfacing unknown names and cycles
    pub fn check(&self) -> Result<()> {
        for name in self.tasks.keys() {
            DependencyGraph::build(self, name)?;
        }
        Ok(())
    }
}
