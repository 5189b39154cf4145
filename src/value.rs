//! Values passed between providers, tasks and recipes
//!
//! Every node of a graph produces a [`Value`]. Task bodies receive the values of
//! their dependencies through [`Args`], keyed by dependency name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{MasonError, Result};

/// A value produced by a provider or a task
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Path(PathBuf),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Flatten into file paths. Strings are read as paths, `Null` and
    /// scalars are skipped.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut Vec<PathBuf>) {
        match self {
            Value::Path(p) => out.push(p.clone()),
            Value::Str(s) => out.push(PathBuf::from(s)),
            Value::List(items) => items.iter().for_each(|v| v.collect_paths(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_paths(out)),
            Value::Null | Value::Bool(_) | Value::Int(_) => {}
        }
    }

    /// Flatten into command-line words, one per scalar
    pub fn words(&self) -> Vec<String> {
        match self {
            Value::Null => Vec::new(),
            Value::Bool(b) => vec![b.to_string()],
            Value::Int(i) => vec![i.to_string()],
            Value::Str(s) => vec![s.clone()],
            Value::Path(p) => vec![p.to_string_lossy().into_owned()],
            Value::List(items) => items.iter().flat_map(Value::words).collect(),
            Value::Map(map) => map.values().flat_map(Value::words).collect(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Value::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Self {
        Value::Path(p)
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Value::Path(p.to_path_buf())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> FromIterator<T> for Value {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Value::List(iter.into_iter().map(Into::into).collect())
    }
}

/// Named arguments injected into a task body
#[derive(Debug, Clone, Default)]
pub struct Args {
    task: String,
    values: BTreeMap<String, Value>,
}

impl Args {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            values: BTreeMap::new(),
        }
    }

    /// Name of the task receiving these arguments
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Get an argument the task cannot do without
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.values.get(name).ok_or_else(|| MasonError::UnknownDependency {
            task: self.task.clone(),
            name: name.to_string(),
        })
    }

    /// Paths held by an argument
    pub fn paths(&self, name: &str) -> Result<Vec<PathBuf>> {
        self.require(name).map(Value::paths)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_flatten_nested_lists() {
        let value = Value::List(vec![
            Value::Path(PathBuf::from("/src/a.cpp")),
            Value::Null,
            Value::List(vec![Value::Str("/src/b.cpp".to_string())]),
        ]);

        assert_eq!(
            value.paths(),
            vec![PathBuf::from("/src/a.cpp"), PathBuf::from("/src/b.cpp")]
        );
    }

    #[test]
    fn test_words_skip_null() {
        let value = Value::from(vec!["-g", "-O2"]);
        assert_eq!(value.words(), vec!["-g", "-O2"]);
        assert!(Value::Null.words().is_empty());
    }

    #[test]
    fn test_require_missing_argument() {
        let args = Args::new("tests");
        let err = args.require("headers").unwrap_err();
        assert!(matches!(err, MasonError::UnknownDependency { .. }));
    }
}
