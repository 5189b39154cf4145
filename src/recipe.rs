//! Recipes: structured external commands bound to an output artifact
//!
//! A recipe is a program plus argument vector, environment overrides and a
//! working directory, never a shell string. Manifest commands are written as
//! templates (`{CC} {CFLAGS} {input} -o {output}`) and materialized into argv
//! by binding every placeholder to concrete words.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{MasonError, Result};
use crate::value::Value;

/// Placeholder bound to the artifact path of a recipe
pub const OUTPUT_PLACEHOLDER: &str = "output";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

/// One word of a recipe's command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Literal(String),
    /// Replaced by the recipe's output path (a staged path while running)
    Output,
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Literal(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Literal(s)
    }
}

impl From<&Path> for Arg {
    fn from(p: &Path) -> Self {
        Arg::Literal(p.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for Arg {
    fn from(p: PathBuf) -> Self {
        Arg::Literal(p.to_string_lossy().into_owned())
    }
}

/// A single external command execution bound to an optional artifact
#[derive(Debug, Clone)]
pub struct Recipe {
    pub label: String,
    pub argv: Vec<Arg>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Files the command reads; part of the freshness check
    pub inputs: Vec<PathBuf>,
    /// Extra files that force a rebuild when newer than the output
    pub requires: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// When false the freshness cache is bypassed
    pub keep: bool,
}

impl Recipe {
    pub fn new(label: impl Into<String>, program: impl Into<Arg>) -> Self {
        Self {
            label: label.into(),
            argv: vec![program.into()],
            env: BTreeMap::new(),
            cwd: None,
            inputs: Vec::new(),
            requires: Vec::new(),
            output: None,
            timeout: None,
            keep: true,
        }
    }

    /// Build a recipe from an already materialized argv
    pub fn from_argv(label: impl Into<String>, argv: Vec<Arg>) -> Result<Self> {
        let label = label.into();
        match argv.first() {
            Some(Arg::Literal(_)) => {}
            Some(Arg::Output) => {
                return Err(MasonError::InvalidTemplate {
                    template: label,
                    reason: "the program cannot be {output}".to_string(),
                })
            }
            None => {
                return Err(MasonError::InvalidTemplate {
                    template: label,
                    reason: "empty command".to_string(),
                })
            }
        }

        Ok(Self {
            argv,
            ..Self::new(label, "")
        })
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append the output placeholder as its own argument
    pub fn output_arg(self) -> Self {
        self.arg(Arg::Output)
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn requires<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.requires.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// The program to execute
    pub fn program(&self) -> &str {
        match self.argv.first() {
            Some(Arg::Literal(p)) => p,
            _ => "",
        }
    }

    pub fn uses_output(&self) -> bool {
        self.argv.contains(&Arg::Output)
    }

    /// Every file whose modification invalidates the output
    pub fn freshness_inputs(&self) -> impl Iterator<Item = &Path> {
        self.inputs
            .iter()
            .chain(self.requires.iter())
            .map(PathBuf::as_path)
    }

    /// Render argv with `{output}` bound to the given path
    pub fn argv_with(&self, output: Option<&Path>) -> Result<Vec<String>> {
        self.argv
            .iter()
            .map(|arg| match arg {
                Arg::Literal(s) => Ok(s.clone()),
                Arg::Output => output
                    .map(|p| p.to_string_lossy().into_owned())
                    .ok_or_else(|| MasonError::InvalidTemplate {
                        template: self.label.clone(),
                        reason: "{output} used but the recipe has no output path".to_string(),
                    }),
            })
            .collect()
    }

    /// Final command line, for messages and the compilation database
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| match arg {
                Arg::Literal(s) => quote(s),
                Arg::Output => self
                    .output
                    .as_deref()
                    .map(|p| quote(&p.to_string_lossy()))
                    .unwrap_or_else(|| "{output}".to_string()),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Deterministic artifact path for a source: same path, extension stripped
pub fn output_for(source: &Path) -> PathBuf {
    source.with_extension("")
}

fn quote(word: &str) -> String {
    if word.is_empty() {
        "''".to_string()
    } else if word.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", word.replace('\'', r"'\''"))
    } else {
        word.to_string()
    }
}

/// Placeholder name to words
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: BTreeMap<String, Vec<String>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, words: Vec<String>) -> &mut Self {
        self.values.insert(name.into(), words);
        self
    }

    pub fn bind_value(&mut self, name: impl Into<String>, value: &Value) -> &mut Self {
        self.bind(name, value.words())
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.values.get(name).map(Vec::as_slice)
    }
}

/// A command line with `{name}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    tokens: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let tokens = tokenize(template).map_err(|reason| MasonError::InvalidTemplate {
            template: template.to_string(),
            reason,
        })?;

        if tokens.is_empty() {
            return Err(MasonError::InvalidTemplate {
                template: template.to_string(),
                reason: "empty command".to_string(),
            });
        }

        Ok(Self {
            source: template.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of all placeholders, in order of appearance
    pub fn placeholders(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .flat_map(|t| PLACEHOLDER.captures_iter(t))
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    pub fn mentions_output(&self) -> bool {
        self.placeholders().contains(&OUTPUT_PLACEHOLDER)
    }

    /// Bind every placeholder. A token made of a single placeholder expands to
    /// one argument per word; embedded placeholders are joined with spaces.
    pub fn materialize(&self, bindings: &Bindings) -> Result<Vec<Arg>> {
        let mut argv = Vec::new();

        for token in &self.tokens {
            if let Some(name) = whole_placeholder(token) {
                if name == OUTPUT_PLACEHOLDER {
                    argv.push(Arg::Output);
                } else {
                    let words = self.lookup(bindings, name)?;
                    argv.extend(words.iter().cloned().map(Arg::Literal));
                }
                continue;
            }

            let mut failure = None;
            let expanded = PLACEHOLDER.replace_all(token, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                let reason = if name == OUTPUT_PLACEHOLDER {
                    "{output} must be a separate argument".to_string()
                } else if let Some(words) = bindings.get(name) {
                    return words.join(" ");
                } else {
                    format!("unknown placeholder {{{}}}", name)
                };
                if failure.is_none() {
                    failure = Some(reason);
                }
                String::new()
            });

            if let Some(reason) = failure {
                return Err(self.invalid(reason));
            }
            argv.push(Arg::Literal(expanded.into_owned()));
        }

        if !matches!(argv.first(), Some(Arg::Literal(_))) {
            return Err(self.invalid("the command expands to no program".to_string()));
        }

        Ok(argv)
    }

    fn lookup<'b>(&self, bindings: &'b Bindings, name: &str) -> Result<&'b [String]> {
        bindings
            .get(name)
            .ok_or_else(|| self.invalid(format!("unknown placeholder {{{}}}", name)))
    }

    fn invalid(&self, reason: String) -> MasonError {
        MasonError::InvalidTemplate {
            template: self.source.clone(),
            reason,
        }
    }
}

fn whole_placeholder(token: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(token)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == token.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// Split a command line into words, honouring single and double quotes
fn tokenize(cmd: &str) -> std::result::Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut quoted_word = false;

    for c in cmd.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    quoted_word = true;
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() || quoted_word {
                        parts.push(std::mem::take(&mut current));
                    }
                    quoted_word = false;
                }
                _ => current.push(c),
            },
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }

    if !current.is_empty() || quoted_word {
        parts.push(current);
    }

    Ok(parts)
}
