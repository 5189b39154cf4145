//! Compilation database output
//!
//! Writes the recipes of a planned invocation in clang's
//! `compile_commands.json` format so editors and language servers see the
//! exact flags each source is built with.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{MasonError, Result};
use crate::recipe::Recipe;
use crate::shell::ShellExecutor;

/// One entry of `compile_commands.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileCommand {
    pub directory: PathBuf,
    pub arguments: Vec<String>,
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct CompileDatabase {
    entries: Vec<CompileCommand>,
}

impl CompileDatabase {
    /// One entry per recipe. `file` is the first input, else the output,
    /// else the directory the recipe runs in.
    pub fn from_recipes<'a>(recipes: impl IntoIterator<Item = &'a Recipe>, cwd: &Path) -> Result<Self> {
        let shell = ShellExecutor::new(cwd);
        let mut entries = Vec::new();

        for recipe in recipes {
            let directory = shell.working_dir(recipe);
            let file = match recipe.inputs.first().or(recipe.output.as_ref()) {
                Some(file) => file.clone(),
                None => {
                    debug!(recipe = %recipe.label, "no input or output, using working directory as file");
                    directory.clone()
                }
            };

            entries.push(CompileCommand {
                arguments: recipe.argv_with(recipe.output.as_deref())?,
                directory,
                file,
                output: recipe.output.clone(),
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CompileCommand] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| MasonError::Serialize {
            what: "compilation database".to_string(),
            source: e,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut json = self.to_json()?;
        json.push('\n');
        std::fs::write(path, json)?;
        Ok(())
    }
}
