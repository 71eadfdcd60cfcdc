use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{NoteError, Result};

// Prompt template: one folder per prompt, one markdown file per role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptTemplate {
    pub name: String,
    /// role name (file stem, e.g. "system") -> markdown content
    pub roles: BTreeMap<String, String>,
}

impl PromptTemplate {
    /// Role contents in prompt order: `system`, `assistant`, then the rest by name.
    pub fn ordered_roles(&self) -> Vec<(&str, &str)> {
        let mut ordered = Vec::with_capacity(self.roles.len());
        for first in ["system", "assistant"] {
            if let Some(content) = self.roles.get(first) {
                ordered.push((first, content.as_str()));
            }
        }
        for (role, content) in &self.roles {
            if role != "system" && role != "assistant" {
                ordered.push((role.as_str(), content.as_str()));
            }
        }
        ordered
    }
}

/// Owns the runtime `.keys` directory, which is rebuilt from a read-only
/// template source on every startup.
pub struct TemplateStore {
    source: PathBuf,
    runtime: PathBuf,
}

impl TemplateStore {
    pub fn new(source: impl Into<PathBuf>, runtime: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            runtime: runtime.into(),
        }
    }

    /// Replace the runtime copy with a fresh copy of the template source.
    ///
    /// The copy is staged next to the runtime directory and swapped in with
    /// renames, so a failed copy leaves the previous runtime copy untouched.
    /// A missing source yields an empty runtime directory. Leftovers from an
    /// interrupted reload are removed first.
    pub fn reload(&self) -> Result<()> {
        let staging = self.sibling("staging");
        let retired = self.sibling("retired");
        for leftover in [&staging, &retired] {
            if leftover.exists() {
                debug!(path = %leftover.display(), "removing leftover from earlier reload");
                remove_dir(leftover)?;
            }
        }

        let copied = if self.source.is_dir() {
            copy_tree(&self.source, &staging)
        } else {
            warn!(source = %self.source.display(), "template source missing, prompts disabled");
            std::fs::create_dir_all(&staging).map_err(|e| NoteError::io(&staging, e))
        };
        if let Err(e) = copied {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        if self.runtime.exists() {
            std::fs::rename(&self.runtime, &retired).map_err(|e| NoteError::io(&self.runtime, e))?;
        }
        if let Err(e) = std::fs::rename(&staging, &self.runtime) {
            // Put the previous copy back rather than leave nothing behind.
            if retired.exists() {
                let _ = std::fs::rename(&retired, &self.runtime);
            }
            let _ = std::fs::remove_dir_all(&staging);
            return Err(NoteError::io(&self.runtime, e));
        }
        if retired.exists() {
            if let Err(e) = std::fs::remove_dir_all(&retired) {
                warn!(path = %retired.display(), error = %e, "failed to remove retired templates");
            }
        }

        info!(
            prompts = self.list_prompt_names().len(),
            runtime = %self.runtime.display(),
            "prompt templates reloaded"
        );
        Ok(())
    }

    /// Top-level folder names under the runtime keys directory.
    pub fn list_prompt_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let entries = match std::fs::read_dir(&self.runtime) {
            Ok(entries) => entries,
            Err(_) => return names,
        };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.insert(name.to_string());
                }
            }
        }
        names
    }

    pub fn resolve(&self, name: &str) -> Result<PromptTemplate> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(NoteError::UnknownPrompt(name.to_string()));
        }
        let dir = self.runtime.join(name);
        if !dir.is_dir() {
            return Err(NoteError::UnknownPrompt(name.to_string()));
        }

        let mut roles = BTreeMap::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| NoteError::io(&dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != "md") {
                continue;
            }
            let role = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let content = std::fs::read_to_string(&path).map_err(|e| NoteError::io(&path, e))?;
            roles.insert(role, content);
        }

        debug!(prompt = name, roles = roles.len(), "resolved prompt template");
        Ok(PromptTemplate {
            name: name.to_string(),
            roles,
        })
    }

    /// `.keys.staging` or `.keys.retired`, next to the runtime directory.
    fn sibling(&self, tag: &str) -> PathBuf {
        let base = self
            .runtime
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(".keys");
        self.runtime.with_file_name(format!("{}.{}", base, tag))
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    std::fs::remove_dir_all(path).map_err(|e| NoteError::io(path, e))
}

/// Copy regular files under `from` into `to`. Symlinked files are copied by
/// content; symlinked folders are skipped.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to).map_err(|e| NoteError::io(to, e))?;
    for entry in WalkDir::new(from).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| NoteError::walk(from, e))?;
        let src = entry.path();
        let relative = match src.strip_prefix(from) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let dst = to.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&dst).map_err(|e| NoteError::io(&dst, e))?;
        } else if file_type.is_symlink() {
            let target = std::fs::metadata(src).map_err(|e| NoteError::io(src, e))?;
            if target.is_dir() {
                warn!(path = %src.display(), "skipping symlinked template folder");
                continue;
            }
            std::fs::copy(src, &dst).map_err(|e| NoteError::io(src, e))?;
        } else {
            std::fs::copy(src, &dst).map_err(|e| NoteError::io(src, e))?;
        }
    }
    Ok(())
}
