use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable naming the base data directory.
pub const DATA_DIR_ENV: &str = "OBCLONEDATA";

const NOTES_DIR: &str = "obclonedata";
const TEMPLATE_DIR: &str = "keys";

// Ollama connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 30,
        }
    }
}

// App settings, stored as `settings.json` in the base directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Read-only prompt template folder. Defaults to `<base>/keys`.
    pub template_source: Option<PathBuf>,
    pub ollama: OllamaSettings,
}

impl Settings {
    pub fn template_source(&self, base: &Path) -> PathBuf {
        self.template_source
            .clone()
            .unwrap_or_else(|| base.join(TEMPLATE_DIR))
    }

    /// Apply overrides from the command line. Returns whether anything changed.
    pub fn apply_overrides(
        &mut self,
        templates: Option<PathBuf>,
        ollama_url: Option<String>,
        model: Option<String>,
    ) -> Result<bool> {
        if let Some(url) = &ollama_url {
            url::Url::parse(url).with_context(|| format!("invalid Ollama URL '{}'", url))?;
        }
        let changed = templates.is_some() || ollama_url.is_some() || model.is_some();

        if let Some(dir) = templates {
            self.template_source = Some(dir);
        }
        if let Some(url) = ollama_url {
            self.ollama.base_url = url;
        }
        if let Some(model) = model {
            self.ollama.model = model;
        }
        Ok(changed)
    }

    pub fn save(&self, base: &Path) -> Result<()> {
        let path = settings_path(base);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// The explicit directory if given, otherwise the current directory.
pub fn resolve_base(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("reading current directory"),
    }
}

pub fn notes_root(base: &Path) -> PathBuf {
    base.join(NOTES_DIR)
}

pub fn settings_path(base: &Path) -> PathBuf {
    base.join("settings.json")
}

pub fn search_index_path(base: &Path) -> PathBuf {
    base.join("search_index")
}

/// Load settings from disk. A missing file gives defaults; so does a
/// malformed one, with a warning.
pub fn load_settings(base: &Path) -> Settings {
    let path = settings_path(base);
    if !path.exists() {
        return Settings::default();
    }

    let mut settings: Settings = match std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|content| serde_json::from_str(&content).map_err(anyhow::Error::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
            return Settings::default();
        }
    };

    if let Err(e) = url::Url::parse(&settings.ollama.base_url) {
        warn!(url = %settings.ollama.base_url, error = %e, "invalid ollama url, using default");
        settings.ollama.base_url = OllamaSettings::default().base_url;
    }
    settings
}
