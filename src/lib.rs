pub mod annotate;
pub mod error;
pub mod links;
pub mod notes;
pub mod ollama;
pub mod paths;
pub mod persistence;
pub mod search;
pub mod settings;
pub mod templates;
pub mod watcher;
pub mod workspace;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use error::{NoteError, TransportError};
pub use notes::{LoadMode, Note, NoteIndex, TreeNode};
pub use workspace::{Workspace, WorkspaceConfig};

use ollama::OllamaClient;
use settings::Settings;

/// Load settings from `base` and open the workspace under it, talking to the
/// configured Ollama server for annotations.
pub fn setup(base: &Path, watch: bool) -> Result<(Settings, Workspace)> {
    let settings = settings::load_settings(base);
    let client = OllamaClient::from_settings(&settings.ollama);

    let config = WorkspaceConfig {
        notes_root: settings::notes_root(base),
        template_source: settings.template_source(base),
        index_path: Some(settings::search_index_path(base)),
        watch,
    };
    let workspace = Workspace::open(config, Arc::new(client))
        .with_context(|| format!("opening notes under {}", base.display()))?;

    info!(base = %base.display(), model = %settings.ollama.model, "ready");
    Ok((settings, workspace))
}
