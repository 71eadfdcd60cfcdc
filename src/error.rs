use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the note store.
///
/// None of these are fatal to the process: callers either retry (`Persist`),
/// report and continue (`UnknownPrompt`), or surface them to the user.
#[derive(Debug, Error)]
pub enum NoteError {
    #[error("invalid note identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("note '{0}' not found")]
    NotFound(String),

    #[error("unknown prompt '{0}'")]
    UnknownPrompt(String),

    #[error("failed to persist note '{id}': {source}")]
    Persist {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("note '{0}' already exists")]
    AlreadyExists(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("search index: {0}")]
    Search(String),
}

impl NoteError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NoteError::Io {
            path: path.into(),
            source,
        }
    }

    /// A failed directory walk, blamed on the entry it stopped at.
    pub(crate) fn walk(root: &Path, e: walkdir::Error) -> Self {
        let path = e.path().unwrap_or(root).to_path_buf();
        NoteError::io(path, e.into())
    }
}

impl From<tantivy::TantivyError> for NoteError {
    fn from(e: tantivy::TantivyError) -> Self {
        NoteError::Search(e.to_string())
    }
}

impl From<tantivy::query::QueryParserError> for NoteError {
    fn from(e: tantivy::query::QueryParserError) -> Self {
        NoteError::Search(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NoteError>;

/// The external generation call failed. Recovered per marker.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("generation failed: {reason}")]
pub struct TransportError {
    pub reason: String,
}

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
