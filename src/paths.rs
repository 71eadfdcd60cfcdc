use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};

use crate::error::{NoteError, Result};

pub const TRASH_DIR: &str = ".trash";
pub const JOURNAL_DIR: &str = ".journal";
pub const KEYS_DIR: &str = ".keys";

pub const NOTE_EXT: &str = "md";

/// Maps note identifiers (`folder/sub/name`) to files under a notes root.
///
/// Pure path arithmetic; nothing here touches the filesystem.
#[derive(Debug, Clone)]
pub struct NotePaths {
    root: PathBuf,
}

impl NotePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trash_root(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    pub fn journal_root(&self) -> PathBuf {
        self.root.join(JOURNAL_DIR)
    }

    pub fn keys_root(&self) -> PathBuf {
        self.root.join(KEYS_DIR)
    }

    /// `<root>/<id>.md`, after rejecting anything that could escape the root.
    pub fn note_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        let (parent, name) = match id.rsplit_once('/') {
            Some((parent, name)) => (Some(parent), name),
            None => (None, id),
        };
        let mut path = self.root.clone();
        if let Some(parent) = parent {
            path.extend(parent.split('/'));
        }
        path.push(format!("{}.{}", name, NOTE_EXT));
        Ok(path)
    }

    /// Directory for a folder identifier. The empty identifier is the root.
    pub fn folder_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() {
            return Ok(self.root.clone());
        }
        validate_id(id)?;
        let mut path = self.root.clone();
        path.extend(id.split('/'));
        Ok(path)
    }

    /// Location of `id` once trashed: a single flattened file directly under
    /// `.trash`. `copy` > 0 disambiguates repeated trashing of the same id.
    pub fn trash_path(&self, id: &str, copy: u32) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.trash_root().join(trash_file_name(id, copy)))
    }
}

/// Reject identifiers that are empty, absolute, or contain traversal segments.
pub fn validate_id(id: &str) -> Result<()> {
    let invalid = id.is_empty()
        || id.starts_with('/')
        || id.contains('\\')
        || id.contains('\0')
        || id
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(NoteError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

/// True when `id` names a reserved folder, or something stored inside the
/// trash or the prompt templates.
pub fn is_reserved(id: &str) -> bool {
    let first = id.split('/').next().unwrap_or(id);
    if first == TRASH_DIR || first == KEYS_DIR {
        return true;
    }
    id == JOURNAL_DIR
}

/// `.journal/YYYY-MM-DD`
pub fn journal_id(date: NaiveDate) -> String {
    format!("{}/{}", JOURNAL_DIR, date.format("%Y-%m-%d"))
}

/// Heading written into a fresh journal entry, e.g. `# Thursday 29th May 2025`.
pub fn journal_header(date: NaiveDate) -> String {
    format!(
        "# {} {}{} {}\n\n",
        date.format("%A"),
        date.day(),
        ordinal_suffix(date.day()),
        date.format("%B %Y")
    )
}

fn ordinal_suffix(day: u32) -> &'static str {
    if (11..=13).contains(&(day % 100)) {
        return "th";
    }
    match day % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

// Flattened trash names percent-encode the characters that carry structure,
// so the original identifier can always be decoded back out.
fn trash_file_name(id: &str, copy: u32) -> String {
    let mut name = String::with_capacity(id.len() + 8);
    for c in id.chars() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '~' => name.push_str("%7E"),
            _ => name.push(c),
        }
    }
    if copy > 0 {
        name.push('~');
        name.push_str(&copy.to_string());
    }
    name.push('.');
    name.push_str(NOTE_EXT);
    name
}

/// Recover the original identifier from a trash file name.
pub fn id_from_trash_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".md")?;
    let encoded = match stem.rfind('~') {
        Some(idx) if stem[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &stem[..idx],
        _ => stem,
    };

    let mut id = String::with_capacity(encoded.len());
    let mut rest = encoded;
    while let Some(pos) = rest.find('%') {
        id.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => id.push('%'),
            "2F" => id.push('/'),
            "7E" => id.push('~'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    id.push_str(rest);

    if validate_id(&id).is_err() {
        return None;
    }
    Some(id)
}
