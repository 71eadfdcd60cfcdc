use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{NoteError, Result};
use crate::links::{apply_edits, compute_rename_edits};
use crate::paths::{
    id_from_trash_name, is_reserved, journal_header, journal_id, validate_id, NotePaths,
    JOURNAL_DIR, NOTE_EXT,
};

const HOME_NOTE: &str = "home";

// In-memory buffer for one note
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub id: String,
    pub path: PathBuf,
    pub content: String,
    /// The buffer holds edits that are not on disk yet.
    pub dirty: bool,
    /// Checksum of the content last read from or written to disk.
    pub checksum: String,
    pub modified: i64,
}

// Node in the user-visible note tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TreeNode {
    Folder {
        id: String,
        name: String,
        children: Vec<TreeNode>,
    },
    Note {
        id: String,
        name: String,
    },
}

impl TreeNode {
    pub fn id(&self) -> &str {
        match self {
            TreeNode::Folder { id, .. } | TreeNode::Note { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashedNote {
    pub file_name: String,
    pub original_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Existing,
    Create,
}

/// Single authority for note existence and content.
///
/// Holds at most one resident `Note` per identifier; loading an identifier
/// that is already resident returns the resident buffer instead of re-reading
/// the file, so unsaved edits cannot be clobbered by a second load.
pub struct NoteIndex {
    paths: NotePaths,
    resident: HashMap<String, Note>,
}

impl NoteIndex {
    /// Open (creating if needed) a notes root with its trash and journal
    /// folders and an empty `home` note.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = NotePaths::new(root);
        for dir in [paths.root().to_path_buf(), paths.trash_root(), paths.journal_root()] {
            fs::create_dir_all(&dir).map_err(|e| NoteError::io(&dir, e))?;
        }

        let index = Self {
            paths,
            resident: HashMap::new(),
        };
        let home = index.paths.note_path(HOME_NOTE)?;
        if create_file(&home, "")? {
            info!(path = %home.display(), "created home note");
        }
        Ok(index)
    }

    pub fn paths(&self) -> &NotePaths {
        &self.paths
    }

    /// Snapshot of the note tree: folders first, then notes, each sorted by
    /// name. Reserved and hidden folders are left out.
    pub fn list(&self) -> Result<Vec<TreeNode>> {
        walk_tree(self.paths.root(), "")
    }

    /// Identifiers of every note on disk, optionally including journal entries.
    pub fn note_ids(&self, include_journal: bool) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        collect_ids(&self.list()?, &mut ids);
        if include_journal {
            let journal = self.paths.journal_root();
            if journal.is_dir() {
                collect_ids(&walk_tree(&journal, JOURNAL_DIR)?, &mut ids);
            }
        }
        Ok(ids)
    }

    pub fn exists(&self, id: &str) -> bool {
        if self.resident.contains_key(id) {
            return true;
        }
        self.paths
            .note_path(id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    pub fn is_resident(&self, id: &str) -> bool {
        self.resident.contains_key(id)
    }

    pub fn note(&self, id: &str) -> Option<&Note> {
        self.resident.get(id)
    }

    pub fn load(&mut self, id: &str, mode: LoadMode) -> Result<&mut Note> {
        self.load_or_init(id, mode, "")
    }

    fn load_or_init(&mut self, id: &str, mode: LoadMode, initial: &str) -> Result<&mut Note> {
        let path = self.paths.note_path(id)?;
        if is_reserved(id) {
            return Err(NoteError::NotFound(id.to_string()));
        }

        if !self.resident.contains_key(id) {
            if !path.is_file() {
                if mode == LoadMode::Existing {
                    return Err(NoteError::NotFound(id.to_string()));
                }
                if create_file(&path, initial)? {
                    info!(id = %id, "created note");
                }
            }
            let note = read_note(id, &path)?;
            self.resident.insert(id.to_string(), note);
        }

        self.resident
            .get_mut(id)
            .ok_or_else(|| NoteError::NotFound(id.to_string()))
    }

    /// Replace the in-memory buffer of a resident note. Returns whether the
    /// content changed.
    pub fn set_content(&mut self, id: &str, content: &str) -> Result<bool> {
        let note = self
            .resident
            .get_mut(id)
            .ok_or_else(|| NoteError::NotFound(id.to_string()))?;
        if note.content == content {
            return Ok(false);
        }
        note.content = content.to_string();
        note.dirty = true;
        Ok(true)
    }

    /// Replace the persisted content of `id` and leave the buffer clean.
    pub fn write(&mut self, id: &str, content: &str) -> Result<()> {
        let path = self.paths.note_path(id)?;
        if is_reserved(id) {
            return Err(NoteError::NotFound(id.to_string()));
        }
        if let Some(note) = self.resident.get_mut(id) {
            if note.content != content {
                note.content = content.to_string();
                note.dirty = true;
            }
        }
        self.persist_snapshot(id, &path, content).map(|_| ())
    }

    /// Write `snapshot` for a resident note. The buffer may have moved on
    /// since the snapshot was taken; the returned flag says whether it still
    /// differs from what is now on disk.
    pub(crate) fn persist(&mut self, id: &str, snapshot: &str) -> Result<bool> {
        let path = self.paths.note_path(id)?;
        self.persist_snapshot(id, &path, snapshot)
    }

    fn persist_snapshot(&mut self, id: &str, path: &Path, snapshot: &str) -> Result<bool> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| NoteError::Persist {
                id: id.to_string(),
                source,
            })?;
        }
        write_atomic(path, snapshot).map_err(|source| {
            warn!(id = %id, error = %source, "note write failed");
            NoteError::Persist {
                id: id.to_string(),
                source,
            }
        })?;
        debug!(id = %id, bytes = snapshot.len(), "note written");

        let modified = modified_secs(path);
        match self.resident.get_mut(id) {
            Some(note) => {
                note.checksum = checksum(snapshot);
                note.modified = modified;
                note.dirty = note.content != snapshot;
                Ok(note.dirty)
            }
            None => Ok(false),
        }
    }

    /// Drop a clean resident buffer. Dirty buffers stay resident.
    pub fn release(&mut self, id: &str) -> bool {
        match self.resident.get(id) {
            Some(note) if !note.dirty => {
                self.resident.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Re-read a resident note after an external change. Only clean buffers
    /// whose file checksum differs are replaced.
    pub fn refresh(&mut self, id: &str) -> Result<bool> {
        let note = match self.resident.get_mut(id) {
            Some(note) => note,
            None => return Ok(false),
        };
        if note.dirty {
            warn!(id = %id, "file changed on disk while buffer has unsaved edits; keeping buffer");
            return Ok(false);
        }
        if !note.path.is_file() {
            return Ok(false);
        }
        let content = fs::read_to_string(&note.path).map_err(|e| NoteError::io(&note.path, e))?;
        let sum = checksum(&content);
        if sum == note.checksum {
            return Ok(false);
        }
        note.content = content;
        note.checksum = sum;
        note.modified = modified_secs(&note.path);
        debug!(id = %id, "reloaded note from disk");
        Ok(true)
    }

    /// Move a note under `.trash` using its flattened name. Unsaved buffer
    /// content goes to the trash with it. Returns the trash file name.
    pub fn move_to_trash(&mut self, id: &str) -> Result<String> {
        let path = self.paths.note_path(id)?;
        if is_reserved(id) || (!path.is_file() && !self.resident.contains_key(id)) {
            return Err(NoteError::NotFound(id.to_string()));
        }

        let content = match self.resident.get(id) {
            Some(note) => note.content.clone(),
            None => fs::read_to_string(&path).map_err(|e| NoteError::io(&path, e))?,
        };

        let trash_root = self.paths.trash_root();
        fs::create_dir_all(&trash_root).map_err(|e| NoteError::io(&trash_root, e))?;
        let mut copy = 0;
        let mut trash_path = self.paths.trash_path(id, copy)?;
        while trash_path.exists() {
            copy += 1;
            trash_path = self.paths.trash_path(id, copy)?;
        }

        write_atomic(&trash_path, &content).map_err(|e| NoteError::io(&trash_path, e))?;
        if path.is_file() {
            fs::remove_file(&path).map_err(|e| NoteError::io(&path, e))?;
        }
        self.resident.remove(id);

        let file_name = trash_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        info!(id = %id, trash = %file_name, "moved note to trash");
        Ok(file_name)
    }

    pub fn list_trash(&self) -> Result<Vec<TrashedNote>> {
        let trash_root = self.paths.trash_root();
        let mut trashed = Vec::new();
        if !trash_root.is_dir() {
            return Ok(trashed);
        }
        for entry in fs::read_dir(&trash_root)
            .map_err(|e| NoteError::io(&trash_root, e))?
            .flatten()
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(original_id) = id_from_trash_name(&file_name) {
                trashed.push(TrashedNote {
                    file_name,
                    original_id,
                });
            }
        }
        trashed.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(trashed)
    }

    /// Move a trashed note back to its original identifier.
    pub fn restore(&mut self, file_name: &str) -> Result<String> {
        let trash_path = self.trash_entry(file_name)?;
        let id = id_from_trash_name(file_name)
            .ok_or_else(|| NoteError::InvalidIdentifier(file_name.to_string()))?;
        if self.exists(&id) {
            return Err(NoteError::AlreadyExists(id));
        }

        let path = self.paths.note_path(&id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| NoteError::io(parent, e))?;
        }
        fs::rename(&trash_path, &path).map_err(|e| NoteError::io(&trash_path, e))?;
        info!(id = %id, "restored note from trash");
        Ok(id)
    }

    /// Permanently delete a trashed note.
    pub fn purge(&mut self, file_name: &str) -> Result<()> {
        let trash_path = self.trash_entry(file_name)?;
        fs::remove_file(&trash_path).map_err(|e| NoteError::io(&trash_path, e))?;
        info!(trash = %file_name, "purged note from trash");
        Ok(())
    }

    fn trash_entry(&self, file_name: &str) -> Result<PathBuf> {
        // Trashed journal entries start with '.', so only the name shape is checked.
        let malformed = matches!(file_name, "" | "." | "..")
            || file_name.contains('/')
            || file_name.contains('\\')
            || id_from_trash_name(file_name).is_none();
        if malformed {
            return Err(NoteError::InvalidIdentifier(file_name.to_string()));
        }
        let path = self.paths.trash_root().join(file_name);
        if !path.is_file() {
            return Err(NoteError::NotFound(file_name.to_string()));
        }
        Ok(path)
    }

    /// Today's journal entry, created with a date heading on first use.
    pub fn today(&mut self) -> Result<&mut Note> {
        self.journal_entry(chrono::Local::now().date_naive())
    }

    pub fn journal_entry(&mut self, date: NaiveDate) -> Result<&mut Note> {
        let id = journal_id(date);
        self.load_or_init(&id, LoadMode::Create, &journal_header(date))
    }

    pub fn create_folder(&mut self, id: &str) -> Result<PathBuf> {
        if is_reserved(id) {
            return Err(NoteError::InvalidIdentifier(id.to_string()));
        }
        let dir = self.paths.folder_path(id)?;
        fs::create_dir_all(&dir).map_err(|e| NoteError::io(&dir, e))?;
        Ok(dir)
    }

    /// Remove an empty folder. Returns false when it still has entries.
    pub fn delete_folder(&mut self, id: &str) -> Result<bool> {
        if id.is_empty() || is_reserved(id) || id == JOURNAL_DIR {
            return Err(NoteError::InvalidIdentifier(id.to_string()));
        }
        let dir = self.paths.folder_path(id)?;
        if !dir.is_dir() {
            return Err(NoteError::NotFound(id.to_string()));
        }
        let empty = fs::read_dir(&dir)
            .map_err(|e| NoteError::io(&dir, e))?
            .next()
            .is_none();
        if !empty {
            return Ok(false);
        }
        fs::remove_dir(&dir).map_err(|e| NoteError::io(&dir, e))?;
        Ok(true)
    }

    /// Move a note to a new identifier and retarget `[[old]]` links in every
    /// other note. Returns the identifiers of resident notes whose buffers
    /// were rewritten (they are left dirty).
    pub fn rename(&mut self, old_id: &str, new_id: &str) -> Result<Vec<String>> {
        let old_path = self.paths.note_path(old_id)?;
        let new_path = self.paths.note_path(new_id)?;
        if is_reserved(old_id) || !self.exists(old_id) {
            return Err(NoteError::NotFound(old_id.to_string()));
        }
        if is_reserved(new_id) {
            return Err(NoteError::InvalidIdentifier(new_id.to_string()));
        }
        if self.exists(new_id) {
            return Err(NoteError::AlreadyExists(new_id.to_string()));
        }

        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).map_err(|e| NoteError::io(parent, e))?;
        }
        if old_path.is_file() {
            fs::rename(&old_path, &new_path).map_err(|e| NoteError::io(&old_path, e))?;
        } else {
            create_file(&new_path, "")?;
        }
        if let Some(mut note) = self.resident.remove(old_id) {
            note.id = new_id.to_string();
            note.path = new_path.clone();
            self.resident.insert(new_id.to_string(), note);
        }
        info!(from = %old_id, to = %new_id, "renamed note");

        let mut touched = Vec::new();
        for id in self.note_ids(true)? {
            if id == new_id {
                continue;
            }
            if let Some(note) = self.resident.get_mut(&id) {
                let edits = compute_rename_edits(&note.content, old_id, new_id);
                if !edits.is_empty() {
                    apply_edits(&mut note.content, &edits);
                    note.dirty = true;
                    touched.push(id);
                }
                continue;
            }

            let path = self.paths.note_path(&id)?;
            let mut content = fs::read_to_string(&path).map_err(|e| NoteError::io(&path, e))?;
            let edits = compute_rename_edits(&content, old_id, new_id);
            if edits.is_empty() {
                continue;
            }
            apply_edits(&mut content, &edits);
            write_atomic(&path, &content).map_err(|source| NoteError::Persist {
                id: id.clone(),
                source,
            })?;
            debug!(id = %id, links = edits.len(), "retargeted links");
        }
        Ok(touched)
    }
}

fn walk_tree(dir: &Path, prefix: &str) -> Result<Vec<TreeNode>> {
    // Parent id -> (folders, notes), each as (id, name).
    let mut levels: Levels = HashMap::new();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_hidden(e)));

    for entry in walker {
        let entry = entry.map_err(|e| NoteError::walk(dir, e))?;
        let relative = match entry.path().strip_prefix(dir).ok().and_then(relative_id) {
            Some(relative) => relative,
            None => continue,
        };
        let (parent, name) = match relative.rsplit_once('/') {
            Some((parent, name)) => (join_id(prefix, parent), name.to_string()),
            None => (prefix.to_string(), relative.clone()),
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            let id = join_id(&parent, &name);
            levels.entry(parent).or_default().0.push((id, name));
        } else if file_type.is_file() {
            let stem = match name.strip_suffix(&format!(".{}", NOTE_EXT)) {
                Some(stem) if !stem.is_empty() => stem.to_string(),
                _ => continue,
            };
            let id = join_id(&parent, &stem);
            if validate_id(&id).is_err() {
                continue;
            }
            levels.entry(parent).or_default().1.push((id, stem));
        }
    }

    Ok(assemble(&mut levels, prefix))
}

type Levels = HashMap<String, (Vec<(String, String)>, Vec<(String, String)>)>;

fn assemble(levels: &mut Levels, parent: &str) -> Vec<TreeNode> {
    let (mut folders, mut notes) = levels.remove(parent).unwrap_or_default();
    folders.sort();
    notes.sort();

    let mut nodes: Vec<TreeNode> = folders
        .into_iter()
        .map(|(id, name)| {
            let children = assemble(levels, &id);
            TreeNode::Folder { id, name, children }
        })
        .collect();
    nodes.extend(notes.into_iter().map(|(id, name)| TreeNode::Note { id, name }));
    nodes
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map_or(true, |name| name.starts_with('.'))
}

fn relative_id(path: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = path.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn join_id(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn collect_ids(nodes: &[TreeNode], ids: &mut Vec<String>) {
    for node in nodes {
        match node {
            TreeNode::Folder { children, .. } => collect_ids(children, ids),
            TreeNode::Note { id, .. } => ids.push(id.clone()),
        }
    }
}

fn read_note(id: &str, path: &Path) -> Result<Note> {
    let content = fs::read_to_string(path).map_err(|e| NoteError::io(path, e))?;
    Ok(Note {
        id: id.to_string(),
        path: path.to_path_buf(),
        checksum: checksum(&content),
        content,
        dirty: false,
        modified: modified_secs(path),
    })
}

/// Create `path` with `initial` content unless it already exists. Uses
/// `create_new`, so racing creators produce exactly one file.
fn create_file(path: &Path, initial: &str) -> Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| NoteError::io(parent, e))?;
    }
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(initial.as_bytes())
                .map_err(|e| NoteError::io(path, e))?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(NoteError::io(path, e)),
    }
}

/// Write to a staging file next to `path`, then rename over it.
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let staging = staging_path(path);
    let result = (|| {
        let mut file = fs::File::create(&staging)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&staging, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn checksum(content: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn modified_secs(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
