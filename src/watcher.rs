use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::error::{NoteError, Result};
use crate::paths::{JOURNAL_DIR, NOTE_EXT};

const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

// File watcher event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub id: String,
}

/// Keeps the OS watcher alive; dropping it stops the events.
pub struct NoteWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch the notes root recursively and report changes to note files by id.
///
/// Events for the trash, the runtime templates, staging files and other
/// dot-directories are dropped. A change is reported once its note has been
/// quiet for 500ms, carrying the latest kind seen, so a burst of writes ends
/// in one event after the final write.
pub fn watch(root: &Path) -> Result<(NoteWatcher, UnboundedReceiver<FileChange>)> {
    let (tx, rx) = unbounded_channel();
    let (raw_tx, raw_rx) = mpsc::channel();
    let root_path = root.to_path_buf();

    std::thread::Builder::new()
        .name("note-watcher".to_string())
        .spawn(move || run_debounce(raw_rx, tx, DEBOUNCE))
        .map_err(|e| NoteError::io(root, e))?;

    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) => forward(&root_path, &event, &raw_tx),
            Err(e) => warn!(error = %e, "file watcher error"),
        },
        Config::default(),
    )
    .map_err(|e| NoteError::io(root, std::io::Error::other(e)))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| NoteError::io(root, std::io::Error::other(e)))?;

    debug!(root = %root.display(), "watching notes folder");
    Ok((NoteWatcher { _watcher: watcher }, rx))
}

fn forward(root: &Path, event: &notify::Event, raw: &mpsc::Sender<(String, ChangeKind)>) {
    let kind = match event.kind {
        notify::EventKind::Create(_) => ChangeKind::Created,
        notify::EventKind::Modify(_) => ChangeKind::Modified,
        notify::EventKind::Remove(_) => ChangeKind::Deleted,
        _ => return,
    };

    for path in &event.paths {
        if let Some(id) = note_id_for(root, path) {
            if raw.send((id, kind)).is_err() {
                return;
            }
        }
    }
}

/// Runs on its own thread until the watcher, and with it the sending side, is
/// dropped.
fn run_debounce(
    raw: mpsc::Receiver<(String, ChangeKind)>,
    tx: UnboundedSender<FileChange>,
    window: Duration,
) {
    let mut debouncer = Debouncer::new(window);
    loop {
        let received = match debouncer.next_due() {
            Some(due) => raw.recv_timeout(due.saturating_duration_since(Instant::now())),
            None => raw.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((id, kind)) => debouncer.record(id, kind, Instant::now()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        for change in debouncer.drain_quiet(Instant::now()) {
            if tx.send(change).is_err() {
                return;
            }
        }
    }
}

// Pending change per note id: latest kind and when it was last seen
struct Debouncer {
    window: Duration,
    pending: HashMap<String, (ChangeKind, Instant)>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn record(&mut self, id: String, kind: ChangeKind, now: Instant) {
        self.pending.insert(id, (kind, now));
    }

    fn next_due(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, last)| *last + self.window)
            .min()
    }

    /// Remove and return the changes whose note has been quiet for the window.
    fn drain_quiet(&mut self, now: Instant) -> Vec<FileChange> {
        let mut ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (_, last))| now.saturating_duration_since(*last) >= self.window)
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();

        ready
            .into_iter()
            .filter_map(|id| {
                let (kind, _) = self.pending.remove(&id)?;
                Some(FileChange { kind, id })
            })
            .collect()
    }
}

/// Map a path under the notes root to a note id, or `None` when the file is
/// not a user-visible note.
pub fn note_id_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.extension()? != NOTE_EXT {
        return None;
    }

    let mut segments = Vec::new();
    for (i, component) in relative.components().enumerate() {
        let segment = match component {
            Component::Normal(s) => s.to_str()?,
            _ => return None,
        };
        if segment.starts_with('.') && !(i == 0 && segment == JOURNAL_DIR) {
            return None;
        }
        segments.push(segment);
    }

    let last = segments.pop()?;
    let stem = last.strip_suffix(".md")?;
    if stem.is_empty() {
        return None;
    }
    segments.push(stem);
    Some(segments.join("/"))
}
