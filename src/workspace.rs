use futures::FutureExt;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::annotate::{find_markers, splice, AnnotationPipeline, AnnotationWarning, Generator, Outcome};
use crate::error::{NoteError, Result};
use crate::links::resolve_or_create;
use crate::notes::{LoadMode, Note, NoteIndex, TrashedNote};
use crate::persistence::{PersistenceScheduler, TickReport};
use crate::search::{file_modified, SearchIndex, SearchResult};
use crate::templates::TemplateStore;
use crate::watcher::{self, ChangeKind, FileChange, NoteWatcher};

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub notes_root: PathBuf,
    pub template_source: PathBuf,
    /// On-disk search index location; `None` keeps the index in memory.
    pub index_path: Option<PathBuf>,
    pub watch: bool,
}

// Generation results waiting to be spliced into their note
struct PendingAnnotation {
    id: String,
    outcomes: Vec<Outcome>,
    warnings: Vec<AnnotationWarning>,
}

/// One open notes folder: the note index, its save scheduler, the prompt
/// templates, the search index and the background annotation tasks.
///
/// Driven from a single task. Callers pass `now` so tests can control time.
pub struct Workspace {
    notes: NoteIndex,
    templates: Arc<TemplateStore>,
    scheduler: PersistenceScheduler,
    search: SearchIndex,
    pipeline: AnnotationPipeline,
    annotations: Vec<JoinHandle<PendingAnnotation>>,
    watcher: Option<(NoteWatcher, UnboundedReceiver<FileChange>)>,
}

impl Workspace {
    pub fn open(config: WorkspaceConfig, generator: Arc<dyn Generator>) -> Result<Self> {
        Self::with_scheduler(config, generator, PersistenceScheduler::new())
    }

    pub fn with_scheduler(
        config: WorkspaceConfig,
        generator: Arc<dyn Generator>,
        scheduler: PersistenceScheduler,
    ) -> Result<Self> {
        let notes = NoteIndex::open(&config.notes_root)?;

        let templates = Arc::new(TemplateStore::new(
            &config.template_source,
            notes.paths().keys_root(),
        ));
        templates.reload()?;

        let search = match &config.index_path {
            Some(path) => SearchIndex::open(path)?,
            None => SearchIndex::in_memory()?,
        };
        search.rebuild(&notes)?;

        let watcher = if config.watch {
            match watcher::watch(notes.paths().root()) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!(error = %e, "file watcher unavailable, external edits will not be picked up");
                    None
                }
            }
        } else {
            None
        };

        info!(root = %config.notes_root.display(), "workspace opened");
        Ok(Self {
            notes,
            pipeline: AnnotationPipeline::new(templates.clone(), generator),
            templates,
            scheduler,
            search,
            annotations: Vec::new(),
            watcher,
        })
    }

    pub fn notes(&self) -> &NoteIndex {
        &self.notes
    }

    pub fn scheduler(&self) -> &PersistenceScheduler {
        &self.scheduler
    }

    pub fn prompt_names(&self) -> BTreeSet<String> {
        self.templates.list_prompt_names()
    }

    pub fn active(&self) -> Option<&Note> {
        self.scheduler.active().and_then(|id| self.notes.note(id))
    }

    /// Make an existing note the active one, flushing the previous one.
    pub fn open_note(&mut self, id: &str, now: Instant) -> Result<&Note> {
        self.notes.load(id, LoadMode::Existing)?;
        self.activate(id, now)
    }

    /// Follow a `[[target]]` link, creating the note when it does not exist.
    pub fn follow_link(&mut self, target: &str, now: Instant) -> Result<&Note> {
        let id = resolve_or_create(&mut self.notes, target)?.id.clone();
        self.reindex(&id);
        self.activate(&id, now)
    }

    pub fn open_today(&mut self, now: Instant) -> Result<&Note> {
        let id = self.notes.today()?.id.clone();
        self.reindex(&id);
        self.activate(&id, now)
    }

    fn activate(&mut self, id: &str, now: Instant) -> Result<&Note> {
        self.scheduler.switch_to(&mut self.notes, id, now)?;
        self.notes
            .note(id)
            .ok_or_else(|| NoteError::NotFound(id.to_string()))
    }

    pub fn edit(&mut self, id: &str, content: &str, now: Instant) -> Result<()> {
        self.scheduler.edit(&mut self.notes, id, content, now)
    }

    /// One pass of the driver loop: apply finished annotations, pick up
    /// external edits, then save notes whose debounce window elapsed.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        self.apply_annotations(now);
        for change in self.poll_external_changes() {
            info!(id = %change.id, kind = ?change.kind, "external change");
        }

        let report = self.scheduler.tick(&mut self.notes, now);
        for id in &report.saved {
            self.reindex(id);
        }
        report
    }

    pub fn flush(&mut self, id: &str, now: Instant) -> Result<()> {
        self.scheduler.flush(&mut self.notes, id, now)?;
        self.reindex(id);
        Ok(())
    }

    /// Start annotating a note in the background. The note text is captured
    /// now; responses are spliced into whatever the note holds when they are
    /// applied. Returns false when the note has no pending markers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn annotate(&mut self, id: &str) -> Result<bool> {
        let snapshot = self.notes.load(id, LoadMode::Existing)?.content.clone();
        if find_markers(&snapshot).is_empty() {
            return Ok(false);
        }

        let pipeline = self.pipeline.clone();
        let id = id.to_string();
        debug!(id = %id, "annotation started");
        self.annotations.push(tokio::spawn(async move {
            let (outcomes, warnings) = pipeline.generate_all(&snapshot).await;
            PendingAnnotation {
                id,
                outcomes,
                warnings,
            }
        }));
        Ok(true)
    }

    /// Splice in every annotation whose generation has finished.
    pub fn apply_annotations(&mut self, now: Instant) -> Vec<AnnotationWarning> {
        let handles = std::mem::take(&mut self.annotations);
        let mut warnings = Vec::new();
        for handle in handles {
            if !handle.is_finished() {
                self.annotations.push(handle);
                continue;
            }
            match handle.now_or_never() {
                Some(Ok(pending)) => warnings.extend(self.apply_pending(pending, now)),
                Some(Err(e)) => warn!(error = %e, "annotation task failed"),
                None => {}
            }
        }
        warnings
    }

    /// Wait for every running annotation and apply the results.
    pub async fn finish_annotations(&mut self, now: Instant) -> Vec<AnnotationWarning> {
        let mut warnings = Vec::new();
        for handle in std::mem::take(&mut self.annotations) {
            match handle.await {
                Ok(pending) => warnings.extend(self.apply_pending(pending, now)),
                Err(e) => warn!(error = %e, "annotation task failed"),
            }
        }
        warnings
    }

    // The note may no longer be active; it is marked dirty either way and
    // saved by the normal debounce.
    fn apply_pending(&mut self, pending: PendingAnnotation, now: Instant) -> Vec<AnnotationWarning> {
        let PendingAnnotation {
            id,
            outcomes,
            mut warnings,
        } = pending;

        let current = match self.notes.load(&id, LoadMode::Existing) {
            Ok(note) => note.content.clone(),
            Err(e) => {
                warn!(id = %id, error = %e, "annotated note is gone, dropping responses");
                return warnings;
            }
        };

        let (text, splice_warnings) = splice(&current, &outcomes);
        for warning in &splice_warnings {
            warn!(id = %id, ?warning, "response not placed");
        }
        warnings.extend(splice_warnings);

        if let Err(e) = self.scheduler.edit(&mut self.notes, &id, &text, now) {
            warn!(id = %id, error = %e, "failed to apply annotations");
        } else {
            info!(id = %id, responses = outcomes.len(), "annotations applied");
        }
        warnings
    }

    /// Drain watcher events: refresh clean resident notes and keep the search
    /// index in step with files edited outside the app.
    pub fn poll_external_changes(&mut self) -> Vec<FileChange> {
        let mut changes = Vec::new();
        if let Some((_, rx)) = self.watcher.as_mut() {
            while let Ok(change) = rx.try_recv() {
                changes.push(change);
            }
        }

        for change in &changes {
            match change.kind {
                ChangeKind::Created | ChangeKind::Modified => {
                    if let Err(e) = self.notes.refresh(&change.id) {
                        warn!(id = %change.id, error = %e, "failed to refresh note");
                    }
                    self.reindex(&change.id);
                }
                ChangeKind::Deleted => {
                    let still_there = self
                        .notes
                        .paths()
                        .note_path(&change.id)
                        .map(|path| path.is_file())
                        .unwrap_or(false);
                    // A dirty buffer survives the deletion and will be saved again.
                    if still_there || (self.notes.is_resident(&change.id) && !self.notes.release(&change.id)) {
                        continue;
                    }
                    if let Err(e) = self.search.delete_note(&change.id) {
                        warn!(id = %change.id, error = %e, "failed to drop note from search");
                    }
                }
            }
        }
        changes
    }

    pub fn trash(&mut self, id: &str) -> Result<String> {
        let file_name = self.notes.move_to_trash(id)?;
        self.scheduler.forget(id);
        self.search.delete_note(id)?;
        Ok(file_name)
    }

    pub fn list_trash(&self) -> Result<Vec<TrashedNote>> {
        self.notes.list_trash()
    }

    pub fn restore(&mut self, file_name: &str) -> Result<String> {
        let id = self.notes.restore(file_name)?;
        self.reindex(&id);
        Ok(id)
    }

    pub fn purge(&mut self, file_name: &str) -> Result<()> {
        self.notes.purge(file_name)
    }

    /// Rename a note and retarget links to it. Open buffers that held such
    /// links become dirty and are saved by the debounce.
    pub fn rename(&mut self, old_id: &str, new_id: &str, now: Instant) -> Result<()> {
        let touched = self.notes.rename(old_id, new_id)?;
        self.scheduler.rename(old_id, new_id);
        for id in &touched {
            self.scheduler.mark_dirty(id, now);
        }
        self.search.rebuild(&self.notes)?;
        Ok(())
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.search.search(query, limit)
    }

    /// Flush all dirty notes. Running annotations are abandoned; returns how
    /// many were still generating.
    pub fn shutdown(&mut self, now: Instant) -> Result<usize> {
        let abandoned = self.annotations.iter().filter(|h| !h.is_finished()).count();
        if abandoned > 0 {
            warn!(abandoned, "annotations still running at shutdown, results dropped");
        }
        for handle in self.annotations.drain(..) {
            handle.abort();
        }
        self.scheduler.shutdown(&mut self.notes, now)?;
        Ok(abandoned)
    }

    fn reindex(&self, id: &str) {
        let result = match self.notes.note(id) {
            Some(note) => self.search.index(note),
            None => self.notes.paths().note_path(id).and_then(|path| {
                match std::fs::read_to_string(&path) {
                    Ok(content) => self.search.index_note(id, &content, file_modified(&path)),
                    Err(_) => self.search.delete_note(id),
                }
            }),
        };
        if let Err(e) = result {
            warn!(id = %id, error = %e, "failed to update search index");
        }
    }
}
