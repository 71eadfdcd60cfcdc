use serde::Serialize;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{NoteError, Result};
use crate::notes::NoteIndex;

/// Delay after the last edit before an automatic save.
pub const AUTOSAVE_DEBOUNCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SaveState {
    Clean,
    Dirty,
    Saving,
}

#[derive(Debug)]
struct Tracked {
    state: SaveState,
    deadline: Option<Instant>,
    /// An edit arrived while the note was `Saving`.
    follow_up: bool,
}

impl Tracked {
    fn clean() -> Self {
        Self {
            state: SaveState::Clean,
            deadline: None,
            follow_up: false,
        }
    }
}

/// A write in flight: the content captured when the save began.
#[derive(Debug)]
pub struct SaveTicket {
    id: String,
    snapshot: String,
}

impl SaveTicket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub saved: Vec<String>,
    pub failed: Vec<NoteError>,
}

/// Debounced auto-save with forced flushes on note switch and shutdown.
///
/// Per note: `Clean -> Dirty -> Saving -> Clean`. Every edit re-arms the
/// debounce deadline. At most one write per note is in flight; an edit made
/// while `Saving` sends the note back to `Dirty` once that write completes.
/// A failed write leaves the note `Dirty` and is retried on the next tick.
pub struct PersistenceScheduler {
    debounce: Duration,
    tracked: HashMap<String, Tracked>,
    active: Option<String>,
}

impl Default for PersistenceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceScheduler {
    pub fn new() -> Self {
        Self::with_debounce(AUTOSAVE_DEBOUNCE)
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            debounce,
            tracked: HashMap::new(),
            active: None,
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn state(&self, id: &str) -> SaveState {
        self.tracked
            .get(id)
            .map(|t| t.state)
            .unwrap_or(SaveState::Clean)
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.state(id) != SaveState::Clean
    }

    pub fn dirty_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.state != SaveState::Clean)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Earliest pending debounce deadline, for the driver loop to sleep on.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tracked.values().filter_map(|t| t.deadline).min()
    }

    /// Apply an edit to a resident note's buffer and (re)start its countdown.
    pub fn edit(&mut self, index: &mut NoteIndex, id: &str, content: &str, now: Instant) -> Result<()> {
        if index.set_content(id, content)? {
            self.mark_dirty(id, now);
        }
        Ok(())
    }

    /// Record that a buffer changed outside `edit` (annotation, link rewrite).
    pub fn mark_dirty(&mut self, id: &str, now: Instant) {
        let debounce = self.debounce;
        let tracked = self
            .tracked
            .entry(id.to_string())
            .or_insert_with(Tracked::clean);
        match tracked.state {
            SaveState::Saving => tracked.follow_up = true,
            SaveState::Clean | SaveState::Dirty => tracked.state = SaveState::Dirty,
        }
        tracked.deadline = Some(now + debounce);
    }

    /// Start writing a dirty note: capture its buffer and mark it `Saving`.
    pub fn begin_save(&mut self, index: &NoteIndex, id: &str) -> Option<SaveTicket> {
        let tracked = self.tracked.get_mut(id)?;
        if tracked.state != SaveState::Dirty {
            return None;
        }
        let snapshot = index.note(id)?.content.clone();
        tracked.state = SaveState::Saving;
        tracked.deadline = None;
        tracked.follow_up = false;
        Some(SaveTicket {
            id: id.to_string(),
            snapshot,
        })
    }

    /// Write the ticket's snapshot and settle the note's state.
    pub fn complete_save(&mut self, index: &mut NoteIndex, ticket: SaveTicket, now: Instant) -> Result<()> {
        let SaveTicket { id, snapshot } = ticket;
        let result = index.persist(&id, &snapshot);
        let debounce = self.debounce;
        let tracked = self
            .tracked
            .entry(id.clone())
            .or_insert_with(Tracked::clean);

        match result {
            Ok(buffer_moved_on) => {
                if buffer_moved_on || tracked.follow_up {
                    tracked.state = SaveState::Dirty;
                    tracked.deadline = Some(now + debounce);
                    debug!(id = %id, "edited during save, follow-up queued");
                } else {
                    tracked.state = SaveState::Clean;
                    tracked.deadline = None;
                    debug!(id = %id, "saved");
                }
                tracked.follow_up = false;
                Ok(())
            }
            Err(e) => {
                tracked.state = SaveState::Dirty;
                tracked.deadline = Some(now + debounce);
                tracked.follow_up = false;
                warn!(id = %id, error = %e, "save failed, will retry");
                Err(e)
            }
        }
    }

    /// Save every dirty note whose debounce window has elapsed.
    pub fn tick(&mut self, index: &mut NoteIndex, now: Instant) -> TickReport {
        let mut due: Vec<String> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.state == SaveState::Dirty && t.deadline.map_or(false, |d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();

        let mut report = TickReport::default();
        for id in due {
            match self.save_now(index, &id, now) {
                Ok(true) => report.saved.push(id),
                Ok(false) => {}
                Err(e) => report.failed.push(e),
            }
        }
        report
    }

    /// Write a dirty note immediately, cancelling its countdown.
    pub fn flush(&mut self, index: &mut NoteIndex, id: &str, now: Instant) -> Result<()> {
        self.save_now(index, id, now).map(|_| ())
    }

    fn save_now(&mut self, index: &mut NoteIndex, id: &str, now: Instant) -> Result<bool> {
        match self.begin_save(index, id) {
            Some(ticket) => self.complete_save(index, ticket, now).map(|_| true),
            None => Ok(false),
        }
    }

    /// Make `next` the active note. The previously active note is flushed
    /// first; if that write fails the switch does not happen.
    pub fn switch_to(&mut self, index: &mut NoteIndex, next: &str, now: Instant) -> Result<()> {
        if let Some(previous) = self.active.clone() {
            if previous != next {
                self.flush(index, &previous, now)?;
                if self.is_dirty(&previous) {
                    // The buffer moved on during the write; write it again.
                    self.flush(index, &previous, now)?;
                }
            }
        }
        self.active = Some(next.to_string());
        Ok(())
    }

    /// Flush every dirty note. Notes that fail stay dirty; the first error is
    /// returned after all notes have been attempted.
    pub fn shutdown(&mut self, index: &mut NoteIndex, now: Instant) -> Result<()> {
        let mut first_error = None;
        for id in self.dirty_ids() {
            if let Err(e) = self.flush(index, &id, now) {
                first_error.get_or_insert(e);
            }
        }
        self.active = None;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop tracking a note that was renamed or trashed.
    pub fn forget(&mut self, id: &str) {
        self.tracked.remove(id);
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
    }

    /// Carry tracking state across a rename.
    pub fn rename(&mut self, old_id: &str, new_id: &str) {
        if let Some(tracked) = self.tracked.remove(old_id) {
            self.tracked.insert(new_id.to_string(), tracked);
        }
        if self.active.as_deref() == Some(old_id) {
            self.active = Some(new_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::LoadMode;
    use std::fs;
    use tempfile::TempDir;

    fn setup(ids: &[&str]) -> (TempDir, NoteIndex, PersistenceScheduler) {
        let dir = TempDir::new().unwrap();
        let mut index = NoteIndex::open(dir.path()).unwrap();
        for id in ids {
            index.load(id, LoadMode::Create).unwrap();
        }
        (dir, index, PersistenceScheduler::new())
    }

    fn on_disk(dir: &TempDir, id: &str) -> String {
        fs::read_to_string(dir.path().join(format!("{}.md", id))).unwrap()
    }

    #[test]
    fn test_edit_saves_after_debounce() {
        let (dir, mut index, mut scheduler) = setup(&["a"]);
        let t0 = Instant::now();

        scheduler.edit(&mut index, "a", "hello", t0).unwrap();
        assert_eq!(scheduler.state("a"), SaveState::Dirty);
        assert_eq!(scheduler.next_deadline(), Some(t0 + AUTOSAVE_DEBOUNCE));

        let report = scheduler.tick(&mut index, t0 + Duration::from_secs(4));
        assert!(report.saved.is_empty());
        assert_eq!(on_disk(&dir, "a"), "");

        let report = scheduler.tick(&mut index, t0 + AUTOSAVE_DEBOUNCE);
        assert_eq!(report.saved, vec!["a".to_string()]);
        assert_eq!(scheduler.state("a"), SaveState::Clean);
        assert_eq!(on_disk(&dir, "a"), "hello");
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn test_each_edit_restarts_countdown() {
        let (dir, mut index, mut scheduler) = setup(&["a"]);
        let t0 = Instant::now();

        scheduler.edit(&mut index, "a", "h", t0).unwrap();
        scheduler.edit(&mut index, "a", "he", t0 + Duration::from_secs(3)).unwrap();

        let report = scheduler.tick(&mut index, t0 + Duration::from_secs(6));
        assert!(report.saved.is_empty());
        assert_eq!(on_disk(&dir, "a"), "");

        scheduler.tick(&mut index, t0 + Duration::from_secs(8));
        assert_eq!(on_disk(&dir, "a"), "he");
    }

    #[test]
    fn test_unchanged_edit_stays_clean() {
        let (_dir, mut index, mut scheduler) = setup(&["a"]);
        scheduler.edit(&mut index, "a", "", Instant::now()).unwrap();
        assert_eq!(scheduler.state("a"), SaveState::Clean);
    }

    #[test]
    fn test_switch_flushes_previous_note_first() {
        let (dir, mut index, mut scheduler) = setup(&["a", "b"]);
        let t0 = Instant::now();

        scheduler.switch_to(&mut index, "a", t0).unwrap();
        scheduler.edit(&mut index, "a", "unsaved work", t0).unwrap();

        scheduler.switch_to(&mut index, "b", t0 + Duration::from_millis(10)).unwrap();
        assert_eq!(on_disk(&dir, "a"), "unsaved work");
        assert_eq!(scheduler.state("a"), SaveState::Clean);
        assert_eq!(scheduler.active(), Some("b"));
        // The cancelled countdown does not fire a second write later.
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn test_failed_flush_blocks_switch_and_stays_dirty() {
        let (dir, mut index, mut scheduler) = setup(&["a", "b"]);
        let t0 = Instant::now();
        scheduler.switch_to(&mut index, "a", t0).unwrap();
        scheduler.edit(&mut index, "a", "precious", t0).unwrap();

        fs::create_dir_all(dir.path().join("a.md.tmp")).unwrap();
        let err = scheduler.switch_to(&mut index, "b", t0).unwrap_err();
        assert!(matches!(err, NoteError::Persist { .. }));
        assert_eq!(scheduler.active(), Some("a"));
        assert!(scheduler.is_dirty("a"));
        assert_eq!(scheduler.dirty_ids(), vec!["a".to_string()]);

        // Retry succeeds on the next tick once the obstruction is gone.
        fs::remove_dir(dir.path().join("a.md.tmp")).unwrap();
        let report = scheduler.tick(&mut index, t0 + AUTOSAVE_DEBOUNCE);
        assert_eq!(report.saved, vec!["a".to_string()]);
        assert_eq!(on_disk(&dir, "a"), "precious");
    }

    #[test]
    fn test_tick_reports_failures() {
        let (dir, mut index, mut scheduler) = setup(&["a"]);
        let t0 = Instant::now();
        scheduler.edit(&mut index, "a", "x", t0).unwrap();
        fs::create_dir_all(dir.path().join("a.md.tmp")).unwrap();

        let report = scheduler.tick(&mut index, t0 + AUTOSAVE_DEBOUNCE);
        assert!(report.saved.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(scheduler.state("a"), SaveState::Dirty);
        assert_eq!(
            scheduler.next_deadline(),
            Some(t0 + AUTOSAVE_DEBOUNCE + AUTOSAVE_DEBOUNCE)
        );
    }

    #[test]
    fn test_edit_during_save_queues_follow_up() {
        let (dir, mut index, mut scheduler) = setup(&["a"]);
        let t0 = Instant::now();
        scheduler.edit(&mut index, "a", "first", t0).unwrap();

        let ticket = scheduler.begin_save(&index, "a").unwrap();
        assert_eq!(scheduler.state("a"), SaveState::Saving);
        assert!(scheduler.begin_save(&index, "a").is_none(), "one write in flight per note");

        scheduler.edit(&mut index, "a", "second", t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(scheduler.state("a"), SaveState::Saving);

        scheduler.complete_save(&mut index, ticket, t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(on_disk(&dir, "a"), "first");
        assert_eq!(scheduler.state("a"), SaveState::Dirty);

        scheduler.tick(&mut index, t0 + Duration::from_secs(7));
        assert_eq!(on_disk(&dir, "a"), "second");
        assert_eq!(scheduler.state("a"), SaveState::Clean);
    }

    #[test]
    fn test_shutdown_flushes_everything() {
        let (dir, mut index, mut scheduler) = setup(&["a", "b"]);
        let t0 = Instant::now();
        scheduler.edit(&mut index, "a", "A", t0).unwrap();
        scheduler.edit(&mut index, "b", "B", t0).unwrap();

        scheduler.shutdown(&mut index, t0).unwrap();
        assert_eq!(on_disk(&dir, "a"), "A");
        assert_eq!(on_disk(&dir, "b"), "B");
        assert!(scheduler.dirty_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_with_paused_clock() {
        let (dir, mut index, mut scheduler) = setup(&["a"]);
        scheduler.edit(&mut index, "a", "typed", Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = scheduler.tick(&mut index, Instant::now());
        assert_eq!(report.saved, vec!["a".to_string()]);
        assert_eq!(on_disk(&dir, "a"), "typed");
    }
}
