use regex::Regex;
use serde::Serialize;
use std::ops::Range;
use std::sync::LazyLock;

use crate::error::Result;
use crate::notes::{LoadMode, Note, NoteIndex};

static WIKILINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("wikilink regex"));

/// One `[[target]]` occurrence in a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReference {
    pub source: String,
    /// Trimmed link text, used verbatim as the target note identifier.
    pub target: String,
    /// Byte range of the whole `[[...]]` match in the scanned text.
    pub range: Range<usize>,
}

/// Lazily yield every wiki link in `text`. Blank targets (`[[ ]]`) are skipped.
///
/// No normalization beyond trimming: `[[Project Plan]]` and `[[project plan]]`
/// are different notes.
pub fn scan<'a>(source: &'a str, text: &'a str) -> impl Iterator<Item = LinkReference> + 'a {
    WIKILINK_RE.captures_iter(text).filter_map(move |cap| {
        let whole = cap.get(0)?;
        let target = cap.get(1)?.as_str().trim();
        if target.is_empty() {
            return None;
        }
        Some(LinkReference {
            source: source.to_string(),
            target: target.to_string(),
            range: whole.range(),
        })
    })
}

/// Distinct link targets in order of first appearance.
pub fn targets(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for link in scan("", text) {
        if !seen.contains(&link.target) {
            seen.push(link.target);
        }
    }
    seen
}

/// The link under a byte offset, if any (a click in the editor).
pub fn link_at(text: &str, offset: usize) -> Option<LinkReference> {
    scan("", text).find(|link| link.range.contains(&offset))
}

/// Look up the link target, creating an empty note (and any missing folders)
/// when it does not exist yet. Calling this repeatedly for the same target
/// creates at most one file.
pub fn resolve_or_create<'a>(index: &'a mut NoteIndex, target: &str) -> Result<&'a mut Note> {
    index.load(target.trim(), LoadMode::Create)
}

/// A text edit: replace `remove_len` bytes at `offset` with `insert_text`.
#[derive(Debug, PartialEq, Eq)]
pub struct TextEdit {
    pub offset: usize,
    pub remove_len: usize,
    pub insert_text: String,
}

/// Edits that retarget every `[[old_id]]` link to `[[new_id]]`, in reverse
/// offset order so they can be applied one after another.
pub fn compute_rename_edits(text: &str, old_id: &str, new_id: &str) -> Vec<TextEdit> {
    let mut edits: Vec<TextEdit> = scan("", text)
        .filter(|link| link.target == old_id)
        .map(|link| TextEdit {
            offset: link.range.start,
            remove_len: link.range.len(),
            insert_text: format!("[[{}]]", new_id),
        })
        .collect();
    edits.sort_by(|a, b| b.offset.cmp(&a.offset));
    edits
}

pub fn apply_edits(text: &mut String, edits: &[TextEdit]) {
    for edit in edits {
        text.replace_range(edit.offset..edit.offset + edit.remove_len, &edit.insert_text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn extracts_simple_link() {
        let links: Vec<_> = scan("home", "See [[Project Plan]] for details").collect();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source, "home");
        assert_eq!(links[0].target, "Project Plan");
        assert_eq!(links[0].range, 4..20);
    }

    #[test]
    fn trims_whitespace_but_keeps_case() {
        let links: Vec<_> = scan("s", "[[  Mixed Case/Note  ]]").collect();
        assert_eq!(links[0].target, "Mixed Case/Note");
    }

    #[test]
    fn skips_blank_targets() {
        assert_eq!(scan("s", "[[]] and [[   ]]").count(), 0);
    }

    #[test]
    fn extracts_multiple_links() {
        let text = "[[One]] then [[Two]] and [[One]]";
        let links: Vec<String> = scan("s", text).map(|l| l.target).collect();
        assert_eq!(links, vec!["One", "Two", "One"]);
        assert_eq!(targets(text), vec!["One", "Two"]);
    }

    #[test]
    fn scan_is_restartable() {
        let text = "[[A]] [[B]]";
        let first: Vec<_> = scan("s", text).collect();
        let second: Vec<_> = scan("s", text).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn link_at_finds_clicked_link() {
        let text = "go [[There]] now";
        assert_eq!(link_at(text, 6).map(|l| l.target).as_deref(), Some("There"));
        assert!(link_at(text, 0).is_none());
        assert!(link_at(text, 14).is_none());
    }

    #[test]
    fn rename_edits_replace_only_matching_links() {
        let mut text = "[[Old]] and [[Other]] and [[ Old ]]".to_string();
        let edits = compute_rename_edits(&text, "Old", "Archive/New");
        assert_eq!(edits.len(), 2);
        assert!(edits[0].offset > edits[1].offset, "edits should be in reverse offset order");
        apply_edits(&mut text, &edits);
        assert_eq!(text, "[[Archive/New]] and [[Other]] and [[Archive/New]]");
    }

    #[test]
    fn resolve_or_create_creates_empty_note_once() {
        let dir = TempDir::new().unwrap();
        let mut index = NoteIndex::open(dir.path()).unwrap();

        let text = "See [[Project Plan]] for details";
        let target = scan("home", text).next().unwrap().target;

        let first_path = resolve_or_create(&mut index, &target).unwrap().path.clone();
        assert!(first_path.is_file());
        assert_eq!(std::fs::read_to_string(&first_path).unwrap(), "");

        let second = resolve_or_create(&mut index, &target).unwrap();
        assert_eq!(second.id, "Project Plan");
        assert_eq!(second.path, first_path);
        assert!(second.content.is_empty());

        let md_files = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("Project Plan"))
            .count();
        assert_eq!(md_files, 1);
    }

    #[test]
    fn resolve_or_create_builds_folders() {
        let dir = TempDir::new().unwrap();
        let mut index = NoteIndex::open(dir.path()).unwrap();

        resolve_or_create(&mut index, "Areas/Health/Sleep").unwrap();
        assert!(dir.path().join("Areas/Health/Sleep.md").is_file());
        assert!(index.exists("Areas/Health/Sleep"));
    }
}
