use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy};
use tracing::{debug, info, warn};

use crate::error::{NoteError, Result};
use crate::notes::{Note, NoteIndex};

// Search hit for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub modified: i64,
    pub score: f32,
}

// Tantivy full-text index over note ids, titles and bodies
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    id_field: Field,
    title_field: Field,
    content_field: Field,
    modified_field: Field,
}

impl SearchIndex {
    /// Create or open an on-disk index.
    pub fn open(index_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_path).map_err(|e| NoteError::io(index_path, e))?;
        let schema = Self::schema();
        let index = Index::create_in_dir(index_path, schema.clone())
            .or_else(|_| Index::open_in_dir(index_path))?;
        Self::with_index(index)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_index(Index::create_in_ram(Self::schema()))
    }

    fn schema() -> Schema {
        let mut schema_builder = Schema::builder();
        schema_builder.add_text_field("id", STRING | STORED);
        schema_builder.add_text_field("title", TEXT | STORED);
        schema_builder.add_text_field("content", TEXT | STORED);
        schema_builder.add_i64_field("modified", INDEXED | STORED);
        schema_builder.build()
    }

    fn with_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let field = |name: &str| schema.get_field(name);
        let (id_field, title_field, content_field, modified_field) =
            (field("id")?, field("title")?, field("content")?, field("modified")?);

        // Reloaded by hand after each commit so searches see writes at once.
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer(50_000_000)?; // 50MB buffer

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            id_field,
            title_field,
            content_field,
            modified_field,
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, IndexWriter>> {
        self.writer
            .lock()
            .map_err(|_| NoteError::Search("index writer lock poisoned".to_string()))
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn index_note(&self, id: &str, content: &str, modified: i64) -> Result<()> {
        let mut writer = self.writer()?;

        // Replace any existing document with this ID
        writer.delete_term(Term::from_field_text(self.id_field, id));
        writer.add_document(doc!(
            self.id_field => id,
            self.title_field => extract_title(content),
            self.content_field => content,
            self.modified_field => modified,
        ))?;

        self.commit(&mut writer)
    }

    pub fn index(&self, note: &Note) -> Result<()> {
        self.index_note(&note.id, &note.content, note.modified)
    }

    pub fn delete_note(&self, id: &str) -> Result<()> {
        let mut writer = self.writer()?;
        writer.delete_term(Term::from_field_text(self.id_field, id));
        self.commit(&mut writer)
    }

    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if query_str.trim().is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query_parser =
            QueryParser::for_index(&self.index, vec![self.title_field, self.content_field]);

        // Parse query, fall back to prefix query if parsing fails
        let query = query_parser
            .parse_query(query_str)
            .or_else(|_| query_parser.parse_query(&format!("{}*", query_str)))?;

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            let text = |field: Field| {
                doc.get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };

            results.push(SearchResult {
                id: text(self.id_field),
                title: text(self.title_field),
                preview: generate_preview(&text(self.content_field)),
                modified: doc
                    .get_first(self.modified_field)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                score,
            });
        }

        debug!(query = query_str, hits = results.len(), "search finished");
        Ok(results)
    }

    /// Drop every document and re-index all notes on disk, journal included.
    /// Resident buffers win over file contents.
    pub fn rebuild(&self, notes: &NoteIndex) -> Result<usize> {
        let mut writer = self.writer()?;
        writer.delete_all_documents()?;

        let mut count = 0;
        for id in notes.note_ids(true)? {
            let (content, modified) = match notes.note(&id) {
                Some(note) => (note.content.clone(), note.modified),
                None => {
                    let path = notes.paths().note_path(&id)?;
                    match std::fs::read_to_string(&path) {
                        Ok(content) => (content, file_modified(&path)),
                        Err(e) => {
                            warn!(id = %id, error = %e, "skipping unreadable note");
                            continue;
                        }
                    }
                }
            };

            writer.add_document(doc!(
                self.id_field => id.as_str(),
                self.title_field => extract_title(&content),
                self.content_field => content.as_str(),
                self.modified_field => modified,
            ))?;
            count += 1;
        }

        self.commit(&mut writer)?;
        info!(notes = count, "search index rebuilt");
        Ok(count)
    }
}

pub(crate) fn file_modified(path: &Path) -> i64 {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// True for text made only of whitespace, no-break spaces or a byte-order mark.
fn is_effectively_empty(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_whitespace() || c == '\u{00A0}' || c == '\u{FEFF}')
}

/// First `# ` heading, else the first non-blank line cut to 50 characters.
pub fn extract_title(content: &str) -> String {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(title) = trimmed.strip_prefix("# ") {
            let title = title.trim();
            if !is_effectively_empty(title) {
                return title.to_string();
            }
        }
        if !is_effectively_empty(trimmed) {
            return trimmed.chars().take(50).collect();
        }
    }
    "Untitled".to_string()
}

/// First non-heading line after the title, cut to 100 characters.
pub fn generate_preview(content: &str) -> String {
    for line in content.lines().skip(1) {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            return trimmed.chars().take(100).collect();
        }
    }
    String::new()
}
