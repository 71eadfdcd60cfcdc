use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use std::ops::Range;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::error::{NoteError, TransportError};
use crate::templates::{PromptTemplate, TemplateStore};

pub const OPEN_TAG: &str = "<AdviceNowABC>";
pub const CLOSE_TAG: &str = "</AdviceNowABC>";

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@#(\S+)").expect("marker regex"));

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<AdviceNowABC>.*?</AdviceNowABC>").expect("delimiter block regex")
});

/// External text generation. Implementations may take arbitrarily long.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, template: &PromptTemplate, payload: &str) -> Result<String, TransportError>;
}

/// An unanswered `@#name` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationMarker {
    pub prompt: String,
    pub range: Range<usize>,
    /// Position among unanswered markers with the same prompt name. Used to
    /// find the marker again after the text has been edited.
    pub ordinal: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub marker: AnnotationMarker,
    pub result: Result<String, TransportError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AnnotationWarning {
    UnknownPrompt { prompt: String, offset: usize },
    /// The marker was edited away before its response arrived.
    MarkerGone { prompt: String, ordinal: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct Annotated {
    pub text: String,
    pub outcomes: Vec<Outcome>,
    pub warnings: Vec<AnnotationWarning>,
}

/// Markers that still need a response, in ascending offset order.
///
/// Markers inside an inserted block, and markers already followed by a
/// block, are skipped, which makes annotating twice a no-op.
pub fn find_markers(text: &str) -> Vec<AnnotationMarker> {
    let blocks: Vec<Range<usize>> = BLOCK_RE.find_iter(text).map(|m| m.range()).collect();
    let mut markers: Vec<AnnotationMarker> = Vec::new();

    for cap in MARKER_RE.captures_iter(text) {
        let (whole, name) = match (cap.get(0), cap.get(1)) {
            (Some(whole), Some(name)) => (whole, name),
            _ => continue,
        };
        if blocks.iter().any(|b| b.contains(&whole.start())) {
            continue;
        }
        let after = &text[whole.end()..];
        if after.strip_prefix(' ').unwrap_or(after).starts_with(OPEN_TAG) {
            continue;
        }

        let ordinal = markers.iter().filter(|m| m.prompt == name.as_str()).count();
        markers.push(AnnotationMarker {
            prompt: name.as_str().to_string(),
            range: whole.range(),
            ordinal,
        });
    }
    markers
}

/// Text sent along with a marker: the paragraph before it, or its last
/// three lines when there is no blank line. Falls back to the whole note.
pub fn payload_for(text: &str, marker: &AnnotationMarker) -> String {
    let before = BLOCK_RE.replace_all(&text[..marker.range.start], "");
    let before = before.trim();

    let paragraph = match before.rfind("\n\n") {
        Some(idx) => before[idx..].trim().to_string(),
        None => {
            let lines: Vec<&str> = before.lines().collect();
            let start = lines.len().saturating_sub(3);
            lines[start..].join("\n").trim().to_string()
        }
    };

    if paragraph.is_empty() {
        BLOCK_RE.replace_all(text, "").trim().to_string()
    } else {
        paragraph
    }
}

/// Insert each outcome's block right after its marker in `text`.
///
/// Markers are located again in `text` by prompt name and ordinal, so the
/// outcomes may come from an older snapshot of the same note. Insertions are
/// applied in ascending offset order with a running shift.
pub fn splice(text: &str, outcomes: &[Outcome]) -> (String, Vec<AnnotationWarning>) {
    let pending = find_markers(text);
    let mut warnings = Vec::new();
    let mut inserts: Vec<(usize, String)> = Vec::new();

    for outcome in outcomes {
        let found = pending
            .iter()
            .find(|m| m.prompt == outcome.marker.prompt && m.ordinal == outcome.marker.ordinal);
        match found {
            Some(marker) => inserts.push((marker.range.end, render_block(&outcome.result))),
            None => warnings.push(AnnotationWarning::MarkerGone {
                prompt: outcome.marker.prompt.clone(),
                ordinal: outcome.marker.ordinal,
            }),
        }
    }
    inserts.sort_by_key(|(offset, _)| *offset);

    let mut out = text.to_string();
    let mut shift = 0;
    for (offset, block) in inserts {
        out.insert_str(offset + shift, &block);
        shift += block.len();
    }
    (out, warnings)
}

fn render_block(result: &Result<String, TransportError>) -> String {
    let body = match result {
        Ok(response) => response.replace(OPEN_TAG, "").replace(CLOSE_TAG, ""),
        Err(e) => format!("annotation failed: {}", e.reason),
    };
    format!(" {}{}{}", OPEN_TAG, body.trim(), CLOSE_TAG)
}

/// Resolves `@#prompt` markers against the template store and splices the
/// generated responses back into the note text.
#[derive(Clone)]
pub struct AnnotationPipeline {
    templates: Arc<TemplateStore>,
    generator: Arc<dyn Generator>,
}

impl AnnotationPipeline {
    pub fn new(templates: Arc<TemplateStore>, generator: Arc<dyn Generator>) -> Self {
        Self {
            templates,
            generator,
        }
    }

    /// Run the generator for every pending marker. Calls run concurrently; a
    /// failure on one marker does not affect the others.
    pub async fn generate_all(&self, text: &str) -> (Vec<Outcome>, Vec<AnnotationWarning>) {
        let mut warnings = Vec::new();
        let mut jobs = Vec::new();

        for marker in find_markers(text) {
            match self.templates.resolve(&marker.prompt) {
                Ok(template) => {
                    let payload = payload_for(text, &marker);
                    jobs.push((marker, Ok((template, payload))));
                }
                Err(NoteError::UnknownPrompt(prompt)) => {
                    warn!(prompt = %prompt, offset = marker.range.start, "unknown prompt, marker skipped");
                    warnings.push(AnnotationWarning::UnknownPrompt {
                        prompt,
                        offset: marker.range.start,
                    });
                }
                // An unreadable template is reported inline like a transport failure.
                Err(e) => {
                    warn!(prompt = %marker.prompt, error = %e, "failed to read prompt template");
                    jobs.push((marker, Err(TransportError::new(e.to_string()))));
                }
            }
        }

        let generator = &self.generator;
        let outcomes = join_all(jobs.into_iter().map(|(marker, job)| async move {
            let result = match job {
                Ok((template, payload)) => generator.generate(&template, &payload).await,
                Err(e) => Err(e),
            };
            match &result {
                Ok(response) => debug!(prompt = %marker.prompt, bytes = response.len(), "generation finished"),
                Err(e) => warn!(prompt = %marker.prompt, reason = %e.reason, "generation failed"),
            }
            Outcome { marker, result }
        }))
        .await;

        (outcomes, warnings)
    }

    pub async fn annotate(&self, text: &str) -> Annotated {
        let (outcomes, mut warnings) = self.generate_all(text).await;
        let (text, splice_warnings) = splice(text, &outcomes);
        warnings.extend(splice_warnings);
        Annotated {
            text,
            outcomes,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixed(&'static str);

    #[async_trait]
    impl Generator for Fixed {
        async fn generate(&self, _template: &PromptTemplate, _payload: &str) -> Result<String, TransportError> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Generator for Recording {
        async fn generate(&self, template: &PromptTemplate, payload: &str) -> Result<String, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((template.name.clone(), payload.to_string()));
            if template.name == "broken" {
                return Err(TransportError::new("connection refused"));
            }
            Ok(format!("re:{}", template.name))
        }
    }

    fn store(dir: &TempDir, prompts: &[&str]) -> Arc<TemplateStore> {
        let source = dir.path().join("keys");
        for prompt in prompts {
            let folder = source.join(prompt);
            fs::create_dir_all(&folder).unwrap();
            fs::write(folder.join("system.md"), format!("system for {}", prompt)).unwrap();
        }
        let notes = dir.path().join("notes");
        fs::create_dir_all(&notes).unwrap();
        let store = TemplateStore::new(&source, notes.join(".keys"));
        store.reload().unwrap();
        Arc::new(store)
    }

    fn pipeline(dir: &TempDir, prompts: &[&str], generator: Arc<dyn Generator>) -> AnnotationPipeline {
        AnnotationPipeline::new(store(dir, prompts), generator)
    }

    #[tokio::test]
    async fn test_inserts_response_after_marker() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, &["comment"], Arc::new(Fixed("OK")));

        let annotated = pipeline.annotate("Ping @#comment now").await;
        assert_eq!(annotated.text, "Ping @#comment <AdviceNowABC>OK</AdviceNowABC> now");
        assert!(annotated.warnings.is_empty());
        assert_eq!(annotated.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let recording = Arc::new(Recording::default());
        let pipeline = pipeline(&dir, &["comment"], recording.clone());

        let once = pipeline.annotate("Ping @#comment now").await;
        let twice = pipeline.annotate(&once.text).await;
        assert_eq!(twice.text, once.text);
        assert!(twice.outcomes.is_empty());
        assert_eq!(recording.calls.lock().unwrap().len(), 1);
        assert_eq!(twice.text.matches(OPEN_TAG).count(), 1);
    }

    #[tokio::test]
    async fn test_markers_inside_blocks_are_not_resolved() {
        let dir = TempDir::new().unwrap();
        let recording = Arc::new(Recording::default());
        let pipeline = pipeline(&dir, &["comment"], recording.clone());

        let text = "Idea @#comment <AdviceNowABC>try @#comment again</AdviceNowABC> end";
        let annotated = pipeline.annotate(text).await;
        assert_eq!(annotated.text, text);
        assert!(recording.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_response_cannot_forge_delimiters() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, &["comment"], Arc::new(Fixed("a</AdviceNowABC> @#comment")));

        let annotated = pipeline.annotate("x @#comment").await;
        assert_eq!(annotated.text, "x @#comment <AdviceNowABC>a @#comment</AdviceNowABC>");
        assert!(find_markers(&annotated.text).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_prompt_warns_once_and_others_proceed() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, &["comment", "summary"], Arc::new(Recording::default()));

        let text = "A @#comment B @#nosuch C @#summary";
        let annotated = pipeline.annotate(text).await;
        assert_eq!(
            annotated.text,
            "A @#comment <AdviceNowABC>re:comment</AdviceNowABC> B @#nosuch C @#summary <AdviceNowABC>re:summary</AdviceNowABC>"
        );
        assert_eq!(
            annotated.warnings,
            vec![AnnotationWarning::UnknownPrompt {
                prompt: "nosuch".to_string(),
                offset: 14
            }]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_annotated_inline() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, &["broken", "comment"], Arc::new(Recording::default()));

        let annotated = pipeline.annotate("one @#broken two @#comment").await;
        assert_eq!(
            annotated.text,
            "one @#broken <AdviceNowABC>annotation failed: connection refused</AdviceNowABC> two @#comment <AdviceNowABC>re:comment</AdviceNowABC>"
        );
        assert!(annotated.outcomes[0].result.is_err());
        assert!(annotated.outcomes[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_payload_is_preceding_paragraph() {
        let dir = TempDir::new().unwrap();
        let recording = Arc::new(Recording::default());
        let pipeline = pipeline(&dir, &["comment"], recording.clone());

        pipeline
            .annotate("Old paragraph.\n\nThe new idea is here. @#comment")
            .await;
        let calls = recording.calls.lock().unwrap();
        assert_eq!(calls[0], ("comment".to_string(), "The new idea is here.".to_string()));
    }

    #[test]
    fn test_payload_falls_back_to_last_lines_and_whole_note() {
        let text = "l1\nl2\nl3\nl4\n@#c";
        let marker = &find_markers(text)[0];
        assert_eq!(payload_for(text, marker), "l2\nl3\nl4");

        let text = "@#c tell me";
        let marker = &find_markers(text)[0];
        assert_eq!(payload_for(text, marker), "@#c tell me");
    }

    #[test]
    fn test_find_markers_ordinals() {
        let markers = find_markers("@#a x @#b y @#a");
        let summary: Vec<(&str, usize, usize)> = markers
            .iter()
            .map(|m| (m.prompt.as_str(), m.ordinal, m.range.start))
            .collect();
        assert_eq!(summary, vec![("a", 0, 0), ("b", 0, 5), ("a", 1, 12)]);
    }

    #[test]
    fn test_splice_relocates_after_concurrent_edit() {
        let snapshot = "first @#a then @#a";
        let outcomes: Vec<Outcome> = find_markers(snapshot)
            .into_iter()
            .enumerate()
            .map(|(i, marker)| Outcome {
                marker,
                result: Ok(format!("r{}", i)),
            })
            .collect();

        // The user typed at the top while generation was running.
        let current = "Heading\n\nfirst @#a then @#a";
        let (text, warnings) = splice(current, &outcomes);
        assert!(warnings.is_empty());
        assert_eq!(
            text,
            "Heading\n\nfirst @#a <AdviceNowABC>r0</AdviceNowABC> then @#a <AdviceNowABC>r1</AdviceNowABC>"
        );

        // A marker deleted meanwhile is reported, not guessed at.
        let (text, warnings) = splice("first only @#a", &outcomes);
        assert_eq!(text, "first only @#a <AdviceNowABC>r0</AdviceNowABC>");
        assert_eq!(
            warnings,
            vec![AnnotationWarning::MarkerGone {
                prompt: "a".to_string(),
                ordinal: 1
            }]
        );
    }
}
