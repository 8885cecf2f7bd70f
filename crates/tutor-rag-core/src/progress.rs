//! Learner progress tracking.
//!
//! Topic tags are keyword-matched against a fixed vocabulary; the
//! resulting delta is merged into `ChatSession::progress_data` by
//! [`ChatSession::update_progress`](crate::models::ChatSession::update_progress).

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::models::{EditorContext, Metadata};

/// Progress keys written by the chat pipeline.
pub const KEY_TOPICS: &str = "topics";
pub const KEY_QUESTIONS: &str = "questions";
pub const KEY_QUESTIONS_ASKED: &str = "questions_asked";
pub const KEY_LAST_QUESTION_AT: &str = "last_question_at";

/// `(topic tag, keywords)`; a topic matches when any keyword occurs as a
/// whole token in the lowercased text.
pub const TOPIC_VOCABULARY: &[(&str, &[&str])] = &[
    ("html", &["html", "tag", "tags", "element", "elements", "attribute", "doctype"]),
    ("css", &["css", "style", "styles", "stylesheet", "color", "margin", "padding", "border"]),
    ("javascript", &["javascript", "js", "script", "const", "let", "var"]),
    ("forms", &["form", "forms", "input", "button", "submit", "label", "select", "textarea"]),
    ("flexbox", &["flexbox", "flex", "justify-content", "align-items"]),
    ("grid", &["grid", "grid-template-columns", "grid-area"]),
    ("accessibility", &["accessibility", "a11y", "aria", "alt", "screen-reader"]),
    ("dom", &["dom", "queryselector", "getelementbyid", "innerhtml", "document"]),
    ("events", &["event", "events", "click", "addeventlistener", "onclick", "listener"]),
    ("functions", &["function", "functions", "return", "arrow", "callback", "parameter"]),
    ("loops", &["loop", "loops", "for", "while", "foreach", "iterate"]),
    ("variables", &["variable", "variables", "const", "let", "var", "scope"]),
    ("arrays", &["array", "arrays", "push", "map", "filter", "index"]),
    ("selectors", &["selector", "selectors", "class", "id", "pseudo-class", "hover"]),
    ("responsive", &["responsive", "media", "viewport", "breakpoint", "mobile"]),
];

/// Topic tags found in `text`, in vocabulary order, without duplicates.
pub fn extract_topics(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|t| !t.is_empty())
        .collect();

    TOPIC_VOCABULARY
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| tokens.contains(k)))
        .map(|(topic, _)| topic.to_string())
        .collect()
}

/// Progress delta for one answered question.
///
/// Topics come from the question plus any editor instructions. The
/// bounded question list is applied separately with [`push_bounded`],
/// since union-merging would never drop old entries.
pub fn question_delta(
    question: &str,
    editor: Option<&EditorContext>,
    previously_asked: u64,
    now: DateTime<Utc>,
) -> Metadata {
    let mut text = question.to_string();
    if let Some(instructions) = editor.and_then(|e| e.instructions.as_deref()) {
        text.push('\n');
        text.push_str(instructions);
    }

    let mut delta = Metadata::new();
    delta.insert(KEY_TOPICS.into(), json!(extract_topics(&text)));
    delta.insert(KEY_QUESTIONS_ASKED.into(), json!(previously_asked + 1));
    delta.insert(KEY_LAST_QUESTION_AT.into(), json!(now.to_rfc3339()));
    delta
}

/// Number of questions recorded so far in `progress`.
pub fn questions_asked(progress: &Metadata) -> u64 {
    progress
        .get(KEY_QUESTIONS_ASKED)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Append `value` to the array at `key`, keeping only the last `cap` items.
///
/// A non-array value at `key` is replaced.
pub fn push_bounded(progress: &mut Metadata, key: &str, value: Value, cap: usize) {
    let entry = progress
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    if let Value::Array(items) = entry {
        items.push(value);
        if items.len() > cap {
            let excess = items.len() - cap;
            items.drain(..excess);
        }
    }
}
