//! Bounded prompt assembly for grounded answers.
//!
//! The message list sent to the completer is:
//!
//! 1. `system`: tutoring role, retrieved material, editor snapshot.
//! 2. Prior turns from the session, oldest first, each truncated.
//! 3. `user`: the current question.
//!
//! Every variable-length input is truncated to a configured character
//! budget so the request stays bounded regardless of history or code size.

use crate::completion::ChatMessage;
use crate::models::{ConversationTurn, EditorContext, SearchResult, TurnRole};

/// Placeholder used when retrieval found nothing above the threshold.
pub const NO_MATERIAL: &str = "No relevant course material was found for this question.";

const ELLIPSIS: char = '…';

/// Character budgets for the variable parts of a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub chunk_excerpt_chars: usize,
    pub history_turn_chars: usize,
    pub editor_code_chars: usize,
    pub instructions_chars: usize,
    pub feedback_chars: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            chunk_excerpt_chars: 600,
            history_turn_chars: 500,
            editor_code_chars: 4000,
            instructions_chars: 2000,
            feedback_chars: 2000,
        }
    }
}

/// Truncate to at most `max` chars, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push(ELLIPSIS);
    out
}

/// Rough token estimate (~4 chars per token), used when a provider does
/// not report usage.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Summaries of the retrieved chunks, or [`NO_MATERIAL`].
pub fn retrieval_context(results: &[SearchResult], limits: &PromptLimits) -> String {
    if results.is_empty() {
        return NO_MATERIAL.to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            format!(
                "[{}] {} ({}, similarity {:.2})\n{}",
                i + 1,
                r.chunk.source_id,
                r.chunk.document_type,
                r.similarity_score,
                truncate_chars(&r.chunk.chunk_text, limits.chunk_excerpt_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn editor_section(editor: &EditorContext, limits: &PromptLimits) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(instructions) = editor.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!(
            "Exercise instructions:\n{}",
            truncate_chars(instructions.trim(), limits.instructions_chars)
        ));
    }
    if let Some(code) = editor.code.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!(
            "Learner's current code:\n```\n{}\n```",
            truncate_chars(code, limits.editor_code_chars)
        ));
    }
    if let Some(feedback) = editor.feedback.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!(
            "Feedback already shown to the learner:\n{}",
            truncate_chars(feedback.trim(), limits.feedback_chars)
        ));
    }
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// Assemble the full message list for one question.
///
/// `history` must be chronological and must not contain the current
/// question.
pub fn build_messages(
    question: &str,
    results: &[SearchResult],
    history: &[ConversationTurn],
    editor: Option<&EditorContext>,
    limits: &PromptLimits,
) -> Vec<ChatMessage> {
    let mut system = String::from(
        "You are a programming tutor for web development. Answer using the course material \
         below when it is relevant, and guide the learner toward the solution rather than \
         writing it for them.\n\nCourse material:\n",
    );
    system.push_str(&retrieval_context(results, limits));

    if let Some(section) = editor.and_then(|e| editor_section(e, limits)) {
        system.push_str("\n\n");
        system.push_str(&section);
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    for turn in history {
        let content = truncate_chars(&turn.content, limits.history_turn_chars);
        messages.push(match turn.role {
            TurnRole::User => ChatMessage::user(content),
            TurnRole::Assistant => ChatMessage::assistant(content),
        });
    }
    messages.push(ChatMessage::user(question));
    messages
}
