//! RAG orchestrator: one grounded answer per question.
//!
//! # Steps
//!
//! 1. Validate input, get-or-create the session, check the throttle.
//! 2. Persist the user turn.
//! 3. Load recent history.
//! 4. Embed the question (through the cache) and search.
//! 5. Assemble a bounded prompt.
//! 6. Call the completer under a timeout.
//! 7. Persist the assistant turn.
//! 8. Count the attempt and 9. merge progress (one serialized update).
//!
//! Steps 1–2 fail fast. Steps 3–6 degrade (empty history or retrieval,
//! offline reply). Steps 7–9 are best-effort and only logged on failure.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tutor_rag_core::completion::{Completer, Completion, CompletionOptions, CompletionRequest};
use tutor_rag_core::models::{ChatSession, ConversationTurn, EditorContext, SearchResult};
use tutor_rag_core::progress::{push_bounded, question_delta, questions_asked, KEY_QUESTIONS};
use tutor_rag_core::prompt::{build_messages, PromptLimits};
use tutor_rag_core::search::SearchParams;
use tutor_rag_core::session::{SessionState, ThrottlePolicy};
use tutor_rag_core::store::{SessionStore, TurnStore};
use tutor_rag_core::RagError;

use crate::completion::OfflineCompleter;
use crate::config::Config;
use crate::context::AppContext;
use crate::search::DocumentIndex;

/// Excerpt length stored with each chunk reference on assistant turns.
const REF_EXCERPT_CHARS: usize = 200;

const MAX_SESSION_ID_CHARS: usize = 128;

/// Orchestrator tuning, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub policy: ThrottlePolicy,
    pub search: SearchParams,
    pub limits: PromptLimits,
    pub history_turns: usize,
    pub question_history: usize,
    pub max_question_chars: usize,
    pub completion: CompletionOptions,
    pub completion_timeout: Duration,
    pub fallback_on_error: bool,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.session.policy(),
            search: config.retrieval.search_params(),
            limits: config.chat.prompt_limits(),
            history_turns: config.chat.history_turns,
            question_history: config.chat.question_history,
            max_question_chars: config.chat.max_question_chars,
            completion: CompletionOptions {
                max_tokens: config.completion.max_tokens,
                temperature: config.completion.temperature,
            },
            completion_timeout: Duration::from_secs(config.completion.timeout_secs),
            fallback_on_error: config.completion.fallback_on_error,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    pub session_id: String,
    pub question: String,
    #[serde(default)]
    pub editor: Option<EditorContext>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl AnswerRequest {
    pub fn new(session_id: &str, question: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            question: question.to_string(),
            editor: None,
            user_id: None,
        }
    }

    pub fn with_editor(mut self, editor: EditorContext) -> Self {
        self.editor = Some(editor);
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Answer {
    pub content: String,
    pub tokens_used: u32,
    /// Distinct sources of the retrieved chunks, best match first.
    pub retrieved_source_ids: Vec<String>,
    /// `None` when throttling is disabled.
    pub attempts_remaining: Option<u32>,
    /// `true` when the reply came from the offline completer.
    pub fallback: bool,
}

pub struct RagOrchestrator {
    sessions: Arc<dyn SessionStore>,
    turns: Arc<dyn TurnStore>,
    index: Arc<DocumentIndex>,
    completer: Arc<dyn Completer>,
    settings: ChatSettings,
}

/// Session ids are 1–128 chars of `[A-Za-z0-9_.:-]`.
pub fn validate_session_id(session_id: &str) -> Result<(), RagError> {
    let len = session_id.chars().count();
    if len == 0 || len > MAX_SESSION_ID_CHARS {
        return Err(RagError::invalid(format!(
            "session_id must be 1-{} characters",
            MAX_SESSION_ID_CHARS
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        return Err(RagError::invalid(
            "session_id may only contain letters, digits, '_', '.', ':' and '-'",
        ));
    }
    Ok(())
}

impl RagOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        turns: Arc<dyn TurnStore>,
        index: Arc<DocumentIndex>,
        completer: Arc<dyn Completer>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            sessions,
            turns,
            index,
            completer,
            settings,
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    fn validate(&self, request: &AnswerRequest) -> Result<(), RagError> {
        validate_session_id(&request.session_id)?;
        let question = request.question.trim();
        if question.is_empty() {
            return Err(RagError::invalid("question must not be empty"));
        }
        if question.chars().count() > self.settings.max_question_chars {
            return Err(RagError::invalid(format!(
                "question exceeds {} characters",
                self.settings.max_question_chars
            )));
        }
        Ok(())
    }

    /// Step 1: load the session and decide admission. Clears an expired
    /// block in the store before admitting.
    async fn admit(&self, request: &AnswerRequest) -> Result<ChatSession, RagError> {
        let now = Utc::now();
        let policy = self.settings.policy;
        let session = self
            .sessions
            .get_or_create(
                &request.session_id,
                request.user_id.as_deref(),
                policy.max_attempts,
                now,
            )
            .await
            .map_err(RagError::storage)?;

        let mut probe = session.clone();
        if !policy.admits(&mut probe, now) {
            info!(session_id = %session.session_id, "question rejected: session blocked");
            return Err(RagError::SessionBlocked {
                until: session.blocked_until,
            });
        }

        if policy.enabled && session.state(now) == SessionState::ExpiredBlock {
            info!(session_id = %session.session_id, "block expired; attempts reset");
            return self
                .sessions
                .update_session(&session.session_id, &|s| {
                    if s.state(now) == SessionState::ExpiredBlock {
                        s.reset_attempts();
                    }
                })
                .await
                .map_err(RagError::storage);
        }
        Ok(session)
    }

    /// Answer `request`, grounded in retrieved material and recent history.
    pub async fn answer(&self, request: &AnswerRequest) -> Result<Answer, RagError> {
        self.validate(request)?;
        let question = request.question.trim();
        let session_id = request.session_id.as_str();

        let session = self.admit(request).await?;

        let user_turn = self
            .turns
            .append_turn(&ConversationTurn::user(
                session_id,
                question,
                request.editor.clone(),
                Utc::now(),
            ))
            .await
            .map_err(RagError::storage)?;

        let history: Vec<ConversationTurn> = match self
            .turns
            .recent_turns(session_id, self.settings.history_turns + 1)
            .await
        {
            Ok(turns) => turns
                .into_iter()
                .filter(|t| t.turn_id != user_turn.turn_id)
                .collect(),
            Err(e) => {
                warn!(session_id, error = %e, "history unavailable; answering without it");
                Vec::new()
            }
        };
        let history = tail(history, self.settings.history_turns);

        let cache = self.index.cache();
        let query_vec = cache.embed(question, cache.model()).await;
        let results = self.index.search(&query_vec, &self.settings.search).await;
        debug!(session_id, retrieved = results.len(), history = history.len(), "context assembled");

        let messages = build_messages(
            question,
            &results,
            &history,
            request.editor.as_ref(),
            &self.settings.limits,
        );
        let completion_request = CompletionRequest {
            messages,
            options: self.settings.completion,
        };
        let (completion, fallback) = self.complete(session_id, &completion_request).await?;

        let refs = results.iter().map(|r| r.to_ref(REF_EXCERPT_CHARS)).collect();
        let assistant_turn = ConversationTurn::assistant(
            session_id,
            &completion.content,
            refs,
            completion.tokens_used,
            Utc::now(),
        );
        if let Err(e) = self.turns.append_turn(&assistant_turn).await {
            warn!(session_id, error = %e, "failed to persist assistant turn");
        }

        let attempts_remaining = self.record(&session, question, request.editor.as_ref()).await;

        info!(
            session_id,
            tokens = completion.tokens_used,
            retrieved = results.len(),
            fallback,
            "question answered"
        );
        Ok(Answer {
            content: completion.content,
            tokens_used: completion.tokens_used,
            retrieved_source_ids: source_ids(&results),
            attempts_remaining,
            fallback,
        })
    }

    /// Step 6. Returns the completion and whether it is the offline one.
    async fn complete(
        &self,
        session_id: &str,
        request: &CompletionRequest,
    ) -> Result<(Completion, bool), RagError> {
        let timeout = self.settings.completion_timeout;
        match tokio::time::timeout(timeout, self.completer.complete(request)).await {
            Ok(Ok(completion)) => Ok((completion, self.completer.is_fallback())),
            Err(_) => {
                warn!(session_id, timeout_secs = timeout.as_secs_f64(), "completion timed out");
                Err(RagError::CompletionUnavailable {
                    message: "the tutor took too long to respond; please try again".into(),
                    retryable: true,
                })
            }
            Ok(Err(e)) if self.settings.fallback_on_error => {
                warn!(session_id, provider = self.completer.name(), error = %e, "completion failed; using offline reply");
                let completion = OfflineCompleter
                    .complete(request)
                    .await
                    .map_err(|e| RagError::CompletionUnavailable {
                        message: e.to_string(),
                        retryable: true,
                    })?;
                Ok((completion, true))
            }
            Ok(Err(e)) => {
                warn!(session_id, provider = self.completer.name(), error = %e, "completion failed");
                Err(RagError::CompletionUnavailable {
                    message: "the tutor is temporarily unavailable; please try again".into(),
                    retryable: true,
                })
            }
        }
    }

    /// Steps 8–9 in one serialized session update. Returns attempts left.
    async fn record(
        &self,
        session: &ChatSession,
        question: &str,
        editor: Option<&EditorContext>,
    ) -> Option<u32> {
        let policy = self.settings.policy;
        let cap = self.settings.question_history;
        let now = Utc::now();

        let updated = self
            .sessions
            .update_session(&session.session_id, &|s| {
                policy.record_attempt(s, now);
                let delta = question_delta(question, editor, questions_asked(&s.progress_data), now);
                s.update_progress(&delta, now);
                push_bounded(&mut s.progress_data, KEY_QUESTIONS, json!(question), cap);
            })
            .await;

        match updated {
            Ok(s) => policy.remaining(&s),
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "failed to record attempt and progress");
                policy.remaining(session).map(|r| r.saturating_sub(1))
            }
        }
    }
}

fn tail(mut turns: Vec<ConversationTurn>, n: usize) -> Vec<ConversationTurn> {
    let excess = turns.len().saturating_sub(n);
    turns.drain(..excess);
    turns
}

fn source_ids(results: &[SearchResult]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for r in results {
        if !ids.contains(&r.chunk.source_id) {
            ids.push(r.chunk.source_id.clone());
        }
    }
    ids
}

/// `tutor ask <session> <question>`
pub async fn run_ask(
    config: &Config,
    session_id: &str,
    question: &str,
    editor: Option<EditorContext>,
) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let mut request = AnswerRequest::new(session_id, question);
    request.editor = editor;

    let answer = ctx.orchestrator.answer(&request).await?;
    println!("{}", answer.content);
    println!();
    if !answer.retrieved_source_ids.is_empty() {
        println!("sources: {}", answer.retrieved_source_ids.join(", "));
    }
    println!("tokens: {}", answer.tokens_used);
    if let Some(remaining) = answer.attempts_remaining {
        println!("attempts remaining: {}", remaining);
    }
    if answer.fallback {
        println!("(offline reply)");
    }
    Ok(())
}
