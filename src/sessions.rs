//! Operator-facing session and history operations, shared by the CLI and
//! the HTTP server.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::info;

use tutor_rag_core::models::{ChatSession, ConversationTurn};
use tutor_rag_core::session::{SessionState, ThrottlePolicy};
use tutor_rag_core::store::{SessionStore, TurnStore};

use crate::chat::validate_session_id;
use crate::config::Config;
use crate::context::AppContext;

/// A session plus its derived state, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: ChatSession,
    pub state: &'static str,
    /// `None` when throttling is disabled.
    pub attempts_remaining: Option<u32>,
    pub turns: usize,
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Active => "active",
        SessionState::Blocked => "blocked",
        SessionState::ExpiredBlock => "expired_block",
    }
}

async fn view(
    session: ChatSession,
    turns: &dyn TurnStore,
    policy: &ThrottlePolicy,
) -> Result<SessionView> {
    let count = turns.turn_count(&session.session_id).await?;
    Ok(SessionView {
        state: state_name(session.state(Utc::now())),
        attempts_remaining: policy.remaining(&session),
        turns: count,
        session,
    })
}

/// Current state of `session_id`, or `None` if it was never used.
pub async fn show_session(
    sessions: &dyn SessionStore,
    turns: &dyn TurnStore,
    policy: &ThrottlePolicy,
    session_id: &str,
) -> Result<Option<SessionView>> {
    validate_session_id(session_id)?;
    match sessions.get_session(session_id).await? {
        Some(session) => Ok(Some(view(session, turns, policy).await?)),
        None => Ok(None),
    }
}

/// Clear attempts and any block.
pub async fn reset_session(
    sessions: &dyn SessionStore,
    turns: &dyn TurnStore,
    policy: &ThrottlePolicy,
    session_id: &str,
) -> Result<SessionView> {
    validate_session_id(session_id)?;
    let session = sessions
        .update_session(session_id, &|s| s.reset_attempts())
        .await?;
    info!(session_id, "session reset");
    view(session, turns, policy).await
}

/// Block `session_id` for `minutes`, creating it if needed.
pub async fn block_session(
    sessions: &dyn SessionStore,
    turns: &dyn TurnStore,
    policy: &ThrottlePolicy,
    session_id: &str,
    minutes: i64,
) -> Result<SessionView> {
    validate_session_id(session_id)?;
    if minutes <= 0 {
        bail!("block duration must be positive");
    }
    let now = Utc::now();
    sessions
        .get_or_create(session_id, None, policy.max_attempts, now)
        .await?;
    let session = sessions
        .update_session(session_id, &|s| s.block(now, Duration::minutes(minutes)))
        .await?;
    info!(session_id, minutes, "session blocked by operator");
    view(session, turns, policy).await
}

/// Most recent `limit` turns, oldest first (`0` = all).
pub async fn session_history(
    turns: &dyn TurnStore,
    session_id: &str,
    limit: usize,
) -> Result<Vec<ConversationTurn>> {
    validate_session_id(session_id)?;
    turns.history(session_id, limit).await
}

fn print_view(view: &SessionView) {
    let s = &view.session;
    println!("session {}", s.session_id);
    println!("  state:     {}", view.state);
    println!("  attempts:  {}/{}", s.attempt_count, s.max_attempts);
    if let Some(remaining) = view.attempts_remaining {
        println!("  remaining: {}", remaining);
    }
    if let Some(until) = s.blocked_until {
        println!("  blocked until: {}", until.to_rfc3339());
    }
    println!("  turns:     {}", view.turns);
    println!("  last activity: {}", s.last_activity.to_rfc3339());
    if !s.progress_data.is_empty() {
        println!(
            "  progress:  {}",
            serde_json::to_string(&s.progress_data).unwrap_or_default()
        );
    }
}

/// `tutor session show <id>`
pub async fn run_session_show(config: &Config, session_id: &str) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let policy = config.session.policy();
    match show_session(ctx.sessions.as_ref(), ctx.turns.as_ref(), &policy, session_id).await? {
        Some(view) => print_view(&view),
        None => println!("No session '{}'.", session_id),
    }
    Ok(())
}

/// `tutor session reset <id>`
pub async fn run_session_reset(config: &Config, session_id: &str) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let policy = config.session.policy();
    let view = reset_session(ctx.sessions.as_ref(), ctx.turns.as_ref(), &policy, session_id).await?;
    print_view(&view);
    Ok(())
}

/// `tutor session block <id> [--minutes N]`
pub async fn run_session_block(config: &Config, session_id: &str, minutes: Option<i64>) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let policy = config.session.policy();
    let minutes = minutes.unwrap_or(config.session.block_minutes);
    let view = block_session(
        ctx.sessions.as_ref(),
        ctx.turns.as_ref(),
        &policy,
        session_id,
        minutes,
    )
    .await?;
    print_view(&view);
    Ok(())
}

/// `tutor history <id> [--limit N]`
pub async fn run_history(config: &Config, session_id: &str, limit: usize) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let turns = session_history(ctx.turns.as_ref(), session_id, limit).await?;
    if turns.is_empty() {
        println!("No turns.");
        return Ok(());
    }
    for turn in &turns {
        println!(
            "[{}] {}: {}",
            turn.sent_at.format("%Y-%m-%d %H:%M:%S"),
            turn.role.as_str(),
            turn.content
        );
        if let Some(refs) = &turn.retrieved_chunks {
            for r in refs {
                println!("    ↳ {} ({:.2})", r.source_id, r.similarity);
            }
        }
    }
    Ok(())
}
