//! Per-session attempt throttling.
//!
//! A session moves between three derived states:
//!
//! | State | Condition |
//! |-------|-----------|
//! | [`SessionState::Active`] | not blocked |
//! | [`SessionState::Blocked`] | blocked, `blocked_until` in the future |
//! | [`SessionState::ExpiredBlock`] | blocked, `blocked_until` passed (or missing) |
//!
//! Every transition takes `now` explicitly. Persisting the result and
//! serializing concurrent mutation is the store's job (see
//! [`SessionStore::update_session`](crate::store::SessionStore::update_session)).
//!
//! [`ThrottlePolicy`] carries the "unlimited questions" toggle: when
//! disabled, admission always succeeds and attempts are not recorded.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::models::{ChatSession, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Blocked,
    ExpiredBlock,
}

impl ChatSession {
    /// A fresh session with no attempts and no block.
    pub fn new(session_id: &str, user_id: Option<&str>, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
            attempt_count: 0,
            max_attempts,
            is_blocked: false,
            blocked_until: None,
            last_activity: now,
            created_at: now,
            progress_data: Metadata::new(),
            version: 0,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        if !self.is_blocked {
            return SessionState::Active;
        }
        match self.blocked_until {
            Some(until) if until > now => SessionState::Blocked,
            _ => SessionState::ExpiredBlock,
        }
    }

    /// Whether a question may be asked now.
    ///
    /// An expired block is cleared as a side effect (attempts reset).
    pub fn can_ask_question(&mut self, now: DateTime<Utc>) -> bool {
        match self.state(now) {
            SessionState::Blocked => false,
            SessionState::ExpiredBlock => {
                self.reset_attempts();
                true
            }
            SessionState::Active => self.attempt_count < self.max_attempts,
        }
    }

    /// Count one attempt; blocks for `block_duration` once the limit is hit.
    pub fn increment_attempt(&mut self, now: DateTime<Utc>, block_duration: Duration) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_activity = now;
        if self.attempt_count >= self.max_attempts {
            self.is_blocked = true;
            self.blocked_until = Some(now + block_duration);
        }
    }

    pub fn reset_attempts(&mut self) {
        self.attempt_count = 0;
        self.is_blocked = false;
        self.blocked_until = None;
    }

    /// Explicit operator block, independent of the attempt count.
    pub fn block(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.is_blocked = true;
        self.blocked_until = Some(now + duration);
        self.last_activity = now;
    }

    /// Merge `delta` into the progress data.
    ///
    /// Keys are overwritten, except when both old and new values are
    /// arrays: those are unioned, keeping existing order and appending
    /// unseen values.
    pub fn update_progress(&mut self, delta: &Metadata, now: DateTime<Utc>) {
        for (key, value) in delta {
            match (self.progress_data.get_mut(key), value) {
                (Some(Value::Array(existing)), Value::Array(incoming)) => {
                    for v in incoming {
                        if !existing.contains(v) {
                            existing.push(v.clone());
                        }
                    }
                }
                _ => {
                    self.progress_data.insert(key.clone(), value.clone());
                }
            }
        }
        self.last_activity = now;
    }

    /// Attempts left before the session blocks.
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// Throttle configuration consumed by the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottlePolicy {
    /// `false` selects unlimited-questions mode.
    pub enabled: bool,
    pub max_attempts: u32,
    pub block_duration: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 20,
            block_duration: Duration::minutes(60),
        }
    }
}

impl ThrottlePolicy {
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Admission check; may clear an expired block on `session`.
    pub fn admits(&self, session: &mut ChatSession, now: DateTime<Utc>) -> bool {
        !self.enabled || session.can_ask_question(now)
    }

    /// Record one answered question against `session`.
    pub fn record_attempt(&self, session: &mut ChatSession, now: DateTime<Utc>) {
        if self.enabled {
            session.increment_attempt(now, self.block_duration);
        }
    }

    /// Remaining attempts, or `None` in unlimited mode.
    pub fn remaining(&self, session: &ChatSession) -> Option<u32> {
        self.enabled.then(|| session.attempts_remaining())
    }
}
