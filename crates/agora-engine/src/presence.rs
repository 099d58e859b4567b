//! Presence and typing tracking.
//!
//! Both are ephemeral: nothing here touches the database. Presence is a
//! last-write-wins register per user; typing is a set of `(conversation,
//! user)` flags that expire on their own if the client never clears them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use agora_shared::types::{ConversationId, PresenceState, UserId};

/// Last known presence of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub state: PresenceState,
    pub last_changed: DateTime<Utc>,
}

/// In-memory presence and typing state for every conversation.
#[derive(Debug)]
pub struct PresenceTracker {
    presence: HashMap<UserId, Presence>,
    /// conversation -> user -> instant the flag was last set.
    typing: HashMap<ConversationId, HashMap<UserId, Instant>>,
    ttl: Duration,
}

impl PresenceTracker {
    /// Create an empty tracker whose typing flags expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            presence: HashMap::new(),
            typing: HashMap::new(),
            ttl,
        }
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Record a presence signal observed at `at`.
    ///
    /// Signals older than the stored one are dropped. Returns `true` if the
    /// visible state changed. Going offline clears the user's typing flags.
    pub fn set_presence(&mut self, user: &UserId, state: PresenceState, at: DateTime<Utc>) -> bool {
        if let Some(current) = self.presence.get(user) {
            if at < current.last_changed {
                debug!(user = %user, "Dropping stale presence signal");
                return false;
            }
            if current.state == state {
                return false;
            }
        }

        self.presence.insert(
            user.clone(),
            Presence {
                state,
                last_changed: at,
            },
        );
        if state == PresenceState::Offline {
            for flags in self.typing.values_mut() {
                flags.remove(user);
            }
        }
        debug!(user = %user, state = ?state, "Presence changed");
        true
    }

    /// `None` if no signal was ever recorded for `user`.
    pub fn presence(&self, user: &UserId) -> Option<Presence> {
        self.presence.get(user).copied()
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Set or clear `user`'s typing flag. Returns `true` if the flag flipped.
    /// Re-setting an active flag refreshes its expiry without flipping.
    pub fn set_typing(
        &mut self,
        conversation_id: ConversationId,
        user: &UserId,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        let was_typing = self.is_typing(conversation_id, user, now);
        if is_typing {
            self.typing
                .entry(conversation_id)
                .or_default()
                .insert(user.clone(), now);
        } else if let Some(flags) = self.typing.get_mut(&conversation_id) {
            flags.remove(user);
            if flags.is_empty() {
                self.typing.remove(&conversation_id);
            }
        }
        was_typing != is_typing
    }

    pub fn is_typing(&self, conversation_id: ConversationId, user: &UserId, now: Instant) -> bool {
        self.typing
            .get(&conversation_id)
            .and_then(|flags| flags.get(user))
            .is_some_and(|since| self.is_live(*since, now))
    }

    /// Users currently typing in a conversation, sorted by id.
    pub fn typing_users(&self, conversation_id: ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .get(&conversation_id)
            .map(|flags| {
                flags
                    .iter()
                    .filter(|(_, since)| self.is_live(**since, now))
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Drop expired typing flags. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        self.typing.retain(|_, flags| {
            let before = flags.len();
            flags.retain(|_, since| now.saturating_duration_since(*since) < ttl);
            removed += before - flags.len();
            !flags.is_empty()
        });
        removed
    }

    fn is_live(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) < self.ttl
    }
}

// ---------------------------------------------------------------------------
// Client-side debounce
// ---------------------------------------------------------------------------

/// Turns a stream of input-box changes into typing on/off signals.
///
/// `on_input` reports `Some(true)` when the box goes from empty to non-empty
/// and `Some(false)` when it is cleared. `poll` reports `Some(false)` once
/// the idle window passes without input.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    idle: Duration,
    typing: bool,
    last_input: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            typing: false,
            last_input: None,
        }
    }

    /// Feed the current input length.
    pub fn on_input(&mut self, len: usize, now: Instant) -> Option<bool> {
        if len == 0 {
            self.last_input = None;
            return self.transition(false);
        }
        self.last_input = Some(now);
        self.transition(true)
    }

    /// Check the idle window. Call at or after [`deadline`](Self::deadline).
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        match self.last_input {
            Some(last) if self.typing && now.saturating_duration_since(last) >= self.idle => {
                self.last_input = None;
                self.transition(false)
            }
            _ => None,
        }
    }

    /// When the pending idle timeout fires, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.last_input
            .filter(|_| self.typing)
            .map(|last| last + self.idle)
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    fn transition(&mut self, typing: bool) -> Option<bool> {
        if self.typing == typing {
            return None;
        }
        self.typing = typing;
        Some(typing)
    }
}
