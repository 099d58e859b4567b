//! Client-side optimistic timeline.
//!
//! Speculative sends and reactions are shown immediately and then settled
//! against the engine's answer: a confirmed send replaces its placeholder,
//! a failed one is rolled back. Authoritative events are merged in as they
//! arrive, matched to placeholders by client key.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use agora_shared::types::{ConversationId, MessageId, UserId};
use agora_store::{Message, MessageDraft};

use crate::error::EngineError;
use crate::events::ConversationEvent;

/// A send that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub client_key: Uuid,
    pub draft: MessageDraft,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TimelineEntry {
    Confirmed(Message),
    Pending(PendingMessage),
}

/// Local view of one conversation for one user.
#[derive(Debug, Clone)]
pub struct OptimisticTimeline {
    conversation_id: ConversationId,
    user: UserId,
    confirmed: Vec<Message>,
    pending: IndexMap<Uuid, PendingMessage>,
    /// Reactions shown locally but not yet acknowledged.
    pending_reactions: BTreeSet<(MessageId, String)>,
}

impl OptimisticTimeline {
    pub fn new(conversation_id: ConversationId, user: UserId) -> Self {
        Self {
            conversation_id,
            user,
            confirmed: Vec::new(),
            pending: IndexMap::new(),
            pending_reactions: BTreeSet::new(),
        }
    }

    /// Replace the confirmed messages with an authoritative snapshot.
    pub fn load(&mut self, mut messages: Vec<Message>) {
        messages.retain(|m| m.conversation_id == self.conversation_id);
        messages.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
        for message in &messages {
            if let Some(key) = message.client_key {
                self.pending.shift_remove(&key);
            }
        }
        self.confirmed = messages;
    }

    // ------------------------------------------------------------------
    // Sends
    // ------------------------------------------------------------------

    /// Show `draft` immediately. Returns the draft to submit, stamped with a
    /// client key so retries and the echoed event can be matched.
    pub fn speculate_send(&mut self, mut draft: MessageDraft) -> MessageDraft {
        let key = *draft.client_key.get_or_insert_with(Uuid::new_v4);
        self.pending.insert(
            key,
            PendingMessage {
                client_key: key,
                draft: draft.clone(),
                created_at: Utc::now(),
            },
        );
        draft
    }

    /// Settle a speculative send with the engine's answer. On failure the
    /// placeholder is removed and the error handed back.
    pub fn settle_send(
        &mut self,
        client_key: Uuid,
        result: Result<Message, EngineError>,
    ) -> Result<(), EngineError> {
        self.pending.shift_remove(&client_key);
        match result {
            Ok(message) => {
                self.upsert(message);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%client_key, error = %err, "Rolled back speculative send");
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Show a reaction immediately. Returns `false` if it was already shown
    /// or the message is unknown.
    pub fn speculate_reaction(&mut self, message_id: MessageId, emoji: &str) -> bool {
        let user = self.user.clone();
        let Some(message) = self.message_mut(message_id) else {
            return false;
        };
        let added = message
            .reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(user);
        if added {
            self.pending_reactions.insert((message_id, emoji.to_string()));
        }
        added
    }

    /// Settle a speculative reaction. A failure removes it again unless an
    /// authoritative event confirmed it in the meantime.
    pub fn settle_reaction(
        &mut self,
        message_id: MessageId,
        emoji: &str,
        result: Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let was_pending = self
            .pending_reactions
            .remove(&(message_id, emoji.to_string()));
        if let Err(err) = result {
            if was_pending {
                let user = self.user.clone();
                if let Some(message) = self.message_mut(message_id) {
                    remove_reaction(message, &user, emoji);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Authoritative events
    // ------------------------------------------------------------------

    /// Merge an event from the engine. Events for other conversations are
    /// ignored.
    pub fn apply(&mut self, event: &ConversationEvent) {
        if event.conversation_id() != Some(self.conversation_id) {
            return;
        }
        match event {
            ConversationEvent::MessageAppended { message }
            | ConversationEvent::MessageEdited { message } => {
                if let Some(key) = message.client_key {
                    self.pending.shift_remove(&key);
                }
                self.upsert(message.clone());
            }
            ConversationEvent::MessageDeleted { message_id, .. } => {
                self.confirmed.retain(|m| m.id != *message_id);
            }
            ConversationEvent::ReactionAdded {
                message_id,
                user_id,
                emoji,
                ..
            } => {
                if user_id == &self.user {
                    self.pending_reactions.remove(&(*message_id, emoji.clone()));
                }
                if let Some(message) = self.message_mut(*message_id) {
                    message
                        .reactions
                        .entry(emoji.clone())
                        .or_default()
                        .insert(user_id.clone());
                }
            }
            ConversationEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
                ..
            } => {
                if let Some(message) = self.message_mut(*message_id) {
                    remove_reaction(message, user_id, emoji);
                }
            }
            ConversationEvent::MessagesRead {
                user_id,
                message_ids,
                ..
            } => {
                let now = Utc::now();
                for id in message_ids {
                    if let Some(message) = self.message_mut(*id) {
                        message.read_by.entry(user_id.clone()).or_insert(now);
                    }
                }
            }
            ConversationEvent::LinkPreviewAttached {
                message_id,
                preview,
                ..
            } => {
                if let Some(message) = self.message_mut(*message_id) {
                    message.link_preview = Some(preview.clone());
                }
            }
            ConversationEvent::ConversationDeleted { .. } => {
                self.confirmed.clear();
                self.pending.clear();
                self.pending_reactions.clear();
            }
            _ => {}
        }
    }

    /// Confirmed messages in order, followed by pending sends in the order
    /// they were made.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.confirmed
            .iter()
            .cloned()
            .map(TimelineEntry::Confirmed)
            .chain(self.pending.values().cloned().map(TimelineEntry::Pending))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.confirmed.iter_mut().find(|m| m.id == id)
    }

    /// Insert or replace, keeping `(timestamp, id)` order.
    fn upsert(&mut self, message: Message) {
        if let Some(existing) = self.message_mut(message.id) {
            *existing = message;
            return;
        }
        let key = (message.timestamp, message.id);
        let at = self
            .confirmed
            .partition_point(|m| (m.timestamp, m.id) <= key);
        self.confirmed.insert(at, message);
    }
}

fn remove_reaction(message: &mut Message, user: &UserId, emoji: &str) {
    if let Some(users) = message.reactions.get_mut(emoji) {
        users.remove(user);
        if users.is_empty() {
            message.reactions.shift_remove(emoji);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use agora_shared::types::MessageKind;

    use super::*;
    use crate::error::AccessError;

    fn confirmed(conv: ConversationId, draft: &MessageDraft, creator: &UserId) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: conv,
            creator_id: creator.clone(),
            kind: MessageKind::Text,
            content: draft.content.clone(),
            file: None,
            timestamp: Utc::now(),
            is_edited: false,
            reactions: IndexMap::new(),
            read_by: BTreeMap::new(),
            link_preview: None,
            client_key: draft.client_key,
        }
    }

    #[test]
    fn failed_send_is_rolled_back() {
        let conv = ConversationId::new();
        let mut timeline = OptimisticTimeline::new(conv, UserId::new("alice"));

        let draft = timeline.speculate_send(MessageDraft::text("hello"));
        let key = draft.client_key.unwrap();
        assert!(matches!(timeline.entries().as_slice(), [TimelineEntry::Pending(_)]));

        let err = timeline
            .settle_send(key, Err(AccessError::BlockedByReceiver.into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Access(AccessError::BlockedByReceiver)));
        assert!(timeline.entries().is_empty());
    }

    #[test]
    fn echoed_event_replaces_placeholder_once() {
        let conv = ConversationId::new();
        let alice = UserId::new("alice");
        let mut timeline = OptimisticTimeline::new(conv, alice.clone());

        let draft = timeline.speculate_send(MessageDraft::text("hello"));
        let message = confirmed(conv, &draft, &alice);

        timeline.apply(&ConversationEvent::MessageAppended {
            message: message.clone(),
        });
        assert_eq!(timeline.pending_count(), 0);

        timeline
            .settle_send(draft.client_key.unwrap(), Ok(message.clone()))
            .unwrap();
        assert_eq!(timeline.entries(), vec![TimelineEntry::Confirmed(message)]);
    }

    #[test]
    fn failed_reaction_is_rolled_back() {
        let conv = ConversationId::new();
        let alice = UserId::new("alice");
        let mut timeline = OptimisticTimeline::new(conv, alice.clone());
        let message = confirmed(conv, &MessageDraft::text("hi"), &UserId::new("bob"));
        let id = message.id;
        timeline.load(vec![message]);

        assert!(timeline.speculate_reaction(id, "👍"));
        assert!(!timeline.speculate_reaction(id, "👍"));
        assert!(timeline
            .settle_reaction(id, "👍", Err(EngineError::Transient("offline".into())))
            .is_err());

        let TimelineEntry::Confirmed(message) = &timeline.entries()[0] else {
            panic!("expected a confirmed message");
        };
        assert!(message.reactions.is_empty());
    }

    #[test]
    fn other_conversations_are_ignored() {
        let conv = ConversationId::new();
        let alice = UserId::new("alice");
        let mut timeline = OptimisticTimeline::new(conv, alice.clone());

        let stray = confirmed(ConversationId::new(), &MessageDraft::text("x"), &alice);
        timeline.apply(&ConversationEvent::MessageAppended { message: stray });
        assert!(timeline.entries().is_empty());
    }
}
