//! Change notifications.
//!
//! Every committed mutation publishes one [`ConversationEvent`] on a
//! broadcast channel. Subscribers filter it down to one conversation (or to
//! presence changes) and consume it as a pull API or a `Stream`.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use agora_shared::types::{ConversationId, MessageId, PresenceState, UserId};
use agora_store::{Group, LinkPreview, Message};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConversationEvent {
    #[serde(rename_all = "camelCase")]
    MessageAppended { message: Message },

    #[serde(rename_all = "camelCase")]
    MessageEdited { message: Message },

    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        last_message_id: Option<MessageId>,
    },

    /// The conversation's newest message changed.
    #[serde(rename_all = "camelCase")]
    ProjectionChanged {
        conversation_id: ConversationId,
        last_message_id: Option<MessageId>,
    },

    #[serde(rename_all = "camelCase")]
    ReactionAdded {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },

    #[serde(rename_all = "camelCase")]
    ReactionRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },

    #[serde(rename_all = "camelCase")]
    MessagesRead {
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },

    #[serde(rename_all = "camelCase")]
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    LinkPreviewAttached {
        conversation_id: ConversationId,
        message_id: MessageId,
        preview: LinkPreview,
    },

    #[serde(rename_all = "camelCase")]
    MemberJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[serde(rename_all = "camelCase")]
    MemberLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[serde(rename_all = "camelCase")]
    GroupUpdated { group: Group },

    #[serde(rename_all = "camelCase")]
    ConversationDeleted { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    PresenceChanged {
        user_id: UserId,
        state: PresenceState,
        last_changed: DateTime<Utc>,
    },
}

impl ConversationEvent {
    /// The conversation this event belongs to. Presence is user-scoped.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::MessageAppended { message } | Self::MessageEdited { message } => {
                Some(message.conversation_id)
            }
            Self::GroupUpdated { group } => Some(group.id),
            Self::MessageDeleted { conversation_id, .. }
            | Self::ProjectionChanged { conversation_id, .. }
            | Self::ReactionAdded { conversation_id, .. }
            | Self::ReactionRemoved { conversation_id, .. }
            | Self::MessagesRead { conversation_id, .. }
            | Self::TypingChanged { conversation_id, .. }
            | Self::LinkPreviewAttached { conversation_id, .. }
            | Self::MemberJoined { conversation_id, .. }
            | Self::MemberLeft { conversation_id, .. }
            | Self::ConversationDeleted { conversation_id } => Some(*conversation_id),
            Self::PresenceChanged { .. } => None,
        }
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Conversation(ConversationId),
    Presence,
}

impl EventFilter {
    fn matches(&self, event: &ConversationEvent) -> bool {
        match self {
            Self::Conversation(id) => event.conversation_id() == Some(*id),
            Self::Presence => matches!(event, ConversationEvent::PresenceChanged { .. }),
        }
    }
}

/// Fan-out point for engine events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConversationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to whoever is listening. Having no subscribers is not an error.
    pub fn publish(&self, event: ConversationEvent) {
        if self.tx.send(event).is_err() {
            debug!("No subscribers for event");
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live feed of events for one filter.
///
/// Dropping the subscription or calling [`unsubscribe`](Self::unsubscribe)
/// detaches it; unsubscribing more than once is a no-op.
#[derive(Debug)]
pub struct Subscription {
    rx: Option<broadcast::Receiver<ConversationEvent>>,
    filter: EventFilter,
}

impl Subscription {
    /// Wait for the next matching event. `None` once unsubscribed or when the
    /// engine is gone.
    pub async fn next(&mut self) -> Option<ConversationEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, filter = ?self.filter, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Return a matching event that is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<ConversationEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, filter = ?self.filter, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            debug!(filter = ?self.filter, "Unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    pub fn filter(&self) -> EventFilter {
        self.filter
    }

    pub fn into_stream(self) -> impl Stream<Item = ConversationEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn typing(conversation_id: ConversationId) -> ConversationEvent {
        ConversationEvent::TypingChanged {
            conversation_id,
            user_id: UserId::new("bob"),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn subscription_filters_by_conversation() {
        let bus = EventBus::new(8);
        let mine = ConversationId::new();
        let other = ConversationId::new();
        let mut sub = bus.subscribe(EventFilter::Conversation(mine));

        bus.publish(typing(other));
        bus.publish(typing(mine));

        assert_eq!(sub.next().await, Some(typing(mine)));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(8);
        let conv = ConversationId::new();
        let mut sub = bus.subscribe(EventFilter::Conversation(conv));
        assert_eq!(bus.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(typing(conv));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn stream_ends_when_bus_is_dropped() {
        let bus = EventBus::new(8);
        let conv = ConversationId::new();
        let stream = bus.subscribe(EventFilter::Conversation(conv)).into_stream();

        bus.publish(typing(conv));
        drop(bus);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events, vec![typing(conv)]);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(typing(ConversationId::new())).unwrap();
        assert_eq!(json["type"], "typingChanged");
        assert_eq!(json["isTyping"], true);
    }
}
