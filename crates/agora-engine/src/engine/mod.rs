//! The conversation engine.
//!
//! [`Engine`] is the public API. It is cheap to clone; every clone shares the
//! same database, presence tracker and event bus. Each operation takes the
//! caller's [`Session`], runs the access guard, performs one unit of storage
//! work under the database lock, publishes the resulting event and only then
//! starts best-effort side effects (push, link previews) in the background.

mod conversations;
mod feed;
mod groups;
mod messaging;

pub use conversations::ConversationSummary;
pub use feed::ConversationFeed;
pub use groups::CreateGroup;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use agora_shared::types::{ConversationId, PresenceState, UserId};
use agora_store::Database;

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{ConversationEvent, EventBus, EventFilter, Subscription};
use crate::guard::{self, AccessState, Resolved};
use crate::presence::{Presence, PresenceTracker};
use crate::session::Session;

/// What an operation needs from the access guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Need {
    View,
    Send,
}

struct Inner {
    db: Mutex<Database>,
    presence: RwLock<PresenceTracker>,
    events: EventBus,
    collaborators: Collaborators,
    config: EngineConfig,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(db: Database, config: EngineConfig, collaborators: Collaborators) -> Self {
        info!(?config, "Starting conversation engine");
        Self {
            inner: Arc::new(Inner {
                db: Mutex::new(db),
                presence: RwLock::new(PresenceTracker::new(config.typing_ttl)),
                events: EventBus::new(config.event_capacity),
                collaborators,
                config,
            }),
        }
    }

    /// Engine over a fresh in-memory database with no-op collaborators.
    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        Ok(Self::new(
            Database::open_in_memory()?,
            config,
            Collaborators::default(),
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// Lock the database, load the conversation and check the caller's
    /// access. The guard is returned so the caller can continue under the
    /// same lock.
    pub(crate) async fn authorize(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        need: Need,
    ) -> Result<(MutexGuard<'_, Database>, Resolved)> {
        let db = self.inner.db.lock().await;
        let resolved = guard::resolve(&db, conversation_id)?;
        let state = guard::access_state(&db, session, &resolved)?;
        match need {
            Need::View => state.check_view()?,
            Need::Send => state.check_send()?,
        }
        Ok((db, resolved))
    }

    pub(crate) async fn db(&self) -> MutexGuard<'_, Database> {
        self.inner.db.lock().await
    }

    pub async fn access_state(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<AccessState> {
        let db = self.db().await;
        let resolved = guard::resolve(&db, conversation_id)?;
        Ok(guard::access_state(&db, session, &resolved)?)
    }

    pub async fn can_view(&self, session: &Session, conversation_id: ConversationId) -> Result<bool> {
        Ok(self.access_state(session, conversation_id).await?.can_view())
    }

    /// `Ok(())` if the caller may post, otherwise the access error.
    pub async fn can_send(&self, session: &Session, conversation_id: ConversationId) -> Result<()> {
        Ok(self.access_state(session, conversation_id).await?.check_send()?)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe to one conversation's deltas. Requires read access, which
    /// the feed keeps checking for as long as it is open.
    pub async fn subscribe(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<ConversationFeed> {
        let (_db, _) = self.authorize(session, conversation_id, Need::View).await?;
        debug!(conversation = %conversation_id, user = %session.user_id(), "Subscribed");
        let events = self
            .inner
            .events
            .subscribe(EventFilter::Conversation(conversation_id));
        Ok(ConversationFeed::new(
            self.clone(),
            session.clone(),
            conversation_id,
            events,
        ))
    }

    /// Subscribe to presence changes of every user.
    pub fn subscribe_presence(&self) -> Subscription {
        self.inner.events.subscribe(EventFilter::Presence)
    }

    pub(crate) fn publish(&self, event: ConversationEvent) {
        self.inner.events.publish(event);
    }

    // ------------------------------------------------------------------
    // Presence & typing
    // ------------------------------------------------------------------

    /// Record an externally observed presence change.
    pub async fn set_presence(&self, user: &UserId, state: PresenceState, at: DateTime<Utc>) -> bool {
        let changed = self.inner.presence.write().await.set_presence(user, state, at);
        if changed {
            self.publish(ConversationEvent::PresenceChanged {
                user_id: user.clone(),
                state,
                last_changed: at,
            });
        }
        changed
    }

    pub async fn presence(&self, user: &UserId) -> Option<Presence> {
        self.inner.presence.read().await.presence(user)
    }

    /// Set or clear the caller's typing flag. Setting it needs send access;
    /// clearing only needs read access.
    pub async fn set_typing(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<()> {
        let need = if is_typing { Need::Send } else { Need::View };
        drop(self.authorize(session, conversation_id, need).await?);

        let changed = self.inner.presence.write().await.set_typing(
            conversation_id,
            session.user_id(),
            is_typing,
            Instant::now(),
        );
        if changed {
            self.publish(ConversationEvent::TypingChanged {
                conversation_id,
                user_id: session.user_id().clone(),
                is_typing,
            });
        }
        Ok(())
    }

    /// Other users currently typing in a conversation.
    pub async fn typing_users(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>> {
        drop(self.authorize(session, conversation_id, Need::View).await?);
        let mut users = self
            .inner
            .presence
            .read()
            .await
            .typing_users(conversation_id, Instant::now());
        users.retain(|u| u != session.user_id());
        Ok(users)
    }

    /// Drop expired typing flags. Returns how many were removed.
    pub async fn prune_typing(&self) -> usize {
        self.inner.presence.write().await.prune(Instant::now())
    }

    /// Register the device token push notifications go to.
    pub async fn enable_notifications(&self, session: &Session, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(crate::error::EngineError::Validation(
                "push token cannot be empty".to_string(),
            ));
        }
        self.inner
            .collaborators
            .notifier
            .register(session.user_id(), token)
            .await
            .map_err(|e| crate::error::EngineError::Transient(e.to_string()))?;
        info!(user = %session.user_id(), "Enabled push notifications");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use agora_store::MessageDraft;

    use super::testing::{engine, session};
    use super::*;
    use crate::error::{AccessError, EngineError};

    #[tokio::test]
    async fn typing_is_visible_to_the_other_side_only() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = engine
            .start_conversation(&alice, bob.user().participant())
            .await
            .unwrap();

        let mut sub = engine.subscribe(&bob, conv).await.unwrap();
        engine.set_typing(&alice, conv, true).await.unwrap();
        engine.set_typing(&alice, conv, true).await.unwrap();

        assert_eq!(
            engine.typing_users(&bob, conv).await.unwrap(),
            vec![alice.user_id().clone()]
        );
        assert!(engine.typing_users(&alice, conv).await.unwrap().is_empty());

        engine.set_typing(&alice, conv, false).await.unwrap();
        assert!(engine.typing_users(&bob, conv).await.unwrap().is_empty());

        let flips: Vec<bool> = std::iter::from_fn(|| sub.try_next())
            .filter_map(|e| match e {
                ConversationEvent::TypingChanged { is_typing, .. } => Some(is_typing),
                _ => None,
            })
            .collect();
        assert_eq!(flips, vec![true, false]);
    }

    #[tokio::test]
    async fn outsiders_cannot_subscribe_or_type() {
        let engine = engine();
        let alice = session("alice");
        let conv = engine
            .start_conversation(&alice, session("bob").user().participant())
            .await
            .unwrap();
        let mallory = session("mallory");

        assert!(matches!(
            engine.subscribe(&mallory, conv).await,
            Err(EngineError::Access(AccessError::NotMember))
        ));
        assert!(matches!(
            engine.set_typing(&mallory, conv, true).await,
            Err(EngineError::Access(AccessError::NotMember))
        ));
    }

    #[tokio::test]
    async fn presence_changes_are_published() {
        let engine = engine();
        let mut sub = engine.subscribe_presence();
        let alice = UserId::new("alice");

        assert!(engine.set_presence(&alice, PresenceState::Online, Utc::now()).await);
        assert_eq!(
            engine.presence(&alice).await.map(|p| p.state),
            Some(PresenceState::Online)
        );
        assert!(matches!(
            sub.next().await,
            Some(ConversationEvent::PresenceChanged { state: PresenceState::Online, .. })
        ));
    }

    #[tokio::test]
    async fn unsubscribe_leaves_no_receiver_behind() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = engine
            .start_conversation(&alice, bob.user().participant())
            .await
            .unwrap();

        let mut sub = engine.subscribe(&bob, conv).await.unwrap();
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(engine.inner.events.subscriber_count(), 0);

        engine
            .send_message(&alice, conv, MessageDraft::text("still delivered"))
            .await
            .unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn history_survives_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.db");
        let alice = session("alice");
        let bob = session("bob");

        let conv = {
            let engine = Engine::new(
                Database::open_at(&path).unwrap(),
                EngineConfig::default(),
                Collaborators::default(),
            );
            let conv = engine
                .start_conversation(&alice, bob.user().participant())
                .await
                .unwrap();
            engine
                .send_message(&alice, conv, MessageDraft::text("persisted"))
                .await
                .unwrap();
            conv
        };

        let engine = Engine::new(
            Database::open_at(&path).unwrap(),
            EngineConfig::default(),
            Collaborators::default(),
        );
        let messages = engine.messages(&bob, conv).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(engine.unread_count(&bob, conv).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_push_token_is_rejected() {
        let engine = engine();
        let alice = session("alice");
        assert!(matches!(
            engine.enable_notifications(&alice, "  ").await,
            Err(EngineError::Validation(_))
        ));
        engine.enable_notifications(&alice, "device-1").await.unwrap();
    }
}
