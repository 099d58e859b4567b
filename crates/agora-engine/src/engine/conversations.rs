//! Conversation directory operations: starting, listing, pinning and
//! hiding direct conversations, blocks and per-viewer chat locks.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use agora_shared::pin::{hash_pin, verify_pin, PinScope};
use agora_shared::types::{ConversationId, ConversationKind, UserId};
use agora_store::{Database, Message, Participant};

use super::{Engine, Need};
use crate::error::{AccessError, EngineError, Result};
use crate::guard::{self, AccessState, Resolved};
use crate::session::Session;

/// One row of a user's conversation list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Peer display name for direct conversations, group name otherwise.
    pub title: Option<String>,
    pub photo_url: Option<String>,
    pub peer_id: Option<UserId>,
    /// `None` while the conversation is locked for this viewer.
    pub last_message: Option<Message>,
    pub pinned: bool,
    pub unread_count: u64,
    pub access: AccessState,
    pub last_activity: DateTime<Utc>,
}

impl Engine {
    /// Open the direct conversation with `peer`, creating it on first use.
    /// A conversation the caller had hidden becomes visible again.
    pub async fn start_conversation(
        &self,
        session: &Session,
        peer: Participant,
    ) -> Result<ConversationId> {
        let me = session.user_id();
        if &peer.user_id == me {
            return Err(EngineError::Validation(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let mut db = self.db().await;
        let (conversation, created) =
            db.find_or_create_direct(&session.user().participant(), &peer)?;
        if !created && conversation.hidden_for.contains(me) {
            db.set_hidden(conversation.id, me, false)?;
            info!(conversation = %conversation.id, user = %me, "Restored hidden conversation");
        }
        Ok(conversation.id)
    }

    /// Every conversation the caller can see, pinned first, then by most
    /// recent activity.
    pub async fn conversations(&self, session: &Session) -> Result<Vec<ConversationSummary>> {
        let db = self.db().await;
        let me = session.user_id();

        let mut summaries = Vec::new();
        for conversation in db.list_direct_conversations(me, false)? {
            let pinned = conversation.is_pinned_by(me);
            let peer = conversation.peer_of(me).cloned();
            let resolved = Resolved::Direct(conversation);
            let mut summary = summarize(&db, session, &resolved)?;
            summary.pinned = pinned;
            if let Some(peer) = peer {
                summary.title = peer.display_name.or_else(|| Some(peer.user_id.to_string()));
                summary.photo_url = peer.photo_url;
                summary.peer_id = Some(peer.user_id);
            }
            summaries.push(summary);
        }
        for group in db.list_groups_for_user(me)? {
            let title = Some(group.name.clone());
            let photo_url = group.photo_url.clone();
            let mut summary = summarize(&db, session, &Resolved::Group(group))?;
            summary.title = title;
            summary.photo_url = photo_url;
            summaries.push(summary);
        }

        summaries.sort_by_key(|s| (Reverse(s.pinned), Reverse(s.last_activity), s.id));
        Ok(summaries)
    }

    /// Flip the caller's pin on a direct conversation. Returns the new value.
    pub async fn toggle_pin(&self, session: &Session, conversation_id: ConversationId) -> Result<bool> {
        let (db, resolved) = self.authorize(session, conversation_id, Need::View).await?;
        let Resolved::Direct(conversation) = resolved else {
            return Err(EngineError::InvalidState(
                "only direct conversations can be pinned".to_string(),
            ));
        };
        let pinned = !conversation.is_pinned_by(session.user_id());
        db.set_pinned(conversation_id, session.user_id(), pinned)?;
        Ok(pinned)
    }

    /// Remove a direct conversation from the caller's list only. The other
    /// participant keeps it, and a new message brings it back.
    pub async fn delete_conversation_for_user(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<()> {
        let db = self.db().await;
        let resolved = guard::resolve(&db, conversation_id)?;
        match resolved {
            Resolved::Direct(conversation) if conversation.has_participant(session.user_id()) => {
                db.set_hidden(conversation_id, session.user_id(), true)?;
                info!(conversation = %conversation_id, user = %session.user_id(), "Hid conversation");
                Ok(())
            }
            Resolved::Direct(_) => Err(AccessError::NotMember.into()),
            Resolved::Group(_) => Err(EngineError::InvalidState(
                "leave or delete the group instead".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Block `user`. Returns `false` if they were already blocked.
    pub async fn block_user(&self, session: &Session, user: &UserId) -> Result<bool> {
        let blocked = self.db().await.block_user(session.user_id(), user)?;
        if blocked {
            info!(blocker = %session.user_id(), blocked = %user, "Blocked user");
        }
        Ok(blocked)
    }

    pub async fn unblock_user(&self, session: &Session, user: &UserId) -> Result<bool> {
        Ok(self.db().await.unblock_user(session.user_id(), user)?)
    }

    pub async fn blocked_users(&self, session: &Session) -> Result<Vec<UserId>> {
        Ok(self.db().await.blocked_users(session.user_id())?)
    }

    // ------------------------------------------------------------------
    // Chat locks
    // ------------------------------------------------------------------

    /// Lock a direct conversation for the caller behind `pin`. Replacing an
    /// existing lock requires unlocking it first in this session.
    pub async fn set_chat_lock(
        &self,
        session: &mut Session,
        conversation_id: ConversationId,
        pin: &str,
    ) -> Result<()> {
        validate_pin(pin)?;
        let (db, resolved) = self.authorize(session, conversation_id, Need::View).await?;
        if resolved.kind() != ConversationKind::Direct {
            return Err(EngineError::InvalidState(
                "only direct conversations can be locked".to_string(),
            ));
        }

        let hash = hash_pin(chat_lock_scope(&conversation_id, session), pin);
        db.set_chat_lock(conversation_id, session.user_id(), &hash)?;
        drop(db);

        session.relock(conversation_id);
        info!(conversation = %conversation_id, user = %session.user_id(), "Set chat lock");
        Ok(())
    }

    /// Remove the caller's lock after checking the current PIN.
    pub async fn remove_chat_lock(
        &self,
        session: &mut Session,
        conversation_id: ConversationId,
        pin: &str,
    ) -> Result<()> {
        let db = self.db().await;
        let Some(stored) = db.chat_lock_hash(conversation_id, session.user_id())? else {
            return Err(EngineError::InvalidState("conversation is not locked".to_string()));
        };
        if !verify_pin(chat_lock_scope(&conversation_id, session), &stored, pin) {
            return Err(EngineError::IncorrectPin);
        }
        db.remove_chat_lock(conversation_id, session.user_id())?;
        drop(db);

        session.relock(conversation_id);
        info!(conversation = %conversation_id, user = %session.user_id(), "Removed chat lock");
        Ok(())
    }

    /// Unlock a locked conversation for the rest of this session. Unlocking
    /// a conversation without a lock succeeds.
    pub async fn unlock(
        &self,
        session: &mut Session,
        conversation_id: ConversationId,
        pin: &str,
    ) -> Result<()> {
        let stored = self
            .db()
            .await
            .chat_lock_hash(conversation_id, session.user_id())?;
        if let Some(stored) = stored {
            if !verify_pin(chat_lock_scope(&conversation_id, session), &stored, pin) {
                return Err(EngineError::IncorrectPin);
            }
            session.mark_unlocked(conversation_id);
        }
        Ok(())
    }

    /// Lock again a conversation unlocked earlier in this session.
    pub fn lock(&self, session: &mut Session, conversation_id: ConversationId) -> bool {
        session.relock(conversation_id)
    }
}

fn summarize(db: &Database, session: &Session, resolved: &Resolved) -> Result<ConversationSummary> {
    let id = resolved.id();
    let access = guard::access_state(db, session, resolved)?;
    let last_message = db.last_message(id)?;
    let created_at = match resolved {
        Resolved::Direct(c) => c.created_at,
        Resolved::Group(g) => g.created_at,
    };
    let last_activity = last_message
        .as_ref()
        .map(|m| m.timestamp)
        .unwrap_or(created_at);

    Ok(ConversationSummary {
        id,
        kind: resolved.kind(),
        title: None,
        photo_url: None,
        peer_id: None,
        last_message: last_message.filter(|_| access.can_view()),
        pinned: false,
        unread_count: db.unread_count(id, session.user_id())?,
        access,
        last_activity,
    })
}

fn chat_lock_scope<'a>(
    conversation_id: &'a ConversationId,
    session: &'a Session,
) -> PinScope<'a> {
    PinScope::ChatLock {
        conversation: conversation_id.0.as_bytes(),
        viewer: session.user_id().as_str(),
    }
}

/// Chat-lock PINs are 4 to 12 digits.
fn validate_pin(pin: &str) -> Result<()> {
    if (4..=12).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(EngineError::Validation("PIN must be 4 to 12 digits".to_string()))
    }
}
