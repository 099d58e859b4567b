//! Per-caller context.
//!
//! A [`Session`] carries the authenticated user and the conversations that
//! user unlocked with their chat-lock PIN. Unlocks live only in memory, so a
//! new session starts with every locked conversation locked.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use agora_shared::types::{ConversationId, UserId};
use agora_store::Participant;

use crate::collaborators::AuthProvider;
use crate::error::{EngineError, Result};

/// The signed-in user as reported by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: UserId,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl CurrentUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            email: None,
            display_name: None,
            photo_url: None,
        }
    }

    /// Display snapshot used when this user joins a direct conversation.
    pub fn participant(&self) -> Participant {
        Participant {
            user_id: self.id.clone(),
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
        }
    }

    /// Name shown in notifications.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or_else(|| self.id.as_str())
    }
}

/// Clones of a session share one unlock set: relocking through any clone
/// also relocks the others, including the ones held by open feeds.
#[derive(Debug, Clone)]
pub struct Session {
    user: CurrentUser,
    unlocked: Arc<watch::Sender<HashSet<ConversationId>>>,
}

impl Session {
    pub fn new(user: CurrentUser) -> Self {
        let (unlocked, _) = watch::channel(HashSet::new());
        Self {
            user,
            unlocked: Arc::new(unlocked),
        }
    }

    /// Build a session for whoever the auth provider reports as signed in.
    pub async fn from_auth(auth: &dyn AuthProvider) -> Result<Self> {
        auth.current_user()
            .await
            .map(Self::new)
            .ok_or(EngineError::Unauthenticated)
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    pub fn is_unlocked(&self, conversation_id: ConversationId) -> bool {
        self.unlocked.borrow().contains(&conversation_id)
    }

    pub fn has_unlocks(&self) -> bool {
        !self.unlocked.borrow().is_empty()
    }

    pub(crate) fn mark_unlocked(&mut self, conversation_id: ConversationId) {
        self.unlocked.send_modify(|set| {
            set.insert(conversation_id);
        });
    }

    /// Forget an unlock. Returns `true` if the conversation was unlocked.
    pub fn relock(&mut self, conversation_id: ConversationId) -> bool {
        self.unlocked.send_if_modified(|set| set.remove(&conversation_id))
    }

    /// Forget every unlock. Returns how many there were.
    pub fn relock_all(&mut self) -> usize {
        let mut count = 0;
        self.unlocked.send_if_modified(|set| {
            count = set.len();
            set.clear();
            count > 0
        });
        count
    }
}
