//! Group lifecycle and membership.
//!
//! The creator is always a member. Only the creator may edit metadata,
//! change the join PIN, remove members or delete the group.

use serde::Deserialize;
use tracing::info;

use agora_shared::pin::{hash_pin, verify_pin, PinScope};
use agora_shared::types::{ConversationId, UserId};
use agora_store::{Group, GroupUpdate, NewGroup};

use super::Engine;
use crate::error::{AccessError, EngineError, Result};
use crate::events::ConversationEvent;
use crate::session::Session;

/// Request to create a group.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroup {
    pub name: String,
    pub description: Option<String>,
    pub photo_url: Option<String>,
    /// Join PIN. Groups without one are open to anyone with the id.
    pub pin: Option<String>,
}

impl Engine {
    pub async fn create_group(&self, session: &Session, request: CreateGroup) -> Result<Group> {
        if let Some(pin) = request.pin.as_deref() {
            validate_join_pin(pin)?;
        }
        let id = ConversationId::new();
        let new = NewGroup {
            id,
            pin_hash: request.pin.as_deref().map(|pin| hash_pin(join_scope(&id), pin)),
            name: request.name,
            description: request.description,
            photo_url: request.photo_url,
            creator_id: session.user_id().clone(),
        };
        Ok(self.db().await.create_group(&new)?)
    }

    /// Group metadata and members. Visible to non-members so they can join.
    pub async fn group(&self, group_id: ConversationId) -> Result<Group> {
        Ok(self.db().await.get_group(group_id)?)
    }

    /// Join a group, checking its PIN if it has one. Joining a group the
    /// caller already belongs to succeeds without checking the PIN.
    pub async fn join_group(
        &self,
        session: &Session,
        group_id: ConversationId,
        pin_attempt: Option<&str>,
    ) -> Result<Group> {
        let db = self.db().await;
        let group = db.get_group(group_id)?;
        if group.is_member(session.user_id()) {
            return Ok(group);
        }
        if let Some(stored) = group.pin_hash.as_deref() {
            let attempt = pin_attempt.unwrap_or_default();
            if !verify_pin(join_scope(&group_id), stored, attempt) {
                info!(group = %group_id, user = %session.user_id(), "Rejected group PIN");
                return Err(EngineError::IncorrectPin);
            }
        }

        db.add_group_member(group_id, session.user_id())?;
        let group = db.get_group(group_id)?;
        drop(db);

        info!(group = %group_id, user = %session.user_id(), "Joined group");
        self.publish(ConversationEvent::MemberJoined {
            conversation_id: group_id,
            user_id: session.user_id().clone(),
        });
        Ok(group)
    }

    /// Leave a group. The creator cannot leave; they delete the group instead.
    pub async fn leave_group(&self, session: &Session, group_id: ConversationId) -> Result<()> {
        let db = self.db().await;
        let group = db.get_group(group_id)?;
        if !group.is_member(session.user_id()) {
            return Err(AccessError::NotMember.into());
        }
        db.remove_group_member(group_id, session.user_id())?;
        drop(db);

        info!(group = %group_id, user = %session.user_id(), "Left group");
        self.publish(ConversationEvent::MemberLeft {
            conversation_id: group_id,
            user_id: session.user_id().clone(),
        });
        Ok(())
    }

    /// Remove another member. Returns `false` if they were not a member.
    pub async fn remove_member(
        &self,
        session: &Session,
        group_id: ConversationId,
        user: &UserId,
    ) -> Result<bool> {
        let db = self.db().await;
        require_creator(&db.get_group(group_id)?, session)?;
        let removed = db.remove_group_member(group_id, user)?;
        drop(db);

        if removed {
            info!(group = %group_id, user = %user, "Removed member");
            self.publish(ConversationEvent::MemberLeft {
                conversation_id: group_id,
                user_id: user.clone(),
            });
        }
        Ok(removed)
    }

    pub async fn update_group(
        &self,
        session: &Session,
        group_id: ConversationId,
        update: GroupUpdate,
    ) -> Result<Group> {
        let db = self.db().await;
        require_creator(&db.get_group(group_id)?, session)?;
        let group = db.update_group(group_id, &update)?;
        drop(db);

        self.publish(ConversationEvent::GroupUpdated {
            group: group.clone(),
        });
        Ok(group)
    }

    /// Set, replace or (with `None`) clear the join PIN.
    pub async fn set_group_pin(
        &self,
        session: &Session,
        group_id: ConversationId,
        pin: Option<&str>,
    ) -> Result<()> {
        if let Some(pin) = pin {
            validate_join_pin(pin)?;
        }
        let db = self.db().await;
        require_creator(&db.get_group(group_id)?, session)?;
        let hash = pin.map(|pin| hash_pin(join_scope(&group_id), pin));
        db.set_group_pin_hash(group_id, hash.as_deref())?;

        info!(group = %group_id, protected = hash.is_some(), "Changed group PIN");
        Ok(())
    }

    /// Delete a group with all of its messages.
    pub async fn delete_group(&self, session: &Session, group_id: ConversationId) -> Result<()> {
        let db = self.db().await;
        require_creator(&db.get_group(group_id)?, session)?;
        db.delete_conversation(group_id)?;
        drop(db);

        info!(group = %group_id, "Deleted group");
        self.publish(ConversationEvent::ConversationDeleted {
            conversation_id: group_id,
        });
        Ok(())
    }
}

fn require_creator(group: &Group, session: &Session) -> Result<()> {
    if &group.creator_id == session.user_id() {
        Ok(())
    } else {
        Err(EngineError::Permission(
            "only the group creator can do this".to_string(),
        ))
    }
}

/// Join PINs are free-form; only a blank one is refused.
fn validate_join_pin(pin: &str) -> Result<()> {
    if pin.trim().is_empty() {
        Err(EngineError::Validation("group PIN must not be empty".to_string()))
    } else {
        Ok(())
    }
}

fn join_scope(group_id: &ConversationId) -> PinScope<'_> {
    PinScope::GroupJoin {
        group: group_id.0.as_bytes(),
    }
}
