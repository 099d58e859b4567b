//! Access guard.
//!
//! Decides, per viewer, whether a conversation may be read or written.
//! Blocks make a direct conversation read-only for both sides; a chat lock
//! hides it entirely from the viewer who set it until they unlock it in the
//! current session; groups only admit members.

use serde::{Deserialize, Serialize};

use agora_shared::types::{ConversationId, ConversationKind, MessageId, UserId};
use agora_store::{Database, DirectConversation, Group, Result as StoreResult};

use crate::error::AccessError;
use crate::session::Session;

/// What a viewer may do with a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessState {
    Open,
    LockedByPin,
    /// The viewer blocked the other participant.
    BlockedBySender,
    /// The other participant blocked the viewer.
    BlockedByReceiver,
    NotMember,
    /// Not a member of a group that can be joined with its PIN.
    RequiresGroupPin,
}

impl AccessState {
    /// Messages may be listed. Blocked conversations stay readable.
    pub fn can_view(self) -> bool {
        matches!(
            self,
            Self::Open | Self::BlockedBySender | Self::BlockedByReceiver
        )
    }

    pub fn can_send(self) -> bool {
        self == Self::Open
    }

    pub fn check_view(self) -> Result<(), AccessError> {
        if self.can_view() {
            Ok(())
        } else {
            Err(self.denial())
        }
    }

    pub fn check_send(self) -> Result<(), AccessError> {
        if self.can_send() {
            Ok(())
        } else {
            Err(self.denial())
        }
    }

    fn denial(self) -> AccessError {
        match self {
            Self::LockedByPin => AccessError::Locked,
            Self::BlockedBySender => AccessError::BlockedBySender,
            Self::BlockedByReceiver => AccessError::BlockedByReceiver,
            Self::RequiresGroupPin => AccessError::RequiresGroupPin,
            Self::NotMember | Self::Open => AccessError::NotMember,
        }
    }
}

/// A conversation loaded with everything the guard needs.
#[derive(Debug, Clone)]
pub enum Resolved {
    Direct(DirectConversation),
    Group(Group),
}

impl Resolved {
    pub fn id(&self) -> ConversationId {
        match self {
            Self::Direct(c) => c.id,
            Self::Group(g) => g.id,
        }
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            Self::Direct(_) => ConversationKind::Direct,
            Self::Group(_) => ConversationKind::Group,
        }
    }

    pub fn last_message_id(&self) -> Option<MessageId> {
        match self {
            Self::Direct(c) => c.last_message_id,
            Self::Group(g) => g.last_message_id,
        }
    }

    /// Participants or current members.
    pub fn members(&self) -> Vec<UserId> {
        match self {
            Self::Direct(c) => c.participants.iter().map(|p| p.user_id.clone()).collect(),
            Self::Group(g) => g.members.iter().cloned().collect(),
        }
    }

    pub fn member_count(&self) -> usize {
        match self {
            Self::Direct(c) => c.participants.len(),
            Self::Group(g) => g.members.len(),
        }
    }
}

/// Load a conversation of either kind.
pub fn resolve(db: &Database, conversation_id: ConversationId) -> StoreResult<Resolved> {
    match db.get_conversation_record(conversation_id)?.kind {
        ConversationKind::Direct => db.get_direct_conversation(conversation_id).map(Resolved::Direct),
        ConversationKind::Group => db.get_group(conversation_id).map(Resolved::Group),
    }
}

/// Evaluate `session`'s access to an already resolved conversation.
pub fn access_state(db: &Database, session: &Session, resolved: &Resolved) -> StoreResult<AccessState> {
    let viewer = session.user_id();
    match resolved {
        Resolved::Direct(conversation) => {
            let Some(peer) = conversation.peer_of(viewer) else {
                return Ok(AccessState::NotMember);
            };
            let locked = db.chat_lock_hash(conversation.id, viewer)?.is_some()
                && !session.is_unlocked(conversation.id);
            Ok(direct_state(
                locked,
                db.is_blocked(viewer, &peer.user_id)?,
                db.is_blocked(&peer.user_id, viewer)?,
            ))
        }
        Resolved::Group(group) => Ok(group_state(group.is_member(viewer), group.has_pin())),
    }
}

/// A lock hides any block status behind it.
fn direct_state(locked: bool, viewer_blocked_peer: bool, peer_blocked_viewer: bool) -> AccessState {
    if locked {
        AccessState::LockedByPin
    } else if viewer_blocked_peer {
        AccessState::BlockedBySender
    } else if peer_blocked_viewer {
        AccessState::BlockedByReceiver
    } else {
        AccessState::Open
    }
}

fn group_state(is_member: bool, has_pin: bool) -> AccessState {
    match (is_member, has_pin) {
        (true, _) => AccessState::Open,
        (false, true) => AccessState::RequiresGroupPin,
        (false, false) => AccessState::NotMember,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CurrentUser;

    #[test]
    fn blocked_conversations_are_read_only() {
        for state in [AccessState::BlockedBySender, AccessState::BlockedByReceiver] {
            assert!(state.can_view());
            assert!(!state.can_send());
        }
        assert_eq!(
            AccessState::BlockedByReceiver.check_send(),
            Err(AccessError::BlockedByReceiver)
        );
    }

    #[test]
    fn locked_and_foreign_conversations_are_hidden() {
        for state in [
            AccessState::LockedByPin,
            AccessState::NotMember,
            AccessState::RequiresGroupPin,
        ] {
            assert!(!state.can_view());
            assert!(!state.can_send());
        }
        assert_eq!(AccessState::LockedByPin.check_view(), Err(AccessError::Locked));
    }

    #[test]
    fn lock_takes_precedence_over_blocks() {
        assert_eq!(direct_state(true, true, true), AccessState::LockedByPin);
        assert_eq!(direct_state(false, true, true), AccessState::BlockedBySender);
        assert_eq!(direct_state(false, false, true), AccessState::BlockedByReceiver);
        assert_eq!(direct_state(false, false, false), AccessState::Open);
    }

    #[test]
    fn group_outsiders() {
        assert_eq!(group_state(true, true), AccessState::Open);
        assert_eq!(group_state(false, true), AccessState::RequiresGroupPin);
        assert_eq!(group_state(false, false), AccessState::NotMember);
    }

    #[test]
    fn block_is_seen_from_both_sides() {
        let mut db = Database::open_in_memory().unwrap();
        let alice = Session::new(CurrentUser::new("alice"));
        let bob = Session::new(CurrentUser::new("bob"));
        let (conv, _) = db
            .find_or_create_direct(&alice.user().participant(), &bob.user().participant())
            .unwrap();
        db.block_user(alice.user_id(), bob.user_id()).unwrap();

        let resolved = resolve(&db, conv.id).unwrap();
        assert_eq!(
            access_state(&db, &alice, &resolved).unwrap(),
            AccessState::BlockedBySender
        );
        assert_eq!(
            access_state(&db, &bob, &resolved).unwrap(),
            AccessState::BlockedByReceiver
        );

        let outsider = Session::new(CurrentUser::new("mallory"));
        assert_eq!(
            access_state(&db, &outsider, &resolved).unwrap(),
            AccessState::NotMember
        );
    }
}
