//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the API layer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agora_shared::types::{ConversationId, ConversationKind, MessageId, MessageKind, UserId};

use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Reference to an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub url: String,
    pub name: String,
}

/// Cached metadata for the first URL found in a text message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkPreview {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

/// What a sender submits. The store assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file: Option<FileRef>,
    /// Idempotency key chosen by the client. Re-sending a draft with the same
    /// key in the same conversation returns the original message.
    #[serde(default)]
    pub client_key: Option<Uuid>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: Some(content.into()),
            file: None,
            client_key: None,
        }
    }

    pub fn attachment(kind: MessageKind, file: FileRef) -> Self {
        Self {
            kind,
            content: None,
            file: Some(file),
            client_key: None,
        }
    }

    pub fn with_client_key(mut self, key: Uuid) -> Self {
        self.client_key = Some(key);
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.content = Some(caption.into());
        self
    }

    /// Check the content/file invariant and the optional length cap.
    ///
    /// Text drafts need non-blank content and no file; every other kind needs
    /// a file and may carry a caption.
    pub fn validate(&self, max_content_len: Option<usize>) -> Result<()> {
        let has_content = self
            .content
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false);

        match (self.kind.is_attachment(), has_content, self.file.is_some()) {
            (false, false, _) => {
                return Err(StoreError::Validation(
                    "text message needs content".to_string(),
                ))
            }
            (false, true, true) => {
                return Err(StoreError::Validation(
                    "text message cannot carry a file".to_string(),
                ))
            }
            (true, _, false) => {
                return Err(StoreError::Validation(format!(
                    "{} message needs a file reference",
                    self.kind.as_str()
                )))
            }
            _ => {}
        }

        if let (Some(max), Some(content)) = (max_content_len, self.content.as_deref()) {
            let len = content.chars().count();
            if len > max {
                return Err(StoreError::Validation(format!(
                    "content is {len} characters (max {max})"
                )));
            }
        }

        Ok(())
    }
}

/// A stored message with its receipts and reactions attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub creator_id: UserId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file: Option<FileRef>,
    /// Server-assigned creation instant.
    pub timestamp: DateTime<Utc>,
    pub is_edited: bool,
    /// emoji -> users, in order of each emoji's first use.
    pub reactions: IndexMap<String, BTreeSet<UserId>>,
    pub read_by: BTreeMap<UserId, DateTime<Utc>>,
    pub link_preview: Option<LinkPreview>,
    pub client_key: Option<Uuid>,
}

impl Message {
    /// `(emoji, count)` in insertion order of each emoji's first occurrence.
    pub fn reaction_summary(&self) -> Vec<(String, usize)> {
        self.reactions
            .iter()
            .filter(|(_, users)| !users.is_empty())
            .map(|(emoji, users)| (emoji.clone(), users.len()))
            .collect()
    }

    /// Every current member has a read receipt. The threshold follows live
    /// membership, so a member leaving can flip this to `true`.
    pub fn is_seen_by_all(&self, member_count: usize) -> bool {
        self.read_by.len() >= member_count
    }

    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.contains_key(user)
    }

    /// URL to resolve a link preview for, if this is a text message with one.
    pub fn first_url(&self) -> Option<&str> {
        if self.kind != MessageKind::Text {
            return None;
        }
        self.content.as_deref().and_then(first_url)
    }
}

/// First `http://` or `https://` token in `text`.
pub fn first_url(text: &str) -> Option<&str> {
    text.split_whitespace()
        .find(|word| word.starts_with("https://") || word.starts_with("http://"))
        .map(|word| word.trim_end_matches(|c: char| matches!(c, '.' | ',' | ')' | '!' | '?')))
        .filter(|url| url.len() > "https://".len())
}

/// Result of an append. `is_new` is `false` when a client key matched an
/// earlier send and nothing was written.
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    pub is_new: bool,
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Display snapshot of a participant, frozen when the conversation is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl Participant {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: None,
            photo_url: None,
        }
    }
}

/// A two-party conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectConversation {
    pub id: ConversationId,
    pub participants: Vec<Participant>,
    pub pinned_by: BTreeMap<UserId, bool>,
    /// Participants who removed the conversation from their own list.
    pub hidden_for: BTreeSet<UserId>,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl DirectConversation {
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.iter().any(|p| &p.user_id == user)
    }

    /// The participant that is not `user`.
    pub fn peer_of(&self, user: &UserId) -> Option<&Participant> {
        if !self.has_participant(user) {
            return None;
        }
        self.participants.iter().find(|p| &p.user_id != user)
    }

    pub fn is_pinned_by(&self, user: &UserId) -> bool {
        self.pinned_by.get(user).copied().unwrap_or(false)
    }
}

/// A many-party chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: ConversationId,
    pub name: String,
    pub description: Option<String>,
    pub photo_url: Option<String>,
    pub creator_id: UserId,
    pub members: BTreeSet<UserId>,
    #[serde(skip)]
    pub pin_hash: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn has_pin(&self) -> bool {
        self.pin_hash.is_some()
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}

/// Fields for a group about to be created.  The id is chosen by the caller
/// so a join PIN can be hashed against it before the row exists.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub id: ConversationId,
    pub name: String,
    pub description: Option<String>,
    pub photo_url: Option<String>,
    pub creator_id: UserId,
    pub pin_hash: Option<String>,
}

/// Metadata edit. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub photo_url: Option<String>,
}

/// Row of the `conversations` table shared by both kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> FileRef {
        FileRef {
            url: "https://cdn.example/a.png".into(),
            name: "a.png".into(),
        }
    }

    #[test]
    fn text_draft_needs_content() {
        assert!(MessageDraft::text("hi").validate(None).is_ok());
        assert!(matches!(
            MessageDraft::text("   ").validate(None),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn attachment_draft_needs_file() {
        let ok = MessageDraft::attachment(MessageKind::Image, file());
        assert!(ok.validate(None).is_ok());

        let mut missing = ok.clone();
        missing.file = None;
        assert!(missing.validate(None).is_err());

        let mut text_with_file = MessageDraft::text("hi");
        text_with_file.file = Some(file());
        assert!(text_with_file.validate(None).is_err());
    }

    #[test]
    fn length_cap_counts_characters() {
        let draft = MessageDraft::text("héllo");
        assert!(draft.validate(Some(5)).is_ok());
        assert!(draft.validate(Some(4)).is_err());
    }

    #[test]
    fn first_url_strips_trailing_punctuation() {
        assert_eq!(
            first_url("see https://example.com/page, thanks"),
            Some("https://example.com/page")
        );
        assert_eq!(first_url("no links here"), None);
        assert_eq!(first_url("just https://"), None);
    }
}
