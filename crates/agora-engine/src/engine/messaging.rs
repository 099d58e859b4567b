//! Message operations: send, edit, delete, react, read receipts.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agora_shared::types::{ConversationId, ConversationKind, MessageId, MessageKind, UserId};
use agora_store::{Message, MessageDraft};

use super::{Engine, Need};
use crate::collaborators::{FileUpload, PushPayload};
use crate::error::{EngineError, Result};
use crate::events::ConversationEvent;
use crate::guard::Resolved;
use crate::session::Session;

/// Characters of message text shown in a push notification.
const PUSH_BODY_CHARS: usize = 120;

impl Engine {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Every message of a conversation in `(timestamp, id)` order.
    pub async fn messages(&self, session: &Session, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let (db, _) = self.authorize(session, conversation_id, Need::View).await?;
        Ok(db.list_messages(conversation_id)?)
    }

    /// Up to `limit` messages older than `before` (or the newest ones).
    pub async fn messages_page(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let (db, _) = self.authorize(session, conversation_id, Need::View).await?;
        Ok(db.list_messages_page(conversation_id, limit, before)?)
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Post to a direct conversation.
    pub async fn send_message(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        draft: MessageDraft,
    ) -> Result<Message> {
        self.post(session, conversation_id, draft, Some(ConversationKind::Direct))
            .await
    }

    /// Post to a group the caller is a member of.
    pub async fn send_group_message(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        draft: MessageDraft,
    ) -> Result<Message> {
        self.post(session, conversation_id, draft, Some(ConversationKind::Group))
            .await
    }

    /// Upload an attachment and post it to a conversation of either kind.
    pub async fn send_file_message(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        kind: MessageKind,
        upload: FileUpload,
        caption: Option<String>,
        client_key: Option<Uuid>,
    ) -> Result<Message> {
        if !kind.is_attachment() {
            return Err(EngineError::Validation(format!(
                "{} is not an attachment kind",
                kind.as_str()
            )));
        }
        drop(self.authorize(session, conversation_id, Need::Send).await?);

        let name = upload.name.clone();
        let file = self
            .inner
            .collaborators
            .blobs
            .upload(conversation_id, upload)
            .await
            .map_err(|e| {
                warn!(conversation = %conversation_id, file = %name, error = %e, "Upload failed");
                EngineError::Transient(e.to_string())
            })?;

        let mut draft = MessageDraft::attachment(kind, file);
        draft.content = caption.filter(|c| !c.trim().is_empty());
        draft.client_key = client_key;
        self.post(session, conversation_id, draft, None).await
    }

    /// Guard, append (with its projection), publish, then start side effects.
    async fn post(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        draft: MessageDraft,
        expected: Option<ConversationKind>,
    ) -> Result<Message> {
        let (mut db, resolved) = self.authorize(session, conversation_id, Need::Send).await?;
        if let Some(kind) = expected {
            if resolved.kind() != kind {
                return Err(EngineError::NotFound(format!(
                    "{} conversation {conversation_id}",
                    kind.as_str()
                )));
            }
        }

        let appended = db.append_message(
            conversation_id,
            session.user_id(),
            &draft,
            self.inner.config.max_content_len,
        )?;
        drop(db);

        let message = appended.message;
        if !appended.is_new {
            debug!(message = %message.id, "Client key matched an earlier send");
            return Ok(message);
        }

        info!(
            conversation = %conversation_id,
            message = %message.id,
            kind = message.kind.as_str(),
            "Message sent"
        );
        self.publish(ConversationEvent::MessageAppended {
            message: message.clone(),
        });
        self.publish(ConversationEvent::ProjectionChanged {
            conversation_id,
            last_message_id: Some(message.id),
        });

        self.spawn_push(session, &resolved, &message);
        self.spawn_link_preview(&message);
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Edit & delete
    // ------------------------------------------------------------------

    /// Replace the text of the caller's own message.
    pub async fn edit_message(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        message_id: MessageId,
        content: &str,
    ) -> Result<Message> {
        let (mut db, _) = self.authorize(session, conversation_id, Need::Send).await?;
        let message = db.edit_message(
            conversation_id,
            message_id,
            session.user_id(),
            content,
            self.inner.config.max_content_len,
        )?;
        drop(db);

        debug!(message = %message_id, "Message edited");
        self.publish(ConversationEvent::MessageEdited {
            message: message.clone(),
        });
        self.spawn_link_preview(&message);
        Ok(message)
    }

    /// Permanently delete the caller's own message. Allowed while blocked.
    pub async fn delete_message(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<()> {
        let (mut db, resolved) = self.authorize(session, conversation_id, Need::View).await?;
        let last = db.delete_message(conversation_id, message_id, session.user_id())?;
        drop(db);

        info!(conversation = %conversation_id, message = %message_id, "Message deleted");
        self.publish(ConversationEvent::MessageDeleted {
            conversation_id,
            message_id,
            last_message_id: last,
        });
        if resolved.last_message_id() != last {
            self.publish(ConversationEvent::ProjectionChanged {
                conversation_id,
                last_message_id: last,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Add the caller's `emoji` to a message. Reacting twice with the same
    /// emoji keeps a single entry; returns `false` in that case.
    pub async fn react_to_message(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<bool> {
        let (db, _) = self.authorize(session, conversation_id, Need::Send).await?;
        let added = db.add_reaction(conversation_id, message_id, session.user_id(), emoji)?;
        drop(db);

        if added {
            self.publish(ConversationEvent::ReactionAdded {
                conversation_id,
                message_id,
                user_id: session.user_id().clone(),
                emoji: emoji.trim().to_string(),
            });
        }
        Ok(added)
    }

    /// Remove one of the caller's reactions. Returns `false` if it was absent.
    pub async fn unreact(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<bool> {
        let (db, _) = self.authorize(session, conversation_id, Need::Send).await?;
        let removed = db.remove_reaction(conversation_id, message_id, session.user_id(), emoji)?;
        drop(db);

        if removed {
            self.publish(ConversationEvent::ReactionRemoved {
                conversation_id,
                message_id,
                user_id: session.user_id().clone(),
                emoji: emoji.trim().to_string(),
            });
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Receipts
    // ------------------------------------------------------------------

    /// Mark messages as read by the caller. Returns the ids that were not
    /// read before; repeating the call returns nothing.
    pub async fn mark_read(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        let (mut db, _) = self.authorize(session, conversation_id, Need::View).await?;
        let newly_read = db.mark_read(conversation_id, message_ids, session.user_id())?;
        drop(db);

        self.publish_read(session, conversation_id, &newly_read);
        Ok(newly_read)
    }

    /// Mark everything unread in one conversation as read.
    pub async fn mark_conversation_read(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageId>> {
        let (mut db, _) = self.authorize(session, conversation_id, Need::View).await?;
        let unread = db.unread_message_ids(conversation_id, session.user_id())?;
        let newly_read = db.mark_read(conversation_id, &unread, session.user_id())?;
        drop(db);

        self.publish_read(session, conversation_id, &newly_read);
        Ok(newly_read)
    }

    /// Mark every visible conversation read, one conversation at a time.
    /// Conversations handled before a failure stay marked.
    pub async fn mark_all_read(&self, session: &Session) -> Result<usize> {
        let mut total = 0;
        for summary in self.conversations(session).await? {
            if summary.unread_count == 0 || !summary.access.can_view() {
                continue;
            }
            total += self.mark_conversation_read(session, summary.id).await?.len();
        }
        Ok(total)
    }

    pub async fn unread_count(&self, session: &Session, conversation_id: ConversationId) -> Result<u64> {
        let (db, _) = self.authorize(session, conversation_id, Need::View).await?;
        Ok(db.unread_count(conversation_id, session.user_id())?)
    }

    /// Unread messages across every conversation the caller can read.
    pub async fn total_unread(&self, session: &Session) -> Result<u64> {
        Ok(self
            .conversations(session)
            .await?
            .iter()
            .filter(|s| s.access.can_view())
            .map(|s| s.unread_count)
            .sum())
    }

    /// Whether every current participant or member has read the message.
    pub async fn seen_by_all(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool> {
        let (db, resolved) = self.authorize(session, conversation_id, Need::View).await?;
        let message = db.get_message(conversation_id, message_id)?;
        Ok(message.is_seen_by_all(resolved.member_count()))
    }

    fn publish_read(&self, session: &Session, conversation_id: ConversationId, ids: &[MessageId]) {
        if ids.is_empty() {
            return;
        }
        self.publish(ConversationEvent::MessagesRead {
            conversation_id,
            user_id: session.user_id().clone(),
            message_ids: ids.to_vec(),
        });
    }

    // ------------------------------------------------------------------
    // Side effects
    // ------------------------------------------------------------------

    /// Notify every other member. Failures are logged and dropped.
    fn spawn_push(&self, session: &Session, resolved: &Resolved, message: &Message) {
        let recipients: Vec<UserId> = resolved
            .members()
            .into_iter()
            .filter(|u| u != session.user_id())
            .collect();
        if recipients.is_empty() {
            return;
        }

        let sender = session.user().label().to_string();
        let title = match resolved {
            Resolved::Group(group) => format!("{sender} in {}", group.name),
            Resolved::Direct(_) => sender,
        };
        let payload = PushPayload {
            conversation_id: message.conversation_id,
            message_id: message.id,
            title,
            body: push_body(message),
        };
        let notifier = Arc::clone(&self.inner.collaborators.notifier);
        let limit = self.inner.config.push_timeout;

        tokio::spawn(async move {
            for user in recipients {
                match timeout(limit, notifier.notify(&user, payload.clone())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(user = %user, error = %e, "Push notification failed"),
                    Err(_) => warn!(user = %user, "Push notification timed out"),
                }
            }
        });
    }

    /// Resolve a preview for the first URL in a text message, once.
    fn spawn_link_preview(&self, message: &Message) {
        let Some(url) = message.first_url().map(str::to_string) else {
            return;
        };
        let engine = self.clone();
        let (conversation_id, message_id) = (message.conversation_id, message.id);
        tokio::spawn(async move {
            engine
                .attach_link_preview(conversation_id, message_id, url)
                .await;
        });
    }

    async fn attach_link_preview(&self, conversation_id: ConversationId, message_id: MessageId, url: String) {
        let resolver = Arc::clone(&self.inner.collaborators.previews);
        let preview = match timeout(self.inner.config.link_preview_timeout, resolver.resolve(&url)).await {
            Ok(Some(preview)) => preview,
            Ok(None) => {
                debug!(url = %url, "No link preview available");
                return;
            }
            Err(_) => {
                warn!(url = %url, "Link preview timed out");
                return;
            }
        };

        let stored = self
            .db()
            .await
            .set_link_preview(conversation_id, message_id, &preview);
        match stored {
            Ok(true) => self.publish(ConversationEvent::LinkPreviewAttached {
                conversation_id,
                message_id,
                preview,
            }),
            Ok(false) => debug!(message = %message_id, "Message changed before its preview arrived"),
            Err(e) => warn!(message = %message_id, error = %e, "Failed to store link preview"),
        }
    }
}

fn push_body(message: &Message) -> String {
    match (message.kind, message.content.as_deref()) {
        (MessageKind::Text, Some(text)) => text.chars().take(PUSH_BODY_CHARS).collect(),
        (kind, Some(caption)) if !caption.trim().is_empty() => {
            format!("[{}] {}", kind.as_str(), caption.chars().take(PUSH_BODY_CHARS).collect::<String>())
        }
        (kind, _) => format!("[{}]", kind.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use agora_store::{FileRef, LinkPreview};

    use super::super::testing::{engine, session};
    use super::*;
    use crate::collaborators::{
        BlobStorage, CollaboratorError, Collaborators, LinkPreviewResolver, PushNotifier,
    };
    use crate::config::EngineConfig;
    use crate::error::AccessError;
    use crate::guard::AccessState;

    async fn direct(engine: &Engine, a: &Session, b: &Session) -> ConversationId {
        engine
            .start_conversation(a, b.user().participant())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn hello_updates_unread_and_receipts() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        let hello = engine
            .send_message(&alice, conv, MessageDraft::text("hello"))
            .await
            .unwrap();
        assert_eq!(engine.unread_count(&bob, conv).await.unwrap(), 1);
        assert_eq!(engine.unread_count(&alice, conv).await.unwrap(), 0);
        assert!(!engine.seen_by_all(&alice, conv, hello.id).await.unwrap());

        assert_eq!(
            engine.mark_read(&bob, conv, &[hello.id]).await.unwrap(),
            vec![hello.id]
        );
        assert!(engine.mark_read(&bob, conv, &[hello.id]).await.unwrap().is_empty());
        assert_eq!(engine.unread_count(&bob, conv).await.unwrap(), 0);
        assert!(engine.seen_by_all(&alice, conv, hello.id).await.unwrap());
    }

    #[tokio::test]
    async fn send_rejects_invalid_drafts() {
        let engine = Engine::open_in_memory(EngineConfig {
            max_content_len: Some(5),
            ..EngineConfig::default()
        })
        .unwrap();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        for draft in [MessageDraft::text("  "), MessageDraft::text("too long")] {
            assert!(matches!(
                engine.send_message(&alice, conv, draft).await,
                Err(EngineError::Validation(_))
            ));
        }
        assert!(engine.messages(&alice, conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_key_makes_send_idempotent() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;
        let mut sub = engine.subscribe(&bob, conv).await.unwrap();

        let draft = MessageDraft::text("once").with_client_key(Uuid::new_v4());
        let first = engine.send_message(&alice, conv, draft.clone()).await.unwrap();
        let retry = engine.send_message(&alice, conv, draft).await.unwrap();

        assert_eq!(first.id, retry.id);
        assert_eq!(engine.messages(&bob, conv).await.unwrap().len(), 1);

        let appended = std::iter::from_fn(|| sub.try_next())
            .filter(|e| matches!(e, ConversationEvent::MessageAppended { .. }))
            .count();
        assert_eq!(appended, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_keep_order_and_keys() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;
        let keys: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

        // Sends 0..16 reuse each key twice, always from the same sender.
        let sends = (0..32usize).map(|i| {
            let engine = engine.clone();
            let sender = if i % 2 == 0 { alice.clone() } else { bob.clone() };
            let mut draft = MessageDraft::text(format!("m{i}"));
            if i < 16 {
                draft = draft.with_client_key(keys[i % keys.len()]);
            }
            tokio::spawn(async move { engine.send_message(&sender, conv, draft).await })
        });
        let sent: Vec<Message> = futures::future::join_all(sends)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let listed = engine.messages(&alice, conv).await.unwrap();
        assert_eq!(listed.len(), 24);
        let order: Vec<_> = listed
            .iter()
            .map(|m| (m.timestamp, m.id.to_string()))
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);

        for key in &keys {
            let rows: Vec<_> = listed
                .iter()
                .filter(|m| m.client_key == Some(*key))
                .collect();
            assert_eq!(rows.len(), 1);
            let returned: Vec<_> = sent
                .iter()
                .filter(|m| m.client_key == Some(*key))
                .map(|m| m.id)
                .collect();
            assert_eq!(returned, vec![rows[0].id; 2]);
        }

        let summary = &engine.conversations(&bob).await.unwrap()[0];
        assert_eq!(
            summary.last_message.as_ref().map(|m| m.id),
            listed.last().map(|m| m.id)
        );
    }

    #[tokio::test]
    async fn wrong_kind_entry_point_is_not_found() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        assert!(matches!(
            engine
                .send_group_message(&alice, conv, MessageDraft::text("hi"))
                .await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_creator_edits_and_deletes() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;
        let msg = engine
            .send_message(&alice, conv, MessageDraft::text("draft"))
            .await
            .unwrap();

        assert!(matches!(
            engine.edit_message(&bob, conv, msg.id, "hijack").await,
            Err(EngineError::Permission(_))
        ));
        assert!(matches!(
            engine.delete_message(&bob, conv, msg.id).await,
            Err(EngineError::Permission(_))
        ));

        let edited = engine
            .edit_message(&alice, conv, msg.id, "final")
            .await
            .unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content.as_deref(), Some("final"));
    }

    #[tokio::test]
    async fn delete_moves_projection_to_previous_message() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        let first = engine
            .send_message(&alice, conv, MessageDraft::text("one"))
            .await
            .unwrap();
        let second = engine
            .send_message(&alice, conv, MessageDraft::text("two"))
            .await
            .unwrap();
        let mut sub = engine.subscribe(&bob, conv).await.unwrap();

        engine.delete_message(&alice, conv, second.id).await.unwrap();
        let list = engine.conversations(&bob).await.unwrap();
        assert_eq!(list[0].last_message.as_ref().map(|m| m.id), Some(first.id));
        assert!(matches!(
            sub.try_next(),
            Some(ConversationEvent::MessageDeleted { last_message_id: Some(id), .. }) if id == first.id
        ));
        assert!(matches!(
            sub.try_next(),
            Some(ConversationEvent::ProjectionChanged { .. })
        ));

        engine.delete_message(&alice, conv, first.id).await.unwrap();
        let list = engine.conversations(&bob).await.unwrap();
        assert!(list[0].last_message.is_none());
    }

    #[tokio::test]
    async fn reacting_twice_keeps_one_entry() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;
        let msg = engine
            .send_message(&alice, conv, MessageDraft::text("nice"))
            .await
            .unwrap();

        assert!(engine.react_to_message(&bob, conv, msg.id, "👍").await.unwrap());
        assert!(!engine.react_to_message(&bob, conv, msg.id, "👍").await.unwrap());
        engine.react_to_message(&alice, conv, msg.id, "🎉").await.unwrap();

        let stored = &engine.messages(&alice, conv).await.unwrap()[0];
        assert_eq!(
            stored.reaction_summary(),
            vec![("👍".to_string(), 1), ("🎉".to_string(), 1)]
        );

        assert!(engine.unreact(&bob, conv, msg.id, "👍").await.unwrap());
        assert!(!engine.unreact(&bob, conv, msg.id, "👍").await.unwrap());
    }

    #[tokio::test]
    async fn mark_all_read_and_total_unread() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let carol = session("carol");
        let with_bob = direct(&engine, &alice, &bob).await;
        let with_carol = direct(&engine, &alice, &carol).await;

        engine
            .send_message(&bob, with_bob, MessageDraft::text("1"))
            .await
            .unwrap();
        engine
            .send_message(&bob, with_bob, MessageDraft::text("2"))
            .await
            .unwrap();
        engine
            .send_message(&carol, with_carol, MessageDraft::text("3"))
            .await
            .unwrap();

        assert_eq!(engine.total_unread(&alice).await.unwrap(), 3);
        assert_eq!(
            engine
                .mark_conversation_read(&alice, with_carol)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(engine.mark_all_read(&alice).await.unwrap(), 2);
        assert_eq!(engine.total_unread(&alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blocked_sender_can_still_delete_own_message() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;
        let msg = engine
            .send_message(&bob, conv, MessageDraft::text("oops"))
            .await
            .unwrap();
        engine.block_user(&alice, bob.user_id()).await.unwrap();

        assert_eq!(
            engine.access_state(&bob, conv).await.unwrap(),
            AccessState::BlockedByReceiver
        );
        assert!(matches!(
            engine.react_to_message(&bob, conv, msg.id, "👍").await,
            Err(EngineError::Access(AccessError::BlockedByReceiver))
        ));
        engine.delete_message(&bob, conv, msg.id).await.unwrap();
    }

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        pushes: StdMutex<Vec<(UserId, PushPayload)>>,
    }

    #[async_trait]
    impl PushNotifier for Recorder {
        async fn register(&self, _user: &UserId, _token: &str) -> std::result::Result<(), CollaboratorError> {
            Ok(())
        }

        async fn notify(&self, user: &UserId, payload: PushPayload) -> std::result::Result<(), CollaboratorError> {
            self.pushes.lock().unwrap().push((user.clone(), payload));
            Err(CollaboratorError::new("push", "device offline"))
        }
    }

    struct FixedPreview;

    #[async_trait]
    impl LinkPreviewResolver for FixedPreview {
        async fn resolve(&self, url: &str) -> Option<LinkPreview> {
            Some(LinkPreview {
                url: url.to_string(),
                title: Some("Example Domain".into()),
                description: None,
                image_url: None,
            })
        }
    }

    struct SlowPreview;

    #[async_trait]
    impl LinkPreviewResolver for SlowPreview {
        async fn resolve(&self, _url: &str) -> Option<LinkPreview> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            None
        }
    }

    struct MemoryBlobs;

    #[async_trait]
    impl BlobStorage for MemoryBlobs {
        async fn upload(
            &self,
            conversation_id: ConversationId,
            file: FileUpload,
        ) -> std::result::Result<FileRef, CollaboratorError> {
            Ok(FileRef {
                url: format!("mem://{conversation_id}/{}", file.name),
                name: file.name,
            })
        }
    }

    fn with(collaborators: Collaborators, config: EngineConfig) -> Engine {
        Engine::new(
            agora_store::Database::open_in_memory().unwrap(),
            config,
            collaborators,
        )
    }

    #[tokio::test]
    async fn push_failures_do_not_fail_the_send() {
        let recorder = Arc::new(Recorder::default());
        let engine = with(
            Collaborators {
                notifier: recorder.clone(),
                ..Collaborators::default()
            },
            EngineConfig::default(),
        );
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        engine
            .send_message(&alice, conv, MessageDraft::text("ping"))
            .await
            .unwrap();

        for _ in 0..50 {
            if !recorder.pushes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let pushes = recorder.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(&pushes[0].0, bob.user_id());
        assert_eq!(pushes[0].1.title, "ALICE");
        assert_eq!(pushes[0].1.body, "ping");
    }

    #[tokio::test]
    async fn link_preview_is_attached_after_send() {
        let engine = with(
            Collaborators {
                previews: Arc::new(FixedPreview),
                ..Collaborators::default()
            },
            EngineConfig::default(),
        );
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;
        let mut sub = engine.subscribe(&bob, conv).await.unwrap();

        let msg = engine
            .send_message(&alice, conv, MessageDraft::text("look https://example.com"))
            .await
            .unwrap();
        assert!(msg.link_preview.is_none());

        let preview = loop {
            match sub.next().await {
                Some(ConversationEvent::LinkPreviewAttached { preview, .. }) => break preview,
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        };
        assert_eq!(preview.url, "https://example.com");
        let stored = &engine.messages(&bob, conv).await.unwrap()[0];
        assert_eq!(stored.link_preview.as_ref(), Some(&preview));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_link_preview_times_out() {
        let engine = with(
            Collaborators {
                previews: Arc::new(SlowPreview),
                ..Collaborators::default()
            },
            EngineConfig {
                link_preview_timeout: Duration::from_millis(50),
                ..EngineConfig::default()
            },
        );
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        let msg = engine
            .send_message(&alice, conv, MessageDraft::text("https://slow.example"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stored = &engine.messages(&bob, conv).await.unwrap()[0];
        assert_eq!(stored.id, msg.id);
        assert!(stored.link_preview.is_none());
    }

    #[tokio::test]
    async fn file_message_uploads_then_appends() {
        let engine = with(
            Collaborators {
                blobs: Arc::new(MemoryBlobs),
                ..Collaborators::default()
            },
            EngineConfig::default(),
        );
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        let upload = FileUpload {
            name: "cat.png".into(),
            content_type: Some("image/png".into()),
            bytes: vec![0x89, b'P', b'N', b'G'],
        };
        let msg = engine
            .send_file_message(&alice, conv, MessageKind::Image, upload, Some("my cat".into()), None)
            .await
            .unwrap();

        assert_eq!(msg.kind, MessageKind::Image);
        assert_eq!(msg.file.as_ref().map(|f| f.name.as_str()), Some("cat.png"));
        assert_eq!(msg.content.as_deref(), Some("my cat"));
    }

    #[tokio::test]
    async fn failed_upload_is_transient() {
        let engine = engine();
        let alice = session("alice");
        let bob = session("bob");
        let conv = direct(&engine, &alice, &bob).await;

        let upload = FileUpload {
            name: "notes.pdf".into(),
            content_type: None,
            bytes: Vec::new(),
        };
        let err = engine
            .send_file_message(&alice, conv, MessageKind::File, upload, None, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(engine.messages(&alice, conv).await.unwrap().is_empty());
    }

    #[test]
    fn push_body_describes_attachments() {
        let body = |kind, content: Option<&str>| {
            push_body(&Message {
                id: MessageId::new(),
                conversation_id: ConversationId::new(),
                creator_id: UserId::new("a"),
                kind,
                content: content.map(str::to_string),
                file: None,
                timestamp: chrono::Utc::now(),
                is_edited: false,
                reactions: Default::default(),
                read_by: Default::default(),
                link_preview: None,
                client_key: None,
            })
        };
        assert_eq!(body(MessageKind::Image, None), "[image]");
        assert_eq!(body(MessageKind::Video, Some("trip")), "[video] trip");
        assert_eq!(body(MessageKind::Text, Some("hey")), "hey");
    }
}
