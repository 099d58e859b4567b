//! Access-checked conversation subscriptions.

use futures::{FutureExt, Stream};
use tracing::{debug, warn};

use agora_shared::types::ConversationId;

use super::Engine;
use crate::error::EngineError;
use crate::events::{ConversationEvent, Subscription};
use crate::guard::AccessState;
use crate::session::Session;

/// Live events of one conversation for one viewer.
///
/// The viewer's access is checked again before every event is handed out.
/// Once they can no longer view the conversation (removed from the group,
/// relocked, conversation deleted) the feed ends and must be reopened with
/// [`Engine::subscribe`], which runs the guard again.
#[derive(Debug)]
pub struct ConversationFeed {
    engine: Engine,
    session: Session,
    conversation_id: ConversationId,
    events: Subscription,
    /// Received but not yet admitted. Kept here so a cancelled `next` loses
    /// nothing.
    held: Option<ConversationEvent>,
}

impl ConversationFeed {
    pub(super) fn new(
        engine: Engine,
        session: Session,
        conversation_id: ConversationId,
        events: Subscription,
    ) -> Self {
        Self {
            engine,
            session,
            conversation_id,
            events,
            held: None,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Wait for the next event the viewer may still see. `None` once the
    /// feed has ended.
    pub async fn next(&mut self) -> Option<ConversationEvent> {
        if !self.events.is_active() {
            return None;
        }
        if self.held.is_none() {
            self.held = Some(self.events.next().await?);
        }

        if matches!(self.held, Some(ConversationEvent::ConversationDeleted { .. })) {
            self.close("conversation deleted");
            return self.held.take();
        }

        match self
            .engine
            .access_state(&self.session, self.conversation_id)
            .await
        {
            Ok(access) if access.can_view() => self.held.take(),
            Ok(access) => {
                self.held = None;
                self.close(access_label(access));
                None
            }
            Err(EngineError::NotFound(_)) => {
                self.held = None;
                self.close("conversation deleted");
                Some(ConversationEvent::ConversationDeleted {
                    conversation_id: self.conversation_id,
                })
            }
            Err(err) => {
                warn!(conversation = %self.conversation_id, %err, "Access check failed, closing feed");
                self.held = None;
                self.close("access check failed");
                None
            }
        }
    }

    /// An event that is already buffered, without waiting for new ones.
    pub fn try_next(&mut self) -> Option<ConversationEvent> {
        self.next().now_or_never().flatten()
    }

    pub fn unsubscribe(&mut self) {
        self.held = None;
        self.events.unsubscribe();
    }

    pub fn is_active(&self) -> bool {
        self.events.is_active()
    }

    pub fn into_stream(self) -> impl Stream<Item = ConversationEvent> + Send {
        futures::stream::unfold(self, |mut feed| async move {
            let event = feed.next().await?;
            Some((event, feed))
        })
    }

    fn close(&mut self, reason: &str) {
        debug!(
            conversation = %self.conversation_id,
            user = %self.session.user_id(),
            reason,
            "Closing conversation feed"
        );
        self.events.unsubscribe();
    }
}

fn access_label(access: AccessState) -> &'static str {
    match access {
        AccessState::LockedByPin => "locked",
        AccessState::NotMember => "no longer a member",
        AccessState::RequiresGroupPin => "requires group PIN",
        _ => "access lost",
    }
}
