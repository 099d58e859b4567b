//! External services the engine depends on but does not implement.
//!
//! Each seam is an object-safe async trait so the embedding application can
//! plug in a real backend. The no-op implementations keep the engine usable
//! in tests and in deployments without push or previews.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use agora_shared::types::{ConversationId, MessageId, UserId};
use agora_store::{FileRef, LinkPreview};

use crate::session::CurrentUser;

/// Failure reported by a collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{service}: {message}")]
pub struct CollaboratorError {
    pub service: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

/// Supplies the signed-in user.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_user(&self) -> Option<CurrentUser>;
}

/// File about to be uploaded for an attachment message.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Stores attachment bytes and returns a durable reference.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn upload(
        &self,
        conversation_id: ConversationId,
        file: FileUpload,
    ) -> Result<FileRef, CollaboratorError>;
}

/// Notification sent to a recipient when a message arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Remember the device token `user` should be notified on.
    async fn register(&self, user: &UserId, token: &str) -> Result<(), CollaboratorError>;

    async fn notify(&self, user: &UserId, payload: PushPayload) -> Result<(), CollaboratorError>;
}

/// Fetches preview metadata for a URL. `None` means nothing usable was found.
#[async_trait]
pub trait LinkPreviewResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Option<LinkPreview>;
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Auth provider with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth(pub Option<CurrentUser>);

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user(&self) -> Option<CurrentUser> {
        self.0.clone()
    }
}

/// Rejects every upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBlobStorage;

#[async_trait]
impl BlobStorage for NoBlobStorage {
    async fn upload(
        &self,
        _conversation_id: ConversationId,
        _file: FileUpload,
    ) -> Result<FileRef, CollaboratorError> {
        Err(CollaboratorError::new("blob storage", "not configured"))
    }
}

/// Accepts registrations and drops notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl PushNotifier for NoopNotifier {
    async fn register(&self, _user: &UserId, _token: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn notify(&self, _user: &UserId, _payload: PushPayload) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoLinkPreviews;

#[async_trait]
impl LinkPreviewResolver for NoLinkPreviews {
    async fn resolve(&self, _url: &str) -> Option<LinkPreview> {
        None
    }
}

/// The set of collaborators an engine instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub blobs: Arc<dyn BlobStorage>,
    pub notifier: Arc<dyn PushNotifier>,
    pub previews: Arc<dyn LinkPreviewResolver>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            blobs: Arc::new(NoBlobStorage),
            notifier: Arc::new(NoopNotifier),
            previews: Arc::new(NoLinkPreviews),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
