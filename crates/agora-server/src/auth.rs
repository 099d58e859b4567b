//! Caller identity and per-caller session state.
//!
//! The API sits behind a gateway that authenticates users and forwards the
//! result in `x-user-*` headers. Chat unlocks live in the caller's
//! [`Session`], which the registry keeps between requests until it has
//! been idle for longer than the configured window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tokio::sync::Mutex;
use tracing::debug;

use agora_engine::collaborators::AuthProvider;
use agora_engine::{CurrentUser, Session};
use agora_shared::types::UserId;

use crate::api::AppState;
use crate::error::ServerError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_PHOTO_HEADER: &str = "x-user-photo";

// ---------------------------------------------------------------------------
// Header identity
// ---------------------------------------------------------------------------

/// Auth provider answering with the user described by request headers.
#[derive(Debug, Clone)]
pub struct HeaderAuth {
    user: Option<CurrentUser>,
}

impl HeaderAuth {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let user = header(USER_ID_HEADER).map(|id| CurrentUser {
            display_name: header(USER_NAME_HEADER),
            email: header(USER_EMAIL_HEADER),
            photo_url: header(USER_PHOTO_HEADER),
            ..CurrentUser::new(id)
        });
        Self { user }
    }
}

#[async_trait]
impl AuthProvider for HeaderAuth {
    async fn current_user(&self) -> Option<CurrentUser> {
        self.user.clone()
    }
}

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    session: Session,
    last_seen: Instant,
}

/// Sessions of recently active callers, keyed by user id.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<Mutex<HashMap<UserId, Entry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored session for `fresh`'s user, or `fresh` itself on first
    /// contact. The profile of the stored session is refreshed from `fresh`
    /// only when nothing is unlocked in it.
    pub async fn resume(&self, fresh: Session) -> Session {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let entry = entries
            .entry(fresh.user_id().clone())
            .or_insert_with(|| Entry {
                session: fresh.clone(),
                last_seen: now,
            });
        entry.last_seen = now;
        if entry.session.user() != fresh.user() && !entry.session.has_unlocks() {
            entry.session = fresh;
        }
        entry.session.clone()
    }

    /// Persist a session a handler modified.
    pub async fn store(&self, session: Session) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            session.user_id().clone(),
            Entry {
                session,
                last_seen: Instant::now(),
            },
        );
    }

    /// Drop sessions idle for longer than `max_idle`, relocking what they
    /// had unlocked. Returns how many went.
    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| {
            let keep = now.duration_since(entry.last_seen) <= max_idle;
            if !keep {
                entry.session.relock_all();
            }
            keep
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Purged idle sessions");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// The authenticated caller's session.
#[derive(Debug)]
pub struct Caller(pub Session);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = HeaderAuth::from_headers(&parts.headers);
        let session = Session::from_auth(&auth)
            .await
            .map_err(|_| ServerError::Unauthenticated)?;
        Ok(Caller(state.sessions.resume(session).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[tokio::test]
    async fn header_auth_reads_profile() {
        let auth = HeaderAuth::from_headers(&headers(&[
            (USER_ID_HEADER, "alice"),
            (USER_NAME_HEADER, "Alice"),
        ]));
        let user = auth.current_user().await.unwrap();
        assert_eq!(user.id, UserId::new("alice"));
        assert_eq!(user.display_name.as_deref(), Some("Alice"));
        assert!(user.email.is_none());
    }

    #[tokio::test]
    async fn blank_user_header_is_anonymous() {
        let auth = HeaderAuth::from_headers(&headers(&[(USER_ID_HEADER, "   ")]));
        assert!(auth.current_user().await.is_none());
    }

    #[tokio::test]
    async fn registry_refreshes_profile_of_plain_sessions() {
        let registry = SessionRegistry::new();
        let mut alice = CurrentUser::new("alice");
        alice.display_name = Some("Alice".into());
        registry.resume(Session::new(alice.clone())).await;

        alice.display_name = Some("Ally".into());
        let resumed = registry.resume(Session::new(alice)).await;
        assert_eq!(resumed.user().display_name.as_deref(), Some("Ally"));
        assert!(!resumed.has_unlocks());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn purge_drops_idle_sessions() {
        let registry = SessionRegistry::new();
        registry.resume(Session::new(CurrentUser::new("alice"))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.purge_stale(Duration::from_secs(60)).await, 0);
        assert_eq!(registry.purge_stale(Duration::from_millis(1)).await, 1);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn purged_sessions_are_relocked_everywhere() {
        let engine = agora_engine::Engine::open_in_memory(Default::default()).unwrap();
        let mut alice = Session::new(CurrentUser::new("alice"));
        let bob = CurrentUser::new("bob");
        let conv = engine
            .start_conversation(&alice, bob.participant())
            .await
            .unwrap();
        engine.set_chat_lock(&mut alice, conv, "2580").await.unwrap();
        engine.unlock(&mut alice, conv, "2580").await.unwrap();

        let registry = SessionRegistry::new();
        let held = alice.clone();
        registry.store(alice).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(registry.purge_stale(Duration::from_millis(1)).await, 1);
        assert!(!held.is_unlocked(conv));
        assert!(!engine.can_view(&held, conv).await.unwrap());
    }
}
