//! HTTP API over the conversation engine.
//!
//! Every `/v1` route resolves the caller from the `x-user-*` headers (see
//! [`crate::auth`]) and forwards to one [`Engine`] operation. Engine errors
//! become JSON error bodies through [`ServerError`].

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use agora_engine::collaborators::FileUpload;
use agora_engine::{AccessState, ConversationEvent, ConversationSummary, CreateGroup, Engine};
use agora_shared::constants::DEFAULT_PAGE_SIZE;
use agora_shared::types::{ConversationId, MessageId, MessageKind, PresenceState, UserId};
use agora_store::{Group, GroupUpdate, Message, MessageDraft, Participant};

use crate::auth::{Caller, SessionRegistry};
use crate::config::ServerConfig;
use crate::error::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub sessions: SessionRegistry,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(engine: Engine, config: ServerConfig) -> Self {
        Self {
            engine,
            sessions: SessionRegistry::new(),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let conversations = Router::new()
        .route("/", get(list_conversations).post(start_conversation))
        .route("/:id", delete(delete_conversation))
        .route("/:id/access", get(access_state))
        .route("/:id/pin", post(toggle_pin))
        .route("/:id/messages", get(list_messages).post(send_message))
        .route("/:id/files", post(send_file))
        .route(
            "/:id/messages/:message_id",
            axum::routing::patch(edit_message).delete(delete_message),
        )
        .route("/:id/messages/:message_id/seen", get(seen_by_all))
        .route("/:id/messages/:message_id/reactions", post(react))
        .route("/:id/messages/:message_id/reactions/:emoji", delete(unreact))
        .route("/:id/read", post(mark_read))
        .route("/:id/unread", get(unread_count))
        .route("/:id/typing", get(typing_users).put(set_typing))
        .route("/:id/events", get(conversation_events))
        .route("/:id/lock", put(set_chat_lock).delete(remove_chat_lock))
        .route("/:id/unlock", post(unlock))
        .route("/:id/relock", post(relock));

    let groups = Router::new()
        .route("/", post(create_group))
        .route(
            "/:id",
            get(get_group).patch(update_group).delete(delete_group),
        )
        .route("/:id/messages", post(send_group_message))
        .route("/:id/join", post(join_group))
        .route("/:id/leave", post(leave_group))
        .route("/:id/members/:user_id", delete(remove_member))
        .route("/:id/pin", put(set_group_pin));

    let max_upload = state.config.max_upload_size;

    Router::new()
        .route("/health", get(health_check))
        .nest("/v1/conversations", conversations)
        .nest("/v1/groups", groups)
        .route("/v1/unread", get(total_unread))
        .route("/v1/read-all", post(mark_all_read))
        .route("/v1/blocks", get(blocked_users).post(block_user))
        .route("/v1/blocks/:user_id", delete(unblock_user))
        .route("/v1/presence/:user_id", get(get_presence).put(set_presence))
        .route("/v1/events/presence", get(presence_events))
        .route("/v1/notifications", post(enable_notifications))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResponse {
    id: ConversationId,
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<u32>,
    before: Option<MessageId>,
}

#[derive(Deserialize)]
struct EditRequest {
    content: String,
}

#[derive(Deserialize)]
struct ReactRequest {
    emoji: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    /// Omitted means every unread message of the conversation.
    #[serde(default)]
    message_ids: Option<Vec<MessageId>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingRequest {
    is_typing: bool,
}

#[derive(Deserialize)]
struct PinRequest {
    pin: String,
}

#[derive(Deserialize, Default)]
struct OptionalPinRequest {
    #[serde(default)]
    pin: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockRequest {
    user_id: UserId,
}

#[derive(Deserialize)]
struct PresenceRequest {
    state: PresenceState,
    /// When the change was observed. Defaults to the time of the request.
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct NotificationsRequest {
    token: String,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

async fn list_conversations(
    State(state): State<AppState>,
    Caller(session): Caller,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    Ok(Json(state.engine.conversations(&session).await?))
}

async fn start_conversation(
    State(state): State<AppState>,
    Caller(session): Caller,
    Json(peer): Json<Participant>,
) -> Result<Json<CreatedResponse>, ServerError> {
    let id = state.engine.start_conversation(&session, peer).await?;
    Ok(Json(CreatedResponse { id }))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<StatusCode, ServerError> {
    state.engine.delete_conversation_for_user(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn access_state(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<Json<Value>, ServerError> {
    let access: AccessState = state.engine.access_state(&session, id).await?;
    Ok(Json(json!({
        "access": access,
        "canView": access.can_view(),
        "canSend": access.can_send(),
    })))
}

async fn toggle_pin(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<Json<Value>, ServerError> {
    let pinned = state.engine.toggle_pin(&session, id).await?;
    Ok(Json(json!({ "pinned": pinned })))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn list_messages(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let messages = match query {
        MessagesQuery {
            limit: None,
            before: None,
        } => state.engine.messages(&session, id).await?,
        MessagesQuery { limit, before } => {
            let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
            state
                .engine
                .messages_page(&session, id, limit, before)
                .await?
        }
    };
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    Json(draft): Json<MessageDraft>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let message = state.engine.send_message(&session, id, draft).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Multipart form with a `file` part and optional `kind`, `caption` and
/// `clientKey` text parts.
async fn send_file(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let mut kind = MessageKind::File;
    let mut caption = None;
    let mut client_key = None;
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read file: {e}")))?;
                upload = Some(FileUpload {
                    name: file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            "kind" | "caption" | "clientKey" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read {name}: {e}")))?;
                match name.as_str() {
                    "kind" => {
                        kind = text
                            .parse()
                            .map_err(|_| ServerError::BadRequest(format!("Unknown kind: {text}")))?
                    }
                    "caption" => caption = Some(text),
                    _ => {
                        client_key = Some(Uuid::parse_str(text.trim()).map_err(|_| {
                            ServerError::BadRequest("clientKey must be a UUID".to_string())
                        })?)
                    }
                }
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| {
        ServerError::BadRequest("Missing 'file' field in multipart form".to_string())
    })?;
    let size = upload.bytes.len();
    let message = state
        .engine
        .send_file_message(&session, id, kind, upload, caption, client_key)
        .await?;

    info!(conversation = %id, message = %message.id, size, "Attachment sent via API");
    Ok((StatusCode::CREATED, Json(message)))
}

async fn edit_message(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path((id, message_id)): Path<(ConversationId, MessageId)>,
    Json(req): Json<EditRequest>,
) -> Result<Json<Message>, ServerError> {
    let message = state
        .engine
        .edit_message(&session, id, message_id, &req.content)
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path((id, message_id)): Path<(ConversationId, MessageId)>,
) -> Result<StatusCode, ServerError> {
    state.engine.delete_message(&session, id, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn seen_by_all(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path((id, message_id)): Path<(ConversationId, MessageId)>,
) -> Result<Json<Value>, ServerError> {
    let seen = state.engine.seen_by_all(&session, id, message_id).await?;
    Ok(Json(json!({ "seenByAll": seen })))
}

async fn react(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path((id, message_id)): Path<(ConversationId, MessageId)>,
    Json(req): Json<ReactRequest>,
) -> Result<Json<Value>, ServerError> {
    let added = state
        .engine
        .react_to_message(&session, id, message_id, &req.emoji)
        .await?;
    Ok(Json(json!({ "added": added })))
}

async fn unreact(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path((id, message_id, emoji)): Path<(ConversationId, MessageId, String)>,
) -> Result<Json<Value>, ServerError> {
    let removed = state
        .engine
        .unreact(&session, id, message_id, &emoji)
        .await?;
    Ok(Json(json!({ "removed": removed })))
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

async fn mark_read(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    body: Option<Json<MarkReadRequest>>,
) -> Result<Json<Value>, ServerError> {
    let Json(req) = body.unwrap_or_default();
    let newly_read = match req.message_ids {
        Some(ids) => state.engine.mark_read(&session, id, &ids).await?,
        None => state.engine.mark_conversation_read(&session, id).await?,
    };
    Ok(Json(json!({ "read": newly_read })))
}

async fn unread_count(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<Json<Value>, ServerError> {
    let count = state.engine.unread_count(&session, id).await?;
    Ok(Json(json!({ "unread": count })))
}

async fn total_unread(
    State(state): State<AppState>,
    Caller(session): Caller,
) -> Result<Json<Value>, ServerError> {
    let count = state.engine.total_unread(&session).await?;
    Ok(Json(json!({ "unread": count })))
}

async fn mark_all_read(
    State(state): State<AppState>,
    Caller(session): Caller,
) -> Result<Json<Value>, ServerError> {
    let count = state.engine.mark_all_read(&session).await?;
    Ok(Json(json!({ "marked": count })))
}

// ---------------------------------------------------------------------------
// Typing, presence, events
// ---------------------------------------------------------------------------

async fn typing_users(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<Json<Vec<UserId>>, ServerError> {
    Ok(Json(state.engine.typing_users(&session, id).await?))
}

async fn set_typing(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    Json(req): Json<TypingRequest>,
) -> Result<StatusCode, ServerError> {
    state.engine.set_typing(&session, id, req.is_typing).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_presence(
    State(state): State<AppState>,
    Caller(_): Caller,
    Path(user_id): Path<UserId>,
) -> Json<Value> {
    let presence = state.engine.presence(&user_id).await;
    Json(json!({ "userId": user_id, "presence": presence }))
}

/// Presence is reported by the connection layer on behalf of a user, so the
/// caller may set it for any id.
async fn set_presence(
    State(state): State<AppState>,
    Caller(_): Caller,
    Path(user_id): Path<UserId>,
    Json(req): Json<PresenceRequest>,
) -> Json<Value> {
    let at = req.at.unwrap_or_else(Utc::now);
    let changed = state.engine.set_presence(&user_id, req.state, at).await;
    Json(json!({ "changed": changed }))
}

async fn conversation_events(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ServerError> {
    let feed = state.engine.subscribe(&session, id).await?;
    info!(conversation = %id, user = %session.user_id(), "Opened event stream");
    Ok(event_stream(feed.into_stream()))
}

async fn presence_events(
    State(state): State<AppState>,
    Caller(_): Caller,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    event_stream(state.engine.subscribe_presence().into_stream())
}

fn event_stream(
    events: impl Stream<Item = ConversationEvent> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = events.map(|event| Event::default().json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Chat locks
// ---------------------------------------------------------------------------

async fn set_chat_lock(
    State(state): State<AppState>,
    Caller(mut session): Caller,
    Path(id): Path<ConversationId>,
    Json(req): Json<PinRequest>,
) -> Result<StatusCode, ServerError> {
    state.engine.set_chat_lock(&mut session, id, &req.pin).await?;
    state.sessions.store(session).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_chat_lock(
    State(state): State<AppState>,
    Caller(mut session): Caller,
    Path(id): Path<ConversationId>,
    Json(req): Json<PinRequest>,
) -> Result<StatusCode, ServerError> {
    state
        .engine
        .remove_chat_lock(&mut session, id, &req.pin)
        .await?;
    state.sessions.store(session).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn unlock(
    State(state): State<AppState>,
    Caller(mut session): Caller,
    Path(id): Path<ConversationId>,
    Json(req): Json<PinRequest>,
) -> Result<StatusCode, ServerError> {
    state.engine.unlock(&mut session, id, &req.pin).await?;
    state.sessions.store(session).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn relock(
    State(state): State<AppState>,
    Caller(mut session): Caller,
    Path(id): Path<ConversationId>,
) -> Json<Value> {
    let relocked = state.engine.lock(&mut session, id);
    state.sessions.store(session).await;
    Json(json!({ "relocked": relocked }))
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

async fn blocked_users(
    State(state): State<AppState>,
    Caller(session): Caller,
) -> Result<Json<Vec<UserId>>, ServerError> {
    Ok(Json(state.engine.blocked_users(&session).await?))
}

async fn block_user(
    State(state): State<AppState>,
    Caller(session): Caller,
    Json(req): Json<BlockRequest>,
) -> Result<Json<Value>, ServerError> {
    let blocked = state.engine.block_user(&session, &req.user_id).await?;
    Ok(Json(json!({ "blocked": blocked })))
}

async fn unblock_user(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(user_id): Path<UserId>,
) -> Result<Json<Value>, ServerError> {
    let unblocked = state.engine.unblock_user(&session, &user_id).await?;
    Ok(Json(json!({ "unblocked": unblocked })))
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

async fn create_group(
    State(state): State<AppState>,
    Caller(session): Caller,
    Json(req): Json<CreateGroup>,
) -> Result<(StatusCode, Json<Group>), ServerError> {
    let group = state.engine.create_group(&session, req).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn get_group(
    State(state): State<AppState>,
    Caller(_): Caller,
    Path(id): Path<ConversationId>,
) -> Result<Json<Group>, ServerError> {
    Ok(Json(state.engine.group(id).await?))
}

async fn update_group(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    Json(update): Json<GroupUpdate>,
) -> Result<Json<Group>, ServerError> {
    Ok(Json(state.engine.update_group(&session, id, update).await?))
}

async fn delete_group(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<StatusCode, ServerError> {
    state.engine.delete_group(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_group_message(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    Json(draft): Json<MessageDraft>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let message = state.engine.send_group_message(&session, id, draft).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn join_group(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    body: Option<Json<OptionalPinRequest>>,
) -> Result<Json<Group>, ServerError> {
    let Json(req) = body.unwrap_or_default();
    let group = state
        .engine
        .join_group(&session, id, req.pin.as_deref())
        .await?;
    Ok(Json(group))
}

async fn leave_group(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
) -> Result<StatusCode, ServerError> {
    state.engine.leave_group(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path((id, user_id)): Path<(ConversationId, UserId)>,
) -> Result<Json<Value>, ServerError> {
    let removed = state.engine.remove_member(&session, id, &user_id).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn set_group_pin(
    State(state): State<AppState>,
    Caller(session): Caller,
    Path(id): Path<ConversationId>,
    Json(req): Json<OptionalPinRequest>,
) -> Result<StatusCode, ServerError> {
    state
        .engine
        .set_group_pin(&session, id, req.pin.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

async fn enable_notifications(
    State(state): State<AppState>,
    Caller(session): Caller,
    Json(req): Json<NotificationsRequest>,
) -> Result<StatusCode, ServerError> {
    state.engine.enable_notifications(&session, &req.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server startup
// ---------------------------------------------------------------------------

/// Start the HTTP API server.
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_engine::EngineConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::auth::USER_ID_HEADER;

    fn app() -> Router {
        let engine = Engine::open_in_memory(EngineConfig::default()).unwrap();
        build_router(AppState::new(engine, ServerConfig::default()))
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn start_direct(app: &Router, from: &str, to: &str) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/v1/conversations",
            Some(from),
            Some(json!({ "userId": to })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_needs_no_identity() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_requires_user_header() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/v1/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("x-user-id"));
    }

    #[tokio::test]
    async fn direct_message_round_trip() {
        let app = app();
        let conv = start_direct(&app, "alice", "bob").await;

        let (status, sent) = call(
            &app,
            Method::POST,
            &format!("/v1/conversations/{conv}/messages"),
            Some("alice"),
            Some(json!({ "kind": "text", "content": "hi bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let message_id = sent["id"].as_str().unwrap().to_string();

        let (_, unread) = call(&app, Method::GET, "/v1/unread", Some("bob"), None).await;
        assert_eq!(unread["unread"], 1);

        let (status, listed) = call(
            &app,
            Method::GET,
            &format!("/v1/conversations/{conv}/messages"),
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["content"], "hi bob");

        let (_, read) = call(
            &app,
            Method::POST,
            &format!("/v1/conversations/{conv}/read"),
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(read["read"].as_array().unwrap().len(), 1);

        let (_, seen) = call(
            &app,
            Method::GET,
            &format!("/v1/conversations/{conv}/messages/{message_id}/seen"),
            Some("alice"),
            None,
        )
        .await;
        assert_eq!(seen["seenByAll"], true);
    }

    #[tokio::test]
    async fn outsiders_are_forbidden() {
        let app = app();
        let conv = start_direct(&app, "alice", "bob").await;

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/v1/conversations/{conv}/messages"),
            Some("mallory"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["access"], "notMember");
    }

    #[tokio::test]
    async fn blocked_sender_gets_access_code() {
        let app = app();
        let conv = start_direct(&app, "alice", "bob").await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/blocks",
            Some("bob"),
            Some(json!({ "userId": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/v1/conversations/{conv}/messages"),
            Some("alice"),
            Some(json!({ "kind": "text", "content": "hello?" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["access"], "blockedByReceiver");
    }

    #[tokio::test]
    async fn unlock_survives_between_requests() {
        let app = app();
        let conv = start_direct(&app, "alice", "bob").await;
        let messages = format!("/v1/conversations/{conv}/messages");

        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/v1/conversations/{conv}/lock"),
            Some("alice"),
            Some(json!({ "pin": "1234" })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, Method::GET, &messages, Some("alice"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["access"], "lockedByPin");

        let unlock = format!("/v1/conversations/{conv}/unlock");
        let (status, _) = call(
            &app,
            Method::POST,
            &unlock,
            Some("alice"),
            Some(json!({ "pin": "9999" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            Method::POST,
            &unlock,
            Some("alice"),
            Some(json!({ "pin": "1234" })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::GET, &messages, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(
            &app,
            Method::POST,
            &format!("/v1/conversations/{conv}/relock"),
            Some("alice"),
            None,
        )
        .await;
        assert_eq!(body["relocked"], true);
        let (status, _) = call(&app, Method::GET, &messages, Some("alice"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The peer never had a lock.
        let (status, _) = call(&app, Method::GET, &messages, Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn group_join_and_post() {
        let app = app();
        let (status, group) = call(
            &app,
            Method::POST,
            "/v1/groups",
            Some("alice"),
            Some(json!({ "name": "Book club", "pin": "4321" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(group.get("pinHash").is_none());
        let id = group["id"].as_str().unwrap().to_string();

        let join = format!("/v1/groups/{id}/join");
        let (status, _) = call(&app, Method::POST, &join, Some("bob"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, joined) = call(
            &app,
            Method::POST,
            &join,
            Some("bob"),
            Some(json!({ "pin": "4321" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(joined["members"].as_array().unwrap().len(), 2);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/v1/groups/{id}/messages"),
            Some("bob"),
            Some(json!({ "kind": "text", "content": "hello club" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/v1/conversations/{id}/messages"),
            Some("bob"),
            Some(json!({ "kind": "text", "content": "wrong route" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/v1/groups/{id}/leave"),
            Some("alice"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn messages_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.db");
        let open = || {
            let db = agora_store::Database::open_at(&path).unwrap();
            let engine = Engine::new(db, EngineConfig::default(), Default::default());
            build_router(AppState::new(engine, ServerConfig::default()))
        };

        let first = open();
        let conv = start_direct(&first, "alice", "bob").await;
        call(
            &first,
            Method::POST,
            &format!("/v1/conversations/{conv}/messages"),
            Some("alice"),
            Some(json!({ "kind": "text", "content": "still here" })),
        )
        .await;
        drop(first);

        let second = open();
        let (status, listed) = call(
            &second,
            Method::GET,
            &format!("/v1/conversations/{conv}/messages?limit=10"),
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["content"], "still here");
    }

    #[tokio::test]
    async fn presence_is_last_writer_wins() {
        let app = app();
        let uri = "/v1/presence/carol";
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);

        let (_, body) = call(
            &app,
            Method::PUT,
            uri,
            Some("gateway"),
            Some(json!({ "state": "online", "at": now })),
        )
        .await;
        assert_eq!(body["changed"], true);

        let (_, body) = call(
            &app,
            Method::PUT,
            uri,
            Some("gateway"),
            Some(json!({ "state": "offline", "at": earlier })),
        )
        .await;
        assert_eq!(body["changed"], false);

        let (_, body) = call(&app, Method::GET, uri, Some("alice"), None).await;
        assert_eq!(body["presence"]["state"], "online");
    }
}
