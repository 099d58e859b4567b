/// Application name
pub const APP_NAME: &str = "Agora";

/// A direct conversation always has exactly two participants
pub const DIRECT_PARTICIPANTS: usize = 2;

/// Idle window after which a client clears its own typing flag (ms)
pub const TYPING_IDLE_MS: u64 = 500;

/// Server-side expiry of a typing flag that was never cleared (ms)
pub const TYPING_TTL_MS: u64 = 5_000;

/// Upper bound on a single link-preview lookup (ms)
pub const LINK_PREVIEW_TIMEOUT_MS: u64 = 3_000;

/// Upper bound on delivering one push notification (ms)
pub const PUSH_TIMEOUT_MS: u64 = 5_000;

/// Buffered conversation events per subscriber before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Page size for message listings that ask for a page without a limit.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_CHAT_LOCK: &str = "agora-chat-lock-pin-v1";
pub const KDF_CONTEXT_GROUP_PIN: &str = "agora-group-join-pin-v1";
