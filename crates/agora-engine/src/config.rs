//! Engine tuning loaded from environment variables.
//!
//! Every setting has a default so an embedding application can start the
//! engine without any configuration.

use std::time::Duration;

use agora_shared::constants::{
    EVENT_CHANNEL_CAPACITY, LINK_PREVIEW_TIMEOUT_MS, PUSH_TIMEOUT_MS, TYPING_IDLE_MS,
    TYPING_TTL_MS,
};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum characters in a message body or caption. `None` disables the cap.
    /// Env: `AGORA_MAX_MESSAGE_LEN` (0 disables)
    /// Default: unlimited
    pub max_content_len: Option<usize>,

    /// How long a typing flag survives without being refreshed.
    /// Env: `AGORA_TYPING_TTL_MS`
    /// Default: `5000`
    pub typing_ttl: Duration,

    /// Idle window after which a client debouncer clears its typing flag.
    /// Env: `AGORA_TYPING_IDLE_MS`
    /// Default: `500`
    pub typing_idle: Duration,

    /// Upper bound on a single link-preview lookup.
    /// Env: `AGORA_LINK_PREVIEW_TIMEOUT_MS`
    /// Default: `3000`
    pub link_preview_timeout: Duration,

    /// Upper bound on delivering one push notification.
    /// Env: `AGORA_PUSH_TIMEOUT_MS`
    /// Default: `5000`
    pub push_timeout: Duration,

    /// Events buffered per subscriber before it starts lagging.
    /// Env: `AGORA_EVENT_CAPACITY`
    /// Default: `256`
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_content_len: None,
            typing_ttl: Duration::from_millis(TYPING_TTL_MS),
            typing_idle: Duration::from_millis(TYPING_IDLE_MS),
            link_preview_timeout: Duration::from_millis(LINK_PREVIEW_TIMEOUT_MS),
            push_timeout: Duration::from_millis(PUSH_TIMEOUT_MS),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("AGORA_MAX_MESSAGE_LEN") {
            match value.trim().parse::<usize>() {
                Ok(0) => config.max_content_len = None,
                Ok(n) => config.max_content_len = Some(n),
                Err(_) => warn_invalid("AGORA_MAX_MESSAGE_LEN", &value),
            }
        }

        if let Some(ttl) = millis(&lookup, "AGORA_TYPING_TTL_MS") {
            config.typing_ttl = ttl;
        }
        if let Some(idle) = millis(&lookup, "AGORA_TYPING_IDLE_MS") {
            config.typing_idle = idle;
        }
        if let Some(timeout) = millis(&lookup, "AGORA_LINK_PREVIEW_TIMEOUT_MS") {
            config.link_preview_timeout = timeout;
        }
        if let Some(timeout) = millis(&lookup, "AGORA_PUSH_TIMEOUT_MS") {
            config.push_timeout = timeout;
        }

        if let Some(value) = lookup("AGORA_EVENT_CAPACITY") {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.event_capacity = n,
                _ => warn_invalid("AGORA_EVENT_CAPACITY", &value),
            }
        }

        config
    }
}

/// Read a positive millisecond duration.
fn millis(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let value = lookup(name)?;
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn_invalid(name, &value);
            None
        }
    }
}

fn warn_invalid(name: &str, value: &str) {
    tracing::warn!(variable = name, value = %value, "Invalid value, using default");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.typing_ttl, Duration::from_secs(5));
        assert_eq!(config.typing_idle, Duration::from_millis(500));
        assert_eq!(config.max_content_len, None);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("AGORA_MAX_MESSAGE_LEN", "2000"),
            ("AGORA_TYPING_TTL_MS", "1500"),
            ("AGORA_EVENT_CAPACITY", "16"),
        ]));
        assert_eq!(config.max_content_len, Some(2000));
        assert_eq!(config.typing_ttl, Duration::from_millis(1500));
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("AGORA_TYPING_IDLE_MS", "soon"),
            ("AGORA_EVENT_CAPACITY", "0"),
        ]));
        assert_eq!(config, EngineConfig::default());
    }
}
