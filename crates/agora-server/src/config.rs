//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so a development server starts with no
//! configuration at all.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agora_engine::EngineConfig;
use agora_shared::constants::DEFAULT_HTTP_PORT;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None`, which resolves to the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Largest request body accepted, attachments included.
    /// Env: `MAX_UPLOAD_SIZE` (bytes)
    /// Default: 25 MiB
    pub max_upload_size: usize,

    /// How long an idle caller keeps its chat unlocks.
    /// Env: `SESSION_IDLE_SECS`
    /// Default: 30 minutes
    pub session_idle: Duration,

    /// Engine tunables, read from the `AGORA_*` variables.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            max_upload_size: 25 * 1024 * 1024,
            session_idle: Duration::from_secs(30 * 60),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            engine: EngineConfig::from_lookup(&lookup),
            ..Self::default()
        };

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("MAX_UPLOAD_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_upload_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_UPLOAD_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("SESSION_IDLE_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.session_idle = Duration::from_secs(n),
                _ => tracing::warn!(value = %val, "Invalid SESSION_IDLE_SECS, using default"),
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/agora.db"),
            ("SESSION_IDLE_SECS", "60"),
            ("AGORA_MAX_MESSAGE_LEN", "500"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/agora.db")));
        assert_eq!(config.session_idle, Duration::from_secs(60));
        assert_eq!(config.engine.max_content_len, Some(500));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not an address"),
            ("MAX_UPLOAD_SIZE", "0"),
        ]));
        let default = ServerConfig::default();
        assert_eq!(config.http_addr, default.http_addr);
        assert_eq!(config.max_upload_size, default.max_upload_size);
    }
}
