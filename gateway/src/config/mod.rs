//! Gateway configuration.
//!
//! Everything is environment-driven with documented defaults; `.env` files
//! are loaded by `main` before this module reads anything. Engine-specific
//! settings (`PIPER_*`, `RIVA_*`, `WS_TTS_DUMMY_*`) live with their engines.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// API key entry: a client identifier plus its secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    /// Engine selector: dummy | piper | riva.
    pub engine: String,

    /// Accepted API keys. Empty means authentication is disabled.
    pub api_keys: Vec<ApiKey>,

    // Admission control
    pub max_sessions: usize,
    pub max_sessions_per_key: usize,

    // Streaming behavior
    /// Outbound queue capacity per session, in messages (Q).
    pub queue_capacity: usize,
    /// Per-write transport timeout (W).
    pub write_timeout: Duration,
    /// Longest tolerated full-queue stall before the session dies for
    /// backpressure (B).
    pub backpressure_timeout: Duration,
    /// Window in which an orphaned session can be resumed (G).
    pub resume_grace: Duration,
    /// Retention ring capacity in chunks (R).
    pub retention_chunks: usize,
    /// Retention ring age bound (T).
    pub retention_max_age: Duration,
    /// Inbound idle-read timeout.
    pub idle_timeout: Duration,
    /// Target chunk duration in milliseconds of audio.
    pub chunk_ms: u64,

    // Segmentation
    pub flush_on_punct: bool,
    pub flush_min_chars: usize,

    /// CORS allowed origins ("*" or comma-separated list); None keeps
    /// same-origin only.
    pub cors_allowed_origins: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9000,
            engine: "piper".into(),
            api_keys: Vec::new(),
            max_sessions: 1000,
            max_sessions_per_key: 50,
            queue_capacity: 64,
            write_timeout: Duration::from_secs(5),
            backpressure_timeout: Duration::from_secs(2),
            resume_grace: Duration::from_secs(30),
            retention_chunks: 256,
            retention_max_age: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            chunk_ms: 20,
            flush_on_punct: true,
            flush_min_chars: 12,
            cors_allowed_origins: None,
        }
    }
}

impl GatewayConfig {
    /// Builds the configuration from `WS_TTS_*` environment variables,
    /// falling back to the documented defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("WS_TTS_HOST", defaults.host),
            port: env_parse("WS_TTS_PORT", defaults.port),
            engine: env_or("WS_TTS_ENGINE", defaults.engine)
                .trim()
                .to_lowercase(),
            api_keys: parse_api_keys(&std::env::var("WS_TTS_API_KEYS").unwrap_or_default()),
            max_sessions: env_parse("WS_TTS_MAX_SESSIONS", defaults.max_sessions),
            max_sessions_per_key: env_parse(
                "WS_TTS_MAX_SESSIONS_PER_KEY",
                defaults.max_sessions_per_key,
            ),
            queue_capacity: env_parse("WS_TTS_QUEUE_CAPACITY", defaults.queue_capacity),
            write_timeout: env_secs("WS_TTS_WRITE_TIMEOUT_S", defaults.write_timeout),
            backpressure_timeout: env_secs(
                "WS_TTS_BACKPRESSURE_TIMEOUT_S",
                defaults.backpressure_timeout,
            ),
            resume_grace: env_secs("WS_TTS_RESUME_GRACE_S", defaults.resume_grace),
            retention_chunks: env_parse("WS_TTS_RETENTION_CHUNKS", defaults.retention_chunks),
            retention_max_age: env_secs("WS_TTS_RETENTION_AGE_S", defaults.retention_max_age),
            idle_timeout: env_secs("WS_TTS_IDLE_TIMEOUT_S", defaults.idle_timeout),
            chunk_ms: env_parse("WS_TTS_CHUNK_MS", defaults.chunk_ms),
            flush_on_punct: env_parse("WS_TTS_FLUSH_ON_PUNCT", defaults.flush_on_punct),
            flush_min_chars: env_parse("WS_TTS_FLUSH_MIN_CHARS", defaults.flush_min_chars),
            cors_allowed_origins: std::env::var("WS_TTS_CORS_ALLOWED_ORIGINS")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Authentication is on exactly when keys are configured.
    pub fn auth_required(&self) -> bool {
        !self.api_keys.is_empty()
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable value, using default");
            default
        }),
        _ => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}

/// Parses `WS_TTS_API_KEYS`: comma-separated `id:secret` entries.
/// Entries without a colon get their position as the id.
fn parse_api_keys(raw: &str) -> Vec<ApiKey> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once(':') {
            Some((id, key)) => ApiKey {
                id: id.trim().to_string(),
                key: key.trim().to_string(),
            },
            None => ApiKey {
                id: format!("key-{i}"),
                key: entry.to_string(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 9000);
        assert_eq!(config.engine, "piper");
        assert_eq!(config.max_sessions, 1000);
        assert_eq!(config.max_sessions_per_key, 50);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert_eq!(config.backpressure_timeout, Duration::from_secs(2));
        assert_eq!(config.resume_grace, Duration::from_secs(30));
        assert_eq!(config.retention_chunks, 256);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.chunk_ms, 20);
        assert!(config.flush_on_punct);
        assert_eq!(config.flush_min_chars, 12);
        assert!(!config.auth_required());
    }

    #[test]
    fn test_address_format() {
        let config = GatewayConfig {
            host: "127.0.0.1".into(),
            port: 9100,
            ..GatewayConfig::default()
        };
        assert_eq!(config.address(), "127.0.0.1:9100");
    }

    #[test]
    fn test_parse_api_keys_with_ids() {
        let keys = parse_api_keys("alice:s3cret, bob:hunter2");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].id, "alice");
        assert_eq!(keys[0].key, "s3cret");
        assert_eq!(keys[1].id, "bob");
        assert_eq!(keys[1].key, "hunter2");
    }

    #[test]
    fn test_parse_api_keys_bare_secrets() {
        let keys = parse_api_keys("topsecret");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "key-0");
        assert_eq!(keys[0].key, "topsecret");
    }

    #[test]
    fn test_parse_api_keys_empty() {
        assert!(parse_api_keys("").is_empty());
        assert!(parse_api_keys(" , ,").is_empty());
    }

    #[test]
    fn test_auth_required_with_keys() {
        let config = GatewayConfig {
            api_keys: vec![ApiKey {
                id: "a".into(),
                key: "k".into(),
            }],
            ..GatewayConfig::default()
        };
        assert!(config.auth_required());
    }
}
