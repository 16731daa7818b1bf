//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a client can start with zero
//! configuration against a local directory.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use carelink_net::PollerConfig;
use carelink_shared::constants::{
    CHUNK_DELAY_MS, CHUNK_SIZE, LINK_OPEN_TIMEOUT_MS, MAX_FILE_SIZE, PRESENCE_MAX_BACKOFF_MS,
    PRESENCE_POLL_INTERVAL_MS, TRANSFER_IDLE_TIMEOUT_MS,
};
use carelink_store::{Database, StoreError};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Presence directory endpoint returning a JSON array of peer ids.
    /// Env: `CARELINK_DIRECTORY_URL`
    pub directory_url: String,

    /// Env: `CARELINK_POLL_INTERVAL_MS`
    pub poll_interval: Duration,

    /// Cap for the poll delay after consecutive directory failures.
    /// Env: `CARELINK_MAX_POLL_BACKOFF_MS`
    pub max_poll_backoff: Duration,

    /// Bounded wait for a data link to open.
    /// Env: `CARELINK_LINK_TIMEOUT_MS`
    pub link_timeout: Duration,

    /// Largest attachment sent or accepted, in bytes.
    /// Env: `CARELINK_MAX_FILE_SIZE`
    pub max_file_size: usize,

    /// Env: `CARELINK_CHUNK_SIZE`
    pub chunk_size: usize,

    /// Pause between outgoing chunks.
    /// Env: `CARELINK_CHUNK_DELAY_MS`
    pub chunk_delay: Duration,

    /// Partial inbound transfers idle for longer than this are discarded.
    /// Env: `CARELINK_TRANSFER_TIMEOUT_MS`
    pub transfer_timeout: Duration,

    /// Env: `CARELINK_DATABASE_PATH`
    /// Default: the platform data directory.
    pub database_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory_url: "http://127.0.0.1:9000/peerjs/peers".to_string(),
            poll_interval: Duration::from_millis(PRESENCE_POLL_INTERVAL_MS),
            max_poll_backoff: Duration::from_millis(PRESENCE_MAX_BACKOFF_MS),
            link_timeout: Duration::from_millis(LINK_OPEN_TIMEOUT_MS),
            max_file_size: MAX_FILE_SIZE,
            chunk_size: CHUNK_SIZE,
            chunk_delay: Duration::from_millis(CHUNK_DELAY_MS),
            transfer_timeout: Duration::from_millis(TRANSFER_IDLE_TIMEOUT_MS),
            database_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("CARELINK_DIRECTORY_URL") {
            config.directory_url = url;
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "CARELINK_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CARELINK_MAX_POLL_BACKOFF_MS") {
            config.max_poll_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CARELINK_LINK_TIMEOUT_MS") {
            config.link_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "CARELINK_MAX_FILE_SIZE") {
            config.max_file_size = size;
        }
        match parse_var::<usize>(&lookup, "CARELINK_CHUNK_SIZE") {
            Some(0) => tracing::warn!("CARELINK_CHUNK_SIZE must be positive, using default"),
            Some(size) => config.chunk_size = size,
            None => {}
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CARELINK_CHUNK_DELAY_MS") {
            config.chunk_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CARELINK_TRANSFER_TIMEOUT_MS") {
            config.transfer_timeout = Duration::from_millis(ms);
        }

        if let Some(path) = lookup("CARELINK_DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: self.poll_interval,
            max_backoff: self.max_poll_backoff,
        }
    }

    /// Open the configured database, or the platform default.
    pub fn open_database(&self) -> Result<Database, StoreError> {
        match &self.database_path {
            Some(path) => Database::open_at(path),
            None => Database::new(),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
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
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.chunk_size, 16 * 1024);
        assert_eq!(config.link_timeout, Duration::from_secs(5));
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CARELINK_DIRECTORY_URL", "http://directory.local/peers"),
            ("CARELINK_CHUNK_SIZE", "4096"),
            ("CARELINK_LINK_TIMEOUT_MS", "250"),
            ("CARELINK_DATABASE_PATH", "/tmp/carelink.db"),
        ]));
        assert_eq!(config.directory_url, "http://directory.local/peers");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.link_timeout, Duration::from_millis(250));
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/carelink.db")));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CARELINK_CHUNK_SIZE", "0"),
            ("CARELINK_MAX_FILE_SIZE", "lots"),
        ]));
        assert_eq!(config.chunk_size, CHUNK_SIZE);
        assert_eq!(config.max_file_size, MAX_FILE_SIZE);
    }
}
