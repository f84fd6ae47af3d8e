use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "sprout.toml",
    "config/sprout.toml",
    "crates/config/sprout.toml",
    "../sprout.toml",
    "../config/sprout.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub messaging: MessagingConfig,
    pub database: DatabaseConfig,
    pub identity: IdentityConfig,
}

/// Listener and per-connection resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Upper bound on concurrently open connection sessions.
    pub max_sessions: usize,
    /// Capacity of each session's outbound event queue.
    pub outbound_queue_capacity: usize,
    /// Longest accepted protocol line, in bytes. Longer lines terminate the connection.
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8082,
            max_sessions: 1024,
            outbound_queue_capacity: 256,
            max_line_length: 64 * 1024,
        }
    }
}

/// Limits enforced by the messaging core before anything is persisted.
///
/// ```
/// use sprout_config::MessagingConfig;
///
/// let messaging = MessagingConfig::default();
/// assert_eq!(messaging.max_message_size, 4096);
/// assert_eq!(messaging.store_timeout().as_millis(), 5000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub max_message_size: usize,
    pub max_attachment_count: usize,
    pub store_timeout_ms: u64,
    pub history_page_size: i64,
}

impl MessagingConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4096,
            max_attachment_count: 10,
            store_timeout_ms: 5_000,
            history_page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://sprout.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub base_url: String,
    #[serde(default = "IdentityConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl IdentityConfig {
    const fn default_request_timeout() -> u64 {
        5
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}

fn as_i64(value: impl TryInto<i64>) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use sprout_config::load;
///
/// std::env::remove_var("SPROUT_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.server.address.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();

    let mut builder = config::Config::builder()
        .set_default("server.address", defaults.server.address.clone())?
        .set_default("server.port", i64::from(defaults.server.port))?
        .set_default("server.max_sessions", as_i64(defaults.server.max_sessions))?
        .set_default(
            "server.outbound_queue_capacity",
            as_i64(defaults.server.outbound_queue_capacity),
        )?
        .set_default("server.max_line_length", as_i64(defaults.server.max_line_length))?
        .set_default(
            "messaging.max_message_size",
            as_i64(defaults.messaging.max_message_size),
        )?
        .set_default(
            "messaging.max_attachment_count",
            as_i64(defaults.messaging.max_attachment_count),
        )?
        .set_default(
            "messaging.store_timeout_ms",
            as_i64(defaults.messaging.store_timeout_ms),
        )?
        .set_default(
            "messaging.history_page_size",
            defaults.messaging.history_page_size,
        )?
        .set_default("database.url", defaults.database.url.clone())?
        .set_default(
            "database.max_connections",
            i64::from(defaults.database.max_connections),
        )?
        .set_default("identity.base_url", defaults.identity.base_url.clone())?
        .set_default(
            "identity.request_timeout_seconds",
            as_i64(defaults.identity.request_timeout_seconds),
        )?;

    let environment_overrides = config::Environment::with_prefix("SPROUT").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("SPROUT_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via SPROUT_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let mut config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    if config.server.max_sessions == 0 {
        config.server.max_sessions = 1;
    }
    if config.server.outbound_queue_capacity == 0 {
        config.server.outbound_queue_capacity = 1;
    }

    debug!(?config, "loaded backend configuration");
    Ok(config)
}
