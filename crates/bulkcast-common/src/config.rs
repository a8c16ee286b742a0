//! Configuration for bulkcast

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Dispatch engine configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Channel adapter configuration
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum concurrent sends per campaign
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-send timeout in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Base delay of the retry backoff in seconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Upper bound of the retry backoff in seconds
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            send_timeout_secs: default_send_timeout(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_send_timeout() -> u64 {
    10
}

fn default_retry_base_delay() -> u64 {
    2
}

fn default_retry_max_delay() -> u64 {
    60
}

/// Channel adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel backend: "http" or "log"
    #[serde(default = "default_channel_backend")]
    pub backend: String,

    /// Base URL of the messaging provider API
    #[serde(default = "default_channel_base_url")]
    pub base_url: String,

    /// Sender identifier (phone number id at the provider)
    pub sender_id: Option<String>,

    /// Bearer token for the provider API
    pub access_token: Option<String>,

    /// Sends allowed per minute across all campaigns
    pub rate_limit_per_minute: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backend: default_channel_backend(),
            base_url: default_channel_base_url(),
            sender_id: None,
            access_token: None,
            rate_limit_per_minute: None,
        }
    }
}

fn default_channel_backend() -> String {
    "log".to_string()
}

fn default_channel_base_url() -> String {
    "https://graph.facebook.com/v22.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "memory" or "postgres"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "memory".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from the first config file found, overlaid with
    /// `BULKCAST__SECTION__KEY` environment variables
    pub fn load() -> crate::Result<Self> {
        let mut paths = vec![
            PathBuf::from("./bulkcast.toml"),
            PathBuf::from("/etc/bulkcast/bulkcast.toml"),
        ];
        if let Ok(explicit) = std::env::var("BULKCAST_CONFIG") {
            paths.insert(0, PathBuf::from(explicit));
        }

        let mut builder = config::Config::builder();
        if let Some(path) = paths.iter().find(|p| p.exists()) {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder
            .add_source(
                config::Environment::with_prefix("BULKCAST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}
