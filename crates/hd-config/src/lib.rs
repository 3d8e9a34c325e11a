//! Herald configuration system.
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub mongodb: MongoConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    pub outbox: OutboxConfig,
    pub dispatch: DispatchConfig,
    pub delayed: DelayedConfig,
    pub webhook: WebhookConfig,
    pub recovery: RecoveryConfig,
    pub channels: Vec<ChannelConfig>,

    /// Stable worker identity override; defaults to hostname:pid.
    pub worker_id: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            mongodb: MongoConfig::default(),
            redis: RedisConfig::default(),
            kafka: KafkaConfig::default(),
            auth: AuthConfig::default(),
            outbox: OutboxConfig::default(),
            dispatch: DispatchConfig::default(),
            delayed: DelayedConfig::default(),
            webhook: WebhookConfig::default(),
            recovery: RecoveryConfig::default(),
            channels: vec![ChannelConfig::named("email"), ChannelConfig::named("telegram")],
            worker_id: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one channel must be configured".to_string(),
            ));
        }
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "channel name must not be empty".to_string(),
                ));
            }
            if channel.rate_limit_tokens == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "channel {}: rate_limit_tokens must be > 0",
                    channel.name
                )));
            }
        }
        if self.outbox.batch_size == 0 || self.recovery.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batch sizes must be > 0".to_string(),
            ));
        }
        if self.dispatch.backoff_base_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.backoff_base_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Lookup a channel by tag.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// MongoDB configuration. Transactions require a replica-set topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017/?replicaSet=rs0&directConnection=true".to_string(),
            database: "herald".to_string(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "herald".to_string(),
        }
    }
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    /// Producer delivery timeout per message.
    pub delivery_timeout_ms: u64,
    pub session_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            delivery_timeout_ms: 30_000,
            session_timeout_ms: 10_000,
        }
    }
}

/// Ingest API authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Static bearer key; empty disables auth (dev only).
    pub api_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
        }
    }
}

/// Outbox publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    /// Claims older than this are reclaimable by other workers.
    pub claim_timeout_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            claim_timeout_ms: 60_000,
        }
    }
}

/// Channel consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries before a failure becomes permanent.
    pub max_retry_count: u32,
    /// TTL of the `processing` idempotency record.
    pub processing_ttl_seconds: u64,
    /// TTL of terminal idempotency records.
    pub idempotency_ttl_seconds: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Per-call deadline on provider sends.
    pub provider_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 5,
            processing_ttl_seconds: 60,
            idempotency_ttl_seconds: 86_400,
            backoff_base_ms: 5_000,
            backoff_cap_ms: 60_000,
            provider_timeout_ms: 30_000,
        }
    }
}

/// Delayed pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    /// TTL of a per-member claim lock.
    pub claim_ttl_ms: u64,
    /// Publish attempts before a due event is dead-lettered.
    pub max_poller_retries: u32,
}

impl Default for DelayedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            claim_ttl_ms: 30_000,
            max_poller_retries: 3,
        }
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub max_retries: u32,
    pub timeout_ms: u64,
    /// Optional HMAC-SHA256 signing key for webhook bodies.
    pub signing_key: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 10_000,
            signing_key: None,
        }
    }
}

/// Recovery cron configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub processing_stuck_threshold_ms: u64,
    pub pending_stuck_threshold_ms: u64,
    pub alert_retention_ms: u64,
    pub status_outbox_retention_ms: u64,
    pub outbox_retention_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            batch_size: 100,
            processing_stuck_threshold_ms: 5 * 60_000,
            pending_stuck_threshold_ms: 10 * 60_000,
            alert_retention_ms: 7 * 24 * 3_600_000,
            status_outbox_retention_ms: 24 * 3_600_000,
            outbox_retention_ms: 24 * 3_600_000,
        }
    }
}

/// Per-channel configuration. The channel set is open: registering a channel
/// here is all that is needed for the pipeline to route it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    /// Token bucket capacity.
    pub rate_limit_tokens: u32,
    /// Tokens refilled per second.
    pub rate_limit_refill_rate: f64,
    /// Provider HTTP endpoint for this channel.
    pub provider_url: String,
    pub provider_token: Option<String>,
}

impl ChannelConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            rate_limit_tokens: 100,
            rate_limit_refill_rate: 10.0,
            provider_url: "http://localhost:9000/send".to_string(),
            provider_token: None,
        }
    }
}
