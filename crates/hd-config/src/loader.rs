//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "herald.toml",
    "./config/config.toml",
    "/etc/herald/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("HERALD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("HD_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("HD_HTTP_HOST") {
            config.http.host = val;
        }

        // MongoDB
        if let Ok(val) = env::var("HD_MONGODB_URI") {
            config.mongodb.uri = val;
        }
        if let Ok(val) = env::var("HD_MONGODB_DATABASE") {
            config.mongodb.database = val;
        }

        // Redis
        if let Ok(val) = env::var("HD_REDIS_URL") {
            config.redis.url = val;
        }
        if let Ok(val) = env::var("HD_REDIS_KEY_PREFIX") {
            config.redis.key_prefix = val;
        }

        // Kafka
        if let Ok(val) = env::var("HD_KAFKA_BROKERS") {
            config.kafka.brokers = val;
        }

        // Auth
        if let Ok(val) = env::var("HD_API_KEY") {
            config.auth.api_key = val;
        }

        // Outbox
        if let Ok(val) = env::var("HD_OUTBOX_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.outbox.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("HD_OUTBOX_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.outbox.batch_size = size;
            }
        }
        if let Ok(val) = env::var("HD_OUTBOX_CLAIM_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.outbox.claim_timeout_ms = timeout;
            }
        }

        // Dispatch
        if let Ok(val) = env::var("HD_MAX_RETRY_COUNT") {
            if let Ok(count) = val.parse() {
                config.dispatch.max_retry_count = count;
            }
        }
        if let Ok(val) = env::var("HD_PROCESSING_TTL_SECONDS") {
            if let Ok(ttl) = val.parse() {
                config.dispatch.processing_ttl_seconds = ttl;
            }
        }
        if let Ok(val) = env::var("HD_IDEMPOTENCY_TTL_SECONDS") {
            if let Ok(ttl) = val.parse() {
                config.dispatch.idempotency_ttl_seconds = ttl;
            }
        }
        if let Ok(val) = env::var("HD_PROVIDER_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.dispatch.provider_timeout_ms = timeout;
            }
        }

        // Delayed
        if let Ok(val) = env::var("HD_DELAYED_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.delayed.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("HD_MAX_POLLER_RETRIES") {
            if let Ok(retries) = val.parse() {
                config.delayed.max_poller_retries = retries;
            }
        }

        // Webhook
        if let Ok(val) = env::var("HD_WEBHOOK_MAX_RETRIES") {
            if let Ok(retries) = val.parse() {
                config.webhook.max_retries = retries;
            }
        }
        if let Ok(val) = env::var("HD_WEBHOOK_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.webhook.timeout_ms = timeout;
            }
        }
        if let Ok(val) = env::var("HD_WEBHOOK_SIGNING_KEY") {
            config.webhook.signing_key = Some(val);
        }

        // Recovery
        if let Ok(val) = env::var("HD_RECOVERY_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.recovery.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("HD_RECOVERY_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.recovery.batch_size = size;
            }
        }
        if let Ok(val) = env::var("HD_PROCESSING_STUCK_THRESHOLD_MS") {
            if let Ok(threshold) = val.parse() {
                config.recovery.processing_stuck_threshold_ms = threshold;
            }
        }
        if let Ok(val) = env::var("HD_PENDING_STUCK_THRESHOLD_MS") {
            if let Ok(threshold) = val.parse() {
                config.recovery.pending_stuck_threshold_ms = threshold;
            }
        }
        if let Ok(val) = env::var("HD_CLEANUP_ALERT_RETENTION_MS") {
            if let Ok(retention) = val.parse() {
                config.recovery.alert_retention_ms = retention;
            }
        }
        if let Ok(val) = env::var("HD_CLEANUP_STATUS_OUTBOX_RETENTION_MS") {
            if let Ok(retention) = val.parse() {
                config.recovery.status_outbox_retention_ms = retention;
            }
        }
        if let Ok(val) = env::var("HD_CLEANUP_OUTBOX_RETENTION_MS") {
            if let Ok(retention) = val.parse() {
                config.recovery.outbox_retention_ms = retention;
            }
        }

        // Per-channel rate limits: HD_<CHANNEL>_RATE_LIMIT_TOKENS etc.
        for channel in &mut config.channels {
            let upper = channel.name.to_uppercase();
            if let Ok(val) = env::var(format!("HD_{}_RATE_LIMIT_TOKENS", upper)) {
                if let Ok(tokens) = val.parse() {
                    channel.rate_limit_tokens = tokens;
                }
            }
            if let Ok(val) = env::var(format!("HD_{}_RATE_LIMIT_REFILL_RATE", upper)) {
                if let Ok(rate) = val.parse() {
                    channel.rate_limit_refill_rate = rate;
                }
            }
            if let Ok(val) = env::var(format!("HD_{}_PROVIDER_URL", upper)) {
                channel.provider_url = val;
            }
            if let Ok(val) = env::var(format!("HD_{}_PROVIDER_TOKEN", upper)) {
                channel.provider_token = Some(val);
            }
        }

        // Worker identity
        if let Ok(val) = env::var("HD_WORKER_ID") {
            config.worker_id = Some(val);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
