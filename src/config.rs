//! Service configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use courier_consumer::{ConsumerConfig, RedisStreamConfig};
use courier_delivery::{ClientConfig, EngineConfig, RetryPolicy, SchedulerConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";
const ENV_PREFIX: &str = "COURIER_";
const REDIS_BLOCK: Duration = Duration::from_secs(5);

/// Complete service configuration.
///
/// Loaded in priority order, highest first:
/// 1. Environment variables prefixed `COURIER_` (`COURIER_DATABASE_URL`, ...)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL. Without one the service keeps state in
    /// memory.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Maximum number of pooled database connections.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    // Broker
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Stream events are read from.
    #[serde(default = "default_redis_stream")]
    pub redis_stream: String,
    /// Consumer group shared by all instances.
    #[serde(default = "default_redis_group")]
    pub redis_group: String,
    /// This instance's name within the consumer group.
    #[serde(default = "default_redis_consumer")]
    pub redis_consumer: String,
    /// Messages processed concurrently.
    #[serde(default = "default_prefetch")]
    pub consumer_prefetch: usize,

    // Scheduler
    /// Milliseconds between retry sweeps.
    #[serde(default = "default_poll_interval_ms")]
    pub scheduler_poll_interval_ms: u64,
    /// Deliveries picked up per sweep.
    #[serde(default = "default_batch_size")]
    pub scheduler_batch_size: usize,
    /// Seconds after which a DELIVERING claim is considered abandoned.
    #[serde(default = "default_stale_timeout")]
    pub stale_delivery_timeout_seconds: u64,

    // Retry
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Growth factor per additional failed attempt.
    #[serde(default = "default_multiplier")]
    pub retry_multiplier: f64,
    /// Upper bound on any retry delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Jitter fraction applied to retry delays (0.0 to 1.0).
    #[serde(default = "default_jitter_factor")]
    pub retry_jitter_factor: f64,

    // Delivery
    /// Attempt timeout for destinations without their own, in seconds.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
    /// Attempts running at once across all destinations.
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
    /// Response body bytes kept on the delivery record.
    #[serde(default = "default_max_response_body_bytes")]
    pub max_response_body_bytes: usize,

    /// Seconds each component gets to finish in-flight work on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads defaults, then `courier.toml`, then `COURIER_*` variables.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Backoff policy for failed attempts.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Delivery engine configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        let timeout = Duration::from_secs(self.delivery_timeout_seconds);
        EngineConfig {
            client: ClientConfig {
                timeout,
                max_response_body_bytes: self.max_response_body_bytes,
                ..ClientConfig::default()
            },
            retry_policy: self.to_retry_policy(),
            default_timeout: timeout,
            max_concurrent_deliveries: self.max_concurrent_deliveries,
        }
    }

    /// Retry sweep configuration.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.scheduler_poll_interval_ms),
            batch_size: self.scheduler_batch_size,
            stale_after: Duration::from_secs(self.stale_delivery_timeout_seconds),
        }
    }

    /// Event consumer configuration.
    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig { prefetch: self.consumer_prefetch, shutdown_timeout: self.shutdown_timeout() }
    }

    /// Redis Streams broker configuration.
    pub fn to_redis_config(&self) -> RedisStreamConfig {
        RedisStreamConfig {
            url: self.redis_url.clone(),
            stream: self.redis_stream.clone(),
            group: self.redis_group.clone(),
            consumer: self.redis_consumer.clone(),
            batch_size: self.consumer_prefetch,
            block: REDIS_BLOCK,
        }
    }

    /// Shutdown deadline per component.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Database URL with the password replaced by `***`.
    pub fn database_url_masked(&self) -> Option<String> {
        self.database_url.as_deref().map(mask_password)
    }

    /// Redis URL with the password replaced by `***`.
    pub fn redis_url_masked(&self) -> String {
        mask_password(&self.redis_url)
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            bail!("database_max_connections must be greater than 0");
        }
        if self.consumer_prefetch == 0 {
            bail!("consumer_prefetch must be greater than 0");
        }
        if self.scheduler_poll_interval_ms == 0 {
            bail!("scheduler_poll_interval_ms must be greater than 0");
        }
        if self.scheduler_batch_size == 0 {
            bail!("scheduler_batch_size must be greater than 0");
        }
        if self.max_concurrent_deliveries == 0 {
            bail!("max_concurrent_deliveries must be greater than 0");
        }
        if self.delivery_timeout_seconds == 0 {
            bail!("delivery_timeout_seconds must be greater than 0");
        }
        self.to_retry_policy().validate().context("invalid retry settings")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_max_connections(),
            redis_url: default_redis_url(),
            redis_stream: default_redis_stream(),
            redis_group: default_redis_group(),
            redis_consumer: default_redis_consumer(),
            consumer_prefetch: default_prefetch(),
            scheduler_poll_interval_ms: default_poll_interval_ms(),
            scheduler_batch_size: default_batch_size(),
            stale_delivery_timeout_seconds: default_stale_timeout(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_multiplier: default_multiplier(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            delivery_timeout_seconds: default_delivery_timeout(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            max_response_body_bytes: default_max_response_body_bytes(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if url[..colon_pos].contains("//") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_stream() -> String {
    "courier:events".to_string()
}

fn default_redis_group() -> String {
    "courier".to_string()
}

fn default_redis_consumer() -> String {
    "courier-1".to_string()
}

fn default_prefetch() -> usize {
    courier_consumer::DEFAULT_PREFETCH
}

fn default_poll_interval_ms() -> u64 {
    courier_delivery::DEFAULT_POLL_INTERVAL_MS
}

fn default_batch_size() -> usize {
    courier_delivery::DEFAULT_BATCH_SIZE
}

fn default_stale_timeout() -> u64 {
    courier_delivery::DEFAULT_STALE_AFTER_SECONDS
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_jitter_factor() -> f64 {
    0.0
}

fn default_delivery_timeout() -> u64 {
    courier_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_max_concurrent_deliveries() -> usize {
    courier_delivery::DEFAULT_MAX_CONCURRENT_DELIVERIES
}

fn default_max_response_body_bytes() -> usize {
    courier_delivery::DEFAULT_MAX_RESPONSE_BODY_BYTES
}

fn default_shutdown_timeout() -> u64 {
    courier_consumer::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS
}

fn default_log_level() -> String {
    "info".to_string()
}
