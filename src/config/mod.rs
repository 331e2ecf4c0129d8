use serde::Deserialize;
use std::time::Duration;

use crate::services::circuit_breaker::CircuitBreakerConfig;
use crate::services::provider::ProviderConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Ops server bind address (health and metrics)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for classification records
    pub database_url: String,

    /// Redis connection string for the job queue and completion channel
    pub redis_url: String,

    /// Redis connection string for the result cache; defaults to `redis_url`
    pub cache_url: Option<String>,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Key prefix for every queue structure in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// How long a dequeued job stays leased before it counts as stalled
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,

    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Pub/sub channel for completion events
    #[serde(default = "default_completion_channel")]
    pub completion_channel: String,

    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_open_timeout_ms")]
    pub breaker_open_timeout_ms: u64,

    /// Primary LLM completion endpoint
    pub primary_provider_url: String,
    pub primary_provider_model: String,
    pub primary_provider_api_key: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub primary_provider_timeout_ms: u64,

    /// Fallback LLM completion endpoint
    pub fallback_provider_url: String,
    pub fallback_provider_model: String,
    pub fallback_provider_api_key: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub fallback_provider_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_queue_prefix() -> String {
    "inbox_triage".to_string()
}

fn default_lease_ms() -> u64 {
    60_000
}

fn default_idle_delay_ms() -> u64 {
    100
}

fn default_metrics_interval_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

fn default_completion_channel() -> String {
    "inbox_triage:completed".to_string()
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_open_timeout_ms() -> u64 {
    60_000
}

fn default_provider_timeout_ms() -> u64 {
    5_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn cache_url(&self) -> &str {
        self.cache_url.as_deref().unwrap_or(&self.redis_url)
    }

    pub fn primary_provider(&self) -> ProviderConfig {
        ProviderConfig {
            name: "primary".to_string(),
            url: self.primary_provider_url.clone(),
            model: self.primary_provider_model.clone(),
            api_key: self.primary_provider_api_key.clone(),
            timeout: Duration::from_millis(self.primary_provider_timeout_ms),
        }
    }

    pub fn fallback_provider(&self) -> ProviderConfig {
        ProviderConfig {
            name: "fallback".to_string(),
            url: self.fallback_provider_url.clone(),
            model: self.fallback_provider_model.clone(),
            api_key: self.fallback_provider_api_key.clone(),
            timeout: Duration::from_millis(self.fallback_provider_timeout_ms),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            open_timeout: Duration::from_millis(self.breaker_open_timeout_ms),
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
