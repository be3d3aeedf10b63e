//! TOML configuration for a serving context.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! [admission]
//! max_requests = 50
//! window_seconds = 300
//! key_prefix = "rate_limit:"
//! sweep_interval_seconds = 60
//!
//! [[admission.rules]]
//! pattern = "/api/auth/login"
//! max_requests = 5
//! window_seconds = 300
//!
//! [admission.tiers.premium]
//! max_requests = 5000
//! window_seconds = 3600
//!
//! [admission.ip]
//! max_requests = 1000
//! window_seconds = 3600
//!
//! [cache]
//! default_ttl_seconds = 300
//! sweep_interval_seconds = 60
//!
//! [breaker]
//! failure_threshold = 5
//! recovery_timeout_seconds = 30
//!
//! [thresholds]
//! min_confidence = 0.6
//!
//! [redis]
//! url = "redis://127.0.0.1/"
//! connect_timeout_ms = 5000
//! operation_timeout_ms = 1000
//! ```

use crate::application::admission::{AdmissionGate, AdmissionGateBuilder, DEFAULT_KEY_PREFIX};
use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::error::BuildError;
use crate::application::ports::{Clock, CounterStore};
use crate::application::service::ServingContext;
use crate::domain::prediction::ThresholdFilter;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::memory_store::InMemoryCounterStore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Error loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Values parse but describe an unusable setup
    #[error(transparent)]
    Build(#[from] BuildError),
    /// A Redis URL was given but this build cannot use it
    #[error("counter store unusable: {0}")]
    Store(String),
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServingConfig {
    /// Admission limits
    pub admission: AdmissionConfig,
    /// Feature cache settings
    pub cache: CacheConfig,
    /// Counter store circuit breaker
    pub breaker: BreakerConfig,
    /// Default result thresholds
    pub thresholds: ThresholdFilter,
    /// Shared counter store
    pub redis: RedisConfig,
}

/// `[admission]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    pub max_requests: u64,
    pub window_seconds: u64,
    pub key_prefix: String,
    /// Period for dropping elapsed in-memory counters; ignored with Redis
    pub sweep_interval_seconds: Option<u64>,
    /// Per-endpoint overrides
    pub rules: Vec<EndpointRuleConfig>,
    /// Default limits per caller tier
    pub tiers: BTreeMap<String, LimitConfig>,
    /// Additional limit per source IP
    pub ip: Option<LimitConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_seconds: 300,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            sweep_interval_seconds: None,
            rules: Vec::new(),
            tiers: BTreeMap::new(),
            ip: None,
        }
    }
}

/// A limit without a pattern, used for tiers and the IP rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    pub max_requests: u64,
    pub window_seconds: u64,
}

impl LimitConfig {
    fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// One `[[admission.rules]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointRuleConfig {
    /// Exact path, or prefix ending in `*`
    pub pattern: String,
    pub max_requests: u64,
    pub window_seconds: u64,
}

/// `[cache]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
    /// Background sweep period; lazy eviction only when unset
    pub sweep_interval_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            sweep_interval_seconds: None,
        }
    }
}

/// `[breaker]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 30,
        }
    }
}

impl From<&BreakerConfig> for CircuitBreakerConfig {
    fn from(config: &BreakerConfig) -> Self {
        CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_seconds),
        }
    }
}

/// `[redis]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    /// Connection URL; the in-memory store is used when unset
    pub url: Option<String>,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_ms: 5_000,
            operation_timeout_ms: 1_000,
        }
    }
}

impl ServingConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed TOML and
    /// `ConfigError::Build` for values no component accepts.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: ServingConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check the values without building anything long-lived.
    ///
    /// # Errors
    /// Returns the first `BuildError` a component would raise.
    pub fn validate(&self) -> Result<(), BuildError> {
        self.gate_builder().build()?;
        if self.cache.default_ttl_seconds == 0 {
            return Err(BuildError::ZeroDefaultTtl);
        }
        if self.cache.sweep_interval_seconds == Some(0)
            || self.admission.sweep_interval_seconds == Some(0)
        {
            return Err(BuildError::ZeroSweepInterval);
        }
        Ok(())
    }

    /// Default entry TTL for the feature cache.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_seconds)
    }

    /// An admission gate builder carrying these limits, key prefix and
    /// breaker settings.
    pub fn gate_builder(&self) -> AdmissionGateBuilder {
        let admission = &self.admission;
        let mut builder = AdmissionGate::builder()
            .with_limit(
                admission.max_requests,
                Duration::from_secs(admission.window_seconds),
            )
            .with_key_prefix(admission.key_prefix.clone())
            .with_circuit_breaker(CircuitBreakerConfig::from(&self.breaker));

        for rule in &admission.rules {
            builder = builder.with_endpoint_rule(
                rule.pattern.clone(),
                rule.max_requests,
                Duration::from_secs(rule.window_seconds),
            );
        }
        for (tier, limit) in &admission.tiers {
            builder = builder.with_tier_limit(tier.clone(), limit.max_requests, limit.window());
        }
        if let Some(limit) = &admission.ip {
            builder = builder.with_ip_limit(limit.max_requests, limit.window());
        }
        builder
    }
}

impl ServingContext {
    /// Build a context from configuration, connecting to Redis when a URL
    /// is configured and starting the sweepers whose intervals are set.
    ///
    /// An unreachable Redis does not fail startup: a warning is logged and
    /// the process falls back to in-memory counters, enforcing limits per
    /// instance only.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid, or a Redis URL
    /// is configured in a build without the `redis-storage` feature.
    pub async fn from_config(config: &ServingConfig) -> Result<Self, ConfigError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let (store, memory) = match connect_store(config).await? {
            Some(store) => (store, None),
            None => {
                info!("using in-memory counter store");
                let memory = InMemoryCounterStore::new(Arc::clone(&clock));
                let store: Arc<dyn CounterStore> = Arc::new(memory.clone());
                (store, Some(memory))
            }
        };

        let context = Self::from_config_with(config, store, clock)?;
        if let (Some(memory), Some(seconds)) = (memory, config.admission.sweep_interval_seconds) {
            context.start_counter_sweeper(&memory, Duration::from_secs(seconds))?;
        }
        Ok(context)
    }

    /// Build a context from configuration with an explicit store and clock.
    ///
    /// Starts the cache sweeper when an interval is configured, which needs
    /// a Tokio runtime.
    ///
    /// # Errors
    /// Returns `ConfigError::Build` if the configuration is invalid.
    pub fn from_config_with(
        config: &ServingConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let context = ServingContext::from_parts(
            config.gate_builder().with_store(store),
            config.cache_ttl(),
            config.thresholds,
            clock,
        )?;

        if let Some(seconds) = config.cache.sweep_interval_seconds {
            context.start_cache_sweeper(Duration::from_secs(seconds))?;
        }
        Ok(context)
    }
}

/// The shared store for `config`, or `None` when counters stay in memory.
#[cfg(feature = "redis-storage")]
async fn connect_store(
    config: &ServingConfig,
) -> Result<Option<Arc<dyn CounterStore>>, ConfigError> {
    use crate::infrastructure::redis_store::{RedisCounterStore, RedisCounterStoreConfig};

    let Some(url) = &config.redis.url else {
        return Ok(None);
    };
    let store_config = RedisCounterStoreConfig {
        connect_timeout: Duration::from_millis(config.redis.connect_timeout_ms),
        operation_timeout: Duration::from_millis(config.redis.operation_timeout_ms),
    };
    match RedisCounterStore::connect_with_config(url, store_config).await {
        Ok(store) => {
            info!("using redis counter store");
            Ok(Some(Arc::new(store)))
        }
        Err(error) => {
            warn!(
                error = %error,
                degraded = true,
                "redis unreachable, falling back to per-instance counters"
            );
            Ok(None)
        }
    }
}

#[cfg(not(feature = "redis-storage"))]
async fn connect_store(
    config: &ServingConfig,
) -> Result<Option<Arc<dyn CounterStore>>, ConfigError> {
    if config.redis.url.is_some() {
        return Err(ConfigError::Store(
            "redis url configured but the `redis-storage` feature is disabled".to_string(),
        ));
    }
    Ok(None)
}
