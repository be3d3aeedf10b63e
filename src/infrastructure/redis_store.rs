//! Redis-backed counter store.
//!
//! Lets several serving instances share one admission budget per key.
//!
//! ## Atomicity
//!
//! Each increment runs a short Lua script on the server:
//!
//! ```text
//! INCR key
//! if the result is 1 or the key has no expiry: PEXPIRE key window
//! return count, PTTL key
//! ```
//!
//! Redis runs scripts without interleaving other commands, so two racing
//! increments can never both see an empty counter and the expiry is only
//! written when a window opens. The `ttl < 0` branch also gives an expiry
//! back to a key that has none.
//!
//! ## Failures
//!
//! Connection problems and timeouts surface as `StoreError::Unavailable`;
//! the admission gate turns them into degraded admissions. Connecting is
//! bounded by `connect_timeout`, since the connection manager otherwise keeps
//! retrying with backoff.
//!
//! ## Prefix resets
//!
//! `reset_prefix` walks the keyspace with `SCAN ... MATCH prefix*` and
//! deletes each batch. Glob metacharacters in the prefix are escaped.

use crate::application::ports::{CounterReading, CounterStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;

const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

const SCAN_BATCH: u64 = 500;

/// Configuration for the Redis counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCounterStoreConfig {
    /// Upper bound on establishing the connection (default: 5 seconds)
    pub connect_timeout: Duration,
    /// Upper bound on a single round trip (default: 1 second)
    pub operation_timeout: Duration,
}

impl Default for RedisCounterStoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(1),
        }
    }
}

/// Fixed-window counters stored in Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Script,
    config: RedisCounterStoreConfig,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect with default configuration.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisCounterStoreConfig::default()).await
    }

    /// Connect with custom configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid, the connection fails or it is
    /// not established within `connect_timeout`.
    pub async fn connect_with_config(
        url: &str,
        config: RedisCounterStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connecting = ConnectionManager::new(client);
        let connection = match tokio::time::timeout(config.connect_timeout, connecting).await {
            Ok(connection) => connection?,
            Err(_) => {
                return Err(RedisError::from((
                    ErrorKind::IoError,
                    "timed out connecting to redis",
                )))
            }
        };
        Ok(Self::from_connection(connection, config))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager, config: RedisCounterStoreConfig) -> Self {
        Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
            config,
        }
    }

    async fn with_timeout<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result.map_err(store_error),
            Err(_) => Err(StoreError::Unavailable(format!(
                "no reply within {:?}",
                self.config.operation_timeout
            ))),
        }
    }
}

fn store_error(error: RedisError) -> StoreError {
    if error.is_io_error()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        StoreError::Unavailable(error.to_string())
    } else {
        StoreError::Backend(error.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterReading, StoreError> {
        let window_ms = u64::try_from(window.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let mut connection = self.connection.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(window_ms);
        let (count, ttl_ms): (i64, i64) = self
            .with_timeout(invocation.invoke_async(&mut connection))
            .await?;

        let count = u64::try_from(count)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| StoreError::InvalidReply(format!("count {}", count)))?;
        let ttl_ms = u64::try_from(ttl_ms)
            .map_err(|_| StoreError::InvalidReply(format!("ttl {}", ttl_ms)))?;

        Ok(CounterReading {
            count,
            ttl: Duration::from_millis(ttl_ms),
        })
    }

    async fn reset(&self, key: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let deleted: i64 = self.with_timeout(connection.del(key)).await?;
        Ok(deleted > 0)
    }

    async fn reset_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut connection = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let mut scan = redis::cmd("SCAN");
            scan.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, keys): (u64, Vec<String>) =
                self.with_timeout(scan.query_async(&mut connection)).await?;

            if !keys.is_empty() {
                let deleted: u64 = self.with_timeout(connection.del(&keys)).await?;
                removed += deleted;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
