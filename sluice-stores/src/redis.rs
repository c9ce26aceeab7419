// Copyright 2025 Sluice Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0


//! Redis-backed checkpoint and dead-letter stores for distributed deployments.
//!
//! # Features
//!
//! - **Connection Pooling**: Uses `deadpool-redis` for efficient connection management
//! - **Atomic Advance**: Checkpoints advance through a Lua compare-and-set, so
//!   two workers racing on one partition can never move it backwards
//! - **Retry Logic**: Automatic retries on transient connection failures
//! - **Dead-Letter TTL**: Optional expiration for dead-letter lists
//!
//! # Key Pattern
//!
//! ```text
//! {prefix}:checkpoint:{partition}          hash  { seq, updated_at }
//! {prefix}:dead_letter:{partition}         list  of JSON entries, oldest first
//! {prefix}:dead_letter_count:{ERROR_CODE}  counter
//! ```
//!
//! The default prefix is `sluice`. Sequence numbers are stored zero-padded to
//! a fixed width so the script can compare them as strings.
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice_stores::redis::{RedisCheckpointStore, RedisConfig};
//! use sluice_core::checkpoint::CheckpointStore;
//! use sluice_core::record::{PartitionId, SequenceNumber};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(10)
//!     .build()?;
//!
//! let store = RedisCheckpointStore::new(config).await?;
//!
//! let partition = PartitionId::new("shard-0");
//! store.advance(&partition, SequenceNumber::new(100)).await?;
//!
//! let checkpoint = store.get(&partition).await?;
//! assert_eq!(checkpoint.unwrap().last_processed_sequence, SequenceNumber::new(100));
//!
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::{AsyncCommands, RedisError, Script};
use sluice_core::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use sluice_core::dead_letter::{
    DeadLetterCounts, DeadLetterEntry, DeadLetterError, DeadLetterStore, ErrorCode,
};
use sluice_core::pipeline::ConfigError;
use sluice_core::record::{PartitionId, SequenceNumber};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default key prefix.
const DEFAULT_KEY_PREFIX: &str = "sluice";

/// Maximum number of retry attempts for transient Redis errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 100;

/// Upper bound for a single backoff delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Compare-and-set advance. Returns nil when the checkpoint moved, or the
/// stored sequence when it is already at or beyond the attempted one.
const ADVANCE_SCRIPT: &str = r"
local cur = redis.call('HGET', KEYS[1], 'seq')
if cur and cur >= ARGV[1] then
  return cur
end
redis.call('HSET', KEYS[1], 'seq', ARGV[1], 'updated_at', ARGV[2])
return false
";

/// Configuration for the Redis stores.
///
/// Use [`RedisConfigBuilder`] to construct this configuration with validation.
///
/// # Example
///
/// ```rust
/// use sluice_stores::redis::RedisConfig;
/// use std::time::Duration;
///
/// let config = RedisConfig::builder()
///     .url("redis://localhost:6379")
///     .pool_size(15)
///     .dead_letter_ttl(Duration::from_secs(14 * 24 * 60 * 60))
///     .build()
///     .expect("valid config");
/// ```
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Connection pool size (default: 10)
    ///
    /// Each partition worker holds at most one connection at a time.
    pub pool_size: usize,

    /// Prefix for every key written by the stores (default: "sluice")
    pub key_prefix: String,

    /// Optional TTL for dead-letter lists
    ///
    /// Checkpoints never expire: an expired checkpoint would replay the
    /// partition from the beginning of the stream.
    pub dead_letter_ttl: Option<Duration>,

    /// Connection timeout (default: 5 seconds)
    pub connection_timeout: Duration,

    /// Maximum number of retries for transient errors (default: 3)
    pub max_retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            dead_letter_ttl: None,
            connection_timeout: Duration::from_secs(5),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RedisConfig {
    /// Creates a new builder for `RedisConfig`.
    #[must_use]
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    fn checkpoint_key(&self, partition: &PartitionId) -> String {
        format!("{}:checkpoint:{}", self.key_prefix, partition)
    }

    fn dead_letter_key(&self, partition: &PartitionId) -> String {
        format!("{}:dead_letter:{}", self.key_prefix, partition)
    }

    fn dead_letter_count_key(&self, code: ErrorCode) -> String {
        format!("{}:dead_letter_count:{}", self.key_prefix, code)
    }
}

/// Builder for [`RedisConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    pool_size: Option<usize>,
    key_prefix: Option<String>,
    dead_letter_ttl: Option<Duration>,
    connection_timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl RedisConfigBuilder {
    /// Creates a new `RedisConfigBuilder`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the Redis connection URL.
    ///
    /// # Formats
    ///
    /// - Standalone: `redis://localhost:6379`
    /// - With auth: `redis://:password@localhost:6379`
    /// - With database: `redis://localhost:6379/0`
    /// - TLS: `rediss://localhost:6380`
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the connection pool size.
    ///
    /// Default: 10
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the key prefix.
    ///
    /// Default: "sluice"
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Sets the TTL for dead-letter lists.
    #[must_use]
    pub fn dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.dead_letter_ttl = Some(ttl);
        self
    }

    /// Sets the connection timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of retries for transient errors.
    ///
    /// Default: 3
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the `RedisConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - URL is not provided
    /// - Pool size is 0
    /// - Key prefix is empty
    /// - Dead-letter TTL is shorter than one second
    pub fn build(self) -> Result<RedisConfig, ConfigError> {
        let url = self.url.ok_or(ConfigError::Missing { field: "url" })?;

        let pool_size = self.pool_size.unwrap_or(10);
        if pool_size == 0 {
            return Err(ConfigError::invalid("pool_size", "must be greater than 0"));
        }

        let key_prefix = self
            .key_prefix
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        if key_prefix.is_empty() {
            return Err(ConfigError::invalid("key_prefix", "must not be empty"));
        }

        if self.dead_letter_ttl.is_some_and(|ttl| ttl.as_secs() == 0) {
            return Err(ConfigError::invalid(
                "dead_letter_ttl",
                "must be at least one second",
            ));
        }

        Ok(RedisConfig {
            url,
            pool_size,
            key_prefix,
            dead_letter_ttl: self.dead_letter_ttl,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(5)),
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
        })
    }
}

/// Pooled connection with retry, shared by both stores.
#[derive(Clone)]
struct RedisClient {
    pool: Pool,
    config: RedisConfig,
}

impl RedisClient {
    async fn connect(config: RedisConfig) -> Result<Self, RedisError> {
        debug!(url = %config.url, pool_size = config.pool_size, "Initializing Redis connection pool");

        let mut pool_config = PoolConfig::from_url(&config.url);
        if let Some(pool) = pool_config.pool.as_mut() {
            pool.max_size = config.pool_size;
            pool.timeouts.wait = Some(config.connection_timeout);
            pool.timeouts.create = Some(config.connection_timeout);
            pool.timeouts.recycle = Some(config.connection_timeout);
        } else {
            let mut pool = deadpool_redis::PoolConfig::new(config.pool_size);
            pool.timeouts.wait = Some(config.connection_timeout);
            pool.timeouts.create = Some(config.connection_timeout);
            pool.timeouts.recycle = Some(config.connection_timeout);
            pool_config.pool = Some(pool);
        }

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                error!(error = %e, "Failed to create Redis connection pool");
                RedisError::from((
                    redis::ErrorKind::InvalidClientConfig,
                    "Failed to create pool",
                    e.to_string(),
                ))
            })?;

        let mut conn = Self::connection(&pool).await?;
        redis::cmd("PING").query_async::<()>(&mut *conn).await?;

        debug!("Redis connection pool initialized");
        Ok(Self { pool, config })
    }

    async fn connection(pool: &Pool) -> Result<Connection, RedisError> {
        pool.get().await.map_err(|e| {
            RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get connection from pool",
                e.to_string(),
            ))
        })
    }

    /// Executes a Redis operation with retry logic for transient errors.
    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T, RedisError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::is_retryable(&e) && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = retry_delay(retries);
                    warn!(
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(retries, error = %e, "Redis operation failed");
                    return Err(e);
                }
            }
        }
    }

    /// Determines if a Redis error is retryable.
    fn is_retryable(error: &RedisError) -> bool {
        error.is_timeout()
            || error.is_connection_dropped()
            || matches!(
                error.kind(),
                redis::ErrorKind::IoError
                    | redis::ErrorKind::TryAgain
                    | redis::ErrorKind::BusyLoadingError
                    | redis::ErrorKind::ClusterDown
                    | redis::ErrorKind::MasterDown
            )
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, RedisError> {
        let pool = &self.pool;
        let mut keys: Vec<String> = self
            .with_retry(|| async {
                let mut conn = Self::connection(pool).await?;
                redis::cmd("KEYS").arg(pattern).query_async(&mut *conn).await
            })
            .await?;
        keys.sort();
        Ok(keys)
    }
}

fn checkpoint_error(e: &RedisError) -> CheckpointError {
    CheckpointError::Connection(format!("Redis operation failed: {e}"))
}

fn dead_letter_error(e: &RedisError) -> DeadLetterError {
    DeadLetterError::Connection(format!("Redis operation failed: {e}"))
}

/// Redis-backed checkpoint store.
///
/// `RedisCheckpointStore` is `Send + Sync` and cheap to clone; clones share
/// the connection pool.
#[derive(Clone)]
pub struct RedisCheckpointStore {
    client: RedisClient,
    advance_script: Script,
}

impl RedisCheckpointStore {
    /// Connects to Redis and verifies connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or the server does not
    /// answer `PING`.
    pub async fn new(config: RedisConfig) -> Result<Self, CheckpointError> {
        let client = RedisClient::connect(config)
            .await
            .map_err(|e| checkpoint_error(&e))?;
        Ok(Self {
            client,
            advance_script: Script::new(ADVANCE_SCRIPT),
        })
    }

    fn parse_checkpoint(
        partition: PartitionId,
        seq: &str,
        updated_at: Option<&str>,
    ) -> Result<Checkpoint, CheckpointError> {
        let sequence: SequenceNumber = seq.parse().map_err(|e| {
            CheckpointError::Serialization(format!("bad stored sequence for {partition}: {e}"))
        })?;

        let updated_at = match updated_at {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| {
                    CheckpointError::Serialization(format!(
                        "bad stored timestamp for {partition}: {e}"
                    ))
                })?
                .with_timezone(&Utc),
            None => Utc::now(),
        };

        Ok(Checkpoint {
            partition_id: partition,
            last_processed_sequence: sequence,
            updated_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, partition: &PartitionId) -> Result<Option<Checkpoint>, CheckpointError> {
        let key = self.client.config.checkpoint_key(partition);
        let pool = &self.client.pool;

        let (seq, updated_at): (Option<String>, Option<String>) = self
            .client
            .with_retry(|| async {
                let mut conn = RedisClient::connection(pool).await?;
                redis::cmd("HMGET")
                    .arg(&key)
                    .arg("seq")
                    .arg("updated_at")
                    .query_async(&mut *conn)
                    .await
            })
            .await
            .map_err(|e| checkpoint_error(&e))?;

        match seq {
            Some(seq) => {
                let checkpoint =
                    Self::parse_checkpoint(partition.clone(), &seq, updated_at.as_deref())?;
                debug!(
                    partition = %partition,
                    sequence = %checkpoint.last_processed_sequence,
                    "Retrieved checkpoint from Redis"
                );
                Ok(Some(checkpoint))
            }
            None => {
                debug!(partition = %partition, "No checkpoint found in Redis");
                Ok(None)
            }
        }
    }

    async fn advance(
        &self,
        partition: &PartitionId,
        sequence: SequenceNumber,
    ) -> Result<Checkpoint, CheckpointError> {
        let key = self.client.config.checkpoint_key(partition);
        let padded = sequence.to_padded();
        let checkpoint = Checkpoint::new(partition.clone(), sequence);
        let updated_at = checkpoint
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let pool = &self.client.pool;
        let script = &self.advance_script;

        let stored: Option<String> = self
            .client
            .with_retry(|| async {
                let mut conn = RedisClient::connection(pool).await?;
                script
                    .key(&key)
                    .arg(&padded)
                    .arg(&updated_at)
                    .invoke_async(&mut *conn)
                    .await
            })
            .await
            .map_err(|e| checkpoint_error(&e))?;

        match stored {
            None => {
                debug!(partition = %partition, sequence = %sequence, "Advanced checkpoint in Redis");
                Ok(checkpoint)
            }
            Some(current) => {
                let current: SequenceNumber = current.parse().map_err(|e| {
                    CheckpointError::Serialization(format!(
                        "bad stored sequence for {partition}: {e}"
                    ))
                })?;
                Err(CheckpointError::conflict(partition, current, sequence))
            }
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let prefix = format!("{}:checkpoint:", self.client.config.key_prefix);
        let keys = self
            .client
            .keys(&format!("{prefix}*"))
            .await
            .map_err(|e| checkpoint_error(&e))?;

        let mut checkpoints = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(partition) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(checkpoint) = self.get(&PartitionId::new(partition)).await? {
                checkpoints.push(checkpoint);
            }
        }

        debug!(count = checkpoints.len(), "Listed checkpoints from Redis");
        Ok(checkpoints)
    }

    async fn delete(&self, partition: &PartitionId) -> Result<(), CheckpointError> {
        let key = self.client.config.checkpoint_key(partition);
        let pool = &self.client.pool;

        let removed: u64 = self
            .client
            .with_retry(|| async {
                let mut conn = RedisClient::connection(pool).await?;
                conn.del(&key).await
            })
            .await
            .map_err(|e| checkpoint_error(&e))?;

        if removed == 0 {
            warn!(partition = %partition, "Attempted to delete non-existent checkpoint");
        } else {
            debug!(partition = %partition, "Deleted checkpoint from Redis");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        debug!("Closing Redis checkpoint store");
        self.client.pool.close();
        Ok(())
    }
}

/// Redis-backed dead-letter store.
///
/// Each entry is appended to its partition's list and the per-code counter is
/// incremented in the same `MULTI` transaction.
#[derive(Clone)]
pub struct RedisDeadLetterStore {
    client: RedisClient,
}

impl RedisDeadLetterStore {
    /// Connects to Redis and verifies connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or the server does not
    /// answer `PING`.
    pub async fn new(config: RedisConfig) -> Result<Self, DeadLetterError> {
        let client = RedisClient::connect(config)
            .await
            .map_err(|e| dead_letter_error(&e))?;
        Ok(Self { client })
    }

    /// Reads the lifetime dead-letter counters.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis cannot be reached.
    pub async fn counts(&self) -> Result<DeadLetterCounts, DeadLetterError> {
        let keys: Vec<String> = ErrorCode::ALL
            .iter()
            .map(|code| self.client.config.dead_letter_count_key(*code))
            .collect();
        let pool = &self.client.pool;

        let values: Vec<Option<u64>> = self
            .client
            .with_retry(|| async {
                let mut conn = RedisClient::connection(pool).await?;
                redis::cmd("MGET").arg(&keys).query_async(&mut *conn).await
            })
            .await
            .map_err(|e| dead_letter_error(&e))?;

        let value = |code: ErrorCode| {
            ErrorCode::ALL
                .iter()
                .position(|c| *c == code)
                .and_then(|i| values.get(i).copied().flatten())
                .unwrap_or(0)
        };

        Ok(DeadLetterCounts {
            parse_error: value(ErrorCode::ParseError),
            validation_error: value(ErrorCode::ValidationError),
            transformation_error: value(ErrorCode::TransformationError),
            publish_error: value(ErrorCode::PublishError),
        })
    }

    async fn read_list(&self, key: &str) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let pool = &self.client.pool;
        let raw: Vec<Vec<u8>> = self
            .client
            .with_retry(|| async {
                let mut conn = RedisClient::connection(pool).await?;
                conn.lrange(key, 0, -1).await
            })
            .await
            .map_err(|e| dead_letter_error(&e))?;

        raw.iter()
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|e| {
                    DeadLetterError::Serialization(format!(
                        "Failed to deserialize dead-letter entry: {e}"
                    ))
                })
            })
            .collect()
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    async fn store(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let config = &self.client.config;
        let list_key = config.dead_letter_key(&entry.partition_id);
        let count_key = config.dead_letter_count_key(entry.error_code());
        let payload = entry.to_json_bytes()?;
        let ttl = config.dead_letter_ttl;
        let pool = &self.client.pool;

        self.client
            .with_retry::<_, (), _>(|| async {
                let mut conn = RedisClient::connection(pool).await?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .rpush(&list_key, &payload)
                    .ignore()
                    .incr(&count_key, 1)
                    .ignore();
                if let Some(ttl) = ttl {
                    let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
                    pipe.expire(&list_key, secs).ignore();
                }
                pipe.query_async(&mut *conn).await
            })
            .await
            .map_err(|e| dead_letter_error(&e))?;

        debug!(
            partition = %entry.partition_id,
            sequence = %entry.sequence_number,
            error_code = %entry.error_code(),
            "Stored dead-letter entry in Redis"
        );
        Ok(())
    }

    async fn list(
        &self,
        partition: Option<&PartitionId>,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        if let Some(partition) = partition {
            return self
                .read_list(&self.client.config.dead_letter_key(partition))
                .await;
        }

        let pattern = format!("{}:dead_letter:*", self.client.config.key_prefix);
        let keys = self
            .client
            .keys(&pattern)
            .await
            .map_err(|e| dead_letter_error(&e))?;

        let mut entries = Vec::new();
        for key in keys {
            entries.extend(self.read_list(&key).await?);
        }
        Ok(entries)
    }

    async fn close(&self) -> Result<(), DeadLetterError> {
        debug!("Closing Redis dead-letter store");
        self.client.pool.close();
        Ok(())
    }
}

/// Exponential backoff for the `retry`-th retry (1-based), capped at
/// [`MAX_RETRY_DELAY`].
fn retry_delay(retry: u32) -> Duration {
    let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
    Duration::from_millis(BASE_RETRY_DELAY_MS.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}
