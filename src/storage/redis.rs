// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis buffer backend.
//!
//! Each item is a sorted set keyed by its locator. The score is the caller's
//! order key; the member is a zero-padded per-item sequence number followed by
//! the chunk:
//!
//! ```text
//! ZADD {prefix}buf:{locator} 1.0 "00000000000000000001|this is the first log"
//! ```
//!
//! Redis orders equal scores lexicographically by member, so the sequence
//! prefix keeps arrival order for ties and stops identical chunks from
//! collapsing into one member. The sequence counter lives at
//! `{prefix}seq:{locator}`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client};
use serde::Deserialize;

use super::traits::{BufferBackend, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

const SEQ_WIDTH: usize = 20;

/// Connection parameters for [`RedisBuffer`].
#[derive(Debug, Clone, Deserialize)]
pub struct RedisBufferConfig {
    /// e.g. `redis://:password@localhost:6379`
    pub url: String,
    /// Namespace prepended to every key
    #[serde(default)]
    pub prefix: Option<String>,
    /// Expire buffered items this many seconds after their last append
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

pub struct RedisBuffer {
    connection: ConnectionManager,
    prefix: String,
    ttl_secs: Option<u64>,
}

impl RedisBuffer {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::connect(&RedisBufferConfig {
            url: connection_string.to_string(),
            prefix: None,
            ttl_secs: None,
        })
        .await
    }

    pub async fn connect(config: &RedisBufferConfig) -> Result<Self, StorageError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StorageError::Config(format!("invalid redis url: {}", e)))?;

        // Startup preset: fail fast on a wrong address instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Config(format!("redis unreachable: {}", e)))?;

        Ok(Self {
            connection,
            prefix: config.prefix.clone().unwrap_or_default(),
            ttl_secs: config.ttl_secs,
        })
    }

    fn set_key(&self, locator: &str) -> String {
        format!("{}buf:{}", self.prefix, locator)
    }

    fn seq_key(&self, locator: &str) -> String {
        format!("{}seq:{}", self.prefix, locator)
    }
}

fn encode_member(seq: u64, chunk: &str) -> String {
    format!("{:0width$}|{}", seq, chunk, width = SEQ_WIDTH)
}

fn decode_member(member: &str) -> Result<String, StorageError> {
    member
        .split_once('|')
        .map(|(_, chunk)| chunk.to_string())
        .ok_or_else(|| StorageError::Integrity(format!("malformed buffer member '{}'", member)))
}

#[async_trait]
impl BufferBackend for RedisBuffer {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn add(&self, locator: &str, order_key: f64, chunk: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let set_key = self.set_key(locator);
        let seq_key = self.seq_key(locator);
        let ttl = self.ttl_secs;

        // INCR runs once per chunk; only the ZADD below is retried.
        let seq: u64 = {
            let mut conn = conn.clone();
            cmd("INCR")
                .arg(&seq_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };
        let member = encode_member(seq, chunk);

        retry("redis_buffer_add", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let set_key = set_key.clone();
            let seq_key = seq_key.clone();
            let member = member.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.cmd("ZADD").arg(&set_key).arg(order_key).arg(&member);
                if let Some(ttl) = ttl {
                    pipeline.expire(&set_key, ttl as i64);
                    pipeline.expire(&seq_key, ttl as i64);
                }
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn chunks(&self, locator: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        let set_key = self.set_key(locator);

        let members: Vec<String> = retry("redis_buffer_range", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = set_key.clone();
            async move {
                let members: Vec<String> = cmd("ZRANGE").arg(&key).arg(0).arg(-1).query_async(&mut conn).await?;
                Ok(members)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        members.iter().map(|m| decode_member(m)).collect()
    }

    async fn exists(&self, locator: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let set_key = self.set_key(locator);

        retry("redis_buffer_exists", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = set_key.clone();
            async move {
                let exists: bool = cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
                Ok(exists)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn remove(&self, locator: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let set_key = self.set_key(locator);
        let seq_key = self.seq_key(locator);

        retry("redis_buffer_remove", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let set_key = set_key.clone();
            let seq_key = seq_key.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.del(&set_key).del(&seq_key);
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_encoding_sorts_by_sequence() {
        let a = encode_member(9, "z");
        let b = encode_member(10, "a");
        assert!(a < b, "zero padding keeps numeric order under lexicographic compare");
        assert_eq!(decode_member(&a).unwrap(), "z");
    }

    #[test]
    fn test_member_keeps_separator_in_chunk() {
        let m = encode_member(1, "a|b|c");
        assert_eq!(decode_member(&m).unwrap(), "a|b|c");
    }

    #[test]
    fn test_malformed_member_is_integrity_error() {
        assert!(decode_member("no-separator").unwrap_err().is_integrity());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: RedisBufferConfig = serde_json::from_value(serde_json::json!({"url": "redis://localhost"})).unwrap();
        assert_eq!(cfg.url, "redis://localhost");
        assert!(cfg.prefix.is_none());
        assert!(cfg.ttl_secs.is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let err = RedisBuffer::new("not a url").await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
