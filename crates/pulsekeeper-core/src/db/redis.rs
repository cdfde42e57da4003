//! Redis connection, shared cache entries and the Telegram outbox

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as RedisConfig, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

use super::{CacheStore, SessionTimestamps, TelegramOutbox};
use crate::alerting::TelegramMessage;
use crate::config::RedisConfig as AppRedisConfig;
use crate::error::{Error, Result};

/// Prefix of per-user monthly event counters maintained by the ingestion API
const MONTHLY_COUNT_PREFIX: &str = "ev_count:";

/// Prefix of cached project settings
const PROJECT_CACHE_PREFIX: &str = "pid_";

/// Pattern of session duration entries (`sd:{sid}` -> `{start_ms}:{last_ms}`)
const SESSION_PATTERN: &str = "sd:*";

/// Salt used to derive session ids
pub const SESSION_SALT_KEY: &str = "session_salt";

/// List holding queued Telegram messages
const TELEGRAM_OUTBOX_KEY: &str = "telegram:outbox";

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
}

impl RedisPool {
    /// Create a new Redis connection pool
    pub fn new(config: &AppRedisConfig) -> Result<Self> {
        let mut cfg = RedisConfig::from_url(&config.url);
        cfg.pool = Some(PoolConfig::new(config.max_connections));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Pool(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl CacheStore for RedisPool {
    async fn monthly_event_count(&self, user_id: Uuid) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let count: Option<u64> = conn.get(format!("{MONTHLY_COUNT_PREFIX}{user_id}")).await?;
        Ok(count.unwrap_or(0))
    }

    async fn clear_project_cache(&self, project_ids: &[String]) -> Result<()> {
        if project_ids.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = project_ids
            .iter()
            .map(|pid| format!("{PROJECT_CACHE_PREFIX}{pid}"))
            .collect();

        let mut conn = self.pool.get().await?;
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn session_timestamps(&self) -> Result<Vec<SessionTimestamps>> {
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(SESSION_PATTERN)
            .query_async(&mut conn)
            .await?;

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let sessions = keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| {
                // Entries can expire between KEYS and MGET
                let value = value?;
                let parsed = parse_session_entry(&key, &value);
                if parsed.is_none() {
                    warn!(key = %key, value = %value, "Skipping malformed session entry");
                }
                parsed
            })
            .collect();

        Ok(sessions)
    }

    async fn remove_sessions(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get().await?;
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn set_session_salt(&self, salt: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(SESSION_SALT_KEY, salt, ttl.as_secs()).await?;
        Ok(())
    }
}

#[async_trait]
impl TelegramOutbox for RedisPool {
    async fn enqueue(&self, message: &TelegramMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.rpush(TELEGRAM_OUTBOX_KEY, payload).await?;
        Ok(())
    }

    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<TelegramMessage>> {
        let Some(count) = NonZeroUsize::new(limit) else {
            return Ok(Vec::new());
        };

        let mut conn = self.pool.get().await?;
        let payloads: Vec<String> = conn.lpop(TELEGRAM_OUTBOX_KEY, Some(count)).await?;

        Ok(payloads
            .into_iter()
            .filter_map(|payload| match serde_json::from_str(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Dropping unreadable Telegram message");
                    None
                }
            })
            .collect())
    }
}

/// Parse a `sd:{sid}` entry holding `{start_ms}:{last_ms}`
fn parse_session_entry(key: &str, value: &str) -> Option<SessionTimestamps> {
    let sid = key.strip_prefix("sd:")?;
    let (start, last) = value.split_once(':')?;

    Some(SessionTimestamps {
        key: key.to_string(),
        sid: sid.to_string(),
        started_ms: start.parse().ok()?,
        last_ms: last.parse().ok()?,
    })
}
