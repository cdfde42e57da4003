//! Session bookkeeping: durations, stale ids and the id salt

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::{debug, info};

use crate::analytics::{AnalyticsStore, SessionDuration};
use crate::config::SessionsConfig;
use crate::db::{CacheStore, SessionTimestamps};
use crate::error::{Error, Result};

/// Random bytes in a session salt
const SALT_BYTES: usize = 16;

pub struct SessionJobs {
    cache: Arc<dyn CacheStore>,
    analytics: Arc<dyn AnalyticsStore>,
    config: SessionsConfig,
}

impl SessionJobs {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        analytics: Arc<dyn AnalyticsStore>,
        config: SessionsConfig,
    ) -> Self {
        Self {
            cache,
            analytics,
            config,
        }
    }

    /// Move idle sessions from the cache into the analytics store
    pub async fn process_session_durations(&self, now: DateTime<Utc>) -> Result<usize> {
        let sessions = self.cache.session_timestamps().await?;
        let idle_ms = i64::try_from(self.config.idle_timeout.as_millis())
            .map_err(|e| Error::config(format!("session idle timeout: {e}")))?;

        let (durations, keys) = finished_sessions(&sessions, now.timestamp_millis(), idle_ms);
        if durations.is_empty() {
            return Ok(0);
        }

        // Keys go first so a retry never counts a session twice
        self.cache.remove_sessions(&keys).await?;
        self.analytics.add_session_durations(&durations).await?;

        debug!(sessions = durations.len(), "Stored session durations");
        Ok(durations.len())
    }

    /// Strip session ids from analytics rows past the retention period
    pub async fn clean_up_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = Duration::from_std(self.config.sid_retention)
            .map_err(|e| Error::config(format!("session id retention: {e}")))?;

        self.analytics.clear_session_ids(now - retention).await?;
        info!("Cleared expired session ids");
        Ok(0)
    }

    /// Rotate the salt used to derive session ids
    pub async fn generate_session_salt(&self) -> Result<usize> {
        let salt = generate_salt();
        self.cache.set_session_salt(&salt, self.config.salt_ttl).await?;
        info!("Rotated session salt");
        Ok(1)
    }
}

/// Sessions idle for longer than `idle_ms`, with the cache keys to remove
pub fn finished_sessions(
    sessions: &[SessionTimestamps],
    now_ms: i64,
    idle_ms: i64,
) -> (Vec<SessionDuration>, Vec<String>) {
    sessions
        .iter()
        .filter(|s| now_ms - s.last_ms > idle_ms)
        .map(|s| {
            let seconds = (s.last_ms - s.started_ms).max(0) as f64 / 1000.0;
            (
                SessionDuration {
                    sid: s.sid.clone(),
                    seconds,
                },
                s.key.clone(),
            )
        })
        .unzip()
}

/// A fresh random salt, base64 encoded
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}
