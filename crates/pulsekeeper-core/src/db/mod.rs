//! Database layer for Pulsekeeper
//!
//! Account, project and extension state lives in PostgreSQL; counters,
//! session entries and the Telegram outbox live in Redis. Jobs only see the
//! store traits below.

mod postgres;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use self::postgres::{ExtensionRepository, PostgresPool, ProjectRepository, UserRepository};
pub use self::redis::RedisPool;

use crate::alerting::TelegramMessage;
use crate::config::Config;
use crate::error::Result;
use crate::models::{
    Alert, AlertScope, DashboardBlockReason, Extension, Project, ReportFrequency, ReportRecipient,
    User,
};

/// Account queries and updates used by the scheduled jobs
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Active paid users that were never contacted about overage
    async fn users_for_usage_check(&self) -> Result<Vec<User>>;

    /// Active paid users contacted about overage at or before `before` and not yet blocked
    async fn users_contacted_before(&self, before: DateTime<Utc>) -> Result<Vec<User>>;

    /// Active users with a plan that were not warned since `month_start`
    async fn users_for_usage_warning(&self, month_start: DateTime<Utc>) -> Result<Vec<User>>;

    /// Record that the user was told about exceeding the plan
    async fn mark_plan_exceed_contacted(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Block the user's dashboard
    async fn block_dashboard(&self, user_id: Uuid, reason: DashboardBlockReason) -> Result<()>;

    /// Record that the usage warning was sent
    async fn mark_usage_warning_sent(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Trial users whose trial ends within `[from, to]` and who were not reminded
    async fn trials_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<User>>;

    /// Record that the trial reminder was sent
    async fn mark_trial_reminder_sent(&self, user_id: Uuid) -> Result<()>;

    /// Trial users whose trial ended before `now` or has no end date
    async fn expired_trials(&self, now: DateTime<Utc>) -> Result<Vec<User>>;

    /// Drop the user to no plan and block the dashboard as trial ended
    async fn end_trial(&self, user_id: Uuid) -> Result<()>;

    /// Trial users without an end date
    async fn trials_missing_end_date(&self) -> Result<Vec<User>>;

    /// Set the trial end date
    async fn set_trial_end_date(&self, user_id: Uuid, end: DateTime<Utc>) -> Result<()>;

    /// Users whose cancellation took effect at or before `now`
    async fn cancellations_due(&self, now: DateTime<Utc>) -> Result<Vec<User>>;

    /// Reset billing state after a cancellation took effect
    async fn expire_subscription(&self, user_id: Uuid, cancelled_at: DateTime<Utc>)
        -> Result<()>;

    /// Forget Telegram chats that were never confirmed
    async fn clear_unconfirmed_telegram_chats(&self) -> Result<u64>;

    /// Users with email reports enabled
    async fn users_receiving_reports(&self) -> Result<Vec<User>>;

    /// Turn off email reports
    async fn disable_reports(&self, user_id: Uuid) -> Result<()>;

    /// Owners with a plan and an unblocked dashboard who get reports this often,
    /// each with every project they own
    async fn report_recipients(&self, frequency: ReportFrequency) -> Result<Vec<ReportRecipient>>;

    /// Delete refresh tokens created before `before`
    async fn delete_refresh_tokens_before(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Project queries used for alert delivery and cleanup
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Projects whose admin has a plan and an unblocked dashboard
    async fn projects_with_active_admin(&self) -> Result<Vec<Project>>;

    /// Clear the URL of a webhook that failed
    async fn disable_webhook(&self, webhook_id: Uuid) -> Result<()>;

    /// Delete share invitations and their action tokens created before `before`
    async fn delete_expired_share_invitations(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Confirmed project subscribers who get reports this often
    async fn report_subscribers(&self, frequency: ReportFrequency) -> Result<Vec<ReportRecipient>>;
}

/// Alert queries
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Active alerts of the given projects within a scope
    async fn active_alerts(&self, project_ids: &[String], scope: AlertScope) -> Result<Vec<Alert>>;

    /// Record a notification
    async fn mark_triggered(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// Marketplace extension queries
#[async_trait]
pub trait ExtensionStore: Send + Sync {
    /// Extensions created after `since`
    async fn created_after(&self, since: DateTime<Utc>) -> Result<Vec<Extension>>;

    /// Extensions created before `before` that carry `tag`
    async fn tagged_created_before(&self, tag: &str, before: DateTime<Utc>)
        -> Result<Vec<Extension>>;

    /// Persist the tag list
    async fn save_tags(&self, extension_id: Uuid, tags: &[String]) -> Result<()>;

    /// Installs in total, or up to `before` when given
    async fn install_count(
        &self,
        extension_id: Uuid,
        before: Option<DateTime<Utc>>,
    ) -> Result<u64>;
}

/// Start and last-activity timestamps of a tracked session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimestamps {
    /// Cache key holding the entry
    pub key: String,
    /// Session id
    pub sid: String,
    /// First hit, unix millis
    pub started_ms: i64,
    /// Last hit, unix millis
    pub last_ms: i64,
}

/// Cache entries shared with the ingestion API
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Events counted for the user in the current month
    async fn monthly_event_count(&self, user_id: Uuid) -> Result<u64>;

    /// Drop cached project settings so the API reloads them
    async fn clear_project_cache(&self, project_ids: &[String]) -> Result<()>;

    /// All tracked sessions
    async fn session_timestamps(&self) -> Result<Vec<SessionTimestamps>>;

    /// Remove session entries
    async fn remove_sessions(&self, keys: &[String]) -> Result<()>;

    /// Replace the salt used to derive session ids
    async fn set_session_salt(&self, salt: &str, ttl: Duration) -> Result<()>;
}

/// Queue of Telegram messages waiting to be sent
#[async_trait]
pub trait TelegramOutbox: Send + Sync {
    /// Queue a message
    async fn enqueue(&self, message: &TelegramMessage) -> Result<()>;

    /// Take up to `limit` messages, oldest first
    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<TelegramMessage>>;
}

/// Database connections bundle
#[derive(Clone)]
pub struct Database {
    /// PostgreSQL connection pool
    pub postgres: PostgresPool,
    /// Redis connection pool
    pub redis: RedisPool,
}

impl Database {
    /// Create a new database connection bundle
    pub async fn new(config: &Config) -> Result<Self> {
        let postgres = PostgresPool::new(&config.database).await?;
        let redis = RedisPool::new(&config.redis)?;

        Ok(Self { postgres, redis })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        self.postgres.migrate().await
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        self.postgres.health_check().await?;
        self.redis.health_check().await?;
        Ok(())
    }
}
