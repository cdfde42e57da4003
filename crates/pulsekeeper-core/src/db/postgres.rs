//! PostgreSQL connection and account/project queries

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::warn;
use uuid::Uuid;

use super::{AccountStore, ExtensionStore, ProjectStore};
use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::models::{
    DashboardBlockReason, Extension, PlanCode, Project, ProjectAdmin, ReportFrequency,
    ReportProject, ReportRecipient, User, Webhook,
};

/// Action token type of a pending project share
const PROJECT_SHARE_ACTION: &str = "project_share";

/// Columns selected for every user query; `u` aliases `users`
const USER_COLUMNS: &str = r#"
    u.id, u.email, u.plan_code, u.is_active, u.dashboard_block_reason,
    u.plan_exceed_contacted_at, u.ev_warning_sent_on, u.is_account_billing_suspended,
    u.cancellation_effective_date, u.trial_end_date, u.trial_reminder_sent,
    u.report_frequency, u.telegram_chat_id, u.is_telegram_chat_id_confirmed, u.created_at,
    ARRAY(SELECT p.id FROM projects p WHERE p.admin_id = u.id ORDER BY p.created_at) AS project_ids
"#;

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Repository for account state
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    /// Create a new user repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }

    async fn fetch_users(&self, filter: &str, at: Option<DateTime<Utc>>) -> Result<Vec<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE {filter}");
        let mut query = sqlx::query_as::<_, UserRow>(&sql);
        if let Some(at) = at {
            query = query.bind(at);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl AccountStore for UserRepository {
    async fn users_for_usage_check(&self) -> Result<Vec<User>> {
        self.fetch_users(
            r#"u.is_active
                AND u.plan_code NOT IN ('none', 'trial')
                AND u.plan_exceed_contacted_at IS NULL
                AND u.dashboard_block_reason IS NULL
                AND NOT u.is_account_billing_suspended
                AND u.cancellation_effective_date IS NULL"#,
            None,
        )
        .await
    }

    async fn users_contacted_before(&self, before: DateTime<Utc>) -> Result<Vec<User>> {
        self.fetch_users(
            r#"u.is_active
                AND u.plan_code NOT IN ('none', 'trial')
                AND u.plan_exceed_contacted_at <= $1
                AND u.dashboard_block_reason IS NULL
                AND NOT u.is_account_billing_suspended
                AND u.cancellation_effective_date IS NULL"#,
            Some(before),
        )
        .await
    }

    async fn users_for_usage_warning(&self, month_start: DateTime<Utc>) -> Result<Vec<User>> {
        self.fetch_users(
            r#"u.is_active
                AND u.plan_code <> 'none'
                AND u.dashboard_block_reason IS NULL
                AND (u.ev_warning_sent_on IS NULL OR u.ev_warning_sent_on < $1)"#,
            Some(month_start),
        )
        .await
    }

    async fn mark_plan_exceed_contacted(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET plan_exceed_contacted_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn block_dashboard(&self, user_id: Uuid, reason: DashboardBlockReason) -> Result<()> {
        sqlx::query("UPDATE users SET dashboard_block_reason = $2 WHERE id = $1")
            .bind(user_id)
            .bind(reason.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_usage_warning_sent(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET ev_warning_sent_on = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn trials_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        let sql = format!(
            r#"SELECT {USER_COLUMNS} FROM users u
            WHERE u.plan_code = 'trial'
                AND u.trial_end_date BETWEEN $1 AND $2
                AND NOT u.trial_reminder_sent"#
        );
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_trial_reminder_sent(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET trial_reminder_sent = TRUE WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn expired_trials(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        self.fetch_users(
            "u.plan_code = 'trial' AND (u.trial_end_date < $1 OR u.trial_end_date IS NULL)",
            Some(now),
        )
        .await
    }

    async fn end_trial(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET plan_code = $2, dashboard_block_reason = $3 WHERE id = $1")
            .bind(user_id)
            .bind(PlanCode::None.as_str())
            .bind(DashboardBlockReason::TrialEnded.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn trials_missing_end_date(&self) -> Result<Vec<User>> {
        self.fetch_users("u.plan_code = 'trial' AND u.trial_end_date IS NULL", None)
            .await
    }

    async fn set_trial_end_date(&self, user_id: Uuid, end: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET trial_end_date = $2 WHERE id = $1")
            .bind(user_id)
            .bind(end)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancellations_due(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        self.fetch_users(
            "u.cancellation_effective_date IS NOT NULL AND u.cancellation_effective_date < $1",
            Some(now),
        )
        .await
    }

    async fn expire_subscription(
        &self,
        user_id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users SET
                cancellation_effective_date = NULL,
                plan_code = $2,
                dashboard_block_reason = $3,
                plan_exceed_contacted_at = $4,
                next_bill_date = NULL,
                sub_id = NULL,
                sub_update_url = NULL,
                sub_cancel_url = NULL,
                billing_frequency = 'monthly'
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(PlanCode::None.as_str())
        .bind(DashboardBlockReason::SubscriptionCancelled.as_str())
        .bind(cancelled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_unconfirmed_telegram_chats(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users SET telegram_chat_id = NULL
            WHERE NOT is_telegram_chat_id_confirmed AND telegram_chat_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn users_receiving_reports(&self) -> Result<Vec<User>> {
        self.fetch_users("u.report_frequency <> 'never'", None).await
    }

    async fn disable_reports(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET report_frequency = $2 WHERE id = $1")
            .bind(user_id)
            .bind(ReportFrequency::Never.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn report_recipients(&self, frequency: ReportFrequency) -> Result<Vec<ReportRecipient>> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT
                u.id, u.email, u.report_unsubscribe_token AS unsubscribe_token,
                ARRAY(SELECT p.id FROM projects p WHERE p.admin_id = u.id ORDER BY p.created_at)
                    AS project_ids,
                ARRAY(SELECT p.name FROM projects p WHERE p.admin_id = u.id ORDER BY p.created_at)
                    AS project_names
            FROM users u
            WHERE u.report_frequency = $1
                AND u.plan_code <> 'none'
                AND u.dashboard_block_reason IS NULL
            "#,
        )
        .bind(frequency.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_refresh_tokens_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Repository for projects and their notification settings
#[derive(Clone)]
pub struct ProjectRepository {
    pool: PgPool,
}

impl ProjectRepository {
    /// Create a new project repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }

    async fn webhooks_by_user(&self, user_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Webhook>>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, user_id, name, url FROM webhooks
            WHERE user_id = ANY($1)
            ORDER BY created_at
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<Webhook>> = HashMap::new();
        for row in rows {
            grouped.entry(row.user_id).or_default().push(Webhook {
                id: row.id,
                name: row.name,
                url: row.url,
            });
        }
        Ok(grouped)
    }
}

#[async_trait]
impl ProjectStore for ProjectRepository {
    async fn projects_with_active_admin(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT
                p.id, p.name, u.id AS admin_id, u.email AS admin_email,
                u.telegram_chat_id, u.is_telegram_chat_id_confirmed,
                u.slack_webhook_url, u.discord_webhook_url
            FROM projects p
            JOIN users u ON u.id = p.admin_id
            WHERE u.plan_code <> 'none' AND u.dashboard_block_reason IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut admin_ids: Vec<Uuid> = rows.iter().map(|r| r.admin_id).collect();
        admin_ids.sort_unstable();
        admin_ids.dedup();
        let webhooks = self.webhooks_by_user(&admin_ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let hooks = webhooks.get(&row.admin_id).cloned().unwrap_or_default();
                row.into_project(hooks)
            })
            .collect())
    }

    async fn disable_webhook(&self, webhook_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE webhooks SET url = NULL WHERE id = $1")
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_expired_share_invitations(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let tokens = sqlx::query("DELETE FROM action_tokens WHERE action = $1 AND created_at < $2")
            .bind(PROJECT_SHARE_ACTION)
            .bind(before)
            .execute(&mut *tx)
            .await?;

        let shares =
            sqlx::query("DELETE FROM project_shares WHERE NOT confirmed AND created_at < $1")
                .bind(before)
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(tokens.rows_affected() + shares.rows_affected())
    }

    async fn report_subscribers(&self, frequency: ReportFrequency) -> Result<Vec<ReportRecipient>> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT
                s.id, s.email, s.unsubscribe_token,
                ARRAY[p.id] AS project_ids, ARRAY[p.name] AS project_names
            FROM project_subscribers s
            JOIN projects p ON p.id = s.project_id
            WHERE s.report_frequency = $1 AND s.is_confirmed
            "#,
        )
        .bind(frequency.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Repository for marketplace extensions
#[derive(Clone)]
pub struct ExtensionRepository {
    pool: PgPool,
}

impl ExtensionRepository {
    /// Create a new extension repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }
}

#[async_trait]
impl ExtensionStore for ExtensionRepository {
    async fn created_after(&self, since: DateTime<Utc>) -> Result<Vec<Extension>> {
        let rows = sqlx::query_as::<_, ExtensionRow>(
            "SELECT id, name, tags, created_at FROM extensions WHERE created_at > $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn tagged_created_before(
        &self,
        tag: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<Extension>> {
        let rows = sqlx::query_as::<_, ExtensionRow>(
            r#"
            SELECT id, name, tags, created_at FROM extensions
            WHERE $1 = ANY(tags) AND created_at < $2
            "#,
        )
        .bind(tag)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_tags(&self, extension_id: Uuid, tags: &[String]) -> Result<()> {
        sqlx::query("UPDATE extensions SET tags = $2 WHERE id = $1")
            .bind(extension_id)
            .bind(tags)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn install_count(
        &self,
        extension_id: Uuid,
        before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM extension_installs
            WHERE extension_id = $1 AND ($2::timestamptz IS NULL OR created_at < $2)
            "#,
        )
        .bind(extension_id)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    plan_code: String,
    is_active: bool,
    dashboard_block_reason: Option<String>,
    plan_exceed_contacted_at: Option<DateTime<Utc>>,
    ev_warning_sent_on: Option<DateTime<Utc>>,
    is_account_billing_suspended: bool,
    cancellation_effective_date: Option<DateTime<Utc>>,
    trial_end_date: Option<DateTime<Utc>>,
    trial_reminder_sent: bool,
    report_frequency: String,
    telegram_chat_id: Option<String>,
    is_telegram_chat_id_confirmed: bool,
    created_at: DateTime<Utc>,
    project_ids: Vec<String>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let plan_code = row.plan_code.parse().unwrap_or_else(|_| {
            warn!(
                user_id = %row.id,
                plan_code = %row.plan_code,
                "Unknown plan code, treating as none"
            );
            PlanCode::None
        });

        // An unreadable reason still means the dashboard is blocked
        let dashboard_block_reason = row.dashboard_block_reason.map(|reason| {
            reason
                .parse()
                .unwrap_or(DashboardBlockReason::PaymentFailed)
        });

        User {
            id: row.id,
            email: row.email,
            plan_code,
            is_active: row.is_active,
            dashboard_block_reason,
            plan_exceed_contacted_at: row.plan_exceed_contacted_at,
            ev_warning_sent_on: row.ev_warning_sent_on,
            is_account_billing_suspended: row.is_account_billing_suspended,
            cancellation_effective_date: row.cancellation_effective_date,
            trial_end_date: row.trial_end_date,
            trial_reminder_sent: row.trial_reminder_sent,
            report_frequency: row.report_frequency.parse().unwrap_or_default(),
            telegram_chat_id: row.telegram_chat_id,
            is_telegram_chat_id_confirmed: row.is_telegram_chat_id_confirmed,
            created_at: row.created_at,
            project_ids: row.project_ids,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    admin_id: Uuid,
    admin_email: String,
    telegram_chat_id: Option<String>,
    is_telegram_chat_id_confirmed: bool,
    slack_webhook_url: Option<String>,
    discord_webhook_url: Option<String>,
}

impl ProjectRow {
    fn into_project(self, webhooks: Vec<Webhook>) -> Project {
        Project {
            id: self.id,
            name: self.name,
            admin: ProjectAdmin {
                id: self.admin_id,
                email: self.admin_email,
                telegram_chat_id: self.telegram_chat_id,
                is_telegram_chat_id_confirmed: self.is_telegram_chat_id_confirmed,
                slack_webhook_url: self.slack_webhook_url,
                discord_webhook_url: self.discord_webhook_url,
                webhooks,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecipientRow {
    id: Uuid,
    email: String,
    unsubscribe_token: Uuid,
    project_ids: Vec<String>,
    project_names: Vec<String>,
}

impl From<RecipientRow> for ReportRecipient {
    fn from(row: RecipientRow) -> Self {
        let projects = row
            .project_ids
            .into_iter()
            .zip(row.project_names)
            .map(|(id, name)| ReportProject { id, name })
            .collect();

        ReportRecipient {
            id: row.id,
            email: row.email,
            unsubscribe_token: row.unsubscribe_token,
            projects,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    url: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ExtensionRow {
    id: Uuid,
    name: String,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<ExtensionRow> for Extension {
    fn from(row: ExtensionRow) -> Self {
        Extension {
            id: row.id,
            name: row.name,
            tags: row.tags,
            created_at: row.created_at,
        }
    }
}
