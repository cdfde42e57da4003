//! Periodic cleanup of expired records

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::analytics::{ActivityTable, AnalyticsStore};
use crate::config::HousekeepingConfig;
use crate::db::{AccountStore, ProjectStore};
use crate::error::{Error, Result};
use crate::models::User;

pub struct Housekeeping {
    accounts: Arc<dyn AccountStore>,
    projects: Arc<dyn ProjectStore>,
    analytics: Arc<dyn AnalyticsStore>,
    config: HousekeepingConfig,
}

impl Housekeeping {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        projects: Arc<dyn ProjectStore>,
        analytics: Arc<dyn AnalyticsStore>,
        config: HousekeepingConfig,
    ) -> Self {
        Self {
            accounts,
            projects,
            analytics,
            config,
        }
    }

    /// Delete unanswered share invitations
    pub async fn delete_old_share_invitations(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = now - to_chrono(self.config.invite_expiry, "invite expiry")?;
        let deleted = self.projects.delete_expired_share_invitations(before).await?;
        debug!(deleted, "Deleted expired share invitations");
        Ok(to_count(deleted))
    }

    /// Delete refresh tokens past their lifetime
    pub async fn delete_old_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = now - to_chrono(self.config.refresh_token_lifetime, "refresh token lifetime")?;
        let deleted = self.accounts.delete_refresh_tokens_before(before).await?;
        info!(deleted, "Deleted old refresh tokens");
        Ok(to_count(deleted))
    }

    /// Forget Telegram chats that were never confirmed
    pub async fn clear_unconfirmed_telegram_chats(&self) -> Result<usize> {
        let cleared = self.accounts.clear_unconfirmed_telegram_chats().await?;
        debug!(cleared, "Cleared unconfirmed Telegram chats");
        Ok(to_count(cleared))
    }

    /// Turn off email reports for accounts without any recent activity
    pub async fn disable_reports_for_inactive_users(&self, now: DateTime<Utc>) -> Result<usize> {
        let since = now - to_chrono(self.config.report_inactivity, "report inactivity")?;
        let users = self.accounts.users_receiving_reports().await?;

        let results = join_all(
            users
                .iter()
                .filter(|user| user.has_projects())
                .map(|user| self.disable_if_inactive(user, since, now)),
        )
        .await;

        let mut disabled = 0;
        for result in results {
            match result {
                Ok(true) => disabled += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "Error checking account activity"),
            }
        }

        info!(disabled, "Disabled reports for inactive accounts");
        Ok(disabled)
    }

    /// Drop the analytics server's own log tables
    pub async fn drop_analytics_logs(&self) -> Result<usize> {
        let failed = self.analytics.drop_system_logs().await?;
        if failed > 0 {
            warn!(failed, "Some analytics log tables could not be dropped");
        }
        Ok(failed)
    }

    async fn disable_if_inactive(
        &self,
        user: &User,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        // Stop at the first table with activity
        for table in ActivityTable::ALL {
            let count = self
                .analytics
                .activity_count(table, &user.project_ids, from, to)
                .await?;
            if count > 0 {
                return Ok(false);
            }
        }

        self.accounts.disable_reports(user.id).await?;
        debug!(user_id = %user.id, "Disabled reports for inactive account");
        Ok(true)
    }
}

fn to_chrono(duration: std::time::Duration, name: &str) -> Result<Duration> {
    Duration::from_std(duration).map_err(|e| Error::config(format!("{name}: {e}")))
}

fn to_count(rows: u64) -> usize {
    usize::try_from(rows).unwrap_or(usize::MAX)
}
