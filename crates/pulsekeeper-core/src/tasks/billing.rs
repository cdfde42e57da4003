//! Trial lifecycle and cancelled subscriptions

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{error, info};

use crate::config::TrialsConfig;
use crate::db::{AccountStore, CacheStore};
use crate::error::{Error, Result};
use crate::mailer::{Letter, Mailer};
use crate::models::User;

/// Jobs that move accounts between plans
pub struct BillingJobs {
    accounts: Arc<dyn AccountStore>,
    cache: Arc<dyn CacheStore>,
    mailer: Arc<dyn Mailer>,
    trials: TrialsConfig,
    billing_url: String,
}

impl BillingJobs {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        cache: Arc<dyn CacheStore>,
        mailer: Arc<dyn Mailer>,
        trials: TrialsConfig,
        billing_url: String,
    ) -> Self {
        Self {
            accounts,
            cache,
            mailer,
            trials,
            billing_url,
        }
    }

    /// Remind trial users whose trial ends within the reminder window
    pub async fn trial_reminder(&self, now: DateTime<Utc>) -> Result<usize> {
        let window = Duration::from_std(self.trials.reminder_window)
            .map_err(|e| Error::config(format!("trial reminder window: {e}")))?;
        let users = self.accounts.trials_ending_between(now, now + window).await?;

        let reminded = settle(
            "trial_reminder",
            users.iter().map(|user| async move {
                self.accounts.mark_trial_reminder_sent(user.id).await?;
                let letter = Letter::TrialEndsTomorrow {
                    billing_url: self.billing_url.clone(),
                };
                self.mailer.send(&user.email, &letter).await
            }),
        )
        .await;

        info!(reminded, "Sent trial reminders");
        Ok(reminded)
    }

    /// Move expired trials to no plan and block their dashboards
    pub async fn trial_end(&self, now: DateTime<Utc>) -> Result<usize> {
        let users = self.accounts.expired_trials(now).await?;

        let ended = settle(
            "trial_end",
            users.iter().map(|user| async move {
                self.accounts.end_trial(user.id).await?;
                let letter = Letter::TrialExpired {
                    billing_url: self.billing_url.clone(),
                };
                self.mailer.send(&user.email, &letter).await?;
                self.cache.clear_project_cache(&user.project_ids).await
            }),
        )
        .await;

        info!(ended, "Ended expired trials");
        Ok(ended)
    }

    /// Give trials without an end date one based on their sign-up time
    pub async fn fix_missing_trial_end_dates(&self) -> Result<usize> {
        let users = self.accounts.trials_missing_end_date().await?;
        let duration = Duration::days(i64::from(self.trials.duration_days));

        let fixed = settle(
            "fix_missing_trial_end_dates",
            users.iter().map(|user| async move {
                self.accounts
                    .set_trial_end_date(user.id, trial_end_date(user, duration))
                    .await
            }),
        )
        .await;

        if fixed > 0 {
            info!(fixed, "Filled in missing trial end dates");
        }
        Ok(fixed)
    }

    /// Drop accounts whose cancellation took effect to no plan
    pub async fn clean_up_cancelled_subscriptions(&self, now: DateTime<Utc>) -> Result<usize> {
        let users = self.accounts.cancellations_due(now).await?;

        let expired = settle(
            "clean_up_cancelled_subscriptions",
            users.iter().filter_map(|user| {
                let cancelled_at = user.cancellation_effective_date?;
                Some(async move {
                    self.accounts.expire_subscription(user.id, cancelled_at).await?;
                    self.cache.clear_project_cache(&user.project_ids).await
                })
            }),
        )
        .await;

        info!(expired, "Cleaned up cancelled subscriptions");
        Ok(expired)
    }
}

fn trial_end_date(user: &User, duration: Duration) -> DateTime<Utc> {
    user.created_at + duration
}

/// Await per-account actions, logging failures; returns how many succeeded
async fn settle<F>(job: &'static str, actions: impl Iterator<Item = F>) -> usize
where
    F: std::future::Future<Output = Result<()>>,
{
    join_all(actions)
        .await
        .into_iter()
        .filter(|result| match result {
            Ok(()) => true,
            Err(e) => {
                error!(job, error = %e, "Account update failed");
                false
            }
        })
        .count()
}
