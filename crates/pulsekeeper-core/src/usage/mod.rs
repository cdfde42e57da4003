//! Plan usage enforcement
//!
//! Three daily jobs share this module:
//!
//! - [`UsageMonitor::check_plan_usage`] emails accounts that go over their plan
//! - [`UsageMonitor::lock_dashboards`] blocks accounts that did not upgrade in time
//! - [`UsageMonitor::check_left_events`] warns accounts close to their monthly limit

mod limits;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, error, info};

pub use limits::{
    exceeds_plan, month_start, previous_month_start, usage_by_user, users_exceeding_continuously,
    users_exceeding_plan,
};

use crate::analytics::{AnalyticsStore, UsageRequest};
use crate::config::UsageConfig;
use crate::db::{AccountStore, CacheStore};
use crate::error::Result;
use crate::mailer::{Letter, Mailer};
use crate::models::{DashboardBlockReason, PlanCode, User};

/// Enforces monthly event limits
pub struct UsageMonitor {
    accounts: Arc<dyn AccountStore>,
    analytics: Arc<dyn AnalyticsStore>,
    cache: Arc<dyn CacheStore>,
    mailer: Arc<dyn Mailer>,
    config: UsageConfig,
}

impl UsageMonitor {
    /// Create a new usage monitor
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        analytics: Arc<dyn AnalyticsStore>,
        cache: Arc<dyn CacheStore>,
        mailer: Arc<dyn Mailer>,
        config: UsageConfig,
    ) -> Self {
        Self {
            accounts,
            analytics,
            cache,
            mailer,
            config,
        }
    }

    /// Contact paid accounts that spiked above their plan this month or went
    /// over it two months in a row. Returns how many were contacted.
    pub async fn check_plan_usage(&self, now: DateTime<Utc>) -> Result<usize> {
        let users: Vec<User> = self
            .accounts
            .users_for_usage_check()
            .await?
            .into_iter()
            .filter(User::has_projects)
            .collect();

        if users.is_empty() {
            debug!("No accounts to check for plan usage");
            return Ok(0);
        }

        let this_month_start = month_start(now);
        let this_month = usage_by_user(
            &self
                .analytics
                .plan_usage(&usage_requests(users.iter(), |_| this_month_start))
                .await?,
        );

        let spiking = users_exceeding_plan(&users, &this_month, self.config.allowed_exceed);
        let mut contacted = self
            .settle(spiking.iter().map(|(user, usage)| {
                let letter = self.over_limit_letter(user.plan_code, true, *usage, None);
                self.contact(user, letter, now)
            }))
            .await;

        let spiking_ids: HashSet<_> = spiking.iter().map(|(user, _)| user.id).collect();
        let remaining: Vec<&User> = users.iter().filter(|u| !spiking_ids.contains(&u.id)).collect();
        if !remaining.is_empty() {
            contacted += self.contact_continuous(&remaining, &this_month, now).await?;
        }

        info!(checked = users.len(), contacted, "Checked plan usage");
        Ok(contacted)
    }

    /// Contact accounts over their limit both this month and last month
    async fn contact_continuous(
        &self,
        users: &[&User],
        this_month: &HashMap<String, u64>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        // Counted from the previous month start, so this month is subtracted back out
        let previous_start = previous_month_start(now);
        let since_previous = usage_by_user(
            &self
                .analytics
                .plan_usage(&usage_requests(users.iter().copied(), |_| previous_start))
                .await?,
        );
        let last_month = since_previous
            .iter()
            .map(|(id, count)| {
                let this = this_month.get(id).copied().unwrap_or_default();
                (id.clone(), count.saturating_sub(this))
            })
            .collect();

        let continuous = users_exceeding_continuously(users, this_month, &last_month);
        Ok(self
            .settle(continuous.iter().map(|(user, this, last)| {
                let letter = self.over_limit_letter(user.plan_code, false, *this, Some(*last));
                self.contact(user, letter, now)
            }))
            .await)
    }

    /// Block dashboards of contacted accounts whose upgrade period ran out.
    /// Returns how many were blocked.
    pub async fn lock_dashboards(&self, now: DateTime<Utc>) -> Result<usize> {
        let grace = Duration::days(i64::from(self.config.upgrade_period_days));
        let users: Vec<User> = self
            .accounts
            .users_contacted_before(now - grace)
            .await?
            .into_iter()
            .filter(User::has_projects)
            .collect();

        if users.is_empty() {
            return Ok(0);
        }

        let usage = usage_by_user(
            &self
                .analytics
                .plan_usage(&usage_requests(users.iter(), |user| {
                    month_start(user.plan_exceed_contacted_at.unwrap_or(now))
                }))
                .await?,
        );
        let spiking: HashSet<_> = users_exceeding_plan(&users, &usage, self.config.allowed_exceed)
            .into_iter()
            .map(|(user, _)| user.id)
            .collect();

        let locked = self
            .settle(users.iter().map(|user| {
                let hit_percentage_limit = spiking.contains(&user.id);
                self.lock(user, hit_percentage_limit)
            }))
            .await;

        info!(candidates = users.len(), locked, "Locked dashboards");
        Ok(locked)
    }

    /// Warn accounts that used most of this month's events. Returns how many
    /// were warned.
    pub async fn check_left_events(&self, now: DateTime<Utc>) -> Result<usize> {
        let users = self.accounts.users_for_usage_warning(month_start(now)).await?;

        let candidates = users
            .iter()
            .filter(|user| user.has_projects() && user.plan_code.monthly_usage_limit() > 0);

        let warned = self
            .settle(candidates.map(|user| self.warn_if_running_out(user, now)))
            .await;

        info!(checked = users.len(), warned, "Checked remaining events");
        Ok(warned)
    }

    async fn contact(&self, user: &User, letter: Letter, now: DateTime<Utc>) -> Result<bool> {
        self.mailer.send(&user.email, &letter).await?;
        self.accounts.mark_plan_exceed_contacted(user.id, now).await?;
        Ok(true)
    }

    async fn lock(&self, user: &User, hit_percentage_limit: bool) -> Result<bool> {
        self.accounts
            .block_dashboard(user.id, DashboardBlockReason::ExceedingPlanLimits)
            .await?;

        let suggested_plan = user.plan_code.next_plan();
        let letter = Letter::DashboardLocked {
            plan: user.plan_code,
            hit_percentage_limit,
            percentage_limit: self.percentage_limit(),
            billing_url: self.config.billing_url.clone(),
            suggested_plan,
            suggested_plan_limit: suggested_plan.map(PlanCode::monthly_usage_limit),
        };
        self.mailer.send(&user.email, &letter).await?;
        Ok(true)
    }

    async fn warn_if_running_out(&self, user: &User, now: DateTime<Utc>) -> Result<bool> {
        let limit = user.plan_code.monthly_usage_limit();
        let used = self.cache.monthly_event_count(user.id).await?;
        let used_percentage = used as f64 * 100.0 / limit as f64;

        if used_percentage < self.config.warning_percentage {
            return Ok(false);
        }

        let letter = Letter::TierWarning {
            amount: self.config.warning_percentage.round() as u32,
            billing_url: self.config.billing_url.clone(),
        };
        self.mailer.send(&user.email, &letter).await?;
        self.accounts.mark_usage_warning_sent(user.id, now).await?;
        Ok(true)
    }

    fn over_limit_letter(
        &self,
        plan: PlanCode,
        hit_percentage_limit: bool,
        this_month_usage: u64,
        last_month_usage: Option<u64>,
    ) -> Letter {
        let suggested_plan = plan.next_plan();
        Letter::UsageOverLimit {
            plan,
            hit_percentage_limit,
            this_month_usage,
            last_month_usage,
            percentage_limit: self.percentage_limit(),
            upgrade_period_days: self.config.upgrade_period_days,
            billing_url: self.config.billing_url.clone(),
            suggested_plan,
            suggested_plan_limit: suggested_plan.map(PlanCode::monthly_usage_limit),
        }
    }

    fn percentage_limit(&self) -> u32 {
        (self.config.allowed_exceed * 100.0).round() as u32
    }

    /// Run per-account actions to completion, logging failures; returns how
    /// many reported `true`
    async fn settle<F>(&self, actions: impl Iterator<Item = F>) -> usize
    where
        F: std::future::Future<Output = Result<bool>>,
    {
        join_all(actions)
            .await
            .into_iter()
            .filter(|result| match result {
                Ok(done) => *done,
                Err(e) => {
                    error!(error = %e, "Usage action failed");
                    false
                }
            })
            .count()
    }
}

fn usage_requests<'a>(
    users: impl Iterator<Item = &'a User>,
    since: impl Fn(&User) -> DateTime<Utc>,
) -> Vec<UsageRequest> {
    users
        .map(|user| UsageRequest {
            user_id: user.id.to_string(),
            project_ids: user.project_ids.clone(),
            since: since(user),
        })
        .collect()
}
