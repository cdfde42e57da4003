//! Job implementations and the dispatcher that runs them by name
//!
//! [`TaskManager`] owns one handler per area (usage, alerting, billing,
//! sessions, housekeeping, reports, extensions) and routes a [`Job`] to it.

mod billing;
mod extensions;
mod housekeeping;
mod reports;
mod sessions;

use std::sync::Arc;

use chrono::Utc;

pub use billing::BillingJobs;
pub use extensions::{average_installs, is_trending, ExtensionTagger};
pub use housekeeping::Housekeeping;
pub use reports::{ReportAudience, ReportJobs};
pub use sessions::{finished_sessions, generate_salt, SessionJobs};

use crate::alerting::{AlertEvaluator, AlertRepository, NotificationSender, TelegramSender};
use crate::analytics::{AnalyticsStore, ClickHouseStore};
use crate::config::Config;
use crate::db::{
    AccountStore, AlertStore, CacheStore, Database, ExtensionRepository, ExtensionStore,
    ProjectRepository, ProjectStore, TelegramOutbox, UserRepository,
};
use crate::error::Result;
use crate::mailer::Mailer;
use crate::models::ReportFrequency;
use crate::scheduler::Job;
use crate::usage::UsageMonitor;

/// Everything the jobs read from and write to
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub extensions: Arc<dyn ExtensionStore>,
    pub cache: Arc<dyn CacheStore>,
    pub outbox: Arc<dyn TelegramOutbox>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub mailer: Arc<dyn Mailer>,
}

impl Stores {
    /// Production stores over PostgreSQL, Redis and ClickHouse
    pub fn new(database: &Database, analytics: ClickHouseStore, mailer: Arc<dyn Mailer>) -> Self {
        let redis = Arc::new(database.redis.clone());

        Self {
            accounts: Arc::new(UserRepository::new(&database.postgres)),
            projects: Arc::new(ProjectRepository::new(&database.postgres)),
            alerts: Arc::new(AlertRepository::new(database.postgres.pool().clone())),
            extensions: Arc::new(ExtensionRepository::new(&database.postgres)),
            cache: redis.clone(),
            outbox: redis,
            analytics: Arc::new(analytics),
            mailer,
        }
    }
}

/// Runs jobs by name
pub struct TaskManager {
    usage: UsageMonitor,
    alerts: AlertEvaluator,
    telegram: TelegramSender,
    billing: BillingJobs,
    sessions: SessionJobs,
    housekeeping: Housekeeping,
    reports: ReportJobs,
    extensions: ExtensionTagger,
}

impl TaskManager {
    /// Wire every job handler to the stores
    pub fn new(stores: Stores, config: &Config) -> Result<Self> {
        let timeout = config.integrations.http_timeout;

        let notifier = NotificationSender::new(stores.outbox.clone(), timeout)?;
        let alerts = AlertEvaluator::new(
            stores.alerts.clone(),
            stores.projects.clone(),
            stores.analytics.clone(),
            stores.mailer.clone(),
            notifier,
            config.alerting.cooldown,
            config.alerting.online_window,
        )?;

        let telegram = TelegramSender::new(
            stores.outbox.clone(),
            config.integrations.telegram_api_url.clone(),
            config.integrations.telegram_bot_token.clone(),
            config.scheduler.telegram_batch_size,
            timeout,
        )?;

        Ok(Self {
            usage: UsageMonitor::new(
                stores.accounts.clone(),
                stores.analytics.clone(),
                stores.cache.clone(),
                stores.mailer.clone(),
                config.usage.clone(),
            ),
            alerts,
            telegram,
            billing: BillingJobs::new(
                stores.accounts.clone(),
                stores.cache.clone(),
                stores.mailer.clone(),
                config.trials.clone(),
                config.usage.billing_url.clone(),
            ),
            sessions: SessionJobs::new(
                stores.cache.clone(),
                stores.analytics.clone(),
                config.sessions.clone(),
            ),
            housekeeping: Housekeeping::new(
                stores.accounts.clone(),
                stores.projects.clone(),
                stores.analytics.clone(),
                config.housekeeping.clone(),
            ),
            reports: ReportJobs::new(
                stores.accounts.clone(),
                stores.projects.clone(),
                stores.analytics.clone(),
                stores.mailer.clone(),
                config.reports.clone(),
            ),
            extensions: ExtensionTagger::new(
                stores.extensions,
                config.housekeeping.new_extension_period,
            ),
        })
    }

    /// Run one job now; returns how many records it acted on
    pub async fn run(&self, job: Job) -> Result<usize> {
        use ReportAudience::{Owners, Subscribers};
        use ReportFrequency::{Monthly, Quarterly, Weekly};

        let now = Utc::now();

        match job {
            Job::CheckPlanUsage => self.usage.check_plan_usage(now).await,
            Job::LockDashboards => self.usage.lock_dashboards(now).await,
            Job::CheckLeftEvents => self.usage.check_left_events(now).await,
            Job::CheckOnlineUsersAlerts => self
                .alerts
                .check_online_users_alerts(now)
                .await
                .map(|summary| summary.triggered),
            Job::CheckMetricAlerts => self
                .alerts
                .check_metric_alerts(now)
                .await
                .map(|summary| summary.triggered),
            Job::FlushTelegramOutbox => self.telegram.flush().await.map(|summary| summary.sent),
            Job::TrialReminder => self.billing.trial_reminder(now).await,
            Job::TrialEnd => self.billing.trial_end(now).await,
            Job::FixMissingTrialEndDates => self.billing.fix_missing_trial_end_dates().await,
            Job::CleanUpCancelledSubscriptions => {
                self.billing.clean_up_cancelled_subscriptions(now).await
            }
            Job::ProcessSessionDurations => self.sessions.process_session_durations(now).await,
            Job::CleanUpSessions => self.sessions.clean_up_sessions(now).await,
            Job::GenerateSessionSalt => self.sessions.generate_session_salt().await,
            Job::DeleteOldShareInvitations => {
                self.housekeeping.delete_old_share_invitations(now).await
            }
            Job::DeleteOldRefreshTokens => self.housekeeping.delete_old_refresh_tokens(now).await,
            Job::ClearUnconfirmedTelegramChats => {
                self.housekeeping.clear_unconfirmed_telegram_chats().await
            }
            Job::DisableReportsForInactiveUsers => {
                self.housekeeping.disable_reports_for_inactive_users(now).await
            }
            Job::SendWeeklyReports => self.reports.send_reports(Owners, Weekly, now).await,
            Job::SendMonthlyReports => self.reports.send_reports(Owners, Monthly, now).await,
            Job::SendQuarterlyReports => self.reports.send_reports(Owners, Quarterly, now).await,
            Job::SendWeeklySubscriberReports => {
                self.reports.send_reports(Subscribers, Weekly, now).await
            }
            Job::SendMonthlySubscriberReports => {
                self.reports.send_reports(Subscribers, Monthly, now).await
            }
            Job::SendQuarterlySubscriberReports => {
                self.reports.send_reports(Subscribers, Quarterly, now).await
            }
            Job::DropAnalyticsLogs => self.housekeeping.drop_analytics_logs().await,
            Job::TagNewExtensions => self.extensions.tag_new_extensions(now).await,
            Job::TagTrendingExtensions => self.extensions.tag_trending_extensions(now).await,
        }
    }
}
