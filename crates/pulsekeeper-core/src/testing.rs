//! In-memory stores for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::alerting::TelegramMessage;
use crate::analytics::{
    ActivityTable, AnalyticsStore, EventCountQuery, PlanUsage, ProjectSummary, SessionDuration,
    UsageRequest,
};
use crate::db::{
    AccountStore, AlertStore, CacheStore, ExtensionStore, ProjectStore, SessionTimestamps,
    TelegramOutbox,
};
use crate::error::{Error, Result};
use crate::mailer::{Letter, Mailer};
use crate::models::{
    Alert, AlertScope, DashboardBlockReason, Extension, PlanCode, Project, ReportFrequency,
    ReportProject, ReportRecipient, User,
};
use crate::tasks::Stores;

static NEXT_USER: AtomicUsize = AtomicUsize::new(1);

/// An active account on `plan` owning one project
pub fn user(plan: PlanCode) -> User {
    let n = NEXT_USER.fetch_add(1, Ordering::Relaxed);
    User {
        id: Uuid::new_v4(),
        email: format!("user{n}@example.com"),
        plan_code: plan,
        is_active: true,
        dashboard_block_reason: None,
        plan_exceed_contacted_at: None,
        ev_warning_sent_on: None,
        is_account_billing_suspended: false,
        cancellation_effective_date: None,
        trial_end_date: None,
        trial_reminder_sent: false,
        report_frequency: ReportFrequency::Never,
        telegram_chat_id: None,
        is_telegram_chat_id_confirmed: false,
        created_at: Utc::now(),
        project_ids: vec![format!("project-{n}")],
    }
}

/// Accounts kept in a map, filtered the way the SQL queries filter them
#[derive(Default)]
pub struct MemoryAccounts {
    users: Mutex<Vec<User>>,
    refresh_token_cutoffs: Mutex<Vec<DateTime<Utc>>>,
}

impl MemoryAccounts {
    pub fn new(users: Vec<User>) -> Self {
        Self {
            users: Mutex::new(users),
            ..Self::default()
        }
    }

    pub fn get(&self, id: Uuid) -> User {
        self.users
            .lock()
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("no user {id}"))
    }

    fn select(&self, filter: impl Fn(&User) -> bool) -> Vec<User> {
        self.users.lock().iter().filter(|u| filter(u)).cloned().collect()
    }

    fn update(&self, id: Uuid, change: impl FnOnce(&mut User)) -> Result<()> {
        let mut users = self.users.lock();
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| Error::not_found("user", id.to_string()))?;
        change(user);
        Ok(())
    }
}

fn is_billable(user: &User) -> bool {
    user.is_active
        && !matches!(user.plan_code, PlanCode::None | PlanCode::Trial)
        && user.dashboard_block_reason.is_none()
        && !user.is_account_billing_suspended
        && user.cancellation_effective_date.is_none()
}

#[async_trait]
impl AccountStore for MemoryAccounts {
    async fn users_for_usage_check(&self) -> Result<Vec<User>> {
        Ok(self.select(|u| is_billable(u) && u.plan_exceed_contacted_at.is_none()))
    }

    async fn users_contacted_before(&self, before: DateTime<Utc>) -> Result<Vec<User>> {
        Ok(self.select(|u| {
            is_billable(u) && u.plan_exceed_contacted_at.is_some_and(|at| at <= before)
        }))
    }

    async fn users_for_usage_warning(&self, month_start: DateTime<Utc>) -> Result<Vec<User>> {
        Ok(self.select(|u| {
            u.is_active
                && u.plan_code != PlanCode::None
                && u.dashboard_block_reason.is_none()
                && u.ev_warning_sent_on.map_or(true, |at| at < month_start)
        }))
    }

    async fn mark_plan_exceed_contacted(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update(user_id, |u| u.plan_exceed_contacted_at = Some(at))
    }

    async fn block_dashboard(&self, user_id: Uuid, reason: DashboardBlockReason) -> Result<()> {
        self.update(user_id, |u| u.dashboard_block_reason = Some(reason))
    }

    async fn mark_usage_warning_sent(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update(user_id, |u| u.ev_warning_sent_on = Some(at))
    }

    async fn trials_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        Ok(self.select(|u| {
            u.plan_code == PlanCode::Trial
                && !u.trial_reminder_sent
                && u.trial_end_date.is_some_and(|end| from <= end && end <= to)
        }))
    }

    async fn mark_trial_reminder_sent(&self, user_id: Uuid) -> Result<()> {
        self.update(user_id, |u| u.trial_reminder_sent = true)
    }

    async fn expired_trials(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        Ok(self.select(|u| {
            u.plan_code == PlanCode::Trial && u.trial_end_date.map_or(true, |end| end < now)
        }))
    }

    async fn end_trial(&self, user_id: Uuid) -> Result<()> {
        self.update(user_id, |u| {
            u.plan_code = PlanCode::None;
            u.dashboard_block_reason = Some(DashboardBlockReason::TrialEnded);
        })
    }

    async fn trials_missing_end_date(&self) -> Result<Vec<User>> {
        Ok(self.select(|u| u.plan_code == PlanCode::Trial && u.trial_end_date.is_none()))
    }

    async fn set_trial_end_date(&self, user_id: Uuid, end: DateTime<Utc>) -> Result<()> {
        self.update(user_id, |u| u.trial_end_date = Some(end))
    }

    async fn cancellations_due(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        Ok(self.select(|u| u.cancellation_effective_date.is_some_and(|at| at < now)))
    }

    async fn expire_subscription(
        &self,
        user_id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(user_id, |u| {
            u.cancellation_effective_date = None;
            u.plan_code = PlanCode::None;
            u.dashboard_block_reason = Some(DashboardBlockReason::SubscriptionCancelled);
            u.plan_exceed_contacted_at = Some(cancelled_at);
        })
    }

    async fn clear_unconfirmed_telegram_chats(&self) -> Result<u64> {
        let mut cleared = 0;
        for user in self.users.lock().iter_mut() {
            if !user.is_telegram_chat_id_confirmed && user.telegram_chat_id.is_some() {
                user.telegram_chat_id = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn users_receiving_reports(&self) -> Result<Vec<User>> {
        Ok(self.select(|u| u.report_frequency != ReportFrequency::Never))
    }

    async fn disable_reports(&self, user_id: Uuid) -> Result<()> {
        self.update(user_id, |u| u.report_frequency = ReportFrequency::Never)
    }

    async fn report_recipients(&self, frequency: ReportFrequency) -> Result<Vec<ReportRecipient>> {
        Ok(self
            .select(|u| {
                u.report_frequency == frequency
                    && u.plan_code != PlanCode::None
                    && u.dashboard_block_reason.is_none()
            })
            .into_iter()
            .map(|u| ReportRecipient {
                id: u.id,
                email: u.email,
                // The account id doubles as its unsubscribe token
                unsubscribe_token: u.id,
                projects: u
                    .project_ids
                    .into_iter()
                    .map(|id| ReportProject {
                        name: format!("Site {id}"),
                        id,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn delete_refresh_tokens_before(&self, before: DateTime<Utc>) -> Result<u64> {
        self.refresh_token_cutoffs.lock().push(before);
        Ok(0)
    }
}

#[derive(Default)]
pub struct MemoryProjects {
    projects: Mutex<Vec<Project>>,
    disabled: Mutex<Vec<Uuid>>,
    invitation_cutoffs: Mutex<Vec<DateTime<Utc>>>,
    subscribers: Mutex<Vec<(ReportFrequency, ReportRecipient)>>,
}

impl MemoryProjects {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects: Mutex::new(projects),
            ..Self::default()
        }
    }

    pub fn disabled_webhooks(&self) -> Vec<Uuid> {
        self.disabled.lock().clone()
    }

    pub fn invitation_cutoffs(&self) -> Vec<DateTime<Utc>> {
        self.invitation_cutoffs.lock().clone()
    }

    /// Confirmed subscriber getting reports at `frequency`
    pub fn add_subscriber(&self, frequency: ReportFrequency, subscriber: ReportRecipient) {
        self.subscribers.lock().push((frequency, subscriber));
    }
}

#[async_trait]
impl ProjectStore for MemoryProjects {
    async fn projects_with_active_admin(&self) -> Result<Vec<Project>> {
        Ok(self.projects.lock().clone())
    }

    async fn disable_webhook(&self, webhook_id: Uuid) -> Result<()> {
        for project in self.projects.lock().iter_mut() {
            for webhook in project.admin.webhooks.iter_mut() {
                if webhook.id == webhook_id {
                    webhook.url = None;
                }
            }
        }
        self.disabled.lock().push(webhook_id);
        Ok(())
    }

    async fn delete_expired_share_invitations(&self, before: DateTime<Utc>) -> Result<u64> {
        self.invitation_cutoffs.lock().push(before);
        Ok(0)
    }

    async fn report_subscribers(&self, frequency: ReportFrequency) -> Result<Vec<ReportRecipient>> {
        Ok(self
            .subscribers
            .lock()
            .iter()
            .filter(|(f, _)| *f == frequency)
            .map(|(_, subscriber)| subscriber.clone())
            .collect())
    }
}

pub struct MemoryAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlerts {
    pub fn new(alerts: Vec<Alert>) -> Self {
        Self {
            alerts: Mutex::new(alerts),
        }
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertStore for MemoryAlerts {
    async fn active_alerts(&self, project_ids: &[String], scope: AlertScope) -> Result<Vec<Alert>> {
        Ok(self
            .alerts
            .lock()
            .iter()
            .filter(|a| a.active && scope.includes(a.query_metric))
            .filter(|a| project_ids.contains(&a.project_id))
            .cloned()
            .collect())
    }

    async fn mark_triggered(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut alerts = self.alerts.lock();
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| Error::not_found("alert", alert_id.to_string()))?;
        alert.last_triggered = Some(at);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAnalytics {
    usage: Mutex<HashMap<(String, DateTime<Utc>), u64>>,
    online: Mutex<HashMap<String, u64>>,
    online_queries: Mutex<Vec<(String, DateTime<Utc>)>>,
    event_counts: Mutex<HashMap<String, u64>>,
    count_queries: Mutex<Vec<EventCountQuery>>,
    activity: Mutex<HashMap<(&'static str, String), u64>>,
    durations: Mutex<Vec<SessionDuration>>,
    summaries: Mutex<HashMap<String, ProjectSummary>>,
    summary_windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl MemoryAnalytics {
    /// Usage of an account counted from `since`
    pub fn set_usage(&self, user_id: Uuid, since: DateTime<Utc>, count: u64) {
        self.usage.lock().insert((user_id.to_string(), since), count);
    }

    pub fn set_online(&self, project_id: &str, count: u64) {
        self.online.lock().insert(project_id.to_string(), count);
    }

    pub fn set_event_count(&self, project_id: &str, count: u64) {
        self.event_counts.lock().insert(project_id.to_string(), count);
    }

    pub fn set_activity(&self, table: ActivityTable, project_id: &str, count: u64) {
        self.activity
            .lock()
            .insert((table.table_name(), project_id.to_string()), count);
    }

    pub fn count_queries(&self) -> usize {
        self.count_queries.lock().len()
    }

    pub fn last_count_query(&self) -> Option<EventCountQuery> {
        self.count_queries.lock().last().cloned()
    }

    pub fn session_durations(&self) -> Vec<SessionDuration> {
        self.durations.lock().clone()
    }

    /// Project and window start of the latest online users query
    pub fn last_online_query(&self) -> Option<(String, DateTime<Utc>)> {
        self.online_queries.lock().last().cloned()
    }

    pub fn set_summary(&self, summary: ProjectSummary) {
        self.summaries.lock().insert(summary.project_id.clone(), summary);
    }

    /// `(previous_start, start)` of every summary query
    pub fn summary_windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.summary_windows.lock().clone()
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalytics {
    async fn plan_usage(&self, requests: &[UsageRequest]) -> Result<Vec<PlanUsage>> {
        let usage = self.usage.lock();
        Ok(requests
            .iter()
            .filter_map(|req| {
                usage
                    .get(&(req.user_id.clone(), req.since))
                    .map(|count| PlanUsage {
                        id: req.user_id.clone(),
                        count: *count,
                    })
            })
            .collect())
    }

    async fn count_events(&self, query: &EventCountQuery) -> Result<u64> {
        self.count_queries.lock().push(query.clone());
        Ok(self
            .event_counts
            .lock()
            .get(&query.project_id)
            .copied()
            .unwrap_or_default())
    }

    async fn online_users(&self, project_id: &str, since: DateTime<Utc>) -> Result<u64> {
        self.online_queries.lock().push((project_id.to_string(), since));
        Ok(self.online.lock().get(project_id).copied().unwrap_or_default())
    }

    async fn activity_count(
        &self,
        table: ActivityTable,
        project_ids: &[String],
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<u64> {
        let activity = self.activity.lock();
        Ok(project_ids
            .iter()
            .filter_map(|pid| activity.get(&(table.table_name(), pid.clone())))
            .sum())
    }

    async fn project_summaries(
        &self,
        project_ids: &[String],
        previous_start: DateTime<Utc>,
        start: DateTime<Utc>,
    ) -> Result<Vec<ProjectSummary>> {
        self.summary_windows.lock().push((previous_start, start));
        let summaries = self.summaries.lock();
        Ok(project_ids
            .iter()
            .filter_map(|id| summaries.get(id).cloned())
            .collect())
    }

    async fn clear_session_ids(&self, _before: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn add_session_durations(&self, durations: &[SessionDuration]) -> Result<()> {
        self.durations.lock().extend_from_slice(durations);
        Ok(())
    }

    async fn drop_system_logs(&self) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    monthly_counts: Mutex<HashMap<Uuid, u64>>,
    cleared: Mutex<Vec<String>>,
    sessions: Mutex<Vec<SessionTimestamps>>,
    salt: Mutex<Option<(String, Duration)>>,
}

impl MemoryCache {
    pub fn set_monthly_count(&self, user_id: Uuid, count: u64) {
        self.monthly_counts.lock().insert(user_id, count);
    }

    pub fn cleared_projects(&self) -> Vec<String> {
        self.cleared.lock().clone()
    }

    pub fn add_session(&self, session: SessionTimestamps) {
        self.sessions.lock().push(session);
    }

    pub fn session_keys(&self) -> Vec<String> {
        self.sessions.lock().iter().map(|s| s.key.clone()).collect()
    }

    pub fn salt(&self) -> Option<(String, Duration)> {
        self.salt.lock().clone()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn monthly_event_count(&self, user_id: Uuid) -> Result<u64> {
        Ok(self
            .monthly_counts
            .lock()
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn clear_project_cache(&self, project_ids: &[String]) -> Result<()> {
        self.cleared.lock().extend_from_slice(project_ids);
        Ok(())
    }

    async fn session_timestamps(&self) -> Result<Vec<SessionTimestamps>> {
        Ok(self.sessions.lock().clone())
    }

    async fn remove_sessions(&self, keys: &[String]) -> Result<()> {
        self.sessions.lock().retain(|s| !keys.contains(&s.key));
        Ok(())
    }

    async fn set_session_salt(&self, salt: &str, ttl: Duration) -> Result<()> {
        *self.salt.lock() = Some((salt.to_string(), ttl));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryOutbox {
    queue: Mutex<VecDeque<TelegramMessage>>,
}

impl MemoryOutbox {
    pub fn push(&self, message: TelegramMessage) {
        self.queue.lock().push_back(message);
    }

    /// Take everything queued
    pub fn drain(&self) -> Vec<TelegramMessage> {
        self.queue.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl TelegramOutbox for MemoryOutbox {
    async fn enqueue(&self, message: &TelegramMessage) -> Result<()> {
        self.push(message.clone());
        Ok(())
    }

    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<TelegramMessage>> {
        let mut queue = self.queue.lock();
        let take = limit.min(queue.len());
        Ok(queue.drain(..take).collect())
    }
}

#[derive(Default)]
pub struct MemoryExtensions {
    extensions: Mutex<Vec<Extension>>,
    installs: Mutex<Vec<(Uuid, DateTime<Utc>, u64)>>,
}

impl MemoryExtensions {
    pub fn new(extensions: Vec<Extension>) -> Self {
        Self {
            extensions: Mutex::new(extensions),
            ..Self::default()
        }
    }

    pub fn get(&self, id: Uuid) -> Extension {
        self.extensions
            .lock()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("no extension {id}"))
    }

    pub fn add_installs(&self, id: Uuid, at: DateTime<Utc>, count: u64) {
        self.installs.lock().push((id, at, count));
    }
}

#[async_trait]
impl ExtensionStore for MemoryExtensions {
    async fn created_after(&self, since: DateTime<Utc>) -> Result<Vec<Extension>> {
        Ok(self
            .extensions
            .lock()
            .iter()
            .filter(|e| e.created_at > since)
            .cloned()
            .collect())
    }

    async fn tagged_created_before(
        &self,
        tag: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<Extension>> {
        Ok(self
            .extensions
            .lock()
            .iter()
            .filter(|e| e.has_tag(tag) && e.created_at < before)
            .cloned()
            .collect())
    }

    async fn save_tags(&self, extension_id: Uuid, tags: &[String]) -> Result<()> {
        let mut extensions = self.extensions.lock();
        let ext = extensions
            .iter_mut()
            .find(|e| e.id == extension_id)
            .ok_or_else(|| Error::not_found("extension", extension_id.to_string()))?;
        ext.tags = tags.to_vec();
        Ok(())
    }

    async fn install_count(
        &self,
        extension_id: Uuid,
        before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        Ok(self
            .installs
            .lock()
            .iter()
            .filter(|(id, at, _)| *id == extension_id && before.map_or(true, |b| *at < b))
            .map(|(_, _, count)| count)
            .sum())
    }
}

/// Mailer that keeps every letter instead of sending it
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, Letter)>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<(String, Letter)> {
        self.sent.lock().clone()
    }

    /// Make every send to `email` fail
    pub fn fail_for(&self, email: &str) {
        self.failing.lock().push(email.to_string());
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, letter: &Letter) -> Result<()> {
        if self.failing.lock().iter().any(|e| e == to) {
            return Err(Error::internal(format!("mail to {to} rejected")));
        }
        self.sent.lock().push((to.to_string(), letter.clone()));
        Ok(())
    }
}

/// Concrete handles behind [`memory_stores`]
pub struct MemoryHandles {
    pub accounts: Arc<MemoryAccounts>,
    pub projects: Arc<MemoryProjects>,
    pub alerts: Arc<MemoryAlerts>,
    pub extensions: Arc<MemoryExtensions>,
    pub cache: Arc<MemoryCache>,
    pub outbox: Arc<MemoryOutbox>,
    pub analytics: Arc<MemoryAnalytics>,
    pub mailer: Arc<RecordingMailer>,
}

/// Empty in-memory stores
pub fn memory_stores() -> (Stores, MemoryHandles) {
    let handles = MemoryHandles {
        accounts: Arc::new(MemoryAccounts::default()),
        projects: Arc::new(MemoryProjects::default()),
        alerts: Arc::new(MemoryAlerts::new(Vec::new())),
        extensions: Arc::new(MemoryExtensions::default()),
        cache: Arc::new(MemoryCache::default()),
        outbox: Arc::new(MemoryOutbox::default()),
        analytics: Arc::new(MemoryAnalytics::default()),
        mailer: Arc::new(RecordingMailer::default()),
    };

    let stores = Stores {
        accounts: handles.accounts.clone(),
        projects: handles.projects.clone(),
        alerts: handles.alerts.clone(),
        extensions: handles.extensions.clone(),
        cache: handles.cache.clone(),
        outbox: handles.outbox.clone(),
        analytics: handles.analytics.clone(),
        mailer: handles.mailer.clone(),
    };

    (stores, handles)
}
