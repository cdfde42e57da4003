//! Alert evaluation for online users and counted metrics

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::notifier::{
    AlertNotification, NotificationChannel, NotificationSender, METRICS_EVENT, ONLINE_USERS_EVENT,
};
use crate::analytics::{AnalyticsStore, EventCountQuery, EventKind};
use crate::db::{AlertStore, ProjectStore};
use crate::error::{Error, Result};
use crate::mailer::{Letter, Mailer};
use crate::models::{Alert, AlertScope, Project, QueryMetric};

/// What happened to a single alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    CoolingDown,
    Quiet,
    Triggered,
}

/// Tally of one evaluation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub evaluated: usize,
    pub cooling_down: usize,
    pub triggered: usize,
    pub failed: usize,
}

/// Alert evaluator that checks alerts against analytics counts
pub struct AlertEvaluator {
    alerts: Arc<dyn AlertStore>,
    projects: Arc<dyn ProjectStore>,
    analytics: Arc<dyn AnalyticsStore>,
    mailer: Arc<dyn Mailer>,
    notifier: NotificationSender,
    /// Minimum time between two notifications of one alert
    cooldown: Duration,
    /// How far back a session counts as online
    online_window: Duration,
}

impl AlertEvaluator {
    /// Create a new alert evaluator
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        projects: Arc<dyn ProjectStore>,
        analytics: Arc<dyn AnalyticsStore>,
        mailer: Arc<dyn Mailer>,
        notifier: NotificationSender,
        cooldown: std::time::Duration,
        online_window: std::time::Duration,
    ) -> Result<Self> {
        let cooldown = Duration::from_std(cooldown)
            .map_err(|e| Error::config(format!("alert cooldown: {e}")))?;
        let online_window = Duration::from_std(online_window)
            .map_err(|e| Error::config(format!("online window: {e}")))?;

        Ok(Self {
            alerts,
            projects,
            analytics,
            mailer,
            notifier,
            cooldown,
            online_window,
        })
    }

    /// Evaluate `online_users` alerts of projects with a chat channel
    pub async fn check_online_users_alerts(&self, now: DateTime<Utc>) -> Result<EvaluationSummary> {
        self.evaluate_scope(AlertScope::OnlineUsers, now).await
    }

    /// Evaluate every other alert metric
    pub async fn check_metric_alerts(&self, now: DateTime<Utc>) -> Result<EvaluationSummary> {
        self.evaluate_scope(AlertScope::Metrics, now).await
    }

    async fn evaluate_scope(
        &self,
        scope: AlertScope,
        now: DateTime<Utc>,
    ) -> Result<EvaluationSummary> {
        let mut projects = self.projects.projects_with_active_admin().await?;
        if scope == AlertScope::OnlineUsers {
            projects.retain(|p| p.admin.has_chat_channel());
        }

        if projects.is_empty() {
            debug!(?scope, "No projects eligible for alerts");
            return Ok(EvaluationSummary::default());
        }

        let ids: Vec<String> = projects.iter().map(|p| p.id.clone()).collect();
        let by_id: HashMap<&str, &Project> = projects.iter().map(|p| (p.id.as_str(), p)).collect();

        let alerts = self.alerts.active_alerts(&ids, scope).await?;

        let evaluations = alerts.iter().filter_map(|alert| {
            let project = by_id.get(alert.project_id.as_str())?;
            Some(async move { (alert, self.evaluate(alert, project, now).await) })
        });

        let mut summary = EvaluationSummary::default();
        for (alert, result) in join_all(evaluations).await {
            summary.evaluated += 1;
            match result {
                Ok(Outcome::CoolingDown) => summary.cooling_down += 1,
                Ok(Outcome::Quiet) => {}
                Ok(Outcome::Triggered) => summary.triggered += 1,
                Err(e) => {
                    error!(alert_id = %alert.id, error = %e, "Error evaluating alert");
                    summary.failed += 1;
                }
            }
        }

        info!(
            ?scope,
            evaluated = summary.evaluated,
            triggered = summary.triggered,
            failed = summary.failed,
            "Evaluated alerts"
        );

        Ok(summary)
    }

    /// Evaluate a single alert
    async fn evaluate(
        &self,
        alert: &Alert,
        project: &Project,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        if alert.is_cooling_down(now, self.cooldown) {
            return Ok(Outcome::CoolingDown);
        }

        let (count, notification) = if alert.query_metric == QueryMetric::OnlineUsers {
            let online = self
                .analytics
                .online_users(&project.id, now - self.online_window)
                .await?;
            (online, online_users_notification(alert, project, online))
        } else {
            let query = event_count_query(alert, now)?;
            let count = self.analytics.count_events(&query).await?;
            (count, metric_notification(alert, project, count)?)
        };

        debug!(alert_id = %alert.id, count, threshold = alert.query_value, "Evaluated alert");

        if !alert.check(count) {
            return Ok(Outcome::Quiet);
        }

        self.alerts.mark_triggered(alert.id, now).await?;

        info!(
            alert_id = %alert.id,
            project_id = %project.id,
            metric = alert.query_metric.as_str(),
            count,
            "Alert triggered"
        );
        metrics::counter!(
            "pulsekeeper_alerts_triggered_total",
            "metric" => alert.query_metric.as_str()
        )
        .increment(1);

        let results = self.notifier.dispatch(&project.admin, &notification).await;

        for result in results {
            let outcome = if result.success { "success" } else { "failure" };
            metrics::counter!(
                "pulsekeeper_notifications_total",
                "channel" => result.channel.kind(),
                "outcome" => outcome
            )
            .increment(1);

            if result.success {
                continue;
            }

            warn!(
                alert_id = %alert.id,
                channel = result.channel.kind(),
                error = result.error.as_deref().unwrap_or_default(),
                "Notification failed"
            );

            if let NotificationChannel::Webhook { id, name } = result.channel {
                self.handle_failed_webhook(project, id, name).await;
            }
        }

        Ok(Outcome::Triggered)
    }

    /// Disable a failing webhook and tell the admin; errors here are only logged
    async fn handle_failed_webhook(&self, project: &Project, webhook_id: Uuid, name: String) {
        if let Err(e) = self.projects.disable_webhook(webhook_id).await {
            error!(webhook_id = %webhook_id, error = %e, "Failed to disable webhook");
        }

        let letter = Letter::CustomWebhookFailed { webhook_name: name };
        if let Err(e) = self.mailer.send(&project.admin.email, &letter).await {
            error!(webhook_id = %webhook_id, error = %e, "Failed to send webhook failure email");
        }
    }
}

/// Build the count query of a metric alert
fn event_count_query(alert: &Alert, now: DateTime<Utc>) -> Result<EventCountQuery> {
    let window = alert
        .query_time
        .ok_or_else(|| Error::validation(format!("alert {} has no query time", alert.id)))?;
    let window = Duration::from_std(window.duration())
        .map_err(|e| Error::internal(format!("query window: {e}")))?;

    let kind = match alert.query_metric {
        QueryMetric::PageViews => EventKind::PageViews { unique: false },
        QueryMetric::UniquePageViews => EventKind::PageViews { unique: true },
        QueryMetric::CustomEvents => {
            let event = alert.query_custom_event.clone().ok_or_else(|| {
                Error::validation(format!("alert {} has no custom event", alert.id))
            })?;
            EventKind::CustomEvent(event)
        }
        QueryMetric::OnlineUsers => {
            return Err(Error::validation("online users alerts are not counted by window"));
        }
    };

    Ok(EventCountQuery {
        project_id: alert.project_id.clone(),
        kind,
        since: now - window,
    })
}

/// Render an online users alert
fn online_users_notification(alert: &Alert, project: &Project, online: u64) -> AlertNotification {
    AlertNotification {
        text: format!(
            "🔔 Alert *{}* got triggered!\nYour project *{}* has *{}* online users right now!",
            alert.name, project.name, online
        ),
        event: ONLINE_USERS_EVENT,
        data: serde_json::json!({
            "alertName": alert.name,
            "projectName": project.name,
            "count": online,
        }),
    }
}

/// Render a counted metric alert
fn metric_notification(alert: &Alert, project: &Project, count: u64) -> Result<AlertNotification> {
    let window = alert
        .query_time
        .ok_or_else(|| Error::validation(format!("alert {} has no query time", alert.id)))?
        .label();

    let event = match (&alert.query_metric, &alert.query_custom_event) {
        (QueryMetric::CustomEvents, Some(name)) => format!(" \"{name}\""),
        _ => String::new(),
    };

    Ok(AlertNotification {
        text: format!(
            "🔔 Alert *{}* got triggered!\nYour project *{}* has had *{}*{} {} in the last {}!",
            alert.name,
            project.name,
            count,
            event,
            alert.query_metric.label(),
            window
        ),
        event: METRICS_EVENT,
        data: serde_json::json!({
            "alertName": alert.name,
            "projectName": project.name,
            "count": count,
            "queryMetric": alert.query_metric.as_str(),
            "queryCustomEvent": alert.query_custom_event,
            "queryTime": window,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::Letter;
    use crate::models::{ProjectAdmin, QueryCondition, QueryTime, Webhook};
    use crate::testing::{
        MemoryAlerts, MemoryAnalytics, MemoryOutbox, MemoryProjects, RecordingMailer,
    };
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn project(id: &str) -> Project {
        Project {
            id: id.to_string(),
            name: format!("Site {id}"),
            admin: ProjectAdmin {
                id: Uuid::new_v4(),
                email: "owner@example.com".to_string(),
                telegram_chat_id: Some("42".to_string()),
                is_telegram_chat_id_confirmed: true,
                slack_webhook_url: None,
                discord_webhook_url: None,
                webhooks: Vec::new(),
            },
        }
    }

    fn alert(project_id: &str, metric: QueryMetric, value: u64) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            name: "Traffic".to_string(),
            query_metric: metric,
            query_condition: None,
            query_value: value,
            query_time: Some(QueryTime::Last1Hour),
            query_custom_event: None,
            active: true,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }

    struct Harness {
        alerts: Arc<MemoryAlerts>,
        projects: Arc<MemoryProjects>,
        analytics: Arc<MemoryAnalytics>,
        mailer: Arc<RecordingMailer>,
        outbox: Arc<MemoryOutbox>,
        evaluator: AlertEvaluator,
    }

    fn harness(projects: Vec<Project>, alerts: Vec<Alert>) -> Harness {
        let alerts = Arc::new(MemoryAlerts::new(alerts));
        let projects = Arc::new(MemoryProjects::new(projects));
        let analytics = Arc::new(MemoryAnalytics::default());
        let mailer = Arc::new(RecordingMailer::default());
        let outbox = Arc::new(MemoryOutbox::default());
        let notifier =
            NotificationSender::new(outbox.clone(), std::time::Duration::from_secs(5)).unwrap();

        let evaluator = AlertEvaluator::new(
            alerts.clone(),
            projects.clone(),
            analytics.clone(),
            mailer.clone(),
            notifier,
            std::time::Duration::from_secs(24 * 3600),
            std::time::Duration::from_secs(300),
        )
        .unwrap();

        Harness {
            alerts,
            projects,
            analytics,
            mailer,
            outbox,
            evaluator,
        }
    }

    #[tokio::test]
    async fn online_users_alert_triggers_at_threshold() {
        let h = harness(
            vec![project("p1")],
            vec![alert("p1", QueryMetric::OnlineUsers, 10)],
        );
        h.analytics.set_online("p1", 10);
        let now = Utc::now();

        let summary = h.evaluator.check_online_users_alerts(now).await.unwrap();

        assert_eq!(summary.triggered, 1);
        let queued = h.outbox.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(
            queued[0].text,
            "🔔 Alert *Traffic* got triggered!\nYour project *Site p1* has *10* online users right now!"
        );
        assert_eq!(h.alerts.all()[0].last_triggered, Some(now));
        assert_eq!(
            h.analytics.last_online_query(),
            Some(("p1".to_string(), now - Duration::minutes(5)))
        );
    }

    #[tokio::test]
    async fn online_users_webhook_carries_event_and_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(serde_json::json!({
                "event": "user.alert.online-users",
                "data": {
                    "alertName": "Traffic",
                    "projectName": "Site p1",
                    "count": 12
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut p = project("p1");
        p.admin.webhooks = vec![Webhook {
            id: Uuid::new_v4(),
            name: "Zapier".to_string(),
            url: Some(format!("{}/hook", server.uri())),
        }];
        let h = harness(vec![p], vec![alert("p1", QueryMetric::OnlineUsers, 10)]);
        h.analytics.set_online("p1", 12);

        let summary = h.evaluator.check_online_users_alerts(Utc::now()).await.unwrap();

        assert_eq!(summary.triggered, 1);
        assert!(h.projects.disabled_webhooks().is_empty());
    }

    #[tokio::test]
    async fn projects_without_chat_channel_are_skipped_for_online_users() {
        let mut quiet = project("p1");
        quiet.admin.is_telegram_chat_id_confirmed = false;
        let h = harness(vec![quiet], vec![alert("p1", QueryMetric::OnlineUsers, 1)]);
        h.analytics.set_online("p1", 50);

        let summary = h.evaluator.check_online_users_alerts(Utc::now()).await.unwrap();

        assert_eq!(summary, EvaluationSummary::default());
        assert!(h.outbox.is_empty());
    }

    #[tokio::test]
    async fn cooling_down_alerts_are_not_queried() {
        let now = Utc::now();
        let mut recent = alert("p1", QueryMetric::PageViews, 1);
        recent.last_triggered = Some(now - Duration::hours(2));
        let h = harness(vec![project("p1")], vec![recent]);
        h.analytics.set_event_count("p1", 1_000);

        let summary = h.evaluator.check_metric_alerts(now).await.unwrap();

        assert_eq!(summary.cooling_down, 1);
        assert_eq!(summary.triggered, 0);
        assert_eq!(h.analytics.count_queries(), 0);
    }

    #[tokio::test]
    async fn metric_alert_applies_condition_and_window() {
        let now = Utc::now();
        let mut below = alert("p1", QueryMetric::CustomEvents, 5);
        below.query_condition = Some(QueryCondition::LessThan);
        below.query_custom_event = Some("signup".to_string());
        below.query_time = Some(QueryTime::Last24Hours);
        let h = harness(vec![project("p1")], vec![below]);
        h.analytics.set_event_count("p1", 3);

        let summary = h.evaluator.check_metric_alerts(now).await.unwrap();

        assert_eq!(summary.triggered, 1);
        let query = h.analytics.last_count_query().unwrap();
        assert_eq!(query.kind, EventKind::CustomEvent("signup".to_string()));
        assert_eq!(query.since, now - Duration::hours(24));
        assert_eq!(
            h.outbox.drain()[0].text,
            "🔔 Alert *Traffic* got triggered!\nYour project *Site p1* has had *3* \"signup\" custom events in the last 24 hours!"
        );
    }

    #[tokio::test]
    async fn quiet_alert_is_not_marked() {
        let h = harness(vec![project("p1")], vec![alert("p1", QueryMetric::PageViews, 100)]);
        h.analytics.set_event_count("p1", 99);

        let summary = h.evaluator.check_metric_alerts(Utc::now()).await.unwrap();

        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.triggered, 0);
        assert_eq!(h.alerts.all()[0].last_triggered, None);
    }

    #[tokio::test]
    async fn one_broken_alert_does_not_stop_the_others() {
        let mut broken = alert("p1", QueryMetric::CustomEvents, 1);
        broken.query_custom_event = None;
        let h = harness(
            vec![project("p1")],
            vec![broken, alert("p1", QueryMetric::PageViews, 1)],
        );
        h.analytics.set_event_count("p1", 5);

        let summary = h.evaluator.check_metric_alerts(Utc::now()).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.triggered, 1);
    }

    #[tokio::test]
    async fn failed_webhook_is_disabled_and_admin_emailed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let webhook_id = Uuid::new_v4();
        let mut p = project("p1");
        p.admin.webhooks = vec![Webhook {
            id: webhook_id,
            name: "Zapier".to_string(),
            url: Some(format!("{}/hook", server.uri())),
        }];
        let h = harness(vec![p], vec![alert("p1", QueryMetric::PageViews, 1)]);
        h.analytics.set_event_count("p1", 2);

        let summary = h.evaluator.check_metric_alerts(Utc::now()).await.unwrap();

        assert_eq!(summary.triggered, 1);
        assert_eq!(h.projects.disabled_webhooks(), vec![webhook_id]);
        assert_eq!(
            h.mailer.sent(),
            vec![(
                "owner@example.com".to_string(),
                Letter::CustomWebhookFailed {
                    webhook_name: "Zapier".to_string()
                }
            )]
        );
    }

    #[test]
    fn metric_notification_payload_uses_window_label() {
        let a = alert("p1", QueryMetric::UniquePageViews, 1);
        let n = metric_notification(&a, &project("p1"), 7).unwrap();

        assert_eq!(n.event, METRICS_EVENT);
        assert_eq!(n.data["queryTime"], "1 hour");
        assert_eq!(n.data["queryMetric"], "unique_page_views");
        assert!(n.text.ends_with("has had *7* unique page views in the last 1 hour!"));
    }
}
