//! Periodic project reports for owners and subscribers

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info};

use crate::analytics::{AnalyticsStore, ProjectSummary};
use crate::config::ReportsConfig;
use crate::db::{AccountStore, ProjectStore};
use crate::error::{Error, Result};
use crate::mailer::{Letter, Mailer};
use crate::models::{ProjectStats, ReportFrequency, ReportRecipient};

/// Who a report run goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAudience {
    /// Account owners, covering every project they own
    Owners,
    /// Email subscribers of a single project
    Subscribers,
}

impl ReportAudience {
    fn unsubscribe_path(self) -> &'static str {
        match self {
            Self::Owners => "reports-unsubscribe",
            Self::Subscribers => "3rd-party-unsubscribe",
        }
    }
}

/// Sends weekly, monthly and quarterly traffic summaries
pub struct ReportJobs {
    accounts: Arc<dyn AccountStore>,
    projects: Arc<dyn ProjectStore>,
    analytics: Arc<dyn AnalyticsStore>,
    mailer: Arc<dyn Mailer>,
    config: ReportsConfig,
}

impl ReportJobs {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        projects: Arc<dyn ProjectStore>,
        analytics: Arc<dyn AnalyticsStore>,
        mailer: Arc<dyn Mailer>,
        config: ReportsConfig,
    ) -> Self {
        Self {
            accounts,
            projects,
            analytics,
            mailer,
            config,
        }
    }

    /// Email every recipient of `audience` on `frequency` a summary of the
    /// period ending at `now`; returns how many reports went out
    pub async fn send_reports(
        &self,
        audience: ReportAudience,
        frequency: ReportFrequency,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let window = ReportWindow::new(frequency, now)?;

        let recipients = match audience {
            ReportAudience::Owners => self.accounts.report_recipients(frequency).await?,
            ReportAudience::Subscribers => self.projects.report_subscribers(frequency).await?,
        };

        let (eligible, skipped): (Vec<_>, Vec<_>) = recipients.iter().partition(|r| {
            !r.projects.is_empty() && r.projects.len() <= self.config.max_projects
        });
        if !skipped.is_empty() {
            debug!(
                skipped = skipped.len(),
                "Skipped recipients without projects or with too many"
            );
        }

        let results = join_all(
            eligible
                .iter()
                .map(|recipient| self.send_report(recipient, audience, frequency, &window)),
        )
        .await;

        let mut sent = 0;
        for (recipient, result) in eligible.iter().zip(results) {
            match result {
                Ok(()) => sent += 1,
                Err(e) => error!(recipient_id = %recipient.id, error = %e, "Error sending report"),
            }
        }

        info!(?audience, %frequency, sent, "Sent project reports");
        Ok(sent)
    }

    async fn send_report(
        &self,
        recipient: &ReportRecipient,
        audience: ReportAudience,
        frequency: ReportFrequency,
        window: &ReportWindow,
    ) -> Result<()> {
        let ids: Vec<String> = recipient.projects.iter().map(|p| p.id.clone()).collect();
        let summaries = self
            .analytics
            .project_summaries(&ids, window.previous_start, window.start)
            .await?;

        let projects = recipient
            .projects
            .iter()
            .map(|project| {
                let summary = summaries.iter().find(|s| s.project_id == project.id);
                project_stats(&project.name, summary)
            })
            .collect();

        let letter = Letter::ProjectReport {
            frequency,
            period: window.label.clone(),
            projects,
            unsubscribe_url: format!(
                "{}/{}/{}",
                self.config.client_url.trim_end_matches('/'),
                audience.unsubscribe_path(),
                recipient.unsubscribe_token
            ),
        };

        self.mailer.send(&recipient.email, &letter).await
    }
}

/// Reported period and the equally long one before it
struct ReportWindow {
    previous_start: DateTime<Utc>,
    start: DateTime<Utc>,
    label: String,
}

impl ReportWindow {
    fn new(frequency: ReportFrequency, now: DateTime<Utc>) -> Result<Self> {
        let start = frequency
            .period_start(now)
            .ok_or_else(|| Error::validation(format!("no report period for '{frequency}'")))?;

        Ok(Self {
            previous_start: start - (now - start),
            start,
            label: format!("{} - {}", start.format("%d.%m.%Y"), now.format("%d.%m.%Y")),
        })
    }
}

/// Report line of a project; a project without page views reports zeros
fn project_stats(name: &str, summary: Option<&ProjectSummary>) -> ProjectStats {
    let summary = summary.cloned().unwrap_or_default();

    ProjectStats {
        name: name.to_string(),
        pageviews: summary.pageviews,
        unique_visitors: summary.unique_visitors,
        pageviews_change: percent_change(summary.previous_pageviews, summary.pageviews),
        unique_visitors_change: percent_change(
            summary.previous_unique_visitors,
            summary.unique_visitors,
        ),
    }
}

/// Whole percent change from `previous` to `current`
fn percent_change(previous: u64, current: u64) -> Option<i64> {
    if previous == 0 {
        return None;
    }
    let change = (current as f64 - previous as f64) / previous as f64 * 100.0;
    Some(change.round() as i64)
}
