//! Transactional email hand-off
//!
//! Templates are rendered by the mail relay; this side only picks the
//! template and supplies its data.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{PlanCode, ProjectStats, ReportFrequency};

/// An email template together with its data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "template", content = "data", rename_all = "snake_case")]
pub enum Letter {
    /// Usage went above the plan
    UsageOverLimit {
        plan: PlanCode,
        /// True for a spike above the allowance, false for two months over the limit
        hit_percentage_limit: bool,
        this_month_usage: u64,
        last_month_usage: Option<u64>,
        percentage_limit: u32,
        upgrade_period_days: u32,
        billing_url: String,
        suggested_plan: Option<PlanCode>,
        suggested_plan_limit: Option<u64>,
    },
    /// Dashboard locked after the upgrade period
    DashboardLocked {
        plan: PlanCode,
        hit_percentage_limit: bool,
        percentage_limit: u32,
        billing_url: String,
        suggested_plan: Option<PlanCode>,
        suggested_plan_limit: Option<u64>,
    },
    /// Most of the monthly events are used up
    TierWarning { amount: u32, billing_url: String },
    /// Trial ends within a day
    TrialEndsTomorrow { billing_url: String },
    /// Trial is over
    TrialExpired { billing_url: String },
    /// A custom webhook failed and was disabled
    CustomWebhookFailed { webhook_name: String },
    /// Periodic traffic summary of the recipient's projects
    ProjectReport {
        frequency: ReportFrequency,
        /// `DD.MM.YYYY - DD.MM.YYYY`
        period: String,
        projects: Vec<ProjectStats>,
        unsubscribe_url: String,
    },
}

impl Letter {
    /// Template name
    pub fn template(&self) -> &'static str {
        match self {
            Self::UsageOverLimit { .. } => "usage_over_limit",
            Self::DashboardLocked { .. } => "dashboard_locked",
            Self::TierWarning { .. } => "tier_warning",
            Self::TrialEndsTomorrow { .. } => "trial_ends_tomorrow",
            Self::TrialExpired { .. } => "trial_expired",
            Self::CustomWebhookFailed { .. } => "custom_webhook_failed",
            Self::ProjectReport { .. } => "project_report",
        }
    }
}

/// Sends templated emails
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one email
    async fn send(&self, to: &str, letter: &Letter) -> Result<()>;
}

#[derive(Serialize)]
struct MailRequest<'a> {
    to: &'a str,
    #[serde(flatten)]
    letter: &'a Letter,
}

/// Posts emails to an HTTP mail relay
pub struct HttpMailer {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpMailer {
    /// Create a mailer for the relay at `url`
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, letter: &Letter) -> Result<()> {
        let mut request = self.client.post(&self.url).json(&MailRequest { to, letter });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request.send().await?.error_for_status()?;

        debug!(to, template = letter.template(), "Email handed to relay");
        Ok(())
    }
}

/// Logs emails instead of sending them
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, letter: &Letter) -> Result<()> {
        info!(
            to,
            template = letter.template(),
            ?letter,
            "Mail relay not configured, email not sent"
        );
        Ok(())
    }
}
