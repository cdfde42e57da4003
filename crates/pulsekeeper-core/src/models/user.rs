//! Account data models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::PlanCode;
use crate::error::Error;

/// Why an account's dashboard is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardBlockReason {
    /// Usage stayed above the plan after the upgrade period
    ExceedingPlanLimits,
    /// Subscription was cancelled and has run out
    SubscriptionCancelled,
    /// Trial has ended without a subscription
    TrialEnded,
    /// Renewal payment failed
    PaymentFailed,
}

impl DashboardBlockReason {
    /// Stored representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExceedingPlanLimits => "exceeding_plan_limits",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::TrialEnded => "trial_ended",
            Self::PaymentFailed => "payment_failed",
        }
    }
}

impl FromStr for DashboardBlockReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exceeding_plan_limits" => Ok(Self::ExceedingPlanLimits),
            "subscription_cancelled" => Ok(Self::SubscriptionCancelled),
            "trial_ended" => Ok(Self::TrialEnded),
            "payment_failed" => Ok(Self::PaymentFailed),
            other => Err(Error::validation(format!("unknown block reason '{other}'"))),
        }
    }
}

/// How often the user receives email reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportFrequency {
    #[default]
    Never,
    Weekly,
    Monthly,
    Quarterly,
}

impl ReportFrequency {
    /// Stored representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
        }
    }

    /// Start of the period a report sent at `now` covers
    pub fn period_start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Never => None,
            Self::Weekly => Some(now - Duration::weeks(1)),
            Self::Monthly => now.checked_sub_months(Months::new(1)),
            Self::Quarterly => now.checked_sub_months(Months::new(3)),
        }
    }
}

impl fmt::Display for ReportFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            other => Err(Error::validation(format!("unknown report frequency '{other}'"))),
        }
    }
}

/// An account owning projects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier
    pub id: Uuid,

    /// Contact address
    pub email: String,

    /// Current subscription plan
    pub plan_code: PlanCode,

    /// Whether the email address is verified
    pub is_active: bool,

    /// Set when the dashboard is blocked
    pub dashboard_block_reason: Option<DashboardBlockReason>,

    /// When the user was told their usage exceeds the plan
    pub plan_exceed_contacted_at: Option<DateTime<Utc>>,

    /// When the last "running out of events" warning was sent
    pub ev_warning_sent_on: Option<DateTime<Utc>>,

    /// Billing problems suspend the account
    pub is_account_billing_suspended: bool,

    /// When a cancelled subscription stops
    pub cancellation_effective_date: Option<DateTime<Utc>>,

    /// When the trial ends
    pub trial_end_date: Option<DateTime<Utc>>,

    /// Whether the "trial ends tomorrow" email went out
    pub trial_reminder_sent: bool,

    /// Email report frequency
    pub report_frequency: ReportFrequency,

    /// Telegram chat receiving alerts
    pub telegram_chat_id: Option<String>,

    /// Whether the Telegram chat was confirmed
    pub is_telegram_chat_id_confirmed: bool,

    /// When the account was created
    pub created_at: DateTime<Utc>,

    /// Ids of the projects the user administers
    pub project_ids: Vec<String>,
}

impl User {
    /// Whether the user owns at least one project
    pub fn has_projects(&self) -> bool {
        !self.project_ids.is_empty()
    }
}
