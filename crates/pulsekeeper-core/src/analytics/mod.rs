//! Read-only aggregates from the analytics store
//!
//! Jobs talk to [`AnalyticsStore`]; [`ClickHouseStore`] is the production
//! implementation.

mod clickhouse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::clickhouse::ClickHouseStore;

use crate::error::Result;

/// Usage of one account since a start date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRequest {
    /// Account id, echoed back in [`PlanUsage::id`]
    pub user_id: String,
    /// Projects the account owns
    pub project_ids: Vec<String>,
    /// Count events created after this instant
    pub since: DateTime<Utc>,
}

/// Events counted for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanUsage {
    pub id: String,
    pub count: u64,
}

/// What to count for a metric alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Page views, optionally only unique ones
    PageViews { unique: bool },
    /// Occurrences of a named custom event
    CustomEvent(String),
}

/// Event count of one project within a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCountQuery {
    pub project_id: String,
    pub kind: EventKind,
    pub since: DateTime<Utc>,
}

/// Tables with tracked activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityTable {
    Analytics,
    Captcha,
    CustomEvents,
}

impl ActivityTable {
    /// All activity tables, cheapest check first
    pub const ALL: [ActivityTable; 3] = [Self::Analytics, Self::Captcha, Self::CustomEvents];

    /// ClickHouse table name
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Analytics => "analytics",
            Self::Captcha => "captcha",
            Self::CustomEvents => "customEV",
        }
    }
}

/// Length of a finished session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDuration {
    pub sid: String,
    pub seconds: f64,
}

/// Page views of one project in a report period and the period before it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSummary {
    pub project_id: String,
    pub pageviews: u64,
    pub unique_visitors: u64,
    pub previous_pageviews: u64,
    pub previous_unique_visitors: u64,
}

/// Aggregate queries and maintenance statements against the analytics store
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Event counts per account; accounts without events may be missing
    async fn plan_usage(&self, requests: &[UsageRequest]) -> Result<Vec<PlanUsage>>;

    /// Events of one project since a point in time
    async fn count_events(&self, query: &EventCountQuery) -> Result<u64>;

    /// Distinct sessions of a project with activity since a point in time
    async fn online_users(&self, project_id: &str, since: DateTime<Utc>) -> Result<u64>;

    /// Rows recorded for the projects in `[from, to]`
    async fn activity_count(
        &self,
        table: ActivityTable,
        project_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;

    /// Traffic of each project in `[start, now]` and `[previous_start, start)`;
    /// projects without page views may be missing
    async fn project_summaries(
        &self,
        project_ids: &[String],
        previous_start: DateTime<Utc>,
        start: DateTime<Utc>,
    ) -> Result<Vec<ProjectSummary>>;

    /// Remove session ids from rows created before `before`
    async fn clear_session_ids(&self, before: DateTime<Utc>) -> Result<()>;

    /// Add finished session lengths to the rows of each session
    async fn add_session_durations(&self, durations: &[SessionDuration]) -> Result<()>;

    /// Drop the server's own system log tables; returns how many drops failed
    async fn drop_system_logs(&self) -> Result<usize>;
}
