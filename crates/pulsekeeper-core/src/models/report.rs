//! Email report models

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project listed in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportProject {
    pub id: String,
    pub name: String,
}

/// Someone receiving periodic project reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecipient {
    /// Account or subscriber id
    pub id: Uuid,
    pub email: String,
    /// Token of the one-click unsubscribe link
    pub unsubscribe_token: Uuid,
    pub projects: Vec<ReportProject>,
}

/// Traffic of one project as shown in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub name: String,
    pub pageviews: u64,
    pub unique_visitors: u64,
    /// Change against the previous period in percent; unset without earlier traffic
    pub pageviews_change: Option<i64>,
    pub unique_visitors_change: Option<i64>,
}
