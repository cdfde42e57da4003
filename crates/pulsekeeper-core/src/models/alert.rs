//! Alert data models

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// What an alert counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMetric {
    /// All page views
    PageViews,
    /// First page view of each visitor
    UniquePageViews,
    /// Sessions active right now
    OnlineUsers,
    /// Occurrences of one custom event
    CustomEvents,
}

impl QueryMetric {
    /// Stored representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageViews => "page_views",
            Self::UniquePageViews => "unique_page_views",
            Self::OnlineUsers => "online_users",
            Self::CustomEvents => "custom_events",
        }
    }

    /// Human-readable name used in notifications
    pub fn label(self) -> &'static str {
        match self {
            Self::PageViews => "page views",
            Self::UniquePageViews => "unique page views",
            Self::OnlineUsers => "online users",
            Self::CustomEvents => "custom events",
        }
    }
}

impl fmt::Display for QueryMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page_views" => Ok(Self::PageViews),
            "unique_page_views" => Ok(Self::UniquePageViews),
            "online_users" => Ok(Self::OnlineUsers),
            "custom_events" => Ok(Self::CustomEvents),
            other => Err(Error::validation(format!("unknown query metric '{other}'"))),
        }
    }
}

/// Comparison between the counted value and the alert threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryCondition {
    GreaterThan,
    #[default]
    GreaterEqualThan,
    LessThan,
    LessEqualThan,
}

impl QueryCondition {
    /// Stored representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GreaterThan => "greater_than",
            Self::GreaterEqualThan => "greater_equal_than",
            Self::LessThan => "less_than",
            Self::LessEqualThan => "less_equal_than",
        }
    }

    /// Check a value against a threshold
    pub fn holds(self, value: u64, threshold: u64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterEqualThan => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessEqualThan => value <= threshold,
        }
    }
}

impl FromStr for QueryCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greater_than" => Ok(Self::GreaterThan),
            "greater_equal_than" => Ok(Self::GreaterEqualThan),
            "less_than" => Ok(Self::LessThan),
            "less_equal_than" => Ok(Self::LessEqualThan),
            other => Err(Error::validation(format!("unknown query condition '{other}'"))),
        }
    }
}

/// Look-back window of a metric alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryTime {
    #[serde(rename = "last_15_minutes")]
    Last15Minutes,
    #[serde(rename = "last_30_minutes")]
    Last30Minutes,
    #[serde(rename = "last_1_hour")]
    Last1Hour,
    #[serde(rename = "last_4_hours")]
    Last4Hours,
    #[serde(rename = "last_24_hours")]
    Last24Hours,
    #[serde(rename = "last_48_hours")]
    Last48Hours,
}

impl QueryTime {
    /// Stored representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Last15Minutes => "last_15_minutes",
            Self::Last30Minutes => "last_30_minutes",
            Self::Last1Hour => "last_1_hour",
            Self::Last4Hours => "last_4_hours",
            Self::Last24Hours => "last_24_hours",
            Self::Last48Hours => "last_48_hours",
        }
    }

    /// Length of the window
    pub fn duration(self) -> Duration {
        let minutes = match self {
            Self::Last15Minutes => 15,
            Self::Last30Minutes => 30,
            Self::Last1Hour => 60,
            Self::Last4Hours => 4 * 60,
            Self::Last24Hours => 24 * 60,
            Self::Last48Hours => 48 * 60,
        };
        Duration::from_secs(minutes * 60)
    }

    /// Human-readable window used in notifications
    pub fn label(self) -> &'static str {
        match self {
            Self::Last15Minutes => "15 minutes",
            Self::Last30Minutes => "30 minutes",
            Self::Last1Hour => "1 hour",
            Self::Last4Hours => "4 hours",
            Self::Last24Hours => "24 hours",
            Self::Last48Hours => "48 hours",
        }
    }
}

impl FromStr for QueryTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_15_minutes" => Ok(Self::Last15Minutes),
            "last_30_minutes" => Ok(Self::Last30Minutes),
            "last_1_hour" => Ok(Self::Last1Hour),
            "last_4_hours" => Ok(Self::Last4Hours),
            "last_24_hours" => Ok(Self::Last24Hours),
            "last_48_hours" => Ok(Self::Last48Hours),
            other => Err(Error::validation(format!("unknown query time '{other}'"))),
        }
    }
}

/// Which alerts a job evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertScope {
    /// Only `online_users` alerts
    OnlineUsers,
    /// Every metric except `online_users`
    Metrics,
}

impl AlertScope {
    /// Whether an alert metric belongs to this scope
    pub fn includes(self, metric: QueryMetric) -> bool {
        match self {
            Self::OnlineUsers => metric == QueryMetric::OnlineUsers,
            Self::Metrics => metric != QueryMetric::OnlineUsers,
        }
    }
}

/// A per-project alert definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier
    pub id: Uuid,

    /// Project the alert watches
    pub project_id: String,

    /// Human-readable name
    pub name: String,

    /// Metric to count
    pub query_metric: QueryMetric,

    /// Comparison applied to the counted value
    pub query_condition: Option<QueryCondition>,

    /// Threshold value
    pub query_value: u64,

    /// Look-back window for counted metrics
    pub query_time: Option<QueryTime>,

    /// Event name for custom event alerts
    pub query_custom_event: Option<String>,

    /// Whether the alert is enabled
    pub active: bool,

    /// Last time this alert notified
    pub last_triggered: Option<DateTime<Utc>>,

    /// When the alert was created
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Whether the last notification is still within the cooldown window
    pub fn is_cooling_down(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        self.last_triggered
            .is_some_and(|last| now.signed_duration_since(last) < cooldown)
    }

    /// Check a counted value against this alert's threshold
    pub fn check(&self, value: u64) -> bool {
        self.query_condition
            .unwrap_or_default()
            .holds(value, self.query_value)
    }
}
