//! Alert repository for reading alert definitions and recording triggers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::db::AlertStore;
use crate::error::{Error, Result};
use crate::models::{Alert, AlertScope, QueryMetric};

/// Repository for per-project alerts
#[derive(Clone)]
pub struct AlertRepository {
    pool: PgPool,
}

impl AlertRepository {
    /// Create a new alert repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertStore for AlertRepository {
    async fn active_alerts(&self, project_ids: &[String], scope: AlertScope) -> Result<Vec<Alert>> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }

        let metric_filter = match scope {
            AlertScope::OnlineUsers => "query_metric = $2",
            AlertScope::Metrics => "query_metric <> $2",
        };

        let sql = format!(
            r#"
            SELECT id, project_id, name, query_metric, query_condition, query_value,
                   query_time, query_custom_event, active, last_triggered, created_at
            FROM alerts
            WHERE active AND project_id = ANY($1) AND {metric_filter}
            ORDER BY created_at
            "#
        );

        let rows: Vec<AlertRow> = sqlx::query_as(&sql)
            .bind(project_ids)
            .bind(QueryMetric::OnlineUsers.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                match Alert::try_from(row) {
                    Ok(alert) => Some(alert),
                    Err(e) => {
                        warn!(alert_id = %id, error = %e, "Skipping unreadable alert");
                        None
                    }
                }
            })
            .collect())
    }

    async fn mark_triggered(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE alerts SET last_triggered = $2 WHERE id = $1")
            .bind(alert_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("alert", alert_id.to_string()));
        }

        Ok(())
    }
}

// Database row type for mapping

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    project_id: String,
    name: String,
    query_metric: String,
    query_condition: Option<String>,
    query_value: i64,
    query_time: Option<String>,
    query_custom_event: Option<String>,
    active: bool,
    last_triggered: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            query_metric: row.query_metric.parse()?,
            query_condition: row.query_condition.as_deref().map(str::parse).transpose()?,
            query_value: u64::try_from(row.query_value)
                .map_err(|_| Error::validation(format!("negative threshold {}", row.query_value)))?,
            query_time: row.query_time.as_deref().map(str::parse).transpose()?,
            query_custom_event: row.query_custom_event,
            active: row.active,
            last_triggered: row.last_triggered,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryCondition, QueryTime};

    fn row() -> AlertRow {
        AlertRow {
            id: Uuid::new_v4(),
            project_id: "pid".to_string(),
            name: "Signups".to_string(),
            query_metric: "custom_events".to_string(),
            query_condition: Some("less_than".to_string()),
            query_value: 5,
            query_time: Some("last_24_hours".to_string()),
            query_custom_event: Some("signup".to_string()),
            active: true,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn maps_stored_enums() {
        let alert = Alert::try_from(row()).unwrap();
        assert_eq!(alert.query_metric, QueryMetric::CustomEvents);
        assert_eq!(alert.query_condition, Some(QueryCondition::LessThan));
        assert_eq!(alert.query_time, Some(QueryTime::Last24Hours));
        assert_eq!(alert.query_value, 5);
    }

    #[test]
    fn rejects_unknown_metric_and_negative_threshold() {
        let mut bad_metric = row();
        bad_metric.query_metric = "bounce_rate".to_string();
        assert!(Alert::try_from(bad_metric).is_err());

        let mut negative = row();
        negative.query_value = -1;
        assert!(Alert::try_from(negative).is_err());
    }
}
