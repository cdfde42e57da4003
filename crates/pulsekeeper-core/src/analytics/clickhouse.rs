//! ClickHouse implementation of the analytics store
//!
//! Values are always passed as bound `?` parameters; only table names from
//! [`ActivityTable`] are formatted into statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    ActivityTable, AnalyticsStore, EventCountQuery, EventKind, PlanUsage, ProjectSummary,
    SessionDuration, UsageRequest,
};
use crate::config::ClickHouseConfig;
use crate::error::Result;

/// System log tables that grow without bound on small installations
const SYSTEM_LOG_TABLES: [&str; 5] = [
    "system.asynchronous_metric_log",
    "system.metric_log",
    "system.query_log",
    "system.trace_log",
    "system.part_log",
];

#[derive(Debug, ::clickhouse::Row, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, ::clickhouse::Row, Deserialize)]
struct PlanUsageRow {
    id: String,
    count: u64,
}

#[derive(Debug, ::clickhouse::Row, Deserialize)]
struct SummaryRow {
    pid: String,
    pageviews: u64,
    unique_visitors: u64,
    previous_pageviews: u64,
    previous_unique_visitors: u64,
}

/// Current and previous period counted in one pass; parameters are
/// start four times, then project ids and the previous period start
const PROJECT_SUMMARY_SQL: &str = r#"
    SELECT
        pid,
        countIf(created >= ?) AS pageviews,
        countIf(created >= ? AND unique = 1) AS unique_visitors,
        countIf(created < ?) AS previous_pageviews,
        countIf(created < ? AND unique = 1) AS previous_unique_visitors
    FROM analytics
    WHERE has(?, pid) AND created >= ?
    GROUP BY pid
"#;

/// Analytics store backed by ClickHouse
#[derive(Clone)]
pub struct ClickHouseStore {
    client: ::clickhouse::Client,
}

impl ClickHouseStore {
    /// Create a new ClickHouse client; connections are opened lazily
    pub fn new(config: &ClickHouseConfig) -> Self {
        let client = ::clickhouse::Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database);

        Self { client }
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }

    async fn fetch_count(&self, query: ::clickhouse::query::Query) -> Result<u64> {
        let row = query.fetch_one::<CountRow>().await?;
        Ok(row.count)
    }
}

#[async_trait]
impl AnalyticsStore for ClickHouseStore {
    async fn plan_usage(&self, requests: &[UsageRequest]) -> Result<Vec<PlanUsage>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let sql = plan_usage_sql(requests.len());
        let mut query = self.client.query(&sql);
        for request in requests {
            query = query
                .bind(request.user_id.as_str())
                .bind(&request.project_ids)
                .bind(format_time(request.since));
        }

        let rows = query.fetch_all::<PlanUsageRow>().await?;
        debug!(accounts = requests.len(), rows = rows.len(), "Fetched plan usage");

        Ok(rows
            .into_iter()
            .map(|row| PlanUsage {
                id: row.id,
                count: row.count,
            })
            .collect())
    }

    async fn count_events(&self, query: &EventCountQuery) -> Result<u64> {
        let since = format_time(query.since);
        let statement = match &query.kind {
            EventKind::PageViews { unique } => self
                .client
                .query(
                    "SELECT count() AS count FROM analytics WHERE pid = ? AND unique = ? AND created > ?",
                )
                .bind(query.project_id.as_str())
                .bind(u8::from(*unique))
                .bind(since),
            EventKind::CustomEvent(event) => self
                .client
                .query(
                    "SELECT count() AS count FROM customEV WHERE pid = ? AND ev = ? AND created > ?",
                )
                .bind(query.project_id.as_str())
                .bind(event.as_str())
                .bind(since),
        };

        self.fetch_count(statement).await
    }

    async fn online_users(&self, project_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let statement = self
            .client
            .query(
                "SELECT uniqExact(sid) AS count FROM analytics WHERE pid = ? AND sid IS NOT NULL AND created > ?",
            )
            .bind(project_id)
            .bind(format_time(since));

        self.fetch_count(statement).await
    }

    async fn activity_count(
        &self,
        table: ActivityTable,
        project_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        if project_ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "SELECT count() AS count FROM {} WHERE has(?, pid) AND created BETWEEN ? AND ?",
            table.table_name()
        );
        let statement = self
            .client
            .query(&sql)
            .bind(project_ids)
            .bind(format_time(from))
            .bind(format_time(to));

        self.fetch_count(statement).await
    }

    async fn project_summaries(
        &self,
        project_ids: &[String],
        previous_start: DateTime<Utc>,
        start: DateTime<Utc>,
    ) -> Result<Vec<ProjectSummary>> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }

        let start = format_time(start);
        let rows = self
            .client
            .query(PROJECT_SUMMARY_SQL)
            .bind(start.as_str())
            .bind(start.as_str())
            .bind(start.as_str())
            .bind(start.as_str())
            .bind(project_ids)
            .bind(format_time(previous_start))
            .fetch_all::<SummaryRow>()
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ProjectSummary {
                project_id: row.pid,
                pageviews: row.pageviews,
                unique_visitors: row.unique_visitors,
                previous_pageviews: row.previous_pageviews,
                previous_unique_visitors: row.previous_unique_visitors,
            })
            .collect())
    }

    async fn clear_session_ids(&self, before: DateTime<Utc>) -> Result<()> {
        self.client
            .query("ALTER TABLE analytics UPDATE sid = NULL WHERE created < ?")
            .bind(format_time(before))
            .execute()
            .await?;
        Ok(())
    }

    async fn add_session_durations(&self, durations: &[SessionDuration]) -> Result<()> {
        if durations.is_empty() {
            return Ok(());
        }

        let sql = session_duration_sql(durations.len());
        let mut query = self.client.query(&sql);
        for duration in durations {
            query = query.bind(duration.sid.as_str()).bind(duration.seconds);
        }
        let sids: Vec<&str> = durations.iter().map(|d| d.sid.as_str()).collect();

        query.bind(sids).execute().await?;
        Ok(())
    }

    async fn drop_system_logs(&self) -> Result<usize> {
        let mut failed = 0;

        for table in SYSTEM_LOG_TABLES {
            let sql = format!("DROP TABLE IF EXISTS {table}");
            if let Err(e) = self.client.query(&sql).execute().await {
                warn!(table, error = %e, "Failed to drop system log table");
                failed += 1;
            }
        }

        Ok(failed)
    }
}

/// Format an instant the way ClickHouse parses `DateTime` literals
fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One `SELECT` per account, three parameters each: id, project ids, start
fn plan_usage_sql(accounts: usize) -> String {
    const SELECT: &str =
        "SELECT ? AS id, count() AS count FROM analytics WHERE has(?, pid) AND created > ?";
    vec![SELECT; accounts].join(" UNION ALL ")
}

/// `CASE` arm per session (sid, seconds) followed by the sid list
fn session_duration_sql(sessions: usize) -> String {
    let arms = vec!["WHEN sid = ? THEN ?"; sessions].join(" ");
    format!("ALTER TABLE analytics UPDATE sdur = sdur + CASE {arms} ELSE 0 END WHERE has(?, sid)")
}
