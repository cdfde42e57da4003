//! # Pulsekeeper
//!
//! Scheduled background jobs for a privacy-focused web analytics service.
//!
//! Pulsekeeper enforces plan limits, evaluates per-project alerts and
//! delivers their notifications, and keeps the data stores tidy.
//!
//! ## Architecture
//!
//! - **Scheduler**: one tokio task per job, firing on UTC schedules
//! - **Usage**: overage emails, dashboard locks and low-balance warnings
//! - **Reports**: weekly, monthly and quarterly traffic emails
//! - **Alerting**: online user and metric alerts over Telegram, Slack, Discord and webhooks
//! - **Storage**: PostgreSQL for accounts, Redis for counters and queues, ClickHouse for events
//! - **API**: health, Prometheus metrics and manual job runs
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the scheduler and the operations API
//! pulsekeeper serve
//!
//! # Run one job now
//! pulsekeeper run check-plan-usage
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod analytics;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod mailer;
pub mod models;
pub mod scheduler;
pub mod tasks;
pub mod usage;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::scheduler::{Job, Schedule, Scheduler};
    pub use crate::tasks::{Stores, TaskManager};
}
