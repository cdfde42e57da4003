//! Alerting for Pulsekeeper
//!
//! Evaluates per-project alerts against analytics counts and fans
//! notifications out to Telegram, Slack, Discord and custom webhooks.

mod evaluator;
mod notifier;
mod repository;
mod telegram;

pub use evaluator::{AlertEvaluator, EvaluationSummary};
pub use notifier::{
    AlertNotification, NotificationChannel, NotificationError, NotificationResult,
    NotificationSender, METRICS_EVENT, ONLINE_USERS_EVENT,
};
pub use repository::AlertRepository;
pub use telegram::{FlushSummary, TelegramMessage, TelegramSender};
