//! Catalogue of scheduled jobs

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use serde::{Serialize, Serializer};

use super::schedule::Schedule;
use crate::error::Error;

/// Every job the scheduler knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    CheckPlanUsage,
    LockDashboards,
    CheckLeftEvents,
    CheckOnlineUsersAlerts,
    CheckMetricAlerts,
    FlushTelegramOutbox,
    TrialReminder,
    TrialEnd,
    FixMissingTrialEndDates,
    CleanUpCancelledSubscriptions,
    ProcessSessionDurations,
    CleanUpSessions,
    GenerateSessionSalt,
    DeleteOldShareInvitations,
    DeleteOldRefreshTokens,
    ClearUnconfirmedTelegramChats,
    DisableReportsForInactiveUsers,
    SendWeeklyReports,
    SendMonthlyReports,
    SendQuarterlyReports,
    SendWeeklySubscriberReports,
    SendMonthlySubscriberReports,
    SendQuarterlySubscriberReports,
    DropAnalyticsLogs,
    TagNewExtensions,
    TagTrendingExtensions,
}

impl Job {
    /// All jobs in catalogue order
    pub const ALL: [Job; 26] = [
        Self::CheckPlanUsage,
        Self::LockDashboards,
        Self::CheckLeftEvents,
        Self::CheckOnlineUsersAlerts,
        Self::CheckMetricAlerts,
        Self::FlushTelegramOutbox,
        Self::TrialReminder,
        Self::TrialEnd,
        Self::FixMissingTrialEndDates,
        Self::CleanUpCancelledSubscriptions,
        Self::ProcessSessionDurations,
        Self::CleanUpSessions,
        Self::GenerateSessionSalt,
        Self::DeleteOldShareInvitations,
        Self::DeleteOldRefreshTokens,
        Self::ClearUnconfirmedTelegramChats,
        Self::DisableReportsForInactiveUsers,
        Self::SendWeeklyReports,
        Self::SendMonthlyReports,
        Self::SendQuarterlyReports,
        Self::SendWeeklySubscriberReports,
        Self::SendMonthlySubscriberReports,
        Self::SendQuarterlySubscriberReports,
        Self::DropAnalyticsLogs,
        Self::TagNewExtensions,
        Self::TagTrendingExtensions,
    ];

    /// Stable kebab-case name
    pub fn name(self) -> &'static str {
        match self {
            Self::CheckPlanUsage => "check-plan-usage",
            Self::LockDashboards => "lock-dashboards",
            Self::CheckLeftEvents => "check-left-events",
            Self::CheckOnlineUsersAlerts => "check-online-users-alerts",
            Self::CheckMetricAlerts => "check-metric-alerts",
            Self::FlushTelegramOutbox => "flush-telegram-outbox",
            Self::TrialReminder => "trial-reminder",
            Self::TrialEnd => "trial-end",
            Self::FixMissingTrialEndDates => "fix-missing-trial-end-dates",
            Self::CleanUpCancelledSubscriptions => "clean-up-cancelled-subscriptions",
            Self::ProcessSessionDurations => "process-session-durations",
            Self::CleanUpSessions => "clean-up-sessions",
            Self::GenerateSessionSalt => "generate-session-salt",
            Self::DeleteOldShareInvitations => "delete-old-share-invitations",
            Self::DeleteOldRefreshTokens => "delete-old-refresh-tokens",
            Self::ClearUnconfirmedTelegramChats => "clear-unconfirmed-telegram-chats",
            Self::DisableReportsForInactiveUsers => "disable-reports-for-inactive-users",
            Self::SendWeeklyReports => "send-weekly-reports",
            Self::SendMonthlyReports => "send-monthly-reports",
            Self::SendQuarterlyReports => "send-quarterly-reports",
            Self::SendWeeklySubscriberReports => "send-weekly-subscriber-reports",
            Self::SendMonthlySubscriberReports => "send-monthly-subscriber-reports",
            Self::SendQuarterlySubscriberReports => "send-quarterly-subscriber-reports",
            Self::DropAnalyticsLogs => "drop-analytics-logs",
            Self::TagNewExtensions => "tag-new-extensions",
            Self::TagTrendingExtensions => "tag-trending-extensions",
        }
    }

    /// When the job fires
    pub fn schedule(self) -> Schedule {
        const MIDNIGHT: Schedule = Schedule::Daily { hour: 0, minute: 0 };
        const QUARTER_START: Schedule = Schedule::Quarterly {
            day: 1,
            hour: 0,
            minute: 0,
        };

        match self {
            Self::CheckPlanUsage => Schedule::Daily { hour: 16, minute: 0 },
            Self::LockDashboards => Schedule::Daily { hour: 17, minute: 0 },
            Self::CheckLeftEvents => Schedule::Daily { hour: 9, minute: 0 },
            Self::CheckOnlineUsersAlerts | Self::CheckMetricAlerts => Schedule::minutes(5),
            Self::FlushTelegramOutbox => Schedule::Every(Duration::from_secs(5)),
            Self::TrialReminder => Schedule::hours(4),
            Self::TrialEnd | Self::CleanUpCancelledSubscriptions => Schedule::hours(2),
            Self::FixMissingTrialEndDates => Schedule::minutes(10),
            Self::ProcessSessionDurations => Schedule::minutes(1),
            Self::CleanUpSessions | Self::GenerateSessionSalt | Self::DropAnalyticsLogs => MIDNIGHT,
            Self::DeleteOldShareInvitations => Schedule::hours(2),
            Self::DeleteOldRefreshTokens => Schedule::Daily { hour: 1, minute: 0 },
            Self::ClearUnconfirmedTelegramChats => Schedule::minutes(30),
            Self::DisableReportsForInactiveUsers => Schedule::Weekly {
                weekday: Weekday::Sun,
                hour: 2,
                minute: 0,
            },
            Self::SendWeeklyReports => Schedule::Weekly {
                weekday: Weekday::Sun,
                hour: 2,
                minute: 30,
            },
            Self::SendMonthlyReports => Schedule::Monthly {
                day: 1,
                hour: 2,
                minute: 0,
            },
            Self::SendWeeklySubscriberReports => Schedule::Weekly {
                weekday: Weekday::Sun,
                hour: 3,
                minute: 0,
            },
            Self::SendMonthlySubscriberReports => Schedule::Monthly {
                day: 1,
                hour: 3,
                minute: 0,
            },
            Self::SendQuarterlyReports | Self::SendQuarterlySubscriberReports => QUARTER_START,
            Self::TagNewExtensions | Self::TagTrendingExtensions => Schedule::Hourly { minute: 0 },
        }
    }

    /// One-line summary for listings
    pub fn description(self) -> &'static str {
        match self {
            Self::CheckPlanUsage => "Email accounts whose usage went over their plan",
            Self::LockDashboards => "Block dashboards of accounts that did not upgrade in time",
            Self::CheckLeftEvents => "Warn accounts that used most of their monthly events",
            Self::CheckOnlineUsersAlerts => "Evaluate online users alerts",
            Self::CheckMetricAlerts => "Evaluate page view and custom event alerts",
            Self::FlushTelegramOutbox => "Send queued Telegram messages",
            Self::TrialReminder => "Remind trials ending within a day",
            Self::TrialEnd => "End expired trials",
            Self::FixMissingTrialEndDates => "Set end dates on trials that lack one",
            Self::CleanUpCancelledSubscriptions => {
                "Downgrade accounts whose cancellation took effect"
            }
            Self::ProcessSessionDurations => "Store durations of idle sessions",
            Self::CleanUpSessions => "Clear old session ids from analytics",
            Self::GenerateSessionSalt => "Rotate the session id salt",
            Self::DeleteOldShareInvitations => "Delete unanswered share invitations",
            Self::DeleteOldRefreshTokens => "Delete expired refresh tokens",
            Self::ClearUnconfirmedTelegramChats => "Forget unconfirmed Telegram chats",
            Self::DisableReportsForInactiveUsers => "Turn off reports for inactive accounts",
            Self::SendWeeklyReports => "Email owners their weekly project report",
            Self::SendMonthlyReports => "Email owners their monthly project report",
            Self::SendQuarterlyReports => "Email owners their quarterly project report",
            Self::SendWeeklySubscriberReports => "Email project subscribers a weekly report",
            Self::SendMonthlySubscriberReports => "Email project subscribers a monthly report",
            Self::SendQuarterlySubscriberReports => "Email project subscribers a quarterly report",
            Self::DropAnalyticsLogs => "Drop analytics server log tables",
            Self::TagNewExtensions => "Tag recently published extensions",
            Self::TagTrendingExtensions => "Tag extensions with fast growing installs",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Job {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|job| job.name() == s)
            .ok_or_else(|| Error::not_found("job", s))
    }
}

impl Serialize for Job {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}
