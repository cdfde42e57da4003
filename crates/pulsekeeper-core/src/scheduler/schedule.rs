//! Fire times of recurring jobs, all in UTC

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveTime, SubsecRound, Timelike, Utc, Weekday,
};

/// When a job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Every multiple of the period since the Unix epoch
    Every(StdDuration),
    /// Once an hour at the given minute
    Hourly { minute: u32 },
    /// Once a day
    Daily { hour: u32, minute: u32 },
    /// Once a week
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// Once a month on `day`, clamped to 1..=28
    Monthly { day: u32, hour: u32, minute: u32 },
    /// On `day` of January, April, July and October
    Quarterly { day: u32, hour: u32, minute: u32 },
}

impl Schedule {
    /// Shorthand for [`Schedule::Every`] in minutes
    pub const fn minutes(n: u64) -> Self {
        Self::Every(StdDuration::from_secs(n * 60))
    }

    /// Shorthand for [`Schedule::Every`] in hours
    pub const fn hours(n: u64) -> Self {
        Self::Every(StdDuration::from_secs(n * 3600))
    }

    /// The first fire time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();

        match *self {
            Self::Every(period) => {
                let secs = period_secs(period);
                let base = now.trunc_subsecs(0);
                base + Duration::seconds(secs - base.timestamp().rem_euclid(secs))
            }
            Self::Hourly { minute } => {
                let candidate = midnight
                    + Duration::hours(i64::from(now.hour()))
                    + Duration::minutes(i64::from(minute));
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::hours(1)
                }
            }
            Self::Daily { hour, minute } => {
                let candidate = midnight + time_of_day(hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let days_ahead = (7 + weekday.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let candidate =
                    midnight + Duration::days(i64::from(days_ahead)) + time_of_day(hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::weeks(1)
                }
            }
            Self::Monthly { day, hour, minute } => {
                let candidate = month_start(now) + day_and_time(day, hour, minute);
                if candidate > now {
                    candidate
                } else {
                    add_months(candidate, 1)
                }
            }
            Self::Quarterly { day, hour, minute } => {
                let month = month_start(now);
                let quarter = month
                    .checked_sub_months(Months::new(now.month0() % 3))
                    .unwrap_or(month);
                let candidate = quarter + day_and_time(day, hour, minute);
                if candidate > now {
                    candidate
                } else {
                    add_months(candidate, 3)
                }
            }
        }
    }

    /// Longest possible gap between two fire times
    pub fn period(&self) -> Duration {
        match *self {
            Self::Every(period) => Duration::seconds(period_secs(period)),
            Self::Hourly { .. } => Duration::hours(1),
            Self::Daily { .. } => Duration::days(1),
            Self::Weekly { .. } => Duration::weeks(1),
            Self::Monthly { .. } => Duration::days(31),
            Self::Quarterly { .. } => Duration::days(92),
        }
    }
}

/// Whole seconds of a period, at least one and at most a century
fn period_secs(period: StdDuration) -> i64 {
    const CENTURY: i64 = 100 * 365 * 86_400;
    i64::try_from(period.as_secs()).unwrap_or(CENTURY).clamp(1, CENTURY)
}

fn time_of_day(hour: u32, minute: u32) -> Duration {
    Duration::hours(i64::from(hour)) + Duration::minutes(i64::from(minute))
}

/// Offset from the first of a month; days past the 28th would not exist every month
fn day_and_time(day: u32, hour: u32, minute: u32) -> Duration {
    Duration::days(i64::from(day.clamp(1, 28)) - 1) + time_of_day(hour, minute)
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc() - Duration::days(i64::from(now.day0()))
}

fn add_months(at: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    at.checked_add_months(Months::new(months)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(period) => write!(f, "every {}", humantime::format_duration(*period)),
            Self::Hourly { minute } => write!(f, "hourly at :{minute:02}"),
            Self::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02} UTC"),
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly on {weekday} at {hour:02}:{minute:02} UTC"),
            Self::Monthly { day, hour, minute } => {
                write!(f, "monthly on day {day} at {hour:02}:{minute:02} UTC")
            }
            Self::Quarterly { day, hour, minute } => {
                write!(f, "quarterly on day {day} at {hour:02}:{minute:02} UTC")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[rstest]
    #[case(Schedule::minutes(5), at(2024, 5, 20, 10, 3, 12), at(2024, 5, 20, 10, 5, 0))]
    #[case(Schedule::minutes(5), at(2024, 5, 20, 10, 5, 0), at(2024, 5, 20, 10, 10, 0))]
    #[case(Schedule::hours(2), at(2024, 5, 20, 23, 0, 0), at(2024, 5, 21, 0, 0, 0))]
    #[case(Schedule::Hourly { minute: 0 }, at(2024, 5, 20, 10, 0, 0), at(2024, 5, 20, 11, 0, 0))]
    #[case(Schedule::Daily { hour: 16, minute: 0 }, at(2024, 5, 20, 15, 59, 59), at(2024, 5, 20, 16, 0, 0))]
    #[case(Schedule::Daily { hour: 16, minute: 0 }, at(2024, 5, 20, 16, 0, 0), at(2024, 5, 21, 16, 0, 0))]
    #[case(Schedule::Daily { hour: 0, minute: 0 }, at(2024, 12, 31, 12, 0, 0), at(2025, 1, 1, 0, 0, 0))]
    // 2024-05-20 is a Monday
    #[case(Schedule::Weekly { weekday: Weekday::Sun, hour: 2, minute: 0 }, at(2024, 5, 20, 9, 0, 0), at(2024, 5, 26, 2, 0, 0))]
    #[case(Schedule::Weekly { weekday: Weekday::Sun, hour: 2, minute: 0 }, at(2024, 5, 26, 2, 0, 0), at(2024, 6, 2, 2, 0, 0))]
    #[case(Schedule::Monthly { day: 1, hour: 2, minute: 0 }, at(2024, 5, 20, 9, 0, 0), at(2024, 6, 1, 2, 0, 0))]
    #[case(Schedule::Monthly { day: 1, hour: 2, minute: 0 }, at(2024, 12, 1, 2, 0, 0), at(2025, 1, 1, 2, 0, 0))]
    #[case(Schedule::Monthly { day: 1, hour: 2, minute: 0 }, at(2024, 6, 1, 1, 59, 0), at(2024, 6, 1, 2, 0, 0))]
    #[case(Schedule::Quarterly { day: 1, hour: 0, minute: 0 }, at(2024, 5, 20, 9, 0, 0), at(2024, 7, 1, 0, 0, 0))]
    #[case(Schedule::Quarterly { day: 1, hour: 0, minute: 0 }, at(2024, 10, 1, 0, 0, 0), at(2025, 1, 1, 0, 0, 0))]
    #[case(Schedule::Quarterly { day: 1, hour: 0, minute: 0 }, at(2024, 12, 31, 23, 0, 0), at(2025, 1, 1, 0, 0, 0))]
    fn next_fire_time(
        #[case] schedule: Schedule,
        #[case] now: DateTime<Utc>,
        #[case] expected: DateTime<Utc>,
    ) {
        assert_eq!(schedule.next_after(now), expected);
    }

    #[test]
    fn displays_for_humans() {
        assert_eq!(Schedule::minutes(5).to_string(), "every 5m");
        assert_eq!(
            Schedule::Daily { hour: 9, minute: 0 }.to_string(),
            "daily at 09:00 UTC"
        );
        assert_eq!(
            Schedule::Weekly {
                weekday: Weekday::Sun,
                hour: 2,
                minute: 0
            }
            .to_string(),
            "weekly on Sun at 02:00 UTC"
        );
        assert_eq!(
            Schedule::Quarterly {
                day: 1,
                hour: 0,
                minute: 0
            }
            .to_string(),
            "quarterly on day 1 at 00:00 UTC"
        );
    }

    fn schedules() -> impl Strategy<Value = Schedule> {
        prop_oneof![
            (1u64..=86_400).prop_map(|s| Schedule::Every(StdDuration::from_secs(s))),
            (0u32..60).prop_map(|minute| Schedule::Hourly { minute }),
            (0u32..24, 0u32..60).prop_map(|(hour, minute)| Schedule::Daily { hour, minute }),
            (0u8..7, 0u32..24, 0u32..60).prop_map(|(day, hour, minute)| Schedule::Weekly {
                weekday: Weekday::try_from(day).unwrap_or(Weekday::Mon),
                hour,
                minute,
            }),
            (1u32..=28, 0u32..24, 0u32..60)
                .prop_map(|(day, hour, minute)| Schedule::Monthly { day, hour, minute }),
            (1u32..=28, 0u32..24, 0u32..60)
                .prop_map(|(day, hour, minute)| Schedule::Quarterly { day, hour, minute }),
        ]
    }

    proptest! {
        #[test]
        fn next_is_strictly_later_and_within_one_period(
            schedule in schedules(),
            secs in 0i64..4_102_444_800,
            nanos in 0u32..1_000_000_000,
        ) {
            let now = Utc.timestamp_opt(secs, nanos).unwrap();
            let next = schedule.next_after(now);

            prop_assert!(next > now);
            prop_assert!(next - now <= schedule.period());
            prop_assert_eq!(schedule.next_after(next - Duration::nanoseconds(1)), next);
        }
    }
}
