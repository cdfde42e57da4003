//! Plan limit arithmetic shared by the usage jobs

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};

use crate::analytics::PlanUsage;
use crate::models::{PlanCode, User};

/// Midnight UTC on the first day of the month containing `now`
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    let first = date - Days::new(u64::from(date.day0()));
    first.and_time(NaiveTime::MIN).and_utc()
}

/// Midnight UTC on the first day of the month before the one containing `now`
pub fn previous_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let last_day_before = month_start(now) - Days::new(1);
    month_start(last_day_before)
}

/// Index usage rows by account id
pub fn usage_by_user(usage: &[PlanUsage]) -> HashMap<String, u64> {
    usage.iter().map(|row| (row.id.clone(), row.count)).collect()
}

/// Whether `count` goes above the plan limit plus the allowed share on top
pub fn exceeds_plan(plan: PlanCode, count: u64, allowed_exceed: f64) -> bool {
    let limit = plan.monthly_usage_limit() as f64;
    count as f64 > limit * (1.0 + allowed_exceed)
}

/// Users above their plan plus the allowance, with their usage
pub fn users_exceeding_plan<'a>(
    users: &'a [User],
    usage: &HashMap<String, u64>,
    allowed_exceed: f64,
) -> Vec<(&'a User, u64)> {
    users
        .iter()
        .filter_map(|user| {
            let count = *usage.get(&user.id.to_string())?;
            exceeds_plan(user.plan_code, count, allowed_exceed).then_some((user, count))
        })
        .collect()
}

/// Users above their plan limit in both months, with `(this, last)` usage
pub fn users_exceeding_continuously<'a>(
    users: &[&'a User],
    this_month: &HashMap<String, u64>,
    last_month: &HashMap<String, u64>,
) -> Vec<(&'a User, u64, u64)> {
    users
        .iter()
        .filter_map(|user| {
            let id = user.id.to_string();
            let this = *this_month.get(&id)?;
            let last = *last_month.get(&id)?;

            (exceeds_plan(user.plan_code, this, 0.0) && exceeds_plan(user.plan_code, last, 0.0))
                .then_some((*user, this, last))
        })
        .collect()
}
