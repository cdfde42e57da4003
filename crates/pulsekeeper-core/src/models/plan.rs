//! Account plans and their limits

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Subscription plan of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PlanCode {
    /// No active subscription
    #[default]
    #[serde(rename = "none")]
    None,
    /// Free tier
    #[serde(rename = "free")]
    Free,
    /// Trial period
    #[serde(rename = "trial")]
    Trial,
    #[serde(rename = "hobby")]
    Hobby,
    #[serde(rename = "freelancer")]
    Freelancer,
    #[serde(rename = "200k")]
    Plus200k,
    #[serde(rename = "500k")]
    Plus500k,
    #[serde(rename = "startup")]
    Startup,
    #[serde(rename = "2m")]
    Plus2m,
    #[serde(rename = "enterprise")]
    Enterprise,
    #[serde(rename = "10m")]
    Plus10m,
}

/// Paid tiers ordered by their monthly limit
const UPGRADE_PATH: [PlanCode; 8] = [
    PlanCode::Hobby,
    PlanCode::Freelancer,
    PlanCode::Plus200k,
    PlanCode::Plus500k,
    PlanCode::Startup,
    PlanCode::Plus2m,
    PlanCode::Enterprise,
    PlanCode::Plus10m,
];

impl PlanCode {
    /// Stored representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Free => "free",
            Self::Trial => "trial",
            Self::Hobby => "hobby",
            Self::Freelancer => "freelancer",
            Self::Plus200k => "200k",
            Self::Plus500k => "500k",
            Self::Startup => "startup",
            Self::Plus2m => "2m",
            Self::Enterprise => "enterprise",
            Self::Plus10m => "10m",
        }
    }

    /// Number of events the plan includes per calendar month
    pub fn monthly_usage_limit(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Free => 5_000,
            Self::Trial => 100_000,
            Self::Hobby => 10_000,
            Self::Freelancer => 100_000,
            Self::Plus200k => 200_000,
            Self::Plus500k => 500_000,
            Self::Startup => 1_000_000,
            Self::Plus2m => 2_000_000,
            Self::Enterprise => 5_000_000,
            Self::Plus10m => 10_000_000,
        }
    }

    /// Whether the plan is a paid subscription
    pub fn is_paid(self) -> bool {
        !matches!(self, Self::None | Self::Free | Self::Trial)
    }

    /// The cheapest paid tier with a larger monthly limit
    pub fn next_plan(self) -> Option<PlanCode> {
        let limit = self.monthly_usage_limit();
        UPGRADE_PATH
            .into_iter()
            .find(|plan| plan.monthly_usage_limit() > limit)
    }
}

impl fmt::Display for PlanCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let plan = match s {
            "none" => Self::None,
            "free" => Self::Free,
            "trial" => Self::Trial,
            "hobby" => Self::Hobby,
            "freelancer" => Self::Freelancer,
            "200k" => Self::Plus200k,
            "500k" => Self::Plus500k,
            "startup" => Self::Startup,
            "2m" => Self::Plus2m,
            "enterprise" => Self::Enterprise,
            "10m" => Self::Plus10m,
            other => return Err(Error::validation(format!("unknown plan code '{other}'"))),
        };
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PlanCode::None, Some(PlanCode::Hobby))]
    #[case(PlanCode::Free, Some(PlanCode::Hobby))]
    #[case(PlanCode::Hobby, Some(PlanCode::Freelancer))]
    #[case(PlanCode::Trial, Some(PlanCode::Plus200k))]
    #[case(PlanCode::Startup, Some(PlanCode::Plus2m))]
    #[case(PlanCode::Plus10m, None)]
    fn next_plan_has_larger_limit(#[case] plan: PlanCode, #[case] expected: Option<PlanCode>) {
        assert_eq!(plan.next_plan(), expected);
    }

    #[test]
    fn parses_stored_codes() {
        for plan in UPGRADE_PATH {
            assert_eq!(plan.as_str().parse::<PlanCode>().unwrap(), plan);
        }
        assert!("platinum".parse::<PlanCode>().is_err());
    }

    #[test]
    fn only_subscriptions_are_paid() {
        assert!(!PlanCode::None.is_paid());
        assert!(!PlanCode::Trial.is_paid());
        assert!(PlanCode::Hobby.is_paid());
    }
}
