//! Human-readable durations for retention and timeout settings.
//!
//! Accepts the long form used by artifact retention (`"1 week"`, `"2 days"`,
//! `"1 month"`) and the compact form used for timeouts (`"90s"`, `"30m"`, `"2h"`).
//! A month counts as 30 days and a year as 365 days.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// A duration that remembers how it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HumanDuration {
    text: String,
    duration: Duration,
}

impl HumanDuration {
    pub fn as_duration(&self) -> Duration {
        self.duration
    }

    /// Convert to a `chrono::Duration` for timestamp arithmetic.
    pub fn to_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.duration.as_secs()).unwrap_or(i64::MAX))
    }
}

impl FromStr for HumanDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let invalid = |reason: &str| ConfigError::InvalidDuration {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid("missing unit"))?;
        let (amount, unit) = text.split_at(split);
        let amount: u64 = amount.parse().map_err(|_| invalid("missing amount"))?;

        let unit_secs = match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
            "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
            "d" | "day" | "days" => DAY,
            "w" | "week" | "weeks" => 7 * DAY,
            "mo" | "month" | "months" => 30 * DAY,
            "y" | "year" | "years" => 365 * DAY,
            _ => return Err(invalid("unknown unit")),
        };

        let secs = amount
            .checked_mul(unit_secs)
            .ok_or_else(|| invalid("overflow"))?;

        Ok(Self {
            text: text.to_string(),
            duration: Duration::from_secs(secs),
        })
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HumanDuration> for String {
    fn from(value: HumanDuration) -> Self {
        value.text
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
