use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::UsageDoc;

/// Source of the current time for a renewal pass
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Start of the billing period (UTC calendar month) containing `at`
pub fn period_start(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at)
}

/// Start of the billing period preceding the one containing `at`
pub fn previous_period_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let start = period_start(at);
    start.checked_sub_months(Months::new(1)).unwrap_or(start)
}

/// Milliseconds a fetched snapshot has to move forward so it opens inside the
/// billing period containing `now`. Zero when it already does.
pub fn millis_to_add(doc: &UsageDoc, now: DateTime<Utc>) -> i64 {
    let boundary = period_start(now).timestamp_millis();
    if doc.start >= boundary {
        0
    } else {
        boundary - doc.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlackUnit {
    Months,
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl SlackUnit {
    fn symbol(&self) -> char {
        match self {
            SlackUnit::Months => 'M',
            SlackUnit::Days => 'D',
            SlackUnit::Hours => 'h',
            SlackUnit::Minutes => 'm',
            SlackUnit::Seconds => 's',
        }
    }
}

/// Retention window of the aggregator, written as `<width><unit>` (`1M`, `2D`, `12h`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slack {
    pub width: u32,
    pub unit: SlackUnit,
}

impl Default for Slack {
    fn default() -> Self {
        Self {
            width: 2,
            unit: SlackUnit::Days,
        }
    }
}

impl Slack {
    /// The instant `self` before `at`
    pub fn before(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = i64::from(self.width);
        match self.unit {
            SlackUnit::Months => at.checked_sub_months(Months::new(self.width)).unwrap_or(at),
            SlackUnit::Days => at - Duration::days(width),
            SlackUnit::Hours => at - Duration::hours(width),
            SlackUnit::Minutes => at - Duration::minutes(width),
            SlackUnit::Seconds => at - Duration::seconds(width),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid slack window {0:?}, expected <number><M|D|h|m|s>")]
pub struct InvalidSlack(String);

impl FromStr for Slack {
    type Err = InvalidSlack;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        let unit = match chars.next_back() {
            Some('M') => SlackUnit::Months,
            Some('D') => SlackUnit::Days,
            Some('h') => SlackUnit::Hours,
            Some('m') => SlackUnit::Minutes,
            Some('s') => SlackUnit::Seconds,
            _ => return Err(InvalidSlack(s.to_string())),
        };
        let width = chars
            .as_str()
            .parse::<u32>()
            .map_err(|_| InvalidSlack(s.to_string()))?;
        if width == 0 {
            return Err(InvalidSlack(s.to_string()));
        }
        Ok(Self { width, unit })
    }
}

impl TryFrom<String> for Slack {
    type Error = InvalidSlack;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Slack> for String {
    fn from(slack: Slack) -> Self {
        slack.to_string()
    }
}

impl fmt::Display for Slack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.width, self.unit.symbol())
    }
}

/// Carry-over timestamps (epoch millis) due for renewal at `now`:
/// `[start(previous period) - slack, start(current period))`
pub fn due_window(now: DateTime<Utc>, slack: &Slack) -> (i64, i64) {
    let from = slack.before(previous_period_start(now));
    (from.timestamp_millis(), period_start(now).timestamp_millis())
}
