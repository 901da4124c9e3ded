//! Bar granularities and bucket alignment.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SchemaError;

/// Bar granularity.
///
/// Sub-day granularities are fixed durations aligned on the Unix epoch.
/// Day, week and month follow UTC calendar boundaries (ISO weeks start
/// on Monday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
}

impl Granularity {
    /// Duration in seconds for fixed-duration granularities, `None` for
    /// calendar ones.
    #[must_use]
    pub const fn fixed_seconds(&self) -> Option<i64> {
        match self {
            Self::Minute1 => Some(60),
            Self::Minute5 => Some(300),
            Self::Minute15 => Some(900),
            Self::Hour1 => Some(3600),
            Self::Hour4 => Some(14_400),
            Self::Day1 | Self::Week1 | Self::Month1 => None,
        }
    }

    #[must_use]
    pub const fn is_calendar(&self) -> bool {
        self.fixed_seconds().is_none()
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Minute1 => "1m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
            Self::Week1 => "1w",
            Self::Month1 => "1M",
        }
    }

    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Minute1,
            Self::Minute5,
            Self::Minute15,
            Self::Hour1,
            Self::Hour4,
            Self::Day1,
            Self::Week1,
            Self::Month1,
        ]
    }

    /// Start of the bucket containing `ts`.
    ///
    /// Total and deterministic: every timestamp maps to exactly one
    /// bucket, regardless of arrival order.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(secs) = self.fixed_seconds() {
            let epoch = ts.timestamp();
            let aligned = epoch - epoch.rem_euclid(secs);
            return DateTime::from_timestamp(aligned, 0).unwrap_or(ts);
        }

        let date = ts.date_naive();
        let first = match self {
            Self::Week1 => {
                let back = u64::from(date.weekday().num_days_from_monday());
                date.checked_sub_days(Days::new(back)).unwrap_or(date)
            }
            Self::Month1 => date.with_day(1).unwrap_or(date),
            _ => date,
        };
        start_of_day(first)
    }

    /// Start of the bucket following the one starting at `start`.
    ///
    /// `start` is expected to be aligned (see [`Granularity::bucket_start`]).
    pub fn next_bucket_start(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(secs) = self.fixed_seconds() {
            return start + chrono::TimeDelta::seconds(secs);
        }

        let date = start.date_naive();
        let next = match self {
            Self::Week1 => date.checked_add_days(Days::new(7)),
            Self::Month1 => date.checked_add_months(Months::new(1)),
            _ => date.checked_add_days(Days::new(1)),
        };
        next.map(start_of_day).unwrap_or(start)
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" (month) and "1m" (minute) differ only by case
        if s == "1M" {
            return Ok(Self::Month1);
        }
        match s.to_lowercase().as_str() {
            "1m" | "m1" | "minute" => Ok(Self::Minute1),
            "5m" | "m5" => Ok(Self::Minute5),
            "15m" | "m15" => Ok(Self::Minute15),
            "1h" | "h1" | "hour" => Ok(Self::Hour1),
            "4h" | "h4" => Ok(Self::Hour4),
            "1d" | "d1" | "day" | "daily" => Ok(Self::Day1),
            "1w" | "w1" | "week" | "weekly" => Ok(Self::Week1),
            "mo1" | "month" | "monthly" => Ok(Self::Month1),
            _ => Err(SchemaError::UnknownGranularity(s.to_string())),
        }
    }
}
