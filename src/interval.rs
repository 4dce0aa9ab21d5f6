use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt::{self, Display};

use crate::DATE_FORMAT;

/// A half-open interval of time `[begin, end)`. Instants at `begin` are
/// inside the interval, instants at `end` are outside it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interval {
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Interval {
    /// Creates an interval `[begin, end)`. Returns None if `end` is before
    /// `begin`.
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Option<Interval> {
        if end < begin {
            return None;
        }
        Some(Interval { begin, end })
    }

    /// The most recent aggregation window whose grace period has elapsed:
    /// `end` is `now - grace_period` truncated to a multiple of
    /// `aggregation_period`, and `begin` is one period earlier.
    pub fn aggregation_window(
        now: DateTime<Utc>,
        aggregation_period: Duration,
        grace_period: Duration,
    ) -> Interval {
        let end = truncate_to_period(now - grace_period, aggregation_period);
        Interval {
            begin: end - aggregation_period,
            end,
        }
    }

    /// The unique window of width `aggregation_period`, aligned to a multiple
    /// of that period relative to the epoch, that contains `timestamp`.
    pub fn window_containing(timestamp: DateTime<Utc>, aggregation_period: Duration) -> Interval {
        let begin = truncate_to_period(timestamp, aggregation_period);
        Interval {
            begin,
            end: begin + aggregation_period,
        }
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.begin
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// True if the provided instant falls within the interval. The interval
    /// is half-open: `begin` is contained, `end` is not.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.begin <= timestamp && timestamp < self.end
    }

    /// The smallest set of `YYYY/MM/DD/HH` path prefixes that covers the
    /// interval. Cloud listings performed under these prefixes may include
    /// objects from the fractional hours at either end of the interval, so
    /// callers must still filter listed objects against `contains`.
    pub fn hour_prefixes(&self) -> Vec<String> {
        let mut prefixes = Vec::new();
        let mut hour = truncate_to_period(self.begin, Duration::hours(1));
        while hour < self.end {
            prefixes.push(hour.format("%Y/%m/%d/%H").to_string());
            hour += Duration::hours(1);
        }
        prefixes
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.begin.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// Truncates `timestamp` to the nearest multiple of `period`, rounding toward
/// negative infinity relative to the Unix epoch.
pub fn truncate_to_period(timestamp: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_seconds = period.num_seconds();
    let truncated = timestamp.timestamp().div_euclid(period_seconds) * period_seconds;
    Utc.timestamp_opt(truncated, 0).unwrap()
}
