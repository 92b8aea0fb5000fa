//! Calendar-aligned time bucketing
//!
//! Splits `[from, to)` into day, week (Monday start) or month buckets and
//! folds score records into them. Empty buckets are always emitted so charts
//! show gaps. The first and last bucket are clipped to the requested range.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::models::ScoreRecord;

/// Calendar unit of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Start of the calendar unit containing `date`
    pub fn floor(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Day => date,
            Granularity::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Granularity::Month => date.with_day(1).unwrap_or(date),
        }
    }

    /// First unit boundary strictly after `date`, None past the calendar's end
    pub fn next_boundary(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Granularity::Day => date.succ_opt(),
            Granularity::Week => self.floor(date).checked_add_signed(Duration::days(7)),
            Granularity::Month => self.floor(date).checked_add_months(Months::new(1)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            other => Err(CoreError::validation(
                "granularity",
                format!("expected day|week|month, got '{}'", other),
            )),
        }
    }
}

/// One bucket of aggregated practice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    /// Inclusive
    pub start: NaiveDate,
    /// Exclusive
    pub end: NaiveDate,
    pub sessions: usize,
    pub duration_ms: u64,
}

impl TimeBucket {
    fn empty(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            sessions: 0,
            duration_ms: 0,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.sessions == 0
    }
}

/// Split `[from, to)` into empty calendar-aligned buckets
///
/// Returns an empty vec when `from >= to`.
pub fn split_range(from: NaiveDate, to: NaiveDate, granularity: Granularity) -> Vec<TimeBucket> {
    let mut buckets = Vec::new();
    let mut cursor = from;

    while cursor < to {
        let end = granularity
            .next_boundary(cursor)
            .map(|boundary| boundary.min(to))
            .unwrap_or(to);
        buckets.push(TimeBucket::empty(cursor, end));
        cursor = end;
    }

    buckets
}

/// Calendar date of a timestamp in the given offset
pub fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

/// UTC instant at which `date` begins in the given offset
///
/// None when the instant falls outside chrono's range (first or last day of
/// the calendar shifted by the offset).
pub fn day_start_utc(date: NaiveDate, offset: FixedOffset) -> Option<DateTime<Utc>> {
    date.and_time(chrono::NaiveTime::MIN)
        .checked_sub_signed(Duration::seconds(i64::from(offset.local_minus_utc())))
        .map(|utc| utc.and_utc())
}

/// Bucket score records by `played_at`
///
/// Records whose local date falls outside `[from, to)` are dropped.
///
/// # Errors
/// `CoreError::Compute` if a bucket's summed duration overflows.
pub fn bucket_scores(
    scores: &[ScoreRecord],
    from: NaiveDate,
    to: NaiveDate,
    granularity: Granularity,
    offset: FixedOffset,
) -> Result<Vec<TimeBucket>, CoreError> {
    let mut buckets = split_range(from, to, granularity);
    let mut dropped = 0usize;

    for score in scores {
        let date = local_date(score.played_at, offset);
        if date < from || date >= to {
            dropped += 1;
            continue;
        }

        // Buckets are sorted and contiguous: the last one starting at or
        // before `date` contains it.
        let idx = buckets.partition_point(|b| b.start <= date) - 1;
        let bucket = &mut buckets[idx];
        bucket.sessions += 1;
        bucket.duration_ms = bucket
            .duration_ms
            .checked_add(score.duration_ms)
            .ok_or_else(|| {
                CoreError::compute(format!(
                    "practice time overflow in bucket starting {}",
                    bucket.start
                ))
            })?;
    }

    if dropped > 0 {
        tracing::trace!(dropped, %from, %to, "Scores outside bucket range ignored");
    }

    Ok(buckets)
}
