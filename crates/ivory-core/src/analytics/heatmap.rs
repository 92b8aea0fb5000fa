//! Yearly practice heatmap
//!
//! One cell per calendar date of the year, each mapped to a discrete intensity
//! level, plus streak and total statistics.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HeatmapConfig;
use crate::error::CoreError;
use crate::models::ScoreRecord;
use crate::time::{bucket_scores, day_start_utc, Granularity};

/// One calendar date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapDay {
    pub date: NaiveDate,
    pub level: u8,
    /// Raw practice time
    pub duration_ms: u64,
    pub sessions: usize,
}

impl HeatmapDay {
    pub fn is_active(&self) -> bool {
        self.duration_ms > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapTotals {
    pub active_days: usize,
    /// Consecutive active days ending today
    pub current_streak: usize,
    pub longest_streak: usize,
    pub total_duration_ms: u64,
    pub total_sessions: usize,
}

/// Heatmap for one user and year
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapData {
    pub year: i32,
    /// Number of distinct levels, level 0 included
    pub levels: usize,
    /// Every date of the year, chronological
    pub days: Vec<HeatmapDay>,
    pub totals: HeatmapTotals,
}

impl HeatmapData {
    pub fn day(&self, date: NaiveDate) -> Option<&HeatmapDay> {
        self.days
            .binary_search_by_key(&date, |d| d.date)
            .ok()
            .map(|idx| &self.days[idx])
    }

    /// Days per level, indexed by level
    pub fn level_histogram(&self) -> Vec<usize> {
        let mut histogram = vec![0; self.levels];
        for day in &self.days {
            if let Some(slot) = histogram.get_mut(usize::from(day.level)) {
                *slot += 1;
            }
        }
        histogram
    }
}

/// `[Jan 1 of year, Jan 1 of year + 1)`
pub fn year_bounds(year: i32) -> Result<(NaiveDate, NaiveDate), CoreError> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1);
    let end = year
        .checked_add(1)
        .and_then(|next| NaiveDate::from_ymd_opt(next, 1, 1));

    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(CoreError::validation(
            "year",
            format!("{} is outside the supported calendar range", year),
        )),
    }
}

/// UTC instants bounding `year` in the given offset
///
/// Rejects years whose local bounds cannot be expressed as UTC instants.
pub fn year_range_utc(
    year: i32,
    offset: FixedOffset,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CoreError> {
    let (start, end) = year_bounds(year)?;
    match (day_start_utc(start, offset), day_start_utc(end, offset)) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(CoreError::validation(
            "year",
            format!("{} is outside the supported range at offset {}", year, offset),
        )),
    }
}

/// Map a raw practice time to its intensity level
///
/// 0 iff `value` is 0. Any practice is at least level 1; the level then
/// equals the number of cutoffs `value` has reached.
pub fn intensity_level(value: u64, cutoffs: &[u64]) -> u8 {
    if value == 0 {
        return 0;
    }
    let reached = cutoffs.partition_point(|&cutoff| cutoff <= value);
    u8::try_from(reached.max(1)).unwrap_or(u8::MAX)
}

/// Build the heatmap from the user's scores for `year`
///
/// `today` decides the current streak; when it lies outside `year` the
/// current streak is 0.
pub fn build_heatmap(
    scores: &[ScoreRecord],
    year: i32,
    today: NaiveDate,
    config: &HeatmapConfig,
    offset: FixedOffset,
) -> Result<HeatmapData, CoreError> {
    let (start, end) = year_bounds(year)?;
    let buckets = bucket_scores(scores, start, end, Granularity::Day, offset)?;

    let days: Vec<HeatmapDay> = buckets
        .into_iter()
        .map(|bucket| HeatmapDay {
            date: bucket.start,
            level: intensity_level(bucket.duration_ms, &config.intensity_cutoffs_ms),
            duration_ms: bucket.duration_ms,
            sessions: bucket.sessions,
        })
        .collect();

    let totals = compute_totals(&days, today)?;

    Ok(HeatmapData {
        year,
        levels: config.levels(),
        days,
        totals,
    })
}

fn compute_totals(days: &[HeatmapDay], today: NaiveDate) -> Result<HeatmapTotals, CoreError> {
    let mut totals = HeatmapTotals::default();
    let mut run = 0usize;

    for day in days {
        totals.total_sessions += day.sessions;
        totals.total_duration_ms = totals
            .total_duration_ms
            .checked_add(day.duration_ms)
            .ok_or_else(|| CoreError::compute("yearly practice time overflow"))?;

        if day.is_active() {
            totals.active_days += 1;
            run += 1;
            totals.longest_streak = totals.longest_streak.max(run);
        } else {
            run = 0;
        }

        if day.date == today {
            totals.current_streak = run;
        }
    }

    Ok(totals)
}
