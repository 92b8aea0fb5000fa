//! Interval-over-interval trend comparison
//!
//! Windows are addressed by a stable index relative to a frozen anchor rather
//! than relative to "now": window `i` covers `[t0 - (i+1)*N, t0 - i*N)` and is
//! compared to the window right before it.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{ScoringConfig, TrendConfig};
use crate::error::CoreError;
use crate::models::ScoreRecord;
use crate::time::{bucket_scores, day_start_utc, local_date, Granularity, TimeBucket};

// ===================
// Selectors
// ===================

/// Length of a comparison window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    Week,
    Month,
    Quarter,
}

impl IntervalType {
    pub fn days(&self) -> i64 {
        match self {
            IntervalType::Week => 7,
            IntervalType::Month => 30,
            IntervalType::Quarter => 90,
        }
    }

    /// Bucket size of the chart series for this interval
    pub fn series_granularity(&self) -> Granularity {
        match self {
            IntervalType::Week | IntervalType::Month => Granularity::Day,
            IntervalType::Quarter => Granularity::Week,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Week => "week",
            IntervalType::Month => "month",
            IntervalType::Quarter => "quarter",
        }
    }
}

impl fmt::Display for IntervalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "week" => Ok(IntervalType::Week),
            "month" => Ok(IntervalType::Month),
            "quarter" => Ok(IntervalType::Quarter),
            other => Err(CoreError::validation(
                "interval",
                format!("expected week|month|quarter, got '{}'", other),
            )),
        }
    }
}

/// Per-window aggregate being compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Summed duration, ms
    PracticeTime,
    /// Best weighted session score
    Score,
    /// Best combo
    Combo,
    /// Best multiplier
    Multiplier,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::PracticeTime,
        Metric::Score,
        Metric::Combo,
        Metric::Multiplier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::PracticeTime => "practice_time",
            Metric::Score => "score",
            Metric::Combo => "combo",
            Metric::Multiplier => "multiplier",
        }
    }

    /// Aggregate this metric over one window's scores
    pub fn aggregate(
        &self,
        scores: &[&ScoreRecord],
        weights: &ScoringConfig,
    ) -> Result<u64, CoreError> {
        match self {
            Metric::PracticeTime => scores.iter().try_fold(0u64, |total, s| {
                total
                    .checked_add(s.duration_ms)
                    .ok_or_else(|| CoreError::compute("window practice time overflow"))
            }),
            Metric::Score => Ok(scores
                .iter()
                .map(|s| s.session_score(weights))
                .max()
                .unwrap_or(0)),
            Metric::Combo => Ok(scores
                .iter()
                .map(|s| u64::from(s.max_combo))
                .max()
                .unwrap_or(0)),
            Metric::Multiplier => Ok(scores
                .iter()
                .map(|s| u64::from(s.max_multiplier))
                .max()
                .unwrap_or(0)),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "practice_time" | "time" => Ok(Metric::PracticeTime),
            "score" => Ok(Metric::Score),
            "combo" => Ok(Metric::Combo),
            "multiplier" => Ok(Metric::Multiplier),
            other => Err(CoreError::validation(
                "metric",
                format!(
                    "expected practice_time|score|combo|multiplier, got '{}'",
                    other
                ),
            )),
        }
    }
}

/// Direction of a window-over-window change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increase,
    Decrease,
    Stable,
}

impl TrendDirection {
    pub fn from_change(change: i64) -> Self {
        match change.signum() {
            1 => TrendDirection::Increase,
            -1 => TrendDirection::Decrease,
            _ => TrendDirection::Stable,
        }
    }
}

// ===================
// Arithmetic
// ===================

/// Rounded percentage change from `previous` to `current`
///
/// `previous == 0` yields 100 when `current > 0`, else 0. Halves round
/// toward positive infinity, so -37.5 becomes -37 and 37.5 becomes 38.
pub fn percentage_change(current: u64, previous: u64) -> i64 {
    if previous == 0 {
        return if current > 0 { 100 } else { 0 };
    }

    let diff = i128::from(current) - i128::from(previous);
    let divisor = i128::from(previous);
    // floor(diff * 100 / previous + 1/2)
    let change = (diff * 200 + divisor).div_euclid(2 * divisor);

    i64::try_from(change).unwrap_or(if change < 0 { i64::MIN } else { i64::MAX })
}

/// Half-open `[start, end)` comparison window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TrendWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Anchor for a new navigation session: start of the current local day
///
/// `now` itself when that day starts before chrono's earliest instant.
pub fn capture_anchor(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    day_start_utc(local_date(now, offset), offset).unwrap_or(now)
}

/// Reject window indices past the configured horizon
pub fn validate_window_index(index: u32, config: &TrendConfig) -> Result<(), CoreError> {
    if index > config.max_window_index {
        return Err(CoreError::validation(
            "window_index",
            format!("must be <= {}, got {}", config.max_window_index, index),
        ));
    }
    Ok(())
}

/// Current and previous window for `index`
pub fn window_bounds(
    anchor: DateTime<Utc>,
    interval: IntervalType,
    index: u32,
) -> Result<(TrendWindow, TrendWindow), CoreError> {
    let shift = |windows: i64| -> Result<DateTime<Utc>, CoreError> {
        windows
            .checked_mul(interval.days())
            .and_then(Duration::try_days)
            .and_then(|span| anchor.checked_sub_signed(span))
            .ok_or_else(|| {
                CoreError::compute(format!(
                    "{} window {} falls outside the calendar",
                    interval, index
                ))
            })
    };

    let i = i64::from(index);
    let current = TrendWindow {
        start: shift(i + 1)?,
        end: shift(i)?,
    };
    let previous = TrendWindow {
        start: shift(i + 2)?,
        end: current.start,
    };

    Ok((current, previous))
}

// ===================
// Comparison
// ===================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricComparison {
    pub metric: Metric,
    pub current: u64,
    pub previous: u64,
    pub percentage_change: i64,
    pub trend: TrendDirection,
}

impl MetricComparison {
    pub fn new(metric: Metric, current: u64, previous: u64) -> Self {
        let change = percentage_change(current, previous);
        Self {
            metric,
            current,
            previous,
            percentage_change: change,
            trend: TrendDirection::from_change(change),
        }
    }
}

/// All requested metrics over one pair of windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalComparison {
    pub interval: IntervalType,
    pub window_index: u32,
    pub anchor: DateTime<Utc>,
    pub current_window: TrendWindow,
    pub previous_window: TrendWindow,
    pub metrics: Vec<MetricComparison>,
    /// Practice time of the current window, bucketed for charts
    pub series: Vec<TimeBucket>,
}

impl IntervalComparison {
    pub fn metric(&self, metric: Metric) -> Option<&MetricComparison> {
        self.metrics.iter().find(|m| m.metric == metric)
    }
}

/// Drop duplicates, keeping first-seen order. Errors on an empty selection.
pub fn normalize_metrics(metrics: &[Metric]) -> Result<Vec<Metric>, CoreError> {
    if metrics.is_empty() {
        return Err(CoreError::validation("metrics", "at least one metric is required"));
    }
    let mut unique = Vec::with_capacity(metrics.len());
    for metric in metrics {
        if !unique.contains(metric) {
            unique.push(*metric);
        }
    }
    Ok(unique)
}

/// Compare window `index` with its predecessor
///
/// `scores` may cover more than the two windows; records outside them are
/// ignored. Every metric uses the same boundaries.
pub fn compare_windows(
    scores: &[ScoreRecord],
    anchor: DateTime<Utc>,
    interval: IntervalType,
    index: u32,
    metrics: &[Metric],
    weights: &ScoringConfig,
    offset: FixedOffset,
) -> Result<IntervalComparison, CoreError> {
    let metrics = normalize_metrics(metrics)?;
    let (current_window, previous_window) = window_bounds(anchor, interval, index)?;

    let mut current = Vec::new();
    let mut previous = Vec::new();
    for score in scores {
        if current_window.contains(score.played_at) {
            current.push(score);
        } else if previous_window.contains(score.played_at) {
            previous.push(score);
        }
    }

    let metrics = metrics
        .into_iter()
        .map(|metric| {
            Ok(MetricComparison::new(
                metric,
                metric.aggregate(&current, weights)?,
                metric.aggregate(&previous, weights)?,
            ))
        })
        .collect::<Result<Vec<_>, CoreError>>()?;

    let in_window: Vec<ScoreRecord> = current.into_iter().cloned().collect();
    let series = bucket_scores(
        &in_window,
        local_date(current_window.start, offset),
        local_date(current_window.end, offset),
        interval.series_granularity(),
        offset,
    )?;

    Ok(IntervalComparison {
        interval,
        window_index: index,
        anchor,
        current_window,
        previous_window,
        metrics,
        series,
    })
}
