//! Practice analytics aggregations
//!
//! Pure functions over score records: the yearly heatmap and interval trend
//! comparisons. Fetching and caching live in [`crate::service`].

pub mod heatmap;
pub mod trends;


pub use heatmap::{
    build_heatmap, intensity_level, year_bounds, year_range_utc, HeatmapData, HeatmapDay,
    HeatmapTotals,
};
pub use trends::{
    capture_anchor, compare_windows, normalize_metrics, percentage_change, validate_window_index,
    window_bounds, IntervalComparison, IntervalType, Metric, MetricComparison, TrendDirection,
    TrendWindow,
};
