//! ivory-core - Core library for ivory
//!
//! Practice analytics over piano session scores: calendar heatmaps, interval
//! trend comparisons and paginated catalog views, memoized by a single-flight
//! cache coordinator.

pub mod analytics;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod format;
pub mod models;
pub mod service;
pub mod store;
pub mod time;

pub use analytics::{
    HeatmapData, IntervalComparison, IntervalType, Metric, MetricComparison, TrendDirection,
};
pub use cache::{CacheCoordinator, CacheStats};
pub use catalog::{CatalogItem, CatalogPage, CatalogQuery, CatalogScope, SortKey, SortOrder};
pub use config::AnalyticsConfig;
pub use error::CoreError;
pub use format::format_duration_ms;
pub use models::{LearnScores, ScoreRecord, Song, SongId, SourceType, UserId};
pub use service::PracticeAnalytics;
pub use store::{EventStore, MemoryStore};
