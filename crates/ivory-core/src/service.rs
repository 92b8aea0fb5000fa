//! Practice analytics service
//!
//! Composes the event store, the pure aggregators and one cache coordinator
//! into the operations a front end calls. Every cached aggregate lives under
//! the key prefix `user:{id}:` so one sweep evicts all of a user's views.

use chrono::{DateTime, NaiveDate, Utc};
use moka::future::Cache;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

use crate::analytics::{
    build_heatmap, capture_anchor, compare_windows, normalize_metrics, validate_window_index,
    window_bounds, year_range_utc, HeatmapData, IntervalComparison, IntervalType, Metric,
    MetricComparison,
};
use crate::cache::{CacheCoordinator, CacheStats};
use crate::catalog::{self, CatalogPage, CatalogQuery, CatalogScope, SortKey, SortOrder};
use crate::config::AnalyticsConfig;
use crate::error::CoreError;
use crate::models::UserId;
use crate::store::{EventStore, ScoreFilter};
use crate::time::{local_date, Clock, SystemClock};

/// Upper bound on tracked (user, interval) anchors
const MAX_ANCHORS: u64 = 100_000;

/// A cached aggregate
///
/// Arc-wrapped so cache hits clone a pointer, not the aggregate.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Heatmap(Arc<HeatmapData>),
    Comparison(Arc<IntervalComparison>),
    Catalog(Arc<CatalogPage>),
    Genres(Arc<Vec<String>>),
}

impl CachedValue {
    fn kind(&self) -> &'static str {
        match self {
            CachedValue::Heatmap(_) => "heatmap",
            CachedValue::Comparison(_) => "comparison",
            CachedValue::Catalog(_) => "catalog",
            CachedValue::Genres(_) => "genres",
        }
    }
}

/// Future handed to the cache coordinator for one computation
type Job = Pin<Box<dyn Future<Output = Result<CachedValue, CoreError>> + Send + 'static>>;

/// Run a synchronous store-backed computation on tokio's blocking pool
///
/// `EventStore` calls may block on I/O, so they never run on a worker thread.
async fn run_blocking<F>(operation: &'static str, load: F) -> Result<CachedValue, CoreError>
where
    F: FnOnce() -> Result<CachedValue, CoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(load)
        .await
        .map_err(|e| CoreError::compute(format!("{} task failed: {}", operation, e)))?
}

fn unexpected(key: &str, value: &CachedValue) -> CoreError {
    CoreError::compute(format!(
        "cache entry {} holds a {} value",
        key,
        value.kind()
    ))
}

/// Cache key prefix covering every aggregate of `user_id`
///
/// The trailing separator keeps `user:1:` from matching `user:12:`.
pub fn user_prefix(user_id: &UserId) -> String {
    format!("user:{}:", user_id)
}

fn heatmap_key(user_id: &UserId, year: i32) -> String {
    format!("{}heatmap:{}", user_prefix(user_id), year)
}

fn trend_key(
    user_id: &UserId,
    interval: IntervalType,
    anchor: DateTime<Utc>,
    index: u32,
    metrics: &[Metric],
) -> String {
    let metrics: Vec<&str> = metrics.iter().map(Metric::as_str).collect();
    format!(
        "{}trend:{}:{}:{}:{}",
        user_prefix(user_id),
        interval,
        anchor.timestamp(),
        index,
        metrics.join(",")
    )
}

fn catalog_key(query: &CatalogQuery, page_size: u32) -> String {
    format!(
        "{}catalog:{}",
        user_prefix(&query.user_id),
        query.cache_fragment(page_size)
    )
}

fn genres_key(user_id: &UserId, scope: CatalogScope) -> String {
    format!("{}genres:{}", user_prefix(user_id), scope)
}

/// Practice analytics entry point
///
/// Owns its cache coordinator and trend anchor registry; there is no global
/// state. Clones share both.
pub struct PracticeAnalytics<S: EventStore + 'static> {
    store: Arc<S>,
    config: Arc<AnalyticsConfig>,
    clock: Arc<dyn Clock>,
    cache: CacheCoordinator<CachedValue>,
    /// Frozen trend anchors, re-captured after `anchor_idle_secs` unused
    anchors: Cache<(UserId, IntervalType), DateTime<Utc>>,
}

impl<S: EventStore + 'static> Clone for PracticeAnalytics<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            cache: self.cache.clone(),
            anchors: self.anchors.clone(),
        }
    }
}

impl<S: EventStore + 'static> PracticeAnalytics<S> {
    pub fn new(store: Arc<S>, config: AnalyticsConfig) -> Result<Self, CoreError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create with an explicit time source
    pub fn with_clock(
        store: Arc<S>,
        config: AnalyticsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let anchors = Cache::builder()
            .max_capacity(MAX_ANCHORS)
            .time_to_idle(config.trends.anchor_idle())
            .build();

        debug!(
            utc_offset_minutes = config.utc_offset_minutes,
            soft_ttl_secs = config.cache.soft_ttl_secs,
            hard_ttl_secs = config.cache.hard_ttl_secs,
            "Practice analytics initialized"
        );

        Ok(Self {
            store,
            cache: CacheCoordinator::from_config(&config.cache),
            config: Arc::new(config),
            clock,
            anchors,
        })
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current calendar date in the configured offset
    pub fn today(&self) -> NaiveDate {
        local_date(self.clock.now(), self.config.offset())
    }

    // ===================
    // Heatmap
    // ===================

    pub async fn get_heatmap_data(
        &self,
        user_id: &UserId,
        year: i32,
    ) -> Result<Arc<HeatmapData>, CoreError> {
        year_range_utc(year, self.config.offset())?;
        let key = heatmap_key(user_id, year);
        let value = self
            .cache
            .get_or_compute(&key, self.heatmap_job(user_id, year))
            .await?;
        match value {
            CachedValue::Heatmap(data) => Ok(data),
            other => Err(unexpected(&key, &other)),
        }
    }

    /// Recompute a heatmap now, replacing any cached copy
    pub async fn refresh_heatmap(
        &self,
        user_id: &UserId,
        year: i32,
    ) -> Result<Arc<HeatmapData>, CoreError> {
        year_range_utc(year, self.config.offset())?;
        let key = heatmap_key(user_id, year);
        match self.cache.refresh(&key, self.heatmap_job(user_id, year)).await? {
            CachedValue::Heatmap(data) => Ok(data),
            other => Err(unexpected(&key, &other)),
        }
    }

    fn heatmap_job(
        &self,
        user_id: &UserId,
        year: i32,
    ) -> impl FnOnce() -> Job + Send + 'static {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let user_id = user_id.clone();
        let today = self.today();

        move || -> Job {
            Box::pin(run_blocking("heatmap", move || {
                load_heatmap(store.as_ref(), &config, &user_id, year, today)
                    .map(|data| CachedValue::Heatmap(Arc::new(data)))
            }))
        }
    }

    // ===================
    // Trends
    // ===================

    /// Compare window `index` with its predecessor for each metric
    ///
    /// With `prefetch_adjacent`, windows `index - 1` and `index + 1` are
    /// warmed in the background afterwards.
    pub async fn get_interval_comparison(
        &self,
        user_id: &UserId,
        interval: IntervalType,
        window_index: u32,
        metrics: &[Metric],
    ) -> Result<Arc<IntervalComparison>, CoreError> {
        validate_window_index(window_index, &self.config.trends)?;
        let metrics = normalize_metrics(metrics)?;
        let anchor = self.anchor(user_id, interval).await;

        let key = trend_key(user_id, interval, anchor, window_index, &metrics);
        let job = self.comparison_job(user_id, interval, anchor, window_index, &metrics);
        let comparison = match self.cache.get_or_compute(&key, job).await? {
            CachedValue::Comparison(comparison) => comparison,
            other => return Err(unexpected(&key, &other)),
        };

        if self.config.cache.prefetch_adjacent {
            self.prefetch_neighbors(user_id, interval, anchor, window_index, &metrics);
        }

        Ok(comparison)
    }

    /// Practice-time comparison for one window
    pub async fn get_practice_time_comparison(
        &self,
        user_id: &UserId,
        interval: IntervalType,
        window_index: u32,
    ) -> Result<MetricComparison, CoreError> {
        let comparison = self
            .get_interval_comparison(user_id, interval, window_index, &[Metric::PracticeTime])
            .await?;
        comparison
            .metric(Metric::PracticeTime)
            .cloned()
            .ok_or_else(|| CoreError::compute("practice time missing from comparison"))
    }

    /// Drop the frozen anchors of `user_id` so the next request re-captures
    /// them from the current day
    pub async fn reset_trend_anchor(&self, user_id: &UserId) {
        for interval in [IntervalType::Week, IntervalType::Month, IntervalType::Quarter] {
            self.anchors.invalidate(&(user_id.clone(), interval)).await;
        }
        let removed = self
            .cache
            .invalidate(&format!("{}trend:", user_prefix(user_id)));
        debug!(user = %user_id, removed, "Trend anchors reset");
    }

    async fn anchor(&self, user_id: &UserId, interval: IntervalType) -> DateTime<Utc> {
        let now = self.clock.now();
        let offset = self.config.offset();
        self.anchors
            .get_with((user_id.clone(), interval), async move {
                capture_anchor(now, offset)
            })
            .await
    }

    fn prefetch_neighbors(
        &self,
        user_id: &UserId,
        interval: IntervalType,
        anchor: DateTime<Utc>,
        window_index: u32,
        metrics: &[Metric],
    ) {
        let mut neighbors = Vec::with_capacity(2);
        if let Some(newer) = window_index.checked_sub(1) {
            neighbors.push(newer);
        }
        if window_index < self.config.trends.max_window_index {
            neighbors.push(window_index + 1);
        }

        for index in neighbors {
            let key = trend_key(user_id, interval, anchor, index, metrics);
            let job = self.comparison_job(user_id, interval, anchor, index, metrics);
            if self.cache.prefetch(&key, job) {
                debug!(user = %user_id, %interval, index, "Prefetching adjacent window");
            }
        }
    }

    fn comparison_job(
        &self,
        user_id: &UserId,
        interval: IntervalType,
        anchor: DateTime<Utc>,
        window_index: u32,
        metrics: &[Metric],
    ) -> impl FnOnce() -> Job + Send + 'static {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let user_id = user_id.clone();
        let metrics = metrics.to_vec();

        move || -> Job {
            Box::pin(run_blocking("comparison", move || {
                load_comparison(
                    store.as_ref(),
                    &config,
                    &user_id,
                    interval,
                    anchor,
                    window_index,
                    &metrics,
                )
                .map(|comparison| CachedValue::Comparison(Arc::new(comparison)))
            }))
        }
    }

    // ===================
    // Catalog
    // ===================

    /// General catalog query
    pub async fn get_library_songs(&self, query: CatalogQuery) -> Result<Arc<CatalogPage>, CoreError> {
        let page_size = query.validate(&self.config.catalog)?;
        let key = catalog_key(&query, page_size);
        let store = Arc::clone(&self.store);
        let catalog_config = self.config.catalog;

        let job = move || -> Job {
            Box::pin(run_blocking("catalog", move || {
                catalog::execute(store.as_ref(), &query, &catalog_config)
                    .map(|page| CachedValue::Catalog(Arc::new(page)))
            }))
        };

        match self.cache.get_or_compute(&key, job).await? {
            CachedValue::Catalog(page) => Ok(page),
            other => Err(unexpected(&key, &other)),
        }
    }

    /// The user's favorites across the library and their imports
    pub async fn get_favorite_songs(
        &self,
        user_id: &UserId,
        page: u32,
        search: Option<&str>,
        genre: Option<&str>,
        sort_by: SortKey,
        sort_order: SortOrder,
    ) -> Result<Arc<CatalogPage>, CoreError> {
        let query = with_text(
            CatalogQuery::new(user_id.clone(), CatalogScope::Union),
            search,
            genre,
        )
        .page(page)
        .favorites_only(true)
        .sort(sort_by, sort_order);
        self.get_library_songs(query).await
    }

    /// Songs imported by the user
    #[allow(clippy::too_many_arguments)]
    pub async fn get_imported_songs(
        &self,
        user_id: &UserId,
        page: u32,
        search: Option<&str>,
        genre: Option<&str>,
        favorites_only: bool,
        sort_by: SortKey,
        sort_order: SortOrder,
    ) -> Result<Arc<CatalogPage>, CoreError> {
        let query = with_text(
            CatalogQuery::new(user_id.clone(), CatalogScope::Import),
            search,
            genre,
        )
        .page(page)
        .favorites_only(favorites_only)
        .sort(sort_by, sort_order);
        self.get_library_songs(query).await
    }

    /// Distinct sorted genres in `scope`, for filter menus
    pub async fn get_genres(
        &self,
        user_id: &UserId,
        scope: CatalogScope,
    ) -> Result<Arc<Vec<String>>, CoreError> {
        let key = genres_key(user_id, scope);
        let store = Arc::clone(&self.store);
        let owner = user_id.clone();

        let job = move || -> Job {
            Box::pin(run_blocking("genres", move || {
                catalog::genres_in_scope(store.as_ref(), &owner, scope)
                    .map(|genres| CachedValue::Genres(Arc::new(genres)))
            }))
        };

        match self.cache.get_or_compute(&key, job).await? {
            CachedValue::Genres(genres) => Ok(genres),
            other => Err(unexpected(&key, &other)),
        }
    }

    // ===================
    // Cache control
    // ===================

    /// Evict every cached aggregate of `user_id`, returning the entry count
    ///
    /// Call after the user's scores, favorites or imports change.
    pub fn invalidate_user(&self, user_id: &UserId) -> usize {
        let removed = self.cache.invalidate(&user_prefix(user_id));
        info!(user = %user_id, removed, "User aggregates invalidated");
        removed
    }

    /// Evict everything, e.g. after a shared library change
    pub fn invalidate_all(&self) -> usize {
        let removed = self.cache.invalidate_all();
        info!(removed, "All aggregates invalidated");
        removed
    }

    /// Serve the user's cached aggregates once more, refreshing each in the
    /// background on its next read
    pub fn mark_user_stale(&self, user_id: &UserId) -> usize {
        self.cache.mark_stale(&user_prefix(user_id))
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn with_text(mut query: CatalogQuery, search: Option<&str>, genre: Option<&str>) -> CatalogQuery {
    if let Some(text) = search {
        query = query.search(text);
    }
    if let Some(genre) = genre {
        query = query.genre(genre);
    }
    query
}

// ===================
// Store-backed computations
// ===================

fn load_heatmap<S: EventStore + ?Sized>(
    store: &S,
    config: &AnalyticsConfig,
    user_id: &UserId,
    year: i32,
    today: NaiveDate,
) -> Result<HeatmapData, CoreError> {
    let offset = config.offset();
    let (start, end) = year_range_utc(year, offset)?;
    let filter = ScoreFilter::for_user(user_id).played_between(start, end);
    let scores = store
        .find_scores(&filter)
        .map_err(|e| CoreError::store("find_scores", e))?;

    debug!(user = %user_id, year, scores = scores.len(), "Building heatmap");
    build_heatmap(&scores, year, today, &config.heatmap, offset)
}

fn load_comparison<S: EventStore + ?Sized>(
    store: &S,
    config: &AnalyticsConfig,
    user_id: &UserId,
    interval: IntervalType,
    anchor: DateTime<Utc>,
    window_index: u32,
    metrics: &[Metric],
) -> Result<IntervalComparison, CoreError> {
    let (current, previous) = window_bounds(anchor, interval, window_index)?;
    // One query spans both windows
    let filter = ScoreFilter::for_user(user_id).played_between(previous.start, current.end);
    let scores = store
        .find_scores(&filter)
        .map_err(|e| CoreError::store("find_scores", e))?;

    debug!(
        user = %user_id,
        %interval,
        window_index,
        scores = scores.len(),
        "Comparing trend windows"
    );
    compare_windows(
        &scores,
        anchor,
        interval,
        window_index,
        metrics,
        &config.scoring,
        config.offset(),
    )
}
