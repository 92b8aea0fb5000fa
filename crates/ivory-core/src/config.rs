//! Tunable analytics configuration
//!
//! Loaded from a TOML file (every section optional). Heatmap cutoffs and
//! score weights live here instead of being hardwired in the aggregators.

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::CoreError;

/// Top-level configuration for the analytics engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Offset from UTC used for calendar bucketing (minutes, east positive)
    pub utc_offset_minutes: i32,
    pub heatmap: HeatmapConfig,
    pub scoring: ScoringConfig,
    pub trends: TrendConfig,
    pub catalog: CatalogConfig,
    pub cache: CacheConfig,
}

/// Heatmap intensity levels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Ascending practice-time cutoffs. N cutoffs yield N + 1 levels (0..=N).
    /// Any practice at all is level 1; a day reaches level k once its
    /// duration is >= the k-th cutoff (1-based).
    pub intensity_cutoffs_ms: Vec<u64>,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60_000;
        Self {
            intensity_cutoffs_ms: vec![15 * MINUTE, 30 * MINUTE, 60 * MINUTE, 120 * MINUTE],
        }
    }
}

impl HeatmapConfig {
    /// Number of distinct levels, level 0 included
    pub fn levels(&self) -> usize {
        self.intensity_cutoffs_ms.len() + 1
    }
}

/// Weights of the session score metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub note_points: u64,
    pub wrong_penalty: u64,
    pub combo_bonus: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            note_points: 100,
            wrong_penalty: 25,
            combo_bonus: 10,
        }
    }
}

/// Interval trend navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Largest window index a caller may request (520 weeks = 10 years)
    pub max_window_index: u32,
    /// A frozen anchor untouched for this long is re-captured
    pub anchor_idle_secs: u64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            max_window_index: 520,
            anchor_idle_secs: 1800,
        }
    }
}

impl TrendConfig {
    pub fn anchor_idle(&self) -> Duration {
        Duration::from_secs(self.anchor_idle_secs)
    }
}

/// Catalog pagination limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

/// Cache coordinator staleness windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// After this, a hit is served stale and refreshed in the background
    pub soft_ttl_secs: u64,
    /// After this, the entry is evicted
    pub hard_ttl_secs: u64,
    /// Warm window index +/- 1 after a trend request
    pub prefetch_adjacent: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            soft_ttl_secs: 60,
            hard_ttl_secs: 600,
            prefetch_adjacent: true,
        }
    }
}

impl CacheConfig {
    pub fn soft_ttl(&self) -> Duration {
        Duration::from_secs(self.soft_ttl_secs)
    }

    pub fn hard_ttl(&self) -> Duration {
        Duration::from_secs(self.hard_ttl_secs)
    }
}

/// 18 hours, the widest offset chrono accepts
const MAX_OFFSET_MINUTES: i32 = 18 * 60;

impl AnalyticsConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Rejected config: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` when it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |message: String| Err(CoreError::InvalidConfig { message });

        if self.utc_offset_minutes.unsigned_abs() >= MAX_OFFSET_MINUTES.unsigned_abs() {
            return invalid(format!(
                "utc_offset_minutes must be within +/-{}, got {}",
                MAX_OFFSET_MINUTES - 1,
                self.utc_offset_minutes
            ));
        }

        let cutoffs = &self.heatmap.intensity_cutoffs_ms;
        if cutoffs.is_empty() {
            return invalid("heatmap.intensity_cutoffs_ms must not be empty".to_string());
        }
        if cutoffs[0] == 0 {
            return invalid("heatmap cutoffs must be > 0 so idle days stay at level 0".to_string());
        }
        if cutoffs.windows(2).any(|w| w[0] >= w[1]) {
            return invalid(format!(
                "heatmap cutoffs must be strictly ascending, got {:?}",
                cutoffs
            ));
        }

        if self.cache.soft_ttl_secs > self.cache.hard_ttl_secs {
            return invalid(format!(
                "cache.soft_ttl_secs ({}) exceeds cache.hard_ttl_secs ({})",
                self.cache.soft_ttl_secs, self.cache.hard_ttl_secs
            ));
        }

        if self.catalog.default_page_size == 0 || self.catalog.max_page_size == 0 {
            return invalid("catalog page sizes must be > 0".to_string());
        }
        if self.catalog.default_page_size > self.catalog.max_page_size {
            return invalid(format!(
                "catalog.default_page_size ({}) exceeds catalog.max_page_size ({})",
                self.catalog.default_page_size, self.catalog.max_page_size
            ));
        }

        Ok(())
    }

    /// Calendar offset for bucketing
    pub fn offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnalyticsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heatmap.levels(), 5);
        assert_eq!(config.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AnalyticsConfig = toml::from_str(
            r#"
            utc_offset_minutes = 120

            [heatmap]
            intensity_cutoffs_ms = [600000, 1800000]

            [cache]
            soft_ttl_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.heatmap.levels(), 3);
        assert_eq!(config.cache.soft_ttl_secs, 5);
        assert_eq!(config.cache.hard_ttl_secs, 600);
        assert_eq!(config.scoring, ScoringConfig::default());
        assert_eq!(config.offset().local_minus_utc(), 7200);
    }

    #[test]
    fn test_rejects_unordered_cutoffs() {
        let mut config = AnalyticsConfig::default();
        config.heatmap.intensity_cutoffs_ms = vec![30, 10];
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));

        config.heatmap.intensity_cutoffs_ms = vec![0, 10];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_soft_ttl_above_hard_ttl() {
        let mut config = AnalyticsConfig::default();
        config.cache.soft_ttl_secs = 700;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_extreme_offsets() {
        for minutes in [i32::MIN, i32::MAX, MAX_OFFSET_MINUTES, -MAX_OFFSET_MINUTES] {
            let config = AnalyticsConfig {
                utc_offset_minutes: minutes,
                ..AnalyticsConfig::default()
            };
            assert!(matches!(config.validate(), Err(CoreError::InvalidConfig { .. })));
        }

        let hostile = AnalyticsConfig {
            utc_offset_minutes: i32::MIN,
            ..AnalyticsConfig::default()
        };
        assert_eq!(hostile.offset(), Utc.fix());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[catalog]\ndefault_page_size = 50\n").unwrap();

        let config = AnalyticsConfig::load(&path).unwrap();
        assert_eq!(config.catalog.default_page_size, 50);

        std::fs::write(&path, "[catalog]\ndefault_page_size = 500\n").unwrap();
        assert!(AnalyticsConfig::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = AnalyticsConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AnalyticsConfig::default());
    }
}
