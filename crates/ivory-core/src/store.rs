//! Event store adapter boundary
//!
//! The persistence engine is external. The core only talks to it through
//! filter objects: no query language crosses this boundary.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{FavoriteLink, ImportLink, ScoreRecord, Song, SongId, SourceType, UserId};

pub mod memory;

pub use memory::{Dataset, MemoryStore, QueryCounts};

/// Filter over score records. `None` fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreFilter {
    pub user_id: Option<UserId>,
    /// Restrict to these songs (batched lookups)
    pub song_ids: Option<Vec<SongId>>,
    /// Inclusive lower bound on `played_at`
    pub played_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `played_at`
    pub played_to: Option<DateTime<Utc>>,
}

impl ScoreFilter {
    pub fn for_user(user_id: &UserId) -> Self {
        Self {
            user_id: Some(user_id.clone()),
            ..Self::default()
        }
    }

    pub fn played_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.played_from = Some(from);
        self.played_to = Some(to);
        self
    }

    pub fn songs(mut self, song_ids: Vec<SongId>) -> Self {
        self.song_ids = Some(song_ids);
        self
    }

    /// Reference semantics for adapters that filter in memory
    pub fn matches(&self, record: &ScoreRecord) -> bool {
        if let Some(user) = &self.user_id {
            if &record.user_id != user {
                return false;
            }
        }
        if let Some(ids) = &self.song_ids {
            if !ids.contains(&record.song_id) {
                return false;
            }
        }
        if let Some(from) = self.played_from {
            if record.played_at < from {
                return false;
            }
        }
        if let Some(to) = self.played_to {
            if record.played_at >= to {
                return false;
            }
        }
        true
    }
}

/// Filter over song records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SongFilter {
    pub source_type: Option<SourceType>,
    pub ids: Option<Vec<SongId>>,
}

impl SongFilter {
    pub fn source(source_type: SourceType) -> Self {
        Self {
            source_type: Some(source_type),
            ids: None,
        }
    }

    pub fn ids(mut self, ids: Vec<SongId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn matches(&self, song: &Song) -> bool {
        if let Some(source) = self.source_type {
            if song.source_type != source {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&song.id) {
                return false;
            }
        }
        true
    }
}

/// Query operations the analytics core consumes
///
/// Implementations must be cheap to share (`Send + Sync`) because cached
/// computations run on background tasks. Calls are made from tokio's blocking
/// pool, so an adapter may block on I/O. An empty result is never an error.
pub trait EventStore: Send + Sync {
    fn find_scores(&self, filter: &ScoreFilter) -> Result<Vec<ScoreRecord>>;

    fn find_songs(&self, filter: &SongFilter) -> Result<Vec<Song>>;

    fn find_favorites(&self, user_id: &UserId) -> Result<Vec<FavoriteLink>>;

    fn find_imports(&self, user_id: &UserId) -> Result<Vec<ImportLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScoreId;
    use chrono::TimeZone;

    fn record(user: &str, song: &str, hour: u32) -> ScoreRecord {
        ScoreRecord {
            id: ScoreId::from(format!("{}-{}-{}", user, song, hour)),
            user_id: UserId::from(user),
            song_id: SongId::from(song),
            played_at: Utc.with_ymd_and_hms(2024, 4, 1, hour, 0, 0).unwrap(),
            correct: 1,
            wrong: 0,
            missed: 0,
            max_combo: 1,
            max_multiplier: 1,
            duration_ms: 1000,
        }
    }

    #[test]
    fn test_score_filter_range_is_half_open() {
        let from = Utc.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();
        let filter = ScoreFilter::for_user(&UserId::from("u1")).played_between(from, to);

        assert!(!filter.matches(&record("u1", "s1", 9)));
        assert!(filter.matches(&record("u1", "s1", 10)));
        assert!(filter.matches(&record("u1", "s1", 11)));
        assert!(!filter.matches(&record("u1", "s1", 12)));
        assert!(!filter.matches(&record("u2", "s1", 11)));
    }

    #[test]
    fn test_score_filter_song_batch() {
        let filter = ScoreFilter::default().songs(vec![SongId::from("a"), SongId::from("b")]);
        assert!(filter.matches(&record("u1", "a", 1)));
        assert!(!filter.matches(&record("u1", "c", 1)));
    }
}
