//! In-memory event store with DashMap + parking_lot::RwLock
//!
//! Songs and association links use DashMap (per-entry locking); the score log
//! is append-only behind a parking_lot RwLock. Used by the CLI and tests.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use super::{EventStore, ScoreFilter, SongFilter};
use crate::models::{FavoriteLink, ImportLink, ScoreRecord, Song, SongId, User, UserId};

/// Serialized snapshot of everything the store holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub users: Vec<User>,
    pub songs: Vec<Song>,
    pub scores: Vec<ScoreRecord>,
    pub favorites: Vec<FavoriteLink>,
    pub imports: Vec<ImportLink>,
}

impl Dataset {
    /// Load a dataset from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse dataset: {}", path.display()))
    }
}

/// Number of adapter calls per operation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueryCounts {
    pub scores: usize,
    pub songs: usize,
    pub favorites: usize,
    pub imports: usize,
}

impl QueryCounts {
    pub fn total(&self) -> usize {
        self.scores + self.songs + self.favorites + self.imports
    }
}

#[derive(Default)]
struct Counters {
    scores: AtomicUsize,
    songs: AtomicUsize,
    favorites: AtomicUsize,
    imports: AtomicUsize,
}

/// Thread-safe in-memory store
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<UserId, User>,
    songs: DashMap<SongId, Song>,
    /// Append-only, immutable records
    scores: RwLock<Vec<ScoreRecord>>,
    favorites: DashMap<UserId, BTreeSet<SongId>>,
    imports: DashMap<UserId, BTreeSet<SongId>>,
    counters: Counters,
    /// Simulates an unreachable backend
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dataset(dataset: Dataset) -> Self {
        let store = Self::new();

        for user in dataset.users {
            store.users.insert(user.id.clone(), user);
        }
        for song in dataset.songs {
            store.songs.insert(song.id.clone(), song);
        }
        for link in dataset.favorites {
            store.favorites.entry(link.user_id).or_default().insert(link.song_id);
        }
        for link in dataset.imports {
            store.imports.entry(link.user_id).or_default().insert(link.song_id);
        }
        *store.scores.write() = dataset.scores;

        debug!(
            users = store.users.len(),
            songs = store.songs.len(),
            scores = store.scores.read().len(),
            "Memory store loaded"
        );

        store
    }

    // ===================
    // Mutations (external collaborators)
    // ===================

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn insert_song(&self, song: Song) {
        self.songs.insert(song.id.clone(), song);
    }

    /// Append a finished session
    ///
    /// Rejects records whose song is unknown, since every score references an
    /// existing song.
    pub fn record_score(&self, record: ScoreRecord) -> Result<()> {
        if !self.songs.contains_key(&record.song_id) {
            bail!("score {} references unknown song {}", record.id, record.song_id);
        }
        self.scores.write().push(record);
        Ok(())
    }

    /// Flip the favorite flag, returning the new state
    pub fn toggle_favorite(&self, user_id: &UserId, song_id: &SongId) -> bool {
        let mut set = self.favorites.entry(user_id.clone()).or_default();
        if set.remove(song_id) {
            false
        } else {
            set.insert(song_id.clone());
            true
        }
    }

    /// Register an imported song owned by `user_id`
    pub fn add_import(&self, user_id: &UserId, song: Song) {
        let song_id = song.id.clone();
        self.insert_song(song);
        self.imports.entry(user_id.clone()).or_default().insert(song_id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    // ===================
    // Read accessors
    // ===================

    pub fn score_count(&self) -> usize {
        self.scores.read().len()
    }

    pub fn song_count(&self) -> usize {
        self.songs.len()
    }

    pub fn user(&self, id: &UserId) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn query_counts(&self) -> QueryCounts {
        QueryCounts {
            scores: self.counters.scores.load(Ordering::SeqCst),
            songs: self.counters.songs.load(Ordering::SeqCst),
            favorites: self.counters.favorites.load(Ordering::SeqCst),
            imports: self.counters.imports.load(Ordering::SeqCst),
        }
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory store marked unavailable during {}", operation);
        }
        Ok(())
    }
}

impl EventStore for MemoryStore {
    fn find_scores(&self, filter: &ScoreFilter) -> Result<Vec<ScoreRecord>> {
        self.counters.scores.fetch_add(1, Ordering::SeqCst);
        self.check_available("find_scores")?;

        Ok(self
            .scores
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn find_songs(&self, filter: &SongFilter) -> Result<Vec<Song>> {
        self.counters.songs.fetch_add(1, Ordering::SeqCst);
        self.check_available("find_songs")?;

        Ok(self
            .songs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn find_favorites(&self, user_id: &UserId) -> Result<Vec<FavoriteLink>> {
        self.counters.favorites.fetch_add(1, Ordering::SeqCst);
        self.check_available("find_favorites")?;

        Ok(links(&self.favorites, user_id)
            .into_iter()
            .map(|song_id| FavoriteLink {
                user_id: user_id.clone(),
                song_id,
            })
            .collect())
    }

    fn find_imports(&self, user_id: &UserId) -> Result<Vec<ImportLink>> {
        self.counters.imports.fetch_add(1, Ordering::SeqCst);
        self.check_available("find_imports")?;

        Ok(links(&self.imports, user_id)
            .into_iter()
            .map(|song_id| ImportLink {
                user_id: user_id.clone(),
                song_id,
            })
            .collect())
    }
}

fn links(map: &DashMap<UserId, BTreeSet<SongId>>, user_id: &UserId) -> Vec<SongId> {
    map.get(user_id)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default()
}
