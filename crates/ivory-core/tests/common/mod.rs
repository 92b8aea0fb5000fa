//! Shared fixture for integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use ivory_core::config::AnalyticsConfig;
use ivory_core::models::{ScoreId, ScoreRecord, Song, SongId, SourceType, UserId};
use ivory_core::time::ManualClock;
use ivory_core::{MemoryStore, PracticeAnalytics};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const MINUTE: u64 = 60_000;

/// Wednesday afternoon; trend anchor is midnight of the same day
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 12, 15, 0, 0).unwrap()
}

pub fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

pub fn user(id: &str) -> UserId {
    UserId::from(id)
}

pub fn song(
    id: &str,
    title: &str,
    composer: Option<&str>,
    genre: Option<&str>,
    source_type: SourceType,
) -> Song {
    Song {
        id: SongId::from(id),
        title: title.to_string(),
        composer: composer.map(str::to_string),
        genre: genre.map(str::to_string),
        tempo: 96,
        duration_ms: 3 * MINUTE,
        difficulty: 4,
        song_type: "piece".to_string(),
        source_type,
        key_ref: format!("songs/{}.mid", id),
    }
}

static NEXT_SCORE: AtomicUsize = AtomicUsize::new(0);

pub fn score(user_id: &str, song_id: &str, played_at: DateTime<Utc>, duration_ms: u64) -> ScoreRecord {
    ScoreRecord {
        id: ScoreId::from(format!("r{}", NEXT_SCORE.fetch_add(1, Ordering::SeqCst))),
        user_id: UserId::from(user_id),
        song_id: SongId::from(song_id),
        played_at,
        correct: 40,
        wrong: 4,
        missed: 2,
        max_combo: 12,
        max_multiplier: 2,
        duration_ms,
    }
}

/// Six library songs, one import each for `u1` and `u2`, two favorites for
/// `u1`, and a handful of `u1` sessions around the fixture's "now"
pub fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();

    for s in [
        song("L1", "Moonlight Sonata", Some("Beethoven"), Some("Classical"), SourceType::Library),
        song("L2", "Clair de Lune", Some("Debussy"), Some("Classical"), SourceType::Library),
        song("L3", "Take Five", Some("Brubeck"), Some("Jazz"), SourceType::Library),
        song("L4", "Fur Elise", Some("Beethoven"), Some("classical"), SourceType::Library),
        song("L5", "Gymnopedie No. 1", Some("Satie"), Some("Classical"), SourceType::Library),
        song("L6", "Traditional Air", None, Some("Folk"), SourceType::Library),
    ] {
        store.insert_song(s);
    }

    store.add_import(
        &user("u1"),
        song("I1", "My Etude", None, Some("Classical"), SourceType::Import),
    );
    store.add_import(
        &user("u2"),
        song("I2", "Secret Song", Some("Someone"), Some("Pop"), SourceType::Import),
    );

    store.toggle_favorite(&user("u1"), &SongId::from("L2"));
    store.toggle_favorite(&user("u1"), &SongId::from("I1"));

    for record in [
        // previous week window [05-29, 06-05)
        score("u1", "L1", at(2024, 5, 30, 18), 20 * MINUTE),
        // current week window [06-05, 06-12)
        score("u1", "L1", at(2024, 6, 10, 18), 20 * MINUTE),
        score("u1", "L2", at(2024, 6, 11, 18), 10 * MINUTE),
        // today, after the anchor
        score("u1", "L1", at(2024, 6, 12, 9), 40 * MINUTE),
        score("u2", "L3", at(2024, 6, 11, 7), 5 * MINUTE),
    ] {
        store.record_score(record).unwrap();
    }

    store
}

pub fn service(store: Arc<MemoryStore>) -> (PracticeAnalytics<MemoryStore>, Arc<ManualClock>) {
    service_with_config(store, AnalyticsConfig::default())
}

pub fn service_with_config(
    store: Arc<MemoryStore>,
    config: AnalyticsConfig,
) -> (PracticeAnalytics<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now()));
    let analytics = PracticeAnalytics::with_clock(store, config, clock.clone()).unwrap();
    (analytics, clock)
}

/// Give background work time to run; store calls hop to the blocking pool
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

/// Poll `done` until it holds, giving up after about two seconds
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
