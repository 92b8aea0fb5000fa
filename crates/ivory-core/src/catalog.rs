//! Catalog query planner
//!
//! Filtered, sorted, paginated views over song collections, joined with the
//! requesting user's favorite/owned/last-played status.
//!
//! Store round trips per query are bounded regardless of page size:
//! - songs: one per source in scope
//! - favorites and imports: one each, shared by filtering and enrichment
//! - scores: one batched query for the page's song ids

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::config::CatalogConfig;
use crate::error::CoreError;
use crate::models::{ScoreRecord, Song, SongId, SourceType, UserId};
use crate::store::{EventStore, ScoreFilter, SongFilter};

// ===================
// Query parameters
// ===================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Title,
    Composer,
    Duration,
    Difficulty,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Title => "title",
            SortKey::Composer => "composer",
            SortKey::Duration => "duration",
            SortKey::Difficulty => "difficulty",
        }
    }

    fn value(&self, song: &Song) -> SortValue {
        match self {
            SortKey::Title => SortValue::text(Some(&song.title)),
            SortKey::Composer => SortValue::text(song.composer.as_deref()),
            SortKey::Duration => SortValue::Number(song.duration_ms),
            SortKey::Difficulty => SortValue::Number(u64::from(song.difficulty)),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "title" => Ok(SortKey::Title),
            "composer" => Ok(SortKey::Composer),
            "duration" => Ok(SortKey::Duration),
            "difficulty" => Ok(SortKey::Difficulty),
            other => Err(CoreError::validation(
                "sort_by",
                format!("expected title|composer|duration|difficulty, got '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            other => Err(CoreError::validation(
                "sort_order",
                format!("expected asc|desc, got '{}'", other),
            )),
        }
    }
}

/// Which song sources a query covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogScope {
    /// Shared library only
    #[default]
    Library,
    /// The requesting user's imports only
    Import,
    /// Library plus the requesting user's imports
    Union,
}

impl CatalogScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogScope::Library => "library",
            CatalogScope::Import => "import",
            CatalogScope::Union => "union",
        }
    }

    fn includes_library(&self) -> bool {
        matches!(self, CatalogScope::Library | CatalogScope::Union)
    }

    fn includes_imports(&self) -> bool {
        matches!(self, CatalogScope::Import | CatalogScope::Union)
    }
}

impl fmt::Display for CatalogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogScope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "library" => Ok(CatalogScope::Library),
            "import" | "imports" => Ok(CatalogScope::Import),
            "union" | "all" => Ok(CatalogScope::Union),
            other => Err(CoreError::validation(
                "scope",
                format!("expected library|import|union, got '{}'", other),
            )),
        }
    }
}

/// One catalog page request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogQuery {
    pub user_id: UserId,
    pub scope: CatalogScope,
    /// 1-based
    pub page: u32,
    /// `None` uses the configured default
    pub page_size: Option<u32>,
    pub search: Option<String>,
    pub genre: Option<String>,
    pub favorites_only: bool,
    pub owned_only: bool,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
}

impl CatalogQuery {
    pub fn new(user_id: UserId, scope: CatalogScope) -> Self {
        Self {
            user_id,
            scope,
            page: 1,
            page_size: None,
            search: None,
            genre: None,
            favorites_only: false,
            owned_only: false,
            sort_by: SortKey::default(),
            sort_order: SortOrder::default(),
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Blank text is treated as no search
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = non_blank(text.into());
        self
    }

    pub fn genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = non_blank(genre.into());
        self
    }

    pub fn favorites_only(mut self, enabled: bool) -> Self {
        self.favorites_only = enabled;
        self
    }

    pub fn owned_only(mut self, enabled: bool) -> Self {
        self.owned_only = enabled;
        self
    }

    pub fn sort(mut self, key: SortKey, order: SortOrder) -> Self {
        self.sort_by = key;
        self.sort_order = order;
        self
    }

    /// Check paging parameters, returning the effective page size
    pub fn validate(&self, config: &CatalogConfig) -> Result<u32, CoreError> {
        if self.page == 0 {
            return Err(CoreError::validation("page", "must be >= 1, got 0"));
        }

        let page_size = self.page_size.unwrap_or(config.default_page_size);
        if page_size == 0 || page_size > config.max_page_size {
            return Err(CoreError::validation(
                "page_size",
                format!("must be within 1..={}, got {}", config.max_page_size, page_size),
            ));
        }

        Ok(page_size)
    }

    /// Stable cache key fragment; equivalent queries map to the same string
    pub fn cache_fragment(&self, page_size: u32) -> String {
        format!(
            "{}:p{}:n{}:{}:{}:f{}:o{}:s={}:g={}",
            self.scope,
            self.page,
            page_size,
            self.sort_by,
            self.sort_order,
            u8::from(self.favorites_only),
            u8::from(self.owned_only),
            self.search.as_deref().map(str::to_lowercase).unwrap_or_default(),
            self.genre.as_deref().map(str::to_lowercase).unwrap_or_default(),
        )
    }
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ===================
// Results
// ===================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    #[serde(flatten)]
    pub song: Song,
    pub is_favorite: bool,
    /// Imported by the requesting user
    pub is_owned: bool,
    pub last_played: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPage {
    pub items: Vec<CatalogItem>,
    pub total_count: usize,
    pub total_pages: usize,
    pub page: u32,
    pub page_size: u32,
}

impl CatalogPage {
    pub fn is_last_page(&self) -> bool {
        self.page as usize >= self.total_pages
    }
}

// ===================
// Planning (pure)
// ===================

/// Per-user association sets shared by filtering and enrichment
#[derive(Debug, Clone, Default)]
pub struct UserLinks {
    pub favorites: HashSet<SongId>,
    pub owned: HashSet<SongId>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    /// Present values first, then case-folded text, raw text as tiebreak
    Text {
        missing: bool,
        folded: String,
        raw: String,
    },
    Number(u64),
}

impl SortValue {
    fn text(value: Option<&str>) -> Self {
        match value {
            Some(raw) => SortValue::Text {
                missing: false,
                folded: raw.to_lowercase(),
                raw: raw.to_string(),
            },
            None => SortValue::Text {
                missing: true,
                folded: String::new(),
                raw: String::new(),
            },
        }
    }
}

/// Apply search, genre and link filters
pub fn filter_songs(songs: Vec<Song>, query: &CatalogQuery, links: &UserLinks) -> Vec<Song> {
    let needle = query.search.as_deref().map(str::to_lowercase);

    songs
        .into_iter()
        .filter(|song| needle.as_deref().is_none_or(|n| song.matches_search(n)))
        .filter(|song| query.genre.as_deref().is_none_or(|g| song.has_genre(g)))
        .filter(|song| !query.favorites_only || links.favorites.contains(&song.id))
        .filter(|song| !query.owned_only || links.owned.contains(&song.id))
        .collect()
}

/// Total order: sort key in the requested direction, then id ascending
pub fn sort_songs(songs: Vec<Song>, key: SortKey, order: SortOrder) -> Vec<Song> {
    let mut keyed: Vec<(SortValue, Song)> =
        songs.into_iter().map(|song| (key.value(&song), song)).collect();

    keyed.sort_by(|(value_a, a), (value_b, b)| {
        let primary = match order {
            SortOrder::Asc => value_a.cmp(value_b),
            SortOrder::Desc => value_b.cmp(value_a),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });

    keyed.into_iter().map(|(_, song)| song).collect()
}

/// `ceil(total / page_size)`, 0 for an empty set
pub fn total_pages(total: usize, page_size: u32) -> usize {
    let size = page_size.max(1) as usize;
    total.div_ceil(size)
}

/// Slice one page out of a sorted set. A page past the end is empty.
pub fn paginate(songs: Vec<Song>, page: u32, page_size: u32) -> Vec<Song> {
    let size = page_size as usize;
    let skip = (page.saturating_sub(1) as usize).saturating_mul(size);
    songs.into_iter().skip(skip).take(size).collect()
}

/// Most recent `played_at` per song
pub fn last_played_by_song(scores: &[ScoreRecord]) -> HashMap<SongId, DateTime<Utc>> {
    let mut latest: HashMap<SongId, DateTime<Utc>> = HashMap::new();
    for score in scores {
        latest
            .entry(score.song_id.clone())
            .and_modify(|ts| *ts = (*ts).max(score.played_at))
            .or_insert(score.played_at);
    }
    latest
}

pub fn enrich(
    songs: Vec<Song>,
    links: &UserLinks,
    last_played: &HashMap<SongId, DateTime<Utc>>,
) -> Vec<CatalogItem> {
    songs
        .into_iter()
        .map(|song| CatalogItem {
            is_favorite: links.favorites.contains(&song.id),
            is_owned: links.owned.contains(&song.id),
            last_played: last_played.get(&song.id).copied(),
            song,
        })
        .collect()
}

/// Distinct genres, sorted case-insensitively
///
/// Spellings differing only in case collapse to the first in sort order.
pub fn distinct_genres(songs: &[Song]) -> Vec<String> {
    let mut genres: Vec<&str> = songs
        .iter()
        .filter_map(|s| s.genre.as_deref())
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .collect();
    genres.sort_by(|a, b| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
    genres.dedup_by(|a, b| a.to_lowercase() == b.to_lowercase());
    genres.into_iter().map(str::to_string).collect()
}

// ===================
// Execution against the store
// ===================

/// Favorites and imports for `user_id`, one lookup each
pub fn load_links<S: EventStore + ?Sized>(
    store: &S,
    user_id: &UserId,
) -> Result<UserLinks, CoreError> {
    let favorites = store
        .find_favorites(user_id)
        .map_err(|e| CoreError::store("find_favorites", e))?;
    let imports = store
        .find_imports(user_id)
        .map_err(|e| CoreError::store("find_imports", e))?;

    Ok(UserLinks {
        favorites: favorites.into_iter().map(|link| link.song_id).collect(),
        owned: imports.into_iter().map(|link| link.song_id).collect(),
    })
}

/// Songs visible in `scope`
pub fn load_scope<S: EventStore + ?Sized>(
    store: &S,
    scope: CatalogScope,
    links: &UserLinks,
) -> Result<Vec<Song>, CoreError> {
    let mut songs = Vec::new();

    if scope.includes_library() {
        songs.extend(
            store
                .find_songs(&SongFilter::source(SourceType::Library))
                .map_err(|e| CoreError::store("find_songs", e))?,
        );
    }

    if scope.includes_imports() && !links.owned.is_empty() {
        let mut ids: Vec<SongId> = links.owned.iter().cloned().collect();
        ids.sort();
        songs.extend(
            store
                .find_songs(&SongFilter::source(SourceType::Import).ids(ids))
                .map_err(|e| CoreError::store("find_songs", e))?,
        );
    }

    Ok(songs)
}

/// Run a catalog query end to end
pub fn execute<S: EventStore + ?Sized>(
    store: &S,
    query: &CatalogQuery,
    config: &CatalogConfig,
) -> Result<CatalogPage, CoreError> {
    let page_size = query.validate(config)?;

    let links = load_links(store, &query.user_id)?;
    let songs = load_scope(store, query.scope, &links)?;
    let filtered = filter_songs(songs, query, &links);
    let total_count = filtered.len();
    let page_songs = paginate(
        sort_songs(filtered, query.sort_by, query.sort_order),
        query.page,
        page_size,
    );

    let last_played = if page_songs.is_empty() {
        HashMap::new()
    } else {
        let ids = page_songs.iter().map(|s| s.id.clone()).collect();
        let scores = store
            .find_scores(&ScoreFilter::for_user(&query.user_id).songs(ids))
            .map_err(|e| CoreError::store("find_scores", e))?;
        last_played_by_song(&scores)
    };

    debug!(
        user = %query.user_id,
        scope = %query.scope,
        page = query.page,
        total_count,
        "Catalog page planned"
    );

    Ok(CatalogPage {
        items: enrich(page_songs, &links, &last_played),
        total_count,
        total_pages: total_pages(total_count, page_size),
        page: query.page,
        page_size,
    })
}

/// Distinct genres of every song in `scope`, ignoring pagination
pub fn genres_in_scope<S: EventStore + ?Sized>(
    store: &S,
    user_id: &UserId,
    scope: CatalogScope,
) -> Result<Vec<String>, CoreError> {
    let links = if scope.includes_imports() {
        load_links(store, user_id)?
    } else {
        UserLinks::default()
    };
    let songs = load_scope(store, scope, &links)?;
    Ok(distinct_genres(&songs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(id: &str, title: &str, composer: Option<&str>, genre: Option<&str>) -> Song {
        Song {
            id: SongId::from(id),
            title: title.to_string(),
            composer: composer.map(str::to_string),
            genre: genre.map(str::to_string),
            tempo: 100,
            duration_ms: 60_000,
            difficulty: 3,
            song_type: "piece".to_string(),
            source_type: SourceType::Library,
            key_ref: String::new(),
        }
    }

    fn ids(songs: &[Song]) -> Vec<&str> {
        songs.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_sort_ties_break_by_id_in_both_orders() {
        let songs = vec![
            song("c", "Etude", None, None),
            song("a", "Etude", None, None),
            song("b", "Air", None, None),
        ];

        let asc = sort_songs(songs.clone(), SortKey::Title, SortOrder::Asc);
        assert_eq!(ids(&asc), vec!["b", "a", "c"]);

        let desc = sort_songs(songs, SortKey::Title, SortOrder::Desc);
        assert_eq!(ids(&desc), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_sort_missing_composer_last_ascending() {
        let songs = vec![
            song("1", "A", None, None),
            song("2", "B", Some("bach"), None),
            song("3", "C", Some("Albeniz"), None),
        ];

        let asc = sort_songs(songs.clone(), SortKey::Composer, SortOrder::Asc);
        assert_eq!(ids(&asc), vec!["3", "2", "1"]);

        let desc = sort_songs(songs, SortKey::Composer, SortOrder::Desc);
        assert_eq!(ids(&desc), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(0, 20), 0);
        assert_eq!(total_pages(1, 20), 1);
        assert_eq!(total_pages(20, 20), 1);
        assert_eq!(total_pages(21, 20), 2);
    }

    #[test]
    fn test_pages_concatenate_to_sorted_set() {
        let songs: Vec<Song> = (0..47)
            .map(|i| song(&format!("s{:02}", i), &format!("T{}", i % 5), None, None))
            .collect();
        let sorted = sort_songs(songs.clone(), SortKey::Title, SortOrder::Desc);

        let mut concatenated = Vec::new();
        for page in 1..=total_pages(songs.len(), 10) as u32 {
            concatenated.extend(paginate(sorted.clone(), page, 10));
        }
        assert_eq!(concatenated, sorted);
        assert!(paginate(sorted, 6, 10).is_empty());
    }

    #[test]
    fn test_filter_search_genre_and_links() {
        let songs = vec![
            song("1", "Moonlight Sonata", Some("Beethoven"), Some("Classical")),
            song("2", "Clair de Lune", Some("Debussy"), Some("classical")),
            song("3", "Take Five", Some("Brubeck"), Some("Jazz")),
        ];
        let links = UserLinks {
            favorites: [SongId::from("2"), SongId::from("3")].into_iter().collect(),
            owned: HashSet::new(),
        };
        let user = UserId::from("u1");

        let query = CatalogQuery::new(user.clone(), CatalogScope::Library).search("BEET");
        assert_eq!(ids(&filter_songs(songs.clone(), &query, &links)), vec!["1"]);

        let query = CatalogQuery::new(user.clone(), CatalogScope::Library).genre("CLASSICAL");
        assert_eq!(filter_songs(songs.clone(), &query, &links).len(), 2);

        let query = CatalogQuery::new(user.clone(), CatalogScope::Library)
            .genre("classical")
            .favorites_only(true);
        assert_eq!(ids(&filter_songs(songs.clone(), &query, &links)), vec!["2"]);

        let query = CatalogQuery::new(user, CatalogScope::Library).owned_only(true);
        assert!(filter_songs(songs, &query, &links).is_empty());
    }

    #[test]
    fn test_query_validation() {
        let config = CatalogConfig::default();
        let user = UserId::from("u1");

        let query = CatalogQuery::new(user.clone(), CatalogScope::Union);
        assert_eq!(query.validate(&config).unwrap(), config.default_page_size);

        let err = query.clone().page(0).validate(&config).unwrap_err();
        assert!(matches!(err, CoreError::Validation { field: "page", .. }));

        let err = query.clone().page_size(0).validate(&config).unwrap_err();
        assert!(matches!(err, CoreError::Validation { field: "page_size", .. }));
        assert!(query.page_size(config.max_page_size + 1).validate(&config).is_err());

        assert!("popularity".parse::<SortKey>().is_err());
        assert!("sideways".parse::<SortOrder>().is_err());
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
    }

    #[test]
    fn test_blank_search_is_ignored() {
        let query = CatalogQuery::new(UserId::from("u1"), CatalogScope::Library).search("   ");
        assert_eq!(query.search, None);
    }

    #[test]
    fn test_cache_fragment_normalizes_case() {
        let user = UserId::from("u1");
        let a = CatalogQuery::new(user.clone(), CatalogScope::Import).search("Chopin");
        let b = CatalogQuery::new(user, CatalogScope::Import).search("chopin");
        assert_eq!(a.cache_fragment(20), b.cache_fragment(20));
        assert_ne!(a.cache_fragment(20), a.clone().page(2).cache_fragment(20));
    }

    #[test]
    fn test_distinct_genres() {
        let songs = vec![
            song("1", "A", None, Some("Jazz")),
            song("2", "B", None, Some("classical")),
            song("3", "C", None, Some("Classical")),
            song("4", "D", None, None),
            song("5", "E", None, Some("  ")),
            song("6", "F", None, Some("électro")),
            song("7", "G", None, Some("ÉLECTRO")),
        ];
        assert_eq!(distinct_genres(&songs), vec!["Classical", "Jazz", "ÉLECTRO"]);
    }

    #[test]
    fn test_last_played_keeps_latest() {
        use chrono::TimeZone;
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let record = |ts: DateTime<Utc>| ScoreRecord {
            id: crate::models::ScoreId::from(format!("r{}", ts)),
            user_id: UserId::from("u1"),
            song_id: SongId::from("s1"),
            played_at: ts,
            correct: 0,
            wrong: 0,
            missed: 0,
            max_combo: 0,
            max_multiplier: 0,
            duration_ms: 0,
        };

        let latest = last_played_by_song(&[record(late), record(early)]);
        assert_eq!(latest.get(&SongId::from("s1")), Some(&late));
    }
}
