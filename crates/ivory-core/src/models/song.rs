//! Song catalog models and the per-user association links

use serde::{Deserialize, Serialize};

use super::ids::{SongId, UserId};

/// Where a song comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Shared catalog, visible to every user
    Library,
    /// Uploaded by exactly one user
    Import,
}

/// Practising user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub level: u32,
}

/// Song record as stored by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub id: SongId,
    pub title: String,
    #[serde(default)]
    pub composer: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    /// Beats per minute
    #[serde(default)]
    pub tempo: u32,
    pub duration_ms: u64,
    /// 1 (easiest) to 10
    pub difficulty: u8,
    /// Free-form song type ("classical", "exercise", ...)
    #[serde(rename = "type", default)]
    pub song_type: String,
    pub source_type: SourceType,
    /// Storage reference of the note data
    #[serde(default)]
    pub key_ref: String,
}

impl Song {
    /// Case-insensitive substring match on title or composer.
    ///
    /// `needle` must already be lowercased.
    pub fn matches_search(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle)
            || self
                .composer
                .as_ref()
                .map(|c| c.to_lowercase().contains(needle))
                .unwrap_or(false)
    }

    /// Case-insensitive genre equality
    pub fn has_genre(&self, genre: &str) -> bool {
        self.genre
            .as_ref()
            .map(|g| g.to_lowercase() == genre.to_lowercase())
            .unwrap_or(false)
    }
}

/// User marked a song as favorite
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteLink {
    pub user_id: UserId,
    pub song_id: SongId,
}

/// User owns an imported song
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportLink {
    pub user_id: UserId,
    pub song_id: SongId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(title: &str, composer: Option<&str>) -> Song {
        Song {
            id: SongId::from("s1"),
            title: title.to_string(),
            composer: composer.map(str::to_string),
            genre: Some("Classical".to_string()),
            tempo: 120,
            duration_ms: 180_000,
            difficulty: 4,
            song_type: "piece".to_string(),
            source_type: SourceType::Library,
            key_ref: "songs/s1.mid".to_string(),
        }
    }

    #[test]
    fn test_search_matches_title_or_composer() {
        let s = song("Clair de Lune", Some("Claude Debussy"));
        assert!(s.matches_search("clair"));
        assert!(s.matches_search("debussy"));
        assert!(!s.matches_search("chopin"));

        let anonymous = song("Greensleeves", None);
        assert!(!anonymous.matches_search("debussy"));
    }

    #[test]
    fn test_genre_is_case_insensitive() {
        let s = song("Clair de Lune", None);
        assert!(s.has_genre("classical"));
        assert!(!s.has_genre("jazz"));

        let mut electro = song("Nuit", None);
        electro.genre = Some("ÉLECTRO".to_string());
        assert!(electro.has_genre("électro"));
    }

    #[test]
    fn test_song_json_uses_wire_names() {
        let json = r#"{
            "id": "s9", "title": "Etude", "durationMs": 60000, "difficulty": 7,
            "type": "exercise", "sourceType": "import"
        }"#;
        let s: Song = serde_json::from_str(json).unwrap();
        assert_eq!(s.song_type, "exercise");
        assert_eq!(s.source_type, SourceType::Import);
        assert!(s.composer.is_none());
    }
}
