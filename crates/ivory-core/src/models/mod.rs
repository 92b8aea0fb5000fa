//! Data models for ivory

pub mod ids;
pub mod score;
pub mod song;

pub use ids::{ScoreId, SongId, UserId};
pub use score::{LearnScores, ScoreRecord};
pub use song::{FavoriteLink, ImportLink, Song, SourceType, User};
