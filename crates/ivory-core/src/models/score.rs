//! Practice-session score records and the ratios derived from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ScoreId, SongId, UserId};
use crate::config::ScoringConfig;

/// One finished practice session, as written by the game client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub id: ScoreId,
    pub user_id: UserId,
    pub song_id: SongId,
    pub played_at: DateTime<Utc>,
    pub correct: u32,
    pub wrong: u32,
    pub missed: u32,
    #[serde(default)]
    pub max_combo: u32,
    #[serde(default)]
    pub max_multiplier: u32,
    pub duration_ms: u64,
}

impl ScoreRecord {
    /// Weighted session score
    ///
    /// `base = max(0, correct * note_points - wrong * wrong_penalty)`, scaled
    /// by the best multiplier (at least 1) plus a bonus per combo note.
    pub fn session_score(&self, weights: &ScoringConfig) -> u64 {
        let earned = u64::from(self.correct) * weights.note_points;
        let penalty = u64::from(self.wrong) * weights.wrong_penalty;
        let base = earned.saturating_sub(penalty);
        let multiplier = u64::from(self.max_multiplier.max(1));

        base.saturating_mul(multiplier)
            .saturating_add(u64::from(self.max_combo) * weights.combo_bonus)
    }

    pub fn learn_scores(&self) -> LearnScores {
        LearnScores::from_counts(self.correct, self.wrong, self.missed)
    }
}

/// Percentages shown after a learning session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnScores {
    /// correct / (correct + wrong + missed), floored, 0-100
    pub performance: u32,
    /// correct / (correct + wrong), floored, 0-100
    pub accuracy: u32,
}

impl LearnScores {
    pub fn from_counts(correct: u32, wrong: u32, missed: u32) -> Self {
        let played = u64::from(correct) + u64::from(wrong);
        let total = played + u64::from(missed);

        Self {
            performance: floor_percent(u64::from(correct), total),
            accuracy: floor_percent(u64::from(correct), played),
        }
    }
}

/// `floor(part / whole * 100)`, 0 when `whole` is 0
fn floor_percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    (part.saturating_mul(100) / whole).min(100) as u32
}
