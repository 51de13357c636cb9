//! Payloads exchanged with the backing store and cached as JSON.

use serde::{Deserialize, Serialize};

/// Aggregate statistics for one player.
///
/// `PlayerStats::empty` is the documented zero value served when neither the store nor the cache
/// can answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    pub player_id: String,
    pub games_played: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_score: u64,
    pub high_score: u64,
}

impl PlayerStats {
    pub fn empty(player_id: impl Into<String>) -> Self {
        Self { player_id: player_id.into(), ..Self::default() }
    }

    pub fn win_rate(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            self.wins as f64 / self.games_played as f64
        }
    }

    /// Fold an update into these stats.
    pub fn apply(&mut self, update: &StatsUpdate) {
        self.games_played = self.games_played.saturating_add(update.games_played);
        self.wins = self.wins.saturating_add(update.wins);
        self.losses = self.losses.saturating_add(update.losses);
        self.total_score = self.total_score.saturating_add(update.score);
        if let Some(score) = update.high_score {
            self.high_score = self.high_score.max(score);
        }
    }
}

/// Incremental change to a player's stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    #[serde(default)]
    pub games_played: u64,
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub losses: u64,
    #[serde(default)]
    pub score: u64,
    /// Candidate for a new personal best.
    #[serde(default)]
    pub high_score: Option<u64>,
}

impl StatsUpdate {
    /// The update a single finished match implies.
    pub fn from_match(record: &MatchRecord) -> Self {
        Self {
            games_played: 1,
            wins: u64::from(record.won),
            losses: u64::from(!record.won),
            score: record.score,
            high_score: Some(record.score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// 1-based position.
    pub rank: u32,
    pub player_id: String,
    pub total_score: u64,
    pub wins: u64,
}

/// One finished match, recorded from a single player's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub match_id: String,
    pub player_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_id: Option<String>,
    pub score: u64,
    pub won: bool,
    /// Unix epoch millis.
    pub played_at: u64,
}
