//! Query surface of a backing-store connection.

use crate::model::{LeaderboardEntry, MatchRecord, PlayerStats, StatsUpdate};
use crate::StoreError;
use async_trait::async_trait;

/// Queries available on one checked-out connection.
///
/// Implementations classify failures through [`StoreError`] so the retry layer can tell transient
/// faults from rejected requests.
#[async_trait]
pub trait GameStore: Send {
    /// Stats for `player_id`, or `None` if the player has no record.
    async fn fetch_stats(&mut self, player_id: &str) -> Result<Option<PlayerStats>, StoreError>;

    /// Apply `update` and return the resulting stats, creating the record if needed.
    async fn apply_stats_update(
        &mut self,
        player_id: &str,
        update: &StatsUpdate,
    ) -> Result<PlayerStats, StoreError>;

    /// Top `limit` players by total score.
    async fn fetch_leaderboard(&mut self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError>;

    /// Record a finished match and fold it into the player's stats.
    async fn insert_match(&mut self, record: &MatchRecord) -> Result<(), StoreError>;

    /// Most recent matches for `player_id`, newest first.
    async fn fetch_matches(
        &mut self,
        player_id: &str,
        limit: usize,
    ) -> Result<Vec<MatchRecord>, StoreError>;
}
