//! In-process backing store with failure injection.
//!
//! `MemoryDatabase` plays both roles the pool needs: it is the [`ConnectionFactory`] and its
//! connections implement [`GameStore`]. Tests and demos script outages with
//! [`MemoryDatabase::fail_next`] and [`MemoryDatabase::set_down`].

use crate::model::{LeaderboardEntry, MatchRecord, PlayerStats, StatsUpdate};
use crate::pool::ConnectionFactory;
use crate::store::GameStore;
use crate::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    stats: HashMap<String, PlayerStats>,
    matches: Vec<MatchRecord>,
}

#[derive(Debug, Default)]
struct Faults {
    pending: VecDeque<StoreError>,
    down: bool,
    latency: Duration,
}

#[derive(Debug, Default)]
struct DbInner {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    queries: AtomicUsize,
}

impl DbInner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared in-memory database. Clones refer to the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<DbInner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` queries fail with `error`.
    pub fn fail_next(&self, n: usize, error: StoreError) {
        let mut faults = self.inner.faults();
        faults.pending.extend(std::iter::repeat(error).take(n));
    }

    /// While down, new connections are refused and queries on open ones fail as transient.
    pub fn set_down(&self, down: bool) {
        self.inner.faults().down = down;
    }

    /// Delay applied to every query.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.faults().latency = latency;
    }

    /// Insert or replace a player's stats directly, bypassing fault injection.
    pub fn seed_stats(&self, stats: PlayerStats) {
        self.inner.tables().stats.insert(stats.player_id.clone(), stats);
    }

    /// Read a player's stats directly, bypassing fault injection.
    pub fn peek_stats(&self, player_id: &str) -> Option<PlayerStats> {
        self.inner.tables().stats.get(player_id).cloned()
    }

    pub fn match_count(&self) -> usize {
        self.inner.tables().matches.len()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Queries attempted, including ones that failed by injection.
    pub fn query_count(&self) -> usize {
        self.inner.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryDatabase {
    type Connection = MemoryConnection;
    type Error = StoreError;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        if self.inner.faults().down {
            return Err(StoreError::Unavailable("database refused connection".into()));
        }
        let id = self.inner.connects.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(connection = id, "memory database connection opened");
        Ok(MemoryConnection { id, db: self.inner.clone() })
    }

    async fn close(&self, conn: MemoryConnection) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(connection = conn.id, "memory database connection closed");
    }
}

/// One open connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: usize,
    db: Arc<DbInner>,
}

impl MemoryConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    async fn begin_query(&self) -> Result<(), StoreError> {
        self.db.queries.fetch_add(1, Ordering::SeqCst);
        let latency = self.db.faults().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut faults = self.db.faults();
        if faults.down {
            return Err(StoreError::Transient("connection reset by peer".into()));
        }
        match faults.pending.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn require_player(player_id: &str) -> Result<(), StoreError> {
    if player_id.trim().is_empty() {
        return Err(StoreError::Rejected("player id must not be empty".into()));
    }
    Ok(())
}

#[async_trait]
impl GameStore for MemoryConnection {
    async fn fetch_stats(&mut self, player_id: &str) -> Result<Option<PlayerStats>, StoreError> {
        self.begin_query().await?;
        require_player(player_id)?;
        Ok(self.db.tables().stats.get(player_id).cloned())
    }

    async fn apply_stats_update(
        &mut self,
        player_id: &str,
        update: &StatsUpdate,
    ) -> Result<PlayerStats, StoreError> {
        self.begin_query().await?;
        require_player(player_id)?;
        let mut tables = self.db.tables();
        let stats = tables
            .stats
            .entry(player_id.to_string())
            .or_insert_with(|| PlayerStats::empty(player_id));
        stats.apply(update);
        Ok(stats.clone())
    }

    async fn fetch_leaderboard(&mut self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        self.begin_query().await?;
        let tables = self.db.tables();
        let mut ranked: Vec<&PlayerStats> = tables.stats.values().collect();
        ranked.sort_by(|a, b| {
            b.total_score
                .cmp(&a.total_score)
                .then(b.wins.cmp(&a.wins))
                .then(a.player_id.cmp(&b.player_id))
        });
        Ok(ranked
            .into_iter()
            .take(limit)
            .zip(1u32..)
            .map(|(stats, rank)| LeaderboardEntry {
                rank,
                player_id: stats.player_id.clone(),
                total_score: stats.total_score,
                wins: stats.wins,
            })
            .collect())
    }

    async fn insert_match(&mut self, record: &MatchRecord) -> Result<(), StoreError> {
        self.begin_query().await?;
        require_player(&record.player_id)?;
        let mut tables = self.db.tables();
        if tables
            .matches
            .iter()
            .any(|m| m.match_id == record.match_id && m.player_id == record.player_id)
        {
            return Err(StoreError::Rejected(format!(
                "match {} already recorded for {}",
                record.match_id, record.player_id
            )));
        }
        tables.matches.push(record.clone());
        tables
            .stats
            .entry(record.player_id.clone())
            .or_insert_with(|| PlayerStats::empty(&record.player_id))
            .apply(&StatsUpdate::from_match(record));
        Ok(())
    }

    async fn fetch_matches(
        &mut self,
        player_id: &str,
        limit: usize,
    ) -> Result<Vec<MatchRecord>, StoreError> {
        self.begin_query().await?;
        require_player(player_id)?;
        let tables = self.db.tables();
        let mut matches: Vec<MatchRecord> =
            tables.matches.iter().filter(|m| m.player_id == player_id).cloned().collect();
        matches.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        matches.truncate(limit);
        Ok(matches)
    }
}
