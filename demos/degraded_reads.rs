//! Walks a store outage: fresh reads, cached fallbacks, the breaker opening, and recovery.
//!
//! Run with `RUST_LOG=resilient_store=info cargo run --example degraded_reads`.
use resilient_store::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"{
    "breakers": { "store": { "failureThreshold": 2, "recoveryTimeoutMs": 500, "successThreshold": 1 } },
    "retry": { "store": { "maxAttempts": 2, "baseDelayMs": 20, "maxDelayMs": 50 } },
    "pool": { "maxConnections": 4, "acquireTimeoutMs": 200 },
    "cache": { "prefix": "demo" }
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db = MemoryDatabase::new();
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let ops = ResilientOperations::builder(db.clone(), kv)
        .config(ResilienceConfig::from_json_str(CONFIG)?)
        .build()?;
    let _reaper = ops.spawn_idle_reaper();

    for (id, player, score, won) in [("m-1", "ada", 120, true), ("m-2", "grace", 90, false)] {
        let record = MatchRecord {
            match_id: id.into(),
            player_id: player.into(),
            opponent_id: None,
            score,
            won,
            played_at: 1,
        };
        println!("save_match {id}: persisted={}", ops.save_match(&record).await);
    }

    let stats = ops.get_stats("ada").await;
    println!("healthy: ada wins={} via {:?}", stats.value.wins, stats.source);
    let board = ops.get_leaderboard(5).await;
    println!("healthy: leaderboard of {} via {:?}", board.value.len(), board.source);

    db.set_down(true);
    println!("-- store down --");
    for player in ["ada", "ada", "linus"] {
        let stats = ops.get_stats(player).await;
        println!("{player}: wins={} via {:?}", stats.value.wins, stats.source);
    }
    println!("write while down: persisted={}", ops.update_stats("ada", &StatsUpdate::default()).await);
    println!("breakers: {:?}", ops.breaker_states());

    db.set_down(false);
    tokio::time::sleep(Duration::from_millis(600)).await;
    println!("-- store back --");
    let stats = ops.get_stats("ada").await;
    println!("ada: wins={} via {:?}", stats.value.wins, stats.source);
    println!("breakers: {:?}", ops.breaker_states());
    println!("pool: {:?}", ops.pool_status());

    Ok(())
}
