#![allow(dead_code)]

use resilient_store::{
    InMemoryKeyValueStore, InstantSleeper, ManualClock, MemoryDatabase, ResilienceConfig,
    ResilientOperations, StoreError,
};
use std::sync::Arc;

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Instance {
    pub ops: ResilientOperations<MemoryDatabase>,
    pub db: MemoryDatabase,
    pub kv: InMemoryKeyValueStore,
    pub clock: ManualClock,
}

/// Operations over fresh in-memory backends with instant retries and a manual clock.
pub fn instance(config_json: &str) -> Instance {
    let db = MemoryDatabase::new();
    let kv = InMemoryKeyValueStore::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let ops = build(&db, &kv, &clock, config_json);
    Instance { ops, db, kv, clock }
}

/// Another process instance sharing the same database, key-value store, and clock.
pub fn sibling(of: &Instance, config_json: &str) -> ResilientOperations<MemoryDatabase> {
    build(&of.db, &of.kv, &of.clock, config_json)
}

fn build(
    db: &MemoryDatabase,
    kv: &InMemoryKeyValueStore,
    clock: &ManualClock,
    config_json: &str,
) -> ResilientOperations<MemoryDatabase> {
    init_tracing();
    let config = ResilienceConfig::from_json_str(config_json).expect("valid config");
    let retry = config
        .retry_builder::<StoreError>("store")
        .should_retry(StoreError::is_transient)
        .with_sleeper(InstantSleeper)
        .build()
        .expect("valid retry policy");
    ResilientOperations::builder(db.clone(), Arc::new(kv.clone()))
        .config(config)
        .retry_policy(retry)
        .clock(clock.clone())
        .build()
        .expect("operations")
}
