use resilient_store::{ConnectionPool, GameStore, MemoryDatabase, PoolConfig, ResilienceError, StoreError};
use std::time::Duration;
use tokio::time::Instant;

fn pool(max: usize, acquire: Duration) -> (ConnectionPool<MemoryDatabase>, MemoryDatabase) {
    let db = MemoryDatabase::new();
    let config = PoolConfig::new(max, Duration::from_secs(30), acquire).unwrap();
    (ConnectionPool::new(db.clone(), config), db)
}

#[tokio::test(start_paused = true)]
async fn third_acquire_without_release_fails_after_acquire_timeout() {
    let (pool, _) = pool(2, Duration::from_millis(100));

    let started = Instant::now();
    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO, "free slots are handed out immediately");

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, ResilienceError::PoolExhausted { max_connections: 2, .. }));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(150));

    drop((first, second));
}

#[tokio::test(start_paused = true)]
async fn blocked_acquire_completes_when_a_connection_is_released() {
    let (pool, db) = pool(1, Duration::from_secs(5));
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let conn = pool.acquire().await.unwrap();
            (started.elapsed(), conn.id())
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    let held_id = held.id();
    pool.release(held);

    let (waited, id) = waiter.await.unwrap();
    assert!(waited >= Duration::from_millis(300) && waited < Duration::from_secs(5));
    assert_eq!(id, held_id, "the released connection is handed over");
    assert_eq!(db.connect_count(), 1);
}

#[tokio::test]
async fn with_connection_runs_queries_and_returns_the_connection() {
    let (pool, db) = pool(2, Duration::from_secs(1));

    let board = pool
        .with_connection(|conn| Box::pin(async move { conn.fetch_leaderboard(5).await }))
        .await
        .unwrap();
    assert!(board.is_empty());

    let err = pool
        .with_connection(|conn| Box::pin(async move { conn.fetch_stats("").await }))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::Inner(StoreError::Rejected(_))));

    let status = pool.status();
    assert_eq!((status.total, status.idle, status.in_use), (1, 1, 0));
    assert_eq!(db.connect_count(), 1);
}

#[tokio::test]
async fn refused_connections_surface_as_store_errors() {
    let (pool, db) = pool(2, Duration::from_secs(1));
    db.set_down(true);
    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.into_inner(), Some(StoreError::Unavailable("database refused connection".into())));
    assert_eq!(pool.status().total, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_closed_by_the_reaper() {
    let (pool, db) = pool(3, Duration::from_secs(1));
    let conns = vec![pool.acquire().await.unwrap(), pool.acquire().await.unwrap()];
    drop(conns);
    assert_eq!(pool.status().idle, 2);

    let _reaper = pool.spawn_idle_reaper(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(36)).await;

    assert_eq!(pool.status().total, 0);
    assert_eq!(db.close_count(), 2);
}
