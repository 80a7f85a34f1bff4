mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redcache::{CacheError, ProxyConfig};
use support::TestContext;

#[tokio::test(flavor = "multi_thread")]
async fn test_second_acquire_waits_for_release() {
    let config = ProxyConfig::new().set_max_connections(1);
    let Some(ctx) = TestContext::with_config(config) else { return };
    let pool = ctx.proxy.connection_pool();

    let first = pool.acquire().await.unwrap();
    assert_eq!(pool.connection_count(), 1);

    let acquired = Arc::new(AtomicBool::new(false));
    let acquired_clone = acquired.clone();
    let pool_clone = pool.clone();
    let waiter = tokio::spawn(async move {
        let conn = pool_clone.acquire().await.unwrap();
        acquired_clone.store(true, Ordering::SeqCst);
        drop(conn);
    });

    // The second acquire must block while the only connection is out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!acquired.load(Ordering::SeqCst));

    first.release();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter never acquired after release")
        .unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_try_acquire_fails_when_full() {
    let config = ProxyConfig::new().set_max_connections(1);
    let Some(ctx) = TestContext::with_config(config) else { return };
    let pool = ctx.proxy.connection_pool();

    let held = pool.acquire().await.unwrap();
    let err = pool.try_acquire().await.unwrap_err();
    assert!(matches!(err, CacheError::PoolExhausted));

    drop(held);
    let _ = pool.try_acquire().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_acquire_timeout_expires_as_pool_exhausted() {
    let config = ProxyConfig::new()
        .set_max_connections(1)
        .set_acquire_timeout(Duration::from_millis(50));
    let Some(ctx) = TestContext::with_config(config) else { return };
    let pool = ctx.proxy.connection_pool();

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, CacheError::PoolExhausted));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connections_are_reused() {
    let Some(ctx) = TestContext::new() else { return };
    let pool = ctx.proxy.connection_pool();

    for _ in 0..10 {
        let conn = pool.acquire().await.unwrap();
        drop(conn);
    }
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_commands_share_bounded_pool() {
    let config = ProxyConfig::new().set_max_connections(2);
    let Some(ctx) = TestContext::with_config(config) else { return };
    let proxy = Arc::new(ctx.proxy);

    let mut tasks = Vec::new();
    for i in 0..16i64 {
        let proxy = proxy.clone();
        tasks.push(tokio::spawn(async move {
            let key = format!("key{i}");
            let _: () = proxy.set(&key, i).await.unwrap();
            let value: i64 = proxy.get(&key).await.unwrap();
            assert_eq!(value, i);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(proxy.connection_pool().connection_count() <= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_drops_idle_connections() {
    let Some(ctx) = TestContext::new() else { return };
    let pool = ctx.proxy.connection_pool();

    let conn = pool.acquire().await.unwrap();
    conn.release();
    assert_eq!(pool.connection_count(), 1);
    pool.disconnect();
    assert_eq!(pool.connection_count(), 0);
}
