#[macro_use]
mod support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use redis::Value;
use support::TestContext;

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_returns_replies_in_order() {
    let Some(ctx) = TestContext::new() else { return };
    let proxy = &ctx.proxy;

    let mut pipe = proxy.pipeline();
    pipe.set("p1", 1).set("p2", 2).rpush("pl", &["a", "b"]);
    let replies = pipe.execute().await.unwrap();

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0], Value::Okay);
    assert_eq!(replies[1], Value::Okay);
    assert_eq!(replies[2], Value::Int(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_discards_without_network_effect() {
    let Some(ctx) = TestContext::new() else { return };
    let proxy = &ctx.proxy;

    let _: () = proxy.set("stable", "before").await.unwrap();

    let mut pipe = proxy.pipeline();
    pipe.set("stable", "after").del("stable");
    pipe.reset();

    let value: String = proxy.get("stable").await.unwrap();
    assert_eq!(value, "before");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deferred_edits_land_only_after_execute() {
    let Some(ctx) = TestContext::new() else { return };
    if !ctx.connect_caching().await {
        return;
    }
    let proxy = &ctx.proxy;

    let _: () = proxy.set("deferred", "old").await.unwrap();
    let value: String = proxy.get("deferred").await.unwrap();
    assert_eq!(value, "old");

    let mut pipe = proxy.pipeline();
    pipe.set("deferred", "new");

    // Buffered but not executed: the cached value is untouched.
    let value: String = proxy.get("deferred").await.unwrap();
    assert_eq!(value, "old");

    pipe.execute().await.unwrap();
    let value: String = proxy.get("deferred").await.unwrap();
    assert_eq!(value, "new");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_cache_edits_apply_in_issue_order() {
    let Some(ctx) = TestContext::new() else { return };
    if !ctx.connect_caching().await {
        return;
    }
    let proxy = &ctx.proxy;

    let _: i64 = proxy.rpush("order", &["a"]).await.unwrap();
    let list: Vec<String> = proxy.lrange("order", 0, -1).await.unwrap();
    assert_eq!(list, vec!["a"]);

    let mut pipe = proxy.pipeline();
    pipe.rpush("order", &["b"])
        .lpop("order")
        .rpush("order", &["c"]);
    pipe.execute().await.unwrap();

    // Cached list and server list must agree on [b, c].
    let list: Vec<String> = proxy.lrange("order", 0, -1).await.unwrap();
    assert_eq!(list, vec!["b", "c"]);

    let mut raw = ctx.raw_connection().await;
    let server_list: Vec<String> = redis::cmd("LRANGE")
        .arg("order")
        .arg(0)
        .arg(-1)
        .query_async(&mut raw)
        .await
        .unwrap();
    assert_eq!(server_list, list);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_callbacks_run_in_registration_order() {
    let Some(ctx) = TestContext::new() else { return };
    let proxy = &ctx.proxy;

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicUsize::new(0));

    let mut pipe = proxy.pipeline();
    pipe.set("cb", 1);
    for label in ["first", "second", "third"] {
        let order = order.clone();
        let counter = counter.clone();
        pipe.add_execute_callback(move || {
            order.lock().unwrap().push(label);
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    pipe.execute().await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_execute_runs_no_thunks_or_callbacks() {
    let Some(ctx) = TestContext::new() else { return };
    if !ctx.connect_caching().await {
        return;
    }
    let proxy = &ctx.proxy;

    let _: () = proxy.set("guarded", "original").await.unwrap();
    let _: String = proxy.get("guarded").await.unwrap();

    let called = Arc::new(AtomicBool::new(false));
    let called_clone = called.clone();
    let mut pipe = proxy.pipeline();
    pipe.set("guarded", "poisoned");
    // A command the server rejects fails the whole batch.
    pipe.add_command(redis::cmd("NOSUCHCOMMAND"));
    pipe.add_execute_callback(move || called_clone.store(true, Ordering::SeqCst));
    let result = pipe.execute().await;
    assert!(result.is_err());
    assert!(!called.load(Ordering::SeqCst));

    // The deferred edit never ran; the cache converges on the server's
    // state through the invalidation feed instead of a local guess.
    let converged = wait_for!({
        let value: String = proxy.get("guarded").await.unwrap();
        value == "poisoned"
    });
    assert!(converged);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hash_edits_through_pipeline() {
    let Some(ctx) = TestContext::new() else { return };
    if !ctx.connect_caching().await {
        return;
    }
    let proxy = &ctx.proxy;

    let _: i64 = proxy.hset("ph", "keep", "1").await.unwrap();
    let _: HashMap<String, String> = proxy.hgetall("ph").await.unwrap();

    let mut pipe = proxy.pipeline();
    pipe.hset("ph", "added", "2")
        .hset_multiple("ph", &[("x", "3"), ("y", "4")])
        .hdel("ph", &["keep"]);
    pipe.execute().await.unwrap();

    let map: HashMap<String, String> = proxy.hgetall("ph").await.unwrap();
    assert_eq!(map.len(), 3);
    assert!(!map.contains_key("keep"));
    assert_eq!(map["added"], "2");
    assert_eq!(map["y"], "4");
}
