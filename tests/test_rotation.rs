#[macro_use]
mod support;

use std::time::Duration;

use redcache::RotationLimits;
use support::TestContext;

async fn stream_len(conn: &mut redis::aio::MultiplexedConnection, stream: &str) -> i64 {
    redis::cmd("XLEN")
        .arg(stream)
        .query_async(conn)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_event_limit_triggers_background_flush() {
    let Some(ctx) = TestContext::new() else { return };
    let rotating = ctx
        .proxy
        .rotating_pipeline(RotationLimits::new().set_max_stream_events(3));
    let mut raw = ctx.raw_connection().await;

    for i in 0..2 {
        rotating
            .with_buffer(|buf| {
                buf.xadd("events", &[("seq", i.to_string())]);
            })
            .await;
    }
    assert_eq!(stream_len(&mut raw, "events").await, 0);

    // The third event on the same stream hits the maximum; no explicit
    // flush is needed.
    rotating
        .with_buffer(|buf| {
            buf.xadd("events", &[("seq", "2")]);
        })
        .await;

    let flushed = wait_for!(stream_len(&mut raw, "events").await == 3);
    assert!(flushed, "background execution never flushed the buffer");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_byte_limit_bounds_buffer_growth() {
    let Some(ctx) = TestContext::new() else { return };
    let rotating = ctx
        .proxy
        .rotating_pipeline(RotationLimits::new().set_max_bytes(256));
    let mut raw = ctx.raw_connection().await;

    let payload = "x".repeat(300);
    rotating
        .with_buffer(|buf| {
            buf.set("big", payload.as_str());
        })
        .await;

    let flushed = wait_for!({
        let value: Option<String> = redis::cmd("GET")
            .arg("big")
            .query_async(&mut raw)
            .await
            .unwrap();
        value.as_deref() == Some(payload.as_str())
    });
    assert!(flushed);
    assert_eq!(rotating.buffered_commands().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_time_limit_flushes_waiting_commands() {
    let Some(ctx) = TestContext::new() else { return };
    let rotating = ctx
        .proxy
        .rotating_pipeline(RotationLimits::new().set_max_time(Duration::from_millis(100)));
    let mut raw = ctx.raw_connection().await;

    rotating
        .with_buffer(|buf| {
            buf.set("timed", "v");
        })
        .await;
    // Nothing reached the limit yet; only the clock will.
    let flushed = wait_for!({
        let value: Option<String> = redis::cmd("GET")
            .arg("timed")
            .query_async(&mut raw)
            .await
            .unwrap();
        value.is_some()
    });
    assert!(flushed, "time limit never rotated the buffer");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_is_a_synchronization_point() {
    let Some(ctx) = TestContext::new() else { return };
    // No limits: nothing flushes until asked.
    let rotating = ctx.proxy.rotating_pipeline(RotationLimits::new());
    let mut raw = ctx.raw_connection().await;

    for i in 0..5i64 {
        rotating
            .with_buffer(|buf| {
                buf.set(format!("bulk{i}"), i);
            })
            .await;
    }
    assert_eq!(rotating.buffered_commands().await, 5);

    rotating.flush(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(rotating.buffered_commands().await, 0);
    let value: i64 = redis::cmd("GET")
        .arg("bulk4")
        .query_async(&mut raw)
        .await
        .unwrap();
    assert_eq!(value, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_appends_during_flush_reach_the_fresh_buffer() {
    let Some(ctx) = TestContext::new() else { return };
    let rotating = ctx.proxy.rotating_pipeline(RotationLimits::new());

    rotating
        .with_buffer(|buf| {
            buf.set("first", 1);
        })
        .await;
    rotating.request_flush().await;

    // Producers never block on flush latency: this append lands in the
    // freshly swapped-in buffer.
    rotating
        .with_buffer(|buf| {
            buf.set("second", 2);
        })
        .await;

    rotating.flush(Some(Duration::from_secs(5))).await.unwrap();

    let mut raw = ctx.raw_connection().await;
    let first: Option<i64> = redis::cmd("GET")
        .arg("first")
        .query_async(&mut raw)
        .await
        .unwrap();
    let second: Option<i64> = redis::cmd("GET")
        .arg("second")
        .query_async(&mut raw)
        .await
        .unwrap();
    assert_eq!(first, Some(1));
    assert_eq!(second, Some(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_surfaces_execution_errors() {
    let Some(ctx) = TestContext::new() else { return };
    let rotating = ctx.proxy.rotating_pipeline(RotationLimits::new());

    rotating
        .with_buffer(|buf| {
            buf.add_command(redis::cmd("NOSUCHCOMMAND"));
        })
        .await;

    let result = rotating.flush(Some(Duration::from_secs(5))).await;
    assert!(result.is_err());
}
