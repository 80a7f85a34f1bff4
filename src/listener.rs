//! Background task subscribing to server-assisted invalidation.
//!
//! The listener owns two pinned connections: a RESP3 subscription
//! connection receiving out-of-band frames, and the tracked connection on
//! which `CLIENT TRACKING` is enabled in redirect/broadcast mode. While it
//! runs, the local cache is connected; the moment it stops — by request
//! or because a connection died — the cache is disconnected and emptied.
//! The listener never restarts itself; recovery is a fresh `start`.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Msg, PushInfo, PushKind, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::cache::LocalCache;
use crate::errors::{CacheError, CacheResult};
use crate::pool::{ConnectionPool, TrackingSlot};

/// The reserved channel Redis uses for server-assisted invalidation.
pub(crate) const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";

pub(crate) struct InvalidationListener {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    cache: Arc<LocalCache>,
    tracking: Arc<TrackingSlot>,
}

impl InvalidationListener {
    /// Spawns the listener and waits for its startup handshake. On
    /// timeout or handshake failure everything acquired so far is torn
    /// down and the error is returned to the caller.
    pub(crate) async fn start(
        pool: Arc<ConnectionPool>,
        cache: Arc<LocalCache>,
        tracking: Arc<TrackingSlot>,
        timeout: Duration,
    ) -> CacheResult<InvalidationListener> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (started_tx, started_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            pool,
            cache.clone(),
            tracking.clone(),
            shutdown_rx,
            started_tx,
        ));

        match tokio::time::timeout(timeout, started_rx).await {
            Ok(Ok(Ok(()))) => Ok(InvalidationListener {
                task,
                shutdown: shutdown_tx,
                cache,
                tracking,
            }),
            // The task failed its handshake and has already torn down.
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => {
                task.abort();
                teardown(&cache, &tracking).await;
                Err(CacheError::TrackingProtocol(
                    "listener exited before start completed".into(),
                ))
            }
            Err(_) => {
                task.abort();
                teardown(&cache, &tracking).await;
                Err(CacheError::TrackingProtocol(
                    "timed out waiting for the invalidation listener to start".into(),
                ))
            }
        }
    }

    /// Signals shutdown and joins the task. If the task does not exit
    /// within the timeout it is killed and its teardown is run here;
    /// teardown is idempotent so the two paths cannot conflict.
    pub(crate) async fn stop(mut self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            self.task.abort();
            teardown(&self.cache, &self.tracking).await;
        }
    }
}

async fn run(
    pool: Arc<ConnectionPool>,
    cache: Arc<LocalCache>,
    tracking: Arc<TrackingSlot>,
    mut shutdown: watch::Receiver<bool>,
    started: oneshot::Sender<CacheResult<()>>,
) {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let subscription = match handshake(&pool, &cache, &tracking, push_tx).await {
        Ok(conn) => conn,
        Err(err) => {
            teardown(&cache, &tracking).await;
            let _ = started.send(Err(err));
            return;
        }
    };
    let _ = started.send(Ok(()));

    invalidation_loop(&cache, &mut push_rx, &mut shutdown).await;

    teardown(&cache, &tracking).await;
    drop(subscription);
    log::debug!("invalidation listener stopped");
}

/// Opens both pinned connections and wires the server-side tracking:
/// subscribe (and confirm) first, then redirect invalidation traffic for
/// every key, suppressing notifications for the tracked connection's own
/// writes.
async fn handshake(
    pool: &ConnectionPool,
    cache: &LocalCache,
    tracking: &TrackingSlot,
    push_tx: mpsc::UnboundedSender<PushInfo>,
) -> CacheResult<MultiplexedConnection> {
    let mut subscription = pool.create_pinned_connection(Some(push_tx)).await?;
    let redirect_id: i64 = redis::cmd("CLIENT")
        .arg("ID")
        .query_async(&mut subscription)
        .await?;
    subscription
        .subscribe(INVALIDATION_CHANNEL)
        .await
        .map_err(|err| {
            CacheError::TrackingProtocol(format!("subscription was not acknowledged: {err}"))
        })?;

    let mut tracked = pool.create_pinned_connection(None).await?;
    let reply: Value = redis::cmd("CLIENT")
        .arg("TRACKING")
        .arg("ON")
        .arg("REDIRECT")
        .arg(redirect_id)
        .arg("BCAST")
        .arg("NOLOOP")
        .query_async(&mut tracked)
        .await?;
    if reply != Value::Okay {
        return Err(CacheError::TrackingProtocol(format!(
            "cannot enable key invalidation tracking: {reply:?}"
        )));
    }
    tracking.install(tracked).await;

    cache.lock().await.mark_connected();
    log::debug!("invalidation listener running (redirect id {redirect_id})");
    Ok(subscription)
}

/// Multiplexed wait over the subscription connection and the shutdown
/// signal. Exits on shutdown, on a dropped subscription connection, or
/// when the push channel closes.
async fn invalidation_loop(
    cache: &LocalCache,
    push_rx: &mut mpsc::UnboundedReceiver<PushInfo>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            push = push_rx.recv() => {
                match push {
                    None => {
                        log::warn!("invalidation connection closed, disabling the cache");
                        break;
                    }
                    Some(info) => {
                        if !handle_push(cache, info).await {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Applies one out-of-band frame. Returns false when the frame means the
/// connection is gone.
async fn handle_push(cache: &LocalCache, info: PushInfo) -> bool {
    match info.kind {
        PushKind::Disconnection => {
            log::warn!("invalidation connection dropped, disabling the cache");
            false
        }
        // Invalidation redirected from the tracked connection arrives as
        // an ordinary pub/sub message on the reserved channel.
        PushKind::Message | PushKind::SMessage => {
            let Some(msg) = Msg::from_push_info(info) else {
                return true;
            };
            if msg.get_channel_name() != INVALIDATION_CHANNEL {
                return true;
            }
            purge(cache, payload_keys(msg.get_payload().unwrap_or(Value::Nil))).await;
            true
        }
        // Servers delivering the invalidation natively over RESP3 push.
        PushKind::Invalidate => {
            purge(cache, invalidate_keys(info.data)).await;
            true
        }
        _ => true,
    }
}

enum Purge {
    Keys(Vec<Vec<u8>>),
    // A nil payload means the whole keyspace was flushed.
    Everything,
}

fn payload_keys(payload: Value) -> Purge {
    match payload {
        Value::Nil => Purge::Everything,
        Value::BulkString(key) => Purge::Keys(vec![key]),
        Value::Array(items) => Purge::Keys(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::BulkString(key) => Some(key),
                    _ => None,
                })
                .collect(),
        ),
        _ => Purge::Keys(Vec::new()),
    }
}

fn invalidate_keys(data: Vec<Value>) -> Purge {
    match data.into_iter().next() {
        Some(Value::Nil) | None => Purge::Everything,
        Some(first) => payload_keys(first),
    }
}

async fn purge(cache: &LocalCache, purge: Purge) {
    let mut state = cache.lock().await;
    match purge {
        Purge::Everything => state.invalidate_all(),
        Purge::Keys(keys) => {
            for key in keys {
                state.invalidate(&key);
            }
        }
    }
}

/// Disconnects the cache and gives the tracked connection back through
/// the only path allowed to clear its release flag. Safe to run twice.
async fn teardown(cache: &LocalCache, tracking: &TrackingSlot) {
    cache.lock().await.mark_disconnected();
    if let Some(conn) = tracking.release_by_listener().await {
        // Dropping the handle closes the underlying connection once the
        // driver notices, which also turns tracking off server-side.
        drop(conn);
    }
}
