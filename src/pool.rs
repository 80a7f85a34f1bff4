//! A bounded, task-safe pool of multiplexed connections.
//!
//! Ordinary connections move between an idle list and an in-use set, with
//! waiting acquirers parked on a [`Notify`]. Pinned connections (the
//! subscription socket and the tracked connection) are created outside
//! this accounting entirely and can only be torn down through their
//! dedicated owner, never through the generic release path.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client, PushInfo};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::errors::{CacheError, CacheResult};

/// Bookkeeping for ordinary (non-pinned) connections.
///
/// Kept generic over the connection type so the accounting rules can be
/// tested without a server.
struct PoolState<C> {
    idle: Vec<(u64, C)>,
    in_use: HashSet<u64>,
    next_id: u64,
    total: usize,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        PoolState {
            idle: Vec::new(),
            in_use: HashSet::new(),
            next_id: 0,
            total: 0,
        }
    }

    fn checkout_idle(&mut self) -> Option<(u64, C)> {
        let (id, conn) = self.idle.pop()?;
        self.in_use.insert(id);
        Some((id, conn))
    }

    /// Reserves an id for a connection that is about to be created. The
    /// caller must follow up with either `register` or `abandon`.
    fn reserve(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.total += 1;
        id
    }

    fn register(&mut self, id: u64) {
        self.in_use.insert(id);
    }

    fn abandon(&mut self) {
        self.total -= 1;
    }

    /// Returns a connection to the idle list. Releasing an id that is not
    /// in use (a double release) is a no-op.
    fn release(&mut self, id: u64, conn: C) -> bool {
        if self.in_use.remove(&id) {
            self.idle.push((id, conn));
            true
        } else {
            false
        }
    }

    fn drop_idle(&mut self) -> usize {
        let dropped = self.idle.len();
        self.total -= dropped;
        self.idle.clear();
        dropped
    }
}

/// A bounded registry of connections to one Redis database.
pub struct ConnectionPool {
    client: Client,
    push_client: Client,
    max_connections: Option<usize>,
    acquire_timeout: Option<Duration>,
    state: Mutex<PoolState<MultiplexedConnection>>,
    available: Notify,
}

impl ConnectionPool {
    pub(crate) fn new(
        client: Client,
        push_client: Client,
        max_connections: Option<usize>,
        acquire_timeout: Option<Duration>,
    ) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool {
            client,
            push_client,
            max_connections,
            acquire_timeout,
            state: Mutex::new(PoolState::new()),
            available: Notify::new(),
        })
    }

    /// Acquires a connection, waiting for one to be released when the
    /// pool is at capacity. With a configured acquire timeout the wait is
    /// bounded and expires as [`CacheError::PoolExhausted`].
    pub async fn acquire(self: &Arc<Self>) -> CacheResult<PooledConnection> {
        match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.acquire_wait())
                .await
                .map_err(|_| CacheError::PoolExhausted)?,
            None => self.acquire_wait().await,
        }
    }

    /// Like [`ConnectionPool::acquire`] but fails immediately with
    /// [`CacheError::PoolExhausted`] instead of waiting.
    pub async fn try_acquire(self: &Arc<Self>) -> CacheResult<PooledConnection> {
        match self.acquire_step().await? {
            Some(conn) => Ok(conn),
            None => Err(CacheError::PoolExhausted),
        }
    }

    async fn acquire_wait(self: &Arc<Self>) -> CacheResult<PooledConnection> {
        loop {
            if let Some(conn) = self.acquire_step().await? {
                return Ok(conn);
            }
            self.available.notified().await;
        }
    }

    /// One attempt: hand out an idle connection, create one when below
    /// the limit, or report that the caller has to wait.
    async fn acquire_step(self: &Arc<Self>) -> CacheResult<Option<PooledConnection>> {
        let reserved = {
            let mut state = self.state.lock().unwrap();
            if let Some((id, conn)) = state.checkout_idle() {
                return Ok(Some(PooledConnection::new(self.clone(), id, conn)));
            }
            if self.max_connections.map_or(true, |max| state.total < max) {
                Some(state.reserve())
            } else {
                None
            }
        };
        let Some(id) = reserved else {
            return Ok(None);
        };
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                self.state.lock().unwrap().register(id);
                Ok(Some(PooledConnection::new(self.clone(), id, conn)))
            }
            Err(err) => {
                self.state.lock().unwrap().abandon();
                self.available.notify_one();
                Err(err.into())
            }
        }
    }

    pub(crate) fn release_parts(&self, id: u64, conn: MultiplexedConnection) {
        let released = self.state.lock().unwrap().release(id, conn);
        if released {
            self.available.notify_one();
        }
    }

    /// Creates a connection outside the idle/in-use accounting. With a
    /// push sender the connection is opened through the RESP3 client so
    /// the server can deliver out-of-band frames on it.
    pub(crate) async fn create_pinned_connection(
        &self,
        push_sender: Option<UnboundedSender<PushInfo>>,
    ) -> CacheResult<MultiplexedConnection> {
        let conn = match push_sender {
            Some(sender) => {
                let config = AsyncConnectionConfig::new().set_push_sender(sender);
                self.push_client
                    .get_multiplexed_async_connection_with_config(&config)
                    .await?
            }
            None => self.client.get_multiplexed_async_connection().await?,
        };
        Ok(conn)
    }

    /// Drops all idle connections. Connections currently checked out are
    /// unaffected and will rejoin the pool on release.
    pub fn disconnect(&self) {
        let dropped = self.state.lock().unwrap().drop_idle();
        if dropped > 0 {
            log::debug!("dropped {dropped} idle pool connection(s)");
        }
    }

    /// Number of idle plus in-use connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().total
    }
}

/// A connection checked out of the pool; returned on drop. Release is
/// idempotent: once the guard has given its connection back, nothing
/// further happens.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    id: u64,
    conn: Option<MultiplexedConnection>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, id: u64, conn: MultiplexedConnection) -> Self {
        PooledConnection {
            pool,
            id,
            conn: Some(conn),
        }
    }

    /// Returns the connection to the pool explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_parts(self.id, conn);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &MultiplexedConnection {
        self.conn.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut MultiplexedConnection {
        self.conn.as_mut().expect("connection already released")
    }
}

/// The dedicated tracking connection and its release flag.
///
/// While the flag is down the connection belongs to the invalidation
/// listener and must not be reclaimed by anyone else; only the listener
/// raises the flag again during teardown.
pub(crate) struct TrackedConnection {
    conn: MultiplexedConnection,
    can_be_released: bool,
}

/// Shared slot holding the tracked connection, if any.
pub(crate) struct TrackingSlot {
    slot: tokio::sync::Mutex<Option<TrackedConnection>>,
}

impl TrackingSlot {
    pub(crate) fn new() -> Arc<TrackingSlot> {
        Arc::new(TrackingSlot {
            slot: tokio::sync::Mutex::new(None),
        })
    }

    pub(crate) async fn install(&self, conn: MultiplexedConnection) {
        *self.slot.lock().await = Some(TrackedConnection {
            conn,
            can_be_released: false,
        });
    }

    /// Opportunistically locks the slot for issuing commands over the
    /// tracked connection. `None` when the slot is busy or empty; callers
    /// fall back to an ordinary pool connection.
    pub(crate) fn try_lock_for_commands(
        &self,
    ) -> Option<tokio::sync::MutexGuard<'_, Option<TrackedConnection>>> {
        let guard = self.slot.try_lock().ok()?;
        if guard.as_ref().is_some_and(|t| !t.can_be_released) {
            Some(guard)
        } else {
            None
        }
    }

    /// Borrows the connection out of a held guard. Reaching the error
    /// here means the caller did not actually hold a live tracked
    /// connection, which is a bug in this crate, not a user error.
    pub(crate) fn connection<'a>(
        guard: &'a mut tokio::sync::MutexGuard<'_, Option<TrackedConnection>>,
    ) -> CacheResult<&'a mut MultiplexedConnection> {
        match guard.as_mut() {
            Some(tracked) if !tracked.can_be_released => Ok(&mut tracked.conn),
            _ => Err(CacheError::TrackingUnavailable),
        }
    }

    /// Teardown path reserved to the invalidation listener: raises the
    /// release flag and takes the connection out of the slot.
    pub(crate) async fn release_by_listener(&self) -> Option<MultiplexedConnection> {
        let mut guard = self.slot.lock().await;
        if let Some(tracked) = guard.as_mut() {
            tracked.can_be_released = true;
        }
        guard.take().map(|tracked| tracked.conn)
    }
}
