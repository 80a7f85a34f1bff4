//! The caching proxy: the read/write API of the crate.
//!
//! Reads are served from the local cache whenever it is connected, with a
//! single fill round-trip on a miss that also fetches every registered
//! prefetch key that is not cached yet. Writes go to the server first —
//! preferably over the tracked connection, whose NOLOOP flag keeps our
//! own writes from invalidating the update we are about to apply — and
//! then speculatively edit the cached representation under the same
//! cache-lock acquisition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::{
    from_owned_redis_value, Client, Cmd, ErrorKind, FromRedisValue, IntoConnectionInfo,
    ProtocolVersion, RedisError, ToRedisArgs, Value,
};
use tokio::sync::MutexGuard;

use crate::cache::{CacheState, LocalCache, Prefetchable};
use crate::errors::{CacheError, CacheResult};
use crate::listener::InvalidationListener;
use crate::pipeline::{arg_list, single_arg, CachingPipeline};
use crate::pool::{ConnectionPool, TrackingSlot};
use crate::rotation::{RotatingPipeline, RotationLimits};
use crate::value::{format_score, glob_match, range_window, CacheKind, CachedValue};

/// Construction-time settings for a [`CachingProxy`]. All knobs default
/// to unlimited/disabled.
#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
    pub(crate) max_connections: Option<usize>,
    pub(crate) acquire_timeout: Option<Duration>,
}

impl ProxyConfig {
    /// Creates a config with every limit disabled.
    pub fn new() -> ProxyConfig {
        ProxyConfig::default()
    }

    /// Bounds the connection pool.
    pub fn set_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    /// Bounds how long an acquire may wait for a pool slot before failing
    /// with [`CacheError::PoolExhausted`].
    pub fn set_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// A proxy to one Redis database with client-side caching and pipelining.
///
/// Without [`connect`](CachingProxy::connect), or after
/// [`disconnect`](CachingProxy::disconnect), every operation is an
/// ordinary round-trip. While the invalidation listener runs, reads of
/// cached keys are local; if the listener dies underneath a connected
/// proxy, cached operations fail with [`CacheError::NotConnected`] until
/// `connect` is called again — stale data is never served silently.
pub struct CachingProxy {
    pool: Arc<ConnectionPool>,
    cache: Arc<LocalCache>,
    tracking: Arc<TrackingSlot>,
    listener: tokio::sync::Mutex<Option<InvalidationListener>>,
    caching_requested: AtomicBool,
}

fn wrong_type() -> CacheError {
    CacheError::Redis(RedisError::from((
        ErrorKind::TypeError,
        "WRONGTYPE",
        "Operation against a key holding the wrong kind of value".to_string(),
    )))
}

fn unexpected_fill_reply() -> CacheError {
    CacheError::Redis(RedisError::from((
        ErrorKind::ResponseError,
        "unexpected reply shape during cache fill",
    )))
}

impl CachingProxy {
    /// Creates a proxy for the given connection parameters. No connection
    /// is made until the first command; caching stays off until
    /// [`connect`](CachingProxy::connect).
    pub fn open<T: IntoConnectionInfo>(params: T, config: ProxyConfig) -> CacheResult<CachingProxy> {
        let info = params.into_connection_info()?;
        // The subscription socket needs RESP3 for out-of-band frames; the
        // rest of the pool keeps the caller's protocol.
        let mut push_info = info.clone();
        push_info.redis.protocol = ProtocolVersion::RESP3;
        let client = Client::open(info)?;
        let push_client = Client::open(push_info)?;
        let pool = ConnectionPool::new(
            client,
            push_client,
            config.max_connections,
            config.acquire_timeout,
        );
        Ok(CachingProxy {
            pool,
            cache: LocalCache::new(),
            tracking: TrackingSlot::new(),
            listener: tokio::sync::Mutex::new(None),
            caching_requested: AtomicBool::new(false),
        })
    }

    /// Starts the invalidation listener and enables the cached path.
    /// Blocks until the listener's startup handshake completes; on
    /// timeout or handshake failure the error is returned and anything
    /// partially started is torn down.
    pub async fn connect(&self, timeout: Duration) -> CacheResult<()> {
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            if self.cache.lock().await.is_connected() {
                self.caching_requested.store(true, Ordering::SeqCst);
                return Ok(());
            }
            // The previous listener died; reap it before restarting.
            if let Some(old) = slot.take() {
                old.stop(Duration::from_secs(1)).await;
            }
        }
        let listener = InvalidationListener::start(
            self.pool.clone(),
            self.cache.clone(),
            self.tracking.clone(),
            timeout,
        )
        .await?;
        *slot = Some(listener);
        self.caching_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the invalidation listener and drops back to plain
    /// round-trip behavior. The cache is emptied; nothing else is lost.
    pub async fn disconnect(&self, timeout: Duration) {
        self.caching_requested.store(false, Ordering::SeqCst);
        let mut slot = self.listener.lock().await;
        if let Some(listener) = slot.take() {
            listener.stop(timeout).await;
        }
    }

    /// Disconnects and drops the idle pool connections.
    pub async fn close(&self) {
        self.disconnect(Duration::from_secs(5)).await;
        self.pool.disconnect();
    }

    /// The pool this proxy draws its connections from.
    pub fn connection_pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    /// Obtains a fresh pipeline bound to this proxy's pool and cache.
    pub fn pipeline(&self) -> CachingPipeline {
        CachingPipeline::new(self.pool.clone(), self.cache.clone())
    }

    /// Obtains a self-rotating pipeline flushed in the background under
    /// the given limits.
    pub fn rotating_pipeline(&self, limits: RotationLimits) -> RotatingPipeline {
        RotatingPipeline::new(self.pool.clone(), self.cache.clone(), limits)
    }

    /// True when caching was requested and the listener is running.
    pub async fn caching_active(&self) -> bool {
        self.caching_requested() && self.cache.lock().await.is_connected()
    }

    /// Turns the proxy into a plain client: the cached path is skipped
    /// and all prefetch registrations are dropped. The listener, if
    /// running, keeps the cache warm for other users of the same cache;
    /// stop it with [`disconnect`](CachingProxy::disconnect).
    pub async fn disable_caching(&self) {
        self.caching_requested.store(false, Ordering::SeqCst);
        self.cache.lock().await.prefetch.clear();
    }

    fn caching_requested(&self) -> bool {
        self.caching_requested.load(Ordering::SeqCst)
    }

    // ---------- prefetch registrations ----------

    /// Registers objects whose keys are fetched along with any cache
    /// miss. Registrations are weak: dropping the object unregisters it
    /// without network traffic.
    pub async fn add_prefetch(&self, objects: &[Arc<dyn Prefetchable>]) {
        let mut state = self.cache.lock().await;
        for object in objects {
            state.prefetch.add(object);
        }
    }

    /// Unregisters objects and drops their cached entries, without
    /// touching the network.
    pub async fn remove_prefetch(&self, objects: &[Arc<dyn Prefetchable>]) {
        let mut state = self.cache.lock().await;
        for object in objects {
            if let Some(key) = state.prefetch.remove(object) {
                state.invalidate(&key);
            }
        }
    }

    /// Drops every prefetch registration.
    pub async fn clear_prefetch(&self) {
        self.cache.lock().await.prefetch.clear();
    }

    /// Number of live prefetch registrations.
    pub async fn ncached(&self) -> usize {
        self.cache.lock().await.prefetch.len()
    }

    // ---------- plumbing ----------

    async fn lock_connected(&self) -> CacheResult<MutexGuard<'_, CacheState>> {
        let state = self.cache.lock().await;
        if state.is_connected() {
            Ok(state)
        } else {
            Err(CacheError::NotConnected)
        }
    }

    /// Runs a command over an ordinary pool connection.
    async fn direct_cmd<T: FromRedisValue>(&self, cmd: &Cmd) -> CacheResult<T> {
        let mut conn = self.pool.acquire().await?;
        Ok(cmd.query_async(&mut *conn).await?)
    }

    /// Runs a write over the tracked connection when it is free (NOLOOP
    /// then suppresses the self-invalidation), over the pool otherwise.
    /// Never blocks on the tracking lock.
    async fn write_cmd<T: FromRedisValue>(&self, cmd: &Cmd) -> CacheResult<T> {
        if let Some(mut guard) = self.tracking.try_lock_for_commands() {
            let conn = TrackingSlot::connection(&mut guard)?;
            return Ok(cmd.query_async(conn).await?);
        }
        self.direct_cmd(cmd).await
    }

    /// Returns the cached entry for `key`, filling the cache (together
    /// with any uncached prefetch keys) in one round-trip when absent.
    /// Runs under the cache lock held by the caller.
    async fn cached_entry<'a>(
        &self,
        state: &'a mut CacheState,
        key: &[u8],
        kind: CacheKind,
    ) -> CacheResult<&'a CachedValue> {
        if !state.contains(key)? {
            self.fill_cache(state, key, kind).await?;
        }
        state.entry(key)?.ok_or_else(unexpected_fill_reply)
    }

    async fn fill_cache(
        &self,
        state: &mut CacheState,
        key: &[u8],
        kind: CacheKind,
    ) -> CacheResult<()> {
        let mut targets: Vec<(Vec<u8>, CacheKind)> = vec![(key.to_vec(), kind)];
        for (prefetch_key, prefetch_kind) in state.prefetch.live_keys() {
            if prefetch_key != key && !state.contains(&prefetch_key)? {
                targets.push((prefetch_key, prefetch_kind));
            }
        }

        let mut pipe = redis::Pipeline::with_capacity(targets.len());
        for (target_key, target_kind) in &targets {
            match target_kind {
                CacheKind::Scalar => pipe.cmd("GET").arg(target_key),
                CacheKind::Hash => pipe.cmd("HGETALL").arg(target_key),
                CacheKind::List => pipe.cmd("LRANGE").arg(target_key).arg(0).arg(-1),
                CacheKind::SortedSet => pipe
                    .cmd("ZRANGE")
                    .arg(target_key)
                    .arg(0)
                    .arg(-1)
                    .arg("WITHSCORES"),
            };
        }
        let replies: Vec<Value> = {
            let mut conn = self.pool.acquire().await?;
            pipe.query_async(&mut *conn).await?
        };

        for ((target_key, target_kind), reply) in targets.into_iter().zip(replies) {
            let value =
                CachedValue::from_fetched(target_kind, reply).ok_or_else(unexpected_fill_reply)?;
            state.insert(target_key, value)?;
        }
        Ok(())
    }

    // ---------- scalar commands ----------

    /// `GET key`. A key the server does not have is cached as absent, so
    /// repeating the read stays local.
    pub async fn get<K: ToRedisArgs, RV: FromRedisValue>(&self, key: K) -> CacheResult<RV> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(&key);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::Scalar).await?;
        let value = match entry {
            CachedValue::Scalar(Some(data)) => Value::BulkString(data.clone()),
            CachedValue::Scalar(None) => Value::Nil,
            _ => return Err(wrong_type()),
        };
        drop(state);
        Ok(from_owned_redis_value(value)?)
    }

    /// `SET key value`, with the cached copy updated speculatively.
    pub async fn set<K: ToRedisArgs, V: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        value: V,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(&value);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let (key, value) = (single_arg(&key), single_arg(&value));
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        state.insert(key, CachedValue::Scalar(Some(value)))?;
        Ok(reply)
    }

    /// `DEL key`.
    pub async fn delete<K: ToRedisArgs, RV: FromRedisValue>(&self, key: K) -> CacheResult<RV> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(&key);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        state.invalidate(&key);
        Ok(reply)
    }

    /// `EVALSHA sha numkeys key [key ...] arg [arg ...]`. The named keys
    /// are dropped from the cache after the script ran; their new values
    /// are refetched on the next read.
    pub async fn evalsha<K: ToRedisArgs, A: ToRedisArgs, RV: FromRedisValue>(
        &self,
        sha: &str,
        keys: &[K],
        args: &[A],
    ) -> CacheResult<RV> {
        let key_bytes = arg_list(keys);
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(key_bytes.len());
        for key in &key_bytes {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        for key in &key_bytes {
            state.invalidate(key);
        }
        Ok(reply)
    }

    // ---------- hash commands ----------

    /// `HGET key field`.
    pub async fn hget<K: ToRedisArgs, F: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        field: F,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(&key).arg(&field);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let (key, field) = (single_arg(&key), single_arg(&field));
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::Hash).await?;
        let map = entry.as_hash().ok_or_else(wrong_type)?;
        let value = match map.get(&field) {
            Some(data) => Value::BulkString(data.clone()),
            None => Value::Nil,
        };
        drop(state);
        Ok(from_owned_redis_value(value)?)
    }

    /// `HGETALL key`.
    pub async fn hgetall<K: ToRedisArgs, RV: FromRedisValue>(&self, key: K) -> CacheResult<RV> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(&key);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::Hash).await?;
        let map = entry.as_hash().ok_or_else(wrong_type)?;
        let mut items = Vec::with_capacity(map.len() * 2);
        for (field, value) in map {
            items.push(Value::BulkString(field.clone()));
            items.push(Value::BulkString(value.clone()));
        }
        drop(state);
        Ok(from_owned_redis_value(Value::Array(items))?)
    }

    /// `HEXISTS key field`.
    pub async fn hexists<K: ToRedisArgs, F: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        field: F,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("HEXISTS");
        cmd.arg(&key).arg(&field);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let (key, field) = (single_arg(&key), single_arg(&field));
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::Hash).await?;
        let map = entry.as_hash().ok_or_else(wrong_type)?;
        let exists = map.contains_key(&field);
        drop(state);
        Ok(from_owned_redis_value(Value::Int(exists as i64))?)
    }

    /// `HLEN key`.
    pub async fn hlen<K: ToRedisArgs, RV: FromRedisValue>(&self, key: K) -> CacheResult<RV> {
        let mut cmd = redis::cmd("HLEN");
        cmd.arg(&key);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::Hash).await?;
        let len = entry.as_hash().ok_or_else(wrong_type)?.len();
        drop(state);
        Ok(from_owned_redis_value(Value::Int(len as i64))?)
    }

    /// `HSET key field value`.
    pub async fn hset<K: ToRedisArgs, F: ToRedisArgs, V: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        field: F,
        value: V,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key).arg(&field).arg(&value);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let (key, field, value) = (single_arg(&key), single_arg(&field), single_arg(&value));
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        let mut kind_mismatch = false;
        if let Some(entry) = state.entry_mut(&key)? {
            match entry.as_hash_mut() {
                Some(map) => {
                    map.insert(field, value);
                }
                None => kind_mismatch = true,
            }
        }
        if kind_mismatch {
            state.invalidate(&key);
        }
        Ok(reply)
    }

    /// `HSET key field value [field value ...]`.
    pub async fn hset_multiple<K, F, V, RV>(&self, key: K, items: &[(F, V)]) -> CacheResult<RV>
    where
        K: ToRedisArgs,
        F: ToRedisArgs,
        V: ToRedisArgs,
        RV: FromRedisValue,
    {
        let key_bytes = single_arg(&key);
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = items
            .iter()
            .map(|(field, value)| (single_arg(field), single_arg(value)))
            .collect();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key_bytes);
        for (field, value) in &pairs {
            cmd.arg(field).arg(value);
        }
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        let mut kind_mismatch = false;
        if let Some(entry) = state.entry_mut(&key_bytes)? {
            match entry.as_hash_mut() {
                Some(map) => map.extend(pairs),
                None => kind_mismatch = true,
            }
        }
        if kind_mismatch {
            state.invalidate(&key_bytes);
        }
        Ok(reply)
    }

    /// `HDEL key field [field ...]`.
    pub async fn hdel<K: ToRedisArgs, F: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        fields: &[F],
    ) -> CacheResult<RV> {
        let key_bytes = single_arg(&key);
        let field_bytes = arg_list(fields);
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(&key_bytes);
        for field in &field_bytes {
            cmd.arg(field);
        }
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        let mut kind_mismatch = false;
        if let Some(entry) = state.entry_mut(&key_bytes)? {
            match entry.as_hash_mut() {
                Some(map) => {
                    for field in &field_bytes {
                        map.remove(field);
                    }
                }
                None => kind_mismatch = true,
            }
        }
        if kind_mismatch {
            state.invalidate(&key_bytes);
        }
        Ok(reply)
    }

    /// `HSCAN key cursor [MATCH pattern] [COUNT count]`.
    ///
    /// Served from the cached hash: without a count (or with a count
    /// covering the whole hash) the filtered entries come back in one
    /// page; otherwise pages walk the fields in sorted order so a cursor
    /// stays meaningful between calls.
    pub async fn hscan<K: ToRedisArgs>(
        &self,
        key: K,
        cursor: u64,
        pattern: Option<&str>,
        count: Option<usize>,
    ) -> CacheResult<(u64, HashMap<Vec<u8>, Vec<u8>>)> {
        let mut cmd = redis::cmd("HSCAN");
        cmd.arg(&key).arg(cursor);
        if let Some(pattern) = pattern {
            cmd.arg("MATCH").arg(pattern);
        }
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::Hash).await?;
        let map = entry.as_hash().ok_or_else(wrong_type)?;

        let matches = |field: &[u8]| match pattern {
            Some(pattern) => glob_match(pattern.as_bytes(), field),
            None => true,
        };

        let result = match count {
            None => (
                0,
                map.iter()
                    .filter(|(field, _)| matches(field))
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect(),
            ),
            Some(count) if count >= map.len() => (
                0,
                map.iter()
                    .filter(|(field, _)| matches(field))
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect(),
            ),
            Some(count) => {
                let mut fields: Vec<&Vec<u8>> = map.keys().collect();
                fields.sort();
                let mut page = HashMap::new();
                let mut index = cursor as usize;
                let mut remaining = count;
                while remaining > 0 {
                    let Some(field) = fields.get(index) else {
                        index = 0;
                        break;
                    };
                    index += 1;
                    if matches(field) {
                        page.insert((*field).clone(), map[*field].clone());
                        remaining -= 1;
                    }
                }
                if index >= fields.len() {
                    index = 0;
                }
                (index as u64, page)
            }
        };
        Ok(result)
    }

    // ---------- list commands ----------

    /// `LINDEX key index`.
    pub async fn lindex<K: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        index: isize,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("LINDEX");
        cmd.arg(&key).arg(index);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::List).await?;
        let list = entry.as_list().ok_or_else(wrong_type)?;
        let position = if index < 0 {
            list.len().checked_sub(index.unsigned_abs())
        } else {
            Some(index as usize)
        };
        let value = match position.and_then(|i| list.get(i)) {
            Some(data) => Value::BulkString(data.clone()),
            None => Value::Nil,
        };
        drop(state);
        Ok(from_owned_redis_value(value)?)
    }

    /// `LLEN key`.
    pub async fn llen<K: ToRedisArgs, RV: FromRedisValue>(&self, key: K) -> CacheResult<RV> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(&key);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::List).await?;
        let len = entry.as_list().ok_or_else(wrong_type)?.len();
        drop(state);
        Ok(from_owned_redis_value(Value::Int(len as i64))?)
    }

    /// `LRANGE key start stop`.
    pub async fn lrange<K: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        start: isize,
        stop: isize,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(&key).arg(start).arg(stop);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self.cached_entry(&mut state, &key, CacheKind::List).await?;
        let list = entry.as_list().ok_or_else(wrong_type)?;
        let (from, to) = range_window(list.len(), start, stop);
        let items = list[from..to]
            .iter()
            .map(|data| Value::BulkString(data.clone()))
            .collect();
        drop(state);
        Ok(from_owned_redis_value(Value::Array(items))?)
    }

    /// `LPUSH key value [value ...]`.
    pub async fn lpush<K: ToRedisArgs, V: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        values: &[V],
    ) -> CacheResult<RV> {
        let key_bytes = single_arg(&key);
        let value_bytes = arg_list(values);
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(&key_bytes);
        for value in &value_bytes {
            cmd.arg(value);
        }
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        let mut kind_mismatch = false;
        if let Some(entry) = state.entry_mut(&key_bytes)? {
            match entry.as_list_mut() {
                Some(list) => {
                    for value in value_bytes {
                        list.insert(0, value);
                    }
                }
                None => kind_mismatch = true,
            }
        }
        if kind_mismatch {
            state.invalidate(&key_bytes);
        }
        Ok(reply)
    }

    /// `RPUSH key value [value ...]`.
    pub async fn rpush<K: ToRedisArgs, V: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        values: &[V],
    ) -> CacheResult<RV> {
        let key_bytes = single_arg(&key);
        let value_bytes = arg_list(values);
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(&key_bytes);
        for value in &value_bytes {
            cmd.arg(value);
        }
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let mut state = self.lock_connected().await?;
        let reply: RV = self.write_cmd(&cmd).await?;
        let mut kind_mismatch = false;
        if let Some(entry) = state.entry_mut(&key_bytes)? {
            match entry.as_list_mut() {
                Some(list) => list.extend(value_bytes),
                None => kind_mismatch = true,
            }
        }
        if kind_mismatch {
            state.invalidate(&key_bytes);
        }
        Ok(reply)
    }

    /// `LPOP key`. The cached head is dropped only when it matches the
    /// value the server actually popped.
    pub async fn lpop<K: ToRedisArgs, RV: FromRedisValue>(&self, key: K) -> CacheResult<RV> {
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(&key);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let reply: Value = self.write_cmd(&cmd).await?;
        if let Some(entry) = state.entry_mut(&key)? {
            if let Some(list) = entry.as_list_mut() {
                if let Value::BulkString(popped) = &reply {
                    if list.first() == Some(popped) {
                        list.remove(0);
                    }
                }
            }
        }
        drop(state);
        Ok(from_owned_redis_value(reply)?)
    }

    /// `RPOP key`.
    pub async fn rpop<K: ToRedisArgs, RV: FromRedisValue>(&self, key: K) -> CacheResult<RV> {
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(&key);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let reply: Value = self.write_cmd(&cmd).await?;
        if let Some(entry) = state.entry_mut(&key)? {
            if let Some(list) = entry.as_list_mut() {
                if let Value::BulkString(popped) = &reply {
                    if list.last() == Some(popped) {
                        list.pop();
                    }
                }
            }
        }
        drop(state);
        Ok(from_owned_redis_value(reply)?)
    }

    /// `LREM key count value`. With a non-negative count the removals are
    /// replayed on the cached list; a negative count removes from the
    /// tail, which cannot be replayed, so the entry is dropped and
    /// refetched on the next read.
    pub async fn lrem<K: ToRedisArgs, V: ToRedisArgs>(
        &self,
        key: K,
        count: isize,
        value: V,
    ) -> CacheResult<i64> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(&key).arg(count).arg(&value);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let (key, value) = (single_arg(&key), single_arg(&value));
        let mut state = self.lock_connected().await?;
        let removed: i64 = self.write_cmd(&cmd).await?;
        if count >= 0 {
            if let Some(entry) = state.entry_mut(&key)? {
                if let Some(list) = entry.as_list_mut() {
                    let mut remaining = removed;
                    list.retain(|item| {
                        if remaining > 0 && *item == value {
                            remaining -= 1;
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        } else {
            state.invalidate(&key);
        }
        Ok(removed)
    }

    // ---------- sorted-set commands ----------

    /// `ZRANGE key start stop`.
    pub async fn zrange<K: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        start: isize,
        stop: isize,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(&key).arg(start).arg(stop);
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self
            .cached_entry(&mut state, &key, CacheKind::SortedSet)
            .await?;
        let members = entry.as_sorted_set().ok_or_else(wrong_type)?;
        let (from, to) = range_window(members.len(), start, stop);
        let items = members[from..to]
            .iter()
            .map(|(member, _)| Value::BulkString(member.clone()))
            .collect();
        drop(state);
        Ok(from_owned_redis_value(Value::Array(items))?)
    }

    /// `ZRANGE key start stop WITHSCORES`.
    pub async fn zrange_withscores<K: ToRedisArgs, RV: FromRedisValue>(
        &self,
        key: K,
        start: isize,
        stop: isize,
    ) -> CacheResult<RV> {
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(&key).arg(start).arg(stop).arg("WITHSCORES");
        if !self.caching_requested() {
            return self.direct_cmd(&cmd).await;
        }
        let key = single_arg(&key);
        let mut state = self.lock_connected().await?;
        let entry = self
            .cached_entry(&mut state, &key, CacheKind::SortedSet)
            .await?;
        let members = entry.as_sorted_set().ok_or_else(wrong_type)?;
        let (from, to) = range_window(members.len(), start, stop);
        let mut items = Vec::with_capacity((to - from) * 2);
        for (member, score) in &members[from..to] {
            items.push(Value::BulkString(member.clone()));
            items.push(Value::BulkString(format_score(*score)));
        }
        drop(state);
        Ok(from_owned_redis_value(Value::Array(items))?)
    }
}
