//! Buffered command execution with deferred cache mutation.
//!
//! Every write-style call appends the command to a network buffer *and*
//! records a thunk describing the matching cache edit. Nothing touches
//! the cache until [`CachingPipeline::execute`] has received the replies
//! for the whole batch; the thunks then run in issue order under a single
//! cache-lock acquisition, so a concurrent reader sees either none or all
//! of the batch. [`CachingPipeline::reset`] discards the buffer with no
//! network or cache effect.

use std::collections::HashMap;
use std::sync::Arc;

use redis::{Cmd, ToRedisArgs, Value};

use crate::cache::{CacheState, LocalCache};
use crate::errors::CacheResult;
use crate::pool::ConnectionPool;
use crate::value::CachedValue;

/// A deferred cache edit, replayed only after the network round-trip for
/// its batch has succeeded.
pub(crate) enum CacheThunk {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    HSet { key: Vec<u8>, field: Vec<u8>, value: Vec<u8> },
    HSetMultiple { key: Vec<u8>, pairs: Vec<(Vec<u8>, Vec<u8>)> },
    HDel { key: Vec<u8>, fields: Vec<Vec<u8>> },
    LPush { key: Vec<u8>, values: Vec<Vec<u8>> },
    RPush { key: Vec<u8>, values: Vec<Vec<u8>> },
    PopFront { key: Vec<u8> },
    PopBack { key: Vec<u8> },
    /// Used where the edit cannot be replayed locally (`LREM` with a
    /// negative count, script side effects): force a refetch instead.
    Invalidate { key: Vec<u8> },
}

impl CacheThunk {
    /// Applies the edit. A key that is not cached is left alone (it will
    /// be lazily filled on the next read), except for `SET`, whose new
    /// value is the complete representation and can be inserted outright.
    pub(crate) fn apply(self, state: &mut CacheState) {
        match self {
            CacheThunk::Set { key, value } => {
                let _ = state.insert(key, CachedValue::Scalar(Some(value)));
            }
            CacheThunk::Delete { key } => state.invalidate(&key),
            CacheThunk::HSet { key, field, value } => {
                if let Ok(Some(entry)) = state.entry_mut(&key) {
                    if let Some(map) = entry.as_hash_mut() {
                        map.insert(field, value);
                    }
                }
            }
            CacheThunk::HSetMultiple { key, pairs } => {
                if let Ok(Some(entry)) = state.entry_mut(&key) {
                    if let Some(map) = entry.as_hash_mut() {
                        map.extend(pairs);
                    }
                }
            }
            CacheThunk::HDel { key, fields } => {
                if let Ok(Some(entry)) = state.entry_mut(&key) {
                    if let Some(map) = entry.as_hash_mut() {
                        for field in &fields {
                            map.remove(field);
                        }
                    }
                }
            }
            CacheThunk::LPush { key, values } => {
                if let Ok(Some(entry)) = state.entry_mut(&key) {
                    if let Some(list) = entry.as_list_mut() {
                        for value in values {
                            list.insert(0, value);
                        }
                    }
                }
            }
            CacheThunk::RPush { key, values } => {
                if let Ok(Some(entry)) = state.entry_mut(&key) {
                    if let Some(list) = entry.as_list_mut() {
                        list.extend(values);
                    }
                }
            }
            CacheThunk::PopFront { key } => {
                if let Ok(Some(entry)) = state.entry_mut(&key) {
                    if let Some(list) = entry.as_list_mut() {
                        if !list.is_empty() {
                            list.remove(0);
                        }
                    }
                }
            }
            CacheThunk::PopBack { key } => {
                if let Ok(Some(entry)) = state.entry_mut(&key) {
                    if let Some(list) = entry.as_list_mut() {
                        list.pop();
                    }
                }
            }
            CacheThunk::Invalidate { key } => state.invalidate(&key),
        }
    }
}

pub(crate) fn single_arg<A: ToRedisArgs>(arg: &A) -> Vec<u8> {
    let mut tokens = arg.to_redis_args();
    debug_assert_eq!(tokens.len(), 1, "cacheable arguments are single tokens");
    tokens.pop().unwrap_or_default()
}

pub(crate) fn arg_list<A: ToRedisArgs>(args: &[A]) -> Vec<Vec<u8>> {
    args.iter().map(single_arg).collect()
}

/// A batch of commands bound to the proxy's pool and cache.
///
/// Created by `CachingProxy::pipeline`; destroyed by
/// [`execute`](CachingPipeline::execute) or
/// [`reset`](CachingPipeline::reset).
pub struct CachingPipeline {
    pool: Arc<ConnectionPool>,
    cache: Arc<LocalCache>,
    pipe: redis::Pipeline,
    commands: usize,
    thunks: Vec<CacheThunk>,
    callbacks: Vec<Box<dyn FnOnce() + Send + 'static>>,
    buffered_bytes: usize,
    stream_events: HashMap<Vec<u8>, usize>,
}

impl CachingPipeline {
    pub(crate) fn new(pool: Arc<ConnectionPool>, cache: Arc<LocalCache>) -> CachingPipeline {
        CachingPipeline {
            pool,
            cache,
            pipe: redis::Pipeline::new(),
            commands: 0,
            thunks: Vec::new(),
            callbacks: Vec::new(),
            buffered_bytes: 0,
            stream_events: HashMap::new(),
        }
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.commands
    }

    /// True if no command has been buffered.
    pub fn is_empty(&self) -> bool {
        self.commands == 0
    }

    /// Wire size estimate of the buffered commands.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Highest number of buffered events on any single stream.
    pub(crate) fn max_events_per_stream(&self) -> usize {
        self.stream_events.values().copied().max().unwrap_or(0)
    }

    fn push(&mut self, cmd: Cmd, thunk: Option<CacheThunk>) {
        self.buffered_bytes += cmd.get_packed_command().len();
        self.pipe.add_command(cmd);
        self.commands += 1;
        if let Some(thunk) = thunk {
            self.thunks.push(thunk);
        }
    }

    /// Buffers a raw command without any cache interaction. Commands that
    /// write cached keys should go through the dedicated methods so the
    /// cache edit is recorded with them.
    pub fn add_command(&mut self, cmd: Cmd) -> &mut Self {
        self.push(cmd, None);
        self
    }

    /// Buffers `SET key value`.
    pub fn set<K: ToRedisArgs, V: ToRedisArgs>(&mut self, key: K, value: V) -> &mut Self {
        let (key, value) = (single_arg(&key), single_arg(&value));
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(&value);
        self.push(cmd, Some(CacheThunk::Set { key, value }));
        self
    }

    /// Buffers `DEL key`.
    pub fn del<K: ToRedisArgs>(&mut self, key: K) -> &mut Self {
        let key = single_arg(&key);
        let mut cmd = redis::cmd("DEL");
        cmd.arg(&key);
        self.push(cmd, Some(CacheThunk::Delete { key }));
        self
    }

    /// Buffers `HSET key field value`.
    pub fn hset<K: ToRedisArgs, F: ToRedisArgs, V: ToRedisArgs>(
        &mut self,
        key: K,
        field: F,
        value: V,
    ) -> &mut Self {
        let (key, field, value) = (single_arg(&key), single_arg(&field), single_arg(&value));
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key).arg(&field).arg(&value);
        self.push(cmd, Some(CacheThunk::HSet { key, field, value }));
        self
    }

    /// Buffers `HSET key field value [field value ...]`.
    pub fn hset_multiple<K: ToRedisArgs, F: ToRedisArgs, V: ToRedisArgs>(
        &mut self,
        key: K,
        items: &[(F, V)],
    ) -> &mut Self {
        let key = single_arg(&key);
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = items
            .iter()
            .map(|(field, value)| (single_arg(field), single_arg(value)))
            .collect();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key);
        for (field, value) in &pairs {
            cmd.arg(field).arg(value);
        }
        self.push(cmd, Some(CacheThunk::HSetMultiple { key, pairs }));
        self
    }

    /// Buffers `HDEL key field [field ...]`.
    pub fn hdel<K: ToRedisArgs, F: ToRedisArgs>(&mut self, key: K, fields: &[F]) -> &mut Self {
        let key = single_arg(&key);
        let fields = arg_list(fields);
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(&key);
        for field in &fields {
            cmd.arg(field);
        }
        self.push(cmd, Some(CacheThunk::HDel { key, fields }));
        self
    }

    /// Buffers `LPUSH key value [value ...]`.
    pub fn lpush<K: ToRedisArgs, V: ToRedisArgs>(&mut self, key: K, values: &[V]) -> &mut Self {
        let key = single_arg(&key);
        let values = arg_list(values);
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(&key);
        for value in &values {
            cmd.arg(value);
        }
        self.push(cmd, Some(CacheThunk::LPush { key, values }));
        self
    }

    /// Buffers `RPUSH key value [value ...]`.
    pub fn rpush<K: ToRedisArgs, V: ToRedisArgs>(&mut self, key: K, values: &[V]) -> &mut Self {
        let key = single_arg(&key);
        let values = arg_list(values);
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(&key);
        for value in &values {
            cmd.arg(value);
        }
        self.push(cmd, Some(CacheThunk::RPush { key, values }));
        self
    }

    /// Buffers `LPOP key`. The deferred edit drops the cached head
    /// without inspecting the reply.
    pub fn lpop<K: ToRedisArgs>(&mut self, key: K) -> &mut Self {
        let key = single_arg(&key);
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(&key);
        self.push(cmd, Some(CacheThunk::PopFront { key }));
        self
    }

    /// Buffers `RPOP key`.
    pub fn rpop<K: ToRedisArgs>(&mut self, key: K) -> &mut Self {
        let key = single_arg(&key);
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(&key);
        self.push(cmd, Some(CacheThunk::PopBack { key }));
        self
    }

    /// Buffers `LREM key count value`. Removal order cannot be replayed
    /// locally, so the cached entry is dropped and refetched on the next
    /// read.
    pub fn lrem<K: ToRedisArgs, V: ToRedisArgs>(
        &mut self,
        key: K,
        count: isize,
        value: V,
    ) -> &mut Self {
        let key = single_arg(&key);
        let mut cmd = redis::cmd("LREM");
        cmd.arg(&key).arg(count).arg(single_arg(&value));
        self.push(cmd, Some(CacheThunk::Invalidate { key }));
        self
    }

    /// Buffers `XADD stream * field value [field value ...]` and counts
    /// the event against the stream for rotation accounting. Streams are
    /// never cached.
    pub fn xadd<K: ToRedisArgs, F: ToRedisArgs, V: ToRedisArgs>(
        &mut self,
        stream: K,
        items: &[(F, V)],
    ) -> &mut Self {
        let stream = single_arg(&stream);
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream).arg("*");
        for (field, value) in items {
            cmd.arg(single_arg(field)).arg(single_arg(value));
        }
        *self.stream_events.entry(stream).or_insert(0) += 1;
        self.push(cmd, None);
        self
    }

    /// Registers a callback to run after a successful `execute`, after
    /// the batch's cache edits have landed. Runs in registration order.
    pub fn add_execute_callback(&mut self, callback: impl FnOnce() + Send + 'static) -> &mut Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Sends the whole buffer as one batched request and waits for every
    /// reply. On success the deferred cache edits are applied in issue
    /// order as one atomic unit, then the callbacks run, and the
    /// per-command replies are returned. On failure nothing is applied.
    pub async fn execute(mut self) -> CacheResult<Vec<Value>> {
        if self.is_empty() {
            // Callbacks still honor their contract on an empty buffer.
            for callback in self.callbacks.drain(..) {
                callback();
            }
            return Ok(Vec::new());
        }
        let replies: Vec<Value> = {
            let mut conn = self.pool.acquire().await?;
            self.pipe.query_async(&mut *conn).await?
            // The pool connection is given back here, before the cache
            // lock is taken.
        };

        let mut state = self.cache.lock().await;
        if state.is_connected() {
            for thunk in self.thunks.drain(..) {
                thunk.apply(&mut state);
            }
        } else {
            self.thunks.clear();
        }
        drop(state);

        for callback in self.callbacks.drain(..) {
            callback();
        }
        Ok(replies)
    }

    /// Discards the buffer — commands, cache edits and callbacks alike —
    /// with no network or cache effect.
    pub fn reset(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;

    async fn connected_cache() -> Arc<LocalCache> {
        let cache = LocalCache::new();
        cache.lock().await.mark_connected();
        cache
    }

    #[tokio::test]
    async fn thunks_apply_in_issue_order() {
        let cache = connected_cache().await;
        let mut state = cache.lock().await;
        state
            .insert(b"l".to_vec(), CachedValue::List(vec![b"a".to_vec()]))
            .unwrap();

        let thunks = vec![
            CacheThunk::RPush {
                key: b"l".to_vec(),
                values: vec![b"b".to_vec()],
            },
            CacheThunk::PopFront { key: b"l".to_vec() },
        ];
        for thunk in thunks {
            thunk.apply(&mut state);
        }
        let entry = state.entry(b"l").unwrap().unwrap();
        assert_eq!(entry.as_list().unwrap(), &vec![b"b".to_vec()]);
    }

    #[tokio::test]
    async fn set_inserts_even_when_absent() {
        let cache = connected_cache().await;
        let mut state = cache.lock().await;
        CacheThunk::Set {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }
        .apply(&mut state);
        assert_eq!(
            state.entry(b"k").unwrap(),
            Some(&CachedValue::Scalar(Some(b"v".to_vec())))
        );
    }

    #[tokio::test]
    async fn partial_hash_edit_skips_uncached_keys() {
        let cache = connected_cache().await;
        let mut state = cache.lock().await;
        CacheThunk::HSet {
            key: b"h".to_vec(),
            field: b"f".to_vec(),
            value: b"v".to_vec(),
        }
        .apply(&mut state);
        // No partial hash may be fabricated from a write alone.
        assert!(state.entry(b"h").unwrap().is_none());
    }

    #[tokio::test]
    async fn lpush_matches_server_ordering() {
        let cache = connected_cache().await;
        let mut state = cache.lock().await;
        state
            .insert(b"l".to_vec(), CachedValue::List(Vec::new()))
            .unwrap();
        CacheThunk::LPush {
            key: b"l".to_vec(),
            values: vec![b"a".to_vec(), b"b".to_vec()],
        }
        .apply(&mut state);
        let entry = state.entry(b"l").unwrap().unwrap();
        // LPUSH l a b leaves the list as [b, a].
        assert_eq!(entry.as_list().unwrap(), &vec![b"b".to_vec(), b"a".to_vec()]);
    }
}
