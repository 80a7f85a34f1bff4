//! The local key cache and the prefetch registry.
//!
//! Both structures live behind one `tokio::sync::Mutex`: the fill path
//! holds the lock across its round-trip and a pipeline applies all of its
//! deferred mutations under a single acquisition, so readers either see
//! none or all of a batch.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, MutexGuard};

use crate::errors::{CacheError, CacheResult};
use crate::value::{CacheKind, CachedValue};

/// An object whose backing Redis key should be fetched eagerly whenever
/// the cache has to go to the server anyway.
///
/// Registrations are weakly held: dropping the last `Arc` to a registered
/// object removes it from consideration without any network traffic.
pub trait Prefetchable: Send + Sync + 'static {
    /// The Redis key this object lives under.
    fn cache_key(&self) -> &[u8];
    /// The value kind stored under [`Self::cache_key`].
    fn cache_kind(&self) -> CacheKind;
}

pub(crate) struct PrefetchEntry {
    target: Weak<dyn Prefetchable>,
    key: Vec<u8>,
    kind: CacheKind,
}

/// Registry of prefetch objects, keyed by the pointer identity of the
/// registered `Arc`.
#[derive(Default)]
pub(crate) struct PrefetchRegistry {
    entries: HashMap<usize, PrefetchEntry>,
}

fn token(object: &Arc<dyn Prefetchable>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl PrefetchRegistry {
    pub(crate) fn add(&mut self, object: &Arc<dyn Prefetchable>) {
        self.entries.insert(
            token(object),
            PrefetchEntry {
                target: Arc::downgrade(object),
                key: object.cache_key().to_vec(),
                kind: object.cache_kind(),
            },
        );
    }

    /// Removes a registration and returns the key it covered, if any.
    pub(crate) fn remove(&mut self, object: &Arc<dyn Prefetchable>) -> Option<Vec<u8>> {
        self.entries.remove(&token(object)).map(|entry| entry.key)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Prunes registrations whose object has been dropped and returns the
    /// (key, kind) pairs that are still alive.
    pub(crate) fn live_keys(&mut self) -> Vec<(Vec<u8>, CacheKind)> {
        self.entries
            .retain(|_, entry| entry.target.strong_count() > 0);
        self.entries
            .values()
            .map(|entry| (entry.key.clone(), entry.kind))
            .collect()
    }
}

/// State guarded by the cache lock.
pub(crate) struct CacheState {
    connected: bool,
    entries: HashMap<Vec<u8>, CachedValue>,
    pub(crate) prefetch: PrefetchRegistry,
}

impl CacheState {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    fn check_connected(&self) -> CacheResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(CacheError::NotConnected)
        }
    }

    pub(crate) fn entry(&self, key: &[u8]) -> CacheResult<Option<&CachedValue>> {
        self.check_connected()?;
        Ok(self.entries.get(key))
    }

    pub(crate) fn entry_mut(&mut self, key: &[u8]) -> CacheResult<Option<&mut CachedValue>> {
        self.check_connected()?;
        Ok(self.entries.get_mut(key))
    }

    pub(crate) fn contains(&self, key: &[u8]) -> CacheResult<bool> {
        self.check_connected()?;
        Ok(self.entries.contains_key(key))
    }

    pub(crate) fn insert(&mut self, key: Vec<u8>, value: CachedValue) -> CacheResult<()> {
        self.check_connected()?;
        self.entries.insert(key, value);
        Ok(())
    }

    /// Drops a key. Missing keys are not an error, and a cache that shut
    /// down concurrently has nothing left to drop.
    pub(crate) fn invalidate(&mut self, key: &[u8]) {
        if self.connected {
            self.entries.remove(key);
        }
    }

    /// Drops every entry (a whole-keyspace invalidation, e.g. `FLUSHDB`).
    pub(crate) fn invalidate_all(&mut self) {
        if self.connected {
            self.entries.clear();
        }
    }

    pub(crate) fn mark_connected(&mut self) {
        self.entries = HashMap::new();
        self.connected = true;
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.connected = false;
        self.entries = HashMap::new();
    }
}

/// The process-local cache, valid only while the invalidation listener
/// runs.
pub(crate) struct LocalCache {
    state: Mutex<CacheState>,
}

impl LocalCache {
    pub(crate) fn new() -> Arc<LocalCache> {
        Arc::new(LocalCache {
            state: Mutex::new(CacheState {
                connected: false,
                entries: HashMap::new(),
                prefetch: PrefetchRegistry::default(),
            }),
        })
    }

    /// Acquires the cache lock.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().await
    }
}
