//! Self-rotating pipelines: bounded buffering with background flushing.
//!
//! Producers append through a scoped borrow of the current buffer and
//! never wait for a flush. A monitor tracks elapsed time, buffered bytes
//! and per-stream event counts against the configured maxima; when one is
//! hit (or a flush is requested) a background task swaps in a fresh
//! buffer and executes the old one, repeating until the buffer stays
//! empty.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::cache::LocalCache;
use crate::errors::{CacheError, CacheResult};
use crate::pipeline::CachingPipeline;
use crate::pool::ConnectionPool;

/// Rotation maxima. Every limit defaults to disabled; a fully unlimited
/// rotating pipeline only flushes on request.
#[derive(Clone, Debug, Default)]
pub struct RotationLimits {
    pub(crate) max_time: Option<Duration>,
    pub(crate) max_bytes: Option<usize>,
    pub(crate) max_stream_events: Option<usize>,
}

impl RotationLimits {
    /// Creates limits with every maximum disabled.
    pub fn new() -> RotationLimits {
        RotationLimits::default()
    }

    /// Longest time a buffered command may wait before rotation.
    pub fn set_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Largest wire-size estimate a buffer may reach before rotation.
    pub fn set_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Most events buffered for any single stream before rotation.
    pub fn set_max_stream_events(mut self, max_stream_events: usize) -> Self {
        self.max_stream_events = Some(max_stream_events);
        self
    }
}

/// Tracks one buffer's age, size and stream counts against the limits.
/// The "maximum reached" latch is sticky: once set it stays set until the
/// buffer is rotated out.
pub(crate) struct RotationMonitor {
    limits: RotationLimits,
    first_append: Option<Instant>,
    latch: bool,
}

impl RotationMonitor {
    pub(crate) fn new(limits: RotationLimits) -> RotationMonitor {
        RotationMonitor {
            limits,
            first_append: None,
            latch: false,
        }
    }

    /// Updates counters from the buffer after an append and latches when
    /// a maximum is hit.
    pub(crate) fn observe(&mut self, buffer: &CachingPipeline) {
        if buffer.is_empty() {
            return;
        }
        let now = Instant::now();
        let first = *self.first_append.get_or_insert(now);
        if let Some(max_bytes) = self.limits.max_bytes {
            if buffer.buffered_bytes() >= max_bytes {
                self.latch = true;
            }
        }
        if let Some(max_events) = self.limits.max_stream_events {
            if buffer.max_events_per_stream() >= max_events {
                self.latch = true;
            }
        }
        if let Some(max_time) = self.limits.max_time {
            if now.duration_since(first) >= max_time {
                self.latch = true;
            }
        }
    }

    pub(crate) fn force(&mut self) {
        self.latch = true;
    }

    pub(crate) fn maximum_reached(&self) -> bool {
        self.latch
    }

    /// When a time limit is configured and the buffer holds commands, the
    /// instant at which the oldest one must be flushed.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        Some(self.first_append? + self.limits.max_time?)
    }

    /// Called when the buffer is swapped out: the next buffer starts with
    /// a clean age and a cleared latch.
    pub(crate) fn reset(&mut self) {
        self.first_append = None;
        self.latch = false;
    }
}

struct RotatingState {
    buffer: CachingPipeline,
    monitor: RotationMonitor,
    executor: Option<JoinHandle<()>>,
    last_error: Option<CacheError>,
}

struct RotatingInner {
    pool: Arc<ConnectionPool>,
    cache: Arc<LocalCache>,
    state: tokio::sync::Mutex<RotatingState>,
    latch_notify: Notify,
    drained: watch::Sender<u64>,
}

/// A pipeline whose buffer is rotated and flushed in the background.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct RotatingPipeline {
    inner: Arc<RotatingInner>,
}

impl RotatingPipeline {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        cache: Arc<LocalCache>,
        limits: RotationLimits,
    ) -> RotatingPipeline {
        let (drained, _) = watch::channel(0);
        RotatingPipeline {
            inner: Arc::new(RotatingInner {
                state: tokio::sync::Mutex::new(RotatingState {
                    buffer: CachingPipeline::new(pool.clone(), cache.clone()),
                    monitor: RotationMonitor::new(limits),
                    executor: None,
                    last_error: None,
                }),
                pool,
                cache,
                latch_notify: Notify::new(),
                drained,
            }),
        }
    }

    /// Scoped access to the current buffer. The closure appends commands;
    /// on exit the monitor is updated and, when the buffer is non-empty,
    /// the background executor is guaranteed to be running. Appending
    /// never waits on flush latency.
    pub async fn with_buffer<R>(&self, f: impl FnOnce(&mut CachingPipeline) -> R) -> R {
        let mut state = self.inner.state.lock().await;
        let state = &mut *state;
        let result = f(&mut state.buffer);
        if !state.buffer.is_empty() {
            state.monitor.observe(&state.buffer);
            if state.monitor.maximum_reached() {
                self.inner.latch_notify.notify_one();
            }
            ensure_executor(&self.inner, state);
        }
        result
    }

    /// Forces the latch without waiting for the flush to finish.
    pub async fn request_flush(&self) {
        let mut state = self.inner.state.lock().await;
        if state.buffer.is_empty() {
            return;
        }
        state.monitor.force();
        self.inner.latch_notify.notify_one();
        ensure_executor(&self.inner, &mut state);
    }

    /// Forces the latch and waits until every buffered command has been
    /// flushed, re-raising the executor's error if one occurred. With a
    /// timeout the wait is bounded; an expired wait gives the flush up
    /// (the executor keeps running) and returns `Ok`.
    pub async fn flush(&self, timeout: Option<Duration>) -> CacheResult<()> {
        let mut drained_rx = self.inner.drained.subscribe();
        self.request_flush().await;

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let mut state = self.inner.state.lock().await;
                let idle = state.executor.as_ref().map_or(true, JoinHandle::is_finished);
                if state.buffer.is_empty() && idle {
                    return match state.last_error.take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
            }
            let changed = drained_rx.changed();
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    if tokio::time::timeout(deadline - now, changed).await.is_err() {
                        return Ok(());
                    }
                }
                None => {
                    if changed.await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Number of commands waiting in the current buffer.
    pub async fn buffered_commands(&self) -> usize {
        self.inner.state.lock().await.buffer.len()
    }
}

impl Drop for RotatingPipeline {
    fn drop(&mut self) {
        // Wake a parked executor so buffered commands drain and the task
        // exits instead of waiting on a latch nobody can set anymore.
        self.inner.latch_notify.notify_one();
    }
}

fn ensure_executor(inner: &Arc<RotatingInner>, state: &mut RotatingState) {
    let running = state
        .executor
        .as_ref()
        .is_some_and(|handle| !handle.is_finished());
    if !running {
        let inner = inner.clone();
        state.executor = Some(tokio::spawn(executor_loop(inner)));
    }
}

enum Wait {
    Proceed,
    Until(Instant),
    Latch,
}

/// Background executor: wait for the latch (or the time limit), rotate,
/// flush the rotated-out buffer, repeat until the buffer stays empty.
async fn executor_loop(inner: Arc<RotatingInner>) {
    loop {
        let wait = {
            let mut state = inner.state.lock().await;
            if state.buffer.is_empty() {
                finish(&inner, &mut state);
                return;
            }
            if state.monitor.maximum_reached() {
                Wait::Proceed
            } else if let Some(deadline) = state.monitor.deadline() {
                Wait::Until(deadline)
            } else {
                Wait::Latch
            }
        };
        match wait {
            Wait::Proceed => {}
            Wait::Until(deadline) => {
                tokio::select! {
                    _ = inner.latch_notify.notified() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                }
            }
            Wait::Latch => inner.latch_notify.notified().await,
        }

        let rotated = {
            let mut state = inner.state.lock().await;
            if state.buffer.is_empty() {
                finish(&inner, &mut state);
                return;
            }
            let fresh = CachingPipeline::new(inner.pool.clone(), inner.cache.clone());
            let rotated = std::mem::replace(&mut state.buffer, fresh);
            state.monitor.reset();
            rotated
        };

        // Flush outside the ordering lock so producers keep appending to
        // the fresh buffer meanwhile.
        if let Err(err) = rotated.execute().await {
            log::warn!("rotating pipeline flush failed: {err}");
            inner.state.lock().await.last_error = Some(err);
        }
        inner.drained.send_modify(|generation| *generation += 1);
    }
}

fn finish(inner: &RotatingInner, state: &mut RotatingState) {
    state.monitor.reset();
    state.executor = None;
    inner.drained.send_modify(|generation| *generation += 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipeline() -> CachingPipeline {
        // Client::open only parses the URL; no connection is made here.
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let push_client = redis::Client::open("redis://127.0.0.1/?protocol=resp3").unwrap();
        let pool = ConnectionPool::new(client, push_client, None, None);
        CachingPipeline::new(pool, LocalCache::new())
    }

    #[test]
    fn byte_limit_latches() {
        let mut buffer = test_pipeline();
        let mut monitor =
            RotationMonitor::new(RotationLimits::new().set_max_bytes(16));
        buffer.set("key", "a value well over the limit");
        monitor.observe(&buffer);
        assert!(monitor.maximum_reached());
    }

    #[test]
    fn latch_is_sticky_until_reset() {
        let mut buffer = test_pipeline();
        let mut monitor = RotationMonitor::new(RotationLimits::new().set_max_stream_events(2));
        buffer.xadd("s", &[("f", "1")]);
        monitor.observe(&buffer);
        assert!(!monitor.maximum_reached());
        buffer.xadd("s", &[("f", "2")]);
        monitor.observe(&buffer);
        assert!(monitor.maximum_reached());
        // Further appends keep the latch set.
        buffer.set("k", "v");
        monitor.observe(&buffer);
        assert!(monitor.maximum_reached());
        monitor.reset();
        assert!(!monitor.maximum_reached());
    }

    #[test]
    fn stream_events_count_per_stream() {
        let mut buffer = test_pipeline();
        let mut monitor = RotationMonitor::new(RotationLimits::new().set_max_stream_events(3));
        buffer.xadd("a", &[("f", "1")]);
        buffer.xadd("b", &[("f", "1")]);
        buffer.xadd("a", &[("f", "2")]);
        monitor.observe(&buffer);
        // Two streams with two and one events: no single stream hit 3.
        assert!(!monitor.maximum_reached());
        buffer.xadd("a", &[("f", "3")]);
        monitor.observe(&buffer);
        assert!(monitor.maximum_reached());
    }

    #[test]
    fn time_limit_sets_deadline_from_first_append() {
        let mut buffer = test_pipeline();
        let mut monitor =
            RotationMonitor::new(RotationLimits::new().set_max_time(Duration::from_secs(60)));
        assert!(monitor.deadline().is_none());
        buffer.set("k", "v");
        monitor.observe(&buffer);
        let deadline = monitor.deadline().unwrap();
        assert!(deadline > Instant::now());
        assert!(deadline <= Instant::now() + Duration::from_secs(60));
    }

    #[test]
    fn unlimited_monitor_never_latches_on_its_own() {
        let mut buffer = test_pipeline();
        let mut monitor = RotationMonitor::new(RotationLimits::new());
        buffer.set("k", "v");
        monitor.observe(&buffer);
        assert!(!monitor.maximum_reached());
        assert!(monitor.deadline().is_none());
        monitor.force();
        assert!(monitor.maximum_reached());
    }
}
