//! redcache puts a client-side cache and self-rotating pipelines between
//! your code and a Redis database, on top of the [`redis`] crate.
//!
//! Hot keys are read from an in-process cache instead of round-tripping
//! to the server. The cache is kept honest by Redis server-assisted
//! invalidation: a background listener subscribes to the reserved
//! `__redis__:invalidate` channel and enables `CLIENT TRACKING` in
//! broadcast mode, redirected at its own subscription connection, so any
//! write — from this process or any other client — purges the affected
//! keys before a reader can observe them as current.
//!
//! # Basic operation
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use redcache::{CachingProxy, ProxyConfig};
//!
//! # async fn do_something() -> redcache::CacheResult<()> {
//! let proxy = CachingProxy::open("redis://127.0.0.1/", ProxyConfig::new())?;
//!
//! // Without connect() every call is an ordinary round-trip.
//! let _: () = proxy.set("answer", 42).await?;
//!
//! // With the listener running, repeated reads of a key are local.
//! proxy.connect(Duration::from_secs(5)).await?;
//! let answer: i64 = proxy.get("answer").await?;
//! assert_eq!(answer, 42);
//! # Ok(())
//! # }
//! ```
//!
//! If the listener dies underneath a connected proxy — the server went
//! away, the subscription socket dropped — cached operations fail with
//! [`CacheError::NotConnected`] until [`CachingProxy::connect`] is called
//! again. The proxy never silently serves data it cannot prove fresh.
//!
//! # Pipelining
//!
//! [`CachingProxy::pipeline`] buffers commands and defers their cache
//! edits until the batched round-trip has succeeded:
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! # use redcache::{CachingProxy, ProxyConfig};
//! # async fn do_something() -> redcache::CacheResult<()> {
//! # let proxy = CachingProxy::open("redis://127.0.0.1/", ProxyConfig::new())?;
//! let mut pipe = proxy.pipeline();
//! pipe.set("key_1", 42).set("key_2", 43).rpush("queue", &["a", "b"]);
//! let replies = pipe.execute().await?;
//! assert_eq!(replies.len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! A reader can never observe half of a batch: the deferred edits are
//! applied in issue order under a single cache-lock acquisition.
//!
//! # Rotating pipelines
//!
//! For bursty writers, [`CachingProxy::rotating_pipeline`] bounds memory,
//! latency and staleness at once: appends go into the current buffer, and
//! a background task flushes it whenever the configured byte, time or
//! per-stream-event maximum is hit.
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! # use redcache::{CachingProxy, ProxyConfig, RotationLimits};
//! # async fn do_something() -> redcache::CacheResult<()> {
//! # let proxy = CachingProxy::open("redis://127.0.0.1/", ProxyConfig::new())?;
//! let limits = RotationLimits::new()
//!     .set_max_bytes(64 * 1024)
//!     .set_max_time(Duration::from_millis(200));
//! let rotating = proxy.rotating_pipeline(limits);
//! rotating.with_buffer(|buf| {
//!     buf.xadd("events", &[("temperature", "23.5")]);
//! }).await;
//! // Producers never wait; flush() is the explicit synchronization point.
//! rotating.flush(None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Prefetching
//!
//! Objects implementing [`Prefetchable`] can be registered with
//! [`CachingProxy::add_prefetch`]; any cache miss then fetches their keys
//! in the same round-trip. Registrations are weakly held — dropping the
//! object unregisters it without touching the network.
//!
//! # Requirements
//!
//! Server-assisted invalidation needs a server with RESP3 and `CLIENT
//! TRACKING` support (Redis 6 or later). Everything else works against
//! any Redis-protocol store.

#![deny(non_camel_case_types)]
#![warn(missing_docs)]

pub use crate::cache::Prefetchable;
pub use crate::errors::{CacheError, CacheResult};
pub use crate::pipeline::CachingPipeline;
pub use crate::pool::{ConnectionPool, PooledConnection};
pub use crate::proxy::{CachingProxy, ProxyConfig};
pub use crate::rotation::{RotatingPipeline, RotationLimits};
pub use crate::value::CacheKind;

mod cache;
mod errors;
mod listener;
mod pipeline;
mod pool;
mod proxy;
mod rotation;
mod value;
