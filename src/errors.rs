//! Error and result types for the caching layer.

use redis::RedisError;

/// Result type returned by all fallible operations in this crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// An error raised by the caching layer.
///
/// Transport and server errors from the underlying client are passed
/// through as [`CacheError::Redis`]; the remaining variants describe
/// failure modes of the caching layer itself.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No idle connection exists and the pool has reached
    /// `max_connections`. The caller should back off and retry.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A cached operation was attempted while the invalidation listener
    /// is not running. Recoverable by calling `connect` again.
    #[error("the cache is not connected")]
    NotConnected,

    /// The subscribe or tracking-enable handshake did not return the
    /// expected acknowledgement. Fatal to that connection attempt.
    #[error("client tracking handshake failed: {0}")]
    TrackingProtocol(String),

    /// The tracking connection was used without holding its lock.
    ///
    /// This cannot be reached through the public API; seeing it means a
    /// bug inside the crate, not a runtime condition to recover from.
    #[error("tracking connection used without ownership")]
    TrackingUnavailable,

    /// An error from the underlying `redis` client.
    #[error(transparent)]
    Redis(#[from] RedisError),
}

impl CacheError {
    /// Returns true if the error indicates the cache itself is unusable
    /// (as opposed to a failure of one particular command).
    pub fn is_disconnection(&self) -> bool {
        matches!(self, CacheError::NotConnected)
    }
}
