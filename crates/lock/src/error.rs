use std::time::Duration;

use thiserror::Error;

/// Errors from distributed lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another instance holds a live lease and the caller asked for a
    /// non-blocking acquire. Recoverable; carries the holder's identity.
    #[error("lock {key} is held by {host} (pid {pid}), expires in {expires_in:.1}s")]
    Exists {
        key: String,
        host: String,
        pid: i64,
        expires_in: f64,
    },

    /// A blocking acquire with a finite timeout elapsed without success.
    #[error("timed out after {0:?} waiting to acquire lock")]
    AcquireTimeout(Duration),

    /// The local clock and the database server clock disagree by more than
    /// the configured tolerance. Fatal to the acquire attempt; remediate the
    /// clock rather than retrying.
    #[error("local clock is {offset:.3}s off the server clock (max {max_offset:.3}s)")]
    TimeOffset { offset: f64, max_offset: f64 },

    /// The server's clock could not be read from its `hello` reply.
    #[error("server clock unavailable: {0}")]
    ServerClock(String),

    /// Programmer mistake: empty key, non-positive ttl, or contradictory
    /// acquire arguments. Raised before any I/O.
    #[error("invalid lock usage: {0}")]
    Config(String),

    /// Driver or I/O fault, propagated unchanged.
    #[error(transparent)]
    Database(#[from] mongodb::error::Error),
}
