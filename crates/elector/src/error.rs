use thiserror::Error;

use foreman_lock::LockError;

/// Errors from the election loop.
#[derive(Debug, Error)]
pub enum ElectorError {
    /// Fault from the underlying lock manager.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Driver or I/O fault against the status collection.
    #[error(transparent)]
    Database(#[from] mongodb::error::Error),

    /// Programmer mistake in elector configuration.
    #[error("invalid elector configuration: {0}")]
    Config(String),
}
