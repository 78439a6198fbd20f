//! Persisted lock document and point-in-time status snapshots.

use chrono::{DateTime, Utc};
use mongodb::bson;
use serde::{Deserialize, Serialize};

/// The single document backing a named lock.
///
/// The document exists only while the lock is held; `locked` is always `true`
/// on disk. A document whose `ts_expire` has passed is logically absent and
/// will be removed by the collection's TTL index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDoc {
    /// Lock key; unique primary key of the collection.
    #[serde(rename = "_id")]
    pub key: String,
    pub locked: bool,
    /// Hostname of the current owner.
    pub host: String,
    /// OS process id of the current owner.
    pub pid: i64,
    /// Per-instance identity. The sole proof of ownership.
    pub uuid: String,
    /// When this ownership was established.
    pub ts_created: bson::DateTime,
    /// Lease expiry.
    pub ts_expire: bson::DateTime,
}

impl LockDoc {
    /// Seconds until the lease expires; negative once it has.
    #[allow(clippy::cast_precision_loss)]
    pub fn expires_in(&self) -> f64 {
        (self.ts_expire.to_chrono() - Utc::now()).num_milliseconds() as f64 / 1000.0
    }
}

/// Snapshot of a locker's identity and current ownership.
///
/// `lock_created` and `lock_expires` are populated only when `owned` is true,
/// and all three come from a single read so the snapshot can never pair the
/// owner bit with another node's lease window.
#[derive(Debug, Clone)]
pub struct LockStatus {
    pub key: String,
    pub uuid: String,
    pub host: String,
    pub pid: i64,
    /// Configured lease duration in seconds.
    pub ttl: f64,
    /// When this snapshot was taken.
    pub timestamp: DateTime<Utc>,
    pub owned: bool,
    pub lock_created: Option<DateTime<Utc>>,
    pub lock_expires: Option<DateTime<Utc>>,
}
