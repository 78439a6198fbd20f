//! TTL-based distributed locking on MongoDB.
//!
//! A [`MongoLocker`] owns a single named lock identity backed by one document
//! in a locks collection. Mutual exclusion rests entirely on the database's
//! per-document atomicity: a conditional insert on the unique `_id`, an
//! owner-scoped `findOneAndUpdate` for lease renewal, and a TTL index that
//! reaps expired leases. A lease whose expiry has passed is treated as absent
//! by every reader, so a crashed holder never wedges the lock for longer than
//! its TTL.
//!
//! This is lease-based coordination, not consensus. There are no fencing
//! tokens and no protection against pathological clock skew beyond the
//! opt-out [`LockConfig::timeparanoid`] sanity check.

pub mod doc;
pub mod error;
pub mod locker;
pub mod testing;

pub use doc::{LockDoc, LockStatus};
pub use error::LockError;
pub use locker::{AcquireOptions, LockConfig, MongoLocker};
