//! The lock manager: acquire, renew, release against a single lock document.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use mongodb::bson::{self, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use tracing::{debug, warn};

use crate::doc::{LockDoc, LockStatus};
use crate::error::LockError;

/// Server error codes for an existing index with conflicting options or keys.
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

/// Write error code for a unique-key collision.
const DUPLICATE_KEY: i32 = 11000;

/// Configuration for a [`MongoLocker`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Collection holding the lock documents.
    pub collection: String,
    /// Lease duration in seconds. Any positive finite value; effective
    /// resolution is the BSON date precision (milliseconds).
    pub ttl: f64,
    /// Verify the local clock against the database server clock before
    /// acquiring.
    pub timeparanoid: bool,
    /// Maximum tolerated clock offset in seconds.
    pub max_offset: f64,
    /// How long a successful clock check stays valid before it is repeated.
    pub time_check_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            collection: "mongolocker".to_owned(),
            ttl: 600.0,
            timeparanoid: true,
            max_offset: 0.5,
            time_check_interval: Duration::from_secs(600),
        }
    }
}

/// Options for a single [`MongoLocker::acquire`] call.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Retry on contention until acquired or `timeout` elapses.
    pub blocking: bool,
    /// Upper bound in seconds on a blocking wait. `None` waits indefinitely.
    /// Invalid together with `blocking: false`.
    pub timeout: Option<f64>,
    /// Delay in seconds between retries.
    pub step: f64,
    /// Replace any existing document regardless of owner or liveness.
    /// Breaks mutual exclusion if misused.
    pub force: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            timeout: None,
            step: 0.25,
            force: false,
        }
    }
}

impl AcquireOptions {
    /// Single attempt; contention yields [`LockError::Exists`].
    pub fn non_blocking() -> Self {
        Self {
            blocking: false,
            ..Self::default()
        }
    }

    /// Seize the lock even from a live holder.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

/// Distributed lock over a single named MongoDB document.
///
/// Each instance carries a UUID generated at construction; that UUID is the
/// only proof of ownership. `release` and `touch` are scoped to it, so a
/// stale ex-owner can never mutate a new owner's record.
#[derive(Debug)]
pub struct MongoLocker {
    db: Database,
    coll: Collection<LockDoc>,
    key: String,
    uuid: String,
    host: String,
    pid: i64,
    config: LockConfig,
    time_verified: Mutex<Option<Instant>>,
}

impl MongoLocker {
    /// Create a lock manager for `key` and install the TTL index on the
    /// locks collection.
    ///
    /// # Errors
    ///
    /// [`LockError::Config`] if the key is empty or the ttl is not a
    /// positive finite number; index installation faults propagate as
    /// [`LockError::Database`].
    pub async fn new(
        db: &Database,
        key: impl Into<String>,
        config: LockConfig,
    ) -> Result<Self, LockError> {
        let key = key.into();
        if key.is_empty() {
            return Err(LockError::Config("lock key must be non-empty".to_owned()));
        }
        if !config.ttl.is_finite() || config.ttl <= 0.0 {
            return Err(LockError::Config(format!(
                "ttl must be a positive number of seconds, got {}",
                config.ttl
            )));
        }
        let coll = db.collection::<LockDoc>(&config.collection);
        ensure_expiry_index(&coll).await?;
        Ok(Self {
            db: db.clone(),
            coll,
            key,
            uuid: uuid::Uuid::new_v4().to_string(),
            host: local_hostname(),
            pid: i64::from(std::process::id()),
            config,
            time_verified: Mutex::new(None),
        })
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// This instance's identity; matches the `uuid` field of any document
    /// it owns.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Configured lease duration in seconds.
    pub fn ttl(&self) -> f64 {
        self.config.ttl
    }

    /// Attempt to take ownership of the lock.
    ///
    /// Duplicate-key contention is never fatal: non-blocking calls surface
    /// it as [`LockError::Exists`], blocking calls sleep `step` seconds and
    /// retry until the optional timeout elapses.
    pub async fn acquire(&self, opts: AcquireOptions) -> Result<(), LockError> {
        if !opts.blocking && opts.timeout.is_some() {
            return Err(LockError::Config(
                "blocking=false cannot be combined with a timeout".to_owned(),
            ));
        }
        if self.config.timeparanoid {
            self.verify_server_time().await?;
        }

        let start = Utc::now();
        let mut count: u32 = 0;
        while acquire_retry(opts.blocking, start, opts.timeout, count)? {
            count += 1;
            let created = Utc::now();
            let payload = LockDoc {
                key: self.key.clone(),
                locked: true,
                host: self.host.clone(),
                pid: self.pid,
                uuid: self.uuid.clone(),
                ts_created: bson::DateTime::from_chrono(created),
                ts_expire: bson::DateTime::from_chrono(created + ttl_delta(self.config.ttl)),
            };

            if opts.force {
                self.coll
                    .find_one_and_replace(doc! { "_id": &self.key }, &payload)
                    .upsert(true)
                    .return_document(ReturnDocument::After)
                    .await?;
                debug!(key = %self.key, uuid = %self.uuid, "lock seized by force");
                return Ok(());
            }

            // A dead lease must not block acquisition until the server-side
            // TTL reaper gets around to it.
            self.coll
                .delete_one(doc! {
                    "_id": &self.key,
                    "ts_expire": { "$lt": bson::DateTime::from_chrono(created) },
                })
                .await?;

            match self.coll.insert_one(&payload).await {
                Ok(_) => {
                    debug!(key = %self.key, uuid = %self.uuid, "lock acquired");
                    return Ok(());
                }
                Err(err) if is_duplicate_key(&err) => {
                    if !opts.blocking {
                        return Err(self.exists_error().await);
                    }
                    tokio::time::sleep(Duration::from_secs_f64(opts.step)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(LockError::AcquireTimeout(Duration::from_secs_f64(
            opts.timeout.unwrap_or_default(),
        )))
    }

    /// Delete the lock document if owned by this instance, or
    /// unconditionally with `force`. Releasing an unowned lock is a silent
    /// no-op.
    pub async fn release(&self, force: bool) -> Result<(), LockError> {
        let filter = if force {
            doc! { "_id": &self.key }
        } else {
            doc! { "_id": &self.key, "uuid": &self.uuid }
        };
        let result = self.coll.delete_one(filter).await?;
        if result.deleted_count > 0 {
            debug!(key = %self.key, uuid = %self.uuid, force, "lock released");
        }
        Ok(())
    }

    /// Renew the lease, advancing `ts_expire` to `now + ttl`.
    ///
    /// Returns the new expiry, or `None` if the lock is no longer owned by
    /// this instance (lease elapsed, seized, or released). The caller
    /// should treat `None` as loss of ownership.
    pub async fn touch(&self) -> Result<Option<DateTime<Utc>>, LockError> {
        let now = Utc::now();
        let expire = bson::DateTime::from_chrono(now + ttl_delta(self.config.ttl));
        let updated = self
            .coll
            .find_one_and_update(
                doc! {
                    "_id": &self.key,
                    "uuid": &self.uuid,
                    "locked": true,
                    "ts_expire": { "$gt": bson::DateTime::from_chrono(now) },
                },
                doc! { "$set": { "ts_expire": expire } },
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(updated.map(|d| d.ts_expire.to_chrono()))
    }

    /// Whether a live lease exists for this key, held by anyone.
    pub async fn locked(&self) -> Result<bool, LockError> {
        Ok(self.current().await?.is_some())
    }

    /// Whether the live lease for this key is held by this instance.
    pub async fn owned(&self) -> Result<bool, LockError> {
        let found = self
            .coll
            .find_one(doc! {
                "_id": &self.key,
                "uuid": &self.uuid,
                "locked": true,
                "ts_expire": { "$gt": bson::DateTime::now() },
            })
            .await?;
        Ok(found.is_some())
    }

    /// The live lock document, or `None` when the lock is free or expired.
    pub async fn current(&self) -> Result<Option<LockDoc>, LockError> {
        Ok(self
            .coll
            .find_one(doc! {
                "_id": &self.key,
                "ts_expire": { "$gt": bson::DateTime::now() },
            })
            .await?)
    }

    /// Identity, configuration, and ownership in one consistent snapshot.
    pub async fn status(&self) -> Result<LockStatus, LockError> {
        let lease = self.current().await?.filter(|d| d.uuid == self.uuid);
        Ok(LockStatus {
            key: self.key.clone(),
            uuid: self.uuid.clone(),
            host: self.host.clone(),
            pid: self.pid,
            ttl: self.config.ttl,
            timestamp: Utc::now(),
            owned: lease.is_some(),
            lock_created: lease.as_ref().map(|d| d.ts_created.to_chrono()),
            lock_expires: lease.as_ref().map(|d| d.ts_expire.to_chrono()),
        })
    }

    /// Run `f` while holding the lock, releasing on every exit path
    /// including panics.
    pub async fn with_lock<F, Fut, T>(&self, opts: AcquireOptions, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(opts).await?;
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        self.release(false).await?;
        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Compare local UTC time to the server's `hello` reply, caching a
    /// passing check for [`LockConfig::time_check_interval`].
    async fn verify_server_time(&self) -> Result<(), LockError> {
        {
            let verified = self
                .time_verified
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *verified {
                if at.elapsed() < self.config.time_check_interval {
                    return Ok(());
                }
            }
        }

        let reply = self.db.run_command(doc! { "hello": 1 }).await?;
        let server = reply
            .get_datetime("localTime")
            .map_err(|e| LockError::ServerClock(e.to_string()))?
            .to_chrono();
        let offset = seconds_between(Utc::now(), server).abs();
        if offset > self.config.max_offset {
            warn!(key = %self.key, offset, "refusing to acquire with skewed clock");
            return Err(LockError::TimeOffset {
                offset,
                max_offset: self.config.max_offset,
            });
        }

        *self
            .time_verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        Ok(())
    }

    /// Build the contention error from the current holder's document.
    async fn exists_error(&self) -> LockError {
        match self.coll.find_one(doc! { "_id": &self.key }).await {
            Ok(Some(holder)) => LockError::Exists {
                key: self.key.clone(),
                expires_in: holder.expires_in(),
                host: holder.host,
                pid: holder.pid,
            },
            // The holder vanished between the collision and this read.
            Ok(None) => LockError::Exists {
                key: self.key.clone(),
                host: "unknown".to_owned(),
                pid: 0,
                expires_in: 0.0,
            },
            Err(err) => err.into(),
        }
    }
}

impl fmt::Display for MongoLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MongoLocker(key={}, uuid={})", self.key, self.uuid)
    }
}

/// Retry predicate for [`MongoLocker::acquire`].
///
/// Depends only on its four inputs (and the wall clock). Errors on the
/// contradictory `blocking=false` + timeout combination.
fn acquire_retry(
    blocking: bool,
    start: DateTime<Utc>,
    timeout: Option<f64>,
    count: u32,
) -> Result<bool, LockError> {
    if !blocking && timeout.is_some() {
        return Err(LockError::Config(
            "blocking=false cannot be combined with a timeout".to_owned(),
        ));
    }
    if !blocking {
        return Ok(count == 0);
    }
    Ok(match timeout {
        None => true,
        Some(limit) => seconds_between(Utc::now(), start) <= limit,
    })
}

/// Install the lease-expiry TTL index, rebuilding the collection's indexes
/// if an incompatible one already exists.
async fn ensure_expiry_index(coll: &Collection<LockDoc>) -> Result<(), LockError> {
    let model = || {
        IndexModel::builder()
            .keys(doc! { "ts_expire": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::ZERO)
                    .build(),
            )
            .build()
    };
    if let Err(err) = coll.create_index(model()).await {
        if !is_index_conflict(&err) {
            return Err(err.into());
        }
        // One-time administrative cost when the lease configuration changed.
        warn!(
            collection = coll.name(),
            "conflicting index options, rebuilding indexes"
        );
        coll.drop_indexes().await?;
        coll.create_index(model()).await?;
    }
    Ok(())
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref write)) => write.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn is_index_conflict(err: &mongodb::error::Error) -> bool {
    match *err.kind {
        ErrorKind::Command(ref command) => {
            command.code == INDEX_OPTIONS_CONFLICT || command.code == INDEX_KEY_SPECS_CONFLICT
        }
        _ => false,
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}

#[allow(clippy::cast_possible_truncation)]
fn ttl_delta(ttl: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((ttl * 1000.0).round() as i64)
}

#[allow(clippy::cast_precision_loss)]
fn seconds_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}
