//! Conformance suite for exercising the lock against a live deployment.
//!
//! Call [`run_lock_conformance_tests`] from an integration test with a
//! database the suite may freely write to. Every scenario uses its own
//! uniquely-keyed lock, so repeated runs against the same database are safe.

use mongodb::Database;

use crate::error::LockError;
use crate::locker::{AcquireOptions, LockConfig, MongoLocker};

fn suite_config(ttl: f64) -> LockConfig {
    LockConfig {
        ttl,
        timeparanoid: false,
        ..LockConfig::default()
    }
}

fn unique_key(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

async fn locker(db: &Database, key: &str, ttl: f64) -> Result<MongoLocker, LockError> {
    MongoLocker::new(db, key, suite_config(ttl)).await
}

/// Run the full lock conformance suite.
///
/// # Errors
///
/// Returns an error if any conformance scenario fails.
pub async fn run_lock_conformance_tests(db: &Database) -> Result<(), LockError> {
    test_round_trip(db).await?;
    test_owner_scoped_release(db).await?;
    test_idempotent_release(db).await?;
    test_nonblocking_contention(db).await?;
    test_zero_timeout_single_attempt(db).await?;
    test_force_acquire(db).await?;
    test_touch_renewal(db).await?;
    test_expired_lease_is_absent(db).await?;
    Ok(())
}

async fn test_round_trip(db: &Database) -> Result<(), LockError> {
    let lock = locker(db, &unique_key("round-trip"), 30.0).await?;
    lock.acquire(AcquireOptions::default()).await?;
    assert!(lock.locked().await?, "acquired lock should report locked");
    assert!(lock.owned().await?, "acquired lock should report owned");

    let status = lock.status().await?;
    assert!(status.owned);
    assert!(status.lock_created.is_some(), "owned status carries lease fields");
    assert!(status.lock_expires.is_some());

    lock.release(false).await?;
    assert!(!lock.locked().await?, "released lock should be free");
    assert!(!lock.owned().await?);

    let status = lock.status().await?;
    assert!(!status.owned);
    assert!(status.lock_created.is_none(), "unowned status hides lease fields");
    assert!(status.lock_expires.is_none());
    Ok(())
}

async fn test_owner_scoped_release(db: &Database) -> Result<(), LockError> {
    let key = unique_key("owner-scope");
    let a = locker(db, &key, 30.0).await?;
    let b = locker(db, &key, 30.0).await?;

    a.acquire(AcquireOptions::default()).await?;
    b.release(false).await?;
    assert!(a.owned().await?, "a plain release by a non-owner must not evict the holder");

    b.release(true).await?;
    assert!(!a.owned().await?, "a forced release evicts any holder");
    assert!(!a.locked().await?);
    Ok(())
}

async fn test_idempotent_release(db: &Database) -> Result<(), LockError> {
    let lock = locker(db, &unique_key("idempotent"), 30.0).await?;
    lock.release(false).await?;
    lock.release(false).await?;
    lock.release(true).await?;
    assert!(!lock.locked().await?);
    Ok(())
}

async fn test_nonblocking_contention(db: &Database) -> Result<(), LockError> {
    let key = unique_key("contention");
    let a = locker(db, &key, 30.0).await?;
    let b = locker(db, &key, 30.0).await?;

    a.acquire(AcquireOptions::default()).await?;
    let err = b
        .acquire(AcquireOptions::non_blocking())
        .await
        .expect_err("second non-blocking acquire should fail");
    match err {
        LockError::Exists { ref host, pid, .. } => {
            assert!(!host.is_empty(), "contention error names the holder host");
            assert!(pid > 0, "contention error names the holder pid");
        }
        other => panic!("expected LockError::Exists, got {other}"),
    }
    assert!(a.owned().await?, "failed acquire must not disturb the holder");

    a.release(false).await?;
    Ok(())
}

async fn test_zero_timeout_single_attempt(db: &Database) -> Result<(), LockError> {
    let key = unique_key("zero-timeout");
    let a = locker(db, &key, 30.0).await?;
    let b = locker(db, &key, 30.0).await?;

    a.acquire(AcquireOptions::default()).await?;
    let opts = AcquireOptions {
        timeout: Some(0.0),
        ..AcquireOptions::default()
    };
    let err = b
        .acquire(opts)
        .await
        .expect_err("zero-timeout acquire under contention should time out");
    assert!(
        matches!(err, LockError::AcquireTimeout(_)),
        "expected AcquireTimeout, got {err}"
    );

    a.release(false).await?;
    Ok(())
}

async fn test_force_acquire(db: &Database) -> Result<(), LockError> {
    let key = unique_key("force");
    let a = locker(db, &key, 30.0).await?;
    let b = locker(db, &key, 30.0).await?;

    a.acquire(AcquireOptions::default()).await?;
    b.acquire(AcquireOptions::forced()).await?;

    assert!(!a.owned().await?, "forced acquire transfers ownership");
    assert!(b.owned().await?);
    assert!(
        a.touch().await?.is_none(),
        "the previous holder can no longer renew"
    );

    a.release(false).await?;
    assert!(b.owned().await?, "the old holder's release is a no-op");

    b.release(false).await?;
    assert!(!b.locked().await?, "the new holder's release removes the document");
    Ok(())
}

async fn test_touch_renewal(db: &Database) -> Result<(), LockError> {
    let lock = locker(db, &unique_key("touch"), 2.0).await?;
    lock.acquire(AcquireOptions::default()).await?;
    let first = lock
        .current()
        .await?
        .expect("lock document should exist")
        .ts_expire
        .to_chrono();

    // Renew twice across the original lease window; ownership must hold
    // past the point where the untouched lease would have expired.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let renewed = lock.touch().await?.expect("owner touch should renew");
    assert!(renewed > first, "touch must advance the expiry");

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let again = lock.touch().await?.expect("second touch should renew");
    assert!(again > renewed);
    assert!(lock.owned().await?, "lock stays owned across renewals");

    lock.release(false).await?;
    Ok(())
}

async fn test_expired_lease_is_absent(db: &Database) -> Result<(), LockError> {
    let key = unique_key("expiry");
    let a = locker(db, &key, 1.0).await?;
    let b = locker(db, &key, 30.0).await?;

    a.acquire(AcquireOptions::default()).await?;
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    assert!(!a.locked().await?, "an elapsed lease reads as absent");
    assert!(!a.owned().await?);

    // A new acquire succeeds immediately, without waiting for the
    // server-side reaper.
    b.acquire(AcquireOptions::non_blocking()).await?;
    assert!(b.owned().await?);
    assert!(a.touch().await?.is_none(), "the expired holder cannot renew");

    b.release(false).await?;
    Ok(())
}
