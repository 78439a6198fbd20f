#![cfg(feature = "integration")]

//! End-to-end election scenarios against a live MongoDB deployment.
//!
//! Requires a reachable server (`MONGODB_URI`, default localhost). Every
//! scenario elects on its own unique key, so suites can run repeatedly and
//! in parallel against the same database.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mongodb::Database;

use foreman_elector::{AcquireOptions, Elector, LockConfig, MongoLocker};

/// Lease used by every scenario, so the shared status collection keeps a
/// consistent TTL index across tests.
const TTL: f64 = 5.0;

async fn test_db() -> Database {
    init_tracing();
    let uri =
        std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_owned());
    mongodb::Client::with_uri_str(&uri)
        .await
        .expect("client creation should succeed")
        .database("foreman_elector_test")
}

/// Honor `RUST_LOG` when running the live-database suite. Repeated calls
/// are fine; only the first init wins.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Poll `check` until it passes or `deadline` elapses.
async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[tokio::test]
async fn solo_elector_becomes_and_stays_leader() {
    let db = test_db().await;
    let key = unique("solo");
    let promoted = Arc::new(AtomicUsize::new(0));
    let hook = promoted.clone();

    let elector = Elector::builder(db, &key)
        .ttl(TTL)
        .on_leader(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .await
        .expect("elector creation should succeed");

    elector.start();
    assert!(elector.running());

    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(2.0 * TTL), move || {
            let e = e.clone();
            async move { e.is_leader().await.unwrap_or(false) }
        })
        .await,
        "a solo elector should win within a lease"
    );
    assert!(promoted.load(Ordering::SeqCst) >= 1, "on_leader fired");

    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(TTL), move || {
            let e = e.clone();
            let uuid = e.uuid().to_owned();
            async move {
                e.cluster_detail()
                    .await
                    .ok()
                    .and_then(|d| d.leader)
                    .is_some_and(|l| l.uuid == uuid)
            }
        })
        .await,
        "the cluster view should name this node leader"
    );

    elector.stop().await.expect("stop should succeed");
    assert!(!elector.running(), "stop joins the worker");
    assert!(
        !elector.is_leader().await.expect("is_leader query"),
        "stop releases leadership"
    );
    assert!(
        !elector.leader_exists().await.expect("leader_exists query"),
        "no lease survives a stopped solo elector"
    );
}

#[tokio::test]
async fn follower_takes_over_after_leader_crash() {
    let db = test_db().await;
    let key = unique("failover");

    // A crashed leader is just a lease nobody renews: take the lock with a
    // bare locker on the elector's collection and never touch it again.
    let crashed = MongoLocker::new(
        &db,
        &key,
        LockConfig {
            collection: "elector.locks".to_owned(),
            ttl: TTL,
            timeparanoid: false,
            ..LockConfig::default()
        },
    )
    .await
    .expect("locker creation should succeed");
    crashed
        .acquire(AcquireOptions::default())
        .await
        .expect("the doomed leader should acquire first");

    let elector = Elector::builder(db, &key)
        .ttl(TTL)
        .build()
        .await
        .expect("elector creation should succeed");
    elector.start();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !elector.is_leader().await.expect("is_leader query"),
        "the elector defers to a live lease"
    );

    // The crash becomes visible once the stale lease is gone.
    crashed.release(true).await.expect("simulated crash");

    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(2.0 * TTL), move || {
            let e = e.clone();
            async move { e.is_leader().await.unwrap_or(false) }
        })
        .await,
        "the follower should take over within two lease windows"
    );

    elector.stop().await.expect("stop should succeed");
}

#[tokio::test]
async fn cluster_detail_shows_every_member_and_one_leader() {
    let db = test_db().await;
    let key = unique("cluster");

    let mut electors = Vec::new();
    for _ in 0..3 {
        let elector = Elector::builder(db.clone(), &key)
            .ttl(TTL)
            .build()
            .await
            .expect("elector creation should succeed");
        elector.start();
        electors.push(elector);
    }

    let observer = electors[0].clone();
    assert!(
        eventually(Duration::from_secs_f64(3.0 * TTL), move || {
            let observer = observer.clone();
            async move {
                let Ok(detail) = observer.cluster_detail().await else {
                    return false;
                };
                let leaders = detail.member_detail.iter().filter(|m| m.is_leader).count();
                detail.member_detail.len() == 3 && leaders == 1
            }
        })
        .await,
        "all three members should appear with exactly one leader"
    );

    let detail = electors[0]
        .cluster_detail()
        .await
        .expect("cluster_detail query");
    let leader = detail.leader.expect("a leader is visible");
    assert!(
        electors.iter().any(|e| e.uuid() == leader.uuid),
        "the parsed leader is one of ours"
    );
    let claimed = detail
        .member_detail
        .iter()
        .find(|m| m.is_leader)
        .expect("one member claims leadership");
    assert_eq!(leader.uuid, claimed.uuid);
    assert_eq!(leader.host, claimed.host);

    for elector in &electors {
        elector.stop().await.expect("stop should succeed");
    }
}

#[tokio::test]
async fn explicit_release_fires_on_leader_loss() {
    let db = test_db().await;
    let key = unique("release");
    let lost = Arc::new(AtomicUsize::new(0));
    let hook = lost.clone();

    let elector = Elector::builder(db, &key)
        .ttl(TTL)
        .on_leader_loss(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .await
        .expect("elector creation should succeed");
    elector.start();

    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(2.0 * TTL), move || {
            let e = e.clone();
            async move { e.is_leader().await.unwrap_or(false) }
        })
        .await,
        "should become leader before releasing"
    );

    elector.release().await.expect("release should succeed");
    assert_eq!(
        lost.load(Ordering::SeqCst),
        1,
        "explicit release is a LEADER → follower transition"
    );
    assert!(elector.running(), "release does not stop the worker");

    elector.stop().await.expect("stop should succeed");
}

#[tokio::test]
async fn heartbeat_carries_identity_and_lease() {
    let db = test_db().await;
    let key = unique("heartbeat");

    let elector = Elector::builder(db, &key)
        .ttl(TTL)
        .app_version("2.4.1")
        .build()
        .await
        .expect("elector creation should succeed");
    elector.start();

    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(2.0 * TTL), move || {
            let e = e.clone();
            async move { e.is_leader().await.unwrap_or(false) }
        })
        .await,
        "should become leader"
    );

    let status = elector.node_status().await.expect("node_status query");
    assert_eq!(status.id, elector.uuid());
    assert_eq!(status.key, key);
    assert!(status.is_leader);
    assert!(status.elector_running);
    assert!(status.last_poll.is_some(), "the worker has polled");
    assert_eq!(status.app_version.as_deref(), Some("2.4.1"));
    assert!(status.lock_created.is_some(), "a leader reports its lease");
    assert!(status.lock_expires.is_some());

    elector.stop().await.expect("stop should succeed");

    let status = elector.node_status().await.expect("node_status query");
    assert!(!status.is_leader);
    assert!(status.lock_created.is_none(), "a follower reports no lease");
    assert!(status.lock_expires.is_none());
}

#[tokio::test]
async fn scoped_run_stops_on_exit() {
    let db = test_db().await;
    let key = unique("scoped");

    let elector = Elector::builder(db, &key)
        .ttl(TTL)
        .build()
        .await
        .expect("elector creation should succeed");

    let inner = elector.clone();
    let was_running = elector
        .with_running(move || {
            let inner = inner.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                inner.running()
            }
        })
        .await
        .expect("scoped run should succeed");
    assert!(was_running, "the elector runs inside the scope");
    assert!(!elector.running(), "the elector stops on scope exit");
}

#[tokio::test]
async fn display_reflects_role_and_running_state() {
    let db = test_db().await;
    let key = unique("display");

    let elector = Elector::builder(db, &key)
        .ttl(TTL)
        .build()
        .await
        .expect("elector creation should succeed");

    let repr = elector.to_string();
    assert!(repr.contains(&key));
    assert!(repr.contains(elector.uuid()));
    assert!(repr.contains("follower"));
    assert!(repr.contains("stopped"));

    elector.start();
    // The role flips once a poll wins the lock; the poll mutex may be held
    // mid-cycle, so keep sampling rather than asserting one snapshot.
    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(2.0 * TTL), move || {
            let repr = e.to_string();
            async move { repr.contains("leader") && repr.contains("running") }
        })
        .await,
        "a started elector should display as a running leader"
    );

    elector.stop().await.expect("stop should succeed");
    let repr = elector.to_string();
    assert!(repr.contains("follower"), "leadership is gone after stop");
    assert!(repr.contains("stopped"));
}

#[tokio::test]
async fn restart_after_stop() {
    let db = test_db().await;
    let key = unique("restart");

    let elector = Elector::builder(db, &key)
        .ttl(TTL)
        .build()
        .await
        .expect("elector creation should succeed");

    elector.start();
    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(2.0 * TTL), move || {
            let e = e.clone();
            async move { e.is_leader().await.unwrap_or(false) }
        })
        .await
    );
    elector.stop().await.expect("stop should succeed");
    assert!(!elector.running());

    // STOPPED → FOLLOWER: a fresh start resets the shutdown flag.
    elector.start();
    assert!(elector.running());
    let e = elector.clone();
    assert!(
        eventually(Duration::from_secs_f64(2.0 * TTL), move || {
            let e = e.clone();
            async move { e.is_leader().await.unwrap_or(false) }
        })
        .await,
        "a restarted elector stands for election again"
    );
    elector.stop().await.expect("stop should succeed");
}
