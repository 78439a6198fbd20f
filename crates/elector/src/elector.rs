//! The election control loop.
//!
//! A background worker polls the lock on a fixed cadence: renew the lease
//! while leader, race for a free lock while follower, publish a heartbeat,
//! and fire the embedder's transition callbacks. All state transitions are
//! serialized by one mutex so an explicit `release` or `stop` can never
//! interleave with a half-finished poll.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, TryStreamExt};
use mongodb::bson::{self, doc};
use mongodb::error::ErrorKind;
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, warn};

use foreman_lock::{AcquireOptions, LockConfig, LockError, MongoLocker};

use crate::error::ElectorError;
use crate::status::{ClusterDetail, NodeStatus, parse_leader};

/// Locks collection used by electors.
const LOCKS_COLLECTION: &str = "elector.locks";

/// Status collection holding per-node heartbeats.
const STATUS_COLLECTION: &str = "elector.leader_status";

/// Default lease duration in seconds.
const DEFAULT_TTL: f64 = 15.0;

/// A zero-argument transition callback supplied by the embedder. Panics are
/// caught and logged; they never desynchronize the election state machine.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

tokio::task_local! {
    /// Instance id of the elector whose worker task is currently executing.
    /// Lets `stop` detect a call from inside its own worker and skip the
    /// wait that would otherwise deadlock on the caller's own task.
    static WORKER_OF: u64;
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Builder for [`Elector`].
pub struct ElectorBuilder {
    db: Database,
    key: String,
    ttl: f64,
    on_leader: Option<Callback>,
    on_leader_loss: Option<Callback>,
    on_loop: Option<Callback>,
    app_version: Option<String>,
    report_status: bool,
}

impl ElectorBuilder {
    fn new(db: Database, key: impl Into<String>) -> Self {
        Self {
            db,
            key: key.into(),
            ttl: DEFAULT_TTL,
            on_leader: None,
            on_leader_loss: None,
            on_loop: None,
            app_version: None,
            report_status: true,
        }
    }

    /// Lease duration in seconds, shared with the underlying lock.
    pub fn ttl(mut self, seconds: f64) -> Self {
        self.ttl = seconds;
        self
    }

    /// Fired on the FOLLOWER → LEADER transition.
    pub fn on_leader(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_leader = Some(Arc::new(callback));
        self
    }

    /// Fired on every LEADER → non-LEADER transition: a lost lease, an
    /// explicit release, or shutdown while leading.
    pub fn on_leader_loss(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_leader_loss = Some(Arc::new(callback));
        self
    }

    /// Fired at the end of every poll cycle.
    pub fn on_loop(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_loop = Some(Arc::new(callback));
        self
    }

    /// Application version advertised in this node's heartbeat.
    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    /// Whether to publish a heartbeat each poll (default on).
    pub fn report_status(mut self, enabled: bool) -> Self {
        self.report_status = enabled;
        self
    }

    /// Validate the configuration, construct the lock manager, and prepare
    /// the status collection indexes.
    pub async fn build(self) -> Result<Elector, ElectorError> {
        if self.key.is_empty() {
            return Err(ElectorError::Config(
                "election key must be non-empty".to_owned(),
            ));
        }
        if !self.ttl.is_finite() || self.ttl <= 0.0 {
            return Err(ElectorError::Config(format!(
                "ttl must be a positive number of seconds, got {}",
                self.ttl
            )));
        }

        let locker = MongoLocker::new(
            &self.db,
            &self.key,
            LockConfig {
                collection: LOCKS_COLLECTION.to_owned(),
                ttl: self.ttl,
                ..LockConfig::default()
            },
        )
        .await?;

        let status_coll = self.db.collection::<NodeStatus>(STATUS_COLLECTION);
        ensure_status_indexes(&status_coll, self.ttl).await?;

        let (running_tx, _) = watch::channel(false);
        Ok(Elector {
            inner: Arc::new(ElectorInner {
                instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                key: self.key,
                ttl: self.ttl,
                locker,
                status_coll,
                app_version: self.app_version,
                report_status: self.report_status,
                on_leader: self.on_leader,
                on_leader_loss: self.on_leader_loss,
                on_loop: self.on_loop,
                shutdown: AtomicBool::new(false),
                running_tx,
                poll_state: Mutex::new(PollState::default()),
            }),
        })
    }
}

#[derive(Debug, Default)]
struct PollState {
    was_leader: bool,
    last_poll: Option<DateTime<Utc>>,
}

struct ElectorInner {
    instance_id: u64,
    key: String,
    ttl: f64,
    locker: MongoLocker,
    status_coll: Collection<NodeStatus>,
    app_version: Option<String>,
    report_status: bool,
    on_leader: Option<Callback>,
    on_leader_loss: Option<Callback>,
    on_loop: Option<Callback>,
    shutdown: AtomicBool,
    running_tx: watch::Sender<bool>,
    poll_state: Mutex<PollState>,
}

/// Coordinates distributed leader election for one key.
///
/// Cheap to clone; clones share the same worker and state.
#[derive(Clone)]
pub struct Elector {
    inner: Arc<ElectorInner>,
}

impl fmt::Debug for Elector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elector")
            .field("instance_id", &self.inner.instance_id)
            .field("key", &self.inner.key)
            .finish()
    }
}

impl Elector {
    /// Start building an elector for `key`.
    pub fn builder(db: Database, key: impl Into<String>) -> ElectorBuilder {
        ElectorBuilder::new(db, key)
    }

    /// Election key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// This instance's identity; matches the heartbeat `_id` and the lock
    /// document `uuid` while leading.
    pub fn uuid(&self) -> &str {
        self.inner.locker.uuid()
    }

    /// Configured lease duration in seconds.
    pub fn ttl(&self) -> f64 {
        self.inner.ttl
    }

    /// Whether the background worker is running.
    pub fn running(&self) -> bool {
        *self.inner.running_tx.borrow()
    }

    /// Spawn the background worker. A no-op if already running.
    pub fn start(&self) {
        let claimed = self.inner.running_tx.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !claimed {
            warn!(key = %self.inner.key, "elector already running");
            return;
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        let id = inner.instance_id;
        tokio::spawn(WORKER_OF.scope(id, worker_loop(inner)));
    }

    /// Start the worker and wait until it exits.
    pub async fn start_blocking(&self) {
        self.start();
        self.wait_stopped().await;
    }

    /// Signal shutdown, wait for the worker to exit, and release
    /// leadership.
    ///
    /// Safe to call from inside a callback: when invoked from the worker's
    /// own task only the flag is set, and the worker releases leadership
    /// itself as it exits after the current poll.
    pub async fn stop(&self) -> Result<(), ElectorError> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if self.called_from_worker() {
            return Ok(());
        }
        self.wait_stopped().await;
        // The worker already released on exit; this covers an elector that
        // was never started and is otherwise a no-op.
        self.inner.release().await
    }

    /// Release the lock; if this node was leader, transition to follower
    /// and fire `on_leader_loss`. The worker keeps running and may stand
    /// for election again on its next poll.
    pub async fn release(&self) -> Result<(), ElectorError> {
        self.inner.release().await
    }

    /// Execute one poll cycle immediately, outside the worker cadence.
    /// Serialized against the worker's own polls.
    pub async fn poll(&self) -> Result<(), ElectorError> {
        self.inner.poll().await
    }

    /// Whether this instance currently holds leadership.
    pub async fn is_leader(&self) -> Result<bool, ElectorError> {
        Ok(self.inner.locker.owned().await?)
    }

    /// Whether any instance currently holds leadership for the key.
    pub async fn leader_exists(&self) -> Result<bool, ElectorError> {
        Ok(self.inner.locker.locked().await?)
    }

    /// Seconds between polls: `ttl / 2` while leader, `ttl` otherwise.
    pub async fn poll_wait(&self) -> f64 {
        let state = self.inner.poll_state.lock().await;
        poll_wait_secs(self.inner.ttl, state.was_leader)
    }

    /// This node's heartbeat document as it would be published.
    pub async fn node_status(&self) -> Result<NodeStatus, ElectorError> {
        let state = self.inner.poll_state.lock().await;
        self.inner.node_status(&state).await
    }

    /// The cluster view: all member heartbeats for the key (newest first)
    /// and the parsed leader, if any.
    pub async fn cluster_detail(&self) -> Result<ClusterDetail, ElectorError> {
        self.inner.cluster_detail().await
    }

    /// Run `f` with the elector started, stopping on every exit path
    /// including panics.
    pub async fn with_running<F, Fut, T>(&self, f: F) -> Result<T, ElectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.start();
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        self.stop().await?;
        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn called_from_worker(&self) -> bool {
        WORKER_OF
            .try_with(|id| *id == self.inner.instance_id)
            .unwrap_or(false)
    }

    async fn wait_stopped(&self) {
        let mut rx = self.inner.running_tx.subscribe();
        let _ = rx.wait_for(|running| !running).await;
    }
}

impl fmt::Display for Elector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.inner.poll_state.try_lock() {
            Ok(state) if state.was_leader => "leader",
            _ => "follower",
        };
        let running = if self.running() { "running" } else { "stopped" };
        write!(
            f,
            "Elector(key={}, {role}, {running}, uuid={})",
            self.inner.key,
            self.inner.locker.uuid()
        )
    }
}

impl ElectorInner {
    /// One poll cycle. Serialized by the poll mutex so `release` and
    /// `stop` cannot interleave with it.
    async fn poll(&self) -> Result<(), ElectorError> {
        let mut state = self.poll_state.lock().await;
        state.last_poll = Some(Utc::now());

        let mut holds_lease = self.locker.owned().await?;
        if holds_lease {
            state.was_leader = true;
            if self.locker.touch().await?.is_none() {
                // The lease slipped away between the ownership check and
                // the renewal.
                holds_lease = false;
            }
        }
        if !holds_lease && state.was_leader {
            state.was_leader = false;
            debug!(key = %self.key, uuid = %self.locker.uuid(), "leadership lost");
            self.fire(self.on_leader_loss.as_ref(), "on_leader_loss");
        }

        if !self.locker.locked().await? && !self.shutdown.load(Ordering::SeqCst) {
            match self.locker.acquire(AcquireOptions::non_blocking()).await {
                Ok(()) => {
                    state.was_leader = true;
                    debug!(key = %self.key, uuid = %self.locker.uuid(), "leadership acquired");
                    self.fire(self.on_leader.as_ref(), "on_leader");
                }
                // Someone else won the race; stay a follower.
                Err(LockError::Exists { .. } | LockError::AcquireTimeout(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if self.report_status {
            self.report_node_status(&state).await?;
        }
        self.fire(self.on_loop.as_ref(), "on_loop");
        Ok(())
    }

    async fn release(&self) -> Result<(), ElectorError> {
        let mut state = self.poll_state.lock().await;
        self.locker.release(false).await?;
        if state.was_leader {
            state.was_leader = false;
            debug!(key = %self.key, uuid = %self.locker.uuid(), "leadership released");
            self.fire(self.on_leader_loss.as_ref(), "on_leader_loss");
        }
        Ok(())
    }

    async fn node_status(&self, state: &PollState) -> Result<NodeStatus, ElectorError> {
        let lock = self.locker.status().await?;
        Ok(NodeStatus {
            id: lock.uuid.clone(),
            key: self.key.clone(),
            uuid: lock.uuid,
            host: lock.host,
            pid: lock.pid,
            ttl: lock.ttl,
            timestamp: bson::DateTime::from_chrono(lock.timestamp),
            is_leader: lock.owned,
            elector_running: *self.running_tx.borrow(),
            last_poll: state.last_poll.map(bson::DateTime::from_chrono),
            app_version: self.app_version.clone(),
            lock_created: lock.lock_created.map(bson::DateTime::from_chrono),
            lock_expires: lock.lock_expires.map(bson::DateTime::from_chrono),
        })
    }

    async fn report_node_status(&self, state: &PollState) -> Result<(), ElectorError> {
        let status = self.node_status(state).await?;
        self.status_coll
            .replace_one(doc! { "_id": &status.id }, &status)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn cluster_detail(&self) -> Result<ClusterDetail, ElectorError> {
        let members: Vec<NodeStatus> = self
            .status_coll
            .find(doc! { "key": &self.key })
            .sort(doc! { "timestamp": -1 })
            .await?
            .try_collect()
            .await?;
        let leader = parse_leader(&members);
        Ok(ClusterDetail {
            member_detail: members,
            leader,
            timestamp: Utc::now(),
        })
    }

    fn fire(&self, callback: Option<&Callback>, name: &str) {
        if let Some(cb) = callback {
            if std::panic::catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                error!(key = %self.key, callback = name, "elector callback panicked");
            }
        }
    }
}

/// The background worker. Polls until shutdown is requested, then releases
/// leadership and marks the elector stopped.
async fn worker_loop(inner: Arc<ElectorInner>) {
    debug!(key = %inner.key, uuid = %inner.locker.uuid(), "elector worker started");
    while !inner.shutdown.load(Ordering::SeqCst) {
        if let Err(err) = inner.poll().await {
            // Transient I/O never kills the agent; retry on the next tick.
            warn!(key = %inner.key, error = %err, "elector poll failed");
        }
        let wait = {
            let state = inner.poll_state.lock().await;
            poll_wait_secs(inner.ttl, state.was_leader)
        };
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
    }
    if let Err(err) = inner.release().await {
        warn!(key = %inner.key, error = %err, "release on worker exit failed");
    }
    debug!(key = %inner.key, "elector worker stopped");
    let _ = inner.running_tx.send(false);
}

/// Leaders renew at least twice per lease window; followers poll once per
/// lease.
fn poll_wait_secs(ttl: f64, leader: bool) -> f64 {
    if leader { ttl / 2.0 } else { ttl }
}

/// Install the heartbeat TTL index (expiry = lease duration) and the
/// secondary key index, rebuilding on an options conflict.
async fn ensure_status_indexes(
    coll: &Collection<NodeStatus>,
    ttl: f64,
) -> Result<(), ElectorError> {
    let ttl_model = || {
        IndexModel::builder()
            .keys(doc! { "timestamp": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::from_secs_f64(ttl))
                    .build(),
            )
            .build()
    };
    if let Err(err) = coll.create_index(ttl_model()).await {
        if !is_index_conflict(&err) {
            return Err(err.into());
        }
        // One-time administrative cost when the lease configuration changed.
        warn!(
            collection = coll.name(),
            "conflicting index options, rebuilding indexes"
        );
        coll.drop_indexes().await?;
        coll.create_index(ttl_model()).await?;
    }
    coll.create_index(IndexModel::builder().keys(doc! { "key": 1 }).build())
        .await?;
    Ok(())
}

fn is_index_conflict(err: &mongodb::error::Error) -> bool {
    const INDEX_OPTIONS_CONFLICT: i32 = 85;
    const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
    match *err.kind {
        ErrorKind::Command(ref command) => {
            command.code == INDEX_OPTIONS_CONFLICT || command.code == INDEX_KEY_SPECS_CONFLICT
        }
        _ => false,
    }
}
