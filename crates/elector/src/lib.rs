//! Distributed leader election on MongoDB.
//!
//! An [`Elector`] runs a background task that races a fleet of identical
//! agents for a TTL-based lock. At any instant at most one agent holds
//! leadership for a given key; the rest are followers that take over when
//! the leader fails, exits, or is partitioned away. Each instance publishes
//! a per-node heartbeat into a status collection so any observer can read
//! the cluster view.
//!
//! Failover is bounded below by the lease duration: a crashed leader's
//! lease must elapse before a follower can win the next poll. Leaders renew
//! at twice the poll rate of followers, so a healthy leader keeps its lease
//! indefinitely.
//!
//! ```ignore
//! let elector = Elector::builder(db, "reporting")
//!     .ttl(15.0)
//!     .on_leader(|| println!("promoted"))
//!     .on_leader_loss(|| println!("demoted"))
//!     .build()
//!     .await?;
//! elector.start();
//! ```

pub mod elector;
pub mod error;
pub mod status;

pub use elector::{Callback, Elector, ElectorBuilder};
pub use error::ElectorError;
pub use status::{ClusterDetail, LeaderInfo, NodeStatus, parse_leader};

pub use foreman_lock::{AcquireOptions, LockConfig, LockDoc, LockError, LockStatus, MongoLocker};
