//! Per-node heartbeats and the cluster view assembled from them.

use chrono::{DateTime, Utc};
use mongodb::bson;
use serde::{Deserialize, Serialize};

/// One instance's heartbeat, upserted once per poll and auto-expired by the
/// status collection's TTL index. `_id` is the instance UUID, so each node
/// owns exactly one document and never touches another's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(rename = "_id")]
    pub id: String,
    /// Election key this node participates in.
    pub key: String,
    pub uuid: String,
    pub host: String,
    pub pid: i64,
    /// Configured lease duration in seconds.
    pub ttl: f64,
    /// Heartbeat time; drives the TTL expiry.
    pub timestamp: bson::DateTime,
    pub is_leader: bool,
    pub elector_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_created: Option<bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires: Option<bson::DateTime>,
}

/// Identity of the current leader as seen in the status collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub host: String,
    pub process_id: i64,
    pub uuid: String,
}

/// Snapshot of every live heartbeat for a key.
#[derive(Debug, Clone)]
pub struct ClusterDetail {
    /// Member heartbeats, newest first.
    pub member_detail: Vec<NodeStatus>,
    pub leader: Option<LeaderInfo>,
    /// When this view was assembled.
    pub timestamp: DateTime<Utc>,
}

/// Pick the leader from heartbeats ordered newest first.
///
/// The ordering matters: during a transition an older heartbeat may still
/// claim a leadership that a newer one has already given up.
pub fn parse_leader(members: &[NodeStatus]) -> Option<LeaderInfo> {
    members.iter().find(|m| m.is_leader).map(|m| LeaderInfo {
        host: m.host.clone(),
        process_id: m.pid,
        uuid: m.uuid.clone(),
    })
}
