//! Presence records as stored under `presence/{nodeId}`.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Idle,
    Online,
    Offline,
    Busy,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Busy => "busy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Client,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeRole::Client => "client",
            NodeRole::Worker => "worker",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetadata {
    pub os: String,
    pub platform: String,
    pub cpu_cores: u32,
    pub cpu_speed_mhz: u64,
    pub total_memory_bytes: u64,
    pub hostname: String,
    /// A working docker CLI; container tasks need it.
    #[serde(default)]
    pub docker: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rust: Option<String>,
}

/// Self-reported load, refreshed with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub cpu: f64,
    pub memory: f64,
    pub tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(rename = "type")]
    pub role: NodeRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "userId")]
    pub owner_identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metadata: Option<SystemMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeLoad>,
}

/// Lenient view of a presence record for membership counting.
///
/// Records written by older or foreign nodes may miss fields; a record
/// without `lastSeen`, `status` or `type` is never counted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceProbe {
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub role: Option<NodeRole>,
}

impl PresenceProbe {
    pub fn from_value(value: &serde_json::Value) -> Self {
        // a malformed field counts as missing
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Role and recency only; the status value is not consulted.
    pub fn is_live(&self, role: NodeRole, now: DateTime<Utc>, window: Duration) -> bool {
        match (self.status, self.last_seen, self.role) {
            (Some(_), Some(seen), Some(r)) => r == role && now - seen < window,
            _ => false,
        }
    }
}
