use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Active,
    Degraded,
    Overloaded,
    Maintenance,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Overloaded => "overloaded",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(NodeStatus::Active),
            "degraded" => Ok(NodeStatus::Degraded),
            "overloaded" => Ok(NodeStatus::Overloaded),
            "maintenance" => Ok(NodeStatus::Maintenance),
            "offline" => Ok(NodeStatus::Offline),
            other => Err(ParseEnumError::new("node status", other)),
        }
    }
}

impl TryFrom<String> for NodeStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A remote VPN edge server running a management panel.
#[derive(Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub id: i64,
    pub name: String,
    /// Panel base URL, e.g. `https://de1.example.net:2053/secret`.
    pub address: String,
    /// Opaque pointer to the panel login; never logged or serialized.
    #[serde(skip_serializing, default)]
    pub credentials_ref: String,
    /// Inbound that receives new bindings on this node.
    pub inbound_id: i64,
    pub capacity: i32,
    pub current_load: i32,
    pub weight: i32,
    #[sqlx(try_from = "String")]
    pub status: NodeStatus,
    pub maintenance: bool,
    pub last_latency_ms: Option<i32>,
    pub uptime_pct: f64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(name: &str, address: &str, credentials_ref: &str, capacity: i32) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            address: address.to_string(),
            credentials_ref: credentials_ref.to_string(),
            inbound_id: 1,
            capacity,
            current_load: 0,
            weight: 1,
            status: NodeStatus::Active,
            maintenance: false,
            last_latency_ms: None,
            uptime_pct: 100.0,
            last_checked: None,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.capacity
    }

    /// Eligible as a target for new or migrated bindings.
    pub fn is_selectable(&self) -> bool {
        self.status == NodeStatus::Active && self.has_capacity()
    }

    /// Weight clamped to the 1..=100 range used for selection.
    pub fn effective_weight(&self) -> u32 {
        self.weight.clamp(1, 100) as u32
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("credentials_ref", &"<redacted>")
            .field("inbound_id", &self.inbound_id)
            .field("capacity", &self.capacity)
            .field("current_load", &self.current_load)
            .field("weight", &self.weight)
            .field("status", &self.status)
            .field("maintenance", &self.maintenance)
            .field("last_latency_ms", &self.last_latency_ms)
            .field("uptime_pct", &self.uptime_pct)
            .field("last_checked", &self.last_checked)
            .finish()
    }
}
