use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Migrating,
    Inactive,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Migrating => "migrating",
            AssignmentStatus::Inactive => "inactive",
        }
    }

    /// Still occupies a binding on its node.
    pub fn is_live(&self) -> bool {
        matches!(self, AssignmentStatus::Active | AssignmentStatus::Migrating)
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AssignmentStatus::Active),
            "migrating" => Ok(AssignmentStatus::Migrating),
            "inactive" => Ok(AssignmentStatus::Inactive),
            other => Err(ParseEnumError::new("assignment status", other)),
        }
    }
}

impl TryFrom<String> for AssignmentStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Durable mapping of one subscriber's service to a node and a panel binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Assignment {
    pub id: i64,
    pub subscriber_id: i64,
    pub service_id: i64,
    pub node_id: i64,
    /// `<inbound_id>:<client_id>` on the node's panel.
    pub remote_binding_id: String,
    pub traffic_limit_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: AssignmentStatus,
    pub migration_attempts: i32,
    pub last_error: Option<String>,
    pub migration_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(
        subscriber_id: i64,
        service_id: i64,
        node_id: i64,
        remote_binding_id: &str,
        traffic_limit_bytes: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            subscriber_id,
            service_id,
            node_id,
            remote_binding_id: remote_binding_id.to_string(),
            traffic_limit_bytes,
            expires_at,
            status: AssignmentStatus::Active,
            migration_attempts: 0,
            last_error: None,
            migration_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fresh active row carrying the same subscriber and limits, bound to
    /// another node.
    pub fn replacement_on(&self, node_id: i64, remote_binding_id: &str) -> Self {
        Self::new(
            self.subscriber_id,
            self.service_id,
            node_id,
            remote_binding_id,
            self.traffic_limit_bytes,
            self.expires_at,
        )
    }

    pub fn key(&self) -> (i64, i64) {
        (self.subscriber_id, self.service_id)
    }
}
