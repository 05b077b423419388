use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One probe outcome for one node. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MonitoringSample {
    pub id: i64,
    pub node_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub latency_ms: Option<i32>,
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub disk_pct: Option<f64>,
    pub connections: Option<i32>,
    pub error: Option<String>,
}

impl MonitoringSample {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
