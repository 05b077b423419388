//! Classification of probe results and derivation of node status.

use caramba_db::models::node::NodeStatus;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use crate::probe::ProbeResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning_pct: f64,
    pub critical_pct: f64,
    pub latency_ceiling_ms: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_pct: 70.0,
            critical_pct: 90.0,
            latency_ceiling_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
    Offline,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Warning => "warning",
            Health::Critical => "critical",
            Health::Offline => "offline",
        })
    }
}

impl Health {
    /// Critical or offline: counts towards a failover trip.
    pub fn is_bad(&self) -> bool {
        matches!(self, Health::Critical | Health::Offline)
    }
}

pub fn classify(result: &ProbeResult, capacity: i32, thresholds: &Thresholds) -> Health {
    if !result.ok {
        return Health::Offline;
    }

    let usage = [result.cpu_pct, result.mem_pct, result.disk_pct];
    let peak = usage.iter().flatten().copied().fold(0.0_f64, f64::max);
    let saturated = result
        .connections
        .is_some_and(|c| capacity > 0 && i64::from(c) >= i64::from(capacity));

    if peak >= thresholds.critical_pct || saturated {
        return Health::Critical;
    }
    let slow = result
        .latency_ms
        .is_some_and(|ms| ms > thresholds.latency_ceiling_ms);
    if peak >= thresholds.warning_pct || slow {
        return Health::Warning;
    }
    Health::Healthy
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub trip_cycles: u32,
    pub offline_cycles: u32,
    pub recovery_cycles: u32,
    pub uptime_window: usize,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            trip_cycles: 2,
            offline_cycles: 2,
            recovery_cycles: 2,
            uptime_window: 288,
        }
    }
}

/// Rolling per-node health history. The derived status depends only on the
/// recent classifications and the maintenance flag.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: NodeStatus,
    failures: u32,
    critical: u32,
    bad: u32,
    healthy: u32,
    window: VecDeque<bool>,
    last: Option<Health>,
}

impl HealthTracker {
    /// `initial` is the last persisted status; maintenance is not carried
    /// because it is an override, not a health state.
    pub fn new(initial: NodeStatus) -> Self {
        let status = match initial {
            NodeStatus::Maintenance => NodeStatus::Active,
            other => other,
        };
        Self {
            status,
            failures: 0,
            critical: 0,
            bad: 0,
            healthy: 0,
            window: VecDeque::new(),
            last: None,
        }
    }

    pub fn observe(&mut self, health: Health, policy: &HealthPolicy) -> NodeStatus {
        bump(&mut self.failures, health == Health::Offline);
        bump(&mut self.critical, health == Health::Critical);
        bump(&mut self.bad, health.is_bad());
        bump(&mut self.healthy, health == Health::Healthy);

        self.window.push_back(health != Health::Offline);
        while self.window.len() > policy.uptime_window.max(1) {
            self.window.pop_front();
        }
        self.last = Some(health);

        let candidate = if self.failures >= policy.offline_cycles {
            NodeStatus::Offline
        } else if self.critical >= policy.trip_cycles {
            NodeStatus::Overloaded
        } else if health != Health::Healthy {
            NodeStatus::Degraded
        } else {
            NodeStatus::Active
        };

        let sticky = matches!(self.status, NodeStatus::Offline | NodeStatus::Overloaded);
        let escalation = matches!(candidate, NodeStatus::Offline | NodeStatus::Overloaded);
        if !sticky || escalation || self.healthy >= policy.recovery_cycles {
            self.status = candidate;
        }
        self.status
    }

    pub fn status(&self, maintenance: bool) -> NodeStatus {
        if maintenance {
            NodeStatus::Maintenance
        } else {
            self.status
        }
    }

    pub fn last(&self) -> Option<Health> {
        self.last
    }

    /// Consecutive critical-or-offline cycles.
    pub fn consecutive_bad(&self) -> u32 {
        self.bad
    }

    pub fn consecutive_healthy(&self) -> u32 {
        self.healthy
    }

    pub fn uptime_pct(&self) -> f64 {
        if self.window.is_empty() {
            return 100.0;
        }
        let ok = self.window.iter().filter(|ok| **ok).count();
        ok as f64 / self.window.len() as f64 * 100.0
    }

    /// Forgets the streaks, keeping the uptime history.
    pub fn reset_streaks(&mut self, status: NodeStatus) {
        self.failures = 0;
        self.critical = 0;
        self.bad = 0;
        self.healthy = 0;
        self.status = status;
    }
}

fn bump(counter: &mut u32, hit: bool) {
    *counter = if hit { counter.saturating_add(1) } else { 0 };
}
