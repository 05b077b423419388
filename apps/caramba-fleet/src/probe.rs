use caramba_db::models::monitoring::MonitoringSample;
use caramba_db::models::node::Node;
use caramba_db::{StateStore, StoreResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::panel::PanelConnector;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub node_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub latency_ms: Option<u32>,
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub disk_pct: Option<f64>,
    pub connections: Option<u32>,
    pub ok: bool,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn failed(node_id: i64, recorded_at: DateTime<Utc>, error: String) -> Self {
        Self {
            node_id,
            recorded_at,
            latency_ms: None,
            cpu_pct: None,
            mem_pct: None,
            disk_pct: None,
            connections: None,
            ok: false,
            error: Some(error),
        }
    }

    pub fn to_sample(&self) -> MonitoringSample {
        MonitoringSample {
            id: 0,
            node_id: self.node_id,
            recorded_at: self.recorded_at,
            latency_ms: self.latency_ms.map(|ms| ms.min(i32::MAX as u32) as i32),
            cpu_pct: self.cpu_pct,
            mem_pct: self.mem_pct,
            disk_pct: self.disk_pct,
            connections: self.connections.map(|c| c.min(i32::MAX as u32) as i32),
            error: self.error.clone(),
        }
    }
}

/// Concurrent poller over node panels. At most `workers` probes are in
/// flight; each is bounded by `timeout`.
pub struct HealthProbe {
    connector: Arc<dyn PanelConnector>,
    timeout: Duration,
    workers: usize,
    last_stamp: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl HealthProbe {
    pub fn new(connector: Arc<dyn PanelConnector>, timeout: Duration, workers: usize) -> Self {
        Self {
            connector,
            timeout,
            workers: workers.max(1),
            last_stamp: Mutex::new(HashMap::new()),
        }
    }

    pub async fn probe_all(&self, nodes: &[Node]) -> Vec<ProbeResult> {
        // Futures are built up front; a mapping closure here would make the
        // cycle future non-Send for spawned callers.
        let probes: Vec<_> = nodes.iter().map(|node| self.probe_node(node)).collect();
        stream::iter(probes)
            .buffer_unordered(self.workers)
            .collect()
            .await
    }

    pub async fn probe_node(&self, node: &Node) -> ProbeResult {
        let client = match self.connector.client_for(node) {
            Ok(client) => client,
            Err(e) => {
                warn!(node_id = node.id, node = %node.name, "Cannot build panel client: {}", e);
                return ProbeResult::failed(node.id, self.stamp(node.id), e.to_string());
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, client.get_status()).await;
        let latency_ms = started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
        let recorded_at = self.stamp(node.id);

        match outcome {
            Ok(Ok(status)) => {
                debug!(
                    node_id = node.id,
                    latency_ms,
                    cpu = status.cpu_pct,
                    mem = status.mem_pct,
                    connections = status.connections,
                    "Probe ok"
                );
                ProbeResult {
                    node_id: node.id,
                    recorded_at,
                    latency_ms: Some(latency_ms),
                    cpu_pct: Some(status.cpu_pct),
                    mem_pct: Some(status.mem_pct),
                    disk_pct: Some(status.disk_pct),
                    connections: Some(status.connections),
                    ok: true,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                warn!(node_id = node.id, node = %node.name, "Probe failed: {}", e);
                ProbeResult::failed(node.id, recorded_at, e.to_string())
            }
            Err(_) => {
                warn!(node_id = node.id, node = %node.name, "Probe timed out after {:?}", self.timeout);
                ProbeResult::failed(
                    node.id,
                    recorded_at,
                    format!("timed out after {}s", self.timeout.as_secs_f64()),
                )
            }
        }
    }

    /// Appends one sample per result. Called only after a full fan-in so a
    /// cancelled cycle leaves no samples behind.
    pub async fn record(&self, store: &dyn StateStore, results: &[ProbeResult]) -> StoreResult<()> {
        let samples: Vec<MonitoringSample> = results.iter().map(ProbeResult::to_sample).collect();
        store.append_samples(&samples).await
    }

    /// Wall-clock timestamp, nudged forward so a node's samples are strictly
    /// increasing even if the clock steps back.
    fn stamp(&self, node_id: i64) -> DateTime<Utc> {
        let mut stamps = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let stamp = match stamps.get(&node_id) {
            Some(last) if now <= *last => *last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        stamps.insert(node_id, stamp);
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::{PanelClient, PanelError};
    use async_trait::async_trait;
    use caramba_shared::panel::{Binding, BindingRef, BindingSpec, PanelStatus};

    struct SleepyPanel {
        delay: Duration,
    }

    #[async_trait]
    impl PanelClient for SleepyPanel {
        async fn login(&self) -> Result<(), PanelError> {
            Ok(())
        }
        async fn get_status(&self) -> Result<PanelStatus, PanelError> {
            tokio::time::sleep(self.delay).await;
            Ok(PanelStatus {
                cpu_pct: 12.0,
                mem_pct: 30.0,
                disk_pct: 40.0,
                connections: 3,
                uptime_secs: 100,
            })
        }
        async fn list_bindings(&self) -> Result<Vec<Binding>, PanelError> {
            Ok(Vec::new())
        }
        async fn create_binding(&self, spec: &BindingSpec) -> Result<Binding, PanelError> {
            Ok(Binding::from(spec))
        }
        async fn update_binding(&self, _: &BindingRef, _: &BindingSpec) -> Result<(), PanelError> {
            Ok(())
        }
        async fn delete_binding(&self, _: &BindingRef) -> Result<(), PanelError> {
            Ok(())
        }
    }

    /// Node 1 hangs, every other node answers at once.
    struct Connector;

    impl PanelConnector for Connector {
        fn client_for(&self, node: &Node) -> Result<Arc<dyn PanelClient>, PanelError> {
            let delay = if node.id == 1 {
                Duration::from_secs(3600)
            } else {
                Duration::from_millis(5)
            };
            Ok(Arc::new(SleepyPanel { delay }))
        }

        fn forget(&self, _: i64) {}
    }

    fn nodes(n: i64) -> Vec<Node> {
        (1..=n)
            .map(|id| {
                let mut node = Node::new(&format!("n{}", id), "https://x", "CRED", 10);
                node.id = id;
                node
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn slow_node_times_out_without_blocking_others() {
        let probe = HealthProbe::new(Arc::new(Connector), Duration::from_secs(10), 2);
        let mut results = probe.probe_all(&nodes(5)).await;
        results.sort_by_key(|r| r.node_id);

        assert_eq!(results.len(), 5);
        assert!(!results[0].ok);
        assert!(results[0].error.as_deref().unwrap_or("").contains("timed out"));
        assert!(results[1..].iter().all(|r| r.ok && r.connections == Some(3)));
    }

    #[test]
    fn stamps_are_strictly_increasing_per_node() {
        let probe = HealthProbe::new(Arc::new(Connector), Duration::from_secs(1), 1);
        let mut last = probe.stamp(7);
        for _ in 0..100 {
            let next = probe.stamp(7);
            assert!(next > last);
            last = next;
        }
    }
}
