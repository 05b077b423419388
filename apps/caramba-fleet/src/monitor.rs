use caramba_db::StateStore;
use caramba_db::models::node::NodeStatus;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertSink, Severity};
use crate::balancer::LoadBalancer;
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::failover::{FailoverOrchestrator, FailoverSettings};
use crate::health::HealthPolicy;
use crate::panel::PanelConnector;
use crate::probe::{HealthProbe, ProbeResult};
use crate::registry::{NodeRegistry, ProbeLane, ProbeOutcome};
use crate::sync::{Reconciler, SyncReport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub lane: String,
    pub probed: usize,
    pub failed: usize,
    pub transitions: usize,
    pub cancelled: bool,
}

/// Runs single cycles of every kind; the scheduler decides when.
pub struct FleetMonitor {
    store: Arc<dyn StateStore>,
    registry: Arc<NodeRegistry>,
    probe: HealthProbe,
    failover: Arc<FailoverOrchestrator>,
    reconciler: Reconciler,
    connector: Arc<dyn PanelConnector>,
    alerts: Arc<dyn AlertSink>,
    retention: chrono::Duration,
    migration_timeout: chrono::Duration,
}

impl FleetMonitor {
    pub fn new(
        config: &FleetConfig,
        store: Arc<dyn StateStore>,
        connector: Arc<dyn PanelConnector>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let policy = HealthPolicy {
            trip_cycles: config.trip_cycles,
            offline_cycles: config.offline_cycles,
            recovery_cycles: config.recovery_cycles,
            uptime_window: config.uptime_window,
        };
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            config.thresholds(),
            policy,
            config.group_policies.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(config.rng_seed));
        let failover = Arc::new(FailoverOrchestrator::new(
            store.clone(),
            registry.clone(),
            balancer,
            connector.clone(),
            alerts.clone(),
            FailoverSettings {
                trip_cycles: config.trip_cycles,
                recovery_cycles: config.recovery_cycles,
                panel_timeout: config.panel_timeout(),
            },
        ));
        let reconciler = Reconciler::new(
            store.clone(),
            registry.clone(),
            connector.clone(),
            alerts.clone(),
            config.panel_timeout(),
        );
        let probe = HealthProbe::new(connector.clone(), config.probe_timeout(), config.worker_pool_size);

        Self {
            store,
            registry,
            probe,
            failover,
            reconciler,
            connector,
            alerts,
            retention: config.retention(),
            migration_timeout: config.migration_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn failover(&self) -> &Arc<FailoverOrchestrator> {
        &self.failover
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Loads the registry from the store. Panel sessions of nodes that were
    /// removed or moved to another address are dropped.
    pub async fn load(&self) -> FleetResult<()> {
        for node_id in self.registry.reload().await? {
            self.connector.forget(node_id);
        }
        Ok(())
    }

    /// Applies administrator changes recorded in the store by another
    /// process: maintenance flags of the lane's nodes and queued releases.
    async fn apply_overrides(&self, lane: &ProbeLane) -> FleetResult<()> {
        self.registry.refresh_overrides(&lane.node_ids).await?;
        for node_id in self.store.take_release_requests().await? {
            match self.failover.release(node_id).await {
                Ok(()) => {}
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => warn!(node_id, "Could not release node: {}", e),
            }
        }
        Ok(())
    }

    /// Probe, classify and fail over one lane. Cancellation during probing
    /// discards the results; migrations already started run to completion.
    pub async fn run_probe_cycle(
        &self,
        lane: &ProbeLane,
        cancel: &CancellationToken,
    ) -> FleetResult<CycleReport> {
        let mut report = CycleReport {
            lane: lane.name.clone(),
            ..CycleReport::default()
        };
        self.apply_overrides(lane).await?;
        let targets = self.registry.probe_targets(lane).await;
        if targets.is_empty() {
            return Ok(report);
        }

        let results = tokio::select! {
            _ = cancel.cancelled() => {
                info!(lane = %lane.name, "Probe cycle cancelled, discarding results");
                report.cancelled = true;
                return Ok(report);
            }
            results = self.probe.probe_all(&targets) => results,
        };
        report.probed = results.len();
        report.failed = results.iter().filter(|r| !r.ok).count();

        self.probe.record(self.store.as_ref(), &results).await?;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in &results {
            match self.registry.apply_probe(result).await {
                Ok(outcome) => {
                    if outcome.changed() {
                        report.transitions += 1;
                        self.alert_transition(&outcome, result);
                    }
                    outcomes.push(outcome);
                }
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => warn!(node_id = result.node_id, "Could not apply probe: {}", e),
            }
        }

        for outcome in &outcomes {
            match self.failover.evaluate(outcome, cancel).await {
                Ok(phase) => debug!(node_id = outcome.node_id, %phase, "Failover evaluated"),
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => warn!(node_id = outcome.node_id, "Failover evaluation failed: {}", e),
            }
        }

        for (node, load, capacity) in self.registry.over_capacity().await {
            let violation = FleetError::InvariantViolation(format!(
                "node {} holds {} bindings over capacity {}",
                node.name, load, capacity
            ));
            error!("{}", violation);
            self.alerts.notify(Severity::Critical, &violation.to_string());
        }

        info!(
            lane = %report.lane,
            probed = report.probed,
            failed = report.failed,
            transitions = report.transitions,
            "Probe cycle finished"
        );
        Ok(report)
    }

    fn alert_transition(&self, outcome: &ProbeOutcome, result: &ProbeResult) {
        let severity = match outcome.status {
            NodeStatus::Active => Severity::Info,
            NodeStatus::Degraded | NodeStatus::Maintenance => Severity::Warning,
            _ => Severity::Critical,
        };
        let detail = match &result.error {
            Some(error) => format!(" (probe failed: {})", error),
            None => format!(" ({})", outcome.health),
        };
        self.alerts.notify(
            severity,
            &format!(
                "Node {}: {} -> {}{}",
                outcome.name, outcome.previous, outcome.status, detail
            ),
        );
    }

    /// One probe cycle over every lane, lanes in parallel.
    pub async fn probe_all_lanes(&self, cancel: &CancellationToken) -> FleetResult<Vec<CycleReport>> {
        let lanes = self.registry.probe_lanes().await;
        let cycles: Vec<_> = lanes.iter().map(|lane| self.run_probe_cycle(lane, cancel)).collect();
        futures::future::join_all(cycles).await.into_iter().collect()
    }

    pub async fn run_cleanup(&self) -> FleetResult<u64> {
        let cutoff = Utc::now() - self.retention;
        let purged = self.store.purge_samples_before(cutoff).await?;
        info!("Purged {} monitoring samples older than {}", purged, cutoff);
        Ok(purged)
    }

    pub async fn run_reconcile(&self) -> FleetResult<SyncReport> {
        self.reconciler.run().await
    }

    pub async fn run_watchdog(&self) -> FleetResult<usize> {
        self.failover.reclaim_stuck(self.migration_timeout).await
    }
}
