use caramba_db::StateStore;
use caramba_db::models::assignment::{Assignment, AssignmentStatus};
use caramba_db::models::node::{Node, NodeStatus};
use caramba_shared::panel::{BindingRef, BindingSpec};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::alerts::{AlertSink, Severity};
use crate::error::{FleetError, FleetResult};
use crate::panel::{self, PanelConnector};
use crate::registry::NodeRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub nodes_synced: usize,
    pub nodes_skipped: usize,
    pub bindings_restored: usize,
    pub orphaned_bindings: usize,
    pub loads_corrected: usize,
}

/// Full-state sync between the store and the panels: every live assignment
/// must have its binding, and every node's load must match its live
/// assignments.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    registry: Arc<NodeRegistry>,
    connector: Arc<dyn PanelConnector>,
    alerts: Arc<dyn AlertSink>,
    panel_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<NodeRegistry>,
        connector: Arc<dyn PanelConnector>,
        alerts: Arc<dyn AlertSink>,
        panel_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            connector,
            alerts,
            panel_timeout,
        }
    }

    pub async fn run(&self) -> FleetResult<SyncReport> {
        for node_id in self.registry.reload().await? {
            self.connector.forget(node_id);
        }

        let mut report = SyncReport::default();
        for node in self.registry.snapshot().await {
            // Slots reserved by in-flight migrations survive the recount.
            self.registry.recount_load(node.id).await?;
            if let Some(current) = self.registry.node(node.id).await {
                if current.current_load != node.current_load {
                    report.loads_corrected += 1;
                }
            }
            let live = self.live_assignments(node.id).await?;

            if node.maintenance || node.status == NodeStatus::Offline {
                report.nodes_skipped += 1;
                continue;
            }
            match self.sync_node(&node, &live).await {
                Ok((restored, orphaned)) => {
                    report.nodes_synced += 1;
                    report.bindings_restored += restored;
                    report.orphaned_bindings += orphaned;
                }
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => {
                    report.nodes_skipped += 1;
                    warn!(node_id = node.id, node = %node.name, "Binding sync failed: {}", e);
                }
            }
        }

        info!(
            synced = report.nodes_synced,
            skipped = report.nodes_skipped,
            restored = report.bindings_restored,
            orphaned = report.orphaned_bindings,
            loads_corrected = report.loads_corrected,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn live_assignments(&self, node_id: i64) -> FleetResult<Vec<Assignment>> {
        let mut live = self
            .store
            .list_assignments_for_node(node_id, AssignmentStatus::Active)
            .await?;
        live.extend(
            self.store
                .list_assignments_for_node(node_id, AssignmentStatus::Migrating)
                .await?,
        );
        Ok(live)
    }

    /// Returns (restored, orphaned) binding counts for one node.
    async fn sync_node(&self, node: &Node, live: &[Assignment]) -> FleetResult<(usize, usize)> {
        let client = self
            .connector
            .client_for(node)
            .map_err(|e| FleetError::from_panel(node.id, e))?;
        let present: HashSet<BindingRef> =
            panel::bounded(self.panel_timeout, node.id, client.list_bindings())
                .await?
                .into_iter()
                .map(|b| b.binding_ref)
                .collect();

        let mut expected = HashSet::new();
        let mut restored = 0;
        for assignment in live.iter().filter(|a| a.status == AssignmentStatus::Active) {
            let binding = match assignment.remote_binding_id.parse::<BindingRef>() {
                Ok(binding) => binding,
                Err(e) => {
                    warn!(assignment_id = assignment.id, "Unusable binding reference: {}", e);
                    continue;
                }
            };
            expected.insert(binding.clone());
            if present.contains(&binding) {
                continue;
            }

            let spec = BindingSpec {
                inbound_id: binding.inbound_id,
                client_id: binding.client_id.clone(),
                email: format!(
                    "s{}-v{}-a{}",
                    assignment.subscriber_id, assignment.service_id, assignment.id
                ),
                traffic_limit_bytes: assignment.traffic_limit_bytes,
                expiry_time_ms: assignment
                    .expires_at
                    .map(|t| t.timestamp_millis())
                    .unwrap_or(0),
                enable: true,
            };
            match panel::bounded(self.panel_timeout, node.id, client.create_binding(&spec)).await {
                Ok(_) => {
                    restored += 1;
                    info!(assignment_id = assignment.id, node = %node.name, %binding, "Restored missing binding");
                }
                Err(e) => warn!(assignment_id = assignment.id, "Could not restore binding: {}", e),
            }
        }

        // Bindings of assignments mid-migration are neither missing nor orphaned.
        for assignment in live.iter().filter(|a| a.status == AssignmentStatus::Migrating) {
            if let Ok(binding) = assignment.remote_binding_id.parse::<BindingRef>() {
                expected.insert(binding);
            }
        }

        let orphaned = present.difference(&expected).count();
        if restored > 0 {
            self.alerts.notify(
                Severity::Warning,
                &format!("Restored {} missing binding(s) on node {}", restored, node.name),
            );
        }
        if orphaned > 0 {
            warn!(node = %node.name, orphaned, "Panel holds bindings without an assignment");
        }
        Ok((restored, orphaned))
    }
}
