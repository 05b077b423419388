//! Per-node failover state machine and assignment migration.
//!
//! A node that stays critical or offline for `trip_cycles` probes is
//! drained: each active assignment is moved to a node picked by the
//! [`LoadBalancer`] from the failing node's groups. A migration either
//! commits completely (new binding live, replacement row active, old row
//! inactive) or is rolled back and retried on the next cycle.

use caramba_db::StateStore;
use caramba_db::models::assignment::{Assignment, AssignmentStatus};
use caramba_db::models::groups::{NodeGroup, SelectionPolicy};
use caramba_db::models::node::Node;
use caramba_shared::panel::{BindingRef, BindingSpec};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertSink, Severity};
use crate::balancer::LoadBalancer;
use crate::error::{FleetError, FleetResult};
use crate::health::Health;
use crate::panel::{self, PanelConnector};
use crate::registry::{NodeRegistry, ProbeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Migrating,
    Offline,
}

impl FailoverPhase {
    fn is_tripped(&self) -> bool {
        matches!(
            self,
            FailoverPhase::Unhealthy | FailoverPhase::Migrating | FailoverPhase::Offline
        )
    }
}

impl fmt::Display for FailoverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailoverPhase::Healthy => "healthy",
            FailoverPhase::Degraded => "degraded",
            FailoverPhase::Unhealthy => "unhealthy",
            FailoverPhase::Migrating => "migrating",
            FailoverPhase::Offline => "offline",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FailoverSettings {
    pub trip_cycles: u32,
    pub recovery_cycles: u32,
    pub panel_timeout: Duration,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            trip_cycles: 2,
            recovery_cycles: 2,
            panel_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    Migrated(Assignment),
    /// Assignment was no longer active on the source node.
    Skipped,
}

/// Result of one drain pass over a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub migrated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: i64,
}

pub struct FailoverOrchestrator {
    store: Arc<dyn StateStore>,
    registry: Arc<NodeRegistry>,
    balancer: Arc<LoadBalancer>,
    connector: Arc<dyn PanelConnector>,
    alerts: Arc<dyn AlertSink>,
    settings: FailoverSettings,
    phases: Mutex<HashMap<i64, FailoverPhase>>,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl FailoverOrchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<NodeRegistry>,
        balancer: Arc<LoadBalancer>,
        connector: Arc<dyn PanelConnector>,
        alerts: Arc<dyn AlertSink>,
        settings: FailoverSettings,
    ) -> Self {
        Self {
            store,
            registry,
            balancer,
            connector,
            alerts,
            settings,
            phases: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self, node_id: i64) -> FailoverPhase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn phases(&self) -> HashMap<i64, FailoverPhase> {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_phase(&self, node_id: i64, phase: FailoverPhase) -> FailoverPhase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id, phase)
            .unwrap_or_default()
    }

    fn migrating_nodes(&self) -> HashSet<i64> {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, phase)| **phase == FailoverPhase::Migrating)
            .map(|(id, _)| *id)
            .collect()
    }

    fn lock_for(&self, assignment_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.len() > 1024 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(assignment_id).or_default().clone()
    }

    /// Advances the node's phase after a probe and drains it if tripped.
    pub async fn evaluate(
        &self,
        outcome: &ProbeOutcome,
        cancel: &CancellationToken,
    ) -> FleetResult<FailoverPhase> {
        let node_id = outcome.node_id;
        let previous = self.phase(node_id);
        let active = self
            .store
            .list_assignments_for_node(node_id, AssignmentStatus::Active)
            .await?
            .len();

        // A node recovering mid-drain keeps draining until it is empty or an
        // administrator releases it. Assignments on an already drained node
        // were placed there after it came back and do not hold it.
        let drain_pending = previous == FailoverPhase::Migrating && active > 0;
        if previous.is_tripped()
            && outcome.consecutive_healthy >= self.settings.recovery_cycles
            && !drain_pending
        {
            self.alerts.notify(
                Severity::Info,
                &format!("Node {} recovered from {}", outcome.name, previous),
            );
            self.transition(outcome, previous, FailoverPhase::Healthy);
            return Ok(FailoverPhase::Healthy);
        }

        let tripped = previous.is_tripped() || outcome.consecutive_bad >= self.settings.trip_cycles;
        if !tripped {
            let next = if outcome.health == Health::Healthy {
                FailoverPhase::Healthy
            } else {
                FailoverPhase::Degraded
            };
            self.transition(outcome, previous, next);
            return Ok(next);
        }

        if active == 0 {
            let next = match previous {
                FailoverPhase::Migrating | FailoverPhase::Offline => FailoverPhase::Offline,
                _ => FailoverPhase::Unhealthy,
            };
            self.transition(outcome, previous, next);
            return Ok(next);
        }

        if previous != FailoverPhase::Migrating {
            self.alerts.notify(
                Severity::Critical,
                &format!(
                    "Node {} is {} ({} consecutive bad cycles), migrating {} assignment(s)",
                    outcome.name, outcome.status, outcome.consecutive_bad, active
                ),
            );
        }
        self.transition(outcome, previous, FailoverPhase::Migrating);

        let report = self.drain_node(node_id, cancel).await?;
        let next = if report.remaining == 0 {
            self.alerts.notify(
                Severity::Warning,
                &format!("Node {} drained and taken offline", outcome.name),
            );
            FailoverPhase::Offline
        } else {
            FailoverPhase::Migrating
        };
        self.set_phase(node_id, next);
        Ok(next)
    }

    fn transition(&self, outcome: &ProbeOutcome, from: FailoverPhase, to: FailoverPhase) {
        self.set_phase(outcome.node_id, to);
        if from != to {
            info!(node_id = outcome.node_id, node = %outcome.name, %from, %to, "Failover phase changed");
        }
    }

    /// Migrates every active assignment off the node, then corrects the
    /// node's load to the assignments left on it.
    pub async fn drain_node(
        &self,
        node_id: i64,
        cancel: &CancellationToken,
    ) -> FleetResult<DrainReport> {
        let assignments = self
            .store
            .list_assignments_for_node(node_id, AssignmentStatus::Active)
            .await?;

        let mut exclude = self.migrating_nodes();
        exclude.insert(node_id);

        let mut attempts = Vec::with_capacity(assignments.len());
        for assignment in &assignments {
            if cancel.is_cancelled() {
                break;
            }
            attempts.push(self.migrate_assignment(assignment.id, node_id, &exclude));
        }
        let results = join_all(attempts).await;

        let mut report = DrainReport::default();
        for result in results {
            match result {
                Ok(MigrationOutcome::Migrated(_)) => report.migrated += 1,
                Ok(MigrationOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(_) => report.failed += 1,
            }
        }

        match self.registry.recount_load(node_id).await {
            Ok(live) => report.remaining = live,
            Err(e) => {
                self.report_invariant(&e);
                if e.is_cycle_fatal() {
                    return Err(e);
                }
                report.remaining = self.store.count_live_assignments(node_id).await?;
            }
        }

        debug!(node_id, ?report, "Drain pass finished");
        Ok(report)
    }

    /// Moves one assignment off `from_node`. Serialized per assignment and
    /// idempotent: an assignment that is no longer active there is skipped.
    pub async fn migrate_assignment(
        &self,
        assignment_id: i64,
        from_node: i64,
        exclude: &HashSet<i64>,
    ) -> FleetResult<MigrationOutcome> {
        let lock = self.lock_for(assignment_id);
        let _guard = lock.lock().await;

        let Some(assignment) = self.store.get_assignment(assignment_id).await? else {
            return Ok(MigrationOutcome::Skipped);
        };
        if assignment.status != AssignmentStatus::Active || assignment.node_id != from_node {
            debug!(assignment_id, status = %assignment.status, "Assignment not active on node, skipping");
            return Ok(MigrationOutcome::Skipped);
        }
        if !self
            .store
            .compare_and_set_assignment_status(
                assignment_id,
                AssignmentStatus::Active,
                AssignmentStatus::Migrating,
            )
            .await?
        {
            return Ok(MigrationOutcome::Skipped);
        }

        match self.relocate(&assignment, exclude).await {
            Ok(replacement) => {
                let from = self.node_name(from_node).await;
                let to = self.node_name(replacement.node_id).await;
                info!(
                    assignment_id,
                    replacement_id = replacement.id,
                    from = %from,
                    to = %to,
                    "Assignment migrated"
                );
                self.alerts.notify(
                    Severity::Info,
                    &format!(
                        "Migration succeeded: subscriber {} service {} moved from {} to {}",
                        assignment.subscriber_id, assignment.service_id, from, to
                    ),
                );
                self.release_old_binding(&assignment).await;
                Ok(MigrationOutcome::Migrated(replacement))
            }
            Err(e) => {
                let reverted = self
                    .store
                    .record_migration_failure(assignment_id, &e.to_string())
                    .await?;
                warn!(assignment_id, reverted, "Migration failed: {}", e);
                self.alerts.notify(
                    Severity::Warning,
                    &format!(
                        "Migration failed for subscriber {} service {} (attempt {}): {}; retrying next cycle",
                        assignment.subscriber_id,
                        assignment.service_id,
                        assignment.migration_attempts + 1,
                        e
                    ),
                );
                self.report_invariant(&e);
                Err(e)
            }
        }
    }

    /// Steps 2-4 of a migration. On error nothing is left behind: the
    /// reservation is released and a created binding is deleted. A target
    /// whose panel login is unusable is skipped in favour of the next pick.
    async fn relocate(
        &self,
        assignment: &Assignment,
        exclude: &HashSet<i64>,
    ) -> FleetResult<Assignment> {
        let mut exclude = exclude.clone();
        loop {
            let target = self.reserve_target(assignment.node_id, &exclude).await?;

            let created = match self.create_binding(assignment, &target).await {
                Ok(binding) => binding,
                Err(e) if e.is_node_auth() => {
                    self.release_reservation(target.id).await;
                    warn!(target = target.id, node = %target.name, "Skipping migration target: {}", e);
                    exclude.insert(target.id);
                    continue;
                }
                Err(e) => {
                    self.release_reservation(target.id).await;
                    return Err(e);
                }
            };

            let replacement = assignment.replacement_on(target.id, &created.to_string());
            let commit = async {
                self.store
                    .complete_migration(assignment.id, &replacement)
                    .await
                    .map_err(FleetError::from)
            };
            return match self.registry.commit_reserved(target.id, commit).await {
                Ok(committed) => Ok(committed),
                Err(e) => {
                    self.delete_binding_quietly(&target, &created).await;
                    self.release_reservation(target.id).await;
                    Err(e)
                }
            };
        }
    }

    /// Picks a node from the source node's groups and takes one slot on it.
    /// A node that fills up between selection and reservation is excluded
    /// and selection is repeated.
    async fn reserve_target(&self, source: i64, exclude: &HashSet<i64>) -> FleetResult<Node> {
        let mut groups = self.registry.groups_of(source).await;
        if groups.is_empty() {
            let all = self.registry.snapshot().await;
            groups.push(NodeGroup {
                id: 0,
                name: "fleet".to_string(),
                policy: SelectionPolicy::default(),
                node_ids: all.iter().map(|n| n.id).collect(),
            });
        }

        let mut exclude = exclude.clone();
        for group in &groups {
            loop {
                let candidates = self.registry.nodes_by_id(&group.node_ids).await;
                let target = match self.balancer.select_node(group, &candidates, &exclude) {
                    Ok(node) => node,
                    Err(FleetError::CapacityExhausted { .. }) => break,
                    Err(e) => return Err(e),
                };
                if self.registry.try_reserve(target.id).await? {
                    debug!(target = target.id, group = %group.name, "Slot reserved");
                    return Ok(target);
                }
                exclude.insert(target.id);
            }
        }

        let source_name = self.node_name(source).await;
        Err(FleetError::CapacityExhausted {
            scope: format!("groups of node {}", source_name),
        })
    }

    async fn create_binding(&self, assignment: &Assignment, target: &Node) -> FleetResult<BindingRef> {
        let client = self
            .connector
            .client_for(target)
            .map_err(|e| FleetError::from_panel(target.id, e))?;
        let spec = binding_spec(assignment, target);
        let binding = panel::bounded(
            self.settings.panel_timeout,
            target.id,
            client.create_binding(&spec),
        )
        .await?;
        Ok(binding.binding_ref)
    }

    async fn delete_binding_quietly(&self, node: &Node, binding: &BindingRef) {
        let result = match self.connector.client_for(node) {
            Ok(client) => {
                panel::bounded(self.settings.panel_timeout, node.id, client.delete_binding(binding))
                    .await
            }
            Err(e) => Err(FleetError::from_panel(node.id, e)),
        };
        if let Err(e) = result {
            error!(node_id = node.id, %binding, "Failed to roll back binding: {}", e);
            self.alerts.notify(
                Severity::Critical,
                &format!(
                    "Rollback left binding {} on node {}: {}",
                    binding, node.name, e
                ),
            );
        }
    }

    async fn release_reservation(&self, node_id: i64) {
        if let Err(e) = self.registry.release_reservation(node_id).await {
            self.report_invariant(&e);
            warn!(node_id, "Failed to release reservation: {}", e);
        }
    }

    /// Step 5: the new binding is authoritative; failure here only leaves a
    /// stale binding behind on the old node.
    async fn release_old_binding(&self, old: &Assignment) {
        let Some(node) = self.registry.node(old.node_id).await else {
            return;
        };
        let result = match old.remote_binding_id.parse::<BindingRef>() {
            Ok(binding) => match self.connector.client_for(&node) {
                Ok(client) => {
                    panel::bounded(
                        self.settings.panel_timeout,
                        node.id,
                        client.delete_binding(&binding),
                    )
                    .await
                }
                Err(e) => Err(FleetError::from_panel(node.id, e)),
            },
            Err(e) => Err(FleetError::InvariantViolation(e.to_string())),
        };

        if let Err(e) = result {
            let partial = FleetError::MigrationPartialFailure {
                assignment_id: old.id,
                node_id: node.id,
                binding: old.remote_binding_id.clone(),
                message: e.to_string(),
            };
            warn!("{}", partial);
            self.alerts.notify(
                Severity::Warning,
                &format!("Manual cleanup needed on node {}: {}", node.name, partial),
            );
        }
    }

    fn report_invariant(&self, err: &FleetError) {
        if let FleetError::InvariantViolation(message) = err {
            error!("Invariant violation: {}", message);
            self.alerts
                .notify(Severity::Critical, &format!("Invariant violation: {}", message));
        }
    }

    async fn node_name(&self, node_id: i64) -> String {
        self.registry
            .node(node_id)
            .await
            .map(|n| n.name)
            .unwrap_or_else(|| format!("#{}", node_id))
    }

    /// Returns assignments stuck in `migrating` longer than `timeout` to
    /// `active`. Assignments whose migration is still running are skipped.
    pub async fn reclaim_stuck(&self, timeout: chrono::Duration) -> FleetResult<usize> {
        let cutoff = Utc::now() - timeout;
        let migrating = self
            .store
            .list_assignments_by_status(AssignmentStatus::Migrating)
            .await?;

        let mut reclaimed = 0;
        for assignment in migrating {
            let stale = assignment
                .migration_started_at
                .map_or(true, |started| started < cutoff);
            if !stale {
                continue;
            }
            let lock = self.lock_for(assignment.id);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            if self
                .store
                .record_migration_failure(assignment.id, "migration timed out")
                .await?
            {
                reclaimed += 1;
                warn!(assignment_id = assignment.id, "Reclaimed stuck migration");
                self.alerts.notify(
                    Severity::Warning,
                    &format!(
                        "Migration of subscriber {} service {} timed out and was reverted",
                        assignment.subscriber_id, assignment.service_id
                    ),
                );
            }
        }
        Ok(reclaimed)
    }

    /// Administrator override: leave any failover phase and mark the node
    /// healthy again.
    pub async fn release(&self, node_id: i64) -> FleetResult<()> {
        let name = self.node_name(node_id).await;
        self.registry.reset_health(node_id).await?;
        let previous = self.set_phase(node_id, FailoverPhase::Healthy);
        info!(node_id, %previous, "Node released by administrator");
        self.alerts.notify(
            Severity::Info,
            &format!("Node {} released by administrator (was {})", name, previous),
        );
        Ok(())
    }
}

fn binding_spec(assignment: &Assignment, target: &Node) -> BindingSpec {
    BindingSpec {
        inbound_id: target.inbound_id,
        client_id: uuid::Uuid::new_v4().to_string(),
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn binding_spec_carries_limits() {
        let mut a = Assignment::new(10, 2, 1, "1:old", 5_000, Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()));
        a.id = 77;
        let mut target = Node::new("b", "https://b", "CRED", 10);
        target.inbound_id = 4;

        let spec = binding_spec(&a, &target);
        assert_eq!(spec.inbound_id, 4);
        assert_eq!(spec.traffic_limit_bytes, 5_000);
        assert_eq!(spec.expiry_time_ms, 1_700_000_000_000);
        assert_eq!(spec.email, "s10-v2-a77");
        assert_ne!(spec.client_id, binding_spec(&a, &target).client_id);
    }

    #[test]
    fn tripped_phases() {
        assert!(!FailoverPhase::Healthy.is_tripped());
        assert!(!FailoverPhase::Degraded.is_tripped());
        assert!(FailoverPhase::Unhealthy.is_tripped());
        assert!(FailoverPhase::Migrating.is_tripped());
        assert!(FailoverPhase::Offline.is_tripped());
    }
}
