use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::models::assignment::{Assignment, AssignmentStatus};
use crate::models::groups::{NodeGroup, SelectionPolicy};
use crate::models::monitoring::MonitoringSample;
use crate::models::node::{Node, NodeStatus};
use crate::store::StateStore;

#[derive(Default)]
struct Tables {
    nodes: BTreeMap<i64, Node>,
    groups: BTreeMap<i64, NodeGroup>,
    assignments: BTreeMap<i64, Assignment>,
    samples: Vec<MonitoringSample>,
    releases: BTreeSet<i64>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_conflict(&self, a: &Assignment) -> bool {
        self.assignments
            .values()
            .any(|other| other.key() == a.key() && other.status.is_live())
    }
}

/// Process-local store with the same semantics as the PostgreSQL one.
/// Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    tables: Mutex<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every assignment, in id order.
    pub async fn all_assignments(&self) -> Vec<Assignment> {
        self.tables.lock().await.assignments.values().cloned().collect()
    }

    pub async fn sample_count(&self) -> usize {
        self.tables.lock().await.samples.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self.tables.lock().await.nodes.values().cloned().collect())
    }

    async fn get_node(&self, id: i64) -> StoreResult<Option<Node>> {
        Ok(self.tables.lock().await.nodes.get(&id).cloned())
    }

    async fn create_node(&self, node: &Node) -> StoreResult<i64> {
        let mut t = self.tables.lock().await;
        let id = t.next_id();
        let mut node = node.clone();
        node.id = id;
        t.nodes.insert(id, node);
        Ok(id)
    }

    async fn update_node(&self, node: &Node) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        match t.nodes.get_mut(&node.id) {
            Some(slot) => {
                *slot = node.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound { entity: "node", id: node.id }),
        }
    }

    async fn update_node_health(&self, node: &Node) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if let Some(slot) = t.nodes.get_mut(&node.id) {
            slot.status = node.status;
            slot.last_latency_ms = node.last_latency_ms;
            slot.uptime_pct = node.uptime_pct;
            slot.last_checked = node.last_checked;
            slot.current_load = node.current_load;
        }
        Ok(())
    }

    async fn set_node_maintenance(&self, id: i64, on: bool, status: NodeStatus) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let slot = t
            .nodes
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "node", id })?;
        slot.maintenance = on;
        slot.status = status;
        Ok(())
    }

    async fn request_release(&self, node_id: i64) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if !t.nodes.contains_key(&node_id) {
            return Err(StoreError::NotFound { entity: "node", id: node_id });
        }
        t.releases.insert(node_id);
        Ok(())
    }

    async fn take_release_requests(&self) -> StoreResult<Vec<i64>> {
        let mut t = self.tables.lock().await;
        Ok(std::mem::take(&mut t.releases).into_iter().collect())
    }

    async fn delete_node(&self, id: i64) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        t.nodes.remove(&id);
        t.releases.remove(&id);
        for group in t.groups.values_mut() {
            group.node_ids.retain(|n| *n != id);
        }
        t.samples.retain(|s| s.node_id != id);
        Ok(())
    }

    async fn list_groups(&self) -> StoreResult<Vec<NodeGroup>> {
        Ok(self.tables.lock().await.groups.values().cloned().collect())
    }

    async fn create_group(&self, name: &str, policy: SelectionPolicy) -> StoreResult<i64> {
        let mut t = self.tables.lock().await;
        if t.groups.values().any(|g| g.name == name) {
            return Err(StoreError::Conflict(format!("group {} already exists", name)));
        }
        let id = t.next_id();
        t.groups.insert(
            id,
            NodeGroup {
                id,
                name: name.to_string(),
                policy,
                node_ids: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn set_group_policy(&self, group_id: i64, policy: SelectionPolicy) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let group = t
            .groups
            .get_mut(&group_id)
            .ok_or(StoreError::NotFound { entity: "node group", id: group_id })?;
        group.policy = policy;
        Ok(())
    }

    async fn add_node_to_group(&self, node_id: i64, group_id: i64) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if !t.nodes.contains_key(&node_id) {
            return Err(StoreError::NotFound { entity: "node", id: node_id });
        }
        let group = t
            .groups
            .get_mut(&group_id)
            .ok_or(StoreError::NotFound { entity: "node group", id: group_id })?;
        if !group.node_ids.contains(&node_id) {
            group.node_ids.push(node_id);
            group.node_ids.sort_unstable();
        }
        Ok(())
    }

    async fn remove_node_from_group(&self, node_id: i64, group_id: i64) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if let Some(group) = t.groups.get_mut(&group_id) {
            group.node_ids.retain(|n| *n != node_id);
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: i64) -> StoreResult<()> {
        self.tables.lock().await.groups.remove(&group_id);
        Ok(())
    }

    async fn get_assignment(&self, id: i64) -> StoreResult<Option<Assignment>> {
        Ok(self.tables.lock().await.assignments.get(&id).cloned())
    }

    async fn list_assignments_for_node(
        &self,
        node_id: i64,
        status: AssignmentStatus,
    ) -> StoreResult<Vec<Assignment>> {
        Ok(self
            .tables
            .lock()
            .await
            .assignments
            .values()
            .filter(|a| a.node_id == node_id && a.status == status)
            .cloned()
            .collect())
    }

    async fn list_assignments_by_status(&self, status: AssignmentStatus) -> StoreResult<Vec<Assignment>> {
        Ok(self
            .tables
            .lock()
            .await
            .assignments
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect())
    }

    async fn count_live_assignments(&self, node_id: i64) -> StoreResult<i64> {
        Ok(self
            .tables
            .lock()
            .await
            .assignments
            .values()
            .filter(|a| a.node_id == node_id && a.status.is_live())
            .count() as i64)
    }

    async fn create_assignment(&self, assignment: &Assignment) -> StoreResult<i64> {
        let mut t = self.tables.lock().await;
        if assignment.status.is_live() && t.live_conflict(assignment) {
            return Err(StoreError::Conflict(format!(
                "subscriber {} already has a live assignment for service {}",
                assignment.subscriber_id, assignment.service_id
            )));
        }
        let id = t.next_id();
        let mut row = assignment.clone();
        row.id = id;
        t.assignments.insert(id, row);
        Ok(id)
    }

    async fn compare_and_set_assignment_status(
        &self,
        id: i64,
        expected: AssignmentStatus,
        new: AssignmentStatus,
    ) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let Some(row) = t.assignments.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != expected {
            return Ok(false);
        }
        let now = Utc::now();
        row.status = new;
        row.migration_started_at = (new == AssignmentStatus::Migrating).then_some(now);
        row.updated_at = now;
        Ok(true)
    }

    async fn record_migration_failure(&self, id: i64, error: &str) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let Some(row) = t.assignments.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != AssignmentStatus::Migrating {
            return Ok(false);
        }
        row.status = AssignmentStatus::Active;
        row.migration_attempts += 1;
        row.last_error = Some(error.to_string());
        row.migration_started_at = None;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_migration(&self, old_id: i64, replacement: &Assignment) -> StoreResult<Assignment> {
        let mut t = self.tables.lock().await;
        match t.assignments.get(&old_id) {
            Some(old) if old.status == AssignmentStatus::Migrating => {}
            _ => {
                return Err(StoreError::Conflict(format!(
                    "assignment {} is no longer migrating",
                    old_id
                )));
            }
        }

        let now = Utc::now();
        let id = t.next_id();
        let mut created = replacement.clone();
        created.id = id;
        created.status = AssignmentStatus::Active;
        created.migration_attempts = 0;
        created.last_error = None;
        created.migration_started_at = None;
        created.created_at = now;
        created.updated_at = now;

        if let Some(old) = t.assignments.get_mut(&old_id) {
            old.status = AssignmentStatus::Inactive;
            old.migration_started_at = None;
            old.updated_at = now;
        }
        t.assignments.insert(id, created.clone());
        Ok(created)
    }

    async fn append_samples(&self, samples: &[MonitoringSample]) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        for s in samples {
            let id = t.next_id();
            let mut row = s.clone();
            row.id = id;
            t.samples.push(row);
        }
        Ok(())
    }

    async fn samples_between(
        &self,
        node_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<MonitoringSample>> {
        let t = self.tables.lock().await;
        let mut out: Vec<MonitoringSample> = t
            .samples
            .iter()
            .filter(|s| s.node_id == node_id && s.recorded_at >= from && s.recorded_at < to)
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.recorded_at, s.id));
        Ok(out)
    }

    async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let before = t.samples.len();
        t.samples.retain(|s| s.recorded_at >= cutoff);
        Ok((before - t.samples.len()) as u64)
    }
}
