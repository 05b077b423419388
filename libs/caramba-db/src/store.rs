use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::StoreResult;
use crate::models::assignment::{Assignment, AssignmentStatus};
use crate::models::groups::{NodeGroup, SelectionPolicy};
use crate::models::monitoring::MonitoringSample;
use crate::models::node::{Node, NodeStatus};
use crate::repositories::assignment_repo::AssignmentRepository;
use crate::repositories::node_repo::NodeRepository;
use crate::repositories::sample_repo::SampleRepository;

/// Persistence seam for fleet state.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Nodes
    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;
    async fn get_node(&self, id: i64) -> StoreResult<Option<Node>>;
    async fn create_node(&self, node: &Node) -> StoreResult<i64>;
    async fn update_node(&self, node: &Node) -> StoreResult<()>;
    /// Persists status, latency, uptime, last check and load. Never touches
    /// the maintenance flag.
    async fn update_node_health(&self, node: &Node) -> StoreResult<()>;
    async fn set_node_maintenance(&self, id: i64, on: bool, status: NodeStatus) -> StoreResult<()>;
    async fn delete_node(&self, id: i64) -> StoreResult<()>;
    /// Queues an administrator release; repeated requests collapse.
    async fn request_release(&self, node_id: i64) -> StoreResult<()>;
    /// Removes and returns every queued release, lowest node id first.
    async fn take_release_requests(&self) -> StoreResult<Vec<i64>>;

    // Groups
    async fn list_groups(&self) -> StoreResult<Vec<NodeGroup>>;
    async fn create_group(&self, name: &str, policy: SelectionPolicy) -> StoreResult<i64>;
    async fn set_group_policy(&self, group_id: i64, policy: SelectionPolicy) -> StoreResult<()>;
    async fn add_node_to_group(&self, node_id: i64, group_id: i64) -> StoreResult<()>;
    async fn remove_node_from_group(&self, node_id: i64, group_id: i64) -> StoreResult<()>;
    async fn delete_group(&self, group_id: i64) -> StoreResult<()>;

    // Assignments
    async fn get_assignment(&self, id: i64) -> StoreResult<Option<Assignment>>;
    async fn list_assignments_for_node(
        &self,
        node_id: i64,
        status: AssignmentStatus,
    ) -> StoreResult<Vec<Assignment>>;
    async fn list_assignments_by_status(&self, status: AssignmentStatus) -> StoreResult<Vec<Assignment>>;
    async fn count_live_assignments(&self, node_id: i64) -> StoreResult<i64>;
    /// Fails with `Conflict` when the subscriber already has a live
    /// assignment for the service.
    async fn create_assignment(&self, assignment: &Assignment) -> StoreResult<i64>;
    async fn compare_and_set_assignment_status(
        &self,
        id: i64,
        expected: AssignmentStatus,
        new: AssignmentStatus,
    ) -> StoreResult<bool>;
    async fn record_migration_failure(&self, id: i64, error: &str) -> StoreResult<bool>;
    /// Atomically retires a `migrating` assignment and inserts its active
    /// replacement.
    async fn complete_migration(&self, old_id: i64, replacement: &Assignment) -> StoreResult<Assignment>;

    // Monitoring samples
    async fn append_samples(&self, samples: &[MonitoringSample]) -> StoreResult<()>;
    async fn samples_between(
        &self,
        node_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<MonitoringSample>>;
    async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
    nodes: NodeRepository,
    assignments: AssignmentRepository,
    samples: SampleRepository,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            nodes: NodeRepository::new(pool.clone()),
            assignments: AssignmentRepository::new(pool.clone()),
            samples: SampleRepository::new(pool.clone()),
            pool,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        self.nodes.get_all_nodes().await
    }

    async fn get_node(&self, id: i64) -> StoreResult<Option<Node>> {
        self.nodes.get_node_by_id(id).await
    }

    async fn create_node(&self, node: &Node) -> StoreResult<i64> {
        self.nodes.create_node(node).await
    }

    async fn update_node(&self, node: &Node) -> StoreResult<()> {
        self.nodes.update_node(node).await
    }

    async fn update_node_health(&self, node: &Node) -> StoreResult<()> {
        self.nodes.update_health(node).await
    }

    async fn set_node_maintenance(&self, id: i64, on: bool, status: NodeStatus) -> StoreResult<()> {
        self.nodes.set_maintenance(id, on, status).await
    }

    async fn delete_node(&self, id: i64) -> StoreResult<()> {
        self.nodes.delete_node(id).await
    }

    async fn request_release(&self, node_id: i64) -> StoreResult<()> {
        self.nodes.request_release(node_id).await
    }

    async fn take_release_requests(&self) -> StoreResult<Vec<i64>> {
        self.nodes.take_release_requests().await
    }

    async fn list_groups(&self) -> StoreResult<Vec<NodeGroup>> {
        self.nodes.get_all_groups().await
    }

    async fn create_group(&self, name: &str, policy: SelectionPolicy) -> StoreResult<i64> {
        self.nodes.create_group(name, policy).await
    }

    async fn set_group_policy(&self, group_id: i64, policy: SelectionPolicy) -> StoreResult<()> {
        self.nodes.set_group_policy(group_id, policy).await
    }

    async fn add_node_to_group(&self, node_id: i64, group_id: i64) -> StoreResult<()> {
        self.nodes.add_node_to_group(node_id, group_id).await
    }

    async fn remove_node_from_group(&self, node_id: i64, group_id: i64) -> StoreResult<()> {
        self.nodes.remove_node_from_group(node_id, group_id).await
    }

    async fn delete_group(&self, group_id: i64) -> StoreResult<()> {
        self.nodes.delete_group(group_id).await
    }

    async fn get_assignment(&self, id: i64) -> StoreResult<Option<Assignment>> {
        self.assignments.get_by_id(id).await
    }

    async fn list_assignments_for_node(
        &self,
        node_id: i64,
        status: AssignmentStatus,
    ) -> StoreResult<Vec<Assignment>> {
        self.assignments.get_by_node(node_id, status).await
    }

    async fn list_assignments_by_status(&self, status: AssignmentStatus) -> StoreResult<Vec<Assignment>> {
        self.assignments.get_by_status(status).await
    }

    async fn count_live_assignments(&self, node_id: i64) -> StoreResult<i64> {
        self.assignments.count_live_on_node(node_id).await
    }

    async fn create_assignment(&self, assignment: &Assignment) -> StoreResult<i64> {
        self.assignments.create(assignment).await
    }

    async fn compare_and_set_assignment_status(
        &self,
        id: i64,
        expected: AssignmentStatus,
        new: AssignmentStatus,
    ) -> StoreResult<bool> {
        self.assignments.compare_and_set_status(id, expected, new).await
    }

    async fn record_migration_failure(&self, id: i64, error: &str) -> StoreResult<bool> {
        self.assignments.record_migration_failure(id, error).await
    }

    async fn complete_migration(&self, old_id: i64, replacement: &Assignment) -> StoreResult<Assignment> {
        self.assignments.complete_migration(old_id, replacement).await
    }

    async fn append_samples(&self, samples: &[MonitoringSample]) -> StoreResult<()> {
        self.samples.append(samples).await
    }

    async fn samples_between(
        &self,
        node_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<MonitoringSample>> {
        self.samples.get_range(node_id, from, to).await
    }

    async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.samples.purge_before(cutoff).await
    }
}
