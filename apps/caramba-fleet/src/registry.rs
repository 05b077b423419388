use caramba_db::StateStore;
use caramba_db::models::groups::{NodeGroup, SelectionPolicy};
use caramba_db::models::node::{Node, NodeStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{FleetError, FleetResult};
use crate::health::{Health, HealthPolicy, HealthTracker, Thresholds, classify};
use crate::probe::ProbeResult;

struct NodeState {
    node: Node,
    tracker: HealthTracker,
    /// Slots taken by migrations whose replacement is not committed yet.
    /// Counted in `node.current_load`.
    reserved: i32,
}

/// One node's mutable state. All load and status changes go through the
/// entry lock; no lock spans more than one node.
struct NodeEntry {
    state: Mutex<NodeState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub node_id: i64,
    pub name: String,
    pub health: Health,
    pub previous: NodeStatus,
    pub status: NodeStatus,
    pub consecutive_bad: u32,
    pub consecutive_healthy: u32,
}

impl ProbeOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.status
    }
}

/// Nodes probed together: a group's members, minus nodes already covered
/// by a lower-id group. `group_id` is `None` for the ungrouped lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeLane {
    pub group_id: Option<i64>,
    pub name: String,
    pub node_ids: Vec<i64>,
}

/// In-memory catalog of nodes and groups, written through to the store.
pub struct NodeRegistry {
    store: Arc<dyn StateStore>,
    nodes: RwLock<BTreeMap<i64, Arc<NodeEntry>>>,
    groups: RwLock<Vec<NodeGroup>>,
    thresholds: Thresholds,
    policy: HealthPolicy,
    group_policies: HashMap<String, SelectionPolicy>,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        thresholds: Thresholds,
        policy: HealthPolicy,
        group_policies: HashMap<String, SelectionPolicy>,
    ) -> Self {
        Self {
            store,
            nodes: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(Vec::new()),
            thresholds,
            policy,
            group_policies,
        }
    }

    pub fn health_policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Re-reads nodes and groups. Health history of known nodes survives.
    /// Returns the ids of nodes that were removed or changed address, whose
    /// cached panel clients are stale.
    pub async fn reload(&self) -> FleetResult<Vec<i64>> {
        let stored_nodes = self.store.list_nodes().await?;
        let mut stored_groups = self.store.list_groups().await?;
        for group in &mut stored_groups {
            if let Some(policy) = self.group_policies.get(&group.name) {
                group.policy = *policy;
            }
            group.node_ids.sort_unstable();
        }
        stored_groups.sort_by_key(|g| g.id);

        let mut nodes = self.nodes.write().await;
        let mut next = BTreeMap::new();
        let mut stale = Vec::new();
        for node in stored_nodes {
            let entry = match nodes.remove(&node.id) {
                Some(existing) => {
                    let mut state = existing.state.lock().await;
                    if state.node.address != node.address {
                        stale.push(node.id);
                    }
                    state.node = node;
                    let status = state.tracker.status(state.node.maintenance);
                    state.node.status = status;
                    drop(state);
                    existing
                }
                None => {
                    let tracker = HealthTracker::new(node.status);
                    Arc::new(NodeEntry {
                        state: Mutex::new(NodeState {
                            node,
                            tracker,
                            reserved: 0,
                        }),
                    })
                }
            };
            let id = entry.state.lock().await.node.id;
            next.insert(id, entry);
        }
        for removed in nodes.keys() {
            info!(node_id = removed, "Node removed from registry");
            stale.push(*removed);
        }
        stale.sort_unstable();
        *nodes = next;
        let count = nodes.len();
        drop(nodes);

        let group_count = stored_groups.len();
        *self.groups.write().await = stored_groups;
        debug!("Registry loaded {} nodes in {} groups", count, group_count);
        Ok(stale)
    }

    /// Picks up maintenance flags set from outside this process, e.g. by the
    /// CLI, for the given nodes.
    pub async fn refresh_overrides(&self, node_ids: &[i64]) -> FleetResult<()> {
        for node_id in node_ids {
            let Some(stored) = self.store.get_node(*node_id).await? else {
                continue;
            };
            let Ok(entry) = self.entry(*node_id).await else {
                continue;
            };
            let mut state = entry.state.lock().await;
            if state.node.maintenance != stored.maintenance {
                info!(node_id, maintenance = stored.maintenance, "Maintenance flag changed in store");
                state.node.maintenance = stored.maintenance;
                state.node.status = state.tracker.status(stored.maintenance);
                self.store.update_node_health(&state.node).await?;
            }
        }
        Ok(())
    }

    async fn entry(&self, node_id: i64) -> FleetResult<Arc<NodeEntry>> {
        self.nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(FleetError::UnknownNode(node_id))
    }

    async fn entries(&self) -> Vec<Arc<NodeEntry>> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn node(&self, node_id: i64) -> Option<Node> {
        let entry = self.entry(node_id).await.ok()?;
        let state = entry.state.lock().await;
        Some(state.node.clone())
    }

    /// Point-in-time copy of every node, ordered by id.
    pub async fn snapshot(&self) -> Vec<Node> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            out.push(entry.state.lock().await.node.clone());
        }
        out
    }

    pub async fn nodes_by_id(&self, ids: &[i64]) -> Vec<Node> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.node(*id).await {
                out.push(node);
            }
        }
        out
    }

    pub async fn groups(&self) -> Vec<NodeGroup> {
        self.groups.read().await.clone()
    }

    /// Groups containing the node, lowest id first.
    pub async fn groups_of(&self, node_id: i64) -> Vec<NodeGroup> {
        self.groups
            .read()
            .await
            .iter()
            .filter(|g| g.contains(node_id))
            .cloned()
            .collect()
    }

    pub async fn probe_lanes(&self) -> Vec<ProbeLane> {
        let node_ids: Vec<i64> = self.nodes.read().await.keys().copied().collect();
        let groups = self.groups.read().await;

        let mut covered = HashSet::new();
        let mut lanes = Vec::new();
        for group in groups.iter() {
            let members: Vec<i64> = node_ids
                .iter()
                .copied()
                .filter(|id| group.contains(*id) && covered.insert(*id))
                .collect();
            if !members.is_empty() {
                lanes.push(ProbeLane {
                    group_id: Some(group.id),
                    name: group.name.clone(),
                    node_ids: members,
                });
            }
        }

        let ungrouped: Vec<i64> = node_ids
            .into_iter()
            .filter(|id| !covered.contains(id))
            .collect();
        if !ungrouped.is_empty() {
            lanes.push(ProbeLane {
                group_id: None,
                name: "ungrouped".to_string(),
                node_ids: ungrouped,
            });
        }
        lanes
    }

    /// Lane members that should be probed this cycle.
    pub async fn probe_targets(&self, lane: &ProbeLane) -> Vec<Node> {
        self.nodes_by_id(&lane.node_ids)
            .await
            .into_iter()
            .filter(|n| !n.maintenance)
            .collect()
    }

    pub async fn apply_probe(&self, result: &ProbeResult) -> FleetResult<ProbeOutcome> {
        let entry = self.entry(result.node_id).await?;
        let mut state = entry.state.lock().await;

        let health = classify(result, state.node.capacity, &self.thresholds);
        state.tracker.observe(health, &self.policy);

        let previous = state.node.status;
        let status = state.tracker.status(state.node.maintenance);
        state.node.status = status;
        state.node.last_checked = Some(result.recorded_at);
        state.node.uptime_pct = state.tracker.uptime_pct();
        if let Some(ms) = result.latency_ms.filter(|_| result.ok) {
            state.node.last_latency_ms = Some(ms.min(i32::MAX as u32) as i32);
        }
        self.store.update_node_health(&state.node).await?;

        Ok(ProbeOutcome {
            node_id: state.node.id,
            name: state.node.name.clone(),
            health,
            previous,
            status,
            consecutive_bad: state.tracker.consecutive_bad(),
            consecutive_healthy: state.tracker.consecutive_healthy(),
        })
    }

    /// Takes one slot on the node if it is still selectable.
    pub async fn try_reserve(&self, node_id: i64) -> FleetResult<bool> {
        let entry = self.entry(node_id).await?;
        let mut state = entry.state.lock().await;
        if !state.node.is_selectable() {
            return Ok(false);
        }
        state.node.current_load += 1;
        state.reserved += 1;
        self.store.update_node_health(&state.node).await?;
        Ok(true)
    }

    /// Gives back a slot taken by [`try_reserve`](Self::try_reserve).
    pub async fn release_reservation(&self, node_id: i64) -> FleetResult<()> {
        let entry = self.entry(node_id).await?;
        let mut state = entry.state.lock().await;
        if state.reserved == 0 {
            return Err(FleetError::InvariantViolation(format!(
                "node {} released a slot it never reserved",
                state.node.name
            )));
        }
        state.reserved -= 1;
        state.node.current_load = (state.node.current_load - 1).max(state.reserved);
        self.store.update_node_health(&state.node).await?;
        Ok(())
    }

    /// Runs `commit` under the node's entry lock; on success the reserved
    /// slot becomes a held one. Load recounts cannot interleave with it.
    pub async fn commit_reserved<T, F>(&self, node_id: i64, commit: F) -> FleetResult<T>
    where
        F: Future<Output = FleetResult<T>>,
    {
        let entry = self.entry(node_id).await?;
        let mut state = entry.state.lock().await;
        let committed = commit.await?;
        state.reserved = (state.reserved - 1).max(0);
        Ok(committed)
    }

    pub async fn adjust_load(&self, node_id: i64, delta: i32) -> FleetResult<i32> {
        let entry = self.entry(node_id).await?;
        let mut state = entry.state.lock().await;
        let next = state.node.current_load + delta;
        if next < 0 {
            return Err(FleetError::InvariantViolation(format!(
                "load of node {} would become {}",
                state.node.name, next
            )));
        }
        state.node.current_load = next;
        self.store.update_node_health(&state.node).await?;
        Ok(next)
    }

    /// Resets the node's load to its live assignments plus in-flight
    /// reservations. Returns the live assignment count.
    pub async fn recount_load(&self, node_id: i64) -> FleetResult<i64> {
        let entry = self.entry(node_id).await?;
        let mut state = entry.state.lock().await;
        let live = self.store.count_live_assignments(node_id).await?;
        let load = i32::try_from(live)
            .map_err(|_| FleetError::InvariantViolation(format!("node {} holds {} assignments", node_id, live)))?
            + state.reserved;
        if state.node.current_load != load {
            debug!(node_id, from = state.node.current_load, to = load, reserved = state.reserved, "Load corrected");
            state.node.current_load = load;
            self.store.update_node_health(&state.node).await?;
        }
        Ok(live)
    }

    /// Returns the status before and after the change.
    pub async fn set_maintenance(
        &self,
        node_id: i64,
        on: bool,
    ) -> FleetResult<(NodeStatus, NodeStatus)> {
        let entry = self.entry(node_id).await?;
        let mut state = entry.state.lock().await;
        let previous = state.node.status;
        state.node.maintenance = on;
        state.node.status = state.tracker.status(on);
        self.store
            .set_node_maintenance(node_id, on, state.node.status)
            .await?;
        Ok((previous, state.node.status))
    }

    /// Administrator override: forget the failure streaks and mark active.
    pub async fn reset_health(&self, node_id: i64) -> FleetResult<NodeStatus> {
        let entry = self.entry(node_id).await?;
        let mut state = entry.state.lock().await;
        state.tracker.reset_streaks(NodeStatus::Active);
        state.node.status = state.tracker.status(state.node.maintenance);
        self.store.update_node_health(&state.node).await?;
        Ok(state.node.status)
    }

    /// Nodes whose load exceeds capacity, with (load, capacity).
    pub async fn over_capacity(&self) -> Vec<(Node, i32, i32)> {
        let mut out = Vec::new();
        for node in self.snapshot().await {
            if node.current_load > node.capacity {
                warn!(
                    node_id = node.id,
                    load = node.current_load,
                    capacity = node.capacity,
                    "Node over capacity"
                );
                let (load, capacity) = (node.current_load, node.capacity);
                out.push((node, load, capacity));
            }
        }
        out
    }
}
