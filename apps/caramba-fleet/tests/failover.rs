mod support;

use caramba_db::StateStore;
use caramba_db::models::assignment::AssignmentStatus;
use caramba_db::models::groups::SelectionPolicy;
use caramba_db::models::node::NodeStatus;
use caramba_fleet::failover::{FailoverPhase, MigrationOutcome};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use support::Fleet;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn overloaded_node_is_drained_to_healthy_peer() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 100, 95, 95.0).await;
    let b = fleet.add_node("node-b", 100, 10, 10.0).await;
    fleet.add_group("eu", SelectionPolicy::LeastLoaded, &[a, b]).await;
    let assignment = fleet.assign(1, 1, a).await;
    fleet.load().await;

    fleet.cycle().await;
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Degraded);
    assert_eq!(fleet.store.get_assignment(assignment).await.unwrap().unwrap().node_id, a);

    fleet.cycle().await;

    assert_eq!(fleet.stored_node(a).await.current_load, 0);
    assert_eq!(fleet.stored_node(b).await.current_load, 11);
    assert_eq!(fleet.stored_node(a).await.status, NodeStatus::Overloaded);
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Offline);
    assert!(fleet.alerts.contains("Migration succeeded"));

    let all = fleet.store.all_assignments().await;
    let live: Vec<_> = all
        .iter()
        .filter(|x| x.key() == (1, 1) && x.status == AssignmentStatus::Active)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].node_id, b);
    assert_eq!(
        fleet.store.get_assignment(assignment).await.unwrap().unwrap().status,
        AssignmentStatus::Inactive
    );

    assert_eq!(fleet.panel(b).binding_count(), 1);
    assert_eq!(fleet.panel(a).binding_count(), 0);
    let new_ref = fleet.panel(b).binding_refs()[0].to_string();
    assert_eq!(live[0].remote_binding_id, new_ref);

    for node in fleet.monitor.registry().snapshot().await {
        assert!(node.current_load <= node.capacity, "{} over capacity", node.name);
    }
}

#[tokio::test]
async fn migration_without_capacity_is_retried_next_cycle() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 100, 40, 95.0).await;
    let b = fleet.add_node("node-b", 100, 10, 95.0).await;
    fleet.add_group("eu", SelectionPolicy::RoundRobin, &[a, b]).await;
    let assignment = fleet.assign(7, 3, a).await;
    fleet.load().await;

    fleet.cycle().await;
    fleet.cycle().await;

    let row = fleet.store.get_assignment(assignment).await.unwrap().unwrap();
    assert_eq!(row.status, AssignmentStatus::Active);
    assert_eq!(row.node_id, a);
    assert_eq!(row.migration_attempts, 1);
    assert!(row.last_error.unwrap_or_default().contains("no node with spare capacity"));
    assert!(fleet.alerts.contains("Migration failed"));
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Migrating);
    assert_eq!(fleet.stored_node(b).await.current_load, 10);

    // B recovers; it needs two healthy cycles before it is selectable again.
    fleet.panel(b).set_cpu(15.0);
    fleet.cycle().await;
    assert_eq!(
        fleet.store.get_assignment(assignment).await.unwrap().unwrap().migration_attempts,
        2
    );
    fleet.cycle().await;

    let old = fleet.store.get_assignment(assignment).await.unwrap().unwrap();
    assert_eq!(old.status, AssignmentStatus::Inactive);
    let moved = fleet
        .store
        .list_assignments_for_node(b, AssignmentStatus::Active)
        .await
        .unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].key(), (7, 3));
}

#[tokio::test]
async fn second_migration_of_same_assignment_is_a_no_op() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 1, 95.0).await;
    let b = fleet.add_node("node-b", 10, 0, 5.0).await;
    let assignment = fleet.assign(2, 2, a).await;
    fleet.load().await;

    let failover = fleet.monitor.failover();
    let first = failover
        .migrate_assignment(assignment, a, &HashSet::from([a]))
        .await
        .unwrap();
    assert!(matches!(first, MigrationOutcome::Migrated(ref r) if r.node_id == b));

    let second = failover
        .migrate_assignment(assignment, a, &HashSet::from([a]))
        .await
        .unwrap();
    assert_eq!(second, MigrationOutcome::Skipped);
    assert_eq!(fleet.panel(b).creates.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(fleet.stored_node(b).await.current_load, 1);
}

#[tokio::test]
async fn failed_binding_creation_rolls_back_everything() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 1, 95.0).await;
    let b = fleet.add_node("node-b", 10, 3, 5.0).await;
    let assignment = fleet.assign(4, 1, a).await;
    fleet.panel(b).set_fail_create(true);
    fleet.load().await;

    let err = fleet
        .monitor
        .failover()
        .migrate_assignment(assignment, a, &HashSet::from([a]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("inbound is full"));

    let row = fleet.store.get_assignment(assignment).await.unwrap().unwrap();
    assert_eq!(row.status, AssignmentStatus::Active);
    assert_eq!(row.node_id, a);
    assert_eq!(row.migration_attempts, 1);
    assert_eq!(fleet.stored_node(b).await.current_load, 3);
    assert_eq!(fleet.panel(b).binding_count(), 0);
    assert_eq!(fleet.panel(a).binding_count(), 1);
}

#[tokio::test]
async fn unreachable_old_node_leaves_partial_failure_alert() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 2, 10.0).await;
    let b = fleet.add_node("node-b", 10, 0, 10.0).await;
    fleet.add_group("asia", SelectionPolicy::BestLatency, &[a, b]).await;
    fleet.assign(1, 9, a).await;
    fleet.assign(2, 9, a).await;
    fleet.panel(a).set_down(true);
    fleet.load().await;

    fleet.cycle().await;
    fleet.cycle().await;

    assert_eq!(fleet.stored_node(a).await.status, NodeStatus::Offline);
    assert_eq!(
        fleet
            .store
            .list_assignments_for_node(b, AssignmentStatus::Active)
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(fleet.alerts.count_matching("Migration succeeded"), 2);
    assert_eq!(fleet.alerts.count_matching("Manual cleanup needed"), 2);
    assert_eq!(fleet.stored_node(a).await.current_load, 0);
    assert_eq!(fleet.stored_node(b).await.current_load, 2);
}

#[tokio::test]
async fn stuck_migrations_are_reclaimed_by_watchdog() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 1, 10.0).await;
    let assignment = fleet.assign(5, 5, a).await;
    fleet.load().await;
    assert!(
        fleet
            .store
            .compare_and_set_assignment_status(
                assignment,
                AssignmentStatus::Active,
                AssignmentStatus::Migrating
            )
            .await
            .unwrap()
    );

    let reclaimed = fleet
        .monitor
        .failover()
        .reclaim_stuck(chrono::Duration::seconds(-1))
        .await
        .unwrap();

    assert_eq!(reclaimed, 1);
    let row = fleet.store.get_assignment(assignment).await.unwrap().unwrap();
    assert_eq!(row.status, AssignmentStatus::Active);
    assert_eq!(row.last_error.as_deref(), Some("migration timed out"));
    assert!(fleet.alerts.contains("timed out"));
}

#[tokio::test]
async fn administrator_release_returns_node_to_healthy() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 0, 10.0).await;
    fleet.panel(a).set_down(true);
    fleet.load().await;

    fleet.cycle().await;
    fleet.cycle().await;
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Unhealthy);

    fleet.monitor.failover().release(a).await.unwrap();

    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Healthy);
    assert_eq!(fleet.stored_node(a).await.status, NodeStatus::Active);
    assert!(fleet.alerts.contains("released by administrator"));
}

#[tokio::test]
async fn drain_skips_targets_without_credentials() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 2, 95.0).await;
    let b = fleet.add_node("node-b", 10, 4, 10.0).await;
    let c = fleet.add_node("node-c", 10, 0, 10.0).await;
    fleet.add_group("eu", SelectionPolicy::LeastLoaded, &[a, b, c]).await;
    fleet.assign(3, 1, a).await;
    fleet.assign(4, 1, a).await;
    fleet.connector.unregister(c);
    fleet.load().await;

    let report = fleet
        .monitor
        .failover()
        .drain_node(a, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.remaining, 0);
    assert_eq!(fleet.stored_node(a).await.current_load, 0);
    assert_eq!(fleet.stored_node(b).await.current_load, 6);
    assert_eq!(fleet.stored_node(c).await.current_load, 0);
    assert_eq!(fleet.panel(c).creates.load(Ordering::SeqCst), 0);
    assert_eq!(fleet.panel(b).binding_count(), 2);
}

#[tokio::test]
async fn node_without_credentials_is_drained_by_the_monitor() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 2, 10.0).await;
    let b = fleet.add_node("node-b", 10, 0, 10.0).await;
    fleet.assign(1, 4, a).await;
    fleet.assign(2, 4, a).await;
    fleet.connector.unregister(a);
    fleet.load().await;

    fleet.cycle().await;
    fleet.cycle().await;

    assert_eq!(fleet.stored_node(a).await.status, NodeStatus::Offline);
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Offline);
    assert_eq!(fleet.stored_node(a).await.current_load, 0);
    assert_eq!(fleet.stored_node(b).await.current_load, 2);
    // The old bindings cannot be removed without a panel login.
    assert_eq!(fleet.alerts.count_matching("Manual cleanup needed"), 2);
    assert_eq!(fleet.panel(a).binding_count(), 2);
}

#[tokio::test]
async fn recovered_node_keeps_draining_until_empty() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 1, 95.0).await;
    let b = fleet.add_node("node-b", 10, 0, 95.0).await;
    fleet.add_group("eu", SelectionPolicy::LeastLoaded, &[a, b]).await;
    let assignment = fleet.assign(8, 1, a).await;
    fleet.load().await;

    fleet.cycle().await;
    fleet.cycle().await;
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Migrating);

    fleet.panel(a).set_cpu(10.0);
    fleet.panel(b).set_cpu(10.0);
    fleet.cycle().await;
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Migrating);

    // A is healthy again but still holds the assignment; B is selectable now.
    fleet.cycle().await;
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Offline);
    let old = fleet.store.get_assignment(assignment).await.unwrap().unwrap();
    assert_eq!(old.status, AssignmentStatus::Inactive);
    assert_eq!(
        fleet
            .store
            .list_assignments_for_node(b, AssignmentStatus::Active)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(!fleet.alerts.contains("Node node-a recovered"));

    fleet.cycle().await;
    assert_eq!(fleet.monitor.failover().phase(a), FailoverPhase::Healthy);
    assert!(fleet.alerts.contains("Node node-a recovered from offline"));
}
