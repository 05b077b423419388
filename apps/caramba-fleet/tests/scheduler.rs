mod support;

use caramba_db::StateStore;
use caramba_db::models::groups::SelectionPolicy;
use caramba_fleet::Scheduler;
use caramba_fleet::scheduler::Intervals;
use chrono::Utc;
use std::time::Duration;
use support::Fleet;
use tokio_util::sync::CancellationToken;

fn intervals() -> Intervals {
    Intervals {
        probe: Duration::from_secs(300),
        cleanup: Duration::from_secs(86_400),
        reconcile: Duration::from_secs(1_800),
        watchdog: Duration::from_secs(60),
    }
}

#[tokio::test(start_paused = true)]
async fn cycles_of_one_lane_never_overlap() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 0, 10.0).await;
    let b = fleet.add_node("node-b", 10, 0, 10.0).await;
    fleet.add_group("eu", SelectionPolicy::RoundRobin, &[a]).await;
    fleet.add_group("us", SelectionPolicy::RoundRobin, &[b]).await;
    fleet.panel(a).set_delay(Duration::from_secs(5));
    fleet.panel(b).set_delay(Duration::from_secs(5));
    fleet.load().await;

    let scheduler = Scheduler::new(fleet.monitor.clone(), intervals());
    let lanes = fleet.monitor.registry().probe_lanes().await;
    assert_eq!(lanes.len(), 2);

    let (first, second, other) = tokio::join!(
        scheduler.run_lane_once(&lanes[0]),
        scheduler.run_lane_once(&lanes[0]),
        scheduler.run_lane_once(&lanes[1]),
    );

    let first = first.expect("first cycle runs").unwrap();
    assert_eq!(first.probed, 1);
    assert!(second.is_none());
    assert_eq!(other.expect("other lane runs").unwrap().probed, 1);

    // The lane is free again once the cycle finished.
    assert!(scheduler.run_lane_once(&lanes[0]).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn stop_discards_in_flight_probes() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 0, 10.0).await;
    fleet.panel(a).set_delay(Duration::from_secs(8));
    fleet.load().await;

    let scheduler = Scheduler::new(fleet.monitor.clone(), intervals());
    scheduler.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    scheduler.stop().await;

    assert_eq!(fleet.store.sample_count().await, 0);
    assert!(fleet.stored_node(a).await.last_checked.is_none());
    assert!(scheduler.cancellation().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn probe_cycles_follow_the_interval() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 0, 10.0).await;
    let b = fleet.add_node("node-b", 10, 0, 10.0).await;
    fleet.load().await;

    let scheduler = Scheduler::new(fleet.monitor.clone(), intervals());
    scheduler.start();
    tokio::time::sleep(Duration::from_secs(601)).await;
    scheduler.stop().await;

    let from = Utc::now() - chrono::Duration::hours(1);
    let to = Utc::now() + chrono::Duration::hours(1);
    for node in [a, b] {
        let samples = fleet.store.samples_between(node, from, to).await.unwrap();
        assert_eq!(samples.len(), 3, "node {} sample count", node);
    }
    assert_eq!(fleet.stored_node(a).await.status.as_str(), "active");
}

#[tokio::test(start_paused = true)]
async fn cycles_run_on_spawned_tasks() {
    let mut fleet = Fleet::new();
    let a = fleet.add_node("node-a", 10, 1, 95.0).await;
    let b = fleet.add_node("node-b", 10, 0, 10.0).await;
    fleet.add_group("eu", SelectionPolicy::LeastLoaded, &[a, b]).await;
    fleet.assign(1, 1, a).await;
    fleet.load().await;

    let lane = fleet.monitor.registry().probe_lanes().await.remove(0);
    for _ in 0..2 {
        let monitor = fleet.monitor.clone();
        let lane = lane.clone();
        let report = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            monitor.run_probe_cycle(&lane, &cancel).await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(report.probed, 2);
    }
    assert_eq!(fleet.stored_node(b).await.current_load, 1);

    let monitor = fleet.monitor.clone();
    let reports = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        monitor.probe_all_lanes(&cancel).await
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reports.len(), 1);

    let monitor = fleet.monitor.clone();
    let synced = tokio::spawn(async move { monitor.run_reconcile().await })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.nodes_synced, 2);
}
