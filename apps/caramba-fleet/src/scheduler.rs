use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::FleetConfig;
use crate::error::FleetResult;
use crate::monitor::{CycleReport, FleetMonitor};
use crate::registry::ProbeLane;

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub probe: Duration,
    pub cleanup: Duration,
    pub reconcile: Duration,
    pub watchdog: Duration,
}

impl Intervals {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            probe: config.probe_interval(),
            cleanup: config.cleanup_interval(),
            reconcile: config.reconcile_interval(),
            watchdog: config.watchdog_interval(),
        }
    }
}

type LaneLocks = Mutex<HashMap<Option<i64>, Arc<tokio::sync::Mutex<()>>>>;

/// Drives the periodic cycles. Cycles of one lane never overlap; different
/// lanes and the maintenance cycles run concurrently.
pub struct Scheduler {
    monitor: Arc<FleetMonitor>,
    intervals: Intervals,
    cancel: CancellationToken,
    tracker: TaskTracker,
    lanes: Arc<LaneLocks>,
}

impl Scheduler {
    pub fn new(monitor: Arc<FleetMonitor>, intervals: Intervals) -> Self {
        Self {
            monitor,
            intervals,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn start(&self) {
        info!(
            probe = ?self.intervals.probe,
            cleanup = ?self.intervals.cleanup,
            reconcile = ?self.intervals.reconcile,
            watchdog = ?self.intervals.watchdog,
            "Starting fleet scheduler"
        );

        let dispatcher = Dispatcher {
            monitor: self.monitor.clone(),
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
            lanes: self.lanes.clone(),
        };
        let period = self.intervals.probe;
        self.tracker.spawn(async move { dispatcher.run(period).await });

        let monitor = self.monitor.clone();
        self.spawn_periodic("cleanup", self.intervals.cleanup, move || {
            let monitor = monitor.clone();
            async move { monitor.run_cleanup().await.map(|_| ()) }
        });

        let monitor = self.monitor.clone();
        self.spawn_periodic("reconcile", self.intervals.reconcile, move || {
            let monitor = monitor.clone();
            async move { monitor.run_reconcile().await.map(|_| ()) }
        });

        let monitor = self.monitor.clone();
        self.spawn_periodic("watchdog", self.intervals.watchdog, move || {
            let monitor = monitor.clone();
            async move { monitor.run_watchdog().await.map(|_| ()) }
        });
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, cycle: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = FleetResult<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                debug!("Running {} cycle", name);
                if let Err(e) = cycle().await {
                    error!("Fleet {} cycle failed: {}", name, e);
                }
            }
            debug!("{} loop stopped", name);
        });
    }

    /// Runs one cycle of the lane now, or returns `None` if a cycle of the
    /// same lane is still in flight.
    pub async fn run_lane_once(&self, lane: &ProbeLane) -> Option<FleetResult<CycleReport>> {
        let lock = lane_lock(&self.lanes, lane.group_id);
        let _guard = lock.try_lock_owned().ok()?;
        Some(self.monitor.run_probe_cycle(lane, &self.cancel).await)
    }

    /// Cancels every loop, aborts in-flight probing and waits for running
    /// cycles, including started migrations, to finish.
    pub async fn stop(&self) {
        info!("Stopping fleet scheduler...");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Fleet scheduler stopped");
    }
}

fn lane_lock(locks: &LaneLocks, lane: Option<i64>) -> Arc<tokio::sync::Mutex<()>> {
    locks
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(lane)
        .or_default()
        .clone()
}

struct Dispatcher {
    monitor: Arc<FleetMonitor>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    lanes: Arc<LaneLocks>,
}

impl Dispatcher {
    async fn run(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for lane in self.monitor.registry().probe_lanes().await {
                let lock = lane_lock(&self.lanes, lane.group_id);
                let Ok(guard) = lock.try_lock_owned() else {
                    debug!(lane = %lane.name, "Previous cycle still running, skipping tick");
                    continue;
                };

                let monitor = self.monitor.clone();
                let cancel = self.cancel.clone();
                self.tracker.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = monitor.run_probe_cycle(&lane, &cancel).await {
                        error!(lane = %lane.name, "Probe cycle failed: {}", e);
                    }
                });
            }
        }
        debug!("Probe dispatcher stopped");
    }
}
