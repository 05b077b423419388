#![allow(dead_code)]

use async_trait::async_trait;
use caramba_db::models::assignment::Assignment;
use caramba_db::models::groups::SelectionPolicy;
use caramba_db::models::node::Node;
use caramba_db::{MemoryStateStore, StateStore};
use caramba_fleet::alerts::MemoryAlertSink;
use caramba_fleet::panel::{PanelClient, PanelConnector, PanelError};
use caramba_fleet::{FleetConfig, FleetMonitor};
use caramba_shared::panel::{Binding, BindingRef, BindingSpec, PanelStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scriptable stand-in for one node's panel.
pub struct FakePanel {
    status: Mutex<PanelStatus>,
    down: AtomicBool,
    fail_create: AtomicBool,
    delay: Mutex<Duration>,
    create_delay: Mutex<Duration>,
    bindings: Mutex<HashMap<BindingRef, Binding>>,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakePanel {
    pub fn new(cpu_pct: f64) -> Self {
        Self {
            status: Mutex::new(PanelStatus {
                cpu_pct,
                mem_pct: 20.0,
                disk_pct: 30.0,
                connections: 5,
                uptime_secs: 3600,
            }),
            down: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            create_delay: Mutex::new(Duration::ZERO),
            bindings: Mutex::new(HashMap::new()),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn set_cpu(&self, cpu_pct: f64) {
        self.status.lock().unwrap().cpu_pct = cpu_pct;
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Delays binding creation only; status calls stay immediate.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn insert_binding(&self, binding: BindingRef) {
        self.bindings.lock().unwrap().insert(
            binding.clone(),
            Binding {
                binding_ref: binding,
                email: "seed".into(),
                enable: true,
                traffic_limit_bytes: 0,
                expiry_time_ms: 0,
            },
        );
    }

    pub fn remove_binding(&self, binding: &BindingRef) {
        self.bindings.lock().unwrap().remove(binding);
    }

    pub fn binding_refs(&self) -> Vec<BindingRef> {
        self.bindings.lock().unwrap().keys().cloned().collect()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }

    fn check_up(&self) -> Result<(), PanelError> {
        if self.down.load(Ordering::SeqCst) {
            Err(PanelError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PanelClient for FakePanel {
    async fn login(&self) -> Result<(), PanelError> {
        self.check_up()
    }

    async fn get_status(&self) -> Result<PanelStatus, PanelError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_up()?;
        Ok(self.status.lock().unwrap().clone())
    }

    async fn list_bindings(&self) -> Result<Vec<Binding>, PanelError> {
        self.check_up()?;
        Ok(self.bindings.lock().unwrap().values().cloned().collect())
    }

    async fn create_binding(&self, spec: &BindingSpec) -> Result<Binding, PanelError> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_up()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PanelError::Rejected("inbound is full".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let binding = Binding::from(spec);
        self.bindings
            .lock()
            .unwrap()
            .insert(binding.binding_ref.clone(), binding.clone());
        Ok(binding)
    }

    async fn update_binding(&self, binding: &BindingRef, spec: &BindingSpec) -> Result<(), PanelError> {
        self.check_up()?;
        self.bindings
            .lock()
            .unwrap()
            .insert(binding.clone(), Binding::from(spec));
        Ok(())
    }

    async fn delete_binding(&self, binding: &BindingRef) -> Result<(), PanelError> {
        self.check_up()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.bindings.lock().unwrap().remove(binding);
        Ok(())
    }
}

/// Wrapper so the connector can hand out `Arc<dyn PanelClient>` while the
/// test keeps the concrete panel.
struct SharedPanel(Arc<FakePanel>);

#[async_trait]
impl PanelClient for SharedPanel {
    async fn login(&self) -> Result<(), PanelError> {
        self.0.login().await
    }
    async fn get_status(&self) -> Result<PanelStatus, PanelError> {
        self.0.get_status().await
    }
    async fn list_bindings(&self) -> Result<Vec<Binding>, PanelError> {
        self.0.list_bindings().await
    }
    async fn create_binding(&self, spec: &BindingSpec) -> Result<Binding, PanelError> {
        self.0.create_binding(spec).await
    }
    async fn update_binding(&self, binding: &BindingRef, spec: &BindingSpec) -> Result<(), PanelError> {
        self.0.update_binding(binding, spec).await
    }
    async fn delete_binding(&self, binding: &BindingRef) -> Result<(), PanelError> {
        self.0.delete_binding(binding).await
    }
}

#[derive(Default)]
pub struct FakeConnector {
    panels: Mutex<HashMap<i64, Arc<FakePanel>>>,
    forgotten: Mutex<Vec<i64>>,
}

impl FakeConnector {
    pub fn register(&self, node_id: i64, panel: Arc<FakePanel>) {
        self.panels.lock().unwrap().insert(node_id, panel);
    }

    /// Afterwards the node has no usable credentials.
    pub fn unregister(&self, node_id: i64) {
        self.panels.lock().unwrap().remove(&node_id);
    }

    pub fn forgotten(&self) -> Vec<i64> {
        self.forgotten.lock().unwrap().clone()
    }
}

impl PanelConnector for FakeConnector {
    fn client_for(&self, node: &Node) -> Result<Arc<dyn PanelClient>, PanelError> {
        let panel = self
            .panels
            .lock()
            .unwrap()
            .get(&node.id)
            .cloned()
            .ok_or_else(|| PanelError::Credentials(format!("no panel for node {}", node.id)))?;
        Ok(Arc::new(SharedPanel(panel)))
    }

    fn forget(&self, node_id: i64) {
        self.forgotten.lock().unwrap().push(node_id);
    }
}

pub fn test_config() -> FleetConfig {
    FleetConfig {
        database_url: "postgres://unused".into(),
        probe_timeout_secs: 10,
        panel_timeout_secs: 5,
        worker_pool_size: 4,
        rng_seed: Some(7),
        ..FleetConfig::default()
    }
}

/// A fleet wired to in-memory collaborators.
pub struct Fleet {
    pub config: FleetConfig,
    pub store: Arc<MemoryStateStore>,
    pub connector: Arc<FakeConnector>,
    pub alerts: Arc<MemoryAlertSink>,
    pub monitor: Arc<FleetMonitor>,
    pub panels: HashMap<i64, Arc<FakePanel>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: FleetConfig) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let connector = Arc::new(FakeConnector::default());
        let alerts = Arc::new(MemoryAlertSink::new());
        let monitor = Arc::new(FleetMonitor::new(
            &config,
            store.clone(),
            connector.clone(),
            alerts.clone(),
        ));
        Self {
            config,
            store,
            connector,
            alerts,
            monitor,
            panels: HashMap::new(),
        }
    }

    /// A second monitor over the same store, as a one-shot CLI command
    /// would build it next to the running server.
    pub async fn cli_monitor(&self) -> FleetMonitor {
        let monitor = FleetMonitor::new(
            &self.config,
            self.store.clone(),
            self.connector.clone(),
            Arc::new(MemoryAlertSink::new()),
        );
        monitor.load().await.unwrap();
        monitor
    }

    pub async fn add_node(&mut self, name: &str, capacity: i32, load: i32, cpu_pct: f64) -> i64 {
        let mut node = Node::new(name, &format!("https://{}.example:2053", name), "FLEET_TEST_CRED", capacity);
        node.current_load = load;
        let id = self.store.create_node(&node).await.unwrap();
        let panel = Arc::new(FakePanel::new(cpu_pct));
        self.connector.register(id, panel.clone());
        self.panels.insert(id, panel);
        id
    }

    pub async fn add_group(&self, name: &str, policy: SelectionPolicy, members: &[i64]) -> i64 {
        let id = self.store.create_group(name, policy).await.unwrap();
        for node_id in members {
            self.store.add_node_to_group(*node_id, id).await.unwrap();
        }
        id
    }

    /// Creates an active assignment with its binding present on the node.
    pub async fn assign(&self, subscriber_id: i64, service_id: i64, node_id: i64) -> i64 {
        let binding = BindingRef::new(1, format!("client-{}-{}", subscriber_id, service_id));
        self.panel(node_id).insert_binding(binding.clone());
        let assignment = Assignment::new(
            subscriber_id,
            service_id,
            node_id,
            &binding.to_string(),
            50 * 1024 * 1024 * 1024,
            None,
        );
        self.store.create_assignment(&assignment).await.unwrap()
    }

    pub fn panel(&self, node_id: i64) -> &Arc<FakePanel> {
        &self.panels[&node_id]
    }

    pub async fn load(&self) {
        self.monitor.load().await.unwrap();
    }

    pub async fn cycle(&self) {
        let cancel = tokio_util::sync::CancellationToken::new();
        self.monitor.probe_all_lanes(&cancel).await.unwrap();
    }

    pub async fn stored_node(&self, id: i64) -> Node {
        self.store.get_node(id).await.unwrap().unwrap()
    }
}
