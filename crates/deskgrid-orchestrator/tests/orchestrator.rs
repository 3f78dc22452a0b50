//! End-to-end workspace lifecycle against in-process fake daemons.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use deskgrid_orchestrator::{Orchestrator, OrchestratorError};
use deskgrid_placement::{PlacementError, PlacementStrategy};
use deskgrid_runtime::{
    ClientPool, ContainerSpec, ContainerStats, DaemonInfo, ExecResult, PoolConfig, RuntimeBackend,
    RuntimeError, RuntimeResult,
};
use deskgrid_state::{
    ContainerId, Registry, RegistryError, ResourceRequirements, ServerConfig, ServerRecord,
    ServerStatus, Transport,
};

// ── Fake daemon ────────────────────────────────────────────────────

#[derive(Default)]
struct FakeBackend {
    server_id: String,
    down: AtomicBool,
    fail_start: AtomicBool,
    block_create: AtomicBool,
    next_id: AtomicUsize,
    created: Mutex<Vec<ContainerSpec>>,
    running: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn new(server_id: &str) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.to_string(),
            ..Default::default()
        })
    }

    fn check_up(&self) -> RuntimeResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(RuntimeError::unavailable(&self.server_id, "connection refused"))
        } else {
            Ok(())
        }
    }

    fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeBackend for FakeBackend {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerId> {
        if self.block_create.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_up()?;
        self.created.lock().unwrap().push(spec.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-ctr-{n}", self.server_id))
    }

    async fn start_container(&self, container_id: &str) -> RuntimeResult<()> {
        self.check_up()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::unavailable(&self.server_id, "image entrypoint not found"));
        }
        self.running.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> RuntimeResult<()> {
        self.check_up()?;
        self.running.lock().unwrap().retain(|id| id != container_id);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()> {
        self.check_up()?;
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn exec_command(&self, _: &str, _: &[String]) -> RuntimeResult<ExecResult> {
        self.check_up()?;
        Ok(ExecResult {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn get_stats(&self, container_id: &str) -> RuntimeResult<ContainerStats> {
        self.check_up()?;
        if self.running.lock().unwrap().iter().any(|id| id == container_id) {
            Ok(ContainerStats {
                running: true,
                state: "running".to_string(),
                ..Default::default()
            })
        } else {
            Ok(ContainerStats::missing())
        }
    }

    async fn check_daemon_info(&self) -> RuntimeResult<DaemonInfo> {
        self.check_up()?;
        Ok(DaemonInfo::default())
    }
}

// ── Fixtures ───────────────────────────────────────────────────────

fn server_config(id: &str, max_workspaces: u32) -> ServerConfig {
    ServerConfig {
        server_id: id.to_string(),
        name: format!("{id} test box"),
        host: "127.0.0.1".to_string(),
        port: 2375,
        transport: Transport::Plain,
        total_cpu_cores: 8.0,
        total_memory_mb: 16384,
        total_disk_gb: 200,
        max_workspaces,
        labels: HashMap::new(),
    }
}

struct Fleet {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<Registry>,
    backends: HashMap<String, Arc<FakeBackend>>,
}

impl Fleet {
    fn backend(&self, id: &str) -> &FakeBackend {
        &self.backends[id]
    }

    fn server(&self, id: &str) -> ServerRecord {
        self.registry.get_server(id).unwrap()
    }
}

fn fleet(servers: &[(&str, u32, ServerStatus)]) -> Fleet {
    let registry = Arc::new(Registry::in_memory());
    let pool = Arc::new(ClientPool::new(PoolConfig::default()));
    let mut backends = HashMap::new();

    for &(id, max_workspaces, status) in servers {
        let mut record = ServerRecord::from_config(server_config(id, max_workspaces));
        record.status = status;
        registry.add_server(record).unwrap();

        let backend = FakeBackend::new(id);
        pool.insert_backend(id, backend.clone());
        backends.insert(id.to_string(), backend);
    }

    Fleet {
        orchestrator: Arc::new(Orchestrator::new(registry.clone(), pool)),
        registry,
        backends,
    }
}

fn small() -> ResourceRequirements {
    ResourceRequirements::new(1.0, 2048, 20)
}

fn desktop() -> ContainerSpec {
    ContainerSpec::new("deskgrid/desktop:latest")
}

// ── Placement and creation ─────────────────────────────────────────

#[tokio::test]
async fn place_workspace_creates_and_records() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);

    let placed = fleet
        .orchestrator
        .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
        .await
        .unwrap();
    assert_eq!(placed.server_id, "srv-a");
    assert_eq!(placed.strategy, PlacementStrategy::Spread);

    let server = fleet.server("srv-a");
    assert_eq!(server.current_workspace_count, 1);
    assert_eq!(server.current_memory_used_mb, 2048);
    assert_eq!(fleet.registry.pending_reservations(), 0);

    let record = fleet.registry.get_workspace(&placed.container_id).unwrap();
    assert_eq!(record.server_id, "srv-a");
    assert!(!record.healthy, "unhealthy until the first probe succeeds");

    // The allocation is passed down as runtime limits.
    let spec = fleet.backend("srv-a").created.lock().unwrap()[0].clone();
    assert_eq!(spec.cpu_cores, 1.0);
    assert_eq!(spec.memory_mb, 2048);
}

#[tokio::test]
async fn spread_alternates_between_equal_servers() {
    let fleet = fleet(&[
        ("srv-a", 4, ServerStatus::Healthy),
        ("srv-b", 4, ServerStatus::Healthy),
    ]);

    let mut hosts = Vec::new();
    for _ in 0..4 {
        let placed = fleet
            .orchestrator
            .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
            .await
            .unwrap();
        hosts.push(placed.server_id);
    }
    assert_eq!(hosts, ["srv-a", "srv-b", "srv-a", "srv-b"]);
}

#[tokio::test]
async fn concurrent_placements_never_share_the_last_slot() {
    let fleet = fleet(&[("srv-a", 1, ServerStatus::Healthy)]);
    let orch = &fleet.orchestrator;
    let (req, spec) = (small(), desktop());

    let (first, second) = tokio::join!(
        orch.place_workspace(&req, PlacementStrategy::Spread, &spec),
        orch.place_workspace(&req, PlacementStrategy::Spread, &spec),
    );

    let outcomes = [first, second];
    let ok = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    let err = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(
        err,
        OrchestratorError::Placement(PlacementError::InsufficientCapacity {
            healthy: 1,
            label_matched: 1
        })
    ));

    assert_eq!(fleet.server("srv-a").current_workspace_count, 1);
    assert_eq!(fleet.backend("srv-a").created(), 1);
}

#[tokio::test]
async fn abandoned_placement_releases_its_hold() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    fleet.backend("srv-a").block_create.store(true, Ordering::SeqCst);

    let orch = fleet.orchestrator.clone();
    let task = tokio::spawn(async move {
        orch.place_workspace(&small(), PlacementStrategy::Spread, &desktop())
            .await
    });

    while fleet.registry.pending_reservations() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(fleet.server("srv-a").current_workspace_count, 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let server = fleet.server("srv-a");
    assert_eq!(server.current_workspace_count, 0);
    assert_eq!(server.current_cpu_used, 0.0);
    assert_eq!(fleet.registry.pending_reservations(), 0);
    assert!(fleet.registry.list_workspaces().is_empty());
}

#[tokio::test]
async fn create_failure_releases_capacity() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    fleet.backend("srv-a").down.store(true, Ordering::SeqCst);

    let err = fleet
        .orchestrator
        .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
        .await
        .unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");

    assert_eq!(fleet.server("srv-a").current_workspace_count, 0);
    assert_eq!(fleet.registry.pending_reservations(), 0);
}

#[tokio::test]
async fn start_failure_removes_the_container() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    fleet.backend("srv-a").fail_start.store(true, Ordering::SeqCst);

    let err = fleet
        .orchestrator
        .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Runtime(RuntimeError::Unavailable { .. })));

    assert_eq!(fleet.backend("srv-a").removed(), ["srv-a-ctr-0"]);
    assert_eq!(fleet.server("srv-a").current_workspace_count, 0);
    assert!(fleet.registry.list_workspaces().is_empty());
}

#[tokio::test]
async fn offline_affinity_target_is_rejected() {
    let fleet = fleet(&[
        ("srv-a", 4, ServerStatus::Healthy),
        ("srv-b", 4, ServerStatus::Offline),
    ]);

    let req = small().with_affinity("srv-b");
    let err = fleet
        .orchestrator
        .place_workspace(&req, PlacementStrategy::Affinity, &desktop())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Placement(PlacementError::AffinityServerUnavailable(ref id)) if id == "srv-b"
    ));
    assert_eq!(fleet.backend("srv-a").created(), 0);
    assert_eq!(fleet.backend("srv-b").created(), 0);
}

#[tokio::test]
async fn no_healthy_servers() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Unhealthy)]);
    let err = fleet
        .orchestrator
        .place_workspace(&small(), PlacementStrategy::BestFit, &desktop())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Placement(PlacementError::NoHealthyServers)
    ));
}

#[tokio::test]
async fn create_workspace_targets_a_server_directly() {
    let fleet = fleet(&[
        ("srv-a", 1, ServerStatus::Healthy),
        ("srv-b", 4, ServerStatus::Healthy),
    ]);

    let id = fleet
        .orchestrator
        .create_workspace("srv-a", &small(), &desktop())
        .await
        .unwrap();
    assert_eq!(fleet.registry.get_workspace(&id).unwrap().server_id, "srv-a");

    let err = fleet
        .orchestrator
        .create_workspace("srv-a", &small(), &desktop())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Registry(RegistryError::CapacityExhausted(_))
    ));

    let err = fleet
        .orchestrator
        .create_workspace("srv-zz", &small(), &desktop())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Runtime(RuntimeError::Configuration(ref msg)) if msg.contains("srv-zz")
    ));
    assert_eq!(fleet.registry.pending_reservations(), 0);
}

#[tokio::test]
async fn find_placement_is_a_dry_run() {
    let fleet = fleet(&[
        ("srv-a", 4, ServerStatus::Healthy),
        ("srv-b", 4, ServerStatus::Healthy),
    ]);
    let orch = &fleet.orchestrator;
    let rr = PlacementStrategy::RoundRobin;

    for _ in 0..3 {
        let preview = orch.find_placement(&small(), rr).unwrap();
        assert_eq!(preview.server_id, "srv-a");
    }
    assert_eq!(fleet.server("srv-a").current_workspace_count, 0);
    assert_eq!(fleet.registry.pending_reservations(), 0);

    let first = orch.place_workspace(&small(), rr, &desktop()).await.unwrap();
    let second = orch.place_workspace(&small(), rr, &desktop()).await.unwrap();
    assert_eq!(first.server_id, "srv-a");
    assert_eq!(second.server_id, "srv-b");
}

// ── Destruction ────────────────────────────────────────────────────

#[tokio::test]
async fn destroy_is_idempotent() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    let placed = fleet
        .orchestrator
        .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
        .await
        .unwrap();

    let removed = fleet
        .orchestrator
        .destroy_workspace(&placed.container_id)
        .await
        .unwrap();
    assert_eq!(removed.unwrap().container_id, placed.container_id);
    assert_eq!(fleet.server("srv-a").current_workspace_count, 0);
    assert_eq!(fleet.server("srv-a").current_memory_used_mb, 0);

    let again = fleet
        .orchestrator
        .destroy_workspace(&placed.container_id)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(fleet.server("srv-a").current_workspace_count, 0);
}

#[tokio::test]
async fn destroy_keeps_record_when_daemon_is_down() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    let placed = fleet
        .orchestrator
        .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
        .await
        .unwrap();

    fleet.backend("srv-a").down.store(true, Ordering::SeqCst);
    let err = fleet
        .orchestrator
        .destroy_workspace(&placed.container_id)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(fleet.registry.get_workspace(&placed.container_id).is_some());
    assert_eq!(fleet.server("srv-a").current_workspace_count, 1);

    fleet.backend("srv-a").down.store(false, Ordering::SeqCst);
    let removed = fleet
        .orchestrator
        .destroy_workspace(&placed.container_id)
        .await
        .unwrap();
    assert!(removed.is_some());
}

// ── Queries and registration ───────────────────────────────────────

#[tokio::test]
async fn health_lookups() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    let placed = fleet
        .orchestrator
        .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
        .await
        .unwrap();

    let server = fleet.orchestrator.get_server_health("srv-a").unwrap();
    assert_eq!(server.status, ServerStatus::Healthy);

    let workspace = fleet
        .orchestrator
        .get_workspace_health(&placed.container_id)
        .unwrap();
    assert_eq!(workspace.server_id, "srv-a");

    assert!(matches!(
        fleet.orchestrator.get_server_health("srv-zz"),
        Err(OrchestratorError::ServerNotFound(_))
    ));
    assert!(matches!(
        fleet.orchestrator.get_workspace_health("nope"),
        Err(OrchestratorError::WorkspaceNotFound(_))
    ));
    assert_eq!(fleet.orchestrator.list_workspaces().len(), 1);
}

#[tokio::test]
async fn add_server_at_runtime() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    let orch = &fleet.orchestrator;

    let record = orch.add_server(server_config("srv-b", 4)).unwrap();
    assert_eq!(record.status, ServerStatus::Unhealthy);
    assert!(orch.pool().contains("srv-b"));
    let ids: Vec<_> = orch
        .list_servers()
        .into_iter()
        .map(|s| s.server_id)
        .collect();
    assert_eq!(ids, ["srv-a", "srv-b"]);

    assert!(matches!(
        orch.add_server(server_config("srv-b", 4)),
        Err(OrchestratorError::Registry(RegistryError::DuplicateServer(_)))
    ));

    let mut broken = server_config("srv-c", 4);
    broken.host.clear();
    assert!(matches!(
        orch.add_server(broken),
        Err(OrchestratorError::Runtime(RuntimeError::Configuration(_)))
    ));
    assert!(fleet.registry.get_server("srv-c").is_none());
    assert!(!orch.pool().contains("srv-c"));
}

#[tokio::test]
async fn remove_server_refused_while_hosting() {
    let fleet = fleet(&[("srv-a", 4, ServerStatus::Healthy)]);
    let orch = &fleet.orchestrator;
    let placed = orch
        .place_workspace(&small(), PlacementStrategy::Spread, &desktop())
        .await
        .unwrap();

    assert!(matches!(
        orch.remove_server("srv-a"),
        Err(OrchestratorError::Registry(RegistryError::ServerHasWorkspaces { .. }))
    ));
    assert!(orch.pool().contains("srv-a"));

    orch.destroy_workspace(&placed.container_id).await.unwrap();
    let removed = orch.remove_server("srv-a").unwrap();
    assert_eq!(removed.server_id, "srv-a");
    assert!(!orch.pool().contains("srv-a"));
    assert!(orch.list_servers().is_empty());
}
