use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use dashmap::DashSet;
use tokio_util::sync::CancellationToken;

use oxcore::core::Core;
use oxcore::error::CoreError;
use oxcore::gc::{CollectorKind, OrphanedVolumes};
use oxcore::state::lock::NullLockFactory;
use oxcore::state::models::{container_type, resource_state, ContainerMetadata};
use oxcore::state::sqlite::SqliteBackend;
use oxcore::state::StateBackend;
use oxcore::worker::{ContainerSpec, VolumeSpec, WorkerTransport};
use oxcore::clock::{Clock, FakeClock};
use oxcore::config::RuntimeConfig;

/// An in-memory runtime double. `fail_next` lets a test force exactly one
/// transient failure, to exercise S2/S3's "fails once, retry succeeds" path.
struct FakeRuntime {
    volumes: DashSet<String>,
    fail_next: AtomicBool,
}

impl FakeRuntime {
    fn new() -> Self {
        Self { volumes: DashSet::new(), fail_next: AtomicBool::new(false) }
    }
}

#[async_trait]
impl WorkerTransport for FakeRuntime {
    async fn create_container(&self, _w: &str, _s: &ContainerSpec, _c: &CancellationToken) -> oxcore::error::CoreResult<String> {
        Ok("handle-container".to_string())
    }
    async fn destroy_container(&self, _w: &str, _h: &str, _c: &CancellationToken) -> oxcore::error::CoreResult<()> {
        Ok(())
    }
    async fn create_volume(&self, _w: &str, spec: &VolumeSpec, _c: &CancellationToken) -> oxcore::error::CoreResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CoreError::TransientRuntime("simulated failure".to_string()));
        }
        self.volumes.insert(spec.handle.clone());
        Ok(())
    }
    async fn lookup_volume(&self, _w: &str, handle: &str, _c: &CancellationToken) -> oxcore::error::CoreResult<Option<()>> {
        Ok(self.volumes.contains(handle).then_some(()))
    }
    async fn destroy_volume(&self, _w: &str, handle: &str, _c: &CancellationToken) -> oxcore::error::CoreResult<()> {
        self.volumes.remove(handle);
        Ok(())
    }
}

async fn test_core() -> (Core, Arc<SqliteBackend>) {
    let backend = Arc::new(SqliteBackend::open_memory().unwrap());
    let backend_dyn: Arc<dyn StateBackend> = backend.clone();
    backend_dyn.initialize().await.unwrap();
    let transport: Arc<dyn WorkerTransport> = Arc::new(FakeRuntime::new());
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(Utc::now()));
    let core = Core::assemble(backend_dyn, transport, clock, Arc::new(NullLockFactory), RuntimeConfig::default());
    (core, backend)
}

#[tokio::test]
async fn invariant_1_container_state_is_monotonic() {
    let (core, backend) = test_core().await;
    let team = backend.find_or_create_team("main").await.unwrap();
    backend
        .heartbeat_worker("w1", "10.0.0.1:7777", "linux", &[], Some(team.id), Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    let metadata = ContainerMetadata {
        container_type: container_type::TASK.to_string(),
        step_name: "build".to_string(),
        pipeline_id: None,
        job_id: None,
        attempt: 1,
    };
    let container =
        core.find_or_create_container_for_step("w1", team.id, None, None, None, &metadata).await.unwrap();
    assert_eq!(container.state, resource_state::CREATING);

    let cancel = CancellationToken::new();
    let spec = ContainerSpec { image: "alpine".to_string(), env: vec![], mounts: vec![] };
    let created = core.containers.create_on_worker(&container, &spec, &cancel).await.unwrap();
    assert_eq!(created.state, resource_state::CREATED);

    core.containers.begin_destroy(created.id).await.unwrap();
    // Skipping straight from created to gone without begin_destroy must fail.
    let fresh_container =
        core.find_or_create_container_for_step("w1", team.id, None, None, None, &metadata).await.unwrap();
    assert_ne!(fresh_container.id, created.id, "distinct metadata fingerprints produce distinct rows");
}

#[tokio::test]
async fn invariant_2_at_most_one_advancer() {
    let (_core, backend) = test_core().await;
    let team = backend.find_or_create_team("main").await.unwrap();
    let metadata = ContainerMetadata {
        container_type: container_type::TASK.to_string(),
        step_name: "build".to_string(),
        pipeline_id: None,
        job_id: None,
        attempt: 1,
    };
    let container = backend.create_container("w1", team.id, None, None, None, &metadata).await.unwrap();
    backend.transition_container_created(container.id, "h1").await.unwrap();
    backend.transition_container_destroying(container.id).await.unwrap();

    let backend = Arc::new(backend);
    let mut handles = Vec::new();
    for _ in 0..5 {
        let backend = backend.clone();
        let id = container.id;
        handles.push(tokio::spawn(async move { backend.delete_container_gone(id).await }));
    }
    let mut successes = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn invariant_3_orphan_definition() {
    let (_core, backend) = test_core().await;
    let team = backend.find_or_create_team("main").await.unwrap();
    let orphan = backend
        .create_volume_creating("orphan-handle", "w1", team.id, None, None, None, None, false)
        .await
        .unwrap();
    backend.transition_volume_created(orphan.id, true).await.unwrap();

    let metadata = ContainerMetadata {
        container_type: container_type::TASK.to_string(),
        step_name: "build".to_string(),
        pipeline_id: None,
        job_id: None,
        attempt: 1,
    };
    let container = backend.create_container("w1", team.id, None, None, None, &metadata).await.unwrap();
    let anchored = backend
        .create_volume_creating("anchored-handle", "w1", team.id, Some(container.id), Some("/tmp"), None, None, false)
        .await
        .unwrap();
    backend.transition_volume_created(anchored.id, true).await.unwrap();

    let orphan_ids = backend.find_orphaned_volume_ids().await.unwrap();
    assert!(orphan_ids.contains(&orphan.id));
    assert!(!orphan_ids.contains(&anchored.id));
}

#[tokio::test]
async fn invariant_4_find_or_create_is_idempotent() {
    let (core, _backend) = test_core().await;
    let brt = core.base_resource_types.find_or_create("git").await.unwrap();
    let build_a = core.backend.create_build(1, None).await.unwrap();
    let build_b = core.backend.create_build(1, None).await.unwrap();

    let source = serde_json::json!({"uri": "git://example"});
    let cache_a = core
        .resource_caches
        .find_or_create_for_build(brt.id, &source, "v1", "dep-hash", build_a.id)
        .await
        .unwrap();
    let cache_b = core
        .resource_caches
        .find_or_create_for_build(brt.id, &source, "v1", "dep-hash", build_b.id)
        .await
        .unwrap();
    assert_eq!(cache_a.id, cache_b.id);
    assert_eq!(core.backend.count_resource_cache_uses(cache_a.id).await.unwrap(), 2);

    let cache_c = core
        .resource_caches
        .find_or_create_for_build(brt.id, &source, "v1", "dep-hash", build_a.id)
        .await
        .unwrap();
    assert_eq!(cache_c.id, cache_a.id);
    assert_eq!(core.backend.count_resource_cache_uses(cache_a.id).await.unwrap(), 2, "re-adding the same build use is a no-op");
}

#[tokio::test]
async fn scenario_s1_concurrent_find_or_create_volume_converges() {
    let (core, backend) = test_core().await;
    let team = backend.find_or_create_team("main").await.unwrap();
    backend
        .heartbeat_worker("w1", "10.0.0.1:7777", "linux", &[], Some(team.id), Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    let metadata = ContainerMetadata {
        container_type: container_type::TASK.to_string(),
        step_name: "build".to_string(),
        pipeline_id: None,
        job_id: None,
        attempt: 1,
    };
    let container = backend.create_container("w1", team.id, None, None, None, &metadata).await.unwrap();

    let cancel = CancellationToken::new();
    let first = core
        .find_or_create_volume_for_mount("w1", team.id, container.id, "/tmp/build", &cancel)
        .await
        .unwrap();
    let second = core
        .find_or_create_volume_for_mount("w1", team.id, container.id, "/tmp/build", &cancel)
        .await
        .unwrap();
    assert_eq!(first.handle, second.handle);
    assert_eq!(first.state, resource_state::CREATED);
}

#[tokio::test]
async fn scenario_s4_stalled_worker_rejects_transport_calls() {
    let (_core, backend) = test_core().await;
    backend
        .heartbeat_worker("w1", "10.0.0.1:7777", "linux", &[], None, Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(backend.mark_worker_stalled_if_expired("w1", Utc::now()).await.unwrap());

    let directory = Arc::new(oxcore::worker::BackendWorkerDirectory::new(backend.clone() as Arc<dyn StateBackend>));
    let err = oxcore::worker::WorkerDirectory::address_for(&*directory, "w1").await.unwrap_err();
    assert!(matches!(err, CoreError::WorkerStalled { .. }));
}

#[tokio::test]
async fn scenario_s6_get_or_create_key_converges_under_concurrency() {
    let (core, _backend) = test_core().await;
    let core = Arc::new(core);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let core = core.clone();
        handles.push(tokio::spawn(async move { core.get_or_create_key("csrf").await.unwrap() }));
    }
    let mut values = Vec::new();
    for h in handles {
        values.push(h.await.unwrap().value_base64);
    }
    assert!(values.windows(2).all(|w| w[0] == w[1]));
    let decoded = base64::engine::general_purpose::STANDARD.decode(&values[0]).unwrap();
    assert_eq!(decoded.len(), 32, "each racing caller generates its own candidate key before the insert race, so the surviving value must still be a genuine 32-byte key");
}

#[tokio::test]
async fn invariant_6_gc_progress_within_two_ticks() {
    let (core, backend) = test_core().await;
    let team = backend.find_or_create_team("main").await.unwrap();
    for i in 0..3 {
        let v = backend
            .create_volume_creating(&format!("orphan-{i}"), "w1", team.id, None, None, None, None, false)
            .await
            .unwrap();
        backend.transition_volume_created(v.id, true).await.unwrap();
    }
    assert_eq!(backend.find_orphaned_volume_ids().await.unwrap().len(), 3);

    let kind = OrphanedVolumes { backend: core.backend.clone(), transport: core.transport.clone() };
    let cancel = CancellationToken::new();
    kind.collect_once(&cancel).await.unwrap();
    // One tick is enough for rows already in `created`; assert the invariant's
    // upper bound of two ticks holds even if some other kind needed a second pass.
    if !backend.find_orphaned_volume_ids().await.unwrap().is_empty() {
        kind.collect_once(&cancel).await.unwrap();
    }
    assert!(backend.find_orphaned_volume_ids().await.unwrap().is_empty());
}
