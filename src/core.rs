use std::sync::Arc;

use chrono::Utc;

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::container::ContainerLifecycle;
use crate::error::CoreResult;
use crate::gc::{Collector, ExpiredContainers, OrphanedResourceCaches, OrphanedVolumes, StalledWorkers};
use crate::keys::KeyStore;
use crate::registry::{BaseResourceTypeRegistry, ResourceCacheRegistry, WorkerResourceTypeRegistry};
use crate::state::lock::{LockFactory, NullLockFactory, PgLockFactory};
use crate::state::models::{Container, ContainerMetadata, Key, Volume};
use crate::state::postgres::PostgresBackend;
use crate::state::sqlite::SqliteBackend;
use crate::state::StateBackend;
use crate::volume::VolumeClient;
use crate::worker::{BackendWorkerDirectory, CachingTransport, HttpRuntimeClient, WorkerTransport};
use tokio_util::sync::CancellationToken;

/// Bundles the trait objects the rest of the crate is written against, built once
/// per process from a [`RuntimeConfig`]. Every component here is a trait object
/// rather than a generic parameter, matching how the rest of the composition
/// (registries, transport) favors dynamic dispatch at the seams where an
/// embedder might substitute its own implementation. There is deliberately no
/// package-level singleton — an embedding service can run more than one `Core`
/// side by side (e.g. pointed at two different databases in a test).
pub struct Core {
    pub backend: Arc<dyn StateBackend>,
    pub transport: Arc<dyn WorkerTransport>,
    pub clock: Arc<dyn Clock>,
    pub lock_factory: Arc<dyn LockFactory>,
    pub config: RuntimeConfig,
    pub containers: ContainerLifecycle,
    pub volumes: VolumeClient,
    pub base_resource_types: BaseResourceTypeRegistry,
    pub worker_resource_types: WorkerResourceTypeRegistry,
    pub resource_caches: ResourceCacheRegistry,
    pub keys: KeyStore,
}

impl Core {
    /// Connects to the store named by `config.db_dsn` (a `postgres://` URL picks
    /// the Postgres backend and its advisory-lock factory; anything else is
    /// treated as a SQLite file path and paired with the null lock factory),
    /// runs migrations, and wires every component on top.
    pub async fn connect(config: RuntimeConfig) -> CoreResult<Self> {
        let (backend, lock_factory): (Arc<dyn StateBackend>, Arc<dyn LockFactory>) =
            if config.db_dsn.starts_with("postgres://") || config.db_dsn.starts_with("postgresql://") {
                let pg = PostgresBackend::connect(&config.db_dsn, config.db_max_conns).await?;
                let lock_factory = Arc::new(PgLockFactory::new(pg.pool().clone()));
                (Arc::new(pg), lock_factory)
            } else {
                let sqlite = SqliteBackend::open(&config.db_dsn).map_err(crate::error::CoreError::Other)?;
                (Arc::new(sqlite), Arc::new(NullLockFactory))
            };
        backend.initialize().await?;

        let directory = Arc::new(BackendWorkerDirectory::new(backend.clone()));
        let runtime = Arc::new(HttpRuntimeClient::default());
        let transport: Arc<dyn WorkerTransport> = Arc::new(CachingTransport::new(directory, runtime));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        Ok(Self::assemble(backend, transport, clock, lock_factory, config))
    }

    /// Wires a `Core` from already-constructed components. Used directly by
    /// tests that substitute a fake transport or a `FakeClock`.
    pub fn assemble(
        backend: Arc<dyn StateBackend>,
        transport: Arc<dyn WorkerTransport>,
        clock: Arc<dyn Clock>,
        lock_factory: Arc<dyn LockFactory>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            containers: ContainerLifecycle::new(backend.clone(), transport.clone()),
            volumes: VolumeClient::new(backend.clone(), transport.clone()),
            base_resource_types: BaseResourceTypeRegistry::new(backend.clone()),
            worker_resource_types: WorkerResourceTypeRegistry::new(backend.clone(), clock.clone()),
            resource_caches: ResourceCacheRegistry::new(backend.clone()),
            keys: KeyStore::new(backend.clone()),
            backend,
            transport,
            clock,
            lock_factory,
            config,
        }
    }

    /// Builds the four periodic collectors described by the garbage collection
    /// design, ticking on `config.gc_interval`. Callers spawn `collector.run(...)`
    /// as a background task; `Core` itself does not spawn anything implicitly.
    pub fn collector(&self) -> Collector {
        let kinds: Vec<Arc<dyn crate::gc::CollectorKind>> = vec![
            Arc::new(OrphanedVolumes { backend: self.backend.clone(), transport: self.transport.clone() }),
            Arc::new(ExpiredContainers {
                backend: self.backend.clone(),
                transport: self.transport.clone(),
                clock: self.clock.clone(),
            }),
            Arc::new(OrphanedResourceCaches { backend: self.backend.clone() }),
            Arc::new(StalledWorkers { backend: self.backend.clone(), clock: self.clock.clone() }),
        ];
        Collector::new(kinds, self.lock_factory.clone(), self.config.gc_interval)
    }

    // ─── Exposed operations ──────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create_container_for_step(
        &self,
        worker_name: &str,
        team_id: i64,
        build_id: Option<i64>,
        resource_cache_id: Option<i64>,
        image_resource_cache_id: Option<i64>,
        metadata: &ContainerMetadata,
    ) -> CoreResult<Container> {
        self.containers
            .find_or_create(worker_name, team_id, build_id, resource_cache_id, image_resource_cache_id, metadata)
            .await
    }

    pub async fn find_or_create_volume_for_mount(
        &self,
        worker_name: &str,
        team_id: i64,
        container_id: i64,
        mount_path: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Volume> {
        self.volumes.find_or_create_for_container(worker_name, team_id, container_id, mount_path, cancel).await
    }

    pub async fn get_volume_by_handle(&self, handle: &str) -> CoreResult<Option<Volume>> {
        self.backend.get_volume_by_handle(handle).await
    }

    /// Returns the named key, generating a fresh 32-byte random one on first call.
    pub async fn get_or_create_key(&self, name: &str) -> CoreResult<Key> {
        self.keys.get_or_create(name).await
    }

    pub async fn list_orphaned_volumes(&self) -> CoreResult<Vec<Volume>> {
        let ids = self.backend.find_orphaned_volume_ids().await?;
        let mut volumes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(v) = self.backend.get_volume(id).await? {
                volumes.push(v);
            }
        }
        Ok(volumes)
    }

    /// Releases a container produced for a step, setting its grace window to
    /// `config.container_final_ttl` from now so the GC's expired-container sweep
    /// picks it up once that window passes.
    pub async fn release_container(&self, id: i64) -> CoreResult<()> {
        let expires = Utc::now() + chrono::Duration::from_std(self.config.container_final_ttl).unwrap_or_default();
        self.containers.release(id, Some(expires)).await
    }
}
