use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::state::models::{resource_state, Volume};
use crate::state::StateBackend;
use crate::worker::{VolumeSpec, WorkerTransport};

use super::lifecycle::VolumeLifecycle;

/// The reconciliation point between durable DB state and the worker's volatile
/// runtime: the DB row and the runtime's notion of the volume can each exist
/// independently of the other, and every entry point has to reconcile whichever
/// three-way combination it finds rather than assume the happy path.
pub struct VolumeClient {
    backend: Arc<dyn StateBackend>,
    transport: Arc<dyn WorkerTransport>,
    lifecycle: VolumeLifecycle,
}

impl VolumeClient {
    pub fn new(backend: Arc<dyn StateBackend>, transport: Arc<dyn WorkerTransport>) -> Self {
        let lifecycle = VolumeLifecycle::new(backend.clone());
        Self { backend, transport, lifecycle }
    }

    /// Idempotent under retry: a caller that calls this twice concurrently for
    /// the same `(team, worker, container, mount_path)` converges on one row and
    /// one runtime volume, because the DB insert that wins the race is the only
    /// one that reaches the runtime-create step for a brand new row.
    pub async fn find_or_create_for_container(
        &self,
        worker_name: &str,
        team_id: i64,
        container_id: i64,
        mount_path: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Volume> {
        match self.backend.find_volume_for_container(container_id, mount_path).await? {
            None => self.create_fresh(worker_name, team_id, container_id, mount_path, cancel).await,
            Some(v) if v.state == resource_state::CREATING => self.reconcile_creating(v, cancel).await,
            Some(v) if v.state == resource_state::CREATED => self.reconcile_created(v, cancel).await,
            Some(v) => Ok(v),
        }
    }

    async fn create_fresh(
        &self,
        worker_name: &str,
        team_id: i64,
        container_id: i64,
        mount_path: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Volume> {
        let handle = VolumeLifecycle::new_handle();
        let volume = match self
            .lifecycle
            .create_creating(&handle, worker_name, team_id, Some(container_id), Some(mount_path), None, None, false)
            .await
        {
            Ok(v) => v,
            // Lost the insert race to a concurrent caller: re-read what they created.
            Err(CoreError::AlreadyExists { .. }) => self
                .backend
                .find_volume_for_container(container_id, mount_path)
                .await?
                .ok_or_else(|| CoreError::not_found("volume", format!("container={container_id} mount={mount_path}")))?,
            Err(e) => return Err(e),
        };
        match volume.state.as_str() {
            s if s == resource_state::CREATING => self.reconcile_creating(volume, cancel).await,
            s if s == resource_state::CREATED => self.reconcile_created(volume, cancel).await,
            _ => Ok(volume),
        }
    }

    async fn reconcile_creating(&self, volume: Volume, cancel: &CancellationToken) -> CoreResult<Volume> {
        let present = self.transport.lookup_volume(&volume.worker_name, &volume.handle, cancel).await?;
        if present.is_none() {
            let spec = VolumeSpec { handle: volume.handle.clone(), parent_handle: None };
            self.transport.create_volume(&volume.worker_name, &spec, cancel).await?;
        }
        match self.lifecycle.mark_created(volume.id, true).await {
            Ok(()) => self.lifecycle.fetch(volume.id).await,
            // Another caller already advanced this row past `creating`; return its
            // current state rather than treating the lost race as a failure.
            Err(CoreError::StateConflict { .. }) => self.lifecycle.fetch(volume.id).await,
            Err(e) => Err(e),
        }
    }

    async fn reconcile_created(&self, volume: Volume, cancel: &CancellationToken) -> CoreResult<Volume> {
        let present = self.transport.lookup_volume(&volume.worker_name, &volume.handle, cancel).await?;
        if present.is_none() {
            return Err(CoreError::RuntimeStateDrift {
                entity: "volume",
                id: volume.id.to_string(),
                detail: "db row is created but the runtime has no volume by this handle".to_string(),
            });
        }
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dashmap::DashSet;
    use std::sync::Arc;

    use crate::state::models::container_type;
    use crate::state::models::ContainerMetadata;
    use crate::state::sqlite::SqliteBackend;
    use crate::worker::ContainerSpec;

    struct FakeTransport {
        known_volumes: DashSet<String>,
        create_calls: std::sync::atomic::AtomicUsize,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self { known_volumes: DashSet::new(), create_calls: std::sync::atomic::AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl WorkerTransport for FakeTransport {
        async fn create_container(&self, _w: &str, _s: &ContainerSpec, _c: &CancellationToken) -> CoreResult<String> {
            unimplemented!("not exercised by volume client tests")
        }
        async fn destroy_container(&self, _w: &str, _h: &str, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn create_volume(&self, _w: &str, spec: &VolumeSpec, _c: &CancellationToken) -> CoreResult<()> {
            self.create_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.known_volumes.insert(spec.handle.clone());
            Ok(())
        }
        async fn lookup_volume(&self, _w: &str, handle: &str, _c: &CancellationToken) -> CoreResult<Option<()>> {
            Ok(self.known_volumes.contains(handle).then_some(()))
        }
        async fn destroy_volume(&self, _w: &str, handle: &str, _c: &CancellationToken) -> CoreResult<()> {
            self.known_volumes.remove(handle);
            Ok(())
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent_on_retry() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let team = backend.find_or_create_team("main").await.unwrap();
        backend
            .heartbeat_worker("w1", "10.0.0.1:7777", "linux", &[], Some(team.id), chrono::Utc::now() + chrono::Duration::seconds(60))
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

        let transport: Arc<dyn WorkerTransport> = Arc::new(FakeTransport::new());
        let client = VolumeClient::new(backend.clone(), transport.clone());
        let cancel = CancellationToken::new();

        let first = client.find_or_create_for_container("w1", team.id, container.id, "/tmp/build", &cancel).await.unwrap();
        let second = client.find_or_create_for_container("w1", team.id, container.id, "/tmp/build", &cancel).await.unwrap();

        assert_eq!(first.handle, second.handle);
        assert_eq!(first.state, crate::state::models::resource_state::CREATED.to_string());
    }

    #[tokio::test]
    async fn created_volume_missing_on_runtime_is_drift() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let team = backend.find_or_create_team("main").await.unwrap();
        backend
            .heartbeat_worker("w1", "10.0.0.1:7777", "linux", &[], Some(team.id), chrono::Utc::now() + chrono::Duration::seconds(60))
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
        let handle = VolumeLifecycle::new_handle();
        backend
            .create_volume_creating(&handle, "w1", team.id, Some(container.id), Some("/tmp/build"), None, None, false)
            .await
            .unwrap();
        let volume = backend.find_volume_for_container(container.id, "/tmp/build").await.unwrap().unwrap();
        backend.transition_volume_created(volume.id, true).await.unwrap();

        // The runtime never learned about this handle — an empty FakeTransport.
        let transport: Arc<dyn WorkerTransport> = Arc::new(FakeTransport::new());
        let client = VolumeClient::new(backend.clone(), transport);
        let cancel = CancellationToken::new();

        let result = client.find_or_create_for_container("w1", team.id, container.id, "/tmp/build", &cancel).await;
        assert!(matches!(result, Err(CoreError::RuntimeStateDrift { .. })));
    }
}
