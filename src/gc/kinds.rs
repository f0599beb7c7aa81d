use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::state::models::resource_state;
use crate::state::StateBackend;
use crate::worker::WorkerTransport;

/// One periodic sweep: discover candidate ids from a snapshot query, then attempt
/// the destructive transition on each independently. A candidate another process
/// already advanced past its expected source state is not a failure for this
/// pass — there's simply nothing left for this id this tick.
#[async_trait]
pub trait CollectorKind: Send + Sync {
    fn name(&self) -> &'static str;
    async fn collect_once(&self, cancel: &CancellationToken) -> CoreResult<usize>;
}

/// Volumes in `{created, destroying}` with every parent reference NULL.
pub struct OrphanedVolumes {
    pub backend: Arc<dyn StateBackend>,
    pub transport: Arc<dyn WorkerTransport>,
}

#[async_trait]
impl CollectorKind for OrphanedVolumes {
    fn name(&self) -> &'static str {
        "orphaned_volumes"
    }

    async fn collect_once(&self, cancel: &CancellationToken) -> CoreResult<usize> {
        let ids = self.backend.find_orphaned_volume_ids().await?;
        let mut reaped = 0;
        for id in ids {
            if self.reap_one(id, cancel).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

impl OrphanedVolumes {
    async fn reap_one(&self, id: i64, cancel: &CancellationToken) -> CoreResult<bool> {
        let volume = match self.backend.get_volume(id).await? {
            Some(v) => v,
            None => return Ok(false),
        };
        if volume.state == resource_state::CREATED {
            match self.backend.transition_volume_destroying(id).await {
                Ok(()) => {}
                Err(CoreError::StateConflict { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        crate::retry::with_retry(2, 200, "gc:destroy_volume", || {
            self.transport.destroy_volume(&volume.worker_name, &volume.handle, cancel)
        })
        .await?;
        match self.backend.delete_volume_gone(id).await {
            Ok(()) => Ok(true),
            Err(CoreError::StateConflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// `created` containers past their `best_if_used_by`.
pub struct ExpiredContainers {
    pub backend: Arc<dyn StateBackend>,
    pub transport: Arc<dyn WorkerTransport>,
    pub clock: Arc<dyn Clock>,
}

#[async_trait]
impl CollectorKind for ExpiredContainers {
    fn name(&self) -> &'static str {
        "expired_containers"
    }

    async fn collect_once(&self, cancel: &CancellationToken) -> CoreResult<usize> {
        let now = self.clock.now();
        let ids = self.backend.find_expired_container_ids(now).await?;
        let mut reaped = 0;
        for id in ids {
            if self.reap_one(id, cancel).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

impl ExpiredContainers {
    async fn reap_one(&self, id: i64, cancel: &CancellationToken) -> CoreResult<bool> {
        let container = match self.backend.get_container(id).await? {
            Some(c) => c,
            None => return Ok(false),
        };
        match self.backend.transition_container_destroying(id).await {
            Ok(()) => {}
            Err(CoreError::StateConflict { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        if let Some(handle) = &container.handle {
            crate::retry::with_retry(2, 200, "gc:destroy_container", || {
                self.transport.destroy_container(&container.worker_name, handle, cancel)
            })
            .await?;
        }
        match self.backend.delete_container_gone(id).await {
            Ok(()) => Ok(true),
            Err(CoreError::StateConflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Resource caches with zero references from either use table. No runtime
/// contact needed — caches have no handle of their own on the worker side,
/// only the volumes backing them do, and those are reaped separately once this
/// deletion drops their last reference.
pub struct OrphanedResourceCaches {
    pub backend: Arc<dyn StateBackend>,
}

#[async_trait]
impl CollectorKind for OrphanedResourceCaches {
    fn name(&self) -> &'static str {
        "orphaned_resource_caches"
    }

    async fn collect_once(&self, _cancel: &CancellationToken) -> CoreResult<usize> {
        let ids = self.backend.find_orphaned_resource_cache_ids().await?;
        let mut reaped = 0;
        for id in ids {
            // Re-check under the fresh read: a reference may have been added
            // since the snapshot was taken.
            if self.backend.count_resource_cache_uses(id).await? > 0 {
                continue;
            }
            match self.backend.delete_resource_cache(id).await {
                Ok(()) => reaped += 1,
                Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }
}

/// `running` workers whose `expires_at` has passed.
pub struct StalledWorkers {
    pub backend: Arc<dyn StateBackend>,
    pub clock: Arc<dyn Clock>,
}

#[async_trait]
impl CollectorKind for StalledWorkers {
    fn name(&self) -> &'static str {
        "stalled_workers"
    }

    async fn collect_once(&self, _cancel: &CancellationToken) -> CoreResult<usize> {
        let now = self.clock.now();
        let names = self.backend.find_stale_worker_names(now).await?;
        let mut reaped = 0;
        for name in names {
            if self.backend.mark_worker_stalled_if_expired(&name, now).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::state::models::{container_type, ContainerMetadata};
    use crate::state::sqlite::SqliteBackend;
    use crate::worker::{ContainerSpec, VolumeSpec};
    use async_trait::async_trait;
    use chrono::Utc;

    struct NoopTransport;

    #[async_trait]
    impl WorkerTransport for NoopTransport {
        async fn create_container(&self, _w: &str, _s: &ContainerSpec, _c: &CancellationToken) -> CoreResult<String> {
            Ok("unused".to_string())
        }
        async fn destroy_container(&self, _w: &str, _h: &str, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn create_volume(&self, _w: &str, _s: &VolumeSpec, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn lookup_volume(&self, _w: &str, _h: &str, _c: &CancellationToken) -> CoreResult<Option<()>> {
            Ok(None)
        }
        async fn destroy_volume(&self, _w: &str, _h: &str, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn orphaned_volume_reaped_in_one_tick() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let team = backend.find_or_create_team("main").await.unwrap();
        let volume = backend
            .create_volume_creating("handle-1", "w1", team.id, None, None, None, None, false)
            .await
            .unwrap();
        backend.transition_volume_created(volume.id, true).await.unwrap();
        assert!(!backend.find_orphaned_volume_ids().await.unwrap().is_empty());

        let kind = OrphanedVolumes { backend: backend.clone(), transport: Arc::new(NoopTransport) };
        let cancel = CancellationToken::new();
        let reaped = kind.collect_once(&cancel).await.unwrap();
        assert_eq!(reaped, 1);
        assert!(backend.get_volume(volume.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_workers_transition_only_past_expiry() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let clock = Arc::new(FakeClock::new(Utc::now()));
        backend
            .heartbeat_worker("w1", "10.0.0.1:7777", "linux", &[], None, clock.now() + chrono::Duration::seconds(10))
            .await
            .unwrap();

        let kind = StalledWorkers { backend: backend.clone(), clock: clock.clone() };
        let cancel = CancellationToken::new();
        assert_eq!(kind.collect_once(&cancel).await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(20));
        assert_eq!(kind.collect_once(&cancel).await.unwrap(), 1);
        let worker = backend.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.state, crate::state::models::worker_state::STALLED);
    }

    #[tokio::test]
    async fn expired_container_reaped() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let team = backend.find_or_create_team("main").await.unwrap();
        let metadata = ContainerMetadata {
            container_type: container_type::TASK.to_string(),
            step_name: "build".to_string(),
            pipeline_id: None,
            job_id: None,
            attempt: 1,
        };
        let container = backend.create_container("w1", team.id, None, None, None, &metadata).await.unwrap();
        backend.transition_container_created(container.id, "handle-1").await.unwrap();
        let clock = FakeClock::new(Utc::now());
        backend
            .set_container_best_if_used_by(container.id, Some(clock.now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let kind = ExpiredContainers {
            backend: backend.clone(),
            transport: Arc::new(NoopTransport),
            clock: Arc::new(clock),
        };
        let cancel = CancellationToken::new();
        assert_eq!(kind.collect_once(&cancel).await.unwrap(), 1);
        assert!(backend.get_container(container.id).await.unwrap().is_none());
    }
}
