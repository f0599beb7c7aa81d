use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::state::models::WorkerBaseResourceType;
use crate::state::StateBackend;

/// Binds a worker to the version of a base resource type it currently has
/// checked out locally. Rebinding to a new version supersedes the old binding
/// rather than deleting it — resource caches produced under the old version may
/// still be referenced, and deleting the row would orphan that history.
pub struct WorkerResourceTypeRegistry {
    backend: Arc<dyn StateBackend>,
    clock: Arc<dyn Clock>,
}

impl WorkerResourceTypeRegistry {
    pub fn new(backend: Arc<dyn StateBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Binding the exact same (worker, base_resource_type, version) triple twice
    /// trips the table's unique constraint rather than silently upserting — the
    /// backend surfaces that as `AlreadyExists`, and this re-reads the row that
    /// won the race rather than propagating the error.
    pub async fn bind(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
        image_path: &str,
        version: &str,
    ) -> CoreResult<WorkerBaseResourceType> {
        match self
            .backend
            .bind_worker_resource_type(worker_name, base_resource_type_id, image_path, version, self.clock.now())
            .await
        {
            Ok(binding) => Ok(binding),
            Err(CoreError::AlreadyExists { .. }) => self
                .backend
                .active_worker_resource_type(worker_name, base_resource_type_id)
                .await?
                .ok_or_else(|| {
                    CoreError::not_found(
                        "worker_base_resource_type",
                        format!("{worker_name}/{base_resource_type_id}/{version}"),
                    )
                }),
            Err(e) => Err(e),
        }
    }

    pub async fn active_binding(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
    ) -> CoreResult<Option<WorkerBaseResourceType>> {
        self.backend.active_worker_resource_type(worker_name, base_resource_type_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::state::sqlite::SqliteBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn rebinding_the_same_version_recovers_by_re_reading() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let brt = backend.find_or_create_base_resource_type("git").await.unwrap();
        let registry = WorkerResourceTypeRegistry::new(backend, Arc::new(SystemClock));

        let first = registry.bind("worker-1", brt.id, "/images/git", "v1").await.unwrap();
        let second = registry.bind("worker-1", brt.id, "/images/git", "v1").await.unwrap();
        assert_eq!(first.version, second.version);
        assert!(second.superseded_at.is_none());
    }
}
