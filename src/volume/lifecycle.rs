use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::state::models::Volume;
use crate::state::StateBackend;

/// Same three-state schema as containers, with one structural difference: a
/// volume's handle is a v4 UUID assigned when the row is inserted, since the
/// runtime needs it up front to create the volume under that name.
pub struct VolumeLifecycle {
    backend: Arc<dyn StateBackend>,
}

impl VolumeLifecycle {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub fn new_handle() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_creating(
        &self,
        handle: &str,
        worker_name: &str,
        team_id: i64,
        container_id: Option<i64>,
        mount_path: Option<&str>,
        resource_cache_id: Option<i64>,
        base_resource_type_id: Option<i64>,
        worker_resource_certs: bool,
    ) -> CoreResult<Volume> {
        self.backend
            .create_volume_creating(
                handle,
                worker_name,
                team_id,
                container_id,
                mount_path,
                resource_cache_id,
                base_resource_type_id,
                worker_resource_certs,
            )
            .await
    }

    /// `creating -> created`, recording whether the runtime finished populating it.
    pub async fn mark_created(&self, id: i64, initialized: bool) -> CoreResult<()> {
        self.backend.transition_volume_created(id, initialized).await
    }

    /// `created -> destroying`.
    pub async fn begin_destroy(&self, id: i64) -> CoreResult<()> {
        self.backend.transition_volume_destroying(id).await
    }

    /// `destroying -> gone`.
    pub async fn finalize_gone(&self, id: i64) -> CoreResult<()> {
        self.backend.delete_volume_gone(id).await
    }

    pub async fn fetch(&self, id: i64) -> CoreResult<Volume> {
        self.backend
            .get_volume(id)
            .await?
            .ok_or_else(|| CoreError::not_found("volume", id.to_string()))
    }

    /// Every volume in {created, destroying} with no parent reference —
    /// candidates for the garbage collector's orphan sweep.
    pub async fn orphaned_ids(&self) -> CoreResult<Vec<i64>> {
        self.backend.find_orphaned_volume_ids().await
    }
}
