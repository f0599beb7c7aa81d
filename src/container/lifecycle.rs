use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::state::models::{Container, ContainerMetadata};
use crate::state::StateBackend;
use crate::worker::{ContainerSpec, WorkerTransport};

/// `creating -> created -> destroying -> gone`, find-or-create keyed by
/// (worker, team, metadata fingerprint). Every transition is state-predicated at
/// the store: an UPDATE/DELETE that affects zero rows means a concurrent caller
/// already moved the row and this caller lost the race, surfaced as
/// [`CoreError::StateConflict`] rather than silently succeeding.
pub struct ContainerLifecycle {
    backend: Arc<dyn StateBackend>,
    transport: Arc<dyn WorkerTransport>,
}

impl ContainerLifecycle {
    pub fn new(backend: Arc<dyn StateBackend>, transport: Arc<dyn WorkerTransport>) -> Self {
        Self { backend, transport }
    }

    /// Returns an existing `creating`/`created` container with the same
    /// (worker, team, metadata) if one exists; otherwise inserts a new row in
    /// `creating` state with no runtime handle yet.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_or_create(
        &self,
        worker_name: &str,
        team_id: i64,
        build_id: Option<i64>,
        resource_cache_id: Option<i64>,
        image_resource_cache_id: Option<i64>,
        metadata: &ContainerMetadata,
    ) -> CoreResult<Container> {
        if let Some(existing) = self.backend.find_container(worker_name, team_id, metadata).await? {
            return Ok(existing);
        }
        self.backend
            .create_container(worker_name, team_id, build_id, resource_cache_id, image_resource_cache_id, metadata)
            .await
    }

    /// Asks the worker's runtime to actually create the container, then records
    /// the handle and flips the row to `created`. If the state-predicated update
    /// loses a race (the container was concurrently destroyed), the runtime side
    /// effect already happened — callers that see `StateConflict` here should
    /// treat the freshly-created handle as leaked and let garbage collection or
    /// a subsequent reconcile pass clean it up.
    pub async fn create_on_worker(
        &self,
        container: &Container,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<Container> {
        let handle = self.transport.create_container(&container.worker_name, spec, cancel).await?;
        self.backend.transition_container_created(container.id, &handle).await?;
        self.fetch(container.id).await
    }

    /// Marks a `created` container as reusable until `best_if_used_by`, or
    /// immediately reusable if `None`.
    pub async fn release(&self, id: i64, best_if_used_by: Option<DateTime<Utc>>) -> CoreResult<()> {
        self.backend.set_container_best_if_used_by(id, best_if_used_by).await
    }

    /// `created -> destroying`. Does not contact the runtime — that happens in
    /// [`Self::destroy_on_worker_and_finalize`], kept separate so the state
    /// transition and the runtime round-trip can retry independently.
    pub async fn begin_destroy(&self, id: i64) -> CoreResult<()> {
        self.backend.transition_container_destroying(id).await
    }

    /// Contacts the runtime to tear down a `destroying` container, then deletes
    /// the row outright (`destroying -> gone`). A container with no handle (it
    /// never made it past `creating`) skips the runtime call.
    pub async fn destroy_on_worker_and_finalize(&self, id: i64, cancel: &CancellationToken) -> CoreResult<()> {
        let container = self.fetch(id).await?;
        if let Some(handle) = &container.handle {
            self.transport.destroy_container(&container.worker_name, handle, cancel).await?;
        }
        self.backend.delete_container_gone(id).await
    }

    async fn fetch(&self, id: i64) -> CoreResult<Container> {
        self.backend
            .get_container(id)
            .await?
            .ok_or_else(|| CoreError::not_found("container", id.to_string()))
    }
}
