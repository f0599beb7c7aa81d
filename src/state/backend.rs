use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;

use super::models::{
    BaseResourceType, Build, Container, ContainerMetadata, Job, Key, Pipeline, ResourceCache,
    Team, Volume, Worker, WorkerBaseResourceType,
};

/// Pluggable relational store. Implemented by a Postgres backend (production —
/// advisory locks, LISTEN/NOTIFY) and a SQLite backend (reference/test).
///
/// Every state-changing method here is expected to be predicated on the row's
/// current state where the data model says so (see the `transition_*` methods):
/// an UPDATE/DELETE that matches zero rows means the expected precondition no
/// longer held and the caller lost a race, not that anything is broken.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Create tables, run migrations, record the current schema version.
    async fn initialize(&self) -> CoreResult<()>;

    // ─── Teams / pipelines / jobs / builds ──────────────────────────────────

    async fn find_or_create_team(&self, name: &str) -> CoreResult<Team>;
    async fn find_or_create_pipeline(&self, team_id: i64, name: &str) -> CoreResult<Pipeline>;
    async fn find_or_create_job(&self, pipeline_id: i64, name: &str) -> CoreResult<Job>;
    async fn create_build(&self, team_id: i64, job_id: Option<i64>) -> CoreResult<Build>;
    async fn get_build(&self, id: i64) -> CoreResult<Option<Build>>;
    /// Deletes the build row; any resource-cache-uses-by-build rows referencing it
    /// are removed by the `ON DELETE CASCADE` foreign key.
    async fn delete_build(&self, id: i64) -> CoreResult<()>;

    // ─── Workers ─────────────────────────────────────────────────────────────

    /// Upserts the worker row and resets `expires_at`, as if the worker just
    /// checked in. A worker previously `stalled` transitions back to `running`.
    async fn heartbeat_worker(
        &self,
        name: &str,
        address: &str,
        platform: &str,
        tags: &[String],
        team_id: Option<i64>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<Worker>;

    async fn get_worker(&self, name: &str) -> CoreResult<Option<Worker>>;
    async fn list_workers(&self) -> CoreResult<Vec<Worker>>;

    /// `running -> stalled`, only if `expires_at` is in the past as of `now`.
    /// Returns whether the transition actually happened.
    async fn mark_worker_stalled_if_expired(&self, name: &str, now: DateTime<Utc>) -> CoreResult<bool>;

    /// Workers with `state = running` and `expires_at < now` — GC candidates for
    /// [`StateBackend::mark_worker_stalled_if_expired`].
    async fn find_stale_worker_names(&self, now: DateTime<Utc>) -> CoreResult<Vec<String>>;

    // ─── Base/worker resource types ─────────────────────────────────────────

    async fn find_or_create_base_resource_type(&self, name: &str) -> CoreResult<BaseResourceType>;

    /// Binds a (worker, base_resource_type, version) triple. If a prior binding for
    /// the same (worker, base_resource_type) exists with a different version, that
    /// row's `superseded_at` is set rather than deleted.
    async fn bind_worker_resource_type(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
        image_path: &str,
        version: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkerBaseResourceType>;

    async fn active_worker_resource_type(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
    ) -> CoreResult<Option<WorkerBaseResourceType>>;

    // ─── Resource caches ─────────────────────────────────────────────────────

    async fn find_or_create_resource_cache(
        &self,
        base_resource_type_id: i64,
        source_hash: &str,
        version: &str,
        dependency_chain_hash: &str,
    ) -> CoreResult<ResourceCache>;

    async fn get_resource_cache(&self, id: i64) -> CoreResult<Option<ResourceCache>>;

    /// Idempotent: adding a use that already exists is a no-op, not a conflict.
    async fn add_resource_cache_use_by_build(&self, cache_id: i64, build_id: i64) -> CoreResult<()>;
    async fn add_resource_cache_use_by_container(&self, cache_id: i64, container_id: i64) -> CoreResult<()>;

    /// Total reference count across both use tables, for orphan detection.
    async fn count_resource_cache_uses(&self, cache_id: i64) -> CoreResult<i64>;

    /// Resource caches with zero rows in either use table.
    async fn find_orphaned_resource_cache_ids(&self) -> CoreResult<Vec<i64>>;
    async fn delete_resource_cache(&self, id: i64) -> CoreResult<()>;

    // ─── Containers ──────────────────────────────────────────────────────────

    /// Looks for an existing container keyed by (worker, team, metadata fingerprint)
    /// in state `creating` or `created`; ties broken by lowest id.
    async fn find_container(
        &self,
        worker_name: &str,
        team_id: i64,
        metadata: &ContainerMetadata,
    ) -> CoreResult<Option<Container>>;

    /// Inserts a new container row in state `creating` with `handle = NULL`.
    #[allow(clippy::too_many_arguments)]
    async fn create_container(
        &self,
        worker_name: &str,
        team_id: i64,
        build_id: Option<i64>,
        resource_cache_id: Option<i64>,
        image_resource_cache_id: Option<i64>,
        metadata: &ContainerMetadata,
    ) -> CoreResult<Container>;

    async fn get_container(&self, id: i64) -> CoreResult<Option<Container>>;

    /// `creating -> created`, setting `handle`. Fails with `StateConflict` if the
    /// container is no longer `creating` (e.g. a concurrent destroy won the race).
    async fn transition_container_created(&self, id: i64, handle: &str) -> CoreResult<()>;

    /// `created -> destroying`.
    async fn transition_container_destroying(&self, id: i64) -> CoreResult<()>;

    /// `destroying -> gone`: deletes the row outright.
    async fn delete_container_gone(&self, id: i64) -> CoreResult<()>;

    /// Sets `best_if_used_by` on a `created` container (a no-op on any other state).
    async fn set_container_best_if_used_by(
        &self,
        id: i64,
        best_if_used_by: Option<DateTime<Utc>>,
    ) -> CoreResult<()>;

    /// `created` containers whose `best_if_used_by` has passed `now`.
    async fn find_expired_container_ids(&self, now: DateTime<Utc>) -> CoreResult<Vec<i64>>;

    // ─── Volumes ─────────────────────────────────────────────────────────────

    async fn find_volume_for_container(
        &self,
        container_id: i64,
        mount_path: &str,
    ) -> CoreResult<Option<Volume>>;

    #[allow(clippy::too_many_arguments)]
    async fn create_volume_creating(
        &self,
        handle: &str,
        worker_name: &str,
        team_id: i64,
        container_id: Option<i64>,
        mount_path: Option<&str>,
        resource_cache_id: Option<i64>,
        base_resource_type_id: Option<i64>,
        worker_resource_certs: bool,
    ) -> CoreResult<Volume>;

    async fn get_volume(&self, id: i64) -> CoreResult<Option<Volume>>;
    async fn get_volume_by_handle(&self, handle: &str) -> CoreResult<Option<Volume>>;

    /// `creating -> created`, recording whether the runtime finished initializing it.
    async fn transition_volume_created(&self, id: i64, initialized: bool) -> CoreResult<()>;

    /// `created -> destroying`.
    async fn transition_volume_destroying(&self, id: i64) -> CoreResult<()>;

    /// `destroying -> gone`: deletes the row outright.
    async fn delete_volume_gone(&self, id: i64) -> CoreResult<()>;

    /// Volumes in {created, destroying} with every parent-reference column NULL.
    async fn find_orphaned_volume_ids(&self) -> CoreResult<Vec<i64>>;

    // ─── Keys ────────────────────────────────────────────────────────────────

    /// Returns the existing key if present, otherwise inserts `new_value_base64`
    /// and returns that — racing callers converge on whichever insert landed first.
    async fn get_or_create_key(&self, name: &str, new_value_base64: &str) -> CoreResult<Key>;

    // ─── Notifications ───────────────────────────────────────────────────────

    /// Best-effort: publishes a change notification on `channel` so other
    /// processes sharing the store can react without polling. Backends that can't
    /// support this (the SQLite reference backend) treat it as a no-op.
    async fn notify(&self, channel: &str, payload: &str) -> CoreResult<()>;
}
