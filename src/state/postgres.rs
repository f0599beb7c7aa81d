use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{classify_sqlx_error, CoreError, CoreResult};

use super::backend::StateBackend;
use super::migration;
use super::models::*;

/// Primary production backend. Postgres-specific primitives (advisory locks via
/// [`super::lock::PgLockFactory`], LISTEN/NOTIFY via [`StateBackend::notify`]) are
/// why this backend exists instead of standardizing on the SQLite one everywhere.
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(dsn: &str, max_conns: u32) -> CoreResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_conns)
            .connect(dsn)
            .await
            .map_err(|e| CoreError::TransientStore(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn worker_from_row(row: &sqlx::postgres::PgRow) -> Worker {
        let base_resource_types_json: String = row.get("base_resource_types");
        let tags_json: String = row.get("tags");
        Worker {
            name: row.get("name"),
            address: row.get("address"),
            expires_at: row.get("expires_at"),
            state: row.get("state"),
            base_resource_types: serde_json::from_str(&base_resource_types_json).unwrap_or_default(),
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            platform: row.get("platform"),
            team_id: row.get("team_id"),
        }
    }

    fn container_from_row(row: &sqlx::postgres::PgRow) -> Container {
        Container {
            id: row.get("id"),
            worker_name: row.get("worker_name"),
            team_id: row.get("team_id"),
            build_id: row.get("build_id"),
            resource_cache_id: row.get("resource_cache_id"),
            image_resource_cache_id: row.get("image_resource_cache_id"),
            handle: row.get("handle"),
            state: row.get("state"),
            metadata_fingerprint: row.get("metadata_fingerprint"),
            container_type: row.get("container_type"),
            step_name: row.get("step_name"),
            pipeline_id: row.get("pipeline_id"),
            job_id: row.get("job_id"),
            best_if_used_by: row.get("best_if_used_by"),
        }
    }

    fn volume_from_row(row: &sqlx::postgres::PgRow) -> Volume {
        Volume {
            id: row.get("id"),
            worker_name: row.get("worker_name"),
            team_id: row.get("team_id"),
            handle: row.get("handle"),
            state: row.get("state"),
            container_id: row.get("container_id"),
            mount_path: row.get("mount_path"),
            resource_cache_id: row.get("resource_cache_id"),
            base_resource_type_id: row.get("base_resource_type_id"),
            worker_resource_certs: row.get("worker_resource_certs"),
            initialized: row.get("initialized"),
            expires_at: row.get("expires_at"),
        }
    }

    fn resource_cache_from_row(row: &sqlx::postgres::PgRow) -> ResourceCache {
        ResourceCache {
            id: row.get("id"),
            base_resource_type_id: row.get("base_resource_type_id"),
            source_hash: row.get("source_hash"),
            version: row.get("version"),
            dependency_chain_hash: row.get("dependency_chain_hash"),
        }
    }
}

const CONTAINER_COLUMNS: &str = "id, worker_name, team_id, build_id, resource_cache_id,
    image_resource_cache_id, handle, state, metadata_fingerprint, container_type,
    step_name, pipeline_id, job_id, best_if_used_by";

const VOLUME_COLUMNS: &str = "id, worker_name, team_id, handle, state, container_id,
    mount_path, resource_cache_id, base_resource_type_id, worker_resource_certs,
    initialized, expires_at";

#[async_trait]
impl StateBackend for PostgresBackend {
    async fn initialize(&self) -> CoreResult<()> {
        migration::check_and_migrate_postgres(&self.pool)
            .await
            .map_err(CoreError::Other)
    }

    async fn find_or_create_team(&self, name: &str) -> CoreResult<Team> {
        let row = sqlx::query(
            "INSERT INTO teams (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = excluded.name
             RETURNING id, name",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("team", name, e))?;
        Ok(Team { id: row.get("id"), name: row.get("name") })
    }

    async fn find_or_create_pipeline(&self, team_id: i64, name: &str) -> CoreResult<Pipeline> {
        let row = sqlx::query(
            "INSERT INTO pipelines (team_id, name) VALUES ($1, $2)
             ON CONFLICT (team_id, name) DO UPDATE SET name = excluded.name
             RETURNING id, team_id, name",
        )
        .bind(team_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("pipeline", name, e))?;
        Ok(Pipeline { id: row.get("id"), team_id: row.get("team_id"), name: row.get("name") })
    }

    async fn find_or_create_job(&self, pipeline_id: i64, name: &str) -> CoreResult<Job> {
        let row = sqlx::query(
            "INSERT INTO jobs (pipeline_id, name) VALUES ($1, $2)
             ON CONFLICT (pipeline_id, name) DO UPDATE SET name = excluded.name
             RETURNING id, pipeline_id, name",
        )
        .bind(pipeline_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("job", name, e))?;
        Ok(Job { id: row.get("id"), pipeline_id: row.get("pipeline_id"), name: row.get("name") })
    }

    async fn create_build(&self, team_id: i64, job_id: Option<i64>) -> CoreResult<Build> {
        let row = sqlx::query("INSERT INTO builds (team_id, job_id) VALUES ($1, $2) RETURNING id, team_id, job_id")
            .bind(team_id)
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("build", team_id.to_string(), e))?;
        Ok(Build { id: row.get("id"), team_id: row.get("team_id"), job_id: row.get("job_id") })
    }

    async fn get_build(&self, id: i64) -> CoreResult<Option<Build>> {
        let row = sqlx::query("SELECT id, team_id, job_id FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("build", id.to_string(), e))?;
        Ok(row.map(|row| Build { id: row.get("id"), team_id: row.get("team_id"), job_id: row.get("job_id") }))
    }

    async fn delete_build(&self, id: i64) -> CoreResult<()> {
        sqlx::query("DELETE FROM builds WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("build", id.to_string(), e))?;
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        name: &str,
        address: &str,
        platform: &str,
        tags: &[String],
        team_id: Option<i64>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<Worker> {
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        let row = sqlx::query(
            "INSERT INTO workers (name, address, expires_at, state, base_resource_types, tags, platform, team_id)
             VALUES ($1, $2, $3, 'running', '[]', $4, $5, $6)
             ON CONFLICT (name) DO UPDATE SET
                address = excluded.address,
                expires_at = excluded.expires_at,
                state = 'running',
                tags = excluded.tags,
                platform = excluded.platform,
                team_id = excluded.team_id
             RETURNING name, address, expires_at, state, base_resource_types, tags, platform, team_id",
        )
        .bind(name)
        .bind(address)
        .bind(expires_at)
        .bind(tags_json)
        .bind(platform)
        .bind(team_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("worker", name, e))?;
        Ok(Self::worker_from_row(&row))
    }

    async fn get_worker(&self, name: &str) -> CoreResult<Option<Worker>> {
        let row = sqlx::query(
            "SELECT name, address, expires_at, state, base_resource_types, tags, platform, team_id
             FROM workers WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("worker", name, e))?;
        Ok(row.map(|r| Self::worker_from_row(&r)))
    }

    async fn list_workers(&self) -> CoreResult<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT name, address, expires_at, state, base_resource_types, tags, platform, team_id
             FROM workers ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("worker", "*", e))?;
        Ok(rows.iter().map(Self::worker_from_row).collect())
    }

    async fn mark_worker_stalled_if_expired(&self, name: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workers SET state = 'stalled'
             WHERE name = $1 AND state = 'running' AND expires_at < $2",
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("worker", name, e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_stale_worker_names(&self, now: DateTime<Utc>) -> CoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM workers WHERE state = 'running' AND expires_at < $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("worker", "*", e))?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn find_or_create_base_resource_type(&self, name: &str) -> CoreResult<BaseResourceType> {
        let row = sqlx::query(
            "INSERT INTO base_resource_types (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = excluded.name
             RETURNING id, name",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("base_resource_type", name, e))?;
        Ok(BaseResourceType { id: row.get("id"), name: row.get("name") })
    }

    async fn bind_worker_resource_type(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
        image_path: &str,
        version: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkerBaseResourceType> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error("worker_base_resource_type", worker_name, e))?;

        sqlx::query(
            "UPDATE worker_base_resource_types SET superseded_at = $1
             WHERE worker_name = $2 AND base_resource_type_id = $3 AND version != $4 AND superseded_at IS NULL",
        )
        .bind(now)
        .bind(worker_name)
        .bind(base_resource_type_id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify_sqlx_error("worker_base_resource_type", worker_name, e))?;

        let row = sqlx::query(
            "INSERT INTO worker_base_resource_types
                (worker_name, base_resource_type_id, image_path, version, superseded_at, bound_at)
             VALUES ($1, $2, $3, $4, NULL, $5)
             RETURNING worker_name, base_resource_type_id, image_path, version, superseded_at",
        )
        .bind(worker_name)
        .bind(base_resource_type_id)
        .bind(image_path)
        .bind(version)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify_sqlx_error("worker_base_resource_type", worker_name, e))?;

        tx.commit()
            .await
            .map_err(|e| classify_sqlx_error("worker_base_resource_type", worker_name, e))?;

        Ok(WorkerBaseResourceType {
            worker_name: row.get("worker_name"),
            base_resource_type_id: row.get("base_resource_type_id"),
            image_path: row.get("image_path"),
            version: row.get("version"),
            superseded_at: row.get("superseded_at"),
        })
    }

    async fn active_worker_resource_type(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
    ) -> CoreResult<Option<WorkerBaseResourceType>> {
        let row = sqlx::query(
            "SELECT worker_name, base_resource_type_id, image_path, version, superseded_at
             FROM worker_base_resource_types
             WHERE worker_name = $1 AND base_resource_type_id = $2 AND superseded_at IS NULL",
        )
        .bind(worker_name)
        .bind(base_resource_type_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("worker_base_resource_type", worker_name, e))?;
        Ok(row.map(|row| WorkerBaseResourceType {
            worker_name: row.get("worker_name"),
            base_resource_type_id: row.get("base_resource_type_id"),
            image_path: row.get("image_path"),
            version: row.get("version"),
            superseded_at: row.get("superseded_at"),
        }))
    }

    async fn find_or_create_resource_cache(
        &self,
        base_resource_type_id: i64,
        source_hash: &str,
        version: &str,
        dependency_chain_hash: &str,
    ) -> CoreResult<ResourceCache> {
        let row = sqlx::query(
            "INSERT INTO resource_caches (base_resource_type_id, source_hash, version, dependency_chain_hash)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (base_resource_type_id, source_hash, version, dependency_chain_hash)
                DO UPDATE SET source_hash = excluded.source_hash
             RETURNING id, base_resource_type_id, source_hash, version, dependency_chain_hash",
        )
        .bind(base_resource_type_id)
        .bind(source_hash)
        .bind(version)
        .bind(dependency_chain_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("resource_cache", source_hash, e))?;
        Ok(Self::resource_cache_from_row(&row))
    }

    async fn get_resource_cache(&self, id: i64) -> CoreResult<Option<ResourceCache>> {
        let row = sqlx::query(
            "SELECT id, base_resource_type_id, source_hash, version, dependency_chain_hash
             FROM resource_caches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("resource_cache", id.to_string(), e))?;
        Ok(row.map(|r| Self::resource_cache_from_row(&r)))
    }

    async fn add_resource_cache_use_by_build(&self, cache_id: i64, build_id: i64) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO resource_cache_uses_by_build (resource_cache_id, build_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(cache_id)
        .bind(build_id)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("resource_cache_use", cache_id.to_string(), e))?;
        Ok(())
    }

    async fn add_resource_cache_use_by_container(&self, cache_id: i64, container_id: i64) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO resource_cache_uses_by_container (resource_cache_id, container_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(cache_id)
        .bind(container_id)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("resource_cache_use", cache_id.to_string(), e))?;
        Ok(())
    }

    async fn count_resource_cache_uses(&self, cache_id: i64) -> CoreResult<i64> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM resource_cache_uses_by_build WHERE resource_cache_id = $1) +
                (SELECT COUNT(*) FROM resource_cache_uses_by_container WHERE resource_cache_id = $1)
                AS total",
        )
        .bind(cache_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("resource_cache", cache_id.to_string(), e))?;
        Ok(row.get("total"))
    }

    async fn find_orphaned_resource_cache_ids(&self) -> CoreResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM resource_caches rc
             WHERE NOT EXISTS (SELECT 1 FROM resource_cache_uses_by_build b WHERE b.resource_cache_id = rc.id)
               AND NOT EXISTS (SELECT 1 FROM resource_cache_uses_by_container c WHERE c.resource_cache_id = rc.id)",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("resource_cache", "*", e))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn delete_resource_cache(&self, id: i64) -> CoreResult<()> {
        sqlx::query("DELETE FROM resource_caches WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("resource_cache", id.to_string(), e))?;
        Ok(())
    }

    async fn find_container(
        &self,
        worker_name: &str,
        team_id: i64,
        metadata: &ContainerMetadata,
    ) -> CoreResult<Option<Container>> {
        let fingerprint = metadata.fingerprint();
        let sql = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers
             WHERE worker_name = $1 AND team_id = $2 AND metadata_fingerprint = $3
               AND state IN ('creating', 'created')
             ORDER BY id ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(worker_name)
            .bind(team_id)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("container", worker_name, e))?;
        Ok(row.map(|r| Self::container_from_row(&r)))
    }

    async fn create_container(
        &self,
        worker_name: &str,
        team_id: i64,
        build_id: Option<i64>,
        resource_cache_id: Option<i64>,
        image_resource_cache_id: Option<i64>,
        metadata: &ContainerMetadata,
    ) -> CoreResult<Container> {
        let fingerprint = metadata.fingerprint();
        let sql = format!(
            "INSERT INTO containers
                (worker_name, team_id, build_id, resource_cache_id, image_resource_cache_id,
                 handle, state, metadata_fingerprint, container_type, step_name, pipeline_id, job_id)
             VALUES ($1, $2, $3, $4, $5, NULL, 'creating', $6, $7, $8, $9, $10)
             RETURNING {CONTAINER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(worker_name)
            .bind(team_id)
            .bind(build_id)
            .bind(resource_cache_id)
            .bind(image_resource_cache_id)
            .bind(fingerprint)
            .bind(&metadata.container_type)
            .bind(&metadata.step_name)
            .bind(metadata.pipeline_id)
            .bind(metadata.job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("container", worker_name, e))?;
        Ok(Self::container_from_row(&row))
    }

    async fn get_container(&self, id: i64) -> CoreResult<Option<Container>> {
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("container", id.to_string(), e))?;
        Ok(row.map(|r| Self::container_from_row(&r)))
    }

    async fn transition_container_created(&self, id: i64, handle: &str) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE containers SET state = 'created', handle = $1 WHERE id = $2 AND state = 'creating'",
        )
        .bind(handle)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("container", id.to_string(), e))?;
        if result.rows_affected() != 1 {
            return Err(CoreError::state_conflict("container", id.to_string(), "creating"));
        }
        Ok(())
    }

    async fn transition_container_destroying(&self, id: i64) -> CoreResult<()> {
        let result = sqlx::query("UPDATE containers SET state = 'destroying' WHERE id = $1 AND state = 'created'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("container", id.to_string(), e))?;
        if result.rows_affected() != 1 {
            return Err(CoreError::state_conflict("container", id.to_string(), "created"));
        }
        Ok(())
    }

    async fn delete_container_gone(&self, id: i64) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM containers WHERE id = $1 AND state = 'destroying'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("container", id.to_string(), e))?;
        if result.rows_affected() != 1 {
            return Err(CoreError::state_conflict("container", id.to_string(), "destroying"));
        }
        Ok(())
    }

    async fn set_container_best_if_used_by(
        &self,
        id: i64,
        best_if_used_by: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE containers SET best_if_used_by = $1 WHERE id = $2 AND state = 'created'")
            .bind(best_if_used_by)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("container", id.to_string(), e))?;
        Ok(())
    }

    async fn find_expired_container_ids(&self, now: DateTime<Utc>) -> CoreResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM containers
             WHERE state = 'created' AND best_if_used_by IS NOT NULL AND best_if_used_by < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("container", "*", e))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn find_volume_for_container(
        &self,
        container_id: i64,
        mount_path: &str,
    ) -> CoreResult<Option<Volume>> {
        let sql = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes
             WHERE container_id = $1 AND mount_path = $2 AND state IN ('creating', 'created')"
        );
        let row = sqlx::query(&sql)
            .bind(container_id)
            .bind(mount_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("volume", container_id.to_string(), e))?;
        Ok(row.map(|r| Self::volume_from_row(&r)))
    }

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
    ) -> CoreResult<Volume> {
        let sql = format!(
            "INSERT INTO volumes
                (worker_name, team_id, handle, state, container_id, mount_path,
                 resource_cache_id, base_resource_type_id, worker_resource_certs, initialized)
             VALUES ($1, $2, $3, 'creating', $4, $5, $6, $7, $8, false)
             RETURNING {VOLUME_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(worker_name)
            .bind(team_id)
            .bind(handle)
            .bind(container_id)
            .bind(mount_path)
            .bind(resource_cache_id)
            .bind(base_resource_type_id)
            .bind(worker_resource_certs)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("volume", handle, e))?;
        Ok(Self::volume_from_row(&row))
    }

    async fn get_volume(&self, id: i64) -> CoreResult<Option<Volume>> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("volume", id.to_string(), e))?;
        Ok(row.map(|r| Self::volume_from_row(&r)))
    }

    async fn get_volume_by_handle(&self, handle: &str) -> CoreResult<Option<Volume>> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE handle = $1");
        let row = sqlx::query(&sql)
            .bind(handle)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("volume", handle, e))?;
        Ok(row.map(|r| Self::volume_from_row(&r)))
    }

    async fn transition_volume_created(&self, id: i64, initialized: bool) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE volumes SET state = 'created', initialized = $1 WHERE id = $2 AND state = 'creating'",
        )
        .bind(initialized)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("volume", id.to_string(), e))?;
        if result.rows_affected() != 1 {
            return Err(CoreError::state_conflict("volume", id.to_string(), "creating"));
        }
        Ok(())
    }

    async fn transition_volume_destroying(&self, id: i64) -> CoreResult<()> {
        let result = sqlx::query("UPDATE volumes SET state = 'destroying' WHERE id = $1 AND state = 'created'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("volume", id.to_string(), e))?;
        if result.rows_affected() != 1 {
            return Err(CoreError::state_conflict("volume", id.to_string(), "created"));
        }
        Ok(())
    }

    async fn delete_volume_gone(&self, id: i64) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM volumes WHERE id = $1 AND state = 'destroying'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("volume", id.to_string(), e))?;
        if result.rows_affected() != 1 {
            return Err(CoreError::state_conflict("volume", id.to_string(), "destroying"));
        }
        Ok(())
    }

    async fn find_orphaned_volume_ids(&self) -> CoreResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM volumes
             WHERE state IN ('created', 'destroying')
               AND container_id IS NULL
               AND resource_cache_id IS NULL
               AND base_resource_type_id IS NULL
               AND worker_resource_certs = false",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("volume", "*", e))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn get_or_create_key(&self, name: &str, new_value_base64: &str) -> CoreResult<Key> {
        let row = sqlx::query(
            "INSERT INTO keys (name, value_base64) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET name = excluded.name
             RETURNING name, value_base64",
        )
        .bind(name)
        .bind(new_value_base64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("key", name, e))?;
        Ok(Key { name: row.get("name"), value_base64: row.get("value_base64") })
    }

    async fn notify(&self, channel: &str, payload: &str) -> CoreResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("notify", channel, e))?;
        Ok(())
    }
}
