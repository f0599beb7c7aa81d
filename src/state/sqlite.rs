use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CoreResult;

use super::backend::StateBackend;
use super::migration;
use super::models::*;

/// SQLite-backed store for local development, demos, and the integration test
/// suite. Advisory locking and LISTEN/NOTIFY have no SQLite equivalent, so
/// callers pair this backend with [`super::lock::NullLockFactory`] and treat
/// `notify` as a no-op — documented, not hidden.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        if let Some(dir) = Path::new(db_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn now_str() -> String {
        Utc::now().to_rfc3339()
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Maps a failed INSERT to `AlreadyExists` when it tripped a unique/primary-key
/// constraint, so find-or-create callers can recover by re-reading; anything else
/// is an unclassified store error.
fn classify_unique_violation(entity: &'static str, id: impl Into<String>, err: rusqlite::Error) -> crate::error::CoreError {
    match &err {
        rusqlite::Error::SqliteFailure(sqlite_err, _)
            if sqlite_err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            crate::error::CoreError::already_exists(entity, id)
        }
        _ => crate::error::CoreError::Other(err.into()),
    }
}

fn worker_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Worker> {
    let base_resource_types_json: String = row.get(4)?;
    let tags_json: String = row.get(5)?;
    let expires_at: String = row.get(2)?;
    Ok(Worker {
        name: row.get(0)?,
        address: row.get(1)?,
        expires_at: parse_ts(&expires_at),
        state: row.get(3)?,
        base_resource_types: serde_json::from_str(&base_resource_types_json).unwrap_or_default(),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        platform: row.get(6)?,
        team_id: row.get(7)?,
    })
}

fn container_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Container> {
    let best_if_used_by: Option<String> = row.get(12)?;
    Ok(Container {
        id: row.get(0)?,
        worker_name: row.get(1)?,
        team_id: row.get(2)?,
        build_id: row.get(3)?,
        resource_cache_id: row.get(4)?,
        image_resource_cache_id: row.get(5)?,
        handle: row.get(6)?,
        state: row.get(7)?,
        metadata_fingerprint: row.get(8)?,
        container_type: row.get(9)?,
        step_name: row.get(10)?,
        pipeline_id: row.get(11)?,
        job_id: row.get(13)?,
        best_if_used_by: best_if_used_by.map(|s| parse_ts(&s)),
    })
}

const CONTAINER_COLUMNS: &str = "id, worker_name, team_id, build_id, resource_cache_id,
    image_resource_cache_id, handle, state, metadata_fingerprint, container_type,
    step_name, pipeline_id, best_if_used_by, job_id";

fn volume_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Volume> {
    let expires_at: Option<String> = row.get(11)?;
    let worker_resource_certs: i64 = row.get(8)?;
    let initialized: i64 = row.get(9)?;
    Ok(Volume {
        id: row.get(0)?,
        worker_name: row.get(1)?,
        team_id: row.get(2)?,
        handle: row.get(3)?,
        state: row.get(4)?,
        container_id: row.get(5)?,
        mount_path: row.get(6)?,
        resource_cache_id: row.get(7)?,
        base_resource_type_id: row.get(10)?,
        worker_resource_certs: worker_resource_certs != 0,
        initialized: initialized != 0,
        expires_at: expires_at.map(|s| parse_ts(&s)),
    })
}

const VOLUME_COLUMNS: &str = "id, worker_name, team_id, handle, state, container_id,
    mount_path, resource_cache_id, worker_resource_certs, initialized,
    base_resource_type_id, expires_at";

#[async_trait]
impl StateBackend for SqliteBackend {
    async fn initialize(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        migration::check_and_migrate_sqlite(&conn)
            .map_err(|e| crate::error::CoreError::Other(e))?;
        Ok(())
    }

    async fn find_or_create_team(&self, name: &str) -> CoreResult<Team> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO teams (name) VALUES (?1)",
            params![name],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        conn.query_row(
            "SELECT id, name FROM teams WHERE name = ?1",
            params![name],
            |row| Ok(Team { id: row.get(0)?, name: row.get(1)? }),
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn find_or_create_pipeline(&self, team_id: i64, name: &str) -> CoreResult<Pipeline> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO pipelines (team_id, name) VALUES (?1, ?2)",
            params![team_id, name],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        conn.query_row(
            "SELECT id, team_id, name FROM pipelines WHERE team_id = ?1 AND name = ?2",
            params![team_id, name],
            |row| Ok(Pipeline { id: row.get(0)?, team_id: row.get(1)?, name: row.get(2)? }),
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn find_or_create_job(&self, pipeline_id: i64, name: &str) -> CoreResult<Job> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO jobs (pipeline_id, name) VALUES (?1, ?2)",
            params![pipeline_id, name],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        conn.query_row(
            "SELECT id, pipeline_id, name FROM jobs WHERE pipeline_id = ?1 AND name = ?2",
            params![pipeline_id, name],
            |row| Ok(Job { id: row.get(0)?, pipeline_id: row.get(1)?, name: row.get(2)? }),
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn create_build(&self, team_id: i64, job_id: Option<i64>) -> CoreResult<Build> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO builds (team_id, job_id) VALUES (?1, ?2)",
            params![team_id, job_id],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let id = conn.last_insert_rowid();
        Ok(Build { id, team_id, job_id })
    }

    async fn get_build(&self, id: i64) -> CoreResult<Option<Build>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, team_id, job_id FROM builds WHERE id = ?1",
            params![id],
            |row| Ok(Build { id: row.get(0)?, team_id: row.get(1)?, job_id: row.get(2)? }),
        )
        .optional()
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn delete_build(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM builds WHERE id = ?1", params![id])
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
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
        let conn = self.conn.lock().unwrap();
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT INTO workers (name, address, expires_at, state, base_resource_types, tags, platform, team_id)
             VALUES (?1, ?2, ?3, 'running', '[]', ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                address = excluded.address,
                expires_at = excluded.expires_at,
                state = 'running',
                tags = excluded.tags,
                platform = excluded.platform,
                team_id = excluded.team_id",
            params![name, address, expires_at.to_rfc3339(), tags_json, platform, team_id],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;

        conn.query_row(
            "SELECT name, address, expires_at, state, base_resource_types, tags, platform, team_id
             FROM workers WHERE name = ?1",
            params![name],
            worker_from_row,
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn get_worker(&self, name: &str) -> CoreResult<Option<Worker>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name, address, expires_at, state, base_resource_types, tags, platform, team_id
             FROM workers WHERE name = ?1",
            params![name],
            worker_from_row,
        )
        .optional()
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn list_workers(&self) -> CoreResult<Vec<Worker>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT name, address, expires_at, state, base_resource_types, tags, platform, team_id
                 FROM workers ORDER BY name",
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let rows = stmt
            .query_map([], worker_from_row)
            .map_err(|e| crate::error::CoreError::Other(e.into()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(rows)
    }

    async fn mark_worker_stalled_if_expired(&self, name: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "UPDATE workers SET state = 'stalled'
                 WHERE name = ?1 AND state = 'running' AND expires_at < ?2",
                params![name, now.to_rfc3339()],
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(rows == 1)
    }

    async fn find_stale_worker_names(&self, now: DateTime<Utc>) -> CoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM workers WHERE state = 'running' AND expires_at < ?1")
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], |row| row.get(0))
            .map_err(|e| crate::error::CoreError::Other(e.into()))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(rows)
    }

    async fn find_or_create_base_resource_type(&self, name: &str) -> CoreResult<BaseResourceType> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO base_resource_types (name) VALUES (?1)",
            params![name],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        conn.query_row(
            "SELECT id, name FROM base_resource_types WHERE name = ?1",
            params![name],
            |row| Ok(BaseResourceType { id: row.get(0)?, name: row.get(1)? }),
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn bind_worker_resource_type(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
        image_path: &str,
        version: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkerBaseResourceType> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE worker_base_resource_types SET superseded_at = ?1
             WHERE worker_name = ?2 AND base_resource_type_id = ?3 AND version != ?4 AND superseded_at IS NULL",
            params![now.to_rfc3339(), worker_name, base_resource_type_id, version],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;

        conn.execute(
            "INSERT INTO worker_base_resource_types
                (worker_name, base_resource_type_id, image_path, version, superseded_at, bound_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![worker_name, base_resource_type_id, image_path, version, now.to_rfc3339()],
        )
        .map_err(|e| classify_unique_violation("worker_base_resource_type", worker_name, e))?;

        conn.query_row(
            "SELECT worker_name, base_resource_type_id, image_path, version, superseded_at
             FROM worker_base_resource_types
             WHERE worker_name = ?1 AND base_resource_type_id = ?2 AND version = ?3",
            params![worker_name, base_resource_type_id, version],
            |row| {
                let superseded_at: Option<String> = row.get(4)?;
                Ok(WorkerBaseResourceType {
                    worker_name: row.get(0)?,
                    base_resource_type_id: row.get(1)?,
                    image_path: row.get(2)?,
                    version: row.get(3)?,
                    superseded_at: superseded_at.map(|s| parse_ts(&s)),
                })
            },
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn active_worker_resource_type(
        &self,
        worker_name: &str,
        base_resource_type_id: i64,
    ) -> CoreResult<Option<WorkerBaseResourceType>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT worker_name, base_resource_type_id, image_path, version, superseded_at
             FROM worker_base_resource_types
             WHERE worker_name = ?1 AND base_resource_type_id = ?2 AND superseded_at IS NULL",
            params![worker_name, base_resource_type_id],
            |row| {
                let superseded_at: Option<String> = row.get(4)?;
                Ok(WorkerBaseResourceType {
                    worker_name: row.get(0)?,
                    base_resource_type_id: row.get(1)?,
                    image_path: row.get(2)?,
                    version: row.get(3)?,
                    superseded_at: superseded_at.map(|s| parse_ts(&s)),
                })
            },
        )
        .optional()
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn find_or_create_resource_cache(
        &self,
        base_resource_type_id: i64,
        source_hash: &str,
        version: &str,
        dependency_chain_hash: &str,
    ) -> CoreResult<ResourceCache> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO resource_caches
                (base_resource_type_id, source_hash, version, dependency_chain_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![base_resource_type_id, source_hash, version, dependency_chain_hash],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        conn.query_row(
            "SELECT id, base_resource_type_id, source_hash, version, dependency_chain_hash
             FROM resource_caches
             WHERE base_resource_type_id = ?1 AND source_hash = ?2 AND version = ?3 AND dependency_chain_hash = ?4",
            params![base_resource_type_id, source_hash, version, dependency_chain_hash],
            |row| Ok(ResourceCache {
                id: row.get(0)?,
                base_resource_type_id: row.get(1)?,
                source_hash: row.get(2)?,
                version: row.get(3)?,
                dependency_chain_hash: row.get(4)?,
            }),
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn get_resource_cache(&self, id: i64) -> CoreResult<Option<ResourceCache>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, base_resource_type_id, source_hash, version, dependency_chain_hash
             FROM resource_caches WHERE id = ?1",
            params![id],
            |row| Ok(ResourceCache {
                id: row.get(0)?,
                base_resource_type_id: row.get(1)?,
                source_hash: row.get(2)?,
                version: row.get(3)?,
                dependency_chain_hash: row.get(4)?,
            }),
        )
        .optional()
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn add_resource_cache_use_by_build(&self, cache_id: i64, build_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO resource_cache_uses_by_build (resource_cache_id, build_id) VALUES (?1, ?2)",
            params![cache_id, build_id],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(())
    }

    async fn add_resource_cache_use_by_container(&self, cache_id: i64, container_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO resource_cache_uses_by_container (resource_cache_id, container_id) VALUES (?1, ?2)",
            params![cache_id, container_id],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(())
    }

    async fn count_resource_cache_uses(&self, cache_id: i64) -> CoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let by_build: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM resource_cache_uses_by_build WHERE resource_cache_id = ?1",
                params![cache_id],
                |row| row.get(0),
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let by_container: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM resource_cache_uses_by_container WHERE resource_cache_id = ?1",
                params![cache_id],
                |row| row.get(0),
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(by_build + by_container)
    }

    async fn find_orphaned_resource_cache_ids(&self) -> CoreResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM resource_caches rc
                 WHERE NOT EXISTS (SELECT 1 FROM resource_cache_uses_by_build b WHERE b.resource_cache_id = rc.id)
                   AND NOT EXISTS (SELECT 1 FROM resource_cache_uses_by_container c WHERE c.resource_cache_id = rc.id)",
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| crate::error::CoreError::Other(e.into()))?
            .collect::<Result<Vec<i64>, _>>()
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(rows)
    }

    async fn delete_resource_cache(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM resource_caches WHERE id = ?1", params![id])
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(())
    }

    async fn find_container(
        &self,
        worker_name: &str,
        team_id: i64,
        metadata: &ContainerMetadata,
    ) -> CoreResult<Option<Container>> {
        let conn = self.conn.lock().unwrap();
        let fingerprint = metadata.fingerprint();
        let sql = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers
             WHERE worker_name = ?1 AND team_id = ?2 AND metadata_fingerprint = ?3
               AND state IN ('creating', 'created')
             ORDER BY id ASC LIMIT 1"
        );
        conn.query_row(&sql, params![worker_name, team_id, fingerprint], container_from_row)
            .optional()
            .map_err(|e| crate::error::CoreError::Other(e.into()))
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
        let conn = self.conn.lock().unwrap();
        let fingerprint = metadata.fingerprint();
        conn.execute(
            "INSERT INTO containers
                (worker_name, team_id, build_id, resource_cache_id, image_resource_cache_id,
                 handle, state, metadata_fingerprint, container_type, step_name, pipeline_id, job_id)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'creating', ?6, ?7, ?8, ?9, ?10)",
            params![
                worker_name,
                team_id,
                build_id,
                resource_cache_id,
                image_resource_cache_id,
                fingerprint,
                metadata.container_type,
                metadata.step_name,
                metadata.pipeline_id,
                metadata.job_id,
            ],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let id = conn.last_insert_rowid();
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = ?1");
        conn.query_row(&sql, params![id], container_from_row)
            .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn get_container(&self, id: i64) -> CoreResult<Option<Container>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = ?1");
        conn.query_row(&sql, params![id], container_from_row)
            .optional()
            .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn transition_container_created(&self, id: i64, handle: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "UPDATE containers SET state = 'created', handle = ?1 WHERE id = ?2 AND state = 'creating'",
                params![handle, id],
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        if rows != 1 {
            return Err(crate::error::CoreError::state_conflict("container", id.to_string(), "creating"));
        }
        Ok(())
    }

    async fn transition_container_destroying(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "UPDATE containers SET state = 'destroying' WHERE id = ?1 AND state = 'created'",
                params![id],
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        if rows != 1 {
            return Err(crate::error::CoreError::state_conflict("container", id.to_string(), "created"));
        }
        Ok(())
    }

    async fn delete_container_gone(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "DELETE FROM containers WHERE id = ?1 AND state = 'destroying'",
                params![id],
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        if rows != 1 {
            return Err(crate::error::CoreError::state_conflict("container", id.to_string(), "destroying"));
        }
        Ok(())
    }

    async fn set_container_best_if_used_by(
        &self,
        id: i64,
        best_if_used_by: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE containers SET best_if_used_by = ?1 WHERE id = ?2 AND state = 'created'",
            params![best_if_used_by.map(|t| t.to_rfc3339()), id],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(())
    }

    async fn find_expired_container_ids(&self, now: DateTime<Utc>) -> CoreResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM containers
                 WHERE state = 'created' AND best_if_used_by IS NOT NULL AND best_if_used_by < ?1",
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], |row| row.get(0))
            .map_err(|e| crate::error::CoreError::Other(e.into()))?
            .collect::<Result<Vec<i64>, _>>()
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(rows)
    }

    async fn find_volume_for_container(
        &self,
        container_id: i64,
        mount_path: &str,
    ) -> CoreResult<Option<Volume>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes
             WHERE container_id = ?1 AND mount_path = ?2 AND state IN ('creating', 'created')"
        );
        conn.query_row(&sql, params![container_id, mount_path], volume_from_row)
            .optional()
            .map_err(|e| crate::error::CoreError::Other(e.into()))
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
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO volumes
                (worker_name, team_id, handle, state, container_id, mount_path,
                 resource_cache_id, base_resource_type_id, worker_resource_certs, initialized)
             VALUES (?1, ?2, ?3, 'creating', ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                worker_name,
                team_id,
                handle,
                container_id,
                mount_path,
                resource_cache_id,
                base_resource_type_id,
                worker_resource_certs as i64,
            ],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE handle = ?1");
        conn.query_row(&sql, params![handle], volume_from_row)
            .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn get_volume(&self, id: i64) -> CoreResult<Option<Volume>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE id = ?1");
        conn.query_row(&sql, params![id], volume_from_row)
            .optional()
            .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn get_volume_by_handle(&self, handle: &str) -> CoreResult<Option<Volume>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE handle = ?1");
        conn.query_row(&sql, params![handle], volume_from_row)
            .optional()
            .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn transition_volume_created(&self, id: i64, initialized: bool) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "UPDATE volumes SET state = 'created', initialized = ?1 WHERE id = ?2 AND state = 'creating'",
                params![initialized as i64, id],
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        if rows != 1 {
            return Err(crate::error::CoreError::state_conflict("volume", id.to_string(), "creating"));
        }
        Ok(())
    }

    async fn transition_volume_destroying(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "UPDATE volumes SET state = 'destroying' WHERE id = ?1 AND state = 'created'",
                params![id],
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        if rows != 1 {
            return Err(crate::error::CoreError::state_conflict("volume", id.to_string(), "created"));
        }
        Ok(())
    }

    async fn delete_volume_gone(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "DELETE FROM volumes WHERE id = ?1 AND state = 'destroying'",
                params![id],
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        if rows != 1 {
            return Err(crate::error::CoreError::state_conflict("volume", id.to_string(), "destroying"));
        }
        Ok(())
    }

    async fn find_orphaned_volume_ids(&self) -> CoreResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM volumes
                 WHERE state IN ('created', 'destroying')
                   AND container_id IS NULL
                   AND resource_cache_id IS NULL
                   AND base_resource_type_id IS NULL
                   AND worker_resource_certs = 0",
            )
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| crate::error::CoreError::Other(e.into()))?
            .collect::<Result<Vec<i64>, _>>()
            .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        Ok(rows)
    }

    async fn get_or_create_key(&self, name: &str, new_value_base64: &str) -> CoreResult<Key> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO keys (name, value_base64) VALUES (?1, ?2)",
            params![name, new_value_base64],
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))?;
        conn.query_row(
            "SELECT name, value_base64 FROM keys WHERE name = ?1",
            params![name],
            |row| Ok(Key { name: row.get(0)?, value_base64: row.get(1)? }),
        )
        .map_err(|e| crate::error::CoreError::Other(e.into()))
    }

    async fn notify(&self, _channel: &str, _payload: &str) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_then_get_worker_roundtrips() {
        let backend = SqliteBackend::open_memory().unwrap();
        backend.initialize().await.unwrap();
        let expires = Utc::now() + chrono::Duration::seconds(60);
        backend
            .heartbeat_worker("worker-1", "10.0.0.1:7777", "linux", &["git".to_string()], None, expires)
            .await
            .unwrap();
        let worker = backend.get_worker("worker-1").await.unwrap().unwrap();
        assert_eq!(worker.state, worker_state::RUNNING);
        assert_eq!(worker.address.as_deref(), Some("10.0.0.1:7777"));
    }

    #[tokio::test]
    async fn container_transition_fails_on_wrong_state() {
        let backend = SqliteBackend::open_memory().unwrap();
        backend.initialize().await.unwrap();
        let team = backend.find_or_create_team("main").await.unwrap();
        backend
            .heartbeat_worker("worker-1", "10.0.0.1:7777", "linux", &[], Some(team.id), Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        let metadata = ContainerMetadata {
            container_type: container_type::TASK.to_string(),
            step_name: "build".to_string(),
            pipeline_id: None,
            job_id: None,
            attempt: 1,
        };
        let container = backend
            .create_container("worker-1", team.id, None, None, None, &metadata)
            .await
            .unwrap();

        // destroying from 'creating' should fail: the precondition is 'created'.
        let result = backend.transition_container_destroying(container.id).await;
        assert!(result.is_err());

        backend.transition_container_created(container.id, "handle-123").await.unwrap();
        backend.transition_container_destroying(container.id).await.unwrap();
        backend.delete_container_gone(container.id).await.unwrap();
        assert!(backend.get_container(container.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphaned_resource_cache_detected_after_last_use_removed() {
        let backend = SqliteBackend::open_memory().unwrap();
        backend.initialize().await.unwrap();
        let team = backend.find_or_create_team("main").await.unwrap();
        let brt = backend.find_or_create_base_resource_type("git").await.unwrap();
        let cache = backend
            .find_or_create_resource_cache(brt.id, "source-hash", "v1", "dep-hash")
            .await
            .unwrap();
        let build = backend.create_build(team.id, None).await.unwrap();
        backend.add_resource_cache_use_by_build(cache.id, build.id).await.unwrap();
        assert!(backend.find_orphaned_resource_cache_ids().await.unwrap().is_empty());

        backend.delete_build(build.id).await.unwrap();
        let orphans = backend.find_orphaned_resource_cache_ids().await.unwrap();
        assert_eq!(orphans, vec![cache.id]);
    }

    #[tokio::test]
    async fn exact_duplicate_worker_resource_type_binding_surfaces_already_exists() {
        let backend = SqliteBackend::open_memory().unwrap();
        backend.initialize().await.unwrap();
        let brt = backend.find_or_create_base_resource_type("git").await.unwrap();
        let now = Utc::now();
        backend
            .bind_worker_resource_type("worker-1", brt.id, "/images/git", "v1", now)
            .await
            .unwrap();

        let result = backend.bind_worker_resource_type("worker-1", brt.id, "/images/git", "v1", now).await;
        assert!(matches!(result, Err(crate::error::CoreError::AlreadyExists { .. })));
    }
}
