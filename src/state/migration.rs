use anyhow::Result;
use rusqlite::Connection;

use super::schema;

/// Check and apply migrations for the SQLite reference backend.
pub fn check_and_migrate_sqlite(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false);

    if !table_exists {
        conn.execute_batch(schema::SQLITE_SCHEMA_SQL)?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![schema::SCHEMA_VERSION, now, "Initial schema"],
        )?;
        return Ok(());
    }

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < schema::SCHEMA_VERSION {
        apply_sqlite_migrations(conn, current_version)?;
    }

    Ok(())
}

fn apply_sqlite_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();

    if from_version < 1 {
        conn.execute_batch(schema::SQLITE_SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![1, now, "Initial resource-lifecycle schema"],
        )?;
    }

    // Migration 1 -> 2 would go here when the schema next changes.

    Ok(())
}

/// Check and apply migrations for the Postgres backend. `schema_version` is
/// bumped the same way; DDL runs through `IF NOT EXISTS` so re-running it on an
/// already-migrated database is a no-op.
pub async fn check_and_migrate_postgres(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::raw_sql(schema::POSTGRES_SCHEMA_SQL).execute(pool).await?;
    sqlx::query(
        "INSERT INTO schema_version (version, applied_at, description)
         VALUES ($1, now(), 'Initial resource-lifecycle schema')
         ON CONFLICT (version) DO NOTHING",
    )
    .bind(schema::SCHEMA_VERSION)
    .execute(pool)
    .await?;
    Ok(())
}
