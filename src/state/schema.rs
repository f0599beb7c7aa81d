/// SQL DDL for the resource-lifecycle store.
///
/// Two dialects are kept because the primary backend (Postgres) needs native
/// timestamps, advisory locks and LISTEN/NOTIFY, while the reference/test backend
/// (SQLite) has none of those — everything else about the table shapes matches.

pub const SCHEMA_VERSION: i32 = 1;

pub const POSTGRES_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS teams (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS pipelines (
    id BIGSERIAL PRIMARY KEY,
    team_id BIGINT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE(team_id, name)
);

CREATE TABLE IF NOT EXISTS jobs (
    id BIGSERIAL PRIMARY KEY,
    pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE(pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS builds (
    id BIGSERIAL PRIMARY KEY,
    team_id BIGINT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    job_id BIGINT REFERENCES jobs(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS workers (
    name TEXT PRIMARY KEY,
    address TEXT,
    expires_at TIMESTAMPTZ NOT NULL,
    state TEXT NOT NULL DEFAULT 'running',
    base_resource_types TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    platform TEXT NOT NULL DEFAULT '',
    team_id BIGINT REFERENCES teams(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS base_resource_types (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS worker_base_resource_types (
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    base_resource_type_id BIGINT NOT NULL REFERENCES base_resource_types(id) ON DELETE CASCADE,
    image_path TEXT NOT NULL,
    version TEXT NOT NULL,
    superseded_at TIMESTAMPTZ,
    bound_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (worker_name, base_resource_type_id, version)
);

CREATE TABLE IF NOT EXISTS resource_caches (
    id BIGSERIAL PRIMARY KEY,
    base_resource_type_id BIGINT NOT NULL REFERENCES base_resource_types(id) ON DELETE CASCADE,
    source_hash TEXT NOT NULL,
    version TEXT NOT NULL,
    dependency_chain_hash TEXT NOT NULL,
    UNIQUE(base_resource_type_id, source_hash, version, dependency_chain_hash)
);

CREATE TABLE IF NOT EXISTS resource_cache_uses_by_build (
    resource_cache_id BIGINT NOT NULL REFERENCES resource_caches(id) ON DELETE CASCADE,
    build_id BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    PRIMARY KEY (resource_cache_id, build_id)
);

CREATE TABLE IF NOT EXISTS containers (
    id BIGSERIAL PRIMARY KEY,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    team_id BIGINT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    build_id BIGINT REFERENCES builds(id) ON DELETE SET NULL,
    resource_cache_id BIGINT REFERENCES resource_caches(id) ON DELETE SET NULL,
    image_resource_cache_id BIGINT REFERENCES resource_caches(id) ON DELETE SET NULL,
    handle TEXT,
    state TEXT NOT NULL DEFAULT 'creating',
    metadata_fingerprint TEXT NOT NULL,
    container_type TEXT NOT NULL,
    step_name TEXT NOT NULL DEFAULT '',
    pipeline_id BIGINT REFERENCES pipelines(id) ON DELETE SET NULL,
    job_id BIGINT REFERENCES jobs(id) ON DELETE SET NULL,
    best_if_used_by TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS resource_cache_uses_by_container (
    resource_cache_id BIGINT NOT NULL REFERENCES resource_caches(id) ON DELETE CASCADE,
    container_id BIGINT NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
    PRIMARY KEY (resource_cache_id, container_id)
);

CREATE INDEX IF NOT EXISTS idx_containers_find
    ON containers (worker_name, team_id, metadata_fingerprint);
CREATE INDEX IF NOT EXISTS idx_containers_best_if_used_by
    ON containers (best_if_used_by) WHERE best_if_used_by IS NOT NULL;

CREATE TABLE IF NOT EXISTS volumes (
    id BIGSERIAL PRIMARY KEY,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    team_id BIGINT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    handle TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL DEFAULT 'creating',
    container_id BIGINT REFERENCES containers(id) ON DELETE SET NULL,
    mount_path TEXT,
    resource_cache_id BIGINT REFERENCES resource_caches(id) ON DELETE SET NULL,
    base_resource_type_id BIGINT REFERENCES base_resource_types(id) ON DELETE SET NULL,
    worker_resource_certs BOOLEAN NOT NULL DEFAULT false,
    initialized BOOLEAN NOT NULL DEFAULT false,
    expires_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_volumes_parentage
    ON volumes (container_id, resource_cache_id, base_resource_type_id);

CREATE TABLE IF NOT EXISTS keys (
    name TEXT PRIMARY KEY,
    value_base64 TEXT NOT NULL
);
";

pub const SQLITE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS teams (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE(team_id, name)
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE(pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    job_id INTEGER REFERENCES jobs(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS workers (
    name TEXT PRIMARY KEY,
    address TEXT,
    expires_at TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'running',
    base_resource_types TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    platform TEXT NOT NULL DEFAULT '',
    team_id INTEGER REFERENCES teams(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS base_resource_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS worker_base_resource_types (
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    base_resource_type_id INTEGER NOT NULL REFERENCES base_resource_types(id) ON DELETE CASCADE,
    image_path TEXT NOT NULL,
    version TEXT NOT NULL,
    superseded_at TEXT,
    bound_at TEXT NOT NULL,
    PRIMARY KEY (worker_name, base_resource_type_id, version)
);

CREATE TABLE IF NOT EXISTS resource_caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_resource_type_id INTEGER NOT NULL REFERENCES base_resource_types(id) ON DELETE CASCADE,
    source_hash TEXT NOT NULL,
    version TEXT NOT NULL,
    dependency_chain_hash TEXT NOT NULL,
    UNIQUE(base_resource_type_id, source_hash, version, dependency_chain_hash)
);

CREATE TABLE IF NOT EXISTS resource_cache_uses_by_build (
    resource_cache_id INTEGER NOT NULL REFERENCES resource_caches(id) ON DELETE CASCADE,
    build_id INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    PRIMARY KEY (resource_cache_id, build_id)
);

CREATE TABLE IF NOT EXISTS resource_cache_uses_by_container (
    resource_cache_id INTEGER NOT NULL REFERENCES resource_caches(id) ON DELETE CASCADE,
    container_id INTEGER NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
    PRIMARY KEY (resource_cache_id, container_id)
);

CREATE TABLE IF NOT EXISTS containers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    build_id INTEGER REFERENCES builds(id) ON DELETE SET NULL,
    resource_cache_id INTEGER REFERENCES resource_caches(id) ON DELETE SET NULL,
    image_resource_cache_id INTEGER REFERENCES resource_caches(id) ON DELETE SET NULL,
    handle TEXT,
    state TEXT NOT NULL DEFAULT 'creating',
    metadata_fingerprint TEXT NOT NULL,
    container_type TEXT NOT NULL,
    step_name TEXT NOT NULL DEFAULT '',
    pipeline_id INTEGER REFERENCES pipelines(id) ON DELETE SET NULL,
    job_id INTEGER REFERENCES jobs(id) ON DELETE SET NULL,
    best_if_used_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_containers_find
    ON containers (worker_name, team_id, metadata_fingerprint);

CREATE TABLE IF NOT EXISTS volumes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    handle TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL DEFAULT 'creating',
    container_id INTEGER REFERENCES containers(id) ON DELETE SET NULL,
    mount_path TEXT,
    resource_cache_id INTEGER REFERENCES resource_caches(id) ON DELETE SET NULL,
    base_resource_type_id INTEGER REFERENCES base_resource_types(id) ON DELETE SET NULL,
    worker_resource_certs INTEGER NOT NULL DEFAULT 0,
    initialized INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_volumes_parentage
    ON volumes (container_id, resource_cache_id, base_resource_type_id);

CREATE TABLE IF NOT EXISTS keys (
    name TEXT PRIMARY KEY,
    value_base64 TEXT NOT NULL
);
";
