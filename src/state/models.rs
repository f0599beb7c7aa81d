use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// String constants for the `workers.state` column. Kept as plain strings (rather
/// than a SQL enum type) so both the Postgres and SQLite backends share one schema
/// shape for status fields.
pub mod worker_state {
    pub const RUNNING: &str = "running";
    pub const STALLED: &str = "stalled";
    pub const LANDING: &str = "landing";
    pub const LANDED: &str = "landed";
    pub const RETIRING: &str = "retiring";
}

/// String constants for `containers.state` / `volumes.state`.
pub mod resource_state {
    pub const CREATING: &str = "creating";
    pub const CREATED: &str = "created";
    pub const DESTROYING: &str = "destroying";
}

/// String constants for `containers.container_type`.
pub mod container_type {
    pub const TASK: &str = "task";
    pub const GET: &str = "get";
    pub const PUT: &str = "put";
    pub const CHECK: &str = "check";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub name: String,
    pub address: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub state: String,
    pub base_resource_types: Vec<String>,
    pub tags: Vec<String>,
    pub platform: String,
    pub team_id: Option<i64>,
}

impl Worker {
    /// A worker eligible for new placement: `running` per the state invariant, and
    /// known to carry an address (a missing address on a running worker is instead
    /// surfaced by the transport layer as `WorkerAddressMissing`).
    pub fn is_placeable(&self) -> bool {
        self.state == worker_state::RUNNING && self.address.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Team {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub id: i64,
    pub team_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub pipeline_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Build {
    pub id: i64,
    pub team_id: i64,
    pub job_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseResourceType {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerBaseResourceType {
    pub worker_name: String,
    pub base_resource_type_id: i64,
    pub image_path: String,
    pub version: String,
    /// Set once a newer version for the same (worker, base_resource_type) pair is
    /// bound. Superseded rows are kept, not deleted — resource caches may still
    /// reference the old version — but are ineligible for new placement decisions.
    pub superseded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceCache {
    pub id: i64,
    pub base_resource_type_id: i64,
    pub source_hash: String,
    pub version: String,
    pub dependency_chain_hash: String,
}

/// The typed fields a container is found-or-created by. A content hash over these
/// rather than a raw string join, so field ordering never matters and the stored
/// fingerprint is a fixed-width column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub container_type: String,
    pub step_name: String,
    pub pipeline_id: Option<i64>,
    pub job_id: Option<i64>,
    pub attempt: i32,
}

impl ContainerMetadata {
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.container_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.step_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.pipeline_id.map(|v| v.to_string()).unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.job_id.map(|v| v.to_string()).unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.attempt.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub id: i64,
    pub worker_name: String,
    pub team_id: i64,
    pub build_id: Option<i64>,
    pub resource_cache_id: Option<i64>,
    pub image_resource_cache_id: Option<i64>,
    pub handle: Option<String>,
    pub state: String,
    pub metadata_fingerprint: String,
    pub container_type: String,
    pub step_name: String,
    pub pipeline_id: Option<i64>,
    pub job_id: Option<i64>,
    pub best_if_used_by: Option<DateTime<Utc>>,
}

impl Container {
    /// `handle IS NULL` iff `state = creating`, per the data-model invariant.
    pub fn invariants_hold(&self) -> bool {
        self.handle.is_none() == (self.state == resource_state::CREATING)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub id: i64,
    pub worker_name: String,
    pub team_id: i64,
    pub handle: String,
    pub state: String,
    pub container_id: Option<i64>,
    pub mount_path: Option<String>,
    pub resource_cache_id: Option<i64>,
    pub base_resource_type_id: Option<i64>,
    pub worker_resource_certs: bool,
    pub initialized: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Volume {
    /// A volume with none of its four possible parent references set.
    pub fn has_no_parent(&self) -> bool {
        self.container_id.is_none()
            && self.resource_cache_id.is_none()
            && self.base_resource_type_id.is_none()
            && !self.worker_resource_certs
    }

    /// Per the orphaned-volume property: state in {created, destroying} and no
    /// parent. A volume still `creating` is not yet a candidate — its parent link
    /// may simply not have landed in the same transaction yet.
    pub fn is_orphan(&self) -> bool {
        self.has_no_parent()
            && (self.state == resource_state::CREATED || self.state == resource_state::DESTROYING)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Key {
    pub name: String,
    pub value_base64: String,
}
