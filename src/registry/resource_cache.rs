use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CoreResult;
use crate::state::models::ResourceCache;
use crate::state::StateBackend;

/// Resource caches are deduplicated by a content hash over their source config,
/// not by object identity, so two builds that ask for the same resource version
/// share one cache row and one set of backing volumes.
pub struct ResourceCacheRegistry {
    backend: Arc<dyn StateBackend>,
}

impl ResourceCacheRegistry {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub async fn find_or_create_for_build(
        &self,
        base_resource_type_id: i64,
        source: &Value,
        version: &str,
        dependency_chain_hash: &str,
        build_id: i64,
    ) -> CoreResult<ResourceCache> {
        let source_hash = hash_source(source);
        let cache = self
            .backend
            .find_or_create_resource_cache(base_resource_type_id, &source_hash, version, dependency_chain_hash)
            .await?;
        self.backend.add_resource_cache_use_by_build(cache.id, build_id).await?;
        Ok(cache)
    }

    pub async fn find_or_create_for_container(
        &self,
        base_resource_type_id: i64,
        source: &Value,
        version: &str,
        dependency_chain_hash: &str,
        container_id: i64,
    ) -> CoreResult<ResourceCache> {
        let source_hash = hash_source(source);
        let cache = self
            .backend
            .find_or_create_resource_cache(base_resource_type_id, &source_hash, version, dependency_chain_hash)
            .await?;
        self.backend.add_resource_cache_use_by_container(cache.id, container_id).await?;
        Ok(cache)
    }
}

/// Canonicalizes `source` (sorted object keys, recursively) before hashing, so
/// two JSON documents that differ only in field order produce the same hash.
pub fn hash_source(source: &Value) -> String {
    let canonical = canonicalize(source);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// A dependency chain hash is the hash of the ordered list of upstream resource
/// cache ids a resource's config transitively depends on. Order matters: two
/// different dependency orderings are two different closures.
pub fn hash_dependency_chain(resource_cache_ids: &[i64]) -> String {
    let mut hasher = Sha256::new();
    for id in resource_cache_ids {
        hasher.update(id.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_under_key_reordering() {
        let a = serde_json::json!({"repo": "git://x", "branch": "main"});
        let b = serde_json::json!({"branch": "main", "repo": "git://x"});
        assert_eq!(hash_source(&a), hash_source(&b));
    }

    #[test]
    fn hash_differs_on_value_change() {
        let a = serde_json::json!({"repo": "git://x", "branch": "main"});
        let b = serde_json::json!({"repo": "git://x", "branch": "develop"});
        assert_ne!(hash_source(&a), hash_source(&b));
    }

    #[test]
    fn dependency_chain_hash_is_order_sensitive() {
        assert_ne!(hash_dependency_chain(&[1, 2]), hash_dependency_chain(&[2, 1]));
    }
}
