use std::sync::Arc;

use crate::error::CoreResult;
use crate::state::models::BaseResourceType;
use crate::state::StateBackend;

/// Thin find-or-create wrapper over the base resource type table. Kept as its own
/// type (rather than calling the backend directly from callers) so the binding
/// step in [`crate::registry::worker_resource_type`] composes naturally.
pub struct BaseResourceTypeRegistry {
    backend: Arc<dyn StateBackend>,
}

impl BaseResourceTypeRegistry {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub async fn find_or_create(&self, name: &str) -> CoreResult<BaseResourceType> {
        self.backend.find_or_create_base_resource_type(name).await
    }
}
