use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};
use crate::state::models::worker_state;
use crate::state::StateBackend;

/// Resolves a worker name to the address the transport should dial. Backed by
/// the relational store rather than an in-memory registry, so every process
/// sharing the store sees the same worker fleet.
#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    async fn address_for(&self, worker_name: &str) -> CoreResult<String>;
}

pub struct BackendWorkerDirectory {
    backend: Arc<dyn StateBackend>,
}

impl BackendWorkerDirectory {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl WorkerDirectory for BackendWorkerDirectory {
    async fn address_for(&self, worker_name: &str) -> CoreResult<String> {
        let worker = self
            .backend
            .get_worker(worker_name)
            .await?
            .ok_or_else(|| CoreError::WorkerUnknown { name: worker_name.to_string() })?;

        if worker.state == worker_state::STALLED {
            return Err(CoreError::WorkerStalled { name: worker_name.to_string() });
        }

        worker
            .address
            .ok_or_else(|| CoreError::WorkerAddressMissing { name: worker_name.to_string() })
    }
}
