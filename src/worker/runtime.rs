use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};

/// What a container needs from the runtime to come into existence. Intentionally
/// thin — image reference plus whatever the step handed down — since the runtime
/// owns everything below "run this image with this environment".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume_handle: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub handle: String,
    pub parent_handle: Option<String>,
}

/// The consumed interface to a worker's runtime (gardener, containerd, whatever
/// actually holds the container/volume). A single implementation talks real HTTP;
/// tests substitute an in-memory fake.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn create_container(
        &self,
        worker_address: &str,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<String>;

    async fn destroy_container(
        &self,
        worker_address: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()>;

    async fn create_volume(
        &self,
        worker_address: &str,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<()>;

    /// `None` if the runtime has no volume by that handle.
    async fn lookup_volume(
        &self,
        worker_address: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<()>>;

    async fn destroy_volume(
        &self,
        worker_address: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()>;
}

#[derive(Debug, Deserialize)]
struct CreateContainerResponse {
    handle: String,
}

/// Reference `RuntimeClient` over plain HTTP. Worker processes are expected to
/// expose `/containers` and `/volumes` endpoints; any non-2xx or connection error
/// is treated as transient so the caller's retry loop can re-resolve the worker's
/// address and try again.
pub struct HttpRuntimeClient {
    client: reqwest::Client,
}

impl Default for HttpRuntimeClient {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl HttpRuntimeClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RuntimeClient for HttpRuntimeClient {
    async fn create_container(
        &self,
        worker_address: &str,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<String> {
        let url = format!("http://{worker_address}/containers");
        tokio::select! {
            res = self.client.post(&url).json(spec).send() => {
                let resp = res.map_err(|e| CoreError::TransientRuntime(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(CoreError::TransientRuntime(format!("worker returned {}", resp.status())));
                }
                let body: CreateContainerResponse = resp
                    .json()
                    .await
                    .map_err(|e| CoreError::TransientRuntime(e.to_string()))?;
                Ok(body.handle)
            }
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
        }
    }

    async fn destroy_container(
        &self,
        worker_address: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let url = format!("http://{worker_address}/containers/{handle}");
        tokio::select! {
            res = self.client.delete(&url).send() => {
                let resp = res.map_err(|e| CoreError::TransientRuntime(e.to_string()))?;
                if !resp.status().is_success() && resp.status().as_u16() != 404 {
                    return Err(CoreError::TransientRuntime(format!("worker returned {}", resp.status())));
                }
                Ok(())
            }
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
        }
    }

    async fn create_volume(
        &self,
        worker_address: &str,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let url = format!("http://{worker_address}/volumes");
        tokio::select! {
            res = self.client.post(&url).json(spec).send() => {
                let resp = res.map_err(|e| CoreError::TransientRuntime(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(CoreError::TransientRuntime(format!("worker returned {}", resp.status())));
                }
                Ok(())
            }
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
        }
    }

    async fn lookup_volume(
        &self,
        worker_address: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<()>> {
        let url = format!("http://{worker_address}/volumes/{handle}");
        tokio::select! {
            res = self.client.get(&url).send() => {
                let resp = res.map_err(|e| CoreError::TransientRuntime(e.to_string()))?;
                if resp.status().as_u16() == 404 {
                    return Ok(None);
                }
                if !resp.status().is_success() {
                    return Err(CoreError::TransientRuntime(format!("worker returned {}", resp.status())));
                }
                Ok(Some(()))
            }
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
        }
    }

    async fn destroy_volume(
        &self,
        worker_address: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let url = format!("http://{worker_address}/volumes/{handle}");
        tokio::select! {
            res = self.client.delete(&url).send() => {
                let resp = res.map_err(|e| CoreError::TransientRuntime(e.to_string()))?;
                if !resp.status().is_success() && resp.status().as_u16() != 404 {
                    return Err(CoreError::TransientRuntime(format!("worker returned {}", resp.status())));
                }
                Ok(())
            }
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
        }
    }
}
