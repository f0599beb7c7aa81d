use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::CoreResult;

use super::directory::WorkerDirectory;
use super::runtime::{ContainerSpec, RuntimeClient, VolumeSpec};



/// The interface container and volume lifecycle code actually calls: by worker
/// name, never by address. Address resolution, caching, and refresh-on-failure
/// all live behind this so callers never see a stale address directly.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn create_container(
        &self,
        worker_name: &str,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<String>;

    async fn destroy_container(
        &self,
        worker_name: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()>;

    async fn create_volume(
        &self,
        worker_name: &str,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<()>;

    async fn lookup_volume(
        &self,
        worker_name: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<()>>;

    async fn destroy_volume(
        &self,
        worker_name: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()>;
}

/// Caches worker addresses in a flat concurrent map so the common case (worker
/// already known) never touches the store. An error from the runtime evicts the
/// cached address so the *next* call re-resolves it; this call still returns the
/// original error to its caller. Retrying is a decision for a layer above, not
/// something the transport does on its own.
pub struct CachingTransport {
    directory: Arc<dyn WorkerDirectory>,
    inner: Arc<dyn RuntimeClient>,
    addresses: DashMap<String, String>,
}

impl CachingTransport {
    pub fn new(directory: Arc<dyn WorkerDirectory>, inner: Arc<dyn RuntimeClient>) -> Self {
        Self { directory, inner, addresses: DashMap::new() }
    }

    async fn resolve(&self, worker_name: &str) -> CoreResult<String> {
        if let Some(addr) = self.addresses.get(worker_name) {
            return Ok(addr.clone());
        }
        let addr = self.directory.address_for(worker_name).await?;
        self.addresses.insert(worker_name.to_string(), addr.clone());
        Ok(addr)
    }

    fn evict(&self, worker_name: &str) {
        self.addresses.remove(worker_name);
    }
}

#[async_trait]
impl WorkerTransport for CachingTransport {
    async fn create_container(
        &self,
        worker_name: &str,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<String> {
        let addr = self.resolve(worker_name).await?;
        let result = self.inner.create_container(&addr, spec, cancel).await;
        if result.is_err() {
            self.evict(worker_name);
        }
        result
    }

    async fn destroy_container(
        &self,
        worker_name: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let addr = self.resolve(worker_name).await?;
        let result = self.inner.destroy_container(&addr, handle, cancel).await;
        if result.is_err() {
            self.evict(worker_name);
        }
        result
    }

    async fn create_volume(
        &self,
        worker_name: &str,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let addr = self.resolve(worker_name).await?;
        let result = self.inner.create_volume(&addr, spec, cancel).await;
        if result.is_err() {
            self.evict(worker_name);
        }
        result
    }

    async fn lookup_volume(
        &self,
        worker_name: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<()>> {
        let addr = self.resolve(worker_name).await?;
        let result = self.inner.lookup_volume(&addr, handle, cancel).await;
        if result.is_err() {
            self.evict(worker_name);
        }
        result
    }

    async fn destroy_volume(
        &self,
        worker_name: &str,
        handle: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let addr = self.resolve(worker_name).await?;
        let result = self.inner.destroy_volume(&addr, handle, cancel).await;
        if result.is_err() {
            self.evict(worker_name);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedDirectory(Mutex<Vec<String>>);

    #[async_trait]
    impl WorkerDirectory for FixedDirectory {
        async fn address_for(&self, _worker_name: &str) -> CoreResult<String> {
            let mut addrs = self.0.lock().unwrap();
            Ok(addrs.pop().unwrap_or_else(|| "stale:1".to_string()))
        }
    }

    /// Wraps a `FixedDirectory` and counts how many times `address_for` is
    /// actually called, so a test can assert exactly one resolve per cache miss.
    struct CountingDirectory {
        inner: FixedDirectory,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkerDirectory for CountingDirectory {
        async fn address_for(&self, worker_name: &str) -> CoreResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.address_for(worker_name).await
        }
    }

    struct FlakyRuntime {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RuntimeClient for FlakyRuntime {
        async fn create_container(
            &self,
            worker_address: &str,
            _spec: &ContainerSpec,
            _cancel: &CancellationToken,
        ) -> CoreResult<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(crate::error::CoreError::TransientRuntime(format!("{worker_address} unreachable")));
            }
            Ok(format!("handle-from-{worker_address}"))
        }
        async fn destroy_container(&self, _a: &str, _h: &str, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn create_volume(&self, _a: &str, _s: &VolumeSpec, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn lookup_volume(&self, _a: &str, _h: &str, _c: &CancellationToken) -> CoreResult<Option<()>> {
            Ok(Some(()))
        }
        async fn destroy_volume(&self, _a: &str, _h: &str, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_call_surfaces_original_error_without_retrying_in_call() {
        let directory = Arc::new(FixedDirectory(Mutex::new(vec!["fresh:1".to_string()])));
        let runtime = Arc::new(FlakyRuntime { calls: AtomicUsize::new(0) });
        let transport = CachingTransport::new(directory, runtime.clone());
        let cancel = CancellationToken::new();
        let spec = ContainerSpec { image: "alpine".to_string(), env: vec![], mounts: vec![] };

        let err = transport.create_container("worker-1", &spec, &cancel).await.unwrap_err();
        assert!(matches!(err, crate::error::CoreError::TransientRuntime(_)));
        // The tripper made exactly one inner attempt; it did not retry on our behalf.
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn address_refresh_is_exactly_one_get_worker_on_the_next_call_after_an_error() {
        let directory = Arc::new(CountingDirectory {
            inner: FixedDirectory(Mutex::new(vec!["fresh:2".to_string(), "fresh:1".to_string()])),
            calls: AtomicUsize::new(0),
        });
        let runtime = Arc::new(FlakyRuntime { calls: AtomicUsize::new(0) });
        let transport = CachingTransport::new(directory.clone(), runtime);
        let cancel = CancellationToken::new();
        let spec = ContainerSpec { image: "alpine".to_string(), env: vec![], mounts: vec![] };

        // First call: resolves once (cache miss), inner fails, error is surfaced as-is.
        assert!(transport.create_container("worker-1", &spec, &cancel).await.is_err());
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        // Second call: exactly one more GetWorker (the refreshed address), and it succeeds.
        let handle = transport.create_container("worker-1", &spec, &cancel).await.unwrap();
        assert_eq!(handle, "handle-from-fresh:2");
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);

        // Third call: address is cached again after the success, so zero more GetWorker.
        let handle = transport.create_container("worker-1", &spec, &cancel).await.unwrap();
        assert_eq!(handle, "handle-from-fresh:2");
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
    }
}
