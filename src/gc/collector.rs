use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::state::lock::LockFactory;

use super::kinds::CollectorKind;

/// Runs every registered kind once per tick, in the order they were registered.
/// Ordering matters for one pair: volumes must be swept before containers,
/// because a container holds its mount volumes alive and reaping volumes first
/// means a container reaped in the same tick doesn't leave stranded rows behind.
/// Correctness never depends on this ordering, only on the state-predicated
/// transitions inside each kind — if two collector instances race, at most one
/// succeeds per row regardless of tick alignment.
pub struct Collector {
    kinds: Vec<Arc<dyn CollectorKind>>,
    lock_factory: Arc<dyn LockFactory>,
    interval: Duration,
}

impl Collector {
    pub fn new(kinds: Vec<Arc<dyn CollectorKind>>, lock_factory: Arc<dyn LockFactory>, interval: Duration) -> Self {
        Self { kinds, lock_factory, interval }
    }

    /// One pass over every kind. A kind whose advisory lock is already held
    /// elsewhere is skipped for this tick, not treated as an error — the lock is
    /// an optimization against duplicate work in a multi-replica deployment, not
    /// a correctness requirement.
    pub async fn tick(&self, cancel: &CancellationToken) {
        for kind in &self.kinds {
            if cancel.is_cancelled() {
                return;
            }
            let lock_name = format!("gc:{}", kind.name());
            let guard = match self.lock_factory.acquire(&lock_name, cancel).await {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::debug!(kind = kind.name(), error = %e, "skipping tick, lock unavailable");
                    continue;
                }
            };
            match kind.collect_once(cancel).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(kind = kind.name(), collected = n, "collector reaped rows"),
                Err(e) => tracing::warn!(kind = kind.name(), error = %e, "collector tick failed"),
            }
            drop(guard);
        }
    }

    /// Ticks on `interval` until `cancel` fires. Intended to be spawned as a
    /// background task alongside the rest of a running `Core`.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(&cancel).await,
                _ = cancel.cancelled() => {
                    tracing::info!("collector shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::kinds::OrphanedVolumes;
    use crate::state::lock::NullLockFactory;
    use crate::state::sqlite::SqliteBackend;
    use crate::state::StateBackend;
    use crate::worker::{ContainerSpec, VolumeSpec, WorkerTransport};
    use async_trait::async_trait;
    use crate::error::CoreResult;

    struct NoopTransport;

    #[async_trait]
    impl WorkerTransport for NoopTransport {
        async fn create_container(&self, _w: &str, _s: &ContainerSpec, _c: &CancellationToken) -> CoreResult<String> {
            Ok("unused".to_string())
        }
        async fn destroy_container(&self, _w: &str, _h: &str, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn create_volume(&self, _w: &str, _s: &VolumeSpec, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn lookup_volume(&self, _w: &str, _h: &str, _c: &CancellationToken) -> CoreResult<Option<()>> {
            Ok(None)
        }
        async fn destroy_volume(&self, _w: &str, _h: &str, _c: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_reaps_orphans_and_lock_skip_does_not_error() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let team = backend.find_or_create_team("main").await.unwrap();
        let volume = backend
            .create_volume_creating("handle-1", "w1", team.id, None, None, None, None, false)
            .await
            .unwrap();
        backend.transition_volume_created(volume.id, true).await.unwrap();

        let kind: Arc<dyn CollectorKind> =
            Arc::new(OrphanedVolumes { backend: backend.clone(), transport: Arc::new(NoopTransport) });
        let collector = Collector::new(vec![kind], Arc::new(NullLockFactory), Duration::from_secs(30));
        let cancel = CancellationToken::new();

        collector.tick(&cancel).await;
        assert!(backend.get_volume(volume.id).await.unwrap().is_none());
    }
}
