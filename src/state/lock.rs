use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};

/// Issues named, cross-process locks. The Postgres implementation backs them with
/// session-level advisory locks on a dedicated pooled connection; the null
/// implementation (used by the SQLite reference backend, which has no cluster to
/// coordinate with) grants every request immediately.
#[async_trait]
pub trait LockFactory: Send + Sync {
    async fn acquire(&self, name: &str, cancel: &CancellationToken) -> CoreResult<LockGuard>;
}

/// Held while a lock is live; releases it on drop. For the Postgres variant this
/// means issuing `pg_advisory_unlock` on the same connection the lock was taken on
/// before returning it to the pool — spawned as a detached task since `Drop` can't
/// be async.
pub enum LockGuard {
    Postgres {
        conn: Option<PoolConnection<Postgres>>,
        key: i64,
    },
    Null,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let LockGuard::Postgres { conn, key } = self {
            if let Some(mut conn) = conn.take() {
                let key = *key;
                tokio::spawn(async move {
                    let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
                        .bind(key)
                        .execute(&mut *conn)
                        .await;
                });
            }
        }
    }
}

/// Maps a lock name to the signed 64-bit key `pg_advisory_lock` takes, via a
/// content hash so names of arbitrary length and charset are supported.
fn advisory_key(name: &str) -> i64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(name.as_bytes());
    i64::from_le_bytes(digest[0..8].try_into().expect("sha256 digest is at least 8 bytes"))
}

pub struct PgLockFactory {
    pool: PgPool,
}

impl PgLockFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockFactory for PgLockFactory {
    async fn acquire(&self, name: &str, cancel: &CancellationToken) -> CoreResult<LockGuard> {
        let key = advisory_key(name);
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| CoreError::TransientStore(e.to_string()))?;

        tokio::select! {
            res = sqlx::query("SELECT pg_advisory_lock($1)").bind(key).execute(&mut *conn) => {
                res.map_err(|e| CoreError::TransientStore(e.to_string()))?;
            }
            _ = cancel.cancelled() => {
                return Err(CoreError::Cancelled);
            }
        }

        Ok(LockGuard::Postgres { conn: Some(conn), key })
    }
}

/// Always grants the lock immediately; used when there is no cluster to
/// coordinate with (the SQLite reference/test backend).
pub struct NullLockFactory;

#[async_trait]
impl LockFactory for NullLockFactory {
    async fn acquire(&self, _name: &str, _cancel: &CancellationToken) -> CoreResult<LockGuard> {
        Ok(LockGuard::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_factory_always_grants() {
        let factory = NullLockFactory;
        let cancel = CancellationToken::new();
        let _guard = factory.acquire("gc:volumes", &cancel).await.unwrap();
    }

    #[test]
    fn advisory_key_is_stable() {
        assert_eq!(advisory_key("gc:volumes"), advisory_key("gc:volumes"));
        assert_ne!(advisory_key("gc:volumes"), advisory_key("gc:containers"));
    }
}
