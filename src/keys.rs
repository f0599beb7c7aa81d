use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;

use crate::error::CoreResult;
use crate::state::models::Key;
use crate::state::StateBackend;

const KEY_LENGTH_BYTES: usize = 32;

/// Named symmetric secrets (CSRF signing, etc.), generated on first use and
/// shared by every subsequent caller under the same name.
pub struct KeyStore {
    backend: Arc<dyn StateBackend>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Returns the existing key for `name`, or generates a fresh 32-byte random
    /// key before ever touching the store and races the insert — whichever
    /// concurrent caller's insert lands first wins, and every caller (including
    /// the ones whose own generated value lost the race) reads back that value.
    pub async fn get_or_create(&self, name: &str) -> CoreResult<Key> {
        let mut bytes = [0u8; KEY_LENGTH_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let candidate = STANDARD.encode(bytes);
        self.backend.get_or_create_key(name, &candidate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sqlite::SqliteBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn get_or_create_generates_a_32_byte_key_on_first_call() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let store = KeyStore::new(backend);

        let key = store.get_or_create("csrf").await.unwrap();
        let decoded = STANDARD.decode(&key.value_base64).unwrap();
        assert_eq!(decoded.len(), KEY_LENGTH_BYTES);
    }

    #[tokio::test]
    async fn concurrent_calls_converge_on_one_generated_key() {
        let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        backend.initialize().await.unwrap();
        let store = Arc::new(KeyStore::new(backend));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.get_or_create("csrf").await.unwrap() }));
        }
        let mut values = Vec::new();
        for h in handles {
            values.push(h.await.unwrap().value_base64);
        }
        assert!(values.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(STANDARD.decode(&values[0]).unwrap().len(), KEY_LENGTH_BYTES);
    }
}
