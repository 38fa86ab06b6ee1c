use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::{
    compress_body, decompress_body, Item, ItemKey, Key, Shim, Storage, StorageError,
    StoredResponse,
};
use crate::config::StorageConfig;

/// The cache interface handlers talk to: compression, the in-process shim
/// and per-call deadlines layered over the configured backend.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn Storage>,
    shim: Option<Arc<Shim>>,
    compression_threshold: usize,
    compression_level: i32,
    op_timeout: Duration,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn Storage>, config: &StorageConfig) -> Self {
        let shim = config
            .shim
            .as_ref()
            .map(|shim| Arc::new(Shim::new(shim.max_size, shim.ttl())));
        CacheStore {
            backend,
            shim,
            compression_threshold: config.compression_threshold,
            compression_level: config.compression_level,
            op_timeout: config.timeout(),
        }
    }

    pub fn backend_name(&self) -> String {
        self.backend.name()
    }

    pub async fn connect(&self) -> Result<(), StorageError> {
        self.backend.connect().await
    }

    /// Looks up a stored response. `Ok(None)` is a plain miss; `Err` is the
    /// transport sentinel (the caller must not write back this request).
    pub async fn get(&self, key: Key) -> Result<Option<StoredResponse>, StorageError> {
        if let Some(shim) = &self.shim {
            if let Some(response) = shim.get(&key) {
                return Ok(Some(response));
            }
        }

        let stored = timeout(self.op_timeout, self.backend.get_response(key))
            .await
            .map_err(|_| StorageError::Timeout)??;

        match stored {
            None => Ok(None),
            Some(mut response) => {
                response.body = decompress_body(response.body).await?;
                Ok(Some(response))
            }
        }
    }

    /// Persists a response. Failures are logged and swallowed: a cache write
    /// must never degrade the client's request.
    pub async fn store(
        &self,
        key: Key,
        response: StoredResponse,
        surrogate_keys: Vec<Key>,
        ttl: Duration,
    ) {
        if let Some(shim) = &self.shim {
            shim.insert(key.clone(), response.clone(), surrogate_keys.clone());
        }

        let result = async {
            let mut compressed = response;
            compressed.body = compress_body(
                compressed.body,
                self.compression_threshold,
                self.compression_level,
            )
            .await?;
            let item = Item {
                key,
                response: compressed,
                surrogate_keys,
                ttl,
            };
            timeout(self.op_timeout, self.backend.store_response(item))
                .await
                .map_err(|_| StorageError::Timeout)?
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to store response in {}: {e}", self.backend.name());
        }
    }

    /// Removes every record indexed by any of the surrogate keys, in the
    /// shim and the backend. Returns the backend's removal count.
    pub async fn delete_by_surrogates(&self, surrogates: &[Key]) -> Result<u64, StorageError> {
        if let Some(shim) = &self.shim {
            shim.evict_by_surrogates(surrogates);
        }
        let keys: Vec<ItemKey> = surrogates
            .iter()
            .map(|sk| ItemKey::Surrogate(sk.clone()))
            .collect();
        timeout(self.op_timeout, self.backend.delete_responses(&keys))
            .await
            .map_err(|_| StorageError::Timeout)?
    }
}
