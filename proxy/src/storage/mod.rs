use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

mod compress;
mod memory;
mod shim;
mod store;

pub use compress::{compress_body, decompress_body};
pub use memory::MemoryBackend;
pub use shim::Shim;
pub use store::CacheStore;

pub type Key = Bytes;

/// The response form persisted by a backend: status, the header map after
/// hop-by-hop/uncacheable filtering, and the (possibly compressed) body.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One record to persist, with the surrogate keys indexing it for group
/// deletion.
pub struct Item {
    pub key: Key,
    pub response: StoredResponse,
    pub surrogate_keys: Vec<Key>,
    pub ttl: Duration,
}

impl Item {
    pub fn new(key: impl Into<Key>, response: StoredResponse, ttl: Duration) -> Self {
        Item {
            key: key.into(),
            response,
            surrogate_keys: Vec::new(),
            ttl,
        }
    }

    pub fn new_with_skeys(
        key: impl Into<Key>,
        response: StoredResponse,
        surrogate_keys: Vec<impl Into<Key>>,
        ttl: Duration,
    ) -> Self {
        Item {
            key: key.into(),
            response,
            surrogate_keys: surrogate_keys.into_iter().map(|sk| sk.into()).collect(),
            ttl,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ItemKey {
    Primary(Key),
    Surrogate(Key),
}

/// A plain miss is `Ok(None)`; an `Err` is the transport sentinel telling
/// callers the read failed and a fresh write-back must be suppressed.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage operation timed out")]
    Timeout,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Contract every cache backend implements. Calls may run concurrently
/// within a worker.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> String;

    async fn connect(&self) -> Result<(), StorageError>;

    async fn get_response(&self, key: Key) -> Result<Option<StoredResponse>, StorageError>;

    async fn store_response(&self, item: Item) -> Result<(), StorageError>;

    /// Removes every record referenced by any of the given keys. Returns the
    /// number of records removed.
    async fn delete_responses(&self, keys: &[ItemKey]) -> Result<u64, StorageError>;
}
